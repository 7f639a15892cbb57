//! Ping a host and print per-probe results
//!
//! Usage: cargo run --example watch -- 1.1.1.1
//!
//! Note: This uses DGRAM ICMP sockets when available (Linux with
//! ping_group_range), which don't require CAP_NET_RAW. Falls back to RAW
//! sockets if needed.

use sonda_common::logging::{init_logging, LogConfig};
use sonda_common::PingConfiguration;
use sonda_engine::{PingSession, SessionEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guard = init_logging(LogConfig::default())?;

    let host = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "1.1.1.1".to_string());

    let config = PingConfiguration {
        target_count: Some(4),
        halt_after_target: true,
        ..Default::default()
    };

    let session = PingSession::connect(&host, config).await?;
    let mut events = session.subscribe();

    println!(
        "PING {} with {} byte payloads",
        session.destination(),
        session.config().payload_size
    );

    session.start().await?;

    while let Ok(event) = events.recv().await {
        match event {
            SessionEvent::RequestSent { .. } => {}
            SessionEvent::Response(response) => match &response.error {
                None => println!(
                    "reply from {}: icmp_seq={} time={:.3} ms",
                    response.address,
                    response.sequence,
                    response.rtt_seconds() * 1000.0
                ),
                Some(error) => println!("icmp_seq={}: {}", response.sequence, error),
            },
            SessionEvent::Finished(result) => {
                println!("--- {} ping statistics ---", result.destination);
                println!(
                    "{} packets transmitted, {} packets received, {:.1}% packet loss",
                    result.transmitted,
                    result.received,
                    result.packet_loss.unwrap_or(0.0) * 100.0
                );
                if let Some(rtt) = result.rtt {
                    println!(
                        "rtt min/avg/max/stddev = {:.3}/{:.3}/{:.3}/{:.3} ms",
                        rtt.min.as_secs_f64() * 1000.0,
                        rtt.avg.as_secs_f64() * 1000.0,
                        rtt.max.as_secs_f64() * 1000.0,
                        rtt.stddev.as_secs_f64() * 1000.0
                    );
                }
                break;
            }
        }
    }

    Ok(())
}

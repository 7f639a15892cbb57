//! The sonda ping engine
//!
//! An embeddable ICMP echo session: continuous probe scheduling over one
//! raw socket, reply/timeout correlation, per-probe responses and
//! end-of-run statistics, observable through callbacks, a delegate trait,
//! or an event stream.
//!
//! ```no_run
//! use sonda_common::PingConfiguration;
//! use sonda_engine::{PingSession, SessionEvent};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PingConfiguration {
//!         target_count: Some(4),
//!         halt_after_target: true,
//!         ..Default::default()
//!     };
//!     let session = PingSession::connect("192.0.2.1", config).await?;
//!     let mut events = session.subscribe();
//!
//!     session.start().await?;
//!     while let Ok(event) = events.recv().await {
//!         match event {
//!             SessionEvent::Response(response) => println!("{:?}", response),
//!             SessionEvent::Finished(result) => {
//!                 println!("loss: {:?}", result.packet_loss);
//!                 break;
//!             }
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod events;
mod pending;
pub mod session;
pub mod stats;

pub use events::{ProbeError, Response, SessionDelegate, SessionEvent};
pub use session::PingSession;
pub use stats::{packet_loss, rtt_stats, PingResult, RttStats};

//! Round-trip statistics and the end-of-run result envelope

use crate::events::Response;
use serde::{Deserialize, Serialize};
use sonda_common::{Destination, Timestamp};
use std::time::Duration;

/// Round-trip time statistics over the error-free responses of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RttStats {
    pub min: Duration,
    pub max: Duration,
    pub avg: Duration,
    pub stddev: Duration,
}

/// Aggregate outcome of one run, delivered once per stop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResult {
    pub timestamp: Timestamp,
    pub destination: Destination,
    /// Every response of the run, in publication order
    pub responses: Vec<Response>,
    pub transmitted: u64,
    pub received: u64,
    /// `None` when nothing was transmitted
    pub packet_loss: Option<f64>,
    /// `None` when no probe completed without error
    pub rtt: Option<RttStats>,
}

/// Fraction of probes that never produced an error-free reply.
///
/// Undefined (and absent) before anything was transmitted.
pub fn packet_loss(transmitted: u64, received: u64) -> Option<f64> {
    if transmitted == 0 {
        None
    } else {
        Some(1.0 - received as f64 / transmitted as f64)
    }
}

/// Compute RTT statistics over the error-free responses.
///
/// The standard deviation is the population form, without Bessel's
/// correction: a biased estimator, but defined for a single sample (where
/// it is exactly zero).
pub fn rtt_stats(responses: &[Response]) -> Option<RttStats> {
    let samples: Vec<f64> = responses
        .iter()
        .filter(|response| response.is_success())
        .filter_map(|response| response.rtt)
        .map(|rtt| rtt.as_secs_f64())
        .collect();

    if samples.is_empty() {
        return None;
    }

    let min = samples.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let avg = samples.iter().sum::<f64>() / samples.len() as f64;

    let variance = samples.iter().map(|x| (x - avg).powi(2)).sum::<f64>() / samples.len() as f64;

    Some(RttStats {
        min: Duration::from_secs_f64(min),
        max: Duration::from_secs_f64(max),
        avg: Duration::from_secs_f64(avg),
        stddev: Duration::from_secs_f64(variance.sqrt()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ProbeError;
    use std::net::Ipv4Addr;

    fn success(sequence: u16, rtt_ms: u64) -> Response {
        Response {
            identifier: 1,
            address: Ipv4Addr::new(192, 0, 2, 1),
            sequence,
            true_sequence: sequence as u64,
            rtt: Some(Duration::from_millis(rtt_ms)),
            error: None,
            bytes: Some(64),
            ip_header: None,
        }
    }

    fn timed_out(sequence: u16) -> Response {
        Response {
            identifier: 1,
            address: Ipv4Addr::new(192, 0, 2, 1),
            sequence,
            true_sequence: sequence as u64,
            rtt: None,
            error: Some(ProbeError::ResponseTimeout),
            bytes: None,
            ip_header: None,
        }
    }

    #[test]
    fn test_packet_loss_cases() {
        assert_eq!(packet_loss(0, 0), None);
        assert_eq!(packet_loss(4, 4), Some(0.0));
        assert_eq!(packet_loss(4, 0), Some(1.0));
        assert!((packet_loss(4, 3).unwrap() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_single_sample_has_zero_deviation() {
        let stats = rtt_stats(&[success(0, 10)]).unwrap();
        assert_eq!(stats.min, Duration::from_millis(10));
        assert_eq!(stats.max, Duration::from_millis(10));
        assert_eq!(stats.avg, Duration::from_millis(10));
        assert_eq!(stats.stddev, Duration::ZERO);
    }

    #[test]
    fn test_known_distribution() {
        let responses = [success(0, 10), success(1, 20), success(2, 30)];
        let stats = rtt_stats(&responses).unwrap();

        assert_eq!(stats.min, Duration::from_millis(10));
        assert_eq!(stats.max, Duration::from_millis(30));
        assert_eq!(stats.avg, Duration::from_millis(20));

        // Population deviation of {10, 20, 30} ms
        let expected = (200.0f64 / 3.0).sqrt() / 1000.0;
        assert!((stats.stddev.as_secs_f64() - expected).abs() < 1e-8);
    }

    #[test]
    fn test_errors_are_excluded() {
        let responses = [success(0, 10), timed_out(1), success(2, 30)];
        let stats = rtt_stats(&responses).unwrap();
        assert_eq!(stats.avg, Duration::from_millis(20));

        assert!(rtt_stats(&[timed_out(0), timed_out(1)]).is_none());
        assert!(rtt_stats(&[]).is_none());
    }
}

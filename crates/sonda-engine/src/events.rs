//! Per-probe responses and the observation surface
//!
//! Everything a caller can see goes through one internal emission point,
//! [`Observers::emit`]. Assigned callbacks, an optional delegate, and the
//! broadcast event stream are all thin fan-outs of that single call — they
//! never observe different orders or partial states.

use crate::stats::PingResult;
use serde::{Deserialize, Serialize};
use sonda_network::icmp::{IcmpError, Ipv4Header};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

/// Why a probe failed.
///
/// Carried inside [`Response`] rather than returned: a failed probe is a
/// data point of the run, not a reason to end it.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeError {
    #[error("echo request send failed: {message}")]
    SendFailed {
        code: Option<i32>,
        message: String,
    },

    #[error("echo request send timed out")]
    SendTimeout,

    #[error("no echo reply arrived before the timeout")]
    ResponseTimeout,

    #[error("echo reply failed validation: {0}")]
    Validation(#[from] IcmpError),
}

/// Terminal outcome of one probe. Exactly one is published per probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// The session identifier the probe carried
    pub identifier: u16,

    /// Destination the probe was sent to
    pub address: Ipv4Addr,

    /// Wire-level sequence number
    pub sequence: u16,

    /// Logical probe index
    pub true_sequence: u64,

    /// Round-trip time; `None` for timeouts and errors
    pub rtt: Option<Duration>,

    pub error: Option<ProbeError>,

    /// Size of the reply datagram, when one arrived
    pub bytes: Option<usize>,

    /// Decoded IPv4 header, when the platform delivered one
    pub ip_header: Option<Ipv4Header>,
}

impl Response {
    /// Round-trip time in seconds, with the classical `-1.0` sentinel for
    /// probes that produced no measurable round trip.
    pub fn rtt_seconds(&self) -> f64 {
        self.rtt.map(|rtt| rtt.as_secs_f64()).unwrap_or(-1.0)
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Everything a session emits, in emission order
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// An echo request was handed to the transport
    RequestSent { identifier: u16, sequence: u16 },

    /// A probe reached its terminal outcome
    Response(Response),

    /// The run ended; statistics are final
    Finished(PingResult),
}

/// Subscription-style observer for callers that prefer implementing a
/// trait over assigning closures. Both methods default to doing nothing.
pub trait SessionDelegate: Send + Sync {
    fn on_response(&self, _response: &Response) {}
    fn on_finished(&self, _result: &PingResult) {}
}

pub(crate) type RequestSentFn = Box<dyn Fn(u16, u16) + Send + Sync>;
pub(crate) type ResponseFn = Box<dyn Fn(&Response) + Send + Sync>;
pub(crate) type FinishedFn = Box<dyn Fn(&PingResult) + Send + Sync>;

/// The fan-out target set of a session
pub(crate) struct Observers {
    pub request_sent: Option<RequestSentFn>,
    pub response: Option<ResponseFn>,
    pub finished: Option<FinishedFn>,
    pub delegate: Option<Arc<dyn SessionDelegate>>,
    pub stream: broadcast::Sender<SessionEvent>,
}

impl Observers {
    pub fn new(stream_capacity: usize) -> Self {
        let (stream, _) = broadcast::channel(stream_capacity);
        Self {
            request_sent: None,
            response: None,
            finished: None,
            delegate: None,
            stream,
        }
    }

    /// The single emission point: callbacks, then delegate, then stream.
    pub fn emit(&self, event: &SessionEvent) {
        match event {
            SessionEvent::RequestSent {
                identifier,
                sequence,
            } => {
                if let Some(callback) = &self.request_sent {
                    callback(*identifier, *sequence);
                }
            }
            SessionEvent::Response(response) => {
                if let Some(callback) = &self.response {
                    callback(response);
                }
                if let Some(delegate) = &self.delegate {
                    delegate.on_response(response);
                }
            }
            SessionEvent::Finished(result) => {
                if let Some(callback) = &self.finished {
                    callback(result);
                }
                if let Some(delegate) = &self.delegate {
                    delegate.on_finished(result);
                }
            }
        }

        // A stream with no live subscribers is not an error
        let _ = self.stream.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtt_sentinel() {
        let mut response = Response {
            identifier: 1,
            address: Ipv4Addr::new(192, 0, 2, 1),
            sequence: 0,
            true_sequence: 0,
            rtt: Some(Duration::from_millis(12)),
            error: None,
            bytes: Some(64),
            ip_header: None,
        };
        assert!((response.rtt_seconds() - 0.012).abs() < 1e-9);
        assert!(response.is_success());

        response.rtt = None;
        response.error = Some(ProbeError::ResponseTimeout);
        assert_eq!(response.rtt_seconds(), -1.0);
        assert!(!response.is_success());
    }

    #[test]
    fn test_emit_fans_out_to_all_adapters() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingDelegate(AtomicUsize);
        impl SessionDelegate for CountingDelegate {
            fn on_response(&self, _response: &Response) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let mut observers = Observers::new(8);
        let callback_hits = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&callback_hits);
        observers.response = Some(Box::new(move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        }));

        let delegate = Arc::new(CountingDelegate(AtomicUsize::new(0)));
        observers.delegate = Some(delegate.clone());

        let mut stream = observers.stream.subscribe();
        let response = Response {
            identifier: 1,
            address: Ipv4Addr::new(192, 0, 2, 1),
            sequence: 0,
            true_sequence: 0,
            rtt: None,
            error: Some(ProbeError::ResponseTimeout),
            bytes: None,
            ip_header: None,
        };
        observers.emit(&SessionEvent::Response(response));

        assert_eq!(callback_hits.load(Ordering::SeqCst), 1);
        assert_eq!(delegate.0.load(Ordering::SeqCst), 1);
        assert!(matches!(
            stream.try_recv(),
            Ok(SessionEvent::Response(_))
        ));
    }
}

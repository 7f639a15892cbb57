//! The ping session state machine
//!
//! A [`PingSession`] is a handle; the state lives in a worker task that
//! owns the counters, flags, response log, pending registry and transport,
//! and processes commands and events one at a time. The probe interval
//! timer, the per-probe timeout timers and the transport's receive path
//! never touch state directly — each posts an event into the worker's
//! channel, so every mutation runs inside the same serial section no
//! matter which trigger raced in first.
//!
//! States are `Idle -> Running -> Idle`, with a draining phase between
//! running and idle when a target probe count is reached and outstanding
//! probes are still waiting on their replies or timeouts.

use crate::events::{Observers, ProbeError, Response, SessionDelegate, SessionEvent};
use crate::pending::{PendingRegistry, PendingRequest};
use crate::stats::{packet_loss, rtt_stats, PingResult};
use sonda_common::{
    Destination, Error, Fingerprint, PingConfiguration, SequenceCounters, SessionId, Timestamp,
};
use sonda_network::icmp::{self, Verdict};
use sonda_network::resolve::resolve_ipv4;
use sonda_network::transport::{
    Datagram, RawTransportFactory, Transport, TransportConfig, TransportError, TransportFactory,
    WorkerMode,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const COMMAND_QUEUE: usize = 8;
const EVENT_QUEUE: usize = 128;
const STREAM_CAPACITY: usize = 256;

/// Commands the handle sends to the worker
enum Command {
    Start(oneshot::Sender<Result<(), TransportError>>),
    Stop {
        reset_sequence: bool,
        done: oneshot::Sender<()>,
    },
}

/// Timer firings routed through the worker's serial section
enum TimerEvent {
    IntervalElapsed,
    TimedOut(u16),
}

/// An embeddable ICMP ping session.
///
/// Construction resolves the destination and spawns the worker; nothing
/// touches the network until [`start`](Self::start). Dropping the handle
/// tears the worker, its timers and the socket down.
pub struct PingSession {
    destination: Destination,
    config: PingConfiguration,
    identifier: SessionId,
    commands: mpsc::Sender<Command>,
    observers: Arc<RwLock<Observers>>,
    log: Arc<Mutex<Vec<Response>>>,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl PingSession {
    /// Resolve `host` and create a session over the real ICMP transport.
    ///
    /// Resolution failures and invalid configurations surface here, at
    /// construction time; they are never retried internally.
    pub async fn connect(host: &str, config: PingConfiguration) -> Result<Self, Error> {
        let destination = resolve_ipv4(host).await?;
        Self::for_destination(destination, config)
    }

    /// Create a session for an already-resolved destination over the real
    /// ICMP transport.
    pub fn for_destination(
        destination: Destination,
        config: PingConfiguration,
    ) -> Result<Self, Error> {
        let transport_config = TransportConfig {
            ttl: config.ttl,
            send_timeout: config.send_timeout(),
            worker: if config.dedicated_worker {
                WorkerMode::Dedicated
            } else {
                WorkerMode::Shared
            },
        };
        let factory = Arc::new(RawTransportFactory::new(
            destination.address,
            transport_config,
        ));
        Self::with_transport(destination, config, factory)
    }

    /// Create a session over a caller-supplied transport factory.
    ///
    /// This is the seam the integration tests use to substitute an
    /// in-memory transport. Must be called from within a tokio runtime.
    pub fn with_transport(
        destination: Destination,
        config: PingConfiguration,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self, Error> {
        config.validate()?;

        let identifier = SessionId::generate();
        let fingerprint = Fingerprint::generate();
        let observers = Arc::new(RwLock::new(Observers::new(STREAM_CAPACITY)));
        let log = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let (timer_tx, timer_rx) = mpsc::channel(EVENT_QUEUE);
        let (inbound_tx, inbound_rx) = mpsc::channel(EVENT_QUEUE);

        let worker = Worker {
            destination: destination.clone(),
            config: config.clone(),
            fingerprint,
            identifier,
            factory,
            transport: None,
            registry: PendingRegistry::new(),
            counters: SequenceCounters::new(),
            running: false,
            killed: false,
            draining: false,
            transmitted: 0,
            received: 0,
            interval_timer: None,
            timer_tx,
            inbound_tx,
            observers: Arc::clone(&observers),
            log: Arc::clone(&log),
            running_flag: Arc::clone(&running),
        };
        tokio::spawn(worker.run(commands_rx, timer_rx, inbound_rx, cancel.clone()));

        Ok(Self {
            destination,
            config,
            identifier,
            commands: commands_tx,
            observers,
            log,
            running,
            cancel,
        })
    }

    /// Start probing.
    ///
    /// Opens the transport when it is not already open and sends the first
    /// probe immediately. A no-op while already running. An open failure
    /// leaves the session idle and is returned to the caller.
    pub async fn start(&self) -> Result<(), TransportError> {
        let (ack, result) = oneshot::channel();
        self.commands
            .send(Command::Start(ack))
            .await
            .map_err(|_| TransportError::Closed)?;
        result.await.map_err(|_| TransportError::Closed)?
    }

    /// Stop probing and reset the sequence counters.
    pub async fn stop(&self) {
        self.stop_with(true).await;
    }

    /// Stop probing; with `reset_sequence = false` a later
    /// [`start`](Self::start) continues numbering where this run left off.
    ///
    /// Once this returns, no further response will be published — the
    /// final [`SessionEvent::Finished`] this call synthesizes is the last
    /// emission of the run. A no-op while already idle.
    ///
    /// Applications that must pause while backgrounded call
    /// `stop_with(false)` on the way out and [`start`](Self::start) on the
    /// way back in; the engine needs no other lifecycle integration.
    pub async fn stop_with(&self, reset_sequence: bool) {
        let (done, finished) = oneshot::channel();
        if self
            .commands
            .send(Command::Stop {
                reset_sequence,
                done,
            })
            .await
            .is_ok()
        {
            let _ = finished.await;
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn config(&self) -> &PingConfiguration {
        &self.config
    }

    /// The identifier carried in this session's ICMP headers
    pub fn identifier(&self) -> SessionId {
        self.identifier
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Snapshot of the current run's ordered response log.
    ///
    /// Consistent with the observation surface: a response is always in
    /// the log before any callback or stream event reports it.
    pub fn responses(&self) -> Vec<Response> {
        self.log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Subscribe to the push-style event stream
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .stream
            .subscribe()
    }

    /// Assign the request-sent callback
    pub fn on_request_sent<F>(&self, callback: F)
    where
        F: Fn(u16, u16) + Send + Sync + 'static,
    {
        self.observers_mut().request_sent = Some(Box::new(callback));
    }

    /// Assign the per-response callback
    pub fn on_response<F>(&self, callback: F)
    where
        F: Fn(&Response) + Send + Sync + 'static,
    {
        self.observers_mut().response = Some(Box::new(callback));
    }

    /// Assign the finished callback
    pub fn on_finished<F>(&self, callback: F)
    where
        F: Fn(&PingResult) + Send + Sync + 'static,
    {
        self.observers_mut().finished = Some(Box::new(callback));
    }

    /// Assign a delegate mirroring the response and finished callbacks
    pub fn set_delegate(&self, delegate: Arc<dyn SessionDelegate>) {
        self.observers_mut().delegate = Some(delegate);
    }

    fn observers_mut(&self) -> std::sync::RwLockWriteGuard<'_, Observers> {
        self.observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for PingSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Owner of all mutable session state; everything it touches is touched
/// only from [`Worker::run`].
struct Worker {
    destination: Destination,
    config: PingConfiguration,
    fingerprint: Fingerprint,
    identifier: SessionId,
    factory: Arc<dyn TransportFactory>,
    transport: Option<Box<dyn Transport>>,
    registry: PendingRegistry,
    counters: SequenceCounters,
    running: bool,
    killed: bool,
    draining: bool,
    transmitted: u64,
    received: u64,
    interval_timer: Option<AbortHandle>,
    timer_tx: mpsc::Sender<TimerEvent>,
    inbound_tx: mpsc::Sender<Datagram>,
    observers: Arc<RwLock<Observers>>,
    log: Arc<Mutex<Vec<Response>>>,
    running_flag: Arc<AtomicBool>,
}

impl Worker {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut timers: mpsc::Receiver<TimerEvent>,
        mut inbound: mpsc::Receiver<Datagram>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.teardown_silent();
                    break;
                }
                Some(command) = commands.recv() => match command {
                    Command::Start(ack) => {
                        let result = self.handle_start().await;
                        let _ = ack.send(result);
                    }
                    Command::Stop { reset_sequence, done } => {
                        self.handle_stop(reset_sequence);
                        let _ = done.send(());
                    }
                },
                Some(event) = timers.recv() => match event {
                    TimerEvent::IntervalElapsed => self.handle_interval().await,
                    TimerEvent::TimedOut(sequence) => self.handle_timeout(sequence),
                },
                Some(datagram) = inbound.recv() => self.handle_datagram(datagram),
            }
        }
    }

    async fn handle_start(&mut self) -> Result<(), TransportError> {
        if self.running {
            debug!("start ignored: session already running");
            return Ok(());
        }

        // A previous non-halting run may have left the socket open
        if self.transport.is_none() {
            let transport = self.factory.open(self.inbound_tx.clone()).await?;
            self.transport = Some(transport);
        }

        self.killed = false;
        self.running = true;
        self.draining = false;
        self.transmitted = 0;
        self.received = 0;
        self.log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        self.running_flag.store(true, Ordering::SeqCst);

        info!(
            destination = %self.destination,
            identifier = %self.identifier,
            "ping session started"
        );

        self.send_probe().await;
        Ok(())
    }

    fn handle_stop(&mut self, reset_sequence: bool) {
        if !self.running && !self.draining {
            debug!("stop ignored: session already idle");
            return;
        }

        self.killed = true;
        self.running = false;
        self.draining = false;
        self.running_flag.store(false, Ordering::SeqCst);
        self.cancel_interval_timer();

        if reset_sequence {
            self.counters.reset();
            self.registry.reset();
        } else {
            // Step past the last used sequence so a resumed run cannot
            // collide with a straggler reply from this one
            self.counters.advance();
            self.registry.clear();
        }

        let result = self.collect_result();
        info!(
            transmitted = result.transmitted,
            received = result.received,
            "ping session stopped"
        );

        if let Some(transport) = self.transport.take() {
            transport.close();
        }

        self.emit(SessionEvent::Finished(result));
    }

    /// Target count reached and every probe accounted for: emit the final
    /// statistics, and with `halt` also release the socket.
    fn finish(&mut self, halt: bool) {
        self.draining = false;
        self.running = false;
        self.killed = true;
        self.running_flag.store(false, Ordering::SeqCst);
        self.cancel_interval_timer();
        self.registry.clear();
        // Numbering continues if the caller starts again
        self.counters.advance();

        let result = self.collect_result();
        info!(
            transmitted = result.transmitted,
            received = result.received,
            halt,
            "ping session finished"
        );

        if halt {
            if let Some(transport) = self.transport.take() {
                transport.close();
            }
        }

        self.emit(SessionEvent::Finished(result));
    }

    async fn send_probe(&mut self) {
        if self.killed || !self.running {
            return;
        }

        let sequence = self.counters.wire();
        let request = PendingRequest {
            identifier: self.identifier.0,
            address: self.destination.address,
            sequence,
            true_sequence: self.counters.logical(),
            created_at: Instant::now(),
        };

        self.transmitted += 1;

        let packet = match icmp::encode(
            self.identifier,
            sequence,
            &self.fingerprint,
            self.config.payload_size,
        ) {
            Ok(packet) => packet,
            Err(error) => {
                // A codec failure is a violated framing assumption; report
                // it through the response stream and keep the session alive
                warn!(sequence, %error, "failed to encode echo request");
                let response =
                    self.response_with_error(&request, ProbeError::Validation(error), None);
                self.publish(response);
                self.schedule_next();
                return;
            }
        };

        // Register before transmitting so even an instant reply finds its
        // entry in the registry
        let timer = self.spawn_timeout_timer(sequence);
        self.registry.register(request.clone(), timer);

        let outcome = match &self.transport {
            Some(transport) => transport.send(&packet).await,
            None => Err(TransportError::Closed),
        };

        match outcome {
            Ok(()) => {
                trace!(sequence, true_sequence = request.true_sequence, "probe sent");
                self.emit(SessionEvent::RequestSent {
                    identifier: self.identifier.0,
                    sequence,
                });
            }
            Err(error) => {
                debug!(sequence, %error, "probe transmission failed");
                let probe_error = match &error {
                    TransportError::SendTimeout(_) => ProbeError::SendTimeout,
                    other => ProbeError::SendFailed {
                        code: other.os_error(),
                        message: other.to_string(),
                    },
                };
                if let Some(request) = self.registry.resolve(sequence) {
                    let response = self.response_with_error(&request, probe_error, None);
                    self.publish(response);
                }
            }
        }

        self.schedule_next();
    }

    fn schedule_next(&mut self) {
        if self.killed || !self.running {
            return;
        }

        if let Some(count) = self.config.target_count {
            if self.transmitted >= count {
                debug!(
                    target_count = count,
                    outstanding = !self.registry.is_empty(),
                    "target probe count reached"
                );
                self.draining = true;
                self.maybe_finish();
                return;
            }
        }

        self.arm_interval_timer();
    }

    async fn handle_interval(&mut self) {
        if self.killed || !self.running {
            return;
        }
        self.interval_timer = None;
        self.counters.advance();
        self.send_probe().await;
    }

    fn handle_timeout(&mut self, sequence: u16) {
        if self.killed {
            return;
        }
        let Some(request) = self.registry.timeout(sequence) else {
            // A reply won the race; the late timer is a no-op
            trace!(sequence, "timeout after resolution ignored");
            return;
        };

        debug!(sequence, true_sequence = request.true_sequence, "probe timed out");
        let response = self.response_with_error(&request, ProbeError::ResponseTimeout, None);
        self.publish(response);
        self.maybe_finish();
    }

    fn handle_datagram(&mut self, datagram: Datagram) {
        if self.killed {
            return;
        }

        let kernel_filtered = self
            .transport
            .as_ref()
            .map(|transport| transport.filters_identifier())
            .unwrap_or(false);
        let expected_identifier = if kernel_filtered {
            None
        } else {
            Some(self.identifier)
        };

        match icmp::validate(&datagram.bytes, &self.fingerprint, expected_identifier) {
            Verdict::Valid(header) => match self.registry.resolve(header.sequence) {
                Some(request) => {
                    self.received += 1;
                    let rtt = datagram
                        .received_at
                        .saturating_duration_since(request.created_at);
                    trace!(sequence = header.sequence, ?rtt, "echo reply matched");

                    let response = Response {
                        identifier: request.identifier,
                        address: request.address,
                        sequence: request.sequence,
                        true_sequence: request.true_sequence,
                        rtt: Some(rtt),
                        error: None,
                        bytes: Some(datagram.bytes.len()),
                        ip_header: header.ip_header,
                    };
                    self.publish(response);
                    self.maybe_finish();
                }
                None => {
                    if self.registry.was_resolved(header.sequence) {
                        debug!(sequence = header.sequence, "discarding duplicate or late reply");
                    } else {
                        debug!(sequence = header.sequence, "discarding reply with no pending probe");
                    }
                }
            },
            Verdict::Foreign => {
                trace!("discarding reply addressed to another session");
            }
            Verdict::Invalid {
                sequence: Some(sequence),
                error,
            } => match self.registry.resolve(sequence) {
                Some(request) => {
                    debug!(sequence, %error, "malformed reply correlated to pending probe");
                    let response = self.response_with_error(
                        &request,
                        ProbeError::Validation(error),
                        Some(datagram.bytes.len()),
                    );
                    self.publish(response);
                    self.maybe_finish();
                }
                None => {
                    debug!(sequence, %error, "discarding malformed datagram with no pending probe");
                }
            },
            Verdict::Invalid {
                sequence: None,
                error,
            } => {
                debug!(%error, "discarding undecodable datagram");
            }
        }
    }

    fn maybe_finish(&mut self) {
        if self.draining && self.registry.is_empty() {
            self.finish(self.config.halt_after_target);
        }
    }

    fn response_with_error(
        &self,
        request: &PendingRequest,
        error: ProbeError,
        bytes: Option<usize>,
    ) -> Response {
        Response {
            identifier: request.identifier,
            address: request.address,
            sequence: request.sequence,
            true_sequence: request.true_sequence,
            rtt: None,
            error: Some(error),
            bytes,
            ip_header: None,
        }
    }

    /// Append to the ordered log, then deliver. An observer that reads the
    /// log back from inside its callback always sees the response that
    /// triggered it.
    fn publish(&mut self, response: Response) {
        self.log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(response.clone());
        self.emit(SessionEvent::Response(response));
    }

    fn emit(&self, event: SessionEvent) {
        self.observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .emit(&event);
    }

    fn collect_result(&self) -> PingResult {
        let responses = self
            .log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        PingResult {
            timestamp: Timestamp::now(),
            destination: self.destination.clone(),
            transmitted: self.transmitted,
            received: self.received,
            packet_loss: packet_loss(self.transmitted, self.received),
            rtt: rtt_stats(&responses),
            responses,
        }
    }

    fn spawn_timeout_timer(&self, sequence: u16) -> AbortHandle {
        let timer_tx = self.timer_tx.clone();
        let timeout = self.config.timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = timer_tx.send(TimerEvent::TimedOut(sequence)).await;
        })
        .abort_handle()
    }

    fn arm_interval_timer(&mut self) {
        let timer_tx = self.timer_tx.clone();
        let interval = self.config.interval();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let _ = timer_tx.send(TimerEvent::IntervalElapsed).await;
        })
        .abort_handle();
        if let Some(stale) = self.interval_timer.replace(handle) {
            stale.abort();
        }
    }

    fn cancel_interval_timer(&mut self) {
        if let Some(timer) = self.interval_timer.take() {
            timer.abort();
        }
    }

    /// Teardown on handle drop: release everything, emit nothing.
    fn teardown_silent(&mut self) {
        self.killed = true;
        self.running = false;
        self.draining = false;
        self.running_flag.store(false, Ordering::SeqCst);
        self.cancel_interval_timer();
        self.registry.clear();
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        trace!("session worker exited");
    }
}

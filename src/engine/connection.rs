// SPDX-License-Identifier: Apache-2.0

//! Connection
//!
//! One TCP session with the query server for one `(environment, database)`
//! pair, plus the FIFO of requests waiting to use it.
//!
//! ## Request lifecycle
//!
//! `send` appends to the queue and, when the connection is idle, dispatches
//! right away. Dispatch pops the head and hands it to the blocking pool,
//! which (re)opens the socket if needed, writes the request and starts a
//! [`Poller`]. Neither the caller of `send` nor a runtime worker ever waits
//! on a connect or a write. Each poller tick makes one non-blocking frame
//! step:
//!
//! - nothing buffered: wait for the next tick
//! - result frame: decode and accumulate
//! - terminator: hand the accumulated results to the callback, dispatch next
//! - read/decode failure or timeout: hand the error to the callback, close
//!   the socket (the stream can no longer be trusted to be frame-aligned),
//!   dispatch next
//!
//! Only one request is in flight at a time, so callbacks fire in submission
//! order.
//!
//! ## Silent cancel
//!
//! `disconnect` discards the queue and the in-flight request without
//! invoking their callbacks. Callers that need to know must track their own
//! outstanding requests.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use sqlbridge_core::frame::{FrameRead, FrameReader};
use sqlbridge_core::{decode_result, wire};

use crate::config::EngineConfig;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::poller::{PollControl, Poller};
use crate::engine::progress::ProgressIndicator;
use crate::engine::transport::{Connector, Transport};
use crate::engine::types::{ConnectionState, QueryResult, RequestId, ResultCallback, Vendor};
use crate::metrics::{RequestMetrics, RequestTiming};
use crate::observability::Sensitive;

/// Network and timing parameters shared by every connection of a client
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Option<Duration>,
}

impl ConnectionSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            poll_interval: config.poll_interval(),
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
        }
    }
}

/// Everything that identifies one connection
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Registry key, `"<environment>:<database>"`
    pub key: String,
    pub vendor: Vendor,
    /// Connection string with the database already substituted
    pub connection_string: Sensitive<String>,
    /// Sent after every handshake; their responses are discarded
    pub setup_statements: Vec<String>,
    pub settings: ConnectionSettings,
}

/// Cloneable handle to one server session and its request queue
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

struct Shared {
    options: ConnectionOptions,
    connector: Arc<dyn Connector>,
    progress: Arc<dyn ProgressIndicator>,
    metrics: Arc<RequestMetrics>,
    runtime: Handle,
    inner: Mutex<Inner>,
    /// Serializes opening and writing to the socket. Never taken while
    /// `inner` is held.
    io: Mutex<()>,
}

#[derive(Default)]
struct Inner {
    transport: Option<Box<dyn Transport>>,
    reader: FrameReader,
    queue: VecDeque<Request>,
    busy: bool,
    in_flight: Option<InFlight>,
    poller: Option<Poller>,
    /// Bumped on every dispatch and disconnect; stale pollers and
    /// dispatches compare against it and stop.
    generation: u64,
    /// Bumped on every reset. A dispatch chain started before a reset does
    /// not move on to the next request.
    turn: u64,
    /// A popped request is being connected or written on the blocking pool
    sending: bool,
    /// Setup-statement responses still to be skipped on this socket
    discard_batches: usize,
}

struct Request {
    id: RequestId,
    payload: Vec<u8>,
    batches: usize,
    callback: ResultCallback,
    submitted: Instant,
}

struct InFlight {
    id: RequestId,
    callback: ResultCallback,
    results: Vec<QueryResult>,
    remaining_batches: usize,
    dispatched: Instant,
    submitted: Instant,
}

enum Dispatch {
    Started,
    Cancelled(Request),
    Finished(Request, EngineResult<Vec<QueryResult>>),
}

enum Step {
    Continue(PollControl),
    Done(InFlight, EngineResult<Vec<QueryResult>>),
}

impl Connection {
    pub fn new(
        options: ConnectionOptions,
        connector: Arc<dyn Connector>,
        progress: Arc<dyn ProgressIndicator>,
        metrics: Arc<RequestMetrics>,
        runtime: Handle,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                options,
                connector,
                progress,
                metrics,
                runtime,
                inner: Mutex::new(Inner::default()),
                io: Mutex::new(()),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.shared.options.key
    }

    pub fn vendor(&self) -> Vendor {
        self.shared.options.vendor
    }

    pub fn state(&self) -> ConnectionState {
        let inner = self.shared.inner.lock();
        if inner.in_flight.is_some() || inner.sending {
            ConnectionState::AwaitingResponse
        } else if inner.transport.is_some() {
            ConnectionState::Idle
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.inner.lock().transport.is_some()
    }

    /// Whether a request is being processed (or the flag was left set by a
    /// bare `disconnect`)
    pub fn is_busy(&self) -> bool {
        self.shared.inner.lock().busy
    }

    /// Requests queued behind the in-flight one
    pub fn pending(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }

    /// Opens the socket and sends the handshake. No-op when already open.
    ///
    /// Blocks the caller for at most the connect timeout, or until a
    /// dispatch that is writing to the socket finishes.
    #[instrument(skip(self), fields(connection = %self.key()))]
    pub fn connect(&self) -> EngineResult<()> {
        let _io = self.shared.io.lock();
        if self.shared.inner.lock().transport.is_some() {
            return Ok(());
        }

        let transport = self.open_transport()?;
        let mut inner = self.shared.inner.lock();
        Self::close_locked(&mut inner);
        inner.discard_batches = self.shared.options.setup_statements.len();
        inner.transport = Some(transport);
        Ok(())
    }

    /// Queues a query whose response is one batch.
    pub fn send(&self, sql: &str, callback: ResultCallback) -> RequestId {
        self.enqueue(wire::query_request(sql), 1, callback)
    }

    /// Queues a script of already wrapped batches; the response holds one
    /// terminated batch per input batch.
    pub fn send_script(&self, batches: &[String], callback: ResultCallback) -> RequestId {
        self.enqueue(wire::script_request(batches), batches.len(), callback)
    }

    /// Closes the socket and silently drops every queued and in-flight
    /// request. Leaves the busy flag as is; see [`Connection::reset`].
    #[instrument(skip(self), fields(connection = %self.key()))]
    pub fn disconnect(&self) {
        let (dropped, transport) = {
            let mut inner = self.shared.inner.lock();
            inner.generation += 1;
            inner.sending = false;
            if let Some(poller) = inner.poller.take() {
                poller.stop();
            }
            inner.reader.reset();
            inner.discard_batches = 0;
            let mut dropped: Vec<ResultCallback> =
                inner.queue.drain(..).map(|request| request.callback).collect();
            if let Some(in_flight) = inner.in_flight.take() {
                dropped.push(in_flight.callback);
            }
            (dropped, inner.transport.take())
        };

        if let Some(mut transport) = transport {
            transport.close();
        }
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "dropping pending requests");
            self.shared.metrics.record_dropped(dropped.len());
        }
    }

    /// Full reset: disconnect, clear the busy flag and retire the progress
    /// indicator. Any dispatch still running for the old queue stops there.
    pub fn reset(&self) {
        self.disconnect();
        let dispatch = {
            let mut inner = self.shared.inner.lock();
            inner.turn += 1;
            // A send that raced the disconnect saw `busy` and only queued.
            inner.busy = !inner.queue.is_empty();
            inner.busy
        };
        if dispatch {
            self.process_next();
        } else {
            self.shared.progress.stop(self.key());
        }
    }

    fn enqueue(&self, payload: Vec<u8>, batches: usize, callback: ResultCallback) -> RequestId {
        let id = RequestId::new();
        let request = Request {
            id,
            payload,
            batches,
            callback,
            submitted: Instant::now(),
        };

        let dispatch = {
            let mut inner = self.shared.inner.lock();
            inner.queue.push_back(request);
            if inner.busy {
                false
            } else {
                inner.busy = true;
                true
            }
        };

        debug!(connection = %self.key(), request = %id, dispatch, "request queued");
        if dispatch {
            self.process_next();
        }
        id
    }

    /// Pops the head of the queue and hands it to the blocking pool. Clears
    /// the busy flag instead when the queue is empty.
    ///
    /// Only the current owner of the busy flag calls this.
    fn process_next(&self) {
        let next = {
            let mut inner = self.shared.inner.lock();
            match inner.queue.pop_front() {
                Some(request) => {
                    inner.busy = true;
                    inner.sending = true;
                    Some((request, inner.generation, inner.turn))
                }
                None => {
                    inner.busy = false;
                    None
                }
            }
        };

        let Some((request, generation, turn)) = next else {
            self.shared.progress.stop(self.key());
            return;
        };

        self.shared.progress.start(self.key());
        let connection = self.clone();
        self.shared
            .runtime
            .spawn_blocking(move || connection.dispatch(request, generation, turn));
    }

    /// Runs on the blocking pool.
    fn dispatch(&self, request: Request, generation: u64, turn: u64) {
        match self.start_request(request, generation) {
            Dispatch::Started => {}
            Dispatch::Cancelled(request) => {
                debug!(connection = %self.key(), request = %request.id, "request dropped by disconnect");
                self.shared.metrics.record_dropped(1);
                self.resume(turn);
            }
            Dispatch::Finished(request, outcome) => {
                let timing = RequestTiming {
                    queued: request.submitted.elapsed(),
                    served: Duration::ZERO,
                };
                self.deliver(request.id, request.callback, outcome, timing);
                self.resume(turn);
            }
        }
    }

    /// Moves on to the next queued request, unless a reset since `turn`
    /// handed the queue to a new dispatch chain.
    fn resume(&self, turn: u64) {
        let current = self.shared.inner.lock().turn == turn;
        if current {
            self.process_next();
        }
    }

    /// Connects if needed, writes the request and starts its poller. The
    /// socket is checked out of `inner` for the blocking part so state
    /// queries and `disconnect` never wait on the network.
    fn start_request(&self, request: Request, generation: u64) -> Dispatch {
        let _io = self.shared.io.lock();
        let existing = {
            let mut inner = self.shared.inner.lock();
            if inner.generation != generation {
                return Dispatch::Cancelled(request);
            }
            if request.batches == 0 {
                inner.sending = false;
                return Dispatch::Finished(request, Ok(Vec::new()));
            }
            inner.transport.take()
        };

        let (mut transport, opened) = match existing {
            Some(transport) => (transport, false),
            None => match self.open_transport() {
                Ok(transport) => (transport, true),
                Err(e) => return self.fail_dispatch(request, generation, e),
            },
        };
        if self.shared.inner.lock().generation != generation {
            transport.close();
            return Dispatch::Cancelled(request);
        }
        if let Err(e) = transport.send(&request.payload) {
            transport.close();
            let error = EngineError::connection_failed(format!("Failed to send request: {e}"));
            return self.fail_dispatch(request, generation, error);
        }

        let mut inner = self.shared.inner.lock();
        if inner.generation != generation {
            drop(inner);
            transport.close();
            return Dispatch::Cancelled(request);
        }
        if opened {
            inner.reader.reset();
            inner.discard_batches = self.shared.options.setup_statements.len();
        }
        inner.transport = Some(transport);
        inner.sending = false;
        inner.generation += 1;
        let generation = inner.generation;
        inner.in_flight = Some(InFlight {
            id: request.id,
            callback: request.callback,
            results: Vec::new(),
            remaining_batches: request.batches,
            dispatched: Instant::now(),
            submitted: request.submitted,
        });

        let connection = self.clone();
        inner.poller = Some(Poller::spawn(
            &self.shared.runtime,
            self.shared.options.settings.poll_interval,
            move || connection.poll_step(generation),
        ));

        debug!(connection = %self.key(), request = %request.id, "request sent");
        Dispatch::Started
    }

    fn fail_dispatch(&self, request: Request, generation: u64, error: EngineError) -> Dispatch {
        let mut inner = self.shared.inner.lock();
        if inner.generation != generation {
            return Dispatch::Cancelled(request);
        }
        inner.sending = false;
        Self::close_locked(&mut inner);
        Dispatch::Finished(request, Err(error))
    }

    /// One poller tick.
    fn poll_step(&self, generation: u64) -> PollControl {
        let (in_flight, outcome, turn) = {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;
            if inner.generation != generation {
                return PollControl::Stop;
            }
            match self.read_step(inner) {
                Step::Continue(control) => return control,
                Step::Done(in_flight, outcome) => {
                    inner.poller = None;
                    if outcome.is_err() {
                        Self::close_locked(inner);
                    }
                    (in_flight, outcome, inner.turn)
                }
            }
        };

        let timing = RequestTiming {
            queued: in_flight.dispatched.duration_since(in_flight.submitted),
            served: in_flight.dispatched.elapsed(),
        };
        self.deliver(in_flight.id, in_flight.callback, outcome, timing);
        self.resume(turn);
        PollControl::Stop
    }

    fn read_step(&self, inner: &mut Inner) -> Step {
        let Some(in_flight) = inner.in_flight.as_mut() else {
            return Step::Continue(PollControl::Stop);
        };

        let read = match inner.transport.as_mut() {
            Some(transport) => inner.reader.poll_frame(&mut **transport),
            None => Err(EngineError::read_failure("connection closed")),
        };

        let failure = match read {
            Ok(FrameRead::Pending) => match self.shared.options.settings.request_timeout {
                Some(timeout) if in_flight.dispatched.elapsed() >= timeout => {
                    EngineError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    }
                }
                _ => return Step::Continue(PollControl::Wait),
            },
            Ok(FrameRead::Frame(payload)) => match decode_result(&payload) {
                Ok(result) if inner.discard_batches > 0 => {
                    if !result.error.is_empty() {
                        warn!(connection = %self.key(), error = %result.error, "setup statement failed");
                    }
                    return Step::Continue(PollControl::Again);
                }
                Ok(result) => {
                    in_flight.results.push(result);
                    return Step::Continue(PollControl::Again);
                }
                Err(e) => e,
            },
            Ok(FrameRead::Terminator) => {
                if inner.discard_batches > 0 {
                    inner.discard_batches -= 1;
                    return Step::Continue(PollControl::Again);
                }
                in_flight.remaining_batches = in_flight.remaining_batches.saturating_sub(1);
                if in_flight.remaining_batches > 0 {
                    return Step::Continue(PollControl::Again);
                }
                return match inner.in_flight.take() {
                    Some(mut done) => {
                        let results = std::mem::take(&mut done.results);
                        Step::Done(done, Ok(results))
                    }
                    None => Step::Continue(PollControl::Stop),
                };
            }
            Err(e) => e,
        };

        match inner.in_flight.take() {
            Some(done) => Step::Done(done, Err(failure)),
            None => Step::Continue(PollControl::Stop),
        }
    }

    fn deliver(
        &self,
        id: RequestId,
        callback: ResultCallback,
        outcome: EngineResult<Vec<QueryResult>>,
        timing: RequestTiming,
    ) {
        self.shared
            .metrics
            .record_outcome(self.vendor(), &outcome, timing);
        let elapsed_ms = (timing.queued + timing.served).as_secs_f64() * 1000.0;

        match &outcome {
            Ok(results) => {
                let vendor = self.vendor();
                let failed = results.iter().filter(|r| r.is_failure(vendor)).count();
                debug!(
                    connection = %self.key(),
                    request = %id,
                    statements = results.len(),
                    failed,
                    elapsed_ms,
                    "request completed"
                );
            }
            Err(e) => warn!(connection = %self.key(), request = %id, error = %e, "request failed"),
        }

        callback(outcome);
    }

    fn open_transport(&self) -> EngineResult<Box<dyn Transport>> {
        let options = &self.shared.options;
        let settings = &options.settings;
        debug!(connection = %options.key, host = %settings.host, port = settings.port, "connecting");

        let mut transport = self
            .shared
            .connector
            .connect(&settings.host, settings.port, settings.connect_timeout)
            .map_err(|e| {
                EngineError::connection_failed(format!(
                    "Failed to connect to {}:{} - {}",
                    settings.host, settings.port, e
                ))
            })?;

        let handshake = wire::handshake(options.vendor, options.connection_string.expose())?;
        let mut sent = transport.send(&handshake);
        for statement in &options.setup_statements {
            if sent.is_err() {
                break;
            }
            sent = transport.send(&wire::query_request(statement));
        }
        if let Err(e) = sent {
            transport.close();
            return Err(EngineError::connection_failed(format!("Handshake failed: {e}")));
        }

        Ok(transport)
    }

    fn close_locked(inner: &mut Inner) {
        if let Some(mut transport) = inner.transport.take() {
            transport.close();
        }
        inner.reader.reset();
        inner.discard_batches = 0;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key())
            .field("vendor", &self.vendor())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::progress::testing::RecordingProgress;
    use crate::engine::transport::testing::MockServer;
    use sqlbridge_core::frame::{encode_frame, encode_terminator};
    use sqlbridge_core::{encode_result, split_batches};

    type Outcomes = Arc<Mutex<Vec<(usize, EngineResult<Vec<QueryResult>>)>>>;

    const HANDSHAKE: &str = r#"{"dbtype":"sqlserver","connstring":"Server=x;Database=master"}"#;

    fn response(messages: &[&str]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for message in messages {
            bytes.extend(encode_frame(&encode_result(&QueryResult::with_message(*message))));
        }
        bytes.extend(encode_terminator());
        bytes
    }

    fn messages(results: &[QueryResult]) -> Vec<&str> {
        results.iter().map(|r| r.message.as_str()).collect()
    }

    fn options(setup: Vec<String>, request_timeout: Option<Duration>) -> ConnectionOptions {
        ConnectionOptions {
            key: "dev:master".to_string(),
            vendor: Vendor::SqlServer,
            connection_string: Sensitive::from("Server=x;Database=master"),
            setup_statements: setup,
            settings: ConnectionSettings {
                host: "127.0.0.1".to_string(),
                port: 52000,
                poll_interval: Duration::from_millis(200),
                connect_timeout: Duration::from_secs(1),
                request_timeout,
            },
        }
    }

    fn connection_with(
        server: &MockServer,
        setup: Vec<String>,
        request_timeout: Option<Duration>,
    ) -> (Connection, Arc<RecordingProgress>) {
        let progress = Arc::new(RecordingProgress::default());
        let conn = Connection::new(
            options(setup, request_timeout),
            Arc::new(server.clone()),
            progress.clone(),
            Arc::new(RequestMetrics::new()),
            Handle::current(),
        );
        (conn, progress)
    }

    fn collector() -> (Outcomes, impl Fn(usize) -> ResultCallback) {
        let outcomes: Outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&outcomes);
        let make = move |n: usize| -> ResultCallback {
            let sink = Arc::clone(&sink);
            Box::new(move |outcome| sink.lock().push((n, outcome)))
        };
        (outcomes, make)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn callbacks_fire_once_each_in_submission_order() {
        let server = MockServer::new();
        server.push(response(&["one"]));
        server.push(response(&["two"]));
        server.push(response(&["three"]));
        let (conn, _) = connection_with(&server, vec![], None);
        let (outcomes, cb) = collector();

        conn.send("SELECT 1", cb(1));
        conn.send("SELECT 2", cb(2));
        conn.send("SELECT 3", cb(3));
        settle().await;

        let outcomes = outcomes.lock();
        let order: Vec<usize> = outcomes.iter().map(|(n, _)| *n).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(messages(outcomes[0].1.as_ref().unwrap()), vec!["one"]);
        assert_eq!(messages(outcomes[1].1.as_ref().unwrap()), vec!["two"]);
        assert_eq!(messages(outcomes[2].1.as_ref().unwrap()), vec!["three"]);
        assert!(!conn.is_busy());
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn k_frames_yield_k_results_in_frame_order() {
        let server = MockServer::new();
        server.push(response(&["a", "b", "c"]));
        let (conn, _) = connection_with(&server, vec![], None);
        let (outcomes, cb) = collector();

        conn.send("EXEC multi", cb(0));
        settle().await;

        let outcomes = outcomes.lock();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(messages(outcomes[0].1.as_ref().unwrap()), vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn terminator_alone_completes_with_no_results() {
        let server = MockServer::new();
        server.push(encode_terminator());
        let (conn, _) = connection_with(&server, vec![], None);
        let (outcomes, cb) = collector();

        conn.send("SET XACT_ABORT ON", cb(0));
        settle().await;

        let outcomes = outcomes.lock();
        assert_eq!(outcomes[0].1.as_ref().unwrap().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_precedes_the_first_request() {
        let server = MockServer::new();
        server.push(response(&["ok"]));
        let (conn, _) = connection_with(&server, vec![], None);
        let (_outcomes, cb) = collector();

        conn.send("SELECT 1", cb(0));
        settle().await;

        let sessions = server.sessions();
        assert_eq!(sessions.len(), 1);
        let expected = format!("{HANDSHAKE}\nSELECT 1\n\x1d\n");
        assert_eq!(String::from_utf8(sessions[0].clone()).unwrap(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn not_ready_keeps_the_request_in_flight() {
        let server = MockServer::new();
        let (conn, _) = connection_with(&server, vec![], None);
        let (outcomes, cb) = collector();

        conn.send("WAITFOR DELAY '00:01'", cb(0));
        settle().await;

        assert!(outcomes.lock().is_empty());
        assert!(conn.is_busy());
        assert_eq!(conn.state(), ConnectionState::AwaitingResponse);

        server.push(response(&["done"]));
        settle().await;

        let outcomes = outcomes.lock();
        assert_eq!(messages(outcomes[0].1.as_ref().unwrap()), vec!["done"]);
    }

    #[tokio::test(start_paused = true)]
    async fn read_failure_only_aborts_its_own_request() {
        let server = MockServer::new();
        server.push(response(&["first"]));
        let partial = response(&["second"]);
        server.push(partial[..3].to_vec());
        let (conn, _) = connection_with(&server, vec![], None);
        let (outcomes, cb) = collector();

        conn.send("SELECT 1", cb(1));
        conn.send("SELECT 2", cb(2));
        conn.send("SELECT 3", cb(3));
        settle().await;

        {
            let outcomes = outcomes.lock();
            assert_eq!(outcomes.len(), 2);
            assert_eq!(messages(outcomes[0].1.as_ref().unwrap()), vec!["first"]);
            assert!(matches!(outcomes[1].1, Err(EngineError::ReadFailure { .. })));
        }

        server.push(response(&["third"]));
        settle().await;

        let outcomes = outcomes.lock();
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[2].0, 3);
        assert_eq!(messages(outcomes[2].1.as_ref().unwrap()), vec!["third"]);
        // The failed socket was replaced by a fresh session.
        assert_eq!(server.sessions().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn decode_failure_is_delivered_and_queue_continues() {
        let server = MockServer::new();
        let mut garbage = encode_frame(&[0x0A, 0x10, b'x']);
        garbage.extend(encode_terminator());
        server.push(garbage);
        server.push(response(&["next"]));
        let (conn, _) = connection_with(&server, vec![], None);
        let (outcomes, cb) = collector();

        conn.send("SELECT broken", cb(1));
        conn.send("SELECT 2", cb(2));
        settle().await;

        let outcomes = outcomes.lock();
        assert!(matches!(outcomes[0].1, Err(EngineError::DecodeFailure { .. })));
        assert_eq!(messages(outcomes[1].1.as_ref().unwrap()), vec!["next"]);
    }

    #[tokio::test(start_paused = true)]
    async fn server_close_fails_the_request() {
        let server = MockServer::new();
        server.push_close();
        let (conn, _) = connection_with(&server, vec![], None);
        let (outcomes, cb) = collector();

        conn.send("SELECT 1", cb(0));
        settle().await;

        assert!(matches!(outcomes.lock()[0].1, Err(EngineError::ReadFailure { .. })));
        assert!(!conn.is_connected());
        assert_eq!(server.closed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_drops_callbacks_silently() {
        let server = MockServer::new();
        let (conn, progress) = connection_with(&server, vec![], None);
        let (outcomes, cb) = collector();

        conn.send("SELECT 1", cb(1));
        conn.send("SELECT 2", cb(2));
        conn.send("SELECT 3", cb(3));
        assert_eq!(conn.pending(), 2);
        settle().await;
        assert_eq!(conn.state(), ConnectionState::AwaitingResponse);

        conn.disconnect();
        server.push(response(&["late"]));
        settle().await;

        assert!(outcomes.lock().is_empty());
        assert_eq!(conn.pending(), 0);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        // A bare disconnect leaves the busy flag for the caller to clear.
        assert!(conn.is_busy());
        assert_eq!(progress.events().last().map(String::as_str), Some("start:dev:master"));

        conn.reset();
        assert!(!conn.is_busy());
        assert_eq!(progress.events().last().map(String::as_str), Some("stop:dev:master"));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_then_send_starts_with_a_fresh_handshake() {
        let server = MockServer::new();
        server.push(response(&["before"]));
        let (conn, _) = connection_with(&server, vec![], None);
        let (outcomes, cb) = collector();

        conn.send("SELECT 1", cb(1));
        settle().await;
        conn.reset();

        server.push(response(&["after"]));
        conn.send("SELECT 2", cb(2));
        settle().await;

        let sessions = server.sessions();
        assert_eq!(sessions.len(), 2);
        let second = String::from_utf8(sessions[1].clone()).unwrap();
        assert_eq!(second, format!("{HANDSHAKE}\nSELECT 2\n\x1d\n"));
        assert_eq!(outcomes.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_behaves_like_a_read_failure() {
        let server = MockServer::new();
        let (conn, _) = connection_with(&server, vec![], Some(Duration::from_secs(1)));
        let (outcomes, cb) = collector();

        conn.send("SELECT forever", cb(1));
        conn.send("SELECT 2", cb(2));
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        {
            let outcomes = outcomes.lock();
            assert_eq!(outcomes.len(), 1);
            assert_eq!(outcomes[0].1, Err(EngineError::Timeout { timeout_ms: 1_000 }));
        }

        server.push(response(&["two"]));
        settle().await;
        assert_eq!(messages(outcomes.lock()[1].1.as_ref().unwrap()), vec!["two"]);
    }

    #[tokio::test(start_paused = true)]
    async fn setup_statement_responses_never_reach_callbacks() {
        let server = MockServer::new();
        server.push(response(&["setup noise"]));
        server.push(response(&["real"]));
        let (conn, _) = connection_with(&server, vec!["SET NOCOUNT ON".to_string()], None);
        let (outcomes, cb) = collector();

        conn.connect().unwrap();
        conn.send("SELECT 1", cb(0));
        settle().await;

        assert_eq!(messages(outcomes.lock()[0].1.as_ref().unwrap()), vec!["real"]);
        let session = String::from_utf8(server.sessions()[0].clone()).unwrap();
        assert_eq!(
            session,
            format!("{HANDSHAKE}\nSET NOCOUNT ON\n\x1d\nSELECT 1\n\x1d\n")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn script_waits_for_every_batch() {
        let server = MockServer::new();
        server.push(response(&["batch one"]));
        server.push(response(&["batch two a", "batch two b"]));
        let (conn, _) = connection_with(&server, vec![], None);
        let (outcomes, cb) = collector();

        let batches = split_batches(&["SELECT 1", "GO", "SELECT 2; SELECT 3"], Some("GO"));
        conn.send_script(&batches, cb(0));
        settle().await;

        let outcomes = outcomes.lock();
        assert_eq!(
            messages(outcomes[0].1.as_ref().unwrap()),
            vec!["batch one", "batch two a", "batch two b"]
        );
        let session = server.sessions()[0].clone();
        assert!(session.ends_with(b"\x02\nSELECT 1\n\x03\x02\nSELECT 2; SELECT 3\n\x03"));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_script_completes_in_order() {
        let server = MockServer::new();
        server.push(response(&["first"]));
        let (conn, _) = connection_with(&server, vec![], None);
        let (outcomes, cb) = collector();

        conn.send("SELECT 1", cb(1));
        conn.send_script(&[], cb(2));
        settle().await;

        let outcomes = outcomes.lock();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[1].0, 2);
        assert!(outcomes[1].1.as_ref().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_connect_failure_is_returned() {
        let server = MockServer::new();
        server.refuse_connections(true);
        let (conn, _) = connection_with(&server, vec![], None);

        let err = conn.connect().unwrap_err();
        assert!(matches!(err, EngineError::ConnectionFailed { .. }));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_connect_failure_goes_to_the_callback() {
        let server = MockServer::new();
        server.refuse_connections(true);
        let (conn, _) = connection_with(&server, vec![], None);
        let (outcomes, cb) = collector();

        conn.send("SELECT 1", cb(1));
        settle().await;
        assert!(matches!(
            outcomes.lock()[0].1,
            Err(EngineError::ConnectionFailed { .. })
        ));
        assert!(!conn.is_busy());

        server.refuse_connections(false);
        server.push(response(&["up"]));
        conn.send("SELECT 2", cb(2));
        settle().await;
        assert_eq!(messages(outcomes.lock()[1].1.as_ref().unwrap()), vec!["up"]);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent() {
        let server = MockServer::new();
        let (conn, _) = connection_with(&server, vec![], None);

        conn.connect().unwrap();
        conn.connect().unwrap();
        assert_eq!(server.sessions().len(), 1);
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_starts_per_request_and_stops_when_drained() {
        let server = MockServer::new();
        server.push(response(&["one"]));
        server.push(response(&["two"]));
        let (conn, progress) = connection_with(&server, vec![], None);
        let (_outcomes, cb) = collector();

        conn.send("SELECT 1", cb(1));
        conn.send("SELECT 2", cb(2));
        settle().await;

        assert_eq!(
            progress.events(),
            vec!["start:dev:master", "start:dev:master", "stop:dev:master"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn callback_may_submit_follow_up_requests() {
        let server = MockServer::new();
        server.push(response(&["outer"]));
        server.push(response(&["inner"]));
        let (conn, _) = connection_with(&server, vec![], None);
        let (outcomes, cb) = collector();

        let follow_up = conn.clone();
        let inner_cb = cb(2);
        let outer_sink = cb(1);
        conn.send(
            "SELECT 1",
            Box::new(move |outcome| {
                follow_up.send("SELECT 2", inner_cb);
                outer_sink(outcome);
            }),
        );
        settle().await;

        let outcomes = outcomes.lock();
        let order: Vec<usize> = outcomes.iter().map(|(n, _)| *n).collect();
        assert_eq!(order, vec![1, 2]);
        assert_eq!(server.unread(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn metrics_separate_answers_failures_and_drops() {
        let server = MockServer::new();
        server.push(response(&["ok"]));
        server.push_close();
        let metrics = Arc::new(RequestMetrics::new());
        let conn = Connection::new(
            options(vec![], None),
            Arc::new(server.clone()),
            Arc::new(RecordingProgress::default()),
            Arc::clone(&metrics),
            Handle::current(),
        );
        let (_outcomes, cb) = collector();

        conn.send("SELECT 1", cb(1));
        conn.send("SELECT 2", cb(2));
        conn.send("SELECT 3", cb(3));
        conn.send("SELECT 4", cb(4));
        settle().await;
        conn.disconnect();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.timed_out, 0);
        assert_eq!(snapshot.dropped, 2);
        assert!(snapshot.mean_served_ms.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_inside_a_callback_hands_the_queue_to_new_requests() {
        let server = MockServer::new();
        server.push(response(&["A"]));
        server.push(response(&["X"]));
        server.push(response(&["Y"]));
        let (conn, _) = connection_with(&server, vec![], None);
        let (outcomes, cb) = collector();

        let again = conn.clone();
        let (x_cb, y_cb, first) = (cb(2), cb(3), cb(1));
        conn.send(
            "SELECT A",
            Box::new(move |outcome| {
                again.reset();
                again.send("SELECT X", x_cb);
                again.send("SELECT Y", y_cb);
                first(outcome);
            }),
        );
        settle().await;

        let outcomes = outcomes.lock();
        let order: Vec<usize> = outcomes.iter().map(|(n, _)| *n).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(messages(outcomes[1].1.as_ref().unwrap()), vec!["X"]);
        assert_eq!(messages(outcomes[2].1.as_ref().unwrap()), vec!["Y"]);

        let sessions = server.sessions();
        assert_eq!(sessions.len(), 2);
        assert_eq!(
            String::from_utf8(sessions[1].clone()).unwrap(),
            format!("{HANDSHAKE}\nSELECT X\n\x1d\nSELECT Y\n\x1d\n")
        );
        assert!(!conn.is_busy());
    }

    /// Holds every connect until the test releases it.
    struct StalledConnector {
        server: MockServer,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl Connector for StalledConnector {
        fn connect(
            &self,
            host: &str,
            port: u16,
            timeout: Duration,
        ) -> std::io::Result<Box<dyn Transport>> {
            let _ = self.release.lock().recv();
            self.server.connect(host, port, timeout)
        }
    }

    fn stalled(server: &MockServer) -> (Connection, std::sync::mpsc::Sender<()>) {
        let (release, gate) = std::sync::mpsc::channel();
        let connector = StalledConnector {
            server: server.clone(),
            release: Mutex::new(gate),
        };
        let conn = Connection::new(
            options(vec![], None),
            Arc::new(connector),
            Arc::new(RecordingProgress::default()),
            Arc::new(RequestMetrics::new()),
            Handle::current(),
        );
        (conn, release)
    }

    #[tokio::test(start_paused = true)]
    async fn send_returns_while_the_connect_is_stalled() {
        let server = MockServer::new();
        server.push(response(&["one"]));
        server.push(response(&["two"]));
        let (conn, release) = stalled(&server);
        let (outcomes, cb) = collector();

        let started = std::time::Instant::now();
        conn.send("SELECT 1", cb(1));
        conn.send("SELECT 2", cb(2));
        assert!(started.elapsed() < Duration::from_millis(500));

        // State queries do not wait on the connect either.
        assert_eq!(conn.state(), ConnectionState::AwaitingResponse);
        assert_eq!(conn.pending(), 1);
        assert!(outcomes.lock().is_empty());

        release.send(()).unwrap();
        settle().await;

        let outcomes = outcomes.lock();
        let order: Vec<usize> = outcomes.iter().map(|(n, _)| *n).collect();
        assert_eq!(order, vec![1, 2]);
        assert_eq!(messages(outcomes[1].1.as_ref().unwrap()), vec!["two"]);
        assert_eq!(server.sessions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_during_a_stalled_connect_drops_the_request() {
        let server = MockServer::new();
        let (conn, release) = stalled(&server);
        let (outcomes, cb) = collector();

        conn.send("SELECT 1", cb(1));
        conn.reset();
        assert!(!conn.is_busy());
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        release.send(()).unwrap();
        settle().await;

        assert!(outcomes.lock().is_empty());
        assert!(!conn.is_connected());
        assert_eq!(server.closed(), 1);
        let session = String::from_utf8(server.sessions()[0].clone()).unwrap();
        assert_eq!(session, format!("{HANDSHAKE}\n"));
    }
}

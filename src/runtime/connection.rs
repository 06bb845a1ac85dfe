//! Client connection: the issuance and response state machines.
//!
//! A `Connection` is driven entirely by callbacks from the event loop:
//!
//! ```text
//!   event_callback(Connected) ──► CONN_SETUP ──► LOADING ──► IDLE ◄──┐
//!                                                             │     │
//!                                           issue ──► WAITING_FOR_GET/POST
//! ```
//!
//! The write side decides when to manufacture an operation (inter-arrival
//! schedule, queue depth, exit condition) and the read side frames
//! responses off the input buffer and matches them to the oldest queued
//! operation. Any transport or framing error resets the connection: the
//! queue is discarded and the event loop reconnects.

use super::operation::{OpKind, OpQueue, Operation};
use super::reactor::Reactor;
use super::state::{read_state_for, write_step, ReadState, WriteAction, WriteInputs, WriteState};
use crate::config::{Options, Target};
use crate::protocols::{Outcome, Protocol, ProtocolError};
use crate::stats::{ConnectionStats, StatsSink};
use crate::workload::{Sampler, Workload, PAYLOAD_LEN};
use bytes::{Bytes, BytesMut};
use http::StatusCode;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Warm-up writes kept in flight while loading.
pub const LOADER_CHUNK: u64 = 1024;

/// Minimum gap after a response before issuing again when moderating.
const MODERATE_GAP: Duration = Duration::from_micros(250);

/// Schedule lag beyond which issue slots are skipped.
const SKIP_THRESHOLD: Duration = Duration::from_millis(5);

/// Lag the schedule is caught up to when skipping.
const SKIP_CATCHUP: Duration = Duration::from_millis(4);

/// Transport events delivered by the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnEvent {
    Connected,
    Error(io::ErrorKind),
    Eof,
    /// Connect did not complete in time.
    Timeout,
}

pub struct Connection {
    target: Target,
    options: Options,
    workload: Rc<Workload>,
    protocol: Protocol,

    read_state: ReadState,
    write_state: WriteState,

    start_time: Option<Instant>,
    next_time: Option<Instant>,
    last_rx: Option<Instant>,
    last_tx: Option<Instant>,

    /// Load the key space before the run starts.
    preload: bool,
    loaded: bool,
    loader_issued: u64,
    loader_completed: u64,

    op_queue: OpQueue,
    input: BytesMut,
    scratch: BytesMut,

    rng: StdRng,
    sampling: bool,
    sampler: Box<dyn Sampler>,
    stats: ConnectionStats,
    priority: u8,
}

impl Connection {
    pub fn new(
        target: Target,
        options: Options,
        workload: Rc<Workload>,
        sampler: Box<dyn Sampler>,
        sampling: bool,
        preload: bool,
        seed: u64,
    ) -> Self {
        let protocol = Protocol::new(&target);
        let priority = target.priority;

        Self {
            target,
            options,
            workload,
            protocol,
            read_state: ReadState::InitRead,
            write_state: WriteState::InitWrite,
            start_time: None,
            next_time: None,
            last_rx: None,
            last_tx: None,
            preload,
            loaded: false,
            loader_issued: 0,
            loader_completed: 0,
            op_queue: OpQueue::new(),
            input: BytesMut::new(),
            scratch: BytesMut::new(),
            rng: StdRng::seed_from_u64(seed),
            sampling,
            sampler,
            stats: ConnectionStats::default(),
            priority,
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn outstanding(&self) -> usize {
        self.op_queue.len()
    }

    /// Connected, set up, loaded and with nothing outstanding.
    pub fn is_ready(&self) -> bool {
        self.read_state == ReadState::Idle
    }

    pub fn set_priority(&mut self, priority: u8, io: &mut dyn Reactor) {
        self.priority = priority;
        io.set_priority(priority);
    }

    /// Begin issuing; `now` is the common start time of the run.
    pub fn start(&mut self, now: Instant, io: &mut dyn Reactor) {
        self.start_time = Some(now);
        debug!(conn = %self, "starting");
        self.drive_write_machine(now, io);
    }

    /// Whether this connection should stop issuing.
    pub fn check_exit_condition(&self, now: Instant) -> bool {
        let Some(start) = self.start_time else {
            return false;
        };

        if self.options.loadonly {
            return !self.preload || self.loaded;
        }
        if let Some(time) = self.options.time {
            if now >= start + time {
                return true;
            }
        }
        if let Some(ops) = self.options.ops {
            if self.stats.issued >= ops {
                return true;
            }
        }
        false
    }

    /// Exit condition holds and every issued operation has been answered.
    pub fn is_finished(&self, now: Instant) -> bool {
        self.check_exit_condition(now) && self.op_queue.is_empty()
    }

    pub fn event_callback(&mut self, event: ConnEvent, now: Instant, io: &mut dyn Reactor) {
        match event {
            ConnEvent::Connected => {
                if self.read_state != ReadState::InitRead {
                    return;
                }
                debug!(conn = %self, "connected");
                self.read_state = ReadState::ConnSetup;

                self.scratch.clear();
                let done = self.protocol.setup_connection_w(&mut self.scratch);
                if !self.scratch.is_empty() {
                    self.stats.tx_bytes += self.scratch.len() as u64;
                    io.send(&self.scratch);
                }
                if done {
                    self.finish_setup(now, io);
                }
            }
            ConnEvent::Error(kind) => {
                warn!(conn = %self, error = ?kind, "transport error");
                self.reset(io);
            }
            ConnEvent::Eof => {
                warn!(conn = %self, "connection closed by peer");
                self.reset(io);
            }
            ConnEvent::Timeout => {
                warn!(conn = %self, "connect timed out");
                self.reset(io);
            }
        }
    }

    pub fn read_callback(&mut self, data: &[u8], now: Instant, io: &mut dyn Reactor) {
        self.stats.rx_bytes += data.len() as u64;
        self.input.extend_from_slice(data);

        if let Err(e) = self.process_input(now, io) {
            warn!(conn = %self, error = %e, "framing error");
            self.reset(io);
        }
    }

    /// Output queue drained.
    pub fn write_callback(&mut self, now: Instant, io: &mut dyn Reactor) {
        self.drive_write_machine(now, io);
    }

    pub fn timer_callback(&mut self, now: Instant, io: &mut dyn Reactor) {
        self.drive_write_machine(now, io);
    }

    /// An HTTP response completed for the oldest operation.
    pub fn request_callback(&mut self, status: StatusCode, now: Instant, io: &mut dyn Reactor) {
        if let Err(e) = self.complete(Outcome::Http { status }, now, io) {
            warn!(conn = %self, error = %e, "framing error");
            self.reset(io);
        }
    }

    /// Discard outstanding operations and reconnect.
    pub fn reset(&mut self, io: &mut dyn Reactor) {
        let dropped = self.op_queue.measured() as u64;
        self.op_queue.clear();
        self.stats.resets += 1;
        self.stats.dropped += dropped;

        self.protocol.reset();
        self.input.clear();
        self.read_state = ReadState::InitRead;
        self.write_state = WriteState::InitWrite;
        self.next_time = None;

        // An interrupted load restarts from the first key.
        if !self.loaded {
            self.loader_issued = 0;
            self.loader_completed = 0;
        }

        debug!(conn = %self, dropped, last_tx = ?self.last_tx, "reset");
        io.cancel_timer();
        io.reconnect();
    }

    fn finish_setup(&mut self, now: Instant, io: &mut dyn Reactor) {
        if self.preload && !self.loaded {
            self.start_loading(now, io);
            return;
        }

        self.read_state = ReadState::Idle;
        self.drive_write_machine(now, io);
    }

    pub fn start_loading(&mut self, now: Instant, io: &mut dyn Reactor) {
        debug!(conn = %self, records = self.workload.records, "loading");
        self.read_state = ReadState::Loading;
        self.loader_issued = 0;
        self.loader_completed = 0;
        self.issue_loader_writes(now, io);
    }

    fn issue_loader_writes(&mut self, now: Instant, io: &mut dyn Reactor) {
        while self.loader_issued < self.loader_completed + LOADER_CHUNK
            && self.loader_issued < self.workload.records
        {
            let key = self.workload.keygen.generate(self.loader_issued);
            let value = self.random_value();
            self.issue(OpKind::Post, key, Some(value), now, io, true);
            self.loader_issued += 1;
        }
    }

    fn process_input(&mut self, now: Instant, io: &mut dyn Reactor) -> Result<(), ProtocolError> {
        loop {
            match self.read_state {
                ReadState::InitRead => return Ok(()),
                ReadState::ConnSetup => {
                    if !self.protocol.setup_connection_r(&mut self.input)? {
                        return Ok(());
                    }
                    self.finish_setup(now, io);
                }
                ReadState::Idle => {
                    if self.input.is_empty() {
                        return Ok(());
                    }
                    return Err(ProtocolError::EmptyQueue);
                }
                ReadState::Loading | ReadState::WaitingForGet | ReadState::WaitingForPost => {
                    let kind = self.op_queue.front().ok_or(ProtocolError::EmptyQueue)?.kind;
                    match self.protocol.handle_response(&mut self.input, kind)? {
                        None => return Ok(()),
                        Some(Outcome::Http { status }) => {
                            self.request_callback(status, now, io);
                        }
                        Some(outcome) => self.complete(outcome, now, io)?,
                    }
                    // A completion may have reset the connection.
                    if self.read_state == ReadState::InitRead {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Finalize the oldest operation with `outcome`.
    fn complete(
        &mut self,
        outcome: Outcome,
        now: Instant,
        io: &mut dyn Reactor,
    ) -> Result<(), ProtocolError> {
        let op = self.pop_op()?;
        if op.loader {
            self.loader_completed += 1;
            if self.loader_completed >= self.workload.records {
                debug!(conn = %self, records = self.loader_completed, "finished loading");
                self.loaded = true;
                self.read_state = read_state_for(self.op_queue.front().map(|op| op.kind));
                self.drive_write_machine(now, io);
            } else {
                self.issue_loader_writes(now, io);
            }
            return Ok(());
        }

        self.finish_op(op, outcome, now, io);
        Ok(())
    }

    /// Remove the oldest operation and re-target the read state at the next.
    pub fn pop_op(&mut self) -> Result<Operation, ProtocolError> {
        let op = self.op_queue.pop().ok_or(ProtocolError::EmptyQueue)?;
        if self.read_state != ReadState::Loading {
            self.read_state = read_state_for(self.op_queue.front().map(|op| op.kind));
        }
        Ok(op)
    }

    /// Record a completed operation and give the write side a chance to run.
    pub fn finish_op(&mut self, op: Operation, outcome: Outcome, now: Instant, io: &mut dyn Reactor) {
        trace!(
            conn = %self,
            seq = op.seq,
            kind = ?op.kind,
            key = %op.key,
            value_len = ?op.value_len,
            outcome = ?outcome,
            "completed"
        );
        self.stats.log_completion(op.kind, &outcome);
        if op.sampled {
            self.stats
                .log_latency(op.kind, now.saturating_duration_since(op.start_time));
        }
        self.last_rx = Some(now);
        self.drive_write_machine(now, io);
    }

    /// Run the write machine until it has nothing more to do.
    pub fn drive_write_machine(&mut self, now: Instant, io: &mut dyn Reactor) {
        if self.start_time.is_none() {
            return;
        }
        if matches!(
            self.read_state,
            ReadState::InitRead | ReadState::ConnSetup | ReadState::Loading
        ) {
            return;
        }

        let max_steps = 4 * self.options.depth + 16;
        for _ in 0..max_steps {
            let inputs = WriteInputs {
                now,
                next_time: self.next_time,
                outstanding: self.op_queue.len(),
                depth: self.options.depth,
                moderate_until: self
                    .last_rx
                    .filter(|_| self.options.moderate)
                    .map(|rx| rx + MODERATE_GAP),
                timer: io.timer(),
                exit: self.check_exit_condition(now),
            };

            let (state, action) = write_step(self.write_state, &inputs);
            self.write_state = state;

            match action {
                WriteAction::Continue | WriteAction::Yield => {}
                WriteAction::ArmTimer(deadline) => io.arm_timer(deadline),
                WriteAction::Schedule => {
                    let gap = self.interarrival();
                    self.next_time = Some(now + gap);
                }
                WriteAction::Issue => {
                    self.issue_something(now, io);
                    self.last_tx = Some(now);
                    self.advance_schedule(now);
                }
            }
            if action.is_terminal() {
                return;
            }
        }

        // Step budget spent; resume on the next turn of the event loop.
        io.arm_timer(now);
    }

    fn advance_schedule(&mut self, now: Instant) {
        let Some(mut next) = self.next_time else {
            return;
        };
        next += self.interarrival();

        let behind = now.checked_duration_since(next).unwrap_or_default();
        if self.options.skip
            && self.options.lambda > 0.0
            && behind > SKIP_THRESHOLD
            && self.op_queue.len() >= self.options.depth
        {
            while next + SKIP_CATCHUP < now {
                let gap = self.interarrival();
                if gap.is_zero() {
                    break;
                }
                next += gap;
                self.stats.skips += 1;
            }
        }

        self.next_time = Some(next);
    }

    /// Issue one operation drawn from the workload.
    pub fn issue_something(&mut self, now: Instant, io: &mut dyn Reactor) {
        let index = self.rng.gen_range(0..self.workload.records.max(1));
        let key = self.workload.keygen.generate(index);

        if self.rng.gen::<f64>() < self.workload.update {
            let value = self.random_value();
            self.issue_post(&key, value, now, io);
        } else {
            self.issue_get(&key, now, io);
        }
    }

    pub fn issue_get(&mut self, key: &str, now: Instant, io: &mut dyn Reactor) {
        self.issue(OpKind::Get, key.to_string(), None, now, io, false);
    }

    pub fn issue_post(&mut self, key: &str, value: Bytes, now: Instant, io: &mut dyn Reactor) {
        self.issue(OpKind::Post, key.to_string(), Some(value), now, io, false);
    }

    fn issue(
        &mut self,
        kind: OpKind,
        key: String,
        value: Option<Bytes>,
        now: Instant,
        io: &mut dyn Reactor,
        loader: bool,
    ) {
        self.scratch.clear();
        let len = match &value {
            Some(value) => self.protocol.post_request(&key, value, &mut self.scratch),
            None => self.protocol.get_request(&key, &mut self.scratch),
        };
        io.send(&self.scratch);
        self.stats.tx_bytes += len as u64;

        let sampled = !loader && self.sampling && self.sampler.sample();
        if !loader {
            self.stats.issued += 1;
        }
        self.op_queue
            .push(kind, key, value.map(|v| v.len()), now, sampled, loader);

        if self.read_state == ReadState::Idle {
            self.read_state = read_state_for(Some(kind));
        }
    }

    fn random_value(&mut self) -> Bytes {
        let len = self.workload.value_size(self.rng.gen());
        let offset = self.rng.gen_range(0..PAYLOAD_LEN);
        self.workload.value(offset, len)
    }

    fn interarrival(&mut self) -> Duration {
        let u = self.rng.gen();
        self.workload.interarrival(u)
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.target.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolType;
    use crate::runtime::reactor::MockReactor;
    use crate::workload::{Distribution, EveryNth, KeyGenerator};

    fn workload(records: u64, update: f64, ia_secs: f64) -> Rc<Workload> {
        Rc::new(Workload::new(
            KeyGenerator::new(Box::new(Distribution::Fixed(3.0))),
            Box::new(Distribution::Fixed(3.0)),
            Box::new(Distribution::Fixed(ia_secs)),
            records,
            update,
            1,
        ))
    }

    fn options(depth: usize) -> Options {
        Options {
            depth,
            time: None,
            ops: None,
            ..Options::default()
        }
    }

    fn connection(options: Options, workload: Rc<Workload>) -> Connection {
        Connection::new(
            Target::memcached("localhost", 11211),
            options,
            workload,
            Box::new(EveryNth::new(1)),
            true,
            false,
            7,
        )
    }

    fn connect(conn: &mut Connection, io: &mut MockReactor, now: Instant) {
        conn.event_callback(ConnEvent::Connected, now, io);
    }

    fn count(sent: &str, prefix: &str) -> usize {
        sent.lines().filter(|line| line.starts_with(prefix)).count()
    }

    #[test]
    fn test_ready_only_when_idle() {
        let mut io = MockReactor::default();
        let mut conn = connection(options(1), workload(10, 0.0, 0.0));
        let now = Instant::now();

        assert!(!conn.is_ready());
        connect(&mut conn, &mut io, now);
        assert!(conn.is_ready());

        conn.issue_get("foo", now, &mut io);
        assert_eq!(conn.read_state, ReadState::WaitingForGet);
        assert!(!conn.is_ready());

        conn.read_callback(b"END\r\n", now, &mut io);
        assert!(conn.is_ready());
    }

    #[test]
    fn test_set_stored_records_latency() {
        let mut io = MockReactor::default();
        let mut conn = connection(options(1), workload(10, 0.0, 0.0));
        let now = Instant::now();
        connect(&mut conn, &mut io, now);

        conn.issue_post("foo", Bytes::from_static(b"bar"), now, &mut io);
        assert_eq!(io.take_sent(), "set foo 0 0 3\r\nbar\r\n");
        assert_eq!(conn.read_state, ReadState::WaitingForPost);

        let later = now + Duration::from_millis(2);
        conn.read_callback(b"STORED\r\n", later, &mut io);

        assert_eq!(conn.stats().sets, 1);
        assert_eq!(conn.stats().set_latency.len(), 1);
        assert_eq!(conn.stats().set_latency.mean(), Duration::from_millis(2));
        assert!(conn.is_ready());
    }

    #[test]
    fn test_get_end_is_miss() {
        let mut io = MockReactor::default();
        let mut conn = connection(options(1), workload(10, 0.0, 0.0));
        let now = Instant::now();
        connect(&mut conn, &mut io, now);

        conn.issue_get("foo", now, &mut io);
        assert_eq!(io.take_sent(), "get foo\r\n");
        conn.read_callback(b"END\r\n", now, &mut io);

        assert_eq!(conn.stats().gets, 1);
        assert_eq!(conn.stats().get_misses, 1);
        assert_eq!(conn.stats().get_latency.len(), 1);
    }

    #[test]
    fn test_fifo_finalization_split_reads() {
        let mut io = MockReactor::default();
        let mut conn = connection(options(4), workload(10, 0.0, 0.0));
        let now = Instant::now();
        connect(&mut conn, &mut io, now);

        conn.issue_get("a", now, &mut io);
        conn.issue_post("b", Bytes::from_static(b"xy"), now, &mut io);
        conn.issue_get("c", now, &mut io);

        // Hit for "a" split mid-value, then STORED and a miss in one read.
        conn.read_callback(b"VALUE a 0 3\r\nab", now, &mut io);
        assert_eq!(conn.outstanding(), 3);
        conn.read_callback(b"c\r\nEND\r\nSTORED\r\nEND\r\n", now, &mut io);

        assert_eq!(conn.outstanding(), 0);
        assert_eq!(conn.stats().gets, 2);
        assert_eq!(conn.stats().get_misses, 1);
        assert_eq!(conn.stats().sets, 1);
        assert_eq!(conn.stats().resets, 0);
    }

    #[test]
    fn test_depth_bound() {
        let mut io = MockReactor::default();
        let mut conn = connection(options(3), workload(10, 0.0, 0.0));
        let now = Instant::now();
        connect(&mut conn, &mut io, now);
        conn.start(now, &mut io);

        assert_eq!(conn.outstanding(), 3);
        assert_eq!(conn.write_state, WriteState::WaitingForOpq);
        assert_eq!(count(&io.take_sent(), "get "), 3);

        conn.timer_callback(now, &mut io);
        conn.write_callback(now, &mut io);
        assert_eq!(conn.outstanding(), 3);
        assert!(io.take_sent().is_empty());

        conn.read_callback(b"END\r\n", now, &mut io);
        assert_eq!(conn.outstanding(), 3);
        assert_eq!(conn.write_state, WriteState::WaitingForOpq);
        assert_eq!(count(&io.take_sent(), "get "), 1);
    }

    #[test]
    fn test_reset_discards_outstanding() {
        let mut io = MockReactor::default();
        let mut conn = connection(options(3), workload(10, 0.0, 0.0));
        let now = Instant::now();
        connect(&mut conn, &mut io, now);
        conn.start(now, &mut io);
        assert_eq!(conn.outstanding(), 3);

        conn.event_callback(
            ConnEvent::Error(std::io::ErrorKind::ConnectionReset),
            now,
            &mut io,
        );

        assert_eq!(conn.outstanding(), 0);
        assert_eq!(conn.read_state, ReadState::InitRead);
        assert_eq!(conn.write_state, WriteState::InitWrite);
        assert_eq!(conn.stats().completed(), 0);
        assert_eq!(conn.stats().dropped, 3);
        assert_eq!(conn.stats().resets, 1);
        assert_eq!(io.reconnects, 1);
        assert_eq!(io.timer, None);

        // Reconnecting resumes issuing.
        connect(&mut conn, &mut io, now);
        assert_eq!(conn.outstanding(), 3);
    }

    #[test]
    fn test_timeout_resets_like_transport_error() {
        let mut io = MockReactor::default();
        let mut conn = connection(options(3), workload(10, 0.0, 0.0));
        let now = Instant::now();
        connect(&mut conn, &mut io, now);
        conn.start(now, &mut io);
        assert_eq!(conn.outstanding(), 3);

        conn.event_callback(ConnEvent::Timeout, now, &mut io);

        assert_eq!(conn.outstanding(), 0);
        assert_eq!(conn.read_state, ReadState::InitRead);
        assert_eq!(conn.write_state, WriteState::InitWrite);
        assert_eq!(conn.stats().dropped, 3);
        assert_eq!(conn.stats().resets, 1);
        assert_eq!(io.reconnects, 1);
        assert_eq!(io.timer, None);
        assert!(io.sent.is_empty());
    }

    #[test]
    fn test_framing_error_resets() {
        let mut io = MockReactor::default();
        let mut conn = connection(options(1), workload(10, 0.0, 0.0));
        let now = Instant::now();
        connect(&mut conn, &mut io, now);

        conn.issue_get("foo", now, &mut io);
        conn.read_callback(b"STORED\r\n", now, &mut io);
        assert_eq!(conn.stats().resets, 1);
        assert_eq!(conn.stats().gets, 0);
        assert_eq!(io.reconnects, 1);

        // Bytes with nothing outstanding.
        connect(&mut conn, &mut io, now);
        conn.read_callback(b"END\r\n", now, &mut io);
        assert_eq!(conn.stats().resets, 2);
        assert_eq!(io.reconnects, 2);
    }

    #[test]
    fn test_op_count_exit() {
        let mut io = MockReactor::default();
        let mut conn = connection(
            Options {
                ops: Some(5),
                ..options(2)
            },
            workload(10, 0.0, 0.0),
        );
        let now = Instant::now();
        connect(&mut conn, &mut io, now);
        conn.start(now, &mut io);

        for _ in 0..10 {
            if conn.outstanding() > 0 {
                conn.read_callback(b"END\r\n", now, &mut io);
            }
            conn.timer_callback(now, &mut io);
        }

        assert_eq!(conn.stats().issued, 5);
        assert_eq!(count(&io.take_sent(), "get "), 5);
        assert_eq!(conn.stats().gets, 5);
        assert!(conn.is_finished(now));
    }

    #[test]
    fn test_budget_filling_pipeline_waits_for_queue() {
        let mut io = MockReactor::default();
        let mut conn = connection(
            Options {
                ops: Some(2),
                ..options(2)
            },
            workload(10, 0.0, 0.0),
        );
        let now = Instant::now();
        connect(&mut conn, &mut io, now);
        conn.start(now, &mut io);

        assert_eq!(conn.outstanding(), 2);
        assert!(conn.check_exit_condition(now));
        assert_eq!(conn.write_state, WriteState::WaitingForOpq);

        conn.read_callback(b"END\r\nEND\r\n", now, &mut io);
        assert_eq!(conn.write_state, WriteState::Issuing);
        assert_eq!(count(&io.take_sent(), "get "), 2);
        assert!(conn.is_finished(now));
    }

    #[test]
    fn test_reset_after_budget_spent_finishes() {
        let mut io = MockReactor::default();
        let mut conn = connection(
            Options {
                ops: Some(1),
                ..options(1)
            },
            workload(10, 0.0, 0.0),
        );
        let now = Instant::now();
        connect(&mut conn, &mut io, now);
        conn.start(now, &mut io);
        assert_eq!(conn.stats().issued, 1);
        assert!(!conn.is_finished(now));

        conn.event_callback(ConnEvent::Eof, now, &mut io);
        assert_eq!(conn.read_state, ReadState::InitRead);
        assert_eq!(conn.stats().dropped, 1);
        assert!(conn.check_exit_condition(now));
        assert!(conn.is_finished(now));

        // Reconnecting does not issue past the budget.
        io.take_sent();
        connect(&mut conn, &mut io, now);
        assert!(io.take_sent().is_empty());
        assert!(conn.is_finished(now));
    }

    #[test]
    fn test_time_exit() {
        let mut io = MockReactor::default();
        let mut conn = connection(
            Options {
                time: Some(Duration::from_millis(10)),
                ..options(1)
            },
            workload(10, 0.0, 0.0),
        );
        let now = Instant::now();
        assert!(!conn.check_exit_condition(now + Duration::from_secs(1)));

        connect(&mut conn, &mut io, now);
        assert!(!conn.check_exit_condition(now + Duration::from_secs(1)));

        conn.start(now, &mut io);
        assert!(!conn.check_exit_condition(now + Duration::from_millis(5)));
        assert!(conn.check_exit_condition(now + Duration::from_millis(10)));

        let late = now + Duration::from_millis(20);
        conn.read_callback(b"END\r\n", late, &mut io);
        assert!(conn.is_finished(late));
        assert_eq!(conn.stats().issued, 1);
    }

    #[test]
    fn test_paced_issue_uses_timer() {
        let mut io = MockReactor::default();
        let mut conn = connection(options(4), workload(10, 0.0, 0.001));
        let now = Instant::now();
        connect(&mut conn, &mut io, now);
        conn.start(now, &mut io);

        assert_eq!(conn.outstanding(), 0);
        assert_eq!(conn.write_state, WriteState::WaitingForTime);
        let first = now + Duration::from_millis(1);
        assert_eq!(io.timer, Some(first));

        io.timer = None;
        conn.timer_callback(first, &mut io);
        assert_eq!(conn.outstanding(), 1);
        assert_eq!(conn.last_tx, Some(first));
        assert_eq!(io.timer, Some(first + Duration::from_millis(1)));
    }

    #[test]
    fn test_skip_catches_up() {
        let mut io = MockReactor::default();
        let mut conn = connection(
            Options {
                skip: true,
                lambda: 1000.0,
                ..options(1)
            },
            workload(10, 0.0, 0.001),
        );
        let now = Instant::now();
        connect(&mut conn, &mut io, now);
        conn.start(now, &mut io);
        conn.timer_callback(now + Duration::from_millis(1), &mut io);
        assert_eq!(conn.outstanding(), 1);

        let late = now + Duration::from_millis(20);
        conn.read_callback(b"END\r\n", late, &mut io);

        assert_eq!(conn.outstanding(), 1);
        assert!(conn.stats().skips >= 10);
        let next = conn.next_time.unwrap();
        assert!(next + SKIP_CATCHUP >= late);
    }

    #[test]
    fn test_moderate_delays_issue() {
        let mut io = MockReactor::default();
        let mut conn = connection(
            Options {
                moderate: true,
                ..options(1)
            },
            workload(10, 0.0, 0.0),
        );
        let now = Instant::now();
        connect(&mut conn, &mut io, now);
        conn.start(now, &mut io);
        assert_eq!(conn.outstanding(), 1);

        conn.read_callback(b"END\r\n", now, &mut io);
        assert_eq!(conn.outstanding(), 0);
        assert_eq!(io.timer, Some(now + MODERATE_GAP));

        conn.timer_callback(now + MODERATE_GAP, &mut io);
        assert_eq!(conn.outstanding(), 1);
    }

    #[test]
    fn test_loading_window() {
        let mut io = MockReactor::default();
        let mut conn = Connection::new(
            Target::memcached("localhost", 11211),
            options(1),
            workload(1030, 0.0, 0.0),
            Box::new(EveryNth::new(1)),
            true,
            true,
            7,
        );
        let now = Instant::now();
        connect(&mut conn, &mut io, now);

        assert_eq!(conn.read_state, ReadState::Loading);
        assert!(!conn.is_ready());
        assert_eq!(conn.loader_issued, LOADER_CHUNK);
        let sent = io.take_sent();
        assert_eq!(count(&sent, "set "), LOADER_CHUNK as usize);
        assert!(sent.starts_with("set 000 0 0 3\r\n"));

        conn.read_callback(b"STORED\r\n", now, &mut io);
        assert_eq!(conn.loader_completed, 1);
        assert_eq!(conn.loader_issued, LOADER_CHUNK + 1);

        let rest = "STORED\r\n".repeat(1029);
        conn.read_callback(rest.as_bytes(), now, &mut io);
        assert!(conn.is_ready());
        assert!(conn.loaded);
        assert_eq!(conn.loader_issued, 1030);
        assert_eq!(conn.stats().sets, 0);
        assert_eq!(conn.stats().issued, 0);
    }

    #[test]
    fn test_loading_restarts_after_reset() {
        let mut io = MockReactor::default();
        let mut conn = Connection::new(
            Target::memcached("localhost", 11211),
            Options {
                loadonly: true,
                ..options(1)
            },
            workload(4, 0.0, 0.0),
            Box::new(EveryNth::new(1)),
            true,
            true,
            7,
        );
        let now = Instant::now();
        connect(&mut conn, &mut io, now);
        conn.read_callback(b"STORED\r\n", now, &mut io);
        conn.event_callback(ConnEvent::Eof, now, &mut io);
        assert_eq!(conn.loader_completed, 0);
        assert_eq!(conn.stats().dropped, 0);

        io.take_sent();
        connect(&mut conn, &mut io, now);
        assert_eq!(count(&io.take_sent(), "set "), 4);
        conn.read_callback("STORED\r\n".repeat(4).as_bytes(), now, &mut io);
        assert!(conn.is_ready());

        conn.start(now, &mut io);
        assert!(conn.is_finished(now));
        assert!(io.take_sent().is_empty());
    }

    #[test]
    fn test_http_requests() {
        let mut io = MockReactor::default();
        let target = Target {
            protocol: ProtocolType::Http,
            host: "localhost".to_string(),
            port: 8080,
            uri: "/kv/{key}".to_string(),
            label: "http".to_string(),
            headers: Vec::new(),
            priority: 1,
        };
        let mut conn = Connection::new(
            target,
            options(2),
            workload(10, 0.0, 0.0),
            Box::new(EveryNth::new(1)),
            true,
            false,
            7,
        );
        let now = Instant::now();
        connect(&mut conn, &mut io, now);

        conn.issue_get("foo", now, &mut io);
        conn.issue_post("bar", Bytes::from_static(b"v"), now, &mut io);
        assert!(io.take_sent().starts_with("GET /kv/foo HTTP/1.1\r\n"));

        conn.read_callback(
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\nHTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nok",
            now,
            &mut io,
        );
        assert_eq!(conn.stats().gets, 1);
        assert_eq!(conn.stats().sets, 1);
        assert_eq!(conn.stats().http_errors, 1);
        assert!(conn.is_ready());

        conn.issue_get("foo", now, &mut io);
        conn.request_callback(StatusCode::OK, now, &mut io);
        assert_eq!(conn.stats().gets, 2);

        conn.request_callback(StatusCode::OK, now, &mut io);
        assert_eq!(conn.stats().resets, 1);
    }

    #[test]
    fn test_priority_forwarded() {
        let mut io = MockReactor::default();
        let mut conn = connection(options(1), workload(10, 0.0, 0.0));
        conn.set_priority(3, &mut io);
        assert_eq!(conn.priority(), 3);
        assert_eq!(io.priority, Some(3));
    }

    #[test]
    fn test_unsampled_ops_skip_latency() {
        let mut io = MockReactor::default();
        let mut conn = Connection::new(
            Target::memcached("localhost", 11211),
            options(1),
            workload(10, 0.0, 0.0),
            Box::new(EveryNth::new(2)),
            true,
            false,
            7,
        );
        let now = Instant::now();
        connect(&mut conn, &mut io, now);
        for _ in 0..4 {
            conn.issue_get("k", now, &mut io);
            conn.read_callback(b"END\r\n", now, &mut io);
        }
        assert_eq!(conn.stats().gets, 4);
        assert_eq!(conn.stats().get_latency.len(), 2);
    }
}

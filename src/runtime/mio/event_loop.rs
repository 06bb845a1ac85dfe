//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking connect/read/write syscalls and hand the
//! results to the owning `Connection`. Uses epoll on Linux, kqueue on macOS.
//!
//! ## Phases
//!
//! 1. Every connection connects (and the first per target loads the key
//!    space unless loading is disabled).
//! 2. Once all connections are ready they are started with one common
//!    start time.
//! 3. The loop ends when every connection has reached its exit condition
//!    and drained its queue, or a grace period after the run time expires.
//!
//! ## Timers
//!
//! Each connection has at most one armed timer plus a connect deadline and a
//! reconnect instant. All three share one min-heap; entries are invalidated
//! lazily by comparing against the connection's current deadlines.

use crate::config::Config;
use crate::runtime::{ConnEvent, Connection, Reactor};
use crate::stats::ConnectionStats;
use crate::workload::{EveryNth, Workload};
use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::{self, Read, Write};
use std::mem;
use std::net::{SocketAddr, ToSocketAddrs};
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Delay before reconnecting after a reset.
const RECONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// Time allowed past the run time for outstanding responses.
const GRACE_PERIOD: Duration = Duration::from_secs(1);

/// Upper bound on one poll so exit conditions are re-checked.
const MAX_POLL_WAIT: Duration = Duration::from_millis(100);

const READ_BUFFER_SIZE: usize = 64 * 1024;

const EVENT_CAPACITY: usize = 1024;

type TimerHeap = BinaryHeap<Reverse<(Instant, usize)>>;

/// Per-connection transport state for the mio backend.
///
/// Wraps the `Connection` state machine with the socket, its unsent output
/// and the deadlines the event loop tracks on its behalf.
struct MioConnection {
    conn: Connection,
    stream: Option<TcpStream>,
    /// Socket connect has completed.
    connected: bool,
    /// Bytes queued by the connection but not yet accepted by the socket.
    out: BytesMut,
    timer: Option<Instant>,
    connect_deadline: Option<Instant>,
    reconnect_at: Option<Instant>,
    reconnect_requested: bool,
    priority: u8,
}

impl MioConnection {
    fn new(conn: Connection) -> Self {
        let priority = conn.priority();
        Self {
            conn,
            stream: None,
            connected: false,
            out: BytesMut::new(),
            timer: None,
            connect_deadline: None,
            reconnect_at: None,
            reconnect_requested: false,
            priority,
        }
    }
}

/// `Reactor` view of one slab entry, lent to a connection for one callback.
struct ConnIo<'a> {
    id: usize,
    out: &'a mut BytesMut,
    timer: &'a mut Option<Instant>,
    timers: &'a mut TimerHeap,
    reconnect: &'a mut bool,
    priority: &'a mut u8,
}

impl Reactor for ConnIo<'_> {
    fn send(&mut self, data: &[u8]) {
        self.out.extend_from_slice(data);
    }

    fn arm_timer(&mut self, deadline: Instant) {
        *self.timer = Some(deadline);
        self.timers.push(Reverse((deadline, self.id)));
    }

    fn timer(&self) -> Option<Instant> {
        *self.timer
    }

    fn cancel_timer(&mut self) {
        *self.timer = None;
    }

    fn reconnect(&mut self) {
        *self.reconnect = true;
        *self.timer = None;
        self.out.clear();
    }

    fn set_priority(&mut self, priority: u8) {
        *self.priority = priority;
    }
}

struct EventLoop {
    poll: Poll,
    connections: Slab<MioConnection>,
    timers: TimerHeap,
    nodelay: bool,
    connect_timeout: Duration,
    read_buf: Vec<u8>,
}

/// Run every configured connection to completion and return the summed
/// statistics.
pub fn run(config: &Config) -> io::Result<ConnectionStats> {
    let workload = Workload::from_config(config)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let workload = Rc::new(workload);
    let options = config.options();

    info!(
        targets = config.targets.len(),
        connections = config.total_connections(),
        depth = options.depth,
        lambda = options.lambda,
        "Starting mio runtime"
    );

    let mut event_loop = EventLoop {
        poll: Poll::new()?,
        connections: Slab::with_capacity(config.total_connections()),
        timers: BinaryHeap::new(),
        nodelay: !config.no_nodelay,
        connect_timeout: config.connect_timeout,
        read_buf: vec![0; READ_BUFFER_SIZE],
    };

    let now = Instant::now();
    for target in &config.targets {
        for n in 0..config.connections {
            let preload = n == 0 && !config.noload;
            let entry = event_loop.connections.vacant_entry();
            let id = entry.key();
            let seed = config
                .seed
                .wrapping_add((id as u64 + 1).wrapping_mul(0x9e37_79b9_7f4a_7c15));
            let conn = Connection::new(
                target.clone(),
                options,
                Rc::clone(&workload),
                Box::new(EveryNth::new(config.sample_every)),
                config.sample_every > 0,
                preload,
                seed,
            );
            entry.insert(MioConnection::new(conn));

            event_loop.dispatch(id, now, |conn, io| {
                let priority = conn.target().priority;
                conn.set_priority(priority, io);
            });
            event_loop.connect(id, now);
        }
    }

    event_loop.run(options.time)?;

    let mut total = ConnectionStats::default();
    for (_, mc) in event_loop.connections.iter() {
        total.accumulate(mc.conn.stats());
    }
    Ok(total)
}

impl EventLoop {
    fn run(&mut self, time: Option<Duration>) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        let mut start: Option<Instant> = None;

        loop {
            let now = Instant::now();
            self.fire_timers(now);

            match start {
                None if self.connections.iter().all(|(_, mc)| mc.conn.is_ready()) => {
                    let now = Instant::now();
                    info!(connections = self.connections.len(), "All connections ready");
                    let ids: Vec<usize> = self.connections.iter().map(|(id, _)| id).collect();
                    for id in ids {
                        self.dispatch(id, now, |conn, io| conn.start(now, io));
                    }
                    start = Some(now);
                }
                Some(started) => {
                    if self
                        .connections
                        .iter()
                        .all(|(_, mc)| mc.conn.is_finished(now))
                    {
                        debug!("All connections finished");
                        return Ok(());
                    }
                    if let Some(time) = time {
                        if now >= started + time + GRACE_PERIOD {
                            let outstanding: usize = self
                                .connections
                                .iter()
                                .map(|(_, mc)| mc.conn.outstanding())
                                .sum();
                            warn!(outstanding, "Grace period expired");
                            return Ok(());
                        }
                    }
                }
                None => {}
            }

            let now = Instant::now();
            let wait = self
                .timers
                .peek()
                .map(|Reverse((deadline, _))| deadline.saturating_duration_since(now))
                .unwrap_or(MAX_POLL_WAIT)
                .min(MAX_POLL_WAIT);

            match self.poll.poll(&mut events, Some(wait)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            let mut ready: Vec<(u8, usize, bool, bool)> = events
                .iter()
                .filter_map(|event| {
                    let id = event.token().0;
                    let mc = self.connections.get(id)?;
                    let readable = event.is_readable() || event.is_read_closed() || event.is_error();
                    let writable = event.is_writable() || event.is_write_closed();
                    Some((mc.priority, id, readable, writable))
                })
                .collect();
            ready.sort_unstable_by_key(|&(priority, id, _, _)| (priority, id));

            for (_, id, readable, writable) in ready {
                self.handle_event(id, readable, writable);
            }
        }
    }

    /// Run `f` against connection `id` with a reactor view of its slab entry,
    /// then act on what it asked for.
    fn dispatch<F>(&mut self, id: usize, now: Instant, f: F)
    where
        F: FnOnce(&mut Connection, &mut dyn Reactor),
    {
        let Some(mc) = self.connections.get_mut(id) else {
            return;
        };
        let mut io = ConnIo {
            id,
            out: &mut mc.out,
            timer: &mut mc.timer,
            timers: &mut self.timers,
            reconnect: &mut mc.reconnect_requested,
            priority: &mut mc.priority,
        };
        f(&mut mc.conn, &mut io);

        self.after_dispatch(id, now);
    }

    fn after_dispatch(&mut self, id: usize, now: Instant) {
        let Some(mc) = self.connections.get_mut(id) else {
            return;
        };

        if mc.reconnect_requested {
            mc.reconnect_requested = false;
            let at = now + RECONNECT_BACKOFF;
            mc.reconnect_at = Some(at);
            self.timers.push(Reverse((at, id)));
            self.close_stream(id);
            return;
        }

        if mc.connected && !mc.out.is_empty() {
            if let Err(e) = flush(mc) {
                self.dispatch(id, now, |conn, io| {
                    conn.event_callback(ConnEvent::Error(e.kind()), now, io)
                });
            }
        }
    }

    fn fire_timers(&mut self, now: Instant) {
        let mut due = Vec::new();
        while let Some(&Reverse((deadline, id))) = self.timers.peek() {
            if deadline > now {
                break;
            }
            self.timers.pop();
            due.push((deadline, id));
        }

        for (deadline, id) in due {
            let Some(mc) = self.connections.get_mut(id) else {
                continue;
            };

            if mc.reconnect_at == Some(deadline) {
                mc.reconnect_at = None;
                debug!(conn_id = id, "Reconnecting");
                self.connect(id, now);
                continue;
            }

            if mc.connect_deadline == Some(deadline) && !mc.connected {
                mc.connect_deadline = None;
                self.close_stream(id);
                self.dispatch(id, now, |conn, io| {
                    conn.event_callback(ConnEvent::Timeout, now, io)
                });
                continue;
            }

            if mc.timer == Some(deadline) {
                mc.timer = None;
                self.dispatch(id, now, |conn, io| conn.timer_callback(now, io));
            }
        }
    }

    /// Start a non-blocking connect for connection `id`.
    fn connect(&mut self, id: usize, now: Instant) {
        let Some(mc) = self.connections.get_mut(id) else {
            return;
        };

        let target = mc.conn.target();
        let result = resolve(&target.host, target.port)
            .and_then(|addr| open_stream(addr, self.nodelay))
            .and_then(|mut stream| {
                self.poll.registry().register(
                    &mut stream,
                    Token(id),
                    Interest::READABLE | Interest::WRITABLE,
                )?;
                Ok(stream)
            });

        match result {
            Ok(stream) => {
                let deadline = now + self.connect_timeout;
                mc.stream = Some(stream);
                mc.connected = false;
                mc.connect_deadline = Some(deadline);
                self.timers.push(Reverse((deadline, id)));
            }
            Err(e) => {
                warn!(conn_id = id, conn = %mc.conn, error = %e, "Connect failed");
                self.dispatch(id, now, |conn, io| {
                    conn.event_callback(ConnEvent::Error(e.kind()), now, io)
                });
            }
        }
    }

    fn handle_event(&mut self, id: usize, readable: bool, writable: bool) {
        let Some(mc) = self.connections.get_mut(id) else {
            return;
        };
        let Some(stream) = mc.stream.as_ref() else {
            return;
        };

        if !mc.connected {
            match finish_connect(stream) {
                Ok(true) => {
                    mc.connected = true;
                    mc.connect_deadline = None;
                    let now = Instant::now();
                    self.dispatch(id, now, |conn, io| {
                        conn.event_callback(ConnEvent::Connected, now, io)
                    });
                }
                Ok(false) => return,
                Err(e) => {
                    let now = Instant::now();
                    self.close_stream(id);
                    self.dispatch(id, now, |conn, io| {
                        conn.event_callback(ConnEvent::Error(e.kind()), now, io)
                    });
                    return;
                }
            }
        }

        if readable {
            self.handle_readable(id);
        }
        if writable {
            self.handle_writable(id);
        }
    }

    fn handle_readable(&mut self, id: usize) {
        let mut buf = mem::take(&mut self.read_buf);

        loop {
            let Some(mc) = self.connections.get_mut(id) else {
                break;
            };
            if !mc.connected {
                break;
            }
            let Some(stream) = mc.stream.as_mut() else {
                break;
            };

            let event = match stream.read(&mut buf) {
                Ok(0) => Err(ConnEvent::Eof),
                Ok(n) => Ok(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => Err(ConnEvent::Error(e.kind())),
            };

            let now = Instant::now();
            match event {
                Ok(n) => {
                    let data = &buf[..n];
                    self.dispatch(id, now, |conn, io| conn.read_callback(data, now, io));
                }
                Err(event) => {
                    self.close_stream(id);
                    self.dispatch(id, now, |conn, io| conn.event_callback(event, now, io));
                    break;
                }
            }
        }

        self.read_buf = buf;
    }

    fn handle_writable(&mut self, id: usize) {
        let Some(mc) = self.connections.get_mut(id) else {
            return;
        };
        if !mc.connected || mc.out.is_empty() {
            return;
        }

        let now = Instant::now();
        match flush(mc) {
            Ok(()) if mc.out.is_empty() => {
                self.dispatch(id, now, |conn, io| conn.write_callback(now, io));
            }
            Ok(()) => {}
            Err(e) => {
                self.close_stream(id);
                self.dispatch(id, now, |conn, io| {
                    conn.event_callback(ConnEvent::Error(e.kind()), now, io)
                });
            }
        }
    }

    fn close_stream(&mut self, id: usize) {
        if let Some(mc) = self.connections.get_mut(id) {
            if let Some(mut stream) = mc.stream.take() {
                let _ = self.poll.registry().deregister(&mut stream);
                debug!(conn_id = id, "Connection closed");
            }
            mc.connected = false;
            mc.connect_deadline = None;
            mc.out.clear();
        }
    }
}

/// Write as much pending output as the socket accepts.
fn flush(mc: &mut MioConnection) -> io::Result<()> {
    let Some(stream) = mc.stream.as_mut() else {
        return Ok(());
    };

    while !mc.out.is_empty() {
        match stream.write(&mc.out) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => mc.out.advance(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses for {}:{}", host, port),
        )
    })
}

/// Begin a non-blocking connect and apply socket options.
fn open_stream(addr: SocketAddr, nodelay: bool) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(addr)?;
    let socket = socket2::SockRef::from(&stream);
    socket.set_nodelay(nodelay)?;
    socket.set_keepalive(true)?;
    Ok(stream)
}

/// Whether a pending connect has completed; errors if it failed.
fn finish_connect(stream: &TcpStream) -> io::Result<bool> {
    if let Some(e) = stream.take_error()? {
        return Err(e);
    }
    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(e) => Err(e),
    }
}

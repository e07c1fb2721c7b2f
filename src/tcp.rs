//! Buffered TCP sockets and servers.
//!
//! A [`Socket`] wraps a nonblocking stream with userspace read/write
//! buffering, per-direction enable bits and idle timeouts, and graceful
//! close semantics: closing a socket with unsent bytes lets the write
//! buffer drain before the descriptor is released. Readiness events are
//! drained fully on every wakeup (read until `WouldBlock`, write until
//! empty or `WouldBlock`) so edge-style polling can never stall.
//!
//! The socket state machine: `Connecting -> Open` on connect completion;
//! any state moves to `Closed` on explicit close, peer EOF, or any TCP
//! error; `Open -> DrainingClose` when the user closes with a non-empty
//! write buffer. `Closed` is terminal and every operation on a closed
//! socket returns [`LoopError::SocketClosed`].

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::Interest;

use crate::condition::Condition;
use crate::config::{DEFAULT_BACKLOG, READ_CHUNK_SIZE};
use crate::error::LoopError;
use crate::event_loop::{deliver_condition, exiting, invoke_user, with_loop, Deferred, LoopState};
use crate::registry::{
    share_event_cb, share_read_cb, share_write_cb, Bundle, EventCb, HandleId, HandleKind,
    HandleState, ReadCb, WriteCb,
};

/// An opaque reference to a buffered TCP socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Socket {
    pub(crate) id: HandleId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SocketPhase {
    Connecting,
    Open,
    DrainingClose,
    Closed,
}

/// Kind-specific state for a socket record.
pub struct SocketState {
    pub(crate) stream: Option<TcpStream>,
    pub(crate) phase: SocketPhase,
    pub(crate) read_enabled: bool,
    pub(crate) write_enabled: bool,
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) write_timeout: Option<Duration>,
    pub(crate) read_deadline: Option<Instant>,
    pub(crate) write_deadline: Option<Instant>,
    pub(crate) write_buf: Vec<u8>,
    /// A write callback installed by `write_socket_data` is armed until
    /// the buffer next drains; it does not re-arm itself.
    pub(crate) drain_armed: bool,
    pub(crate) registered: bool,
    pub(crate) current_interest: Option<Interest>,
}

impl SocketState {
    pub(crate) fn new() -> Self {
        Self {
            stream: None,
            phase: SocketPhase::Connecting,
            read_enabled: true,
            write_enabled: true,
            read_timeout: None,
            write_timeout: None,
            read_deadline: None,
            write_deadline: None,
            write_buf: Vec::new(),
            drain_armed: false,
            registered: false,
            current_interest: None,
        }
    }

    pub(crate) fn mark_closed(&mut self) {
        self.phase = SocketPhase::Closed;
        self.read_deadline = None;
        self.write_deadline = None;
    }

    /// Recompute the read idle deadline. Armed only while reading is
    /// enabled and the socket is connecting or open.
    fn arm_read_deadline(&mut self, now: Instant) {
        self.read_deadline = match (self.read_timeout, self.read_enabled, self.phase) {
            (Some(t), true, SocketPhase::Connecting | SocketPhase::Open) => Some(now + t),
            _ => None,
        };
    }

    /// Recompute the write idle deadline. Armed only while writing is
    /// enabled and there is something to flush (or a connect pending).
    fn arm_write_deadline(&mut self, now: Instant) {
        let pending = !self.write_buf.is_empty() || self.phase == SocketPhase::Connecting;
        self.write_deadline = match (self.write_timeout, self.write_enabled && pending, self.phase) {
            (Some(t), true, SocketPhase::Connecting | SocketPhase::Open | SocketPhase::DrainingClose) => {
                Some(now + t)
            }
            _ => None,
        };
    }

    fn deadline_expired(&self, now: Instant) -> bool {
        self.read_deadline.is_some_and(|d| d <= now)
            || self.write_deadline.is_some_and(|d| d <= now)
    }

    fn desired_interest(&self) -> Option<Interest> {
        let want_read = self.read_enabled
            && matches!(self.phase, SocketPhase::Connecting | SocketPhase::Open);
        let want_write = self.phase == SocketPhase::Connecting
            || (!self.write_buf.is_empty()
                && (self.write_enabled || self.phase == SocketPhase::DrainingClose));
        match (want_read, want_write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

#[cfg(test)]
impl SocketState {
    pub(crate) fn detached_for_tests() -> Self {
        Self::new()
    }
}

/// Options accepted by [`tcp_send`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpOptions {
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

/// Callback replacements accepted by [`write_socket_data`]. A supplied
/// callback replaces the current one in that slot before the bytes are
/// queued, so the new callbacks observe the completion of exactly the
/// bytes being written.
#[derive(Default)]
pub struct WriteOptions {
    pub read_cb: Option<Box<dyn FnMut(Socket, Vec<u8>)>>,
    pub write_cb: Option<Box<dyn FnMut(Socket)>>,
    pub event_cb: Option<Box<dyn FnMut(&Condition)>>,
}

/// Options accepted by [`tcp_server`].
#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    /// Listen backlog; negative means the runtime default.
    pub backlog: i32,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self { backlog: -1 }
    }
}

/// An opaque reference to a listening TCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpServerHandle {
    pub(crate) id: HandleId,
}

impl TcpServerHandle {
    /// The address the server is bound to. Useful with port 0 binds.
    pub fn local_addr(&self) -> Result<SocketAddr, LoopError> {
        with_loop(|s| {
            let record = s.registry.lookup(self.id).ok_or(LoopError::StaleHandle)?;
            let HandleState::TcpServer(srv) = &record.state else {
                return Err(LoopError::StaleHandle);
            };
            let listener = srv.listener.as_ref().ok_or(LoopError::StaleHandle)?;
            listener.local_addr().map_err(LoopError::Io)
        })?
    }
}

/// Kind-specific state for a TCP server record.
pub struct TcpServerState {
    pub(crate) listener: Option<TcpListener>,
}

fn io_condition(e: &io::Error) -> Condition {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => Condition::TcpRefused,
        io::ErrorKind::TimedOut => Condition::TcpTimeout,
        _ => Condition::TcpError {
            code: e.raw_os_error().unwrap_or(-1),
            msg: e.to_string(),
        },
    }
}

/// (Re)register the socket with the reactor to match its current state.
pub(crate) fn refresh_interest(s: &mut LoopState, id: HandleId) {
    let Some(record) = s.registry.lookup(id) else { return };
    let HandleState::Socket(st) = &mut record.state else { return };
    let desired = st.desired_interest();
    let Some(stream) = st.stream.as_mut() else { return };
    match (st.registered, desired) {
        (false, Some(interest)) => {
            if s.reactor.register(stream, id.index(), interest).is_ok() {
                st.registered = true;
                st.current_interest = Some(interest);
            }
        }
        (true, Some(interest)) => {
            if st.current_interest != Some(interest)
                && s.reactor.reregister(stream, id.index(), interest).is_ok()
            {
                st.current_interest = Some(interest);
            }
        }
        (true, None) => {
            let _ = s.reactor.deregister(stream);
            st.registered = false;
            st.current_interest = None;
        }
        (false, None) => {}
    }
}

/// Quiesce a socket's descriptor and mark it closed, returning its event
/// callback for the terminal delivery. `None` when the record is gone.
fn close_internals(s: &mut LoopState, id: HandleId) -> Option<Option<EventCb>> {
    let record = s.registry.lookup(id)?;
    let HandleState::Socket(st) = &mut record.state else { return None };
    if let Some(mut stream) = st.stream.take() {
        if st.registered {
            let _ = s.reactor.deregister(&mut stream);
        }
    }
    st.mark_closed();
    Some(record.bundle.event_cb())
}

/// Terminate a socket with an error-class condition.
///
/// The socket is closed before the callback runs, the condition is the
/// last callback ever delivered on the handle, and the record is
/// destroyed afterwards.
pub(crate) fn fail_socket(id: HandleId, cond: Condition) {
    let Some(event) = with_loop(|s| close_internals(s, id)).ok().flatten() else {
        return;
    };
    tracing::debug!(%cond, "socket terminated");
    deliver_condition(event, &cond);
    let _ = with_loop(|s| s.destroy_handle(id));
}

/// The peer closed its write side: close the socket, deliver `TcpEof`.
fn eof_socket(id: HandleId) {
    let Some(event) = with_loop(|s| close_internals(s, id)).ok().flatten() else {
        return;
    };
    deliver_condition(event, &Condition::TcpEof);
    let _ = with_loop(|s| s.destroy_handle(id));
}

/// Deferred-queue target: a write buffer drained synchronously inside
/// `write_socket_data`, fire the armed write callback on this tick.
pub(crate) fn fire_write_drained(id: HandleId) {
    let callbacks = with_loop(|s| {
        s.registry.lookup(id).and_then(|record| match &record.bundle {
            Bundle::Socket { write: Some(write_cb), event, .. } => {
                Some((write_cb.clone(), event.clone()))
            }
            _ => None,
        })
    })
    .ok()
    .flatten();
    if let Some((write_cb, event)) = callbacks {
        invoke_user(event, move || (write_cb.borrow_mut())(Socket { id }));
    }
}

/// Close any socket whose idle deadline has passed.
pub(crate) fn expire_socket_deadlines(now: Instant) {
    let expired: Vec<HandleId> = with_loop(|s| {
        s.registry
            .iter()
            .filter_map(|record| match &record.state {
                HandleState::Socket(st) if st.deadline_expired(now) => Some(record.id),
                _ => None,
            })
            .collect()
    })
    .unwrap_or_default();
    for id in expired {
        fail_socket(id, Condition::TcpTimeout);
    }
}

fn connect_finished(stream: &TcpStream) -> io::Result<bool> {
    if let Some(err) = stream.take_error()? {
        return Err(err);
    }
    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(false),
        Err(e) => Err(e),
    }
}

enum WriteStep {
    Progress,
    Drained { write_cb: WriteCb, event: Option<EventCb> },
    Failed(Condition),
    CloseFinished,
}

fn handle_writable(id: HandleId) {
    let step = with_loop(|s| {
        let Some(record) = s.registry.lookup(id) else { return None };
        let HandleState::Socket(st) = &mut record.state else { return None };
        if st.phase == SocketPhase::Closed || st.stream.is_none() {
            return None;
        }

        if st.phase == SocketPhase::Connecting {
            let finished = match st.stream.as_ref() {
                Some(stream) => connect_finished(stream),
                None => return None,
            };
            match finished {
                Ok(true) => {
                    st.phase = SocketPhase::Open;
                    st.arm_read_deadline(Instant::now());
                    tracing::debug!("connection established");
                }
                Ok(false) => return Some(WriteStep::Progress),
                Err(e) => return Some(WriteStep::Failed(io_condition(&e))),
            }
        }

        if st.write_enabled || st.phase == SocketPhase::DrainingClose {
            if let Some(stream) = st.stream.as_mut() {
                while !st.write_buf.is_empty() {
                    match stream.write(&st.write_buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            st.write_buf.drain(..n);
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Some(WriteStep::Failed(io_condition(&e))),
                    }
                }
            }
        }
        st.arm_write_deadline(Instant::now());

        if st.write_buf.is_empty() {
            if st.phase == SocketPhase::DrainingClose {
                return Some(WriteStep::CloseFinished);
            }
            if st.drain_armed {
                st.drain_armed = false;
                if let Bundle::Socket { write: Some(write_cb), event, .. } = &record.bundle {
                    return Some(WriteStep::Drained {
                        write_cb: write_cb.clone(),
                        event: event.clone(),
                    });
                }
            }
        }
        Some(WriteStep::Progress)
    })
    .ok()
    .flatten();

    match step {
        Some(WriteStep::Progress) => {
            let _ = with_loop(|s| refresh_interest(s, id));
        }
        Some(WriteStep::Drained { write_cb, event }) => {
            let _ = with_loop(|s| refresh_interest(s, id));
            invoke_user(event, move || (write_cb.borrow_mut())(Socket { id }));
        }
        Some(WriteStep::Failed(cond)) => fail_socket(id, cond),
        Some(WriteStep::CloseFinished) => {
            let _ = with_loop(|s| s.destroy_handle(id));
        }
        None => {}
    }
}

fn handle_readable(id: HandleId) {
    let outcome = with_loop(|s| {
        let Some(record) = s.registry.lookup(id) else { return None };
        let HandleState::Socket(st) = &mut record.state else { return None };
        if st.phase != SocketPhase::Open || !st.read_enabled {
            return None;
        }
        let Some(stream) = st.stream.as_mut() else { return None };

        let mut data = Vec::new();
        let mut eof = false;
        let mut error = None;
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => data.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error = Some(e);
                    break;
                }
            }
        }
        if !data.is_empty() {
            st.arm_read_deadline(Instant::now());
        }
        let callbacks = match &record.bundle {
            Bundle::Socket { read, event, .. } => (read.clone(), event.clone()),
            _ => (None, None),
        };
        Some((data, eof, error, callbacks))
    })
    .ok()
    .flatten();

    let Some((data, eof, error, (read_cb, event))) = outcome else { return };
    if !data.is_empty() {
        if let Some(read_cb) = read_cb {
            invoke_user(event, move || (read_cb.borrow_mut())(Socket { id }, data));
        }
    }
    if let Some(e) = error {
        fail_socket(id, io_condition(&e));
    } else if eof {
        eof_socket(id);
    }
}

/// Trampoline target for socket readiness. Writable is handled first so
/// connect completion is observed before any read delivery.
pub(crate) fn handle_socket_event(id: HandleId, readable: bool, writable: bool) {
    if writable {
        handle_writable(id);
    }
    if readable {
        handle_readable(id);
    }
}

fn defer_fail(id: HandleId, cond: Condition) {
    let _ = with_loop(|s| s.deferred.push_back(Deferred::FailSocket(id, cond)));
}

fn start_connect(id: HandleId, ip: Ipv4Addr, port: u16) {
    let result = with_loop(|s| -> io::Result<()> {
        let Some(record) = s.registry.lookup(id) else { return Ok(()) };
        let HandleState::Socket(st) = &mut record.state else { return Ok(()) };
        if st.phase != SocketPhase::Connecting {
            return Ok(());
        }
        let stream = TcpStream::connect(SocketAddr::from((ip, port)))?;
        st.stream = Some(stream);
        let now = Instant::now();
        st.arm_read_deadline(now);
        st.arm_write_deadline(now);
        Ok(())
    });
    match result {
        Ok(Ok(())) => {
            let _ = with_loop(|s| refresh_interest(s, id));
        }
        Ok(Err(e)) => defer_fail(id, io_condition(&e)),
        Err(_) => {}
    }
}

/// Open a buffered connection to `host:port` and queue `data` for write.
///
/// `host` may be an IPv4 literal (connected immediately) or a hostname
/// (resolved asynchronously first). The returned socket is usable right
/// away; writes buffer until the connection completes. Any
/// connection-level failure closes the socket and is delivered to
/// `event_cb`.
pub fn tcp_send(
    host: &str,
    port: u16,
    data: impl Into<Vec<u8>>,
    read_cb: impl FnMut(Socket, Vec<u8>) + 'static,
    event_cb: impl FnMut(&Condition) + 'static,
    options: TcpOptions,
) -> Result<Socket, LoopError> {
    tcp_send_shared(
        host,
        port,
        data,
        Some(share_read_cb(read_cb)),
        None,
        Some(share_event_cb(event_cb)),
        options,
    )
}

/// `tcp_send` over pre-shared callback handles; the HTTP client uses this
/// to wire its own drivers into the socket bundle.
pub(crate) fn tcp_send_shared(
    host: &str,
    port: u16,
    data: impl Into<Vec<u8>>,
    read: Option<ReadCb>,
    write: Option<WriteCb>,
    event: Option<EventCb>,
    options: TcpOptions,
) -> Result<Socket, LoopError> {
    let data = data.into();
    let id = with_loop(|s| {
        let id = s.registry.allocate(HandleKind::Socket);
        let mut st = SocketState::new();
        st.read_timeout = options.read_timeout;
        st.write_timeout = options.write_timeout;
        st.write_buf = data;
        s.registry.attach(
            id,
            HandleKind::Socket,
            Bundle::Socket { read, write, event },
            HandleState::Socket(st),
        );
        s.outgoing_connections += 1;
        id
    })?;

    match host.parse::<Ipv4Addr>() {
        Ok(ip) => start_connect(id, ip, port),
        Err(_) => {
            crate::dns::dns_lookup(
                host,
                move |addr, _| match addr.parse::<Ipv4Addr>() {
                    Ok(ip) => start_connect(id, ip, port),
                    Err(_) => defer_fail(
                        id,
                        Condition::TcpError {
                            code: -1,
                            msg: format!("resolver returned unusable address: {addr}"),
                        },
                    ),
                },
                move |cond| {
                    defer_fail(
                        id,
                        Condition::TcpError { code: cond.errcode(), msg: cond.errmsg() },
                    );
                },
            )?;
        }
    }
    Ok(Socket { id })
}

/// Append bytes to the socket's write buffer.
///
/// Callbacks supplied in `options` replace the current slots *before*
/// the bytes are queued. A supplied `write_cb` is armed to fire once the
/// buffer next drains; it is not re-armed by the drain itself.
pub fn write_socket_data(
    socket: Socket,
    data: impl Into<Vec<u8>>,
    options: WriteOptions,
) -> Result<(), LoopError> {
    let data = data.into();
    with_loop(|s| {
        let mut failed = None;
        let mut drained = false;
        {
            let Some(record) = s.registry.lookup(socket.id) else {
                return Err(LoopError::SocketClosed);
            };
            let HandleState::Socket(st) = &mut record.state else {
                return Err(LoopError::SocketClosed);
            };
            if matches!(st.phase, SocketPhase::Closed | SocketPhase::DrainingClose) {
                return Err(LoopError::SocketClosed);
            }
            if let Bundle::Socket { read, write, event } = &mut record.bundle {
                if let Some(cb) = options.read_cb {
                    *read = Some(share_read_cb(cb));
                }
                if let Some(cb) = options.write_cb {
                    *write = Some(share_write_cb(cb));
                    st.drain_armed = true;
                }
                if let Some(cb) = options.event_cb {
                    *event = Some(share_event_cb(cb));
                }
            }
            st.write_buf.extend_from_slice(&data);

            // Flush eagerly; an edge-style reactor only reports a write
            // edge after WouldBlock, so waiting for one here could stall.
            if st.phase == SocketPhase::Open && st.write_enabled {
                if let Some(stream) = st.stream.as_mut() {
                    while !st.write_buf.is_empty() {
                        match stream.write(&st.write_buf) {
                            Ok(0) => break,
                            Ok(n) => {
                                st.write_buf.drain(..n);
                            }
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                            Err(e) => {
                                failed = Some(io_condition(&e));
                                break;
                            }
                        }
                    }
                }
            }
            st.arm_write_deadline(Instant::now());
            if failed.is_none() && st.write_buf.is_empty() && st.drain_armed {
                st.drain_armed = false;
                drained = true;
            }
        }
        if let Some(cond) = failed {
            s.deferred.push_back(Deferred::FailSocket(socket.id, cond));
        } else if drained {
            s.deferred.push_back(Deferred::WriteDrained(socket.id));
        } else {
            refresh_interest(s, socket.id);
        }
        Ok(())
    })?
}

/// Arm or clear the per-direction idle timeouts.
///
/// `None` clears the corresponding timer; a duration arms it. An armed
/// direction that stays idle for the interval closes the socket and
/// delivers [`Condition::TcpTimeout`].
pub fn set_socket_timeouts(
    socket: Socket,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
) -> Result<(), LoopError> {
    debug_assert!(read_timeout.map_or(true, |t| !t.is_zero()));
    debug_assert!(write_timeout.map_or(true, |t| !t.is_zero()));
    with_loop(|s| {
        let Some(record) = s.registry.lookup(socket.id) else {
            return Err(LoopError::SocketClosed);
        };
        let HandleState::Socket(st) = &mut record.state else {
            return Err(LoopError::SocketClosed);
        };
        if st.phase == SocketPhase::Closed {
            return Err(LoopError::SocketClosed);
        }
        st.read_timeout = read_timeout;
        st.write_timeout = write_timeout;
        let now = Instant::now();
        st.arm_read_deadline(now);
        st.arm_write_deadline(now);
        Ok(())
    })?
}

fn set_enabled(socket: Socket, read: bool, write: bool, value: bool) -> Result<(), LoopError> {
    with_loop(|s| {
        {
            let Some(record) = s.registry.lookup(socket.id) else {
                return Err(LoopError::SocketClosed);
            };
            let HandleState::Socket(st) = &mut record.state else {
                return Err(LoopError::SocketClosed);
            };
            if st.phase == SocketPhase::Closed {
                return Err(LoopError::SocketClosed);
            }
            let now = Instant::now();
            if read {
                st.read_enabled = value;
                st.arm_read_deadline(now);
            }
            if write {
                st.write_enabled = value;
                st.arm_write_deadline(now);
            }
        }
        refresh_interest(s, socket.id);
        Ok(())
    })?
}

/// Enable monitoring for the selected directions.
pub fn enable_socket(socket: Socket, read: bool, write: bool) -> Result<(), LoopError> {
    set_enabled(socket, read, write, true)
}

/// Disable monitoring for the selected directions. Disabling a direction
/// also suspends its idle timer.
pub fn disable_socket(socket: Socket, read: bool, write: bool) -> Result<(), LoopError> {
    set_enabled(socket, read, write, false)
}

/// Close a socket.
///
/// With unsent bytes in the write buffer the socket drains first, then
/// closes. Closing an already-closed (or already-draining) socket returns
/// [`LoopError::SocketClosed`]; this asymmetry with the idempotent server
/// close is part of the contract.
pub fn close_socket(socket: Socket) -> Result<(), LoopError> {
    enum CloseStep {
        Immediate,
        Draining,
    }
    let step = with_loop(|s| {
        {
            let Some(record) = s.registry.lookup(socket.id) else {
                return Err(LoopError::SocketClosed);
            };
            let HandleState::Socket(st) = &mut record.state else {
                return Err(LoopError::SocketClosed);
            };
            if matches!(st.phase, SocketPhase::Closed | SocketPhase::DrainingClose) {
                return Err(LoopError::SocketClosed);
            }
            if st.write_buf.is_empty() || st.stream.is_none() {
                return Ok(CloseStep::Immediate);
            }
            st.phase = SocketPhase::DrainingClose;
            st.read_enabled = false;
            let now = Instant::now();
            st.arm_read_deadline(now);
            st.arm_write_deadline(now);
        }
        refresh_interest(s, socket.id);
        Ok(CloseStep::Draining)
    })??;
    if let CloseStep::Immediate = step {
        let _ = with_loop(|s| s.destroy_handle(socket.id));
    }
    Ok(())
}

pub(crate) fn bind_listener(ip: Ipv4Addr, port: u16, backlog: i32) -> io::Result<TcpListener> {
    use std::os::unix::io::FromRawFd;

    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let close_on_err = |fd: i32, e: io::Error| {
        unsafe { libc::close(fd) };
        e
    };

    let one: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK);
        libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
    }

    let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = port.to_be();
    sin.sin_addr = libc::in_addr { s_addr: u32::from(ip).to_be() };
    let rc = unsafe {
        libc::bind(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(close_on_err(fd, io::Error::last_os_error()));
    }

    let backlog = if backlog < 0 { DEFAULT_BACKLOG } else { backlog };
    if unsafe { libc::listen(fd, backlog) } != 0 {
        return Err(close_on_err(fd, io::Error::last_os_error()));
    }
    Ok(unsafe { TcpListener::from_raw_fd(fd) })
}

/// Start a TCP server on `bind_addr:port` (`None` binds 0.0.0.0).
///
/// Each accepted connection becomes a [`Socket`] whose callback bundle is
/// seeded with the server's `read_cb` and `event_cb`.
pub fn tcp_server(
    bind_addr: Option<Ipv4Addr>,
    port: u16,
    read_cb: impl FnMut(Socket, Vec<u8>) + 'static,
    event_cb: impl FnMut(&Condition) + 'static,
    options: ServerOptions,
) -> Result<TcpServerHandle, LoopError> {
    let ip = bind_addr.unwrap_or(Ipv4Addr::UNSPECIFIED);
    let mut listener = bind_listener(ip, port, options.backlog)?;
    with_loop(move |s| {
        let id = s.registry.allocate(HandleKind::TcpServer);
        s.reactor.register(&mut listener, id.index(), Interest::READABLE)?;
        s.registry.attach(
            id,
            HandleKind::TcpServer,
            Bundle::TcpServer {
                read: Some(share_read_cb(read_cb)),
                event: Some(share_event_cb(event_cb)),
            },
            HandleState::TcpServer(TcpServerState { listener: Some(listener) }),
        );
        tracing::debug!(%ip, port, "tcp server listening");
        Ok(TcpServerHandle { id })
    })?
}

/// Stop accepting connections. Already-accepted sockets stay alive, and
/// closing again is a no-op.
pub fn close_tcp_server(server: TcpServerHandle) -> Result<(), LoopError> {
    with_loop(|s| {
        let _ = s.destroy_handle(server.id);
    })
}

/// Register an accepted stream as a socket record seeded with the given
/// callbacks.
pub(crate) fn adopt_incoming(
    stream: TcpStream,
    read: Option<ReadCb>,
    write: Option<WriteCb>,
    event: Option<EventCb>,
) -> Result<Socket, LoopError> {
    with_loop(|s| {
        let id = s.registry.allocate(HandleKind::Socket);
        let mut st = SocketState::new();
        st.phase = SocketPhase::Open;
        st.stream = Some(stream);
        s.registry.attach(
            id,
            HandleKind::Socket,
            Bundle::Socket { read, write, event },
            HandleState::Socket(st),
        );
        s.incoming_connections += 1;
        refresh_interest(s, id);
        Socket { id }
    })
}

/// Trampoline target for listener readiness: accept until `WouldBlock`.
pub(crate) fn handle_accept(id: HandleId) {
    loop {
        let next = with_loop(|s| {
            let record = s.registry.lookup(id)?;
            let HandleState::TcpServer(srv) = &mut record.state else { return None };
            let listener = srv.listener.as_ref()?;
            let callbacks = match &record.bundle {
                Bundle::TcpServer { read, event } => (read.clone(), event.clone()),
                _ => (None, None),
            };
            Some((listener.accept(), callbacks))
        })
        .ok()
        .flatten();
        let Some((result, (read, event))) = next else { return };
        match result {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "connection accepted");
                let _ = adopt_incoming(stream, read, None, event);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // The listener stays up; surface the failure.
                deliver_condition(
                    event,
                    &Condition::TcpError {
                        code: e.raw_os_error().unwrap_or(-1),
                        msg: e.to_string(),
                    },
                );
                return;
            }
        }
        if exiting() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::{exit_event_loop, start_event_loop, LoopOptions};
    use crate::timer::{delay, DelayOptions};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    fn run_loop(entry: impl FnOnce() + 'static) {
        // Opt into log output with RUST_LOG; repeat installs are fine.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        start_event_loop(entry, LoopOptions::default()).unwrap();
    }

    #[test]
    fn test_echo_server_round_trip_and_quit() {
        // An echo server that closes the client and shuts the loop down
        // once it sees QUIT; the client must still receive both echoes.
        let received = Rc::new(RefCell::new(Vec::new()));
        let received2 = received.clone();
        run_loop(move || {
            let server = tcp_server(
                Some(Ipv4Addr::LOCALHOST),
                0,
                |sock, bytes| {
                    // Echo first, close second.
                    write_socket_data(sock, bytes.clone(), WriteOptions::default()).unwrap();
                    if bytes.windows(4).any(|w| w == b"QUIT") {
                        close_socket(sock).unwrap();
                        // Give the final echo one tick to reach the
                        // client before tearing the loop down.
                        delay(
                            || {
                                let _ = exit_event_loop();
                            },
                            DelayOptions { time: Some(Duration::from_millis(200)), ..Default::default() },
                        )
                        .unwrap();
                    }
                },
                |_| {},
                ServerOptions::default(),
            )
            .unwrap();
            let port = server.local_addr().unwrap().port();

            let sent_quit = Rc::new(Cell::new(false));
            let received = received2.clone();
            tcp_send(
                "127.0.0.1",
                port,
                "hello",
                move |sock, bytes| {
                    received.borrow_mut().extend_from_slice(&bytes);
                    if !sent_quit.get() && received.borrow().len() >= 5 {
                        sent_quit.set(true);
                        write_socket_data(sock, "QUIT", WriteOptions::default()).unwrap();
                    }
                },
                |_| {},
                TcpOptions::default(),
            )
            .unwrap();
        });
        assert_eq!(&*received.borrow(), b"helloQUIT");
    }

    #[test]
    fn test_bytes_arrive_in_order_without_loss() {
        // Several buffers written from the server side must surface on
        // the client in order and complete.
        let payload: Vec<Vec<u8>> =
            vec![b"alpha".to_vec(), b"beta".to_vec(), b"gamma-delta".to_vec()];
        let expected: Vec<u8> = payload.iter().flatten().copied().collect();
        let total = expected.len();

        let collected = Rc::new(RefCell::new(Vec::new()));
        let collected2 = collected.clone();
        run_loop(move || {
            let payload = payload.clone();
            let server = tcp_server(
                Some(Ipv4Addr::LOCALHOST),
                0,
                move |sock, _bytes| {
                    for part in &payload {
                        write_socket_data(sock, part.clone(), WriteOptions::default()).unwrap();
                    }
                },
                |_| {},
                ServerOptions::default(),
            )
            .unwrap();
            let port = server.local_addr().unwrap().port();

            let collected = collected2.clone();
            tcp_send(
                "127.0.0.1",
                port,
                "go",
                move |sock, bytes| {
                    collected.borrow_mut().extend_from_slice(&bytes);
                    if collected.borrow().len() >= total {
                        close_socket(sock).unwrap();
                        close_tcp_server(server).unwrap();
                        exit_event_loop().unwrap();
                    }
                },
                |_| {},
                TcpOptions::default(),
            )
            .unwrap();
        });
        assert_eq!(*collected.borrow(), expected);
    }

    #[test]
    fn test_write_drain_callback_fires_once() {
        let drains = Rc::new(Cell::new(0));
        let drains2 = drains.clone();
        run_loop(move || {
            let server = tcp_server(
                Some(Ipv4Addr::LOCALHOST),
                0,
                |_, _| {},
                |_| {},
                ServerOptions::default(),
            )
            .unwrap();
            let port = server.local_addr().unwrap().port();

            let drains = drains2.clone();
            let sock = tcp_send("127.0.0.1", port, Vec::new(), |_, _| {}, |_| {}, TcpOptions::default())
                .unwrap();
            write_socket_data(
                sock,
                "payload",
                WriteOptions {
                    write_cb: Some(Box::new(move |sock| {
                        drains.set(drains.get() + 1);
                        // A further write without a fresh write_cb must
                        // not re-fire the drained callback.
                        write_socket_data(sock, "more", WriteOptions::default()).unwrap();
                        delay(
                            || {
                                let _ = exit_event_loop();
                            },
                            DelayOptions { time: Some(Duration::from_millis(100)), ..Default::default() },
                        )
                        .unwrap();
                    })),
                    ..Default::default()
                },
            )
            .unwrap();
        });
        assert_eq!(drains.get(), 1);
    }

    #[test]
    fn test_close_socket_twice_errors() {
        run_loop(|| {
            let server = tcp_server(
                Some(Ipv4Addr::LOCALHOST),
                0,
                |_, _| {},
                |_| {},
                ServerOptions::default(),
            )
            .unwrap();
            let port = server.local_addr().unwrap().port();
            let sock =
                tcp_send("127.0.0.1", port, Vec::new(), |_, _| {}, |_| {}, TcpOptions::default())
                    .unwrap();
            close_socket(sock).unwrap();
            assert!(matches!(close_socket(sock), Err(LoopError::SocketClosed)));
            assert!(matches!(
                write_socket_data(sock, "x", WriteOptions::default()),
                Err(LoopError::SocketClosed)
            ));
            assert!(matches!(
                set_socket_timeouts(sock, Some(Duration::from_secs(1)), None),
                Err(LoopError::SocketClosed)
            ));
            close_tcp_server(server).unwrap();
            exit_event_loop().unwrap();
        });
    }

    #[test]
    fn test_close_tcp_server_is_idempotent() {
        run_loop(|| {
            let server = tcp_server(
                Some(Ipv4Addr::LOCALHOST),
                0,
                |_, _| {},
                |_| {},
                ServerOptions::default(),
            )
            .unwrap();
            close_tcp_server(server).unwrap();
            close_tcp_server(server).unwrap();
        });
    }

    #[test]
    fn test_connection_refused_reaches_event_cb() {
        // Bind then immediately drop a listener to get a port with
        // nothing behind it.
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let seen = Rc::new(RefCell::new(None));
        let seen2 = seen.clone();
        run_loop(move || {
            let seen = seen2.clone();
            tcp_send(
                "127.0.0.1",
                port,
                "x",
                |_, _| panic!("no data expected"),
                move |cond| *seen.borrow_mut() = Some(cond.clone()),
                TcpOptions::default(),
            )
            .unwrap();
        });
        assert_eq!(seen.borrow_mut().take(), Some(Condition::TcpRefused));
    }

    #[test]
    fn test_read_timeout_closes_socket() {
        let seen = Rc::new(RefCell::new(None));
        let seen2 = seen.clone();
        let server_handle = Rc::new(Cell::new(None));
        run_loop(move || {
            // A server that accepts and stays silent.
            let server = tcp_server(
                Some(Ipv4Addr::LOCALHOST),
                0,
                |_, _| {},
                |_| {},
                ServerOptions::default(),
            )
            .unwrap();
            server_handle.set(Some(server));
            let port = server.local_addr().unwrap().port();

            let seen = seen2.clone();
            let server_handle = server_handle.clone();
            tcp_send(
                "127.0.0.1",
                port,
                Vec::new(),
                |_, _| {},
                move |cond| {
                    *seen.borrow_mut() = Some(cond.clone());
                    if let Some(server) = server_handle.get() {
                        let _ = close_tcp_server(server);
                    }
                },
                TcpOptions { read_timeout: Some(Duration::from_millis(80)), write_timeout: None },
            )
            .unwrap();
        });
        assert_eq!(seen.borrow_mut().take(), Some(Condition::TcpTimeout));
    }

    #[test]
    fn test_no_callback_after_terminal_condition() {
        // After the terminal event the socket's read callback must never
        // fire again.
        let after_terminal = Rc::new(Cell::new(false));
        let terminal_seen = Rc::new(Cell::new(false));
        {
            let after_terminal = after_terminal.clone();
            let terminal_seen = terminal_seen.clone();
            let port = {
                let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
                probe.local_addr().unwrap().port()
            };
            run_loop(move || {
                let after_terminal = after_terminal.clone();
                let terminal_seen = terminal_seen.clone();
                let terminal_flag = terminal_seen.clone();
                tcp_send(
                    "127.0.0.1",
                    port,
                    "x",
                    move |_, _| {
                        if terminal_flag.get() {
                            after_terminal.set(true);
                        }
                    },
                    move |_| terminal_seen.set(true),
                    TcpOptions::default(),
                )
                .unwrap();
            });
        }
        assert!(terminal_seen.get());
        assert!(!after_terminal.get());
    }

    #[test]
    fn test_hostname_connect_via_resolver() {
        let got = Rc::new(RefCell::new(Vec::new()));
        let got2 = got.clone();
        run_loop(move || {
            let server = tcp_server(
                Some(Ipv4Addr::LOCALHOST),
                0,
                |sock, _| {
                    write_socket_data(sock, "pong", WriteOptions::default()).unwrap();
                },
                |_| {},
                ServerOptions::default(),
            )
            .unwrap();
            let port = server.local_addr().unwrap().port();

            let got = got2.clone();
            tcp_send(
                "localhost",
                port,
                "ping",
                move |sock, bytes| {
                    got.borrow_mut().extend_from_slice(&bytes);
                    close_socket(sock).unwrap();
                    close_tcp_server(server).unwrap();
                    exit_event_loop().unwrap();
                },
                |cond| panic!("unexpected condition: {cond}"),
                TcpOptions::default(),
            )
            .unwrap();
        });
        assert_eq!(&*got.borrow(), b"pong");
    }
}

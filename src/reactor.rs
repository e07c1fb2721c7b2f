//! The readiness engine underneath the event loop.
//!
//! One `Reactor` is owned by each loop thread. It wraps a `mio::Poll`
//! instance and folds three event sources into a single wait:
//!
//! - socket and listener readiness, registered under tokens derived from
//!   handle arena indices;
//! - one-shot timer deadlines, kept in a min-heap that feeds the poll
//!   timeout;
//! - process signals, forwarded through a nonblocking self-pipe whose read
//!   end is registered with the poll (the write side is the only thing the
//!   signal handler touches).
//!
//! A `mio::Waker` lets helper threads (the DNS workers) interrupt the wait
//! after pushing a completion onto the loop's channel.

use mio::event::Source;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::POLL_EVENTS_CAPACITY;
use crate::registry::HandleId;

/// Token reserved for the cross-thread waker.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX - 1);
/// Token reserved for the signal self-pipe's read end.
pub(crate) const SIGNAL_TOKEN: Token = Token(usize::MAX - 2);

/// Snapshot of one readiness event, decoupled from the `mio::Events`
/// buffer so dispatch can run without borrowing the reactor.
#[derive(Debug, Clone, Copy)]
pub struct PollEvent {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
}

/// A scheduled one-shot timer. Ordered so the earliest deadline surfaces
/// first out of the `BinaryHeap`.
pub struct TimerEntry {
    pub deadline: Instant,
    pub id: HandleId,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the heap pops the earliest deadline first.
        other.deadline.cmp(&self.deadline)
    }
}

pub struct Reactor {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    timers: BinaryHeap<TimerEntry>,
    signal_pipe: Option<(RawFd, RawFd)>,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(POLL_EVENTS_CAPACITY),
            waker,
            timers: BinaryHeap::new(),
            signal_pipe: None,
        })
    }

    /// Handle for helper threads to interrupt the poll wait.
    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    pub fn register(&mut self, source: &mut impl Source, index: u32, interest: Interest) -> io::Result<()> {
        self.poll.registry().register(source, Token(index as usize), interest)
    }

    pub fn reregister(&mut self, source: &mut impl Source, index: u32, interest: Interest) -> io::Result<()> {
        self.poll.registry().reregister(source, Token(index as usize), interest)
    }

    pub fn deregister(&mut self, source: &mut impl Source) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Schedule a one-shot timer wakeup for the given handle.
    ///
    /// Entries are not removed on handle destruction; dispatch revalidates
    /// the id against the arena, so a stale entry fires into nothing.
    pub fn schedule(&mut self, deadline: Instant, id: HandleId) {
        self.timers.push(TimerEntry { deadline, id });
    }

    /// Earliest pending timer deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.peek().map(|e| e.deadline)
    }

    /// Pop every timer entry due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Vec<HandleId> {
        let mut due = Vec::new();
        while self.timers.peek().is_some_and(|e| e.deadline <= now) {
            if let Some(entry) = self.timers.pop() {
                due.push(entry.id);
            }
        }
        due
    }

    /// Number of scheduled (possibly stale) timer entries.
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Create the signal self-pipe on first use and return its write end.
    ///
    /// The read end is registered with the poll under [`SIGNAL_TOKEN`];
    /// both ends are nonblocking so a burst of signals can never wedge the
    /// handler or the drain loop.
    pub fn ensure_signal_pipe(&mut self) -> io::Result<RawFd> {
        if let Some((_, wr)) = self.signal_pipe {
            return Ok(wr);
        }
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds {
            unsafe {
                libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK);
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
        let (rd, wr) = (fds[0], fds[1]);
        self.poll
            .registry()
            .register(&mut SourceFd(&rd), SIGNAL_TOKEN, Interest::READABLE)?;
        self.signal_pipe = Some((rd, wr));
        Ok(wr)
    }

    /// Drain pending signal numbers from the self-pipe.
    pub fn drain_signal_pipe(&mut self) -> Vec<i32> {
        let Some((rd, _)) = self.signal_pipe else {
            return Vec::new();
        };
        let mut signos = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(rd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n <= 0 {
                break;
            }
            signos.extend(buf[..n as usize].iter().map(|b| *b as i32));
        }
        signos
    }

    /// Wait for readiness, returning a snapshot of the observed events.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<PollEvent>> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }
        Ok(self
            .events
            .iter()
            .map(|e| PollEvent {
                token: e.token(),
                readable: e.is_readable() || e.is_read_closed(),
                writable: e.is_writable() || e.is_write_closed(),
            })
            .collect())
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        if let Some((rd, wr)) = self.signal_pipe.take() {
            unsafe {
                libc::close(rd);
                libc::close(wr);
            }
        }
    }
}

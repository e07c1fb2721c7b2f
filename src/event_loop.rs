//! The event-loop supervisor.
//!
//! This module owns the thread-local loop state and the dispatch
//! trampoline that connects reactor wakeups back to user callbacks. The
//! control flow is strictly single-threaded and callback-oriented: user
//! code runs inside the entry closure passed to [`start_event_loop`],
//! schedules work through the operation primitives (timers, signals, DNS,
//! TCP, HTTP), and the loop runs until no user-visible handle remains or
//! [`exit_event_loop`] is called.
//!
//! ## Dispatch discipline
//!
//! Loop state lives in a `thread_local` `RefCell`. The borrow is never
//! held across a user callback: every dispatch path first borrows the
//! state to snapshot what it needs (cloned callback handles, read bytes,
//! record ids), releases the borrow, invokes the callback, and re-borrows
//! for post-processing. Stale ids simply miss in the registry, so a
//! callback destroying handles mid-dispatch is safe.
//!
//! ## Error trapping
//!
//! When `catch_app_errors` is set, every user callback is run under
//! `std::panic::catch_unwind`; a trapped panic becomes
//! [`Condition::App`] and is routed to the nearest event callback, or to
//! the loop's default event callback when the operation has none. Without
//! it, panics unwind out of [`start_event_loop`] after teardown.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use mio::Token;

use crate::condition::Condition;
use crate::dns::DnsOutcome;
use crate::error::LoopError;
use crate::reactor::{Reactor, SIGNAL_TOKEN, WAKER_TOKEN};
use crate::registry::{Bundle, EventCb, HandleId, HandleKind, HandleState, Record, Registry};

thread_local! {
    static CURRENT: RefCell<Option<LoopState>> = const { RefCell::new(None) };
}

/// Options accepted by [`start_event_loop`].
///
/// All callbacks are optional; `catch_app_errors` defaults to off, in
/// which case an error raised from a user callback unwinds out of the
/// loop and terminates it.
#[derive(Default)]
pub struct LoopOptions {
    /// Invoked when the reactor itself fails in a way that would
    /// otherwise abort; the loop exits after the callback returns.
    pub fatal_cb: Option<Box<dyn FnMut(&Condition)>>,
    /// Receives reactor-level log lines in addition to `tracing` output.
    pub logger_cb: Option<Box<dyn FnMut(&str)>>,
    /// Receives conditions for operations that have no event callback of
    /// their own. The built-in default re-raises error-class conditions
    /// and silently absorbs info-class ones.
    pub default_event_cb: Option<Box<dyn FnMut(&Condition)>>,
    /// Route errors raised inside user callbacks to event callbacks
    /// instead of letting them unwind the loop.
    pub catch_app_errors: bool,
}

/// Work queued by operations for delivery on the next tick rather than
/// synchronously inside the calling operation.
pub(crate) enum Deferred {
    /// A write buffer drained synchronously; fire the armed write callback.
    WriteDrained(HandleId),
    /// Terminate a socket with the given condition.
    FailSocket(HandleId, Condition),
}

pub(crate) struct LoopState {
    pub registry: Registry,
    pub reactor: Reactor,
    /// The supervisor's own bookkeeping record (see [`stats`]).
    pub loop_id: HandleId,
    pub catch_app_errors: bool,
    pub exit: bool,
    logger: Option<Box<dyn FnMut(&str)>>,
    /// signo -> live signal-handler record.
    pub signal_handlers: HashMap<i32, HandleId>,
    pub dns_tx: Sender<DnsOutcome>,
    pub dns_rx: Receiver<DnsOutcome>,
    pub deferred: VecDeque<Deferred>,
    pub incoming_connections: u64,
    pub outgoing_connections: u64,
}

impl LoopState {
    fn new(options: LoopOptions) -> std::io::Result<Self> {
        let reactor = Reactor::new()?;
        let (dns_tx, dns_rx) = crossbeam_channel::unbounded();
        let mut registry = Registry::new();

        let default_event: EventCb = match options.default_event_cb {
            Some(f) => Rc::new(RefCell::new(f)),
            None => Rc::new(RefCell::new(default_event_handler)),
        };
        let fatal: EventCb = match options.fatal_cb {
            Some(f) => Rc::new(RefCell::new(f)),
            None => Rc::new(RefCell::new(|cond: &Condition| {
                tracing::error!(%cond, "fatal reactor failure");
            })),
        };

        let loop_id = registry.allocate(HandleKind::Loop);
        registry.attach(
            loop_id,
            HandleKind::Loop,
            Bundle::Loop { default_event, fatal },
            HandleState::Loop,
        );

        Ok(Self {
            registry,
            reactor,
            loop_id,
            catch_app_errors: options.catch_app_errors,
            exit: false,
            logger: options.logger_cb,
            signal_handlers: HashMap::new(),
            dns_tx,
            dns_rx,
            deferred: VecDeque::new(),
            incoming_connections: 0,
            outgoing_connections: 0,
        })
    }

    /// Emit a reactor-level log line to `tracing` and the user logger.
    pub fn log(&mut self, line: &str) {
        tracing::debug!("{line}");
        if let Some(logger) = self.logger.as_mut() {
            logger(line);
        }
    }

    /// The loop's default event callback.
    pub fn default_event_cb(&mut self) -> Option<EventCb> {
        match &self.registry.lookup(self.loop_id)?.bundle {
            Bundle::Loop { default_event, .. } => Some(default_event.clone()),
            _ => None,
        }
    }

    fn fatal_cb(&mut self) -> Option<EventCb> {
        match &self.registry.lookup(self.loop_id)?.bundle {
            Bundle::Loop { fatal, .. } => Some(fatal.clone()),
            _ => None,
        }
    }

    /// Release the reactor resources held by a record, then remove it.
    ///
    /// Resources are quiesced before the record disappears so a wakeup
    /// already in flight finds a stale id rather than a half-dead record.
    pub fn destroy_handle(&mut self, id: HandleId) -> Option<Record> {
        if let Some(record) = self.registry.lookup(id) {
            match &mut record.state {
                HandleState::Socket(sock) => {
                    if let Some(mut stream) = sock.stream.take() {
                        if sock.registered {
                            let _ = self.reactor.deregister(&mut stream);
                        }
                    }
                    sock.mark_closed();
                }
                HandleState::TcpServer(srv) => {
                    if let Some(mut listener) = srv.listener.take() {
                        let _ = self.reactor.deregister(&mut listener);
                    }
                }
                HandleState::HttpServer(srv) => {
                    if let Some(mut listener) = srv.listener.take() {
                        let _ = self.reactor.deregister(&mut listener);
                    }
                }
                HandleState::Signal(sig) => sig.restore(),
                _ => {}
            }
        }
        let record = self.registry.destroy(id)?;
        if let HandleState::Signal(sig) = &record.state {
            self.signal_handlers.remove(&sig.signo);
        }
        Some(record)
    }

    /// Timeout for the next poll: zero when deferred work is queued,
    /// otherwise the distance to the nearest timer or socket deadline.
    fn poll_timeout(&mut self) -> Option<Duration> {
        if !self.deferred.is_empty() {
            return Some(Duration::ZERO);
        }
        let mut next = self.reactor.next_deadline();
        for record in self.registry.iter() {
            if let HandleState::Socket(sock) = &record.state {
                for deadline in [sock.read_deadline, sock.write_deadline].into_iter().flatten() {
                    next = Some(next.map_or(deadline, |n: Instant| n.min(deadline)));
                }
            }
        }
        next.map(|t| t.saturating_duration_since(Instant::now()))
    }
}

/// Run `f` against the current thread's loop state.
///
/// Callers must not invoke user callbacks inside `f`; snapshot what the
/// callback needs, let the borrow end, then call it.
pub(crate) fn with_loop<R>(f: impl FnOnce(&mut LoopState) -> R) -> Result<R, LoopError> {
    CURRENT.with(|current| match current.borrow_mut().as_mut() {
        Some(state) => Ok(f(state)),
        None => Err(LoopError::NoLoop),
    })
}

/// True when no loop is running or an exit was requested; dispatch loops
/// use this to stop delivering queued events after `exit_event_loop`.
pub(crate) fn exiting() -> bool {
    with_loop(|s| s.exit).unwrap_or(true)
}

/// The built-in default event callback: re-raise errors, absorb info.
fn default_event_handler(cond: &Condition) {
    if cond.is_error() {
        panic!("unhandled condition: {cond}");
    }
    tracing::debug!(%cond, "absorbed condition");
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unrecognized panic payload".to_string()
    }
}

/// Invoke a user callback under the loop's trapping policy.
///
/// `fallback` is the event callback of the operation whose callback is
/// being invoked; a trapped panic is delivered there, or to the default
/// event callback when `None`.
pub(crate) fn invoke_user(fallback: Option<EventCb>, f: impl FnOnce()) {
    let catch = with_loop(|s| s.catch_app_errors).unwrap_or(false);
    if !catch {
        f();
        return;
    }
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        let cond = Condition::App { msg: panic_message(payload) };
        tracing::warn!(%cond, "trapped error from user callback");
        route_condition(fallback, &cond);
    }
}

/// Deliver a condition to the given event callback, falling back to the
/// loop's default event callback. The delivery itself is not re-trapped;
/// a panic here unwinds the loop by design of the default handler.
pub(crate) fn route_condition(event_cb: Option<EventCb>, cond: &Condition) {
    let cb = event_cb.or_else(|| with_loop(|s| s.default_event_cb()).ok().flatten());
    if let Some(cb) = cb {
        (cb.borrow_mut())(cond);
    }
}

/// Deliver a condition originating on a handle: its own event callback if
/// present, the default event callback otherwise. Panics inside the
/// handler are trapped and forwarded to the default callback.
pub(crate) fn deliver_condition(event_cb: Option<EventCb>, cond: &Condition) {
    match event_cb {
        Some(cb) => invoke_user(None, {
            let cond = cond.clone();
            move || (cb.borrow_mut())(&cond)
        }),
        None => route_condition(None, cond),
    }
}

/// Observability counters for the running loop.
///
/// The supervisor itself occupies one record in the data registry and two
/// slots in the function registry (the default event callback and the
/// fatal callback); external tooling asserts on totals that include this
/// bookkeeping. Three pending timers therefore report
/// `data_registry_count == 4` and `fn_registry_count == 5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Connections accepted by TCP and HTTP servers, cumulative.
    pub incoming_connections: u64,
    /// Connections initiated by `tcp_send` and the HTTP client, cumulative.
    pub outgoing_connections: u64,
    /// DNS queries currently in flight.
    pub open_dns_queries: u64,
    /// Live records in the data registry.
    pub data_registry_count: u64,
    /// Occupied callback slots in the function registry.
    pub fn_registry_count: u64,
    /// Handles allocated since the loop started, cumulative.
    pub handles_allocated: u64,
    /// Handles destroyed since the loop started, cumulative.
    pub handles_destroyed: u64,
}

impl Stats {
    /// The counters as an ordered key/value sequence.
    pub fn as_pairs(&self) -> [(&'static str, u64); 7] {
        [
            ("incoming-connections", self.incoming_connections),
            ("outgoing-connections", self.outgoing_connections),
            ("open-dns-queries", self.open_dns_queries),
            ("data-registry-count", self.data_registry_count),
            ("fn-registry-count", self.fn_registry_count),
            ("handles-allocated", self.handles_allocated),
            ("handles-destroyed", self.handles_destroyed),
        ]
    }
}

/// Snapshot the running loop's counters.
pub fn stats() -> Result<Stats, LoopError> {
    with_loop(|s| Stats {
        incoming_connections: s.incoming_connections,
        outgoing_connections: s.outgoing_connections,
        open_dns_queries: s.registry.ids_of_kind(HandleKind::Dns).len() as u64,
        data_registry_count: s.registry.data_count() as u64,
        fn_registry_count: s.registry.fn_count() as u64,
        handles_allocated: s.registry.allocations(),
        handles_destroyed: s.registry.destructions(),
    })
}

/// Request immediate loop termination.
///
/// The callback currently executing completes, queued events are dropped,
/// and every outstanding handle is force-destroyed during teardown.
pub fn exit_event_loop() -> Result<(), LoopError> {
    with_loop(|s| {
        s.exit = true;
        tracing::debug!("loop exit requested");
    })
}

/// Tears the loop down when `start_event_loop` returns or unwinds.
struct TeardownGuard;

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        let state = CURRENT.with(|current| current.borrow_mut().take());
        if let Some(mut state) = state {
            let ids: Vec<HandleId> = state.registry.iter().map(|r| r.id).collect();
            for id in ids {
                state.destroy_handle(id);
            }
            tracing::debug!(
                allocated = state.registry.allocations(),
                destroyed = state.registry.destructions(),
                "loop teardown complete"
            );
        }
    }
}

/// Start an event loop on the current thread and block until it drains.
///
/// `entry` runs inside the loop and typically schedules the initial work.
/// The loop returns when only the supervisor's own record remains in the
/// registry, or as soon as [`exit_event_loop`] is called. Starting a loop
/// while one is already running on this thread fails with
/// [`LoopError::LoopActive`].
pub fn start_event_loop<F: FnOnce()>(entry: F, options: LoopOptions) -> Result<(), LoopError> {
    if CURRENT.with(|current| current.borrow().is_some()) {
        return Err(LoopError::LoopActive);
    }
    let state = LoopState::new(options)?;
    CURRENT.with(|current| *current.borrow_mut() = Some(state));
    let _guard = TeardownGuard;

    tracing::debug!("event loop started");
    invoke_user(None, entry);
    run()
}

fn run() -> Result<(), LoopError> {
    loop {
        let (exit, live) = with_loop(|s| (s.exit, s.registry.data_count()))?;
        if exit || live <= 1 {
            break;
        }

        let deferred: Vec<Deferred> = with_loop(|s| s.deferred.drain(..).collect())?;
        for item in deferred {
            if exiting() {
                break;
            }
            match item {
                Deferred::WriteDrained(id) => crate::tcp::fire_write_drained(id),
                Deferred::FailSocket(id, cond) => crate::tcp::fail_socket(id, cond),
            }
        }
        if exiting() {
            break;
        }

        let timeout = with_loop(|s| s.poll_timeout())?;
        let events = match with_loop(|s| s.reactor.poll(timeout))? {
            Ok(events) => events,
            Err(e) => {
                let cond = Condition::App { msg: format!("reactor poll failed: {e}") };
                let fatal = with_loop(|s| {
                    s.log(&format!("reactor poll failed: {e}"));
                    s.fatal_cb()
                })?;
                if let Some(cb) = fatal {
                    (cb.borrow_mut())(&cond);
                }
                break;
            }
        };

        for event in events {
            if exiting() {
                break;
            }
            match event.token {
                WAKER_TOKEN => {}
                SIGNAL_TOKEN => {
                    let signos = with_loop(|s| s.reactor.drain_signal_pipe())?;
                    for signo in signos {
                        if exiting() {
                            break;
                        }
                        crate::signal::dispatch_signal(signo);
                    }
                }
                Token(index) => dispatch_io(index as u32, event.readable, event.writable),
            }
        }

        let now = Instant::now();
        let due = with_loop(|s| s.reactor.pop_due(now))?;
        for id in due {
            if exiting() {
                break;
            }
            crate::timer::fire_timer(id);
        }

        let outcomes: Vec<DnsOutcome> = with_loop(|s| s.dns_rx.try_iter().collect())?;
        for outcome in outcomes {
            if exiting() {
                break;
            }
            crate::dns::complete_lookup(outcome);
        }

        crate::tcp::expire_socket_deadlines(Instant::now());
    }
    Ok(())
}

/// Route an I/O readiness event to the handler for the record's kind.
fn dispatch_io(index: u32, readable: bool, writable: bool) {
    let kind = with_loop(|s| s.registry.lookup_index(index).map(|r| (r.id, r.kind)))
        .ok()
        .flatten();
    // A stale wakeup for a destroyed record is silently dropped.
    let Some((id, kind)) = kind else { return };
    match kind {
        HandleKind::Socket => crate::tcp::handle_socket_event(id, readable, writable),
        HandleKind::TcpServer => crate::tcp::handle_accept(id),
        HandleKind::HttpServer => crate::http::handle_accept(id),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::{delay, DelayOptions};
    use std::cell::Cell;
    use std::rc::Rc;
    use std::time::Duration;

    #[test]
    fn test_loop_starts_and_exits_naturally() {
        // With nothing scheduled the loop drains on its first tick; the
        // supervisor record is the only one ever live.
        let started = Rc::new(Cell::new(false));
        let observed = Rc::new(Cell::new(None));
        {
            let started = started.clone();
            let observed = observed.clone();
            start_event_loop(
                move || {
                    started.set(true);
                    observed.set(Some(stats().unwrap()));
                },
                LoopOptions::default(),
            )
            .unwrap();
        }
        assert!(started.get());
        // Inside the loop only the supervisor's own record exists.
        let stats = observed.get().unwrap();
        assert_eq!(stats.data_registry_count, 1);
        assert_eq!(stats.fn_registry_count, 2);
        assert_eq!(stats.handles_allocated, 1);
        assert_eq!(stats.handles_destroyed, 0);
    }

    #[test]
    fn test_forced_exit_preempts_timers() {
        // A pending timer never fires once exit has been requested.
        let fired = Rc::new(Cell::new(false));
        let fired2 = fired.clone();
        let begin = std::time::Instant::now();
        start_event_loop(
            move || {
                let fired = fired2.clone();
                delay(move || fired.set(true), DelayOptions {
                    time: Some(Duration::from_secs(1)),
                    ..Default::default()
                })
                .unwrap();
                exit_event_loop().unwrap();
            },
            LoopOptions::default(),
        )
        .unwrap();
        assert!(!fired.get());
        assert!(begin.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_trapped_entry_error_reaches_default_event_cb() {
        // With trapping on, a panic in the entry closure is captured by
        // the default event callback instead of unwinding.
        let captured: Rc<RefCell<Option<Condition>>> = Rc::new(RefCell::new(None));
        let captured2 = captured.clone();
        start_event_loop(
            || panic!("Test"),
            LoopOptions {
                catch_app_errors: true,
                default_event_cb: Some(Box::new(move |cond| {
                    *captured2.borrow_mut() = Some(cond.clone());
                })),
                ..Default::default()
            },
        )
        .unwrap();
        let cond = captured.borrow_mut().take().unwrap();
        assert!(cond.is_error());
        assert_eq!(cond, Condition::App { msg: "Test".into() });
    }

    #[test]
    fn test_registry_accounting_with_three_timers() {
        // Three pending timers on top of the supervisor's fixed
        // bookkeeping: one data entry and two callback slots.
        let observed = Rc::new(Cell::new(None));
        let observed2 = observed.clone();
        start_event_loop(
            move || {
                for _ in 0..3 {
                    delay(|| {}, DelayOptions {
                        time: Some(Duration::from_secs(2)),
                        ..Default::default()
                    })
                    .unwrap();
                }
                observed2.set(Some(stats().unwrap()));
                exit_event_loop().unwrap();
            },
            LoopOptions::default(),
        )
        .unwrap();
        let stats = observed.get().unwrap();
        assert_eq!(stats.data_registry_count, 4);
        assert_eq!(stats.fn_registry_count, 5);
    }

    #[test]
    fn test_nested_loop_rejected() {
        let result = Rc::new(RefCell::new(None));
        let result2 = result.clone();
        start_event_loop(
            move || {
                *result2.borrow_mut() = Some(start_event_loop(|| {}, LoopOptions::default()));
            },
            LoopOptions::default(),
        )
        .unwrap();
        assert!(matches!(
            result.borrow_mut().take(),
            Some(Err(LoopError::LoopActive))
        ));
    }

    #[test]
    fn test_untrapped_error_unwinds_the_loop() {
        let result = std::panic::catch_unwind(|| {
            start_event_loop(|| panic!("boom"), LoopOptions::default())
        });
        assert!(result.is_err());
        // The thread-local is cleared, so a fresh loop can start.
        start_event_loop(|| {}, LoopOptions::default()).unwrap();
    }

    #[test]
    fn test_stats_pairs_ordering() {
        let pairs = Rc::new(RefCell::new(Vec::new()));
        let pairs2 = pairs.clone();
        start_event_loop(
            move || {
                pairs2.borrow_mut().extend(stats().unwrap().as_pairs());
            },
            LoopOptions::default(),
        )
        .unwrap();
        let keys: Vec<&str> = pairs.borrow().iter().map(|(k, _)| *k).collect();
        assert_eq!(
            keys,
            [
                "incoming-connections",
                "outgoing-connections",
                "open-dns-queries",
                "data-registry-count",
                "fn-registry-count",
                "handles-allocated",
                "handles-destroyed",
            ]
        );
    }

    #[test]
    fn test_stats_outside_loop_fails() {
        assert!(matches!(stats(), Err(LoopError::NoLoop)));
        assert!(matches!(exit_event_loop(), Err(LoopError::NoLoop)));
    }
}

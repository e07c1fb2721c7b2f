//! Signal handling
//!
//! This module overlays reactor signal events on top of the process-level
//! signal disposition. Installing a handler records the prior
//! `sigaction` for the signal and replaces it with a minimal
//! async-signal-safe handler that writes the signal number down the
//! loop's self-pipe; the loop drains the pipe on its next tick and
//! dispatches the user callback. Freeing the handler restores the
//! recorded disposition exactly, so after install/free the process
//! observes the same `sigaction` it started with.
//!
//! Signal disposition is host-global state: at most one handler record
//! may exist per signal number, enforced per loop.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::condition::Condition;
use crate::error::LoopError;
use crate::event_loop::{invoke_user, with_loop};
use crate::registry::{Bundle, EventCb, HandleKind, HandleState};

/// Highest signal number the forwarder supports (Linux real-time signals
/// end at 64).
const MAX_SIGNO: usize = 64;

/// Per-signo write end of the owning loop's self-pipe; -1 when no handler
/// is installed. This is the only state the signal handler reads.
static PIPE_WRITERS: [AtomicI32; MAX_SIGNO + 1] =
    [const { AtomicI32::new(-1) }; MAX_SIGNO + 1];

/// The installed process-level handler: forward the signal number to the
/// event loop. Restricted to async-signal-safe operations.
extern "C" fn forward_signal(signo: libc::c_int) {
    if !(0..=MAX_SIGNO as i32).contains(&signo) {
        return;
    }
    let fd = PIPE_WRITERS[signo as usize].load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = [signo as u8];
        unsafe {
            libc::write(fd, byte.as_ptr() as *const libc::c_void, 1);
        }
    }
}

/// State carried by a live signal-handler record: the signal number and
/// the disposition to restore on free.
pub struct SignalState {
    pub(crate) signo: i32,
    saved: libc::sigaction,
}

impl SignalState {
    /// Put the process disposition back exactly as it was before install.
    pub(crate) fn restore(&self) {
        PIPE_WRITERS[self.signo as usize].store(-1, Ordering::Relaxed);
        unsafe {
            libc::sigaction(self.signo, &self.saved, std::ptr::null_mut());
        }
        tracing::debug!(signo = self.signo, "signal disposition restored");
    }
}

/// Options accepted by [`signal_handler`].
#[derive(Default)]
pub struct SignalOptions {
    /// Receives errors trapped from the signal callback.
    pub event_cb: Option<Box<dyn FnMut(&Condition)>>,
}

fn install_disposition(signo: i32, pipe_wr: i32) -> io::Result<libc::sigaction> {
    if !(1..=MAX_SIGNO as i32).contains(&signo) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("signal number {signo} out of range"),
        ));
    }
    // The forwarder reads the fd, so publish it before the handler can run.
    PIPE_WRITERS[signo as usize].store(pipe_wr, Ordering::Relaxed);

    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = forward_signal as usize;
    action.sa_flags = libc::SA_RESTART;
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
    }
    let mut saved: libc::sigaction = unsafe { std::mem::zeroed() };
    if unsafe { libc::sigaction(signo, &action, &mut saved) } != 0 {
        PIPE_WRITERS[signo as usize].store(-1, Ordering::Relaxed);
        return Err(io::Error::last_os_error());
    }
    Ok(saved)
}

/// Install a handler for `signo`.
///
/// `signal_cb(signo)` runs on the loop thread for every delivery of the
/// signal until the handler is freed. The prior process disposition is
/// saved in the handle record and restored by [`free_signal_handler`],
/// [`clear_signal_handlers`], or loop teardown. Installing a second
/// handler for the same signal fails with [`LoopError::SignalExists`].
pub fn signal_handler(
    signo: i32,
    signal_cb: impl FnMut(i32) + 'static,
    options: SignalOptions,
) -> Result<(), LoopError> {
    with_loop(|s| {
        if s.signal_handlers.contains_key(&signo) {
            return Err(LoopError::SignalExists(signo));
        }
        let pipe_wr = s.reactor.ensure_signal_pipe()?;
        let saved = install_disposition(signo, pipe_wr)?;

        let id = s.registry.allocate(HandleKind::Signal);
        let event: Option<EventCb> =
            options.event_cb.map(|cb| Rc::new(RefCell::new(cb)) as EventCb);
        s.registry.attach(
            id,
            HandleKind::Signal,
            Bundle::Signal { signal: Rc::new(RefCell::new(signal_cb)), event },
            HandleState::Signal(SignalState { signo, saved }),
        );
        s.signal_handlers.insert(signo, id);
        tracing::debug!(signo, "signal handler installed");
        Ok(())
    })?
}

/// Free the handler for `signo`, restoring the prior disposition.
///
/// Freeing a signal that has no handler is a no-op.
pub fn free_signal_handler(signo: i32) -> Result<(), LoopError> {
    with_loop(|s| {
        if let Some(id) = s.signal_handlers.get(&signo).copied() {
            s.destroy_handle(id);
        }
    })
}

/// Free every installed signal handler.
pub fn clear_signal_handlers() -> Result<(), LoopError> {
    with_loop(|s| {
        let ids: Vec<_> = s.signal_handlers.values().copied().collect();
        for id in ids {
            s.destroy_handle(id);
        }
    })
}

/// Trampoline target for a signal number drained from the self-pipe.
pub(crate) fn dispatch_signal(signo: i32) {
    let callbacks = with_loop(|s| {
        let id = s.signal_handlers.get(&signo).copied()?;
        match &s.registry.lookup(id)?.bundle {
            Bundle::Signal { signal, event } => Some((signal.clone(), event.clone())),
            _ => None,
        }
    })
    .ok()
    .flatten();
    let Some((signal_cb, event)) = callbacks else { return };
    invoke_user(event, move || (signal_cb.borrow_mut())(signo));
}

//! One-shot timers.

use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::error::LoopError;
use crate::event_loop::{invoke_user, with_loop};
use crate::registry::{Bundle, EventCb, HandleId, HandleKind, HandleState};

/// Options accepted by [`delay`].
#[derive(Default)]
pub struct DelayOptions {
    /// How long to wait before firing. `None` fires on the next tick.
    pub time: Option<Duration>,
    /// Receives errors trapped from the timer function.
    pub event_cb: Option<Box<dyn FnMut(&crate::condition::Condition)>>,
}

/// An opaque reference to a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    pub(crate) id: HandleId,
}

/// Schedule `f` to run once after `options.time`.
///
/// The timer's record is destroyed after `f` returns. When application
/// error trapping is enabled, a panic inside `f` is routed to the timer's
/// `event_cb` (or the loop default).
pub fn delay(f: impl FnOnce() + 'static, options: DelayOptions) -> Result<TimerHandle, LoopError> {
    with_loop(|s| {
        let id = s.registry.allocate(HandleKind::Timer);
        let event: Option<EventCb> =
            options.event_cb.map(|cb| Rc::new(std::cell::RefCell::new(cb)) as EventCb);
        s.registry.attach(
            id,
            HandleKind::Timer,
            Bundle::Timer { fire: Some(Box::new(f)), event },
            HandleState::Timer,
        );
        let deadline = Instant::now() + options.time.unwrap_or(Duration::ZERO);
        s.reactor.schedule(deadline, id);
        TimerHandle { id }
    })
}

/// Trampoline target for a due timer entry.
pub(crate) fn fire_timer(id: HandleId) {
    let callbacks = with_loop(|s| {
        s.registry.lookup(id).and_then(|record| match &mut record.bundle {
            Bundle::Timer { fire, event } => Some((fire.take(), event.clone())),
            _ => None,
        })
    })
    .ok()
    .flatten();
    let Some((fire, event)) = callbacks else { return };
    if let Some(f) = fire {
        invoke_user(event, f);
    }
    let _ = with_loop(|s| s.destroy_handle(id));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::{start_event_loop, stats, LoopOptions};
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_delay_fires_and_destroys() {
        let fired = Rc::new(Cell::new(false));
        let after = Rc::new(Cell::new(None));
        {
            let fired = fired.clone();
            let after = after.clone();
            start_event_loop(
                move || {
                    let after = after.clone();
                    let fired2 = fired.clone();
                    delay(
                        move || {
                            fired2.set(true);
                            // The firing timer's record is still live here;
                            // it is destroyed right after this returns.
                            let inner_after = after.clone();
                            delay(move || inner_after.set(Some(stats().unwrap())), DelayOptions::default())
                                .unwrap();
                        },
                        DelayOptions { time: Some(Duration::from_millis(10)), ..Default::default() },
                    )
                    .unwrap();
                },
                LoopOptions::default(),
            )
            .unwrap();
        }
        assert!(fired.get());
        let stats = after.get().unwrap();
        // Two timers allocated, first one destroyed by the time the
        // second fires; plus the supervisor record.
        assert_eq!(stats.handles_allocated, 3);
        assert_eq!(stats.handles_destroyed, 1);
        assert_eq!(stats.data_registry_count, 2);
    }

    #[test]
    fn test_nil_time_fires_next_tick() {
        let order = Rc::new(std::cell::RefCell::new(Vec::new()));
        let order2 = order.clone();
        start_event_loop(
            move || {
                let order = order2.clone();
                order2.borrow_mut().push("entry");
                delay(move || order.borrow_mut().push("timer"), DelayOptions::default()).unwrap();
                order2.borrow_mut().push("after-delay");
            },
            LoopOptions::default(),
        )
        .unwrap();
        assert_eq!(*order.borrow(), ["entry", "after-delay", "timer"]);
    }

    #[test]
    fn test_timer_panic_routes_to_event_cb() {
        let seen = Rc::new(Cell::new(false));
        let seen2 = seen.clone();
        start_event_loop(
            move || {
                let seen = seen2.clone();
                delay(
                    || panic!("timer blew up"),
                    DelayOptions {
                        time: None,
                        event_cb: Some(Box::new(move |cond| {
                            assert!(cond.is_error());
                            seen.set(true);
                        })),
                    },
                )
                .unwrap();
            },
            LoopOptions { catch_app_errors: true, ..Default::default() },
        )
        .unwrap();
        assert!(seen.get());
    }

    #[test]
    fn test_delay_outside_loop_fails() {
        assert!(delay(|| {}, DelayOptions::default()).is_err());
    }
}

//! Timers plus a SIGINT handler: tick once a second until Ctrl-C.
//!
//! Run with: cargo run --example timer_signals

use eddy::{
    delay, exit_event_loop, free_signal_handler, signal_handler, start_event_loop, DelayOptions,
    LoopOptions, SignalOptions,
};
use std::time::Duration;

fn tick(n: u32) {
    println!("tick {n}");
    delay(
        move || tick(n + 1),
        DelayOptions { time: Some(Duration::from_secs(1)), ..Default::default() },
    )
    .unwrap();
}

fn main() {
    start_event_loop(
        || {
            signal_handler(
                libc::SIGINT,
                |signo| {
                    println!("signal {signo}, exiting");
                    free_signal_handler(libc::SIGINT).unwrap();
                    exit_event_loop().unwrap();
                },
                SignalOptions::default(),
            )
            .unwrap();
            tick(0);
        },
        LoopOptions::default(),
    )
    .unwrap();
}

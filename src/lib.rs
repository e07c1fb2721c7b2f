//! eddy: a callback-driven single-threaded async I/O runtime
//!
//! This crate provides an event-loop runtime in the classic callback
//! style:
//! - One cooperative event loop per thread, no locks, no futures
//! - One-shot timers, signal handlers, async DNS, buffered TCP, and an
//!   evented HTTP server/client on a single `mio`-backed reactor
//! - A generation-tagged handle registry so every reactor wakeup is
//!   dispatched through an opaque id that can never alias freed state
//!
//! ## Model
//!
//! User code runs inside the entry closure passed to
//! [`start_event_loop`]; every operation primitive returns immediately
//! and completion arrives as a callback on a later loop tick. The loop
//! returns when nothing is outstanding, or when [`exit_event_loop`]
//! forces it.
//!
//! ## Example
//!
//! ```rust,no_run
//! use eddy::{delay, start_event_loop, DelayOptions, LoopOptions};
//! use std::time::Duration;
//!
//! start_event_loop(
//!     || {
//!         delay(
//!             || println!("one second later"),
//!             DelayOptions { time: Some(Duration::from_secs(1)), ..Default::default() },
//!         )
//!         .unwrap();
//!     },
//!     LoopOptions::default(),
//! )
//! .unwrap();
//! ```
//!
//! ## Echo server
//!
//! ```rust,no_run
//! use eddy::{start_event_loop, tcp_server, write_socket_data, LoopOptions, ServerOptions,
//!            WriteOptions};
//!
//! start_event_loop(
//!     || {
//!         tcp_server(
//!             None,
//!             7007,
//!             |sock, bytes| {
//!                 write_socket_data(sock, bytes, WriteOptions::default()).unwrap();
//!             },
//!             |cond| eprintln!("socket condition: {cond}"),
//!             ServerOptions::default(),
//!         )
//!         .unwrap();
//!     },
//!     LoopOptions::default(),
//! )
//! .unwrap();
//! ```
//!
//! ## Error channels
//!
//! Failures surface in two ways: misuse of a closed socket returns
//! [`error::LoopError::SocketClosed`] synchronously, while everything
//! that happens to a live handle (EOF, timeouts, refusals, resolver
//! failures) is delivered as a [`Condition`] to the operation's event
//! callback. With `catch_app_errors` enabled, panics raised inside user
//! callbacks are trapped and routed there too.

pub mod condition;
pub mod config;
pub mod dns;
pub mod event_loop;
pub mod http;
pub mod reactor;
pub mod registry;
pub mod signal;
pub mod tcp;
pub mod timer;

// Re-export core types
pub use condition::Condition;
pub use dns::{dns_lookup, Family};
pub use event_loop::{exit_event_loop, start_event_loop, stats, LoopOptions, Stats};
pub use http::{
    close_http_server, http_client, http_response, http_server, ClientOptions, HttpRequest,
    HttpServerHandle, Method, ResponseOptions,
};
pub use registry::{HandleId, HandleKind, Registry};
pub use signal::{clear_signal_handlers, free_signal_handler, signal_handler, SignalOptions};
pub use tcp::{
    close_socket, close_tcp_server, disable_socket, enable_socket, set_socket_timeouts, tcp_send,
    tcp_server, write_socket_data, ServerOptions, Socket, TcpOptions, TcpServerHandle,
    WriteOptions,
};
pub use timer::{delay, DelayOptions, TimerHandle};

/// Error types for the runtime
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum LoopError {
        #[error("an event loop is already running on this thread")]
        LoopActive,

        #[error("no event loop is running on this thread")]
        NoLoop,

        #[error("socket is closed")]
        SocketClosed,

        #[error("a signal handler already exists for signal {0}")]
        SignalExists(i32),

        #[error("handle refers to a destroyed record")]
        StaleHandle,

        #[error("unsupported or malformed uri: {0}")]
        BadUri(String),

        #[error("I/O operation failed: {0}")]
        Io(#[from] std::io::Error),
    }

    pub type Result<T> = std::result::Result<T, LoopError>;
}

pub use error::LoopError;

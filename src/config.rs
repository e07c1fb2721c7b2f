//! Configuration constants for the eddy runtime
//!
//! This module contains tunable parameters that affect runtime behavior,
//! particularly around polling, socket buffering and HTTP framing limits.

/// Capacity of the `mio::Events` buffer handed to each poll call
///
/// This bounds how many readiness events a single loop tick can observe.
/// Events beyond the capacity are not lost; they are reported on the next
/// tick. The default of 1024 matches one event per live handle for all but
/// the largest loops.
pub const POLL_EVENTS_CAPACITY: usize = 1024;

/// Size of the chunk buffer used for draining readable sockets
///
/// On every readability wakeup the socket is read in chunks of this size
/// until the kernel reports `WouldBlock`. A larger value reduces syscalls
/// for bulk transfers at the cost of per-tick memory usage.
pub const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Default listen backlog for TCP and HTTP servers
///
/// Used when the caller passes a negative backlog option, mirroring the
/// listener's "pick for me" convention.
pub const DEFAULT_BACKLOG: i32 = 128;

/// Upper bound on the buffered size of an HTTP request or response head
///
/// Connections whose peers send more header bytes than this without
/// completing the head are failed with an HTTP error rather than buffering
/// without bound.
pub const MAX_HTTP_HEAD_BYTES: usize = 64 * 1024;

/// Default port for HTTP client requests when the URI does not name one
pub const HTTP_DEFAULT_PORT: u16 = 80;

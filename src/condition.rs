//! Conditions delivered to event callbacks.
//!
//! Every notification the runtime hands to an `event_cb` is a [`Condition`].
//! Conditions split into two classes: *info* conditions are advisory and
//! leave the originating handle alive, while *error* conditions are terminal
//! and the runtime closes or destroys the handle before the callback
//! returns. The sole exception to the delivery model is a closed-socket
//! misuse, which is returned synchronously as
//! [`LoopError::SocketClosed`](crate::error::LoopError::SocketClosed)
//! instead of being delivered.

use thiserror::Error;

/// A condition value delivered to an event callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// Informational TCP notification.
    #[error("tcp: {msg}")]
    TcpInfo { msg: String },

    /// The peer closed its write side. Informational class, but the socket
    /// still transitions to closed per the socket state machine.
    #[error("tcp: end of file from peer")]
    TcpEof,

    /// Generic TCP failure. `code` is the OS error number, or -1 when the
    /// runtime synthesized the condition.
    #[error("tcp error {code}: {msg}")]
    TcpError { code: i32, msg: String },

    /// A per-direction idle timeout expired. Terminal for the socket.
    #[error("tcp: connection timed out")]
    TcpTimeout,

    /// The peer refused the connection. Terminal for the socket.
    #[error("tcp: connection refused")]
    TcpRefused,

    /// DNS resolution failed. `code` is the resolver status when one
    /// exists, or -1 when synthesized.
    #[error("dns error {code}: {msg}")]
    DnsError { code: i32, msg: String },

    /// Informational HTTP notification.
    #[error("http: {msg}")]
    HttpInfo { msg: String },

    /// Generic HTTP failure. Terminal for the request.
    #[error("http error {code}: {msg}")]
    HttpError { code: i32, msg: String },

    /// An HTTP request did not complete within its timeout. Terminal.
    #[error("http: request timed out")]
    HttpTimeout,

    /// The HTTP peer refused the connection. Terminal for the request.
    #[error("http: connection refused")]
    HttpRefused,

    /// An error trapped from inside a user callback and rerouted to the
    /// nearest event callback.
    #[error("application error: {msg}")]
    App { msg: String },
}

impl Condition {
    /// True for info-class conditions, which leave the handle alive
    /// (`TcpEof` is info-class even though the state machine closes the
    /// socket on it).
    pub fn is_info(&self) -> bool {
        matches!(
            self,
            Condition::TcpInfo { .. } | Condition::HttpInfo { .. } | Condition::TcpEof
        )
    }

    /// True for error-class conditions: connection errors, their
    /// specializations, and trapped application errors.
    pub fn is_error(&self) -> bool {
        !self.is_info()
    }

    /// True for conditions in the connection-error family (`dns-error`,
    /// `tcp-error`, `http-error` and their specializations).
    pub fn is_connection_error(&self) -> bool {
        self.is_error() && !matches!(self, Condition::App { .. })
    }

    /// The numeric error code carried by the condition. Specializations
    /// synthesized by the runtime report -1; info conditions report 0.
    pub fn errcode(&self) -> i32 {
        match self {
            Condition::TcpError { code, .. }
            | Condition::DnsError { code, .. }
            | Condition::HttpError { code, .. } => *code,
            Condition::TcpTimeout
            | Condition::TcpRefused
            | Condition::HttpTimeout
            | Condition::HttpRefused
            | Condition::App { .. } => -1,
            _ => 0,
        }
    }

    /// The human-readable message for the condition.
    pub fn errmsg(&self) -> String {
        self.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_error_split() {
        assert!(Condition::TcpInfo { msg: "x".into() }.is_info());
        assert!(Condition::TcpEof.is_info());
        assert!(Condition::HttpInfo { msg: "x".into() }.is_info());

        assert!(Condition::TcpTimeout.is_error());
        assert!(Condition::TcpRefused.is_error());
        assert!(Condition::HttpTimeout.is_error());
        assert!(Condition::App { msg: "boom".into() }.is_error());
        assert!(Condition::DnsError { code: -1, msg: "x".into() }.is_error());
    }

    #[test]
    fn test_connection_error_family() {
        assert!(Condition::TcpError { code: 104, msg: "reset".into() }.is_connection_error());
        assert!(Condition::TcpTimeout.is_connection_error());
        assert!(Condition::HttpRefused.is_connection_error());
        // Trapped application errors are errors but not connection errors.
        assert!(!Condition::App { msg: "boom".into() }.is_connection_error());
        assert!(!Condition::TcpEof.is_connection_error());
    }

    #[test]
    fn test_errcode_synthesized() {
        assert_eq!(Condition::TcpTimeout.errcode(), -1);
        assert_eq!(Condition::TcpError { code: 111, msg: "refused".into() }.errcode(), 111);
        assert_eq!(Condition::TcpInfo { msg: "x".into() }.errcode(), 0);
    }

    #[test]
    fn test_errmsg_display() {
        let c = Condition::DnsError { code: -1, msg: "no address".into() };
        assert_eq!(c.errmsg(), "dns error -1: no address");
    }
}

//! Error types for sshtun-core.

use thiserror::Error;

/// Main error type for sshtun operations.
///
/// Sentinel identities the supervisor and callers test for are dedicated
/// variants; everything that wraps an underlying cause keeps it reachable
/// through `source()`.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bad configuration file, duration or value.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// A network address that is not an IPv4 CIDR where one is required.
    #[error("invalid address")]
    InvalidAddress,

    /// Agent authentication was requested but SSH_AUTH_SOCK is unset.
    #[error("SSH_AUTH_SOCK is empty")]
    EmptyAgentSocket,

    /// The remote helper path is unknown; upload must run first.
    #[error("missing path to remote tunreadwriter (helper upload must come first)")]
    MissingHelperPath,

    /// Tunnel opened without an armed context; build one with
    /// `OpenContext::new`.
    #[error("tunnel context value missing, use OpenContext::new(cancel)")]
    MissingContext,

    /// Effective-UID transition failed.
    #[error("privilege error: {message}")]
    Privilege { message: String },

    /// TUN open or device-control request failed.
    #[error("device error: {message}")]
    Device { message: String },

    /// Dial, handshake or connection-level failure.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// Helper upload or remote session failure.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// No authentication method was accepted by the server.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// No tunnel in the set is marked enabled.
    #[error("0 out of {total} tunnel(s) marked enabled in configuration")]
    NoTunnelsEnabled { total: usize },

    /// Marks the wrapped error as not worth retrying; the supervisor stops
    /// restarting a tunnel whose failure chains to this.
    #[error("unrecoverable: {0}")]
    Unrecoverable(#[source] Box<Error>),
}

impl Error {
    /// Wrap an error with the unrecoverable sentinel.
    pub fn unrecoverable(err: Error) -> Error {
        Error::Unrecoverable(Box::new(err))
    }

    /// True if the unrecoverable sentinel is reachable in this error's
    /// chain. The sentinel is only ever introduced by wrapping, so the
    /// head of the chain decides.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Error::Unrecoverable(_))
    }
}

/// Convenience result type for sshtun operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_invalid_address() {
        assert_eq!(Error::InvalidAddress.to_string(), "invalid address");
    }

    #[test]
    fn display_no_tunnels_enabled_names_total() {
        let err = Error::NoTunnelsEnabled { total: 2 };
        assert_eq!(
            err.to_string(),
            "0 out of 2 tunnel(s) marked enabled in configuration"
        );
    }

    #[test]
    fn unrecoverable_wraps_and_is_detected() {
        let err = Error::unrecoverable(Error::Device {
            message: "ioctl TUNSETIFF failed".into(),
        });
        assert!(err.is_unrecoverable());
        assert!(err.to_string().starts_with("unrecoverable: "));
    }

    #[test]
    fn unrecoverable_chain_survives_nesting() {
        let err = Error::unrecoverable(Error::unrecoverable(Error::InvalidAddress));
        assert!(err.is_unrecoverable());
    }

    #[test]
    fn plain_errors_are_recoverable() {
        assert!(!Error::Transport {
            message: "connection refused".into()
        }
        .is_unrecoverable());
        assert!(!Error::Timeout.is_unrecoverable());
        assert!(!Error::AuthenticationFailed.is_unrecoverable());
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such device");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn unrecoverable_preserves_cause_through_source() {
        use std::error::Error as _;
        let err = Error::unrecoverable(Error::InvalidAddress);
        let cause = err.source().expect("cause must be reachable");
        assert_eq!(cause.to_string(), "invalid address");
    }
}

//! Classification of I/O errors into the conditions that oblige a client
//! connection to terminate.

use std::io;

/// Errors that end the connection as soon as they are observed: timeouts,
/// end-of-stream, and a torn-down peer.
pub(crate) fn is_closeable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}

/// The broader closeable set checked after attempting a write, covering
/// closed or refused sockets and short writes.
pub(crate) fn is_other_closeable(err: &io::Error) -> bool {
    is_closeable(err)
        || matches!(
            err.kind(),
            io::ErrorKind::NotConnected
                | io::ErrorKind::ConnectionRefused
                | io::ErrorKind::WriteZero
                | io::ErrorKind::WouldBlock
        )
}

/// Accept failures that warrant backing off and retrying rather than
/// tearing the listener down, mirroring the platform's notion of a
/// transient accept error.
pub(crate) fn is_temporary_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_and_eof_are_closeable() {
        for kind in [
            io::ErrorKind::TimedOut,
            io::ErrorKind::UnexpectedEof,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::ConnectionReset,
        ] {
            assert!(is_closeable(&io::Error::from(kind)), "{kind:?}");
        }
        assert!(!is_closeable(&io::Error::from(io::ErrorKind::InvalidData)));
    }

    #[test]
    fn write_side_set_is_a_superset() {
        assert!(is_other_closeable(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(is_other_closeable(&io::Error::from(
            io::ErrorKind::ConnectionRefused
        )));
        assert!(is_other_closeable(&io::Error::from(io::ErrorKind::WriteZero)));
        assert!(!is_other_closeable(&io::Error::from(
            io::ErrorKind::InvalidData
        )));
    }

    #[test]
    fn aborted_accepts_are_temporary() {
        assert!(is_temporary_accept_error(&io::Error::from(
            io::ErrorKind::ConnectionAborted
        )));
        assert!(!is_temporary_accept_error(&io::Error::from(
            io::ErrorKind::PermissionDenied
        )));
    }
}

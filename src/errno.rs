//! Symbolic names for OS error codes, used in diagnostics only.

use std::io;

/// Symbolic constant name for `code`, or `"UNKNOWN"`.
pub fn errno_name(code: i32) -> &'static str {
    match code {
        libc::EPERM => "EPERM",
        libc::EINTR => "EINTR",
        libc::EBADF => "EBADF",
        libc::EAGAIN => "EAGAIN",
        libc::ENOMEM => "ENOMEM",
        libc::EACCES => "EACCES",
        libc::EFAULT => "EFAULT",
        libc::EINVAL => "EINVAL",
        libc::ENFILE => "ENFILE",
        libc::EMFILE => "EMFILE",
        libc::EPIPE => "EPIPE",
        libc::ENOTSOCK => "ENOTSOCK",
        libc::EPROTO => "EPROTO",
        libc::EOPNOTSUPP => "EOPNOTSUPP",
        libc::EADDRINUSE => "EADDRINUSE",
        libc::EADDRNOTAVAIL => "EADDRNOTAVAIL",
        libc::ENETDOWN => "ENETDOWN",
        libc::ENETUNREACH => "ENETUNREACH",
        libc::ECONNABORTED => "ECONNABORTED",
        libc::ECONNRESET => "ECONNRESET",
        libc::ENOBUFS => "ENOBUFS",
        libc::ENOTCONN => "ENOTCONN",
        libc::ETIMEDOUT => "ETIMEDOUT",
        libc::ECONNREFUSED => "ECONNREFUSED",
        libc::EHOSTUNREACH => "EHOSTUNREACH",
        _ => "UNKNOWN",
    }
}

/// Symbolic name of the OS error behind `err`, if it carries one.
pub fn io_errno_name(err: &io::Error) -> &'static str {
    err.raw_os_error().map_or("UNKNOWN", errno_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes() {
        assert_eq!(errno_name(libc::EMFILE), "EMFILE");
        assert_eq!(errno_name(libc::ECONNABORTED), "ECONNABORTED");
        assert_eq!(errno_name(libc::EADDRINUSE), "EADDRINUSE");
    }

    #[test]
    fn test_unknown_code() {
        assert_eq!(errno_name(-1), "UNKNOWN");
        assert_eq!(errno_name(100_000), "UNKNOWN");
    }

    #[test]
    fn test_io_error() {
        let err = io::Error::from_raw_os_error(libc::ECONNRESET);
        assert_eq!(io_errno_name(&err), "ECONNRESET");

        let err = io::Error::new(io::ErrorKind::Other, "synthetic");
        assert_eq!(io_errno_name(&err), "UNKNOWN");
    }
}

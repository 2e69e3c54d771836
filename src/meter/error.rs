use nix::errno::Errno;
use nix::libc;
use thiserror::Error;

/// Error classes shared by the meter pipeline and the register engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Temporary condition; drop the resource, back off and retry.
    Transient,
    /// Unrecoverable; initiate process shutdown.
    Fatal,
    /// The operation was cancelled because a shutdown is already in progress.
    ShutdownInProgress,
}

/// What the owning state machine does with a classified error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    None,
    Reconnect,
    Shutdown,
}

impl Severity {
    pub fn action(self) -> ErrorAction {
        match self {
            Severity::Transient => ErrorAction::Reconnect,
            Severity::Fatal | Severity::ShutdownInProgress => ErrorAction::Shutdown,
        }
    }
}

fn errno_desc(code: &i32) -> &'static str {
    Errno::from_i32(*code).desc()
}

/// A classified meter error: numeric code (errno where OS-originated),
/// contextual message and deduced severity.
#[derive(Error, Debug, Clone)]
#[error("{message}: {} (code {code})", errno_desc(.code))]
pub struct MeterError {
    pub code: i32,
    pub message: String,
    pub severity: Severity,
}

impl MeterError {
    pub fn from_io(err: &std::io::Error, msg: impl Into<String>) -> Self {
        Self::custom(err.raw_os_error().unwrap_or(libc::EIO), msg)
    }

    pub fn custom(code: i32, msg: impl Into<String>) -> Self {
        MeterError {
            code,
            message: msg.into(),
            severity: deduce_severity(code),
        }
    }

    /// Mid-stream read failures are always recoverable by reopening the
    /// device, regardless of what the code would mean at open time.
    pub fn transient_io(err: &std::io::Error, msg: impl Into<String>) -> Self {
        MeterError {
            code: err.raw_os_error().unwrap_or(libc::EIO),
            message: msg.into(),
            severity: Severity::Transient,
        }
    }

    pub fn action(&self) -> ErrorAction {
        self.severity.action()
    }
}

/// Severity deduction for serial/meter codes. Everything that points at a
/// broken device path, broken permissions or a programming error is fatal;
/// an interrupted call means shutdown; the rest is retryable line noise.
fn deduce_severity(code: i32) -> Severity {
    match code {
        libc::EINVAL
        | libc::ENOMEM
        | libc::ENOENT
        | libc::ENODEV
        | libc::ENXIO
        | libc::EACCES
        | libc::EPERM
        | libc::ENOTDIR
        | libc::EISDIR
        | libc::ENAMETOOLONG
        | libc::ELOOP
        | libc::EMFILE
        | libc::ENFILE
        | libc::ENOTTY
        | libc::EBADF
        | libc::EAGAIN
        | libc::EIO
        | libc::EBUSY => Severity::Fatal,
        libc::EINTR => Severity::ShutdownInProgress,
        _ => Severity::Transient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_codes() {
        for code in [
            libc::EINVAL,
            libc::ENOMEM,
            libc::ENOENT,
            libc::ENODEV,
            libc::ENXIO,
            libc::EACCES,
            libc::EPERM,
            libc::ENOTDIR,
            libc::EISDIR,
            libc::ENAMETOOLONG,
            libc::ELOOP,
            libc::EMFILE,
            libc::ENFILE,
            libc::ENOTTY,
            libc::EBADF,
            libc::EAGAIN,
            libc::EIO,
            libc::EBUSY,
        ] {
            let err = MeterError::custom(code, "probe");
            assert_eq!(err.severity, Severity::Fatal, "code {code}");
            assert_eq!(err.action(), ErrorAction::Shutdown);
        }
    }

    #[test]
    fn interrupted_means_shutdown_in_progress() {
        let err = MeterError::custom(libc::EINTR, "read cancelled");
        assert_eq!(err.severity, Severity::ShutdownInProgress);
        assert_eq!(err.action(), ErrorAction::Shutdown);
    }

    #[test]
    fn unlisted_codes_are_transient() {
        for code in [libc::ETIMEDOUT, libc::EPROTO, libc::EPIPE, libc::ECONNRESET] {
            let err = MeterError::custom(code, "hiccup");
            assert_eq!(err.severity, Severity::Transient, "code {code}");
            assert_eq!(err.action(), ErrorAction::Reconnect);
        }
    }

    #[test]
    fn io_errors_carry_the_raw_code() {
        let io = std::io::Error::from_raw_os_error(libc::ENOENT);
        let err = MeterError::from_io(&io, "opening serial device failed");
        assert_eq!(err.code, libc::ENOENT);
        assert_eq!(err.severity, Severity::Fatal);
        assert!(err.to_string().contains("opening serial device failed"));
    }
}

use crate::meter::error::{ErrorAction, Severity};
use nix::errno::Errno;
use nix::libc;
use thiserror::Error;

fn errno_desc(code: &i32) -> &'static str {
    Errno::from_i32(*code).desc()
}

/// A classified register-engine error, mirroring [`crate::meter::error::MeterError`]
/// but with the Modbus severity taxonomy.
#[derive(Error, Debug, Clone)]
#[error("{message}: {} (code {code})", errno_desc(.code))]
pub struct ModbusError {
    pub code: i32,
    pub message: String,
    pub severity: Severity,
}

impl ModbusError {
    pub fn from_io(err: &std::io::Error, msg: impl Into<String>) -> Self {
        Self::custom(err.raw_os_error().unwrap_or(libc::EIO), msg)
    }

    pub fn custom(code: i32, msg: impl Into<String>) -> Self {
        ModbusError {
            code,
            message: msg.into(),
            severity: deduce_severity(code),
        }
    }

    /// Unconditionally fatal, used where the serving loop knows the code is
    /// unrecoverable regardless of the table (broken fd on the RTU line).
    pub fn fatal(code: i32, msg: impl Into<String>) -> Self {
        ModbusError {
            code,
            message: msg.into(),
            severity: Severity::Fatal,
        }
    }

    /// Classify a framing-layer failure. Protocol exceptions that libmodbus
    /// would report as fatal slave errors keep the Fatal class here; broken
    /// or foreign frames are retryable.
    pub fn from_frame(kind: rmodbus::ErrorKind, msg: impl Into<String>) -> Self {
        let severity = match kind {
            rmodbus::ErrorKind::IllegalFunction
            | rmodbus::ErrorKind::IllegalDataAddress
            | rmodbus::ErrorKind::IllegalDataValue
            | rmodbus::ErrorKind::SlaveDeviceFailure => Severity::Fatal,
            _ => Severity::Transient,
        };
        ModbusError {
            code: 0,
            message: format!("{}: {}", msg.into(), kind),
            severity,
        }
    }

    pub fn action(&self) -> ErrorAction {
        self.severity.action()
    }
}

/// Severity deduction for engine-level codes.
fn deduce_severity(code: i32) -> Severity {
    match code {
        libc::EINVAL | libc::ENOMEM | libc::ENOENT => Severity::Fatal,
        libc::EINTR => Severity::ShutdownInProgress,
        _ => Severity::Transient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_classes() {
        assert_eq!(
            ModbusError::custom(libc::EINVAL, "bad register").severity,
            Severity::Fatal
        );
        assert_eq!(
            ModbusError::custom(libc::ENOMEM, "bank allocation").severity,
            Severity::Fatal
        );
        assert_eq!(
            ModbusError::custom(libc::EINTR, "receive interrupted").severity,
            Severity::ShutdownInProgress
        );
        assert_eq!(
            ModbusError::custom(libc::ETIMEDOUT, "receive timeout").severity,
            Severity::Transient
        );
        assert_eq!(
            ModbusError::custom(libc::ECONNRESET, "client gone").severity,
            Severity::Transient
        );
    }

    #[test]
    fn frame_exceptions_are_fatal() {
        let err = ModbusError::from_frame(rmodbus::ErrorKind::IllegalDataAddress, "reply");
        assert_eq!(err.severity, Severity::Fatal);
        assert_eq!(err.action(), ErrorAction::Shutdown);
    }

    #[test]
    fn broken_frames_are_transient() {
        let err = ModbusError::from_frame(rmodbus::ErrorKind::FrameBroken, "receive");
        assert_eq!(err.severity, Severity::Transient);
    }
}

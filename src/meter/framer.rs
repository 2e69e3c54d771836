use crate::config::SerialParams;
use crate::meter::error::MeterError;
use crate::shutdown::Shutdown;
use log::{debug, info, trace};
use nix::fcntl::{flock, FlockArg};
use nix::libc;
use std::os::unix::io::AsRawFd;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};

/// Upper bound for one telegram; a stream that produces no terminator within
/// this many bytes is out of sync.
pub const TELEGRAM_SIZE: usize = 368;

/// Read batching granularity of the serial line.
const CHUNK_SIZE: usize = 64;

/// Inter-byte timeout; the meter pushes a telegram every second, so half a
/// second of silence mid-telegram means the stream stalled.
const INTER_BYTE_TIMEOUT: Duration = Duration::from_millis(500);

pub(crate) fn serial_errno(err: &tokio_serial::Error) -> i32 {
    match err.kind {
        tokio_serial::ErrorKind::NoDevice => libc::ENODEV,
        tokio_serial::ErrorKind::InvalidInput => libc::EINVAL,
        tokio_serial::ErrorKind::Io(kind) => match kind {
            std::io::ErrorKind::NotFound => libc::ENOENT,
            std::io::ErrorKind::PermissionDenied => libc::EACCES,
            std::io::ErrorKind::TimedOut => libc::ETIMEDOUT,
            _ => libc::EIO,
        },
        tokio_serial::ErrorKind::Unknown => libc::EIO,
    }
}

fn serial_error(err: &tokio_serial::Error, msg: &str) -> MeterError {
    MeterError::custom(serial_errno(err), format!("{msg}: {}", err.description))
}

/// Exclusively held serial line delivering framed OBIS telegrams.
pub struct SerialFramer {
    port: SerialStream,
}

impl SerialFramer {
    /// Open and configure the device in raw mode, verify it is a character
    /// device and take both the advisory and the mandatory exclusive lock.
    pub fn open(device: &str, params: &SerialParams) -> Result<Self, MeterError> {
        let mut port = params
            .builder(device)
            .timeout(INTER_BYTE_TIMEOUT)
            .open_native_async()
            .map_err(|e| serial_error(&e, "opening serial device failed"))?;

        if !nix::unistd::isatty(port.as_raw_fd()).unwrap_or(false) {
            return Err(MeterError::custom(libc::ENOTTY, "device is not a tty"));
        }

        flock(port.as_raw_fd(), FlockArg::LockExclusiveNonblock).map_err(|errno| {
            let code = if errno == nix::errno::Errno::EWOULDBLOCK {
                libc::EBUSY
            } else {
                errno as i32
            };
            MeterError::custom(code, "failed to lock serial device")
        })?;

        port.set_exclusive(true)
            .map_err(|e| serial_error(&e, "failed to set exclusive lock"))?;

        // discard whatever accumulated before we configured the line
        port.clear(ClearBuffer::All)
            .map_err(|e| serial_error(&e, "failed to flush serial device"))?;

        info!("Serial device {device} opened ({params:?})");
        Ok(SerialFramer { port })
    }

    /// Block until one complete telegram has been framed. Checks the shutdown
    /// flag before every read and wakes immediately when it flips.
    pub async fn read_telegram(&mut self, shutdown: &Shutdown) -> Result<String, MeterError> {
        let packet = read_telegram_from(&mut self.port, shutdown).await?;
        let telegram = String::from_utf8_lossy(&packet).into_owned();
        trace!("Received telegram (len {}):\n{}", packet.len(), telegram);
        Ok(telegram)
    }
}

impl Drop for SerialFramer {
    fn drop(&mut self) {
        debug!("Serial device closed");
    }
}

/// Framing core, independent of the transport: ignore bytes until `/`, then
/// collect until `output[len-3] == b'!'`, bounded by [`TELEGRAM_SIZE`].
async fn read_telegram_from<R>(reader: &mut R, shutdown: &Shutdown) -> Result<Vec<u8>, MeterError>
where
    R: AsyncRead + Unpin,
{
    let mut packet: Vec<u8> = Vec::with_capacity(TELEGRAM_SIZE);
    let mut chunk = [0u8; CHUNK_SIZE];
    let mut message_begin = false;

    while packet.len() < TELEGRAM_SIZE {
        if !shutdown.is_running() {
            return Err(MeterError::custom(
                libc::EINTR,
                "read_telegram(): shutdown in progress",
            ));
        }

        let read = tokio::select! {
            _ = shutdown.notified() => {
                return Err(MeterError::custom(
                    libc::EINTR,
                    "read_telegram(): shutdown in progress",
                ));
            }
            read = tokio::time::timeout(INTER_BYTE_TIMEOUT, reader.read(&mut chunk)) => read,
        };

        let received = match read {
            Err(_) => {
                return Err(MeterError::custom(
                    libc::ETIMEDOUT,
                    "read_telegram(): timeout during read",
                ));
            }
            Ok(Err(e)) => return Err(MeterError::transient_io(&e, "failed to read serial device")),
            Ok(Ok(0)) => {
                return Err(MeterError::custom(
                    libc::EPIPE,
                    "read_telegram(): serial device closed during read",
                ));
            }
            Ok(Ok(n)) => n,
        };

        for &byte in &chunk[..received] {
            if byte == b'/' {
                message_begin = true;
            }
            if message_begin {
                packet.push(byte);
                let len = packet.len();
                if len >= 3 && packet[len - 3] == b'!' {
                    return Ok(packet);
                }
                if len == TELEGRAM_SIZE {
                    break;
                }
            }
        }
    }

    Err(MeterError::custom(
        libc::EPROTO,
        "read_telegram(): telegram stream not in sync",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meter::error::Severity;

    const GOLDEN: &[u8] = b"/EBZ5DD3BZ06ETA_107\n\n1-0:1.8.0*255(000125.25688570*kWh)\n1-0:16.7.0*255(000259.20*W)\n!\r\n";

    #[tokio::test]
    async fn frames_a_complete_telegram() {
        let shutdown = Shutdown::new();
        let mut stream: &[u8] = GOLDEN;
        let packet = read_telegram_from(&mut stream, &shutdown).await.unwrap();
        assert_eq!(packet, GOLDEN);
        assert_eq!(packet[packet.len() - 3], b'!');
        assert!(packet.len() <= TELEGRAM_SIZE);
    }

    #[tokio::test]
    async fn leading_garbage_is_discarded() {
        let shutdown = Shutdown::new();
        let mut bytes = b"AAAA\x00\xff".to_vec();
        bytes.extend_from_slice(GOLDEN);
        let mut stream: &[u8] = &bytes;
        let packet = read_telegram_from(&mut stream, &shutdown).await.unwrap();
        assert_eq!(packet, GOLDEN);
        assert_eq!(packet[0], b'/');
    }

    #[tokio::test]
    async fn out_of_sync_after_bound() {
        let shutdown = Shutdown::new();
        // starts like a telegram but never terminates
        let mut bytes = b"AAAA/".to_vec();
        bytes.extend(std::iter::repeat(b'X').take(2 * TELEGRAM_SIZE));
        let mut stream: &[u8] = &bytes;
        let err = read_telegram_from(&mut stream, &shutdown).await.unwrap_err();
        assert_eq!(err.code, libc::EPROTO);
        assert_eq!(err.severity, Severity::Transient);
    }

    #[tokio::test]
    async fn eof_mid_telegram_is_transient() {
        let shutdown = Shutdown::new();
        let mut stream: &[u8] = b"/EBZ5DD3BZ06ETA_107\n1-0:1.8";
        let err = read_telegram_from(&mut stream, &shutdown).await.unwrap_err();
        assert_eq!(err.code, libc::EPIPE);
        assert_eq!(err.severity, Severity::Transient);
    }

    #[tokio::test]
    async fn shutdown_cancels_the_read() {
        let shutdown = Shutdown::new();
        shutdown.shutdown();
        let mut stream: &[u8] = GOLDEN;
        let err = read_telegram_from(&mut stream, &shutdown).await.unwrap_err();
        assert_eq!(err.code, libc::EINTR);
        assert_eq!(err.severity, Severity::ShutdownInProgress);
    }

    #[tokio::test]
    async fn terminator_inside_garbage_before_start_is_ignored() {
        let shutdown = Shutdown::new();
        let mut bytes = b"!xx".to_vec();
        bytes.extend_from_slice(GOLDEN);
        let mut stream: &[u8] = &bytes;
        let packet = read_telegram_from(&mut stream, &shutdown).await.unwrap();
        assert_eq!(packet[0], b'/');
    }
}

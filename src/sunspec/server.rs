use super::SunspecSlave;
use crate::config::SerialParams;
use crate::sunspec::error::ModbusError;
use log::{debug, info, trace, warn};
use nix::libc;
use rmodbus::server::ModbusFrame;
use rmodbus::{guess_request_frame_len, ModbusProto};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Largest request ADU either transport can deliver.
const MAX_ADU: usize = 260;

fn serial_error(err: &tokio_serial::Error, msg: &str) -> ModbusError {
    ModbusError::custom(
        crate::meter::framer::serial_errno(err),
        format!("{msg}: {}", err.description),
    )
}

pub(crate) fn open_rtu_port(
    device: &str,
    params: &SerialParams,
) -> Result<SerialStream, ModbusError> {
    params
        .builder(device)
        .timeout(Duration::from_millis(500))
        .open_native_async()
        .map_err(|e| serial_error(&e, "failed to start Modbus RTU listener"))
}

/// Accept loop. Each accepted socket gets its own worker task owning the
/// connection; the workers are tracked so shutdown can join them.
pub(crate) async fn tcp_listener(slave: Arc<SunspecSlave>, listener: TcpListener) {
    while slave.shutdown_handle().is_running() {
        let accepted = tokio::select! {
            _ = slave.shutdown_handle().notified() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                info!("Client connected from {peer}");
                let this = Arc::clone(&slave);
                let handle =
                    tokio::spawn(async move { tcp_client_worker(this, stream, peer).await });
                slave.track_worker(handle);
            }
            Err(e) => {
                let code = e.raw_os_error().unwrap_or(0);
                if code == libc::EBADF || code == libc::EINVAL {
                    slave.classify(&ModbusError::fatal(
                        libc::EIO,
                        "tcp_listener(): server socket error",
                    ));
                    break;
                }
                warn!("tcp_listener(): accept failed: {e}");
            }
        }
    }

    debug!("Modbus TCP slave run loop stopped");
}

/// Serve one TCP client until it goes away, idles out or the process stops.
async fn tcp_client_worker(slave: Arc<SunspecSlave>, mut stream: TcpStream, peer: SocketAddr) {
    let cfg = slave.config();
    let slave_id = cfg.slave_id;
    let request_timeout = Duration::from_secs(cfg.request_timeout);
    let idle_timeout = Duration::from_secs(cfg.idle_timeout);

    let mut buf = [0u8; MAX_ADU];
    let mut last_activity = Instant::now();

    while slave.shutdown_handle().is_running() {
        let request = tokio::select! {
            _ = slave.shutdown_handle().notified() => break,
            request = tokio::time::timeout(
                request_timeout,
                read_tcp_request(&mut stream, &mut buf),
            ) => request,
        };

        let len = match request {
            Err(_) => {
                // receive timeout: only fatal for the session once idle
                if last_activity.elapsed() > idle_timeout {
                    info!(
                        "Client {peer} idle timeout ({}s), disconnecting",
                        cfg.idle_timeout
                    );
                    break;
                }
                continue;
            }
            Ok(Err(e)) => {
                info!("Client {peer} disconnected: {e}");
                break;
            }
            Ok(Ok(None)) => {
                info!("Client {peer} closed connection");
                break;
            }
            Ok(Ok(Some(len))) => len,
        };

        last_activity = Instant::now();

        // one snapshot load per reply
        let snapshot = slave.snapshot();
        let reply_start = Instant::now();
        let mut response: Vec<u8> = Vec::new();
        let mut frame = ModbusFrame::new(slave_id, &buf[..len], ModbusProto::TcpUdp, &mut response);

        if let Err(e) = frame.parse() {
            warn!("Client {peer}: malformed request: {e}");
            break;
        }
        if frame.processing_required {
            if !frame.readonly {
                warn!("Client {peer}: write request rejected (read-only slave)");
                break;
            }
            if let Err(e) = frame.process_read(&*snapshot) {
                slave.classify(&ModbusError::from_frame(e, "tcp_client_worker(): reply failed"));
                break;
            }
        }
        if frame.response_required {
            if let Err(e) = frame.finalize_response() {
                warn!("Client {peer}: building response failed: {e}");
                break;
            }
            if let Err(e) = stream.write_all(&response).await {
                info!("Client {peer} disconnected: {e}");
                break;
            }
            trace!("modbus reply took {} µs", reply_start.elapsed().as_micros());
        }
    }

    debug!("Client worker for {peer} stopped");
}

/// Read one complete TCP ADU: the 6-byte MBAP header determines the total
/// frame length. `Ok(None)` is an orderly close.
async fn read_tcp_request<R>(stream: &mut R, buf: &mut [u8]) -> std::io::Result<Option<usize>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut total = 0usize;
    while total < 6 {
        let n = stream.read(&mut buf[total..6]).await?;
        if n == 0 {
            return Ok(None);
        }
        total += n;
    }

    let frame_len = guess_request_frame_len(&buf[..6], ModbusProto::TcpUdp)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    let frame_len = usize::from(frame_len).min(buf.len());

    while total < frame_len {
        let n = stream.read(&mut buf[total..frame_len]).await?;
        if n == 0 {
            return Ok(None);
        }
        total += n;
    }
    Ok(Some(frame_len))
}

/// Single-task RTU server: the serial line itself is the listener. Frames
/// for other slave ids and CRC rejects are ignored silently; the line stays
/// open across idle periods.
pub(crate) async fn rtu_server(slave: Arc<SunspecSlave>, mut port: SerialStream) {
    let cfg = slave.config();
    let slave_id = cfg.slave_id;
    let request_timeout = Duration::from_secs(cfg.request_timeout);
    let idle_timeout = Duration::from_secs(cfg.idle_timeout);

    let mut buf = [0u8; MAX_ADU];
    let mut last_activity = Instant::now();
    let mut is_active = false;

    while slave.shutdown_handle().is_running() {
        let request = tokio::select! {
            _ = slave.shutdown_handle().notified() => break,
            request = tokio::time::timeout(
                request_timeout,
                read_rtu_request(&mut port, &mut buf),
            ) => request,
        };

        let len = match request {
            Err(_) => {
                // idle bookkeeping only; the line stays open
                if is_active && last_activity.elapsed() > idle_timeout {
                    info!("Client disconnected, idle for {}s", cfg.idle_timeout);
                    last_activity = Instant::now();
                    is_active = false;
                }
                continue;
            }
            Ok(Err(e)) => {
                let code = e.raw_os_error().unwrap_or(0);
                if code == libc::EBADF || code == libc::EIO {
                    slave.classify(&ModbusError::fatal(
                        code,
                        "rtu_server(): fatal serial error",
                    ));
                    break;
                }
                debug!("rtu_server(): receive error: {e}");
                continue;
            }
            Ok(Ok(None)) => continue,
            Ok(Ok(Some(len))) => len,
        };

        let snapshot = slave.snapshot();
        let mut response: Vec<u8> = Vec::new();
        let mut frame = ModbusFrame::new(slave_id, &buf[..len], ModbusProto::Rtu, &mut response);

        // broken CRC or garbage: filtered silently, like a foreign slave id
        if frame.parse().is_err() {
            continue;
        }
        if !frame.processing_required && !frame.response_required {
            continue;
        }

        if !is_active {
            info!(
                "Client connected (slave_id={slave_id}, request_timeout={}s, idle_timeout={}s)",
                cfg.request_timeout, cfg.idle_timeout
            );
            is_active = true;
        }
        last_activity = Instant::now();

        if frame.processing_required {
            if !frame.readonly {
                debug!("rtu_server(): write request ignored (read-only slave)");
                continue;
            }
            if let Err(e) = frame.process_read(&*snapshot) {
                slave.classify(&ModbusError::from_frame(e, "rtu_server(): reply failed"));
                continue;
            }
        }
        if frame.response_required {
            if frame.finalize_response().is_err() {
                continue;
            }
            if let Err(e) = port.write_all(&response).await {
                debug!("rtu_server(): write error: {e}");
            }
        }
    }

    debug!("Modbus RTU slave run loop stopped");
}

/// Accumulate serial bytes until the framing layer can tell the request is
/// complete. Unparseable buffers surface as `InvalidData` so the caller can
/// discard them and resynchronize on the next silence.
async fn read_rtu_request<R>(port: &mut R, buf: &mut [u8]) -> std::io::Result<Option<usize>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut total = 0usize;
    loop {
        let n = port.read(&mut buf[total..]).await?;
        if n == 0 {
            return Ok(None);
        }
        total += n;

        if total >= 3 {
            match guess_request_frame_len(&buf[..total], ModbusProto::Rtu) {
                Ok(len) => {
                    let len = usize::from(len);
                    if total >= len {
                        return Ok(Some(len));
                    }
                }
                Err(_) if total >= 8 => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "unparseable RTU frame",
                    ));
                }
                Err(_) => {}
            }
        }
        if total == buf.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "oversized RTU frame",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModbusConfig, ModbusTcpConfig};
    use crate::meter::{Device, Phase, Values};
    use crate::shutdown::Shutdown;
    use rmodbus::client::ModbusRequest;
    use rmodbus::guess_response_frame_len;

    fn tcp_cfg(slave_id: u8, use_float_model: bool) -> ModbusConfig {
        ModbusConfig {
            tcp: Some(ModbusTcpConfig {
                listen: "127.0.0.1".to_string(),
                port: 0,
            }),
            rtu: None,
            use_float_model,
            slave_id,
            request_timeout: 1,
            idle_timeout: 2,
        }
    }

    fn values_with_power(watts: f64) -> Values {
        Values {
            active_power: watts,
            phase1: Phase {
                active_power: watts,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn read_holdings(
        stream: &mut TcpStream,
        mreq: &mut ModbusRequest,
        reg: u16,
        count: u16,
    ) -> Vec<u16> {
        let mut request = Vec::new();
        mreq.generate_get_holdings(reg, count, &mut request).unwrap();
        stream.write_all(&request).await.unwrap();

        let mut header = [0u8; 6];
        stream.read_exact(&mut header).await.unwrap();
        let len = guess_response_frame_len(&header, ModbusProto::TcpUdp).unwrap();
        let mut response = header.to_vec();
        let mut rest = vec![0u8; usize::from(len) - 6];
        stream.read_exact(&mut rest).await.unwrap();
        response.extend_from_slice(&rest);

        let mut data = Vec::new();
        mreq.parse_u16(&response, &mut data).unwrap();
        data
    }

    #[tokio::test]
    async fn tcp_request_framing_follows_the_mbap_length() {
        let mut mreq = ModbusRequest::new(1, ModbusProto::TcpUdp);
        let mut request = Vec::new();
        mreq.generate_get_holdings(40000, 4, &mut request).unwrap();

        let mut buf = [0u8; MAX_ADU];
        let mut stream: &[u8] = &request;
        let len = read_tcp_request(&mut stream, &mut buf).await.unwrap();
        assert_eq!(len, Some(request.len()));
        assert_eq!(&buf[..request.len()], &request[..]);
    }

    #[tokio::test]
    async fn tcp_request_framing_reports_orderly_close() {
        let mut buf = [0u8; MAX_ADU];
        let mut stream: &[u8] = &[];
        assert_eq!(read_tcp_request(&mut stream, &mut buf).await.unwrap(), None);

        // close mid-header
        let mut stream: &[u8] = &[0x00, 0x01, 0x00];
        assert_eq!(read_tcp_request(&mut stream, &mut buf).await.unwrap(), None);
    }

    #[tokio::test]
    async fn rtu_request_framing_accepts_a_read_request() {
        let mut mreq = ModbusRequest::new(1, ModbusProto::Rtu);
        let mut request = Vec::new();
        mreq.generate_get_holdings(40000, 4, &mut request).unwrap();

        let mut buf = [0u8; MAX_ADU];
        let mut stream: &[u8] = &request;
        let len = read_rtu_request(&mut stream, &mut buf).await.unwrap();
        assert_eq!(len, Some(request.len()));
    }

    #[tokio::test]
    async fn rtu_request_framing_rejects_garbage() {
        let garbage = [0xFFu8; 32];
        let mut buf = [0u8; MAX_ADU];
        let mut stream: &[u8] = &garbage;
        let err = read_rtu_request(&mut stream, &mut buf).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn tcp_master_reads_the_sunspec_header() {
        let shutdown = Shutdown::new();
        let slave = SunspecSlave::new(tcp_cfg(7, false), Arc::clone(&shutdown)).unwrap();
        let addr = slave.start().await.unwrap().unwrap();

        slave.update_device(&Device {
            manufacturer: "EasyMeter".into(),
            model: "DD3-BZ06-ETA-ODZ1".into(),
            options: "1.1.0-test".into(),
            serial_number: "1EBZ0100507409".into(),
            firmware_version: "107".into(),
            status: "001C0104".into(),
            phases: 3,
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut mreq = ModbusRequest::new(7, ModbusProto::TcpUdp);
        let data = read_holdings(&mut stream, &mut mreq, 40000, 71).await;

        assert_eq!(data[0], 0x5375);
        assert_eq!(data[1], 0x6E53);
        assert_eq!(data[2], 0x0001);
        assert_eq!(data[3], 0x0041);
        assert_eq!(data[4], u16::from_be_bytes([b'E', b'a']));
        assert_eq!(data[68], 0x0007);
        assert_eq!(data[69], 0x00CB);
        assert_eq!(data[70], 0x0069);

        shutdown.shutdown();
        tokio::time::timeout(Duration::from_secs(2), slave.stop())
            .await
            .expect("engine must stop within the shutdown bound");
    }

    #[tokio::test]
    async fn snapshot_swap_under_concurrent_readers() {
        let shutdown = Shutdown::new();
        let slave = SunspecSlave::new(tcp_cfg(1, false), Arc::clone(&shutdown)).unwrap();
        let addr = slave.start().await.unwrap().unwrap();

        let mut readers = Vec::new();
        for _ in 0..4 {
            readers.push(tokio::spawn(async move {
                let mut stream = TcpStream::connect(addr).await.unwrap();
                let mut mreq = ModbusRequest::new(1, ModbusProto::TcpUdp);
                for _ in 0..50 {
                    // W and WPHA always move together; a torn window would
                    // show one old and one new value
                    let data = read_holdings(&mut stream, &mut mreq, 40087, 2).await;
                    assert_eq!(data[0], data[1], "torn register window");
                }
            }));
        }

        let writer = {
            let slave = Arc::clone(&slave);
            tokio::spawn(async move {
                let mut flip = false;
                for _ in 0..200 {
                    let watts = if flip { 100.0 } else { 200.0 };
                    flip = !flip;
                    slave.update_values(&values_with_power(watts));
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
        };

        for reader in readers {
            tokio::time::timeout(Duration::from_secs(30), reader)
                .await
                .expect("reader stalled")
                .unwrap();
        }
        writer.await.unwrap();

        shutdown.shutdown();
        tokio::time::timeout(Duration::from_secs(2), slave.stop())
            .await
            .expect("engine must stop within the shutdown bound");
    }

    #[tokio::test]
    async fn write_requests_drop_the_client() {
        let shutdown = Shutdown::new();
        let slave = SunspecSlave::new(tcp_cfg(1, false), Arc::clone(&shutdown)).unwrap();
        let addr = slave.start().await.unwrap().unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut mreq = ModbusRequest::new(1, ModbusProto::TcpUdp);
        let mut request = Vec::new();
        mreq.generate_set_reg(40071, 1234, &mut request).unwrap();
        stream.write_all(&request).await.unwrap();

        // worker closes the connection instead of mutating the snapshot
        let mut scratch = [0u8; 16];
        let closed = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut scratch))
            .await
            .expect("expected the server to close the connection");
        assert_eq!(closed.unwrap(), 0);
        assert_eq!(slave.snapshot().get(40071), 0);

        shutdown.shutdown();
        slave.stop().await;
    }

    #[tokio::test]
    async fn shutdown_during_load_joins_all_workers() {
        let shutdown = Shutdown::new();
        let slave = SunspecSlave::new(tcp_cfg(1, true), Arc::clone(&shutdown)).unwrap();
        let addr = slave.start().await.unwrap().unwrap();

        // park a few connected clients mid-session
        let mut clients = Vec::new();
        for _ in 0..3 {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let mut mreq = ModbusRequest::new(1, ModbusProto::TcpUdp);
            let _ = read_holdings(&mut stream, &mut mreq, 40000, 4).await;
            clients.push(stream);
        }

        shutdown.shutdown();
        tokio::time::timeout(Duration::from_secs(2), slave.stop())
            .await
            .expect("all client workers must join within the shutdown bound");
    }
}

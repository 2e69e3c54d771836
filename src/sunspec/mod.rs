pub mod bank;
pub mod error;
pub mod registers;
mod server;

pub use self::error::ModbusError;

use self::bank::RegisterBank;
use self::registers::{c001, m20x, m21x, m_end};
use crate::config::ModbusConfig;
use crate::meter::error::{ErrorAction, Severity};
use crate::meter::{Device, Values};
use crate::shutdown::Shutdown;
use arc_swap::ArcSwap;
use log::{error, info, trace, warn};
use nix::libc;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// The register engine: maintains the atomically-published SunSpec snapshot
/// and serves Modbus read requests from it.
///
/// The meter pipeline is the only writer; [`SunspecSlave::update_values`] and
/// [`SunspecSlave::update_device`] clone the current bank, mutate the clone
/// and swap the pointer. Serving tasks load the pointer once per reply, so
/// every client sees a monotonic sequence of consistent snapshots.
pub struct SunspecSlave {
    cfg: ModbusConfig,
    shutdown: Arc<Shutdown>,
    regs: ArcSwap<RegisterBank>,
    device_updated: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SunspecSlave {
    /// Allocate the bank and fill the static SunSpec blocks. Listeners are
    /// not started yet; see [`SunspecSlave::start`].
    pub fn new(cfg: ModbusConfig, shutdown: Arc<Shutdown>) -> Result<Arc<Self>, ModbusError> {
        let mut bank = RegisterBank::new();

        bank.set_u32(c001::SID, 0x5375_6E53)?; // "SunS"
        bank.set_u16(c001::ID, 1)?;
        bank.set_u16(c001::L, c001::SIZE)?;
        bank.set_u16(c001::DA, cfg.slave_id as u16)?;

        if cfg.use_float_model {
            bank.set_u16(m21x::ID, m21x::MODEL_ID)?;
            bank.set_u16(m21x::L, m21x::SIZE)?;
            bank.set_u16(m_end::ID.with_offset(m_end::FLOAT_OFFSET), 0xFFFF)?;
        } else {
            bank.set_u16(m20x::ID, m20x::MODEL_ID)?;
            bank.set_u16(m20x::L, m20x::SIZE)?;
            bank.set_u16(m_end::ID, 0xFFFF)?;
        }

        Ok(Arc::new(SunspecSlave {
            cfg,
            shutdown,
            regs: ArcSwap::from_pointee(bank),
            device_updated: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        }))
    }

    /// Bind the configured listener and spawn the serving task(s). Returns
    /// the bound TCP address, if any.
    pub async fn start(self: &Arc<Self>) -> Result<Option<SocketAddr>, ModbusError> {
        if let Some(tcp) = &self.cfg.tcp {
            let ip: IpAddr = tcp.listen.parse().map_err(|_| {
                ModbusError::custom(
                    libc::EINVAL,
                    format!("invalid modbus.tcp.listen address '{}'", tcp.listen),
                )
            })?;
            let listener = TcpListener::bind((ip, tcp.port))
                .await
                .map_err(|e| ModbusError::from_io(&e, "failed to start Modbus TCP listener"))?;
            let addr = listener
                .local_addr()
                .map_err(|e| ModbusError::from_io(&e, "failed to read listener address"))?;
            info!("Started Modbus TCP listener on '{addr}'");

            let this = Arc::clone(self);
            let handle = tokio::spawn(async move { server::tcp_listener(this, listener).await });
            self.workers.lock().unwrap().push(handle);
            return Ok(Some(addr));
        }

        if let Some(rtu) = &self.cfg.rtu {
            let params = rtu
                .serial
                .resolve("modbus.rtu")
                .map_err(|e| ModbusError::custom(libc::EINVAL, e.to_string()))?;
            let port = server::open_rtu_port(&rtu.serial.device, &params)?;
            info!("Started Modbus RTU listener on '{}'", rtu.serial.device);

            let this = Arc::clone(self);
            let handle = tokio::spawn(async move { server::rtu_server(this, port).await });
            self.workers.lock().unwrap().push(handle);
            return Ok(None);
        }

        Err(ModbusError::custom(
            libc::EINVAL,
            "modbus enabled without tcp or rtu transport",
        ))
    }

    pub(crate) fn config(&self) -> &ModbusConfig {
        &self.cfg
    }

    pub(crate) fn shutdown_handle(&self) -> &Shutdown {
        &self.shutdown
    }

    pub(crate) fn track_worker(&self, handle: JoinHandle<()>) {
        self.workers.lock().unwrap().push(handle);
    }

    /// Current snapshot; each reply is served from exactly one such load.
    pub fn snapshot(&self) -> Arc<RegisterBank> {
        self.regs.load_full()
    }

    /// Log an error according to its class; fatal errors stop the process.
    pub(crate) fn classify(&self, err: &ModbusError) -> ErrorAction {
        match err.severity {
            Severity::Fatal => {
                error!("FATAL Modbus error: {err}");
                self.shutdown.shutdown();
                ErrorAction::Shutdown
            }
            Severity::Transient => {
                warn!("Transient Modbus error: {err}");
                ErrorAction::Reconnect
            }
            Severity::ShutdownInProgress => {
                trace!("Modbus operation cancelled due to shutdown: {err}");
                ErrorAction::Shutdown
            }
        }
    }

    /// Copy-and-swap update of the meter model block.
    pub fn update_values(&self, values: &Values) {
        if !self.shutdown.is_running() {
            trace!("update_values(): shutdown in progress");
            return;
        }

        let mut bank = (**self.regs.load()).clone();

        let mut v = *values;
        // meter reports kWh, the register bank serves Wh
        v.energy *= 1e3;
        // power factor registers are percent
        v.power_factor *= 100.0;
        v.phase1.power_factor *= 100.0;
        v.phase2.power_factor *= 100.0;
        v.phase3.power_factor *= 100.0;

        let packed = if self.cfg.use_float_model {
            pack_float_model(&mut bank, &v)
        } else {
            pack_int_model(&mut bank, &v)
        };
        if let Err(err) = packed {
            self.classify(&err);
            return;
        }

        self.regs.store(Arc::new(bank));
        trace!("Meter model registers updated");
    }

    /// Copy-and-swap update of the Common block strings. The device block is
    /// written once; later calls are no-ops.
    pub fn update_device(&self, device: &Device) {
        if !self.shutdown.is_running() {
            trace!("update_device(): shutdown in progress");
            return;
        }
        if self.device_updated.load(Ordering::Acquire) {
            return;
        }

        let mut bank = (**self.regs.load()).clone();

        if let Err(err) = pack_device_block(&mut bank, device) {
            self.classify(&err);
            return;
        }

        self.regs.store(Arc::new(bank));
        self.device_updated.store(true, Ordering::Release);
        info!(
            "Device identification registers populated ({} {})",
            device.manufacturer, device.model
        );
    }

    /// Join every serving task. They observe the shutdown flag at their next
    /// loop iteration; the accept task may still be appending client workers
    /// while we drain, hence the loop.
    pub async fn stop(&self) {
        loop {
            let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
            if workers.is_empty() {
                break;
            }
            for handle in workers {
                let _ = handle.await;
            }
        }
        info!(
            "Stopped Modbus {} listener",
            if self.cfg.tcp.is_some() { "TCP" } else { "RTU" }
        );
    }
}

fn pack_device_block(bank: &mut RegisterBank, device: &Device) -> Result<(), ModbusError> {
    bank.set_string(c001::MN, &device.manufacturer)?;
    bank.set_string(c001::MD, &device.model)?;
    bank.set_string(c001::OPT, &device.options)?;
    bank.set_string(c001::VR, &device.firmware_version)?;
    bank.set_string(c001::SN, &device.serial_number)?;
    Ok(())
}

fn pack_float_model(bank: &mut RegisterBank, v: &Values) -> Result<(), ModbusError> {
    bank.set_f32(m21x::PF, v.power_factor as f32)?;
    bank.set_f32(m21x::PFPHA, v.phase1.power_factor as f32)?;
    bank.set_f32(m21x::PFPHB, v.phase2.power_factor as f32)?;
    bank.set_f32(m21x::PFPHC, v.phase3.power_factor as f32)?;

    bank.set_f32(m21x::W, v.active_power as f32)?;
    bank.set_f32(m21x::WPHA, v.phase1.active_power as f32)?;
    bank.set_f32(m21x::WPHB, v.phase2.active_power as f32)?;
    bank.set_f32(m21x::WPHC, v.phase3.active_power as f32)?;

    bank.set_f32(m21x::VA, v.apparent_power as f32)?;
    bank.set_f32(m21x::VAPHA, v.phase1.apparent_power as f32)?;
    bank.set_f32(m21x::VAPHB, v.phase2.apparent_power as f32)?;
    bank.set_f32(m21x::VAPHC, v.phase3.apparent_power as f32)?;

    bank.set_f32(m21x::VAR, v.reactive_power as f32)?;
    bank.set_f32(m21x::VARPHA, v.phase1.reactive_power as f32)?;
    bank.set_f32(m21x::VARPHB, v.phase2.reactive_power as f32)?;
    bank.set_f32(m21x::VARPHC, v.phase3.reactive_power as f32)?;

    bank.set_f32(m21x::PHV, v.ph_voltage as f32)?;
    bank.set_f32(m21x::PHVPHA, v.phase1.ph_voltage as f32)?;
    bank.set_f32(m21x::PHVPHB, v.phase2.ph_voltage as f32)?;
    bank.set_f32(m21x::PHVPHC, v.phase3.ph_voltage as f32)?;

    bank.set_f32(m21x::PPV, v.pp_voltage as f32)?;
    bank.set_f32(m21x::PPVPHAB, v.phase1.pp_voltage as f32)?;
    bank.set_f32(m21x::PPVPHBC, v.phase2.pp_voltage as f32)?;
    bank.set_f32(m21x::PPVPHCA, v.phase3.pp_voltage as f32)?;

    bank.set_f32(m21x::A, v.current as f32)?;
    bank.set_f32(m21x::APHA, v.phase1.current as f32)?;
    bank.set_f32(m21x::APHB, v.phase2.current as f32)?;
    bank.set_f32(m21x::APHC, v.phase3.current as f32)?;

    bank.set_f32(m21x::TOTWH_IMP, v.energy as f32)?;
    bank.set_f32(m21x::FREQ, v.frequency as f32)?;
    Ok(())
}

fn pack_int_model(bank: &mut RegisterBank, v: &Values) -> Result<(), ModbusError> {
    bank.set_scaled(m20x::PF, m20x::PF_SF, v.power_factor, 0)?;
    bank.set_scaled(m20x::PFPHA, m20x::PF_SF, v.phase1.power_factor, 0)?;
    bank.set_scaled(m20x::PFPHB, m20x::PF_SF, v.phase2.power_factor, 0)?;
    bank.set_scaled(m20x::PFPHC, m20x::PF_SF, v.phase3.power_factor, 0)?;

    bank.set_scaled(m20x::W, m20x::W_SF, v.active_power, 0)?;
    bank.set_scaled(m20x::WPHA, m20x::W_SF, v.phase1.active_power, 0)?;
    bank.set_scaled(m20x::WPHB, m20x::W_SF, v.phase2.active_power, 0)?;
    bank.set_scaled(m20x::WPHC, m20x::W_SF, v.phase3.active_power, 0)?;

    bank.set_scaled(m20x::VA, m20x::VA_SF, v.apparent_power, 0)?;
    bank.set_scaled(m20x::VAPHA, m20x::VA_SF, v.phase1.apparent_power, 0)?;
    bank.set_scaled(m20x::VAPHB, m20x::VA_SF, v.phase2.apparent_power, 0)?;
    bank.set_scaled(m20x::VAPHC, m20x::VA_SF, v.phase3.apparent_power, 0)?;

    bank.set_scaled(m20x::VAR, m20x::VAR_SF, v.reactive_power, 0)?;
    bank.set_scaled(m20x::VARPHA, m20x::VAR_SF, v.phase1.reactive_power, 0)?;
    bank.set_scaled(m20x::VARPHB, m20x::VAR_SF, v.phase2.reactive_power, 0)?;
    bank.set_scaled(m20x::VARPHC, m20x::VAR_SF, v.phase3.reactive_power, 0)?;

    bank.set_scaled(m20x::PHV, m20x::V_SF, v.ph_voltage, 1)?;
    bank.set_scaled(m20x::PHVPHA, m20x::V_SF, v.phase1.ph_voltage, 1)?;
    bank.set_scaled(m20x::PHVPHB, m20x::V_SF, v.phase2.ph_voltage, 1)?;
    bank.set_scaled(m20x::PHVPHC, m20x::V_SF, v.phase3.ph_voltage, 1)?;

    bank.set_scaled(m20x::PPV, m20x::V_SF, v.pp_voltage, 1)?;
    bank.set_scaled(m20x::PPVPHAB, m20x::V_SF, v.phase1.pp_voltage, 1)?;
    bank.set_scaled(m20x::PPVPHBC, m20x::V_SF, v.phase2.pp_voltage, 1)?;
    bank.set_scaled(m20x::PPVPHCA, m20x::V_SF, v.phase3.pp_voltage, 1)?;

    bank.set_scaled(m20x::A, m20x::A_SF, v.current, 3)?;
    bank.set_scaled(m20x::APHA, m20x::A_SF, v.phase1.current, 3)?;
    bank.set_scaled(m20x::APHB, m20x::A_SF, v.phase2.current, 3)?;
    bank.set_scaled(m20x::APHC, m20x::A_SF, v.phase3.current, 3)?;

    bank.set_scaled(m20x::TOTWH_IMP, m20x::TOTWH_SF, v.energy, 1)?;
    bank.set_scaled(m20x::FREQ, m20x::FREQ_SF, v.frequency, 2)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModbusConfig;
    use crate::meter::{Phase, Values};

    fn int_model_cfg(slave_id: u8) -> ModbusConfig {
        ModbusConfig {
            tcp: None,
            rtu: None,
            use_float_model: false,
            slave_id,
            request_timeout: 1,
            idle_timeout: 2,
        }
    }

    fn float_model_cfg() -> ModbusConfig {
        ModbusConfig {
            use_float_model: true,
            ..int_model_cfg(1)
        }
    }

    fn sample_values() -> Values {
        Values {
            time: 1,
            active_sensor_time: 1066563,
            energy: 125.2568857,
            active_power: 259.2,
            apparent_power: 272.84,
            reactive_power: 85.19,
            power_factor: 0.95,
            current: 1.18,
            ph_voltage: 232.6,
            pp_voltage: 402.9,
            frequency: 50.0,
            phase1: Phase {
                active_power: 75.18,
                apparent_power: 79.14,
                reactive_power: 24.71,
                power_factor: 0.95,
                ph_voltage: 232.4,
                pp_voltage: 401.9,
                current: 0.34,
            },
            phase2: Phase {
                active_power: 92.34,
                apparent_power: 97.2,
                reactive_power: 30.35,
                power_factor: 0.95,
                ph_voltage: 231.7,
                pp_voltage: 403.0,
                current: 0.42,
            },
            phase3: Phase {
                active_power: 91.68,
                apparent_power: 96.5,
                reactive_power: 30.13,
                power_factor: 0.95,
                ph_voltage: 233.7,
                pp_voltage: 403.7,
                current: 0.41,
            },
        }
    }

    fn sample_device() -> Device {
        Device {
            manufacturer: "EasyMeter".into(),
            model: "DD3-BZ06-ETA-ODZ1".into(),
            options: "1.1.0-test".into(),
            serial_number: "1EBZ0100507409".into(),
            firmware_version: "107".into(),
            status: "001C0104".into(),
            phases: 3,
        }
    }

    #[test]
    fn sunspec_header_for_int_model() {
        let shutdown = Shutdown::new();
        let slave = SunspecSlave::new(int_model_cfg(7), shutdown).unwrap();
        slave.update_device(&sample_device());
        let bank = slave.snapshot();

        assert_eq!(bank.get(40000), 0x5375);
        assert_eq!(bank.get(40001), 0x6E53);
        assert_eq!(bank.get(40002), 0x0001);
        assert_eq!(bank.get(40003), 0x0041);
        // manufacturer string, zero padded
        assert_eq!(bank.get(40004), u16::from_be_bytes([b'E', b'a']));
        assert_eq!(bank.get(40008), (b'r' as u16) << 8);
        assert!(bank.window(40009, 11).iter().all(|&w| w == 0));
        // model
        assert_eq!(bank.get(40020), u16::from_be_bytes([b'D', b'D']));
        assert_eq!(bank.get(40068), 0x0007);
        assert_eq!(bank.get(40069), 0x00CB);
        assert_eq!(bank.get(40070), 0x0069);
        // end marker of the int model map
        assert_eq!(bank.get(40176), 0xFFFF);
        assert_eq!(bank.get(40177), 0x0000);
    }

    #[test]
    fn float_model_header_and_end_marker() {
        let shutdown = Shutdown::new();
        let slave = SunspecSlave::new(float_model_cfg(), shutdown).unwrap();
        let bank = slave.snapshot();
        assert_eq!(bank.get(40069), 213);
        assert_eq!(bank.get(40070), 124);
        assert_eq!(bank.get(40195), 0xFFFF);
        assert_eq!(bank.get(40176), 0x0000);
    }

    #[test]
    fn int_model_values_and_scale_factors() {
        let shutdown = Shutdown::new();
        let slave = SunspecSlave::new(int_model_cfg(1), shutdown).unwrap();
        slave.update_values(&sample_values());
        let bank = slave.snapshot();

        assert_eq!(bank.get(m20x::W.addr) as i16, 259);
        assert_eq!(bank.get(m20x::W_SF.addr) as i16, 0);
        assert_eq!(bank.get(m20x::PHVPHA.addr) as i16, 2324);
        assert_eq!(bank.get(m20x::V_SF.addr) as i16, -1);
        assert_eq!(bank.get(m20x::APHA.addr) as i16, 340);
        assert_eq!(bank.get(m20x::A_SF.addr) as i16, -3);
        assert_eq!(bank.get(m20x::FREQ.addr) as i16, 5000);
        assert_eq!(bank.get(m20x::FREQ_SF.addr) as i16, -2);
        // power factor as percent
        assert_eq!(bank.get(m20x::PF.addr) as i16, 95);
        assert_eq!(bank.get(m20x::PF_SF.addr) as i16, 0);
        // energy kWh -> Wh with one decimal
        let raw = ((bank.get(m20x::TOTWH_IMP.addr) as u32) << 16)
            | bank.get(m20x::TOTWH_IMP.addr + 1) as u32;
        assert_eq!(raw, 1252569);
        assert_eq!(bank.get(m20x::TOTWH_SF.addr) as i16, -1);
    }

    #[test]
    fn float_model_values() {
        let shutdown = Shutdown::new();
        let slave = SunspecSlave::new(float_model_cfg(), shutdown).unwrap();
        slave.update_values(&sample_values());
        let bank = slave.snapshot();

        let w = f32::from_bits(
            ((bank.get(m21x::W.addr) as u32) << 16) | bank.get(m21x::W.addr + 1) as u32,
        );
        assert!((w - 259.2).abs() < 1e-3);
        let pf = f32::from_bits(
            ((bank.get(m21x::PF.addr) as u32) << 16) | bank.get(m21x::PF.addr + 1) as u32,
        );
        assert!((pf - 95.0).abs() < 1e-3);
        let energy = f32::from_bits(
            ((bank.get(m21x::TOTWH_IMP.addr) as u32) << 16)
                | bank.get(m21x::TOTWH_IMP.addr + 1) as u32,
        );
        assert!((energy - 125256.8857).abs() < 1.0);
    }

    #[test]
    fn update_values_is_idempotent() {
        let shutdown = Shutdown::new();
        let slave = SunspecSlave::new(int_model_cfg(1), shutdown).unwrap();
        let values = sample_values();
        slave.update_values(&values);
        let first = slave.snapshot();
        slave.update_values(&values);
        let second = slave.snapshot();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first.window(40000, 300), second.window(40000, 300));
    }

    #[test]
    fn published_snapshots_are_immutable() {
        let shutdown = Shutdown::new();
        let slave = SunspecSlave::new(int_model_cfg(1), shutdown).unwrap();
        slave.update_values(&sample_values());
        let held = slave.snapshot();
        let w_before = held.get(m20x::W.addr);

        let mut other = sample_values();
        other.active_power = 9999.0;
        slave.update_values(&other);

        // the held snapshot still serves the old, consistent pair
        assert_eq!(held.get(m20x::W.addr), w_before);
        assert_eq!(held.get(m20x::W_SF.addr) as i16, 0);
        assert_eq!(slave.snapshot().get(m20x::W.addr) as i16, 9999);
    }

    #[test]
    fn device_block_is_written_once() {
        let shutdown = Shutdown::new();
        let slave = SunspecSlave::new(int_model_cfg(1), shutdown).unwrap();
        slave.update_device(&sample_device());
        let first = slave.snapshot();

        let mut changed = sample_device();
        changed.serial_number = "OTHERSERIAL".into();
        slave.update_device(&changed);
        let second = slave.snapshot();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.get(c001::SN.addr), u16::from_be_bytes([b'1', b'E']));
    }

    #[test]
    fn updates_after_shutdown_are_ignored() {
        let shutdown = Shutdown::new();
        let slave = SunspecSlave::new(int_model_cfg(1), Arc::clone(&shutdown)).unwrap();
        shutdown.shutdown();
        slave.update_values(&sample_values());
        assert_eq!(slave.snapshot().get(m20x::W.addr), 0);
    }
}

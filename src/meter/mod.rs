pub mod error;
pub mod framer;
pub mod parser;
pub mod types;

pub use self::error::{ErrorAction, MeterError, Severity};
pub use self::types::{Device, Phase, Values};

use crate::config::{MeterConfig, SerialParams};
use crate::meter::framer::SerialFramer;
use crate::meter::parser::TelegramParser;
use crate::shutdown::Shutdown;
use log::{debug, error, info, trace, warn};
use nix::libc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

type ValuesCallback = Box<dyn Fn(&str, &Values) + Send + Sync>;
type DeviceCallback = Box<dyn Fn(&str, &Device) + Send + Sync>;
type AvailabilityCallback = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    values: Option<ValuesCallback>,
    device: Option<DeviceCallback>,
    availability: Option<AvailabilityCallback>,
}

/// The telegram acquisition pipeline: connect → read → parse → publish →
/// reconnect, driven by severity-classified errors.
///
/// The pipeline owns the serial port. It is created once during startup and
/// fans each parsed telegram out to the registered consumer slots.
pub struct Meter {
    cfg: MeterConfig,
    params: SerialParams,
    parser: TelegramParser,
    shutdown: Arc<Shutdown>,
    callbacks: Mutex<Callbacks>,
}

impl Meter {
    pub fn new(cfg: MeterConfig, shutdown: Arc<Shutdown>) -> Result<Arc<Self>, MeterError> {
        let params = cfg
            .serial
            .resolve("meter")
            .map_err(|e| MeterError::custom(libc::EINVAL, e.to_string()))?;
        let parser = TelegramParser::new(cfg.grid, crate::options_string());
        Ok(Arc::new(Meter {
            cfg,
            params,
            parser,
            shutdown,
            callbacks: Mutex::new(Callbacks::default()),
        }))
    }

    /// Install the consumer for every parsed [`Values`] record.
    pub fn set_values_callback(&self, cb: impl Fn(&str, &Values) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().values = Some(Box::new(cb));
    }

    /// Install the consumer invoked when the [`Device`] record changes.
    pub fn set_device_callback(&self, cb: impl Fn(&str, &Device) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().device = Some(Box::new(cb));
    }

    /// Install the consumer for `connected`/`disconnected` transitions.
    pub fn set_availability_callback(&self, cb: impl Fn(&str) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().availability = Some(Box::new(cb));
    }

    /// Spawn the pipeline worker. A panic inside the loop (a misbehaving
    /// consumer callback) is fatal: it takes the whole process down.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let shutdown = Arc::clone(&self.shutdown);
        tokio::spawn(async move {
            let worker = tokio::spawn(async move {
                this.run_loop().await;
                debug!("Meter run loop stopped");
            });
            if let Err(e) = worker.await {
                error!("Meter pipeline terminated abnormally: {e}");
                shutdown.shutdown();
            }
        })
    }

    /// Log an error according to its class and map it onto the next state.
    fn classify(&self, err: &MeterError) -> ErrorAction {
        match err.severity {
            Severity::Fatal => {
                error!("FATAL meter error: {err}");
                self.shutdown.shutdown();
                ErrorAction::Shutdown
            }
            Severity::Transient => {
                warn!("Transient meter error: {err}");
                ErrorAction::Reconnect
            }
            Severity::ShutdownInProgress => {
                trace!("Meter operation cancelled due to shutdown: {err}");
                ErrorAction::Shutdown
            }
        }
    }

    fn try_connect(&self, framer: &mut Option<SerialFramer>) -> Result<(), MeterError> {
        if !self.shutdown.is_running() {
            return Err(MeterError::custom(
                libc::EINTR,
                "try_connect(): shutdown in progress",
            ));
        }
        if framer.is_some() {
            return Ok(());
        }

        *framer = Some(SerialFramer::open(&self.cfg.serial.device, &self.params)?);
        info!("Meter connected");
        self.notify_availability("connected");
        Ok(())
    }

    fn disconnect(&self, framer: &mut Option<SerialFramer>) {
        if framer.take().is_some() {
            self.notify_availability("disconnected");
            info!("Meter disconnected");
        }
    }

    fn notify_availability(&self, state: &str) {
        let callbacks = self.callbacks.lock().unwrap();
        if let Some(cb) = &callbacks.availability {
            cb(state);
        }
    }

    async fn run_loop(&self) {
        let mut reconnect_delay = self.cfg.reconnect_delay.min;
        let mut framer: Option<SerialFramer> = None;
        let mut last_device: Option<Device> = None;

        while self.shutdown.is_running() {
            // --- Connecting ---
            if let Err(err) = self.try_connect(&mut framer) {
                match self.classify(&err) {
                    ErrorAction::Shutdown => break,
                    _ => {
                        self.disconnect(&mut framer);
                        reconnect_delay = self.back_off(reconnect_delay).await;
                        continue;
                    }
                }
            }
            if self.cfg.reconnect_delay.exponential {
                reconnect_delay = self.cfg.reconnect_delay.min;
            }

            let Some(port) = framer.as_mut() else {
                continue;
            };

            // --- Reading ---
            let telegram = match port.read_telegram(&self.shutdown).await {
                Ok(telegram) => telegram,
                Err(err) => match self.classify(&err) {
                    ErrorAction::Shutdown => break,
                    _ => {
                        self.disconnect(&mut framer);
                        reconnect_delay = self.back_off(reconnect_delay).await;
                        continue;
                    }
                },
            };

            // --- Publishing ---
            let device = match self.parser.parse_device(&telegram) {
                Ok(device) => device,
                Err(err) => match self.classify(&err) {
                    ErrorAction::Shutdown => break,
                    _ => {
                        self.disconnect(&mut framer);
                        reconnect_delay = self.back_off(reconnect_delay).await;
                        continue;
                    }
                },
            };

            if last_device.as_ref() != Some(&device) {
                let json = device.to_json();
                debug!("{json}");
                let callbacks = self.callbacks.lock().unwrap();
                if let Some(cb) = &callbacks.device {
                    cb(&json, &device);
                }
                drop(callbacks);
                last_device = Some(device);
            }

            let values = match self.parser.parse_values(&telegram) {
                Ok(values) => values,
                Err(err) => match self.classify(&err) {
                    ErrorAction::Shutdown => break,
                    _ => {
                        self.disconnect(&mut framer);
                        reconnect_delay = self.back_off(reconnect_delay).await;
                        continue;
                    }
                },
            };

            if self.shutdown.is_running() {
                let json = values.to_json();
                debug!("{json}");
                let callbacks = self.callbacks.lock().unwrap();
                if let Some(cb) = &callbacks.values {
                    cb(&json, &values);
                }
            }
        }

        self.disconnect(&mut framer);
    }

    /// Sleep out the reconnect delay (woken early by shutdown) and return the
    /// delay to use next time.
    async fn back_off(&self, delay: u64) -> u64 {
        if !self.shutdown.is_running() {
            return delay;
        }

        warn!(
            "Meter disconnected, trying to reconnect in {delay} {}...",
            if delay == 1 { "second" } else { "seconds" }
        );

        tokio::select! {
            _ = self.shutdown.notified() => {}
            _ = tokio::time::sleep(Duration::from_secs(delay)) => {}
        }

        if self.cfg.reconnect_delay.exponential && self.shutdown.is_running() {
            (delay * 2).min(self.cfg.reconnect_delay.max)
        } else {
            delay
        }
    }
}

use log::LevelFilter;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unable to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("unable to parse config file: {0}")]
    Yaml(#[from] serde_yml::Error),
    #[error("{0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// Discrete baud rates the optical and RS-485 interfaces support.
const BAUD_RATES: [u32; 9] = [
    1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200, 230400,
];

#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Even,
    Odd,
}

/// Named serial presets. The optical head talks 7E1, the MSB/RS-485
/// ("multi functional") interface talks 8N1, both at 9600 baud.
#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    OdType,
    SdType,
}

/// Fully resolved serial line parameters.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SerialParams {
    pub baud: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
}

impl Default for SerialParams {
    fn default() -> Self {
        SerialParams {
            baud: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
        }
    }
}

impl SerialParams {
    /// Builder for the serial stack with these line settings applied.
    pub fn builder(&self, device: &str) -> tokio_serial::SerialPortBuilder {
        let data_bits = match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let stop_bits = match self.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };
        let parity = match self.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        };
        tokio_serial::new(device, self.baud)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(tokio_serial::FlowControl::None)
    }
}

impl Preset {
    pub fn defaults(self) -> SerialParams {
        match self {
            Preset::OdType => SerialParams {
                baud: 9600,
                data_bits: 7,
                stop_bits: 1,
                parity: Parity::Even,
            },
            Preset::SdType => SerialParams {
                baud: 9600,
                data_bits: 8,
                stop_bits: 1,
                parity: Parity::None,
            },
        }
    }
}

fn default_serial_device() -> String {
    "/dev/ttyUSB0".to_string()
}

/// Raw serial settings as they appear in the YAML: a preset resolves to a
/// baseline over which the individual fields may be overridden.
#[derive(Deserialize, Clone, Debug)]
pub struct SerialSection {
    #[serde(default = "default_serial_device")]
    pub device: String,
    #[serde(default)]
    pub preset: Option<Preset>,
    #[serde(default)]
    pub baud: Option<u32>,
    #[serde(default)]
    pub data_bits: Option<u8>,
    #[serde(default)]
    pub stop_bits: Option<u8>,
    #[serde(default)]
    pub parity: Option<Parity>,
}

impl SerialSection {
    /// Resolve preset + overrides into concrete parameters and validate them.
    /// `section` names the YAML section for error messages.
    pub fn resolve(&self, section: &str) -> Result<SerialParams, ConfigError> {
        let mut params = match self.preset {
            Some(preset) => preset.defaults(),
            None => SerialParams::default(),
        };

        if let Some(baud) = self.baud {
            params.baud = baud;
        }
        if let Some(data_bits) = self.data_bits {
            params.data_bits = data_bits;
        }
        if let Some(stop_bits) = self.stop_bits {
            params.stop_bits = stop_bits;
        }
        if let Some(parity) = self.parity {
            params.parity = parity;
        }

        if !BAUD_RATES.contains(&params.baud) {
            return Err(invalid(format!(
                "{section}.baud must be one of {BAUD_RATES:?}"
            )));
        }
        if !(5..=8).contains(&params.data_bits) {
            return Err(invalid(format!(
                "{section}.data_bits must be between 5 and 8"
            )));
        }
        if params.stop_bits != 1 && params.stop_bits != 2 {
            return Err(invalid(format!("{section}.stop_bits must be 1 or 2")));
        }

        Ok(params)
    }
}

fn reconnect_min_default() -> u64 {
    5
}
fn reconnect_max_default() -> u64 {
    365
}
fn reconnect_exponential_default() -> bool {
    true
}

#[derive(Deserialize, Clone, Copy, Debug)]
pub struct ReconnectDelay {
    #[serde(default = "reconnect_min_default")]
    pub min: u64,
    #[serde(default = "reconnect_max_default")]
    pub max: u64,
    #[serde(default = "reconnect_exponential_default")]
    pub exponential: bool,
}

impl Default for ReconnectDelay {
    fn default() -> Self {
        ReconnectDelay {
            min: reconnect_min_default(),
            max: reconnect_max_default(),
            exponential: reconnect_exponential_default(),
        }
    }
}

impl ReconnectDelay {
    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if self.min == 0 {
            return Err(invalid(format!(
                "{section}.reconnect_delay.min must be positive"
            )));
        }
        if self.max == 0 {
            return Err(invalid(format!(
                "{section}.reconnect_delay.max must be positive"
            )));
        }
        if self.min >= self.max {
            return Err(invalid(format!(
                "{section}.reconnect_delay.min must be smaller than max"
            )));
        }
        Ok(())
    }
}

fn grid_power_factor_default() -> f64 {
    0.95
}
fn grid_frequency_default() -> f64 {
    50.0
}

/// Assumed grid parameters used for the derived quantities. The eBZ telegram
/// carries neither power factor nor frequency.
#[derive(Deserialize, Clone, Copy, Debug)]
pub struct GridConfig {
    #[serde(default = "grid_power_factor_default")]
    pub power_factor: f64,
    #[serde(default = "grid_frequency_default")]
    pub frequency: f64,
}

impl Default for GridConfig {
    fn default() -> Self {
        GridConfig {
            power_factor: grid_power_factor_default(),
            frequency: grid_frequency_default(),
        }
    }
}

impl GridConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.power_factor <= -1.0 || self.power_factor >= 1.0 {
            return Err(invalid(
                "meter.grid.power_factor must be in range (-1.0, 1.0)",
            ));
        }
        if self.frequency <= 0.0 {
            return Err(invalid("meter.grid.frequency must be positive"));
        }
        Ok(())
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct MeterConfig {
    #[serde(flatten)]
    pub serial: SerialSection,
    #[serde(default)]
    pub reconnect_delay: ReconnectDelay,
    #[serde(default)]
    pub grid: GridConfig,
}

fn mqtt_broker_default() -> String {
    "localhost".to_string()
}
fn mqtt_port_default() -> u16 {
    1883
}
fn mqtt_queue_size_default() -> usize {
    1000
}

#[derive(Deserialize, Clone, Debug)]
pub struct MqttConfig {
    #[serde(default = "mqtt_broker_default")]
    pub broker: String,
    #[serde(default = "mqtt_port_default")]
    pub port: u16,
    pub topic: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "mqtt_queue_size_default")]
    pub queue_size: usize,
    #[serde(default)]
    pub reconnect_delay: ReconnectDelay,
}

fn modbus_tcp_listen_default() -> String {
    "0.0.0.0".to_string()
}
fn modbus_tcp_port_default() -> u16 {
    502
}

#[derive(Deserialize, Clone, Debug)]
pub struct ModbusTcpConfig {
    #[serde(default = "modbus_tcp_listen_default")]
    pub listen: String,
    #[serde(default = "modbus_tcp_port_default")]
    pub port: u16,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ModbusRtuConfig {
    #[serde(flatten)]
    pub serial: SerialSection,
}

fn modbus_slave_id_default() -> u8 {
    1
}
fn modbus_request_timeout_default() -> u64 {
    5
}
fn modbus_idle_timeout_default() -> u64 {
    60
}

#[derive(Deserialize, Clone, Debug)]
pub struct ModbusConfig {
    #[serde(default)]
    pub tcp: Option<ModbusTcpConfig>,
    #[serde(default)]
    pub rtu: Option<ModbusRtuConfig>,
    pub use_float_model: bool,
    #[serde(default = "modbus_slave_id_default")]
    pub slave_id: u8,
    #[serde(default = "modbus_request_timeout_default")]
    pub request_timeout: u64,
    #[serde(default = "modbus_idle_timeout_default")]
    pub idle_timeout: u64,
}

fn logger_level_default() -> LevelFilter {
    LevelFilter::Info
}

#[derive(Deserialize, Clone, Debug)]
pub struct LoggerConfig {
    #[serde(default = "logger_level_default")]
    pub level: LevelFilter,
    #[serde(default)]
    pub modules: HashMap<String, LevelFilter>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            level: logger_level_default(),
            modules: HashMap::new(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub meter: MeterConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub logger: LoggerConfig,
    #[serde(default)]
    pub modbus: Option<ModbusConfig>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let mut cfg: Config = serde_yml::from_str(contents)?;
        cfg.validate()?;

        // TCP takes priority when both transports are configured
        if let Some(modbus) = cfg.modbus.as_mut() {
            if modbus.tcp.is_some() && modbus.rtu.is_some() {
                modbus.rtu = None;
            }
        }

        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.meter.serial.resolve("meter")?;
        self.meter.reconnect_delay.validate("meter")?;
        self.meter.grid.validate()?;

        if self.mqtt.port == 0 {
            return Err(invalid("mqtt.port must be in range 1-65535"));
        }
        if self.mqtt.topic.is_empty() {
            return Err(invalid("mqtt.topic must not be empty"));
        }
        if self.mqtt.queue_size == 0 {
            return Err(invalid("mqtt.queue_size must be greater than zero"));
        }
        self.mqtt.reconnect_delay.validate("mqtt")?;

        if let Some(modbus) = &self.modbus {
            if modbus.tcp.is_none() && modbus.rtu.is_none() {
                return Err(invalid(
                    "config must specify at least one of 'modbus.tcp' or 'modbus.rtu'",
                ));
            }
            if let Some(tcp) = &modbus.tcp {
                if tcp.port == 0 {
                    return Err(invalid("modbus.tcp.port must be in range 1-65535"));
                }
            }
            if let Some(rtu) = &modbus.rtu {
                rtu.serial.resolve("modbus.rtu")?;
            }
            if !(1..=247).contains(&modbus.slave_id) {
                return Err(invalid("modbus.slave_id must be in range 1-247"));
            }
            if modbus.request_timeout == 0 {
                return Err(invalid("modbus.request_timeout must be positive"));
            }
            if modbus.idle_timeout == 0 {
                return Err(invalid("modbus.idle_timeout must be positive"));
            }
            if modbus.idle_timeout < modbus.request_timeout {
                return Err(invalid("modbus.idle_timeout must be >= request_timeout"));
            }
        }

        Ok(())
    }
}

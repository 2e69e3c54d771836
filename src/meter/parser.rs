use crate::config::GridConfig;
use crate::meter::error::MeterError;
use crate::meter::types::{Device, Phase, Values};
use lazy_static::lazy_static;
use nix::libc;
use regex::Regex;

lazy_static! {
    /// Header line, e.g. `/EBZ5DD3BZ06ETA_107`; the capture is the firmware
    /// version reported after the vendor tag.
    static ref VERSION_LINE: Regex = Regex::new(r"^/[A-Za-z0-9]+_([A-Za-z0-9]+)$").unwrap();
    /// OBIS data line, e.g. `1-0:16.7.0*255(000259.20*W)`.
    static ref OBIS_LINE: Regex =
        Regex::new(r"^(\d-\d:\d+\.\d+\.\d+\*255)\(([^)]+)\)").unwrap();
}

/// Parses framed telegrams into [`Values`] and [`Device`] records and
/// computes the quantities the eBZ meter does not report itself.
pub struct TelegramParser {
    grid: GridConfig,
    options: String,
}

fn protocol_error(line: &str, what: &str) -> MeterError {
    MeterError::custom(libc::EPROTO, format!("[{line}]: {what}"))
}

/// Split off an optional `*unit` suffix and parse the numeric part.
fn parse_number(line: &str, value_unit: &str) -> Result<f64, MeterError> {
    let number = value_unit.split('*').next().unwrap_or(value_unit);
    number
        .parse::<f64>()
        .map_err(|_| protocol_error(line, "malformed numeric value"))
}

fn parse_hex(line: &str, value_unit: &str) -> Result<u64, MeterError> {
    let number = value_unit.split('*').next().unwrap_or(value_unit);
    u64::from_str_radix(number, 16).map_err(|_| protocol_error(line, "malformed hex value"))
}

/// Iterate the data lines of a telegram: `\r` stripped, empty lines and the
/// header/terminator skipped.
fn data_lines(telegram: &str) -> impl Iterator<Item = &str> {
    telegram
        .split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty() && !line.starts_with('/') && !line.starts_with('!'))
}

impl TelegramParser {
    pub fn new(grid: GridConfig, options: String) -> Self {
        TelegramParser { grid, options }
    }

    /// Values pass: extract the measured quantities, then derive the rest.
    pub fn parse_values(&self, telegram: &str) -> Result<Values, MeterError> {
        let mut values = Values::default();

        for line in data_lines(telegram) {
            let caps = OBIS_LINE
                .captures(line)
                .ok_or_else(|| protocol_error(line, "malformed OBIS expression"))?;
            let obis = caps.get(1).map_or("", |m| m.as_str());
            let value_unit = caps.get(2).map_or("", |m| m.as_str());

            match obis {
                "1-0:1.8.0*255" => values.energy = parse_number(line, value_unit)?,
                "1-0:16.7.0*255" => values.active_power = parse_number(line, value_unit)?,
                "1-0:36.7.0*255" => values.phase1.active_power = parse_number(line, value_unit)?,
                "1-0:56.7.0*255" => values.phase2.active_power = parse_number(line, value_unit)?,
                "1-0:76.7.0*255" => values.phase3.active_power = parse_number(line, value_unit)?,
                "1-0:32.7.0*255" => values.phase1.ph_voltage = parse_number(line, value_unit)?,
                "1-0:52.7.0*255" => values.phase2.ph_voltage = parse_number(line, value_unit)?,
                "1-0:72.7.0*255" => values.phase3.ph_voltage = parse_number(line, value_unit)?,
                "0-0:96.8.0*255" => values.active_sensor_time = parse_hex(line, value_unit)?,
                _ => {} // other codes (serial, status, owner id) belong to the device pass
            }
        }

        values.time = crate::epoch_millis();
        self.derive(&mut values);
        Ok(values)
    }

    /// Device pass: header version line plus the identification codes, with
    /// the static fields of the supported meter filled in.
    pub fn parse_device(&self, telegram: &str) -> Result<Device, MeterError> {
        let mut device = Device::default();

        let header = telegram
            .split('\n')
            .map(|line| line.trim_end_matches('\r'))
            .find(|line| !line.is_empty())
            .unwrap_or("");
        let caps = VERSION_LINE
            .captures(header)
            .ok_or_else(|| protocol_error(header, "malformed version header"))?;
        device.firmware_version = caps.get(1).map_or("", |m| m.as_str()).to_string();

        for line in data_lines(telegram) {
            let caps = OBIS_LINE
                .captures(line)
                .ok_or_else(|| protocol_error(line, "malformed OBIS expression"))?;
            let obis = caps.get(1).map_or("", |m| m.as_str());
            let value = caps.get(2).map_or("", |m| m.as_str());

            match obis {
                "1-0:96.1.0*255" => device.serial_number = value.to_string(),
                "1-0:96.5.0*255" => device.status = value.to_string(),
                _ => {}
            }
        }

        device.manufacturer = "EasyMeter".to_string();
        device.model = "DD3-BZ06-ETA-ODZ1".to_string();
        device.phases = 3;
        device.options = self.options.clone();

        Ok(device)
    }

    /// Fill in everything the telegram does not carry, assuming the
    /// configured power factor on all phases and 120° phase separation.
    fn derive(&self, values: &mut Values) {
        let pf = self.grid.power_factor;
        let tan_phi = pf.acos().tan();

        for phase in [
            &mut values.phase1,
            &mut values.phase2,
            &mut values.phase3,
        ] {
            phase.power_factor = pf;
            phase.apparent_power = finite(phase.active_power / pf);
            phase.reactive_power = finite(tan_phi * phase.active_power);
            phase.current = finite(phase.active_power / (phase.ph_voltage * pf));
        }

        values.power_factor = pf;
        values.apparent_power = finite(values.active_power / pf);
        values.reactive_power = finite(tan_phi * values.active_power);
        values.current = values.phase1.current + values.phase2.current + values.phase3.current;

        let (v1, v2, v3) = (
            values.phase1.ph_voltage,
            values.phase2.ph_voltage,
            values.phase3.ph_voltage,
        );
        values.ph_voltage = (v1 + v2 + v3) / 3.0;

        values.phase1.pp_voltage = (v1 * v1 + v2 * v2 + v1 * v2).sqrt();
        values.phase2.pp_voltage = (v2 * v2 + v3 * v3 + v2 * v3).sqrt();
        values.phase3.pp_voltage = (v3 * v3 + v1 * v1 + v3 * v1).sqrt();
        values.pp_voltage =
            (values.phase1.pp_voltage + values.phase2.pp_voltage + values.phase3.pp_voltage) / 3.0;

        values.frequency = self.grid.frequency;
    }
}

/// A zero voltage would turn the current division into inf/NaN; keep the
/// record serializable instead.
fn finite(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

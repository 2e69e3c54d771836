use serde::Serialize;

/// Electrical quantities of a single phase. Everything except voltage and
/// active power is derived from the configured grid parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Phase {
    pub active_power: f64,
    pub apparent_power: f64,
    pub reactive_power: f64,
    pub power_factor: f64,
    pub ph_voltage: f64,
    pub pp_voltage: f64,
    pub current: f64,
}

/// One complete measurement as parsed and derived from a telegram.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Values {
    /// UTC wall-clock milliseconds at parse time.
    pub time: u64,
    /// Seconds the sensor has been active, from OBIS 0-0:96.8.0 (hex).
    pub active_sensor_time: u64,
    /// Cumulative imported energy in kWh.
    pub energy: f64,
    pub active_power: f64,
    pub apparent_power: f64,
    pub reactive_power: f64,
    pub power_factor: f64,
    pub current: f64,
    pub ph_voltage: f64,
    pub pp_voltage: f64,
    pub frequency: f64,
    pub phase1: Phase,
    pub phase2: Phase,
    pub phase3: Phase,
}

/// Identification data of the connected meter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Device {
    pub manufacturer: String,
    pub model: String,
    pub options: String,
    pub serial_number: String,
    pub firmware_version: String,
    /// Status word as hex text, straight from OBIS 1-0:96.5.0.
    pub status: String,
    pub phases: u16,
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

// The JSON projections keep their keys in declaration order; the MQTT sink
// suppresses duplicates by payload hash, so the order must be stable.

#[derive(Serialize)]
struct PhaseJson {
    id: u8,
    power_active: f64,
    power_apparent: f64,
    power_reactive: f64,
    power_factor: f64,
    voltage_ph: f64,
    voltage_pp: f64,
    current: f64,
}

impl PhaseJson {
    fn new(id: u8, phase: &Phase) -> Self {
        PhaseJson {
            id,
            power_active: round_to(phase.active_power, 2),
            power_apparent: round_to(phase.apparent_power, 2),
            power_reactive: round_to(phase.reactive_power, 2),
            power_factor: round_to(phase.power_factor, 2),
            voltage_ph: round_to(phase.ph_voltage, 1),
            voltage_pp: round_to(phase.pp_voltage, 1),
            current: round_to(phase.current, 3),
        }
    }
}

#[derive(Serialize)]
struct ValuesJson {
    time: u64,
    energy: f64,
    power_active: f64,
    power_apparent: f64,
    power_reactive: f64,
    power_factor: f64,
    phases: Vec<PhaseJson>,
    active_time: u64,
    frequency: f64,
    voltage_ph: f64,
    voltage_pp: f64,
}

#[derive(Serialize)]
struct DeviceJson<'a> {
    manufacturer: &'a str,
    model: &'a str,
    serial_number: &'a str,
    firmware_version: &'a str,
    options: &'a str,
    phases: u16,
    status: &'a str,
}

impl Values {
    pub fn to_json(&self) -> String {
        let json = ValuesJson {
            time: self.time,
            energy: round_to(self.energy, 6),
            power_active: round_to(self.active_power, 2),
            power_apparent: round_to(self.apparent_power, 2),
            power_reactive: round_to(self.reactive_power, 2),
            power_factor: round_to(self.power_factor, 2),
            phases: vec![
                PhaseJson::new(1, &self.phase1),
                PhaseJson::new(2, &self.phase2),
                PhaseJson::new(3, &self.phase3),
            ],
            active_time: self.active_sensor_time,
            frequency: round_to(self.frequency, 2),
            voltage_ph: round_to(self.ph_voltage, 1),
            voltage_pp: round_to(self.pp_voltage, 1),
        };
        serde_json::to_string(&json).unwrap()
    }
}

impl Device {
    pub fn to_json(&self) -> String {
        let json = DeviceJson {
            manufacturer: &self.manufacturer,
            model: &self.model,
            serial_number: &self.serial_number,
            firmware_version: &self.firmware_version,
            options: &self.options,
            phases: self.phases,
            status: &self.status,
        };
        serde_json::to_string(&json).unwrap()
    }
}

//! Gateway between an eBZ/Easymeter residential electricity meter and two
//! northbound interfaces: an MQTT broker and a SunSpec-compatible Modbus
//! slave.
//!
//! The meter pushes one OBIS telegram per second over its optical-IR serial
//! interface. The [`meter`] pipeline frames and parses those telegrams into a
//! [`meter::Values`]/[`meter::Device`] pair, derives the electrical quantities
//! the meter itself does not report, and fans the result out to the
//! [`mqtt::MqttSink`] and the [`sunspec::SunspecSlave`] register engine.

pub mod config;
pub mod meter;
pub mod mqtt;
pub mod privileges;
pub mod shutdown;
pub mod sunspec;

/// Build/version string exposed as the SunSpec "options" field and in
/// `--version` output, e.g. `1.1.0-3f9c2d1`.
pub fn options_string() -> String {
    format!(
        "{}-{}",
        env!("CARGO_PKG_VERSION"),
        option_env!("GIT_COMMIT_HASH").unwrap_or("unreleased")
    )
}

/// Milliseconds since the UNIX epoch, UTC wall clock.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

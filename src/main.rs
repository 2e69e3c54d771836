use clap::Parser;
use ebz2mqtt::config::{Config, LoggerConfig};
use ebz2mqtt::meter::Meter;
use ebz2mqtt::mqtt::MqttSink;
use ebz2mqtt::shutdown::Shutdown;
use ebz2mqtt::sunspec::SunspecSlave;
use ebz2mqtt::{options_string, privileges};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "ebz2mqtt",
    version = options_string(),
    about = "eBZ/Easymeter smart meter gateway: OBIS telegrams to MQTT and a SunSpec Modbus slave"
)]
struct Cli {
    /// Set config file
    #[arg(short, long, env = "METER_CONFIG", value_name = "PATH")]
    config: PathBuf,

    /// Drop privileges to this user after startup
    #[arg(short, long, env = "METER_USER")]
    user: Option<String>,

    /// Drop privileges to this group after startup
    #[arg(short, long, env = "METER_GROUP")]
    group: Option<String>,
}

fn init_logging(cfg: &LoggerConfig) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(cfg.level);
    for (module, level) in &cfg.modules {
        // config speaks in component names; the modbus engine lives in sunspec
        let module = match module.as_str() {
            "modbus" => "sunspec",
            other => other,
        };
        builder.filter_module(&format!("{}::{module}", env!("CARGO_PKG_NAME")), *level);
    }
    // RUST_LOG wins over the config file
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.init();
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let cli = Cli::parse();

    let cfg = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {e}");
            return 1;
        }
    };

    init_logging(&cfg.logger);
    info!(
        "Starting ebz2mqtt {} with config '{}'",
        options_string(),
        cli.config.display()
    );

    // --- Privilege sanity checks ---
    if !privileges::is_root() && cli.user.is_some() {
        error!("--user/--group options specified, but not running as root");
        error!("Either run as root, or remove --user/--group options");
        return 1;
    }
    if let Some(modbus) = &cfg.modbus {
        if let Some(tcp) = &modbus.tcp {
            if tcp.port < 1024 && !privileges::is_root() {
                error!(
                    "Modbus TCP port {} requires root privileges, but not running as root",
                    tcp.port
                );
                error!(
                    "Either run as root with --user/--group options, or change Modbus port to >= 1024"
                );
                return 1;
            }
        }
    }
    if privileges::is_root() && cli.user.is_none() {
        warn!(
            "Running as root without privilege dropping - consider using --user/--group options"
        );
    }

    // --- Signals and shutdown ---
    let shutdown = Shutdown::new();
    shutdown.install_signal_handlers();

    // --- Register engine (optional), bound while still privileged ---
    let slave = match &cfg.modbus {
        Some(modbus_cfg) => {
            let slave = match SunspecSlave::new(modbus_cfg.clone(), Arc::clone(&shutdown)) {
                Ok(slave) => slave,
                Err(e) => {
                    error!("{e}");
                    return 1;
                }
            };
            if let Err(e) = slave.start().await {
                error!("{e}");
                return 1;
            }
            Some(slave)
        }
        None => {
            info!("Modbus slave disabled (no modbus section in config)");
            None
        }
    };

    // --- Drop privileges once the sockets are bound ---
    if let Some(user) = &cli.user {
        if privileges::is_root() {
            match privileges::drop(user, cli.group.as_deref()) {
                Ok(()) => info!(
                    "Dropped privileges to user '{}' group '{}'",
                    privileges::current_user(),
                    privileges::current_group()
                ),
                Err(e) => {
                    error!("Failed to drop privileges: {e}");
                    return 1;
                }
            }
        }
    }

    // --- MQTT sink ---
    let mqtt = MqttSink::new(cfg.mqtt.clone(), Arc::clone(&shutdown));

    // --- Meter pipeline ---
    let meter = match Meter::new(cfg.meter.clone(), Arc::clone(&shutdown)) {
        Ok(meter) => meter,
        Err(e) => {
            error!("{e}");
            return 1;
        }
    };

    // --- Fan-out: every telegram feeds the sink and the register bank ---
    let topic = cfg.mqtt.topic.clone();
    {
        let mqtt = Arc::clone(&mqtt);
        let slave = slave.clone();
        let topic = format!("{topic}/values");
        meter.set_values_callback(move |json, values| {
            mqtt.publish(json, topic.as_str());
            if let Some(slave) = &slave {
                slave.update_values(values);
            }
        });
    }
    {
        let mqtt = Arc::clone(&mqtt);
        let slave = slave.clone();
        let topic = format!("{}/device", cfg.mqtt.topic);
        meter.set_device_callback(move |json, device| {
            mqtt.publish(json, topic.as_str());
            if let Some(slave) = &slave {
                slave.update_device(device);
            }
        });
    }
    {
        let mqtt = Arc::clone(&mqtt);
        let topic = format!("{}/availability", cfg.mqtt.topic);
        meter.set_availability_callback(move |state| {
            mqtt.publish(state, topic.as_str());
        });
    }

    let meter_handle = meter.start();

    // --- Wait for shutdown ---
    shutdown.wait().await;
    info!("Shutting down due to {}", shutdown.signal_name());

    let _ = meter_handle.await;
    if let Some(slave) = &slave {
        slave.stop().await;
    }
    mqtt.stop().await;

    0
}

// src/cli.rs
//
// Command-line arguments. Flags override values from the optional TOML file.

use clap::Parser;
use std::path::PathBuf;

use crate::io::BridgeError;
use crate::settings::BridgeConfig;

#[derive(Parser, Debug)]
#[command(name = "can2mqtt", version, about = "SocketCAN to MQTT conduit")]
pub struct Args {
    /// MQTT username (anonymous when omitted)
    #[arg(short = 'u', long)]
    pub username: Option<String>,

    /// MQTT password
    #[arg(short = 'p', long)]
    pub password: Option<String>,

    /// Bus type: socketcan or virtual [default: socketcan]
    #[arg(short = 'b', long = "bustype")]
    pub bus_type: Option<String>,

    /// CAN interface to use [default: can0]
    #[arg(short = 'i', long)]
    pub channel: Option<String>,

    /// Bitrate of the CAN interface [default: 500000]
    #[arg(short = 's', long)]
    pub speed: Option<u32>,

    /// Base MQTT topic [default: can]
    #[arg(short = 't', long)]
    pub topic: Option<String>,

    /// MQTT broker hostname [default: api.savvycan.com]
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// MQTT broker port [default: 8883]
    #[arg(short = 'P', long)]
    pub port: Option<u16>,

    /// Force TLS on
    #[arg(long, conflicts_with = "no_tls")]
    pub tls: bool,

    /// Force TLS off
    #[arg(long)]
    pub no_tls: bool,

    /// MQTT client id (random when omitted)
    #[arg(long)]
    pub client_id: Option<String>,

    /// Apply the bitrate to the interface with `ip link` before opening it
    #[arg(long)]
    pub configure_interface: bool,

    /// Configure the interface for CAN FD
    #[arg(long)]
    pub fd: bool,

    /// Send frames received over MQTT onto the CAN bus
    #[arg(long)]
    pub forward_inbound: bool,

    /// TOML configuration file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Write logs to a timestamped file in this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    /// Load the config file (if any), apply flag overrides and validate.
    pub fn load_config(&self) -> Result<BridgeConfig, BridgeError> {
        let mut config = match &self.config {
            Some(path) => BridgeConfig::from_file(path)?,
            None => BridgeConfig::default(),
        };
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Overwrite config values with any flags that were given.
    pub fn apply(&self, config: &mut BridgeConfig) {
        if let Some(username) = &self.username {
            config.broker.username = Some(username.clone());
        }
        if let Some(password) = &self.password {
            config.broker.password = Some(password.clone());
        }
        if let Some(bus_type) = &self.bus_type {
            config.bus.bus_type = bus_type.clone();
        }
        if let Some(channel) = &self.channel {
            config.bus.channel = channel.clone();
        }
        if let Some(speed) = self.speed {
            config.bus.bitrate = speed;
        }
        if let Some(topic) = &self.topic {
            config.bridge.topic = topic.clone();
        }
        if let Some(host) = &self.host {
            config.broker.host = host.clone();
        }
        if let Some(port) = self.port {
            config.broker.port = port;
        }
        if self.tls {
            config.broker.tls = Some(true);
        } else if self.no_tls {
            config.broker.tls = Some(false);
        }
        if let Some(client_id) = &self.client_id {
            config.broker.client_id = Some(client_id.clone());
        }
        if self.configure_interface {
            config.bus.configure_interface = true;
        }
        if self.fd {
            config.bus.enable_fd = true;
        }
        if self.forward_inbound {
            config.bridge.forward_inbound = true;
        }
    }
}

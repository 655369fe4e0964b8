//! Configuration loading.
//!
//! The file path is taken from the `CONFIG_FILE` environment variable and can
//! be overridden. Example content:
//!
//! ```toml
//! [mqtt]
//! host = "mqttbroker"
//! port = 1883
//! root = "coap_devices"
//!
//! [coap]
//! devices = [
//!     ["192.168.1.101", "hu1508"],
//!     ["192.168.1.102", "hu1508"],
//! ]
//! connection_timeout = 120
//! status_timeout = 120
//! ```

use color_eyre::eyre::{eyre, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use tracing::info;

const CONFIG_FILE_VAR: &str = "CONFIG_FILE";
const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub coap: CoapConfig,
}

#[derive(Deserialize, Clone, Debug)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub root: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct CoapConfig {
    /// `(host, device_model)` pairs, one bridge per entry.
    pub devices: Vec<(String, String)>,
    /// Seconds to wait for a CoAP session to establish; 0 waits forever.
    #[serde(default = "default_timeout")]
    pub connection_timeout: u64,
    /// Seconds the request watchdog allows a status poll to run.
    #[serde(default = "default_timeout")]
    pub status_timeout: u64,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_timeout() -> u64 {
    120
}

pub fn load() -> Result<Config> {
    let path = env::var(CONFIG_FILE_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
    let content = fs::read_to_string(&path)
        .map_err(|e| eyre!("Could not read configuration file {}: {}", path, e))?;
    let config: Config =
        toml::from_str(&content).map_err(|e| eyre!("Could not parse configuration: {}", e))?;
    info!("Loaded configuration: {:?}", config);
    Ok(config)
}

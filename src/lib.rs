//! # coap2mqtt
//!
//! Bridges a fleet of CoAP-speaking Philips humidifier/air-purifier devices
//! onto an MQTT bus. One [`bridge::DeviceBridge`] per configured host keeps a
//! long-lived CoAP session alive, polls the device status, and publishes
//! differential updates under `<root>/<host>/<attribute>`; inbound
//! `<root>/<host>/set/<attribute>` messages are routed back to the owning
//! bridge and pushed to the device as control commands.
//!
//! ```text
//! src/
//! ├── config.rs   - toml configuration (CONFIG_FILE)
//! ├── device/     - typed device model over the raw CoAP dictionary
//! ├── coap/       - CoAP client seam and UDP transport
//! ├── bridge/     - per-device session state machine and supervision
//! └── mqtt/       - broker connection, publishing and command dispatch
//! ```

pub mod bridge;
pub mod coap;
pub mod config;
pub mod device;
pub mod mqtt;

//! MQTT broker connection.
//!
//! One multiplexed connection serves every bridge: device events go out under
//! `<root>/<host>/...`, and the subscribe loop dispatches inbound
//! `<root>/<host>/set/<attribute>` commands to the [`CommandRouter`].
//! Attribute publishes are differential against the per-host cache of the
//! last published values; `last_update` and `raw_state` go out on every
//! successful poll. Reconnection is the event loop's: poll errors are logged
//! and backed off, and subscriptions are re-established on every ConnAck.

use crate::bridge::StatePublisher;
use crate::config::MqttConfig;
use crate::device::{DeviceState, PropertyValue};
use async_trait::async_trait;
use chrono::{Local, SecondsFormat};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info};

const CLIENT_ID: &str = "coap2mqtt";
const KEEP_ALIVE: Duration = Duration::from_secs(5);
const CHANNEL_CAPACITY: usize = 10;
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Command routing capability the subscribe loop needs from the bridges.
#[async_trait]
pub trait CommandRouter: Send + Sync {
    async fn send_update(&self, host: &str, attribute: &str, value: &str);
}

pub struct MqttConnection {
    client: AsyncClient,
    /// Taken by `observe`; publishes flow once the loop polls it.
    event_loop: Mutex<EventLoop>,
    server: String,
    root: String,
    filter: String,
    /// Per host, the previously published `attribute -> value` view.
    last_states: Mutex<HashMap<String, HashMap<&'static str, PropertyValue>>>,
}

impl MqttConnection {
    pub fn new(config: &MqttConfig) -> Self {
        let mut options = MqttOptions::new(CLIENT_ID, &config.host, config.port);
        options.set_keep_alive(KEEP_ALIVE);
        let (client, event_loop) = AsyncClient::new(options, CHANNEL_CAPACITY);
        Self {
            client,
            event_loop: Mutex::new(event_loop),
            server: config.host.clone(),
            root: config.root.clone(),
            filter: format!("{}/+/set/#", config.root),
            last_states: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe loop: dispatches inbound `set` messages to the router and
    /// keeps the connection alive. Never returns.
    pub async fn observe(&self, router: Arc<dyn CommandRouter>) {
        let mut event_loop = self.event_loop.lock().await;
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to MQTT broker at {}", self.server);
                    if let Err(e) = self.client.subscribe(&self.filter, QoS::AtLeastOnce).await {
                        error!("Could not subscribe to {}: {}", self.filter, e);
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if publish.payload.is_empty() {
                        continue;
                    }
                    let Some((host, attribute)) = parse_set_topic(&self.root, &publish.topic)
                    else {
                        error!("Could not parse MQTT message topic: [{}]", publish.topic);
                        continue;
                    };
                    match std::str::from_utf8(&publish.payload) {
                        Ok(value) => router.send_update(host, attribute, value).await,
                        Err(e) => {
                            error!("Skipping non-UTF-8 payload on [{}]: {}", publish.topic, e)
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Error while observing topics: [{}]", e);
                    sleep(POLL_ERROR_BACKOFF).await;
                }
            }
        }
    }

    async fn publish(&self, host: &str, key: &str, payload: String) {
        let topic = format!("{}/{}/{}", self.root, host, key);
        if let Err(e) = self
            .client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
        {
            error!("Could not publish [{}] for {}: {}", key, host, e);
        }
    }
}

#[async_trait]
impl StatePublisher for MqttConnection {
    async fn publish_state(&self, host: &str, state: &DeviceState) {
        let raw_json = match serde_json::to_string(state.raw()) {
            Ok(json) => json,
            Err(e) => {
                error!("Could not serialize raw state for {}: {}", host, e);
                return;
            }
        };
        debug!("Publishing state for {}: {}", host, raw_json);
        let timestamp = Local::now().to_rfc3339_opts(SecondsFormat::Millis, false);
        self.publish(host, "last_update", timestamp).await;
        self.publish(host, "raw_state", raw_json).await;

        let current = state.as_dict();
        let mut cache = self.last_states.lock().await;
        for (key, payload) in changed_attributes(cache.get(host), &current) {
            debug!("Publishing attribute {}/{}: {}", host, key, payload);
            self.publish(host, key, payload).await;
        }
        cache.insert(host.to_string(), current.into_iter().collect());
    }

    async fn publish_online(&self, host: &str) {
        self.publish(host, "status", "ONLINE".to_string()).await;
    }

    async fn publish_offline(&self, host: &str) {
        self.publish(host, "status", "OFFLINE".to_string()).await;
    }
}

/// Attributes whose value differs from the last published one, as payloads.
fn changed_attributes(
    last: Option<&HashMap<&'static str, PropertyValue>>,
    current: &[(&'static str, PropertyValue)],
) -> Vec<(&'static str, String)> {
    current
        .iter()
        .filter(|(key, value)| last.and_then(|cache| cache.get(key)) != Some(value))
        .map(|(key, value)| (*key, value.to_payload()))
        .collect()
}

/// Matches `<root>/<host>/set/<attribute>`; the host segment may not contain
/// a slash, the attribute may.
fn parse_set_topic<'t>(root: &str, topic: &'t str) -> Option<(&'t str, &'t str)> {
    let rest = topic.strip_prefix(root)?.strip_prefix('/')?;
    let (host, rest) = rest.split_once('/')?;
    let attribute = rest.strip_prefix("set/")?;
    if host.is_empty() || attribute.is_empty() {
        return None;
    }
    Some((host, attribute))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_topics_parse() {
        assert_eq!(
            parse_set_topic("coap_devices", "coap_devices/h1/set/mode"),
            Some(("h1", "mode"))
        );
        assert_eq!(
            parse_set_topic("coap_devices", "coap_devices/h1/set/a/b"),
            Some(("h1", "a/b"))
        );
    }

    #[test]
    fn foreign_topics_do_not_parse() {
        assert_eq!(parse_set_topic("coap_devices", "other/h1/set/mode"), None);
        assert_eq!(parse_set_topic("coap_devices", "coap_devices/h1/mode"), None);
        assert_eq!(parse_set_topic("coap_devices", "coap_devices/h1/set/"), None);
        assert_eq!(parse_set_topic("coap_devices", "coap_devices/h1"), None);
        assert_eq!(
            parse_set_topic("coap_devices", "coap_devices/a/b/set/mode"),
            None
        );
    }

    #[test]
    fn unchanged_attributes_are_not_republished() {
        let current = vec![
            ("power_status", PropertyValue::Member("ON")),
            ("temperature", PropertyValue::Int(21)),
        ];

        // No history: everything goes out
        let first = changed_attributes(None, &current);
        assert_eq!(first.len(), 2);

        // Identical state: nothing goes out
        let cache: HashMap<_, _> = current.iter().cloned().collect();
        assert!(changed_attributes(Some(&cache), &current).is_empty());

        // One attribute changed: only that one goes out
        let next = vec![
            ("power_status", PropertyValue::Member("ON")),
            ("temperature", PropertyValue::Int(22)),
        ];
        let diff = changed_attributes(Some(&cache), &next);
        assert_eq!(diff, vec![("temperature", "22".to_string())]);
    }
}

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use rumqttc::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::{ChannelAdapter, ChannelKind, RenderedPayload};
use crate::GestureEvent;

const MIN_RECONNECT_BACKOFF: Duration = Duration::from_millis(500);
const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// Publishes alerts with QoS 1 to `<topic_prefix>/gesture/<label>`.
pub struct MqttAdapter {
    name: String,
    topic_prefix: String,
    client: Client,
    closing: Arc<AtomicBool>,
    connection_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttAdapter {
    pub fn connect(name: &str, broker: &str, topic_prefix: &str, client_id: &str) -> Result<Self> {
        let endpoint = parse_mqtt_endpoint(broker)?;
        let mut options = MqttOptions::new(client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if endpoint.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, connection) = Client::new(options, 10);
        let closing = Arc::new(AtomicBool::new(false));
        let handle = spawn_connection(name.to_string(), connection, Arc::clone(&closing));
        log::info!(
            "[{}] MQTT client started for {}:{} (TLS: {})",
            name,
            endpoint.host,
            endpoint.port,
            endpoint.use_tls
        );
        Ok(Self {
            name: name.to_string(),
            topic_prefix: topic_prefix.trim_end_matches('/').to_string(),
            client,
            closing,
            connection_handle: Mutex::new(Some(handle)),
        })
    }

    pub fn topic_for(&self, event: &GestureEvent) -> String {
        format!("{}/gesture/{}", self.topic_prefix, event.label())
    }
}

/// Drive the event loop until the adapter is dropped. Connection errors are
/// retried with a capped backoff; publishes queued meanwhile go out once the
/// broker is back.
fn spawn_connection(
    name: String,
    mut connection: Connection,
    closing: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut backoff = MIN_RECONNECT_BACKOFF;
        for event in connection.iter() {
            match event {
                Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {
                    backoff = MIN_RECONNECT_BACKOFF;
                }
                Err(e) => {
                    if closing.load(Ordering::SeqCst) {
                        break;
                    }
                    log::warn!(
                        "[{}] MQTT connection error: {}; reconnecting in {:?}",
                        name,
                        e,
                        backoff
                    );
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(MAX_RECONNECT_BACKOFF);
                }
            }
        }
    })
}

impl ChannelAdapter for MqttAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Mqtt
    }

    fn send(&self, event: &GestureEvent, payload: &RenderedPayload) -> Result<()> {
        let topic = self.topic_for(event);
        self.client
            .try_publish(
                topic.as_str(),
                QoS::AtLeastOnce,
                false,
                payload.json.as_bytes().to_vec(),
            )
            .with_context(|| format!("failed to queue MQTT publish to {}", topic))?;
        Ok(())
    }
}

impl Drop for MqttAdapter {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        let _ = self.client.disconnect();
        let handle = match self.connection_handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

/// Parse `host:port`, `mqtt://host:port` or `mqtts://host:port`.
pub fn parse_mqtt_endpoint(addr: &str) -> Result<MqttEndpoint> {
    let mut use_tls = false;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    let (host, port) = split_host_port(remainder)?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid MQTT port in {}", addr))?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid MQTT port in {}", addr))?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_schemes_and_ipv6() {
        let ep = parse_mqtt_endpoint("mqtts://broker.local:8883").unwrap();
        assert_eq!(ep.host, "broker.local");
        assert_eq!(ep.port, 8883);
        assert!(ep.use_tls);

        let ep = parse_mqtt_endpoint("[::1]:1883").unwrap();
        assert_eq!(ep.host, "::1");
        assert!(!ep.use_tls);

        assert!(parse_mqtt_endpoint("ws://broker:80").is_err());
        assert!(parse_mqtt_endpoint("broker").is_err());
        assert!(parse_mqtt_endpoint(":1883").is_err());
    }
}

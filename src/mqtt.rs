use std::time::Duration;

use log::{debug, error, info};
use rumqttc::{MqttOptions, QoS};
use serde_derive::Serialize;

use crate::config;
use crate::device::DeviceRecord;
use crate::report::AirPodsReport;

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    publisher_id: String,
    topic_path: String,
}

#[derive(Debug, Serialize)]
struct StatusMqttMessage<'a> {
    #[serde(rename = "id")]
    device_id: &'a str,
    address: String,
    rssi: i16,
    #[serde(flatten)]
    status: AirPodsReport,
    retained: bool,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .clone()
            .unwrap_or_else(|| "podwatch".to_string());

        let mut mqttoptions = MqttOptions::new(
            publisher_id.clone(),
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                publisher_id,
                topic_path: config
                    .topic_path
                    .clone()
                    .unwrap_or_else(|| "podwatch".to_string()),
            },
            eventloop,
        )
    }

    /// Drives the connection; outgoing publishes only leave while this runs.
    pub async fn event_loop(eventloop: &mut rumqttc::EventLoop) {
        loop {
            match eventloop.poll().await {
                Ok(rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_))) => {
                    debug!("Connection acknowledged");
                }
                Ok(rumqttc::Event::Incoming(rumqttc::Packet::PubAck(ack))) => {
                    debug!("Publish {} acknowledged", ack.pkid);
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn topic_for(&self, model: &str, device_id: &str) -> String {
        format!(
            "{}/{}/{}",
            self.topic_path,
            self.publisher_id,
            sanitize_name(&format!("{} {}", model, device_id))
        )
    }

    /// Publishes the decoded status of `record`. Records without a decoded
    /// status are skipped.
    pub async fn announce_device(&self, record: &DeviceRecord) -> anyhow::Result<()> {
        let Some(status) = record.status.as_ref() else {
            return Ok(());
        };

        info!(
            "Announcing {} ({}) on MQTT: {}",
            status.model_name(),
            record.id,
            status.battery_summary()
        );
        let message = StatusMqttMessage {
            device_id: &record.id,
            address: record.formatted_address(),
            rssi: record.rssi,
            status: AirPodsReport::from(status),
            retained: false,
        };
        self.client
            .publish(
                self.topic_for(status.model_name(), &record.id),
                QoS::AtLeastOnce,
                false,
                serde_json::to_string(&message)?,
            )
            .await?;
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}

fn sanitize_name(name: &str) -> String {
    // Remove any non-alphanumeric characters and replace spaces with underscores
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name() {
        let name = "AirPods Pro 2 00a1b2c3d4e5";
        let sanitized = super::sanitize_name(name);
        assert_eq!(sanitized, "airpods_pro_2_00a1b2c3d4e5");
    }

    #[test]
    fn test_topic_for() {
        let config = config::MqttConfig {
            host: "localhost".to_string(),
            port: None,
            username: None,
            password: None,
            publisher_id: Some("desk".to_string()),
            topic_path: None,
            keep_alive_seconds: None,
        };
        let (client, _eventloop) = MqttClient::new(&config);
        assert_eq!(
            client.topic_for("AirPods Pro", "00a1b2c3d4e5"),
            "podwatch/desk/airpods_pro_00a1b2c3d4e5"
        );
    }
}

use std::time::Duration;

use serde_derive::Deserialize;

use crate::device::RetentionPolicy;

#[derive(Deserialize, Debug, Default, Clone)]
pub struct AppConfig {
    pub mqtt: Option<MqttConfig>,
    pub scan: Option<ScanConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Clone, Copy, Default)]
pub enum Manufacturer {
    #[default]
    Apple,
}

impl Manufacturer {
    /// https://bitbucket.org/bluetooth-SIG/public/src/main/assigned_numbers/company_identifiers/company_identifiers.yaml
    pub fn company_id(&self) -> u16 {
        match self {
            Manufacturer::Apple => 0x004C,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ScanConfig {
    pub duration_seconds: Option<u64>,
    pub retry_interval_seconds: Option<u64>,
    pub destroy_timeout_millis: Option<u64>,
    pub retention: Option<RetentionPolicy>,
    pub manufacturer: Option<Manufacturer>,
}

impl ScanConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_seconds.unwrap_or(10))
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_seconds.unwrap_or(3))
    }

    pub fn destroy_timeout(&self) -> Duration {
        Duration::from_millis(self.destroy_timeout_millis.unwrap_or(1000))
    }
}

impl AppConfig {
    pub fn scan(&self) -> ScanConfig {
        self.scan.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config() {
        let config_str = r#"
            [mqtt]
            host = "localhost"
            port = 1883
            username = "user"
            password = "pass"

            [scan]
            duration_seconds = 30
            retry_interval_seconds = 5
            retention = "latest_per_address"
            manufacturer = "Apple"
        "#;
        let config: AppConfig = toml::de::from_str(config_str).unwrap();
        assert_eq!(config.mqtt.as_ref().map(|m| m.host.as_str()), Some("localhost"));

        let scan = config.scan();
        assert_eq!(scan.duration(), Duration::from_secs(30));
        assert_eq!(scan.retry_interval(), Duration::from_secs(5));
        assert_eq!(scan.destroy_timeout(), Duration::from_secs(1));
        assert_eq!(scan.retention, Some(RetentionPolicy::LatestPerAddress));
        assert_eq!(scan.manufacturer.unwrap_or_default().company_id(), 76);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: AppConfig = toml::de::from_str("").unwrap();
        assert!(config.mqtt.is_none());

        let scan = config.scan();
        assert_eq!(scan.duration(), Duration::from_secs(10));
        assert_eq!(scan.retry_interval(), Duration::from_secs(3));
        assert!(scan.retention.is_none());
    }
}

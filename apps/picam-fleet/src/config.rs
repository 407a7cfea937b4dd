use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use picam_orchestrator::{AcquisitionTimings, FINAL_IMAGE_RECEIVE_TIMEOUT, PARAM_RECEIVE_POLL_INTERVAL};
use picam_proto::CameraParams;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub broker: BrokerConfig,
    pub host: HostConfig,
    pub deploy: DeployConfig,
    /// Default camera parameters keyed by target identity.
    pub targets: BTreeMap<String, CameraParams>,
    pub timings: TimingsConfig,
}

impl FleetConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("invalid config {}", path.display()))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub hostname: String,
    pub port: u16,
    pub keepalive_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".into(),
            port: 1883,
            keepalive_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub client_name: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            client_name: "picam-host".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    pub username: String,
    pub repo_path: PathBuf,
    pub service_name: String,
    /// Program and arguments run after the bus drops.
    pub reconnect_command: Option<Vec<String>>,
    /// Log lifecycle commands instead of running them.
    pub dry_run: bool,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            username: "pi".into(),
            repo_path: PathBuf::from("/home/pi/picam"),
            service_name: "picam-agent".into(),
            reconnect_command: None,
            dry_run: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimingsConfig {
    pub param_poll_interval_ms: Option<u64>,
    pub final_image_receive_timeout_ms: Option<u64>,
    pub max_run_secs: Option<u64>,
}

impl TimingsConfig {
    pub fn acquisition(&self) -> AcquisitionTimings {
        AcquisitionTimings {
            param_poll_interval: self
                .param_poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(PARAM_RECEIVE_POLL_INTERVAL),
            final_image_receive_timeout: self
                .final_image_receive_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(FINAL_IMAGE_RECEIVE_TIMEOUT),
            max_run_duration: self.max_run_secs.map(Duration::from_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_file_uses_defaults() {
        let config: FleetConfig = toml::from_str("").expect("parse");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.host.client_name, "picam-host");
        assert!(config.deploy.dry_run);
        assert!(config.deploy.reconnect_command.is_none());
        assert!(config.targets.is_empty());
        assert_eq!(config.timings.acquisition(), AcquisitionTimings::default());
    }

    #[test]
    fn parses_targets_and_timings() {
        let config: FleetConfig = toml::from_str(
            r#"
            [broker]
            hostname = "broker.lab"
            keepalive_secs = 30

            [host]
            client_name = "bench-1"

            [deploy]
            dry_run = false
            reconnect_command = ["sudo", "systemctl", "restart", "mosquitto-bridge"]

            [targets.cam-a]
            iso = 400
            awb_mode = "sunlight"

            [targets.cam-b]

            [timings]
            final_image_receive_timeout_ms = 2500
            max_run_secs = 90
            "#,
        )
        .expect("parse");

        assert_eq!(config.broker.hostname, "broker.lab");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.host.client_name, "bench-1");
        assert!(!config.deploy.dry_run);
        assert_eq!(config.deploy.service_name, "picam-agent");
        assert_eq!(
            config.deploy.reconnect_command.as_deref(),
            Some(
                &[
                    "sudo".to_string(),
                    "systemctl".to_string(),
                    "restart".to_string(),
                    "mosquitto-bridge".to_string(),
                ][..]
            )
        );
        assert_eq!(config.targets.keys().collect::<Vec<_>>(), vec!["cam-a", "cam-b"]);
        assert_eq!(config.targets["cam-a"]["iso"], json!(400));
        assert_eq!(config.targets["cam-a"]["awb_mode"], json!("sunlight"));
        assert!(config.targets["cam-b"].is_empty());

        let timings = config.timings.acquisition();
        assert_eq!(timings.param_poll_interval, PARAM_RECEIVE_POLL_INTERVAL);
        assert_eq!(timings.final_image_receive_timeout, Duration::from_millis(2500));
        assert_eq!(timings.max_run_duration, Some(Duration::from_secs(90)));
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = FleetConfig::load(Some(Path::new("/nonexistent/picam-fleet.toml")))
            .expect_err("missing file");
        assert!(err.to_string().contains("failed to read config"));
    }
}

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const DEFAULT_FORMAT: &str = "jpeg";
pub const DEFAULT_CAPTURE_QUALITY: u8 = 100;
pub const DEFAULT_TRANSPORT_QUALITY: u8 = 80;

/// Error returned when an image blob is not valid base64.
pub type ImageDecodeError = base64::DecodeError;

/// Device parameters as reported on the params topic.
pub type CameraParams = Map<String, Value>;

/// Actions accepted on the control topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Capture,
    UpdateParameters,
}

impl ControlAction {
    pub fn from_action(action: &str) -> Option<Self> {
        match action {
            "capture" => Some(ControlAction::Capture),
            "update_parameters" => Some(ControlAction::UpdateParameters),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ControlAction::Capture => "capture",
            ControlAction::UpdateParameters => "update_parameters",
        }
    }

    /// Encodes `body` as a control command tagged with this action.
    pub fn encode<T: Serialize>(self, body: &T) -> serde_json::Result<Vec<u8>> {
        #[derive(Serialize)]
        struct Tagged<'a, T> {
            action: ControlAction,
            #[serde(flatten)]
            body: &'a T,
        }
        serde_json::to_vec(&Tagged { action: self, body })
    }
}

/// Encoder options. `quality` is the only option the protocol interprets;
/// anything else is passed through to the device untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormatParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

impl FormatParams {
    pub fn with_quality(quality: u8) -> Self {
        Self {
            quality: Some(quality),
            options: Map::new(),
        }
    }
}

/// Wall-clock timestamp as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since the Unix epoch.
    pub time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datetime: Option<String>,
}

impl Timestamp {
    pub fn now() -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            time: now.unix_timestamp_nanos() as f64 / 1_000_000_000.0,
            datetime: now.format(&Rfc3339).ok(),
        }
    }

    pub fn from_epoch(time: f64) -> Self {
        Self {
            time,
            datetime: None,
        }
    }
}

/// Body of a `capture` control command. Every field is optional; the agent
/// fills in its own defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_time: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Applies to both the stored capture and the transport copy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format_params: Option<FormatParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_format_params: Option<FormatParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_format_params: Option<FormatParams>,
}

impl CaptureRequest {
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        ControlAction::Capture.encode(self)
    }
}

/// Published on the imaging topic once per successful capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureResult {
    pub metadata: Value,
    pub command_time: Timestamp,
    pub capture_time: Timestamp,
    pub format: String,
    pub capture_format_params: FormatParams,
    pub transport_format_params: FormatParams,
    pub camera_params: CameraParams,
    /// Transport copy of the image, standard base64.
    pub image: String,
}

impl CaptureResult {
    pub fn encode_image(bytes: &[u8]) -> String {
        STANDARD.encode(bytes)
    }

    pub fn image_bytes(&self) -> Result<Vec<u8>, ImageDecodeError> {
        STANDARD.decode(self.image.as_bytes())
    }
}

/// Plain-text lifecycle commands accepted on the deployment topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeploymentCommand {
    Reboot,
    Shutdown,
    Restart,
    /// Pull the deployed checkout, then restart.
    GitPull,
    /// End the agent's own run loop.
    Stop,
}

impl DeploymentCommand {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "reboot" => Some(DeploymentCommand::Reboot),
            "shutdown" => Some(DeploymentCommand::Shutdown),
            "restart" => Some(DeploymentCommand::Restart),
            "git pull" => Some(DeploymentCommand::GitPull),
            "stop" => Some(DeploymentCommand::Stop),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentCommand::Reboot => "reboot",
            DeploymentCommand::Shutdown => "shutdown",
            DeploymentCommand::Restart => "restart",
            DeploymentCommand::GitPull => "git pull",
            DeploymentCommand::Stop => "stop",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn capture_command_is_tagged_and_sparse() {
        let request = CaptureRequest {
            format: Some("png".into()),
            ..CaptureRequest::default()
        };
        let value: Value = serde_json::from_slice(&request.encode().expect("encode")).expect("json");
        assert_eq!(value, json!({"action": "capture", "format": "png"}));
    }

    #[test]
    fn update_command_flattens_parameters() {
        let mut params = CameraParams::new();
        params.insert("iso".into(), json!(400));
        let bytes = ControlAction::UpdateParameters
            .encode(&params)
            .expect("encode");
        let value: Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(value, json!({"action": "update_parameters", "iso": 400}));
    }

    #[test]
    fn capture_request_ignores_action_and_unknown_fields() {
        let request: CaptureRequest = serde_json::from_value(json!({
            "action": "capture",
            "format_params": {"quality": 55, "progressive": true},
            "extra": 1
        }))
        .expect("decode");
        let params = request.format_params.expect("format params");
        assert_eq!(params.quality, Some(55));
        assert_eq!(params.options.get("progressive"), Some(&json!(true)));
    }

    #[test]
    fn known_actions_only() {
        assert_eq!(ControlAction::from_action("capture"), Some(ControlAction::Capture));
        assert_eq!(
            ControlAction::from_action("update_parameters"),
            Some(ControlAction::UpdateParameters)
        );
        assert_eq!(ControlAction::from_action("acquire_image"), None);
        assert_eq!(ControlAction::from_action("Capture"), None);
    }

    #[test]
    fn deployment_vocabulary_is_exact() {
        for command in [
            DeploymentCommand::Reboot,
            DeploymentCommand::Shutdown,
            DeploymentCommand::Restart,
            DeploymentCommand::GitPull,
            DeploymentCommand::Stop,
        ] {
            assert_eq!(DeploymentCommand::parse(command.as_str()), Some(command));
        }
        assert_eq!(DeploymentCommand::parse("git  pull"), None);
        assert_eq!(DeploymentCommand::parse("Reboot"), None);
        assert_eq!(DeploymentCommand::parse(""), None);
    }

    #[test]
    fn timestamp_now_carries_readable_form() {
        let stamp = Timestamp::now();
        assert!(stamp.time > 1_600_000_000.0);
        assert!(stamp.datetime.is_some());
        let value = serde_json::to_value(Timestamp::from_epoch(1.5)).expect("encode");
        assert_eq!(value, json!({"time": 1.5}));
    }

    #[test]
    fn image_blob_decodes() {
        let result = CaptureResult {
            metadata: json!({}),
            command_time: Timestamp::from_epoch(0.0),
            capture_time: Timestamp::from_epoch(0.0),
            format: DEFAULT_FORMAT.into(),
            capture_format_params: FormatParams::with_quality(DEFAULT_CAPTURE_QUALITY),
            transport_format_params: FormatParams::with_quality(DEFAULT_TRANSPORT_QUALITY),
            camera_params: CameraParams::new(),
            image: CaptureResult::encode_image(&[0xff, 0xd8, 0x00]),
        };
        assert_eq!(result.image_bytes().expect("decode"), vec![0xff, 0xd8, 0x00]);
    }
}

use std::sync::Arc;

use picam_proto::{
    CameraParams, CaptureRequest, CaptureResult, FormatParams, Timestamp, TopicClient, TopicName,
    DEFAULT_CAPTURE_QUALITY, DEFAULT_FORMAT, DEFAULT_TRANSPORT_QUALITY,
};
use serde_json::json;
use tracing::{debug, info};
use transport_bus::Bus;

use crate::camera::Camera;
use crate::AgentResult;

/// Capture settings used when a request leaves them out.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureDefaults {
    pub format: String,
    pub capture: FormatParams,
    pub transport: FormatParams,
}

impl Default for CaptureDefaults {
    fn default() -> Self {
        Self {
            format: DEFAULT_FORMAT.to_string(),
            capture: FormatParams::with_quality(DEFAULT_CAPTURE_QUALITY),
            transport: FormatParams::with_quality(DEFAULT_TRANSPORT_QUALITY),
        }
    }
}

/// Executes imaging actions against a camera and publishes their results.
pub struct ImagingAgent<B: Bus> {
    client: TopicClient<B>,
    camera: Arc<dyn Camera>,
    defaults: CaptureDefaults,
}

impl<B: Bus> ImagingAgent<B> {
    pub fn new(client: TopicClient<B>, camera: Arc<dyn Camera>, defaults: CaptureDefaults) -> Self {
        Self {
            client,
            camera,
            defaults,
        }
    }

    pub fn identity(&self) -> &str {
        self.client.identity()
    }

    /// Captures one image and publishes it on the imaging topic.
    ///
    /// The device is asked twice: once at storage fidelity and once for the
    /// transport copy that goes on the wire. Device faults are returned as-is
    /// with nothing published.
    pub fn capture(&self, request: CaptureRequest) -> AgentResult<CaptureResult> {
        let command_time = request.command_time.unwrap_or_else(Timestamp::now);
        let metadata = request
            .metadata
            .unwrap_or_else(|| json!({ "client_name": self.identity() }));
        let format = request
            .format
            .unwrap_or_else(|| self.defaults.format.clone());
        let capture_format_params = request
            .capture_format_params
            .or_else(|| request.format_params.clone())
            .unwrap_or_else(|| self.defaults.capture.clone());
        let transport_format_params = request
            .transport_format_params
            .or(request.format_params)
            .unwrap_or_else(|| self.defaults.transport.clone());

        let stored = self.camera.capture(&format, &capture_format_params)?;
        let transport = self.camera.capture(&format, &transport_format_params)?;
        let capture_time = Timestamp::now();
        debug!(
            target = "picam.imaging",
            stored_bytes = stored.len(),
            transport_bytes = transport.len(),
            "captured image"
        );

        let result = CaptureResult {
            metadata,
            command_time,
            capture_time,
            format,
            capture_format_params,
            transport_format_params,
            camera_params: self.camera.current_params(),
            image: CaptureResult::encode_image(&transport),
        };
        let payload = serde_json::to_vec(&result)?;
        info!(
            target = "picam.imaging",
            topic = %self.client.topic_path(TopicName::Imaging)?,
            "publishing image"
        );
        self.client.publish(TopicName::Imaging, payload)?;
        Ok(result)
    }

    /// Applies the recognised parameters of an `update_parameters` command
    /// and reports the resulting parameter set. Unknown keys are ignored.
    pub fn update_parameters(&self, command: &CameraParams) -> AgentResult<Vec<String>> {
        let mut updates = command.clone();
        updates.remove("action");
        let applied = self.camera.apply_params(&updates);
        let ignored = updates.len() - applied.len();
        info!(
            target = "picam.imaging",
            applied = ?applied,
            ignored,
            "updated camera parameters"
        );
        self.publish_params()?;
        Ok(applied)
    }

    /// Publishes the camera's current parameters on the params topic.
    pub fn publish_params(&self) -> AgentResult<()> {
        let payload = serde_json::to_vec(&self.camera.current_params())?;
        self.client.publish(TopicName::Params, payload)?;
        Ok(())
    }
}

use parking_lot::Mutex;
use picam_proto::{CameraParams, FormatParams};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("unsupported image format {0}")]
    UnsupportedFormat(String),
    #[error("invalid encoder option {name}: {reason}")]
    InvalidOption { name: String, reason: String },
    #[error("capture device fault: {0}")]
    Device(String),
}

/// Capture device collaborator.
pub trait Camera: Send + Sync {
    /// Takes an exposure and returns it encoded as `format`.
    fn capture(&self, format: &str, params: &FormatParams) -> Result<Vec<u8>, CameraError>;

    fn current_params(&self) -> CameraParams;

    /// Applies the keys this device understands and returns their names.
    /// Unknown keys and values of the wrong type are ignored.
    fn apply_params(&self, updates: &CameraParams) -> Vec<String>;
}

#[derive(Debug, Clone, PartialEq)]
struct PatternSettings {
    width: u32,
    height: u32,
    iso: u64,
    shutter_speed: u64,
    awb_mode: String,
    brightness: i64,
}

impl Default for PatternSettings {
    fn default() -> Self {
        Self {
            width: 1640,
            height: 1232,
            iso: 100,
            shutter_speed: 0,
            awb_mode: "auto".into(),
            brightness: 50,
        }
    }
}

/// Deterministic stand-in for a camera module.
///
/// Frames are a format magic followed by a byte ramp whose length scales with
/// the requested quality, so encoder settings stay observable in tests.
#[derive(Debug, Default)]
pub struct TestPatternCamera {
    settings: Mutex<PatternSettings>,
    frames: Mutex<u64>,
}

impl TestPatternCamera {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_taken(&self) -> u64 {
        *self.frames.lock()
    }
}

/// Largest accepted sensor width or height, in pixels.
pub const MAX_DIMENSION: u32 = 8192;

fn dimension(value: &Value) -> Option<u32> {
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .filter(|v| (1..=MAX_DIMENSION).contains(v))
}

fn magic(format: &str) -> Option<&'static [u8]> {
    match format {
        "jpeg" | "jpg" => Some(&[0xff, 0xd8, 0xff]),
        "png" => Some(&[0x89, b'P', b'N', b'G']),
        "bmp" => Some(b"BM"),
        _ => None,
    }
}

impl Camera for TestPatternCamera {
    fn capture(&self, format: &str, params: &FormatParams) -> Result<Vec<u8>, CameraError> {
        let header = magic(format).ok_or_else(|| CameraError::UnsupportedFormat(format.into()))?;
        let quality = params.quality.unwrap_or(100);
        if quality == 0 || quality > 100 {
            return Err(CameraError::InvalidOption {
                name: "quality".into(),
                reason: format!("{quality} is outside 1..=100"),
            });
        }

        let settings = self.settings.lock().clone();
        let frame = {
            let mut frames = self.frames.lock();
            *frames += 1;
            *frames
        };

        let pixels = (settings.width as usize * settings.height as usize) / 4096;
        let body_len = (pixels * quality as usize / 100).max(1);
        let mut image = Vec::with_capacity(header.len() + 8 + body_len);
        image.extend_from_slice(header);
        image.extend_from_slice(&frame.to_be_bytes());
        image.extend((0..body_len).map(|i| (i as u64 + frame + settings.brightness as u64) as u8));
        Ok(image)
    }

    fn current_params(&self) -> CameraParams {
        let settings = self.settings.lock();
        let value = json!({
            "resolution": [settings.width, settings.height],
            "iso": settings.iso,
            "shutter_speed": settings.shutter_speed,
            "awb_mode": settings.awb_mode,
            "brightness": settings.brightness,
        });
        match value {
            Value::Object(map) => map,
            _ => CameraParams::new(),
        }
    }

    fn apply_params(&self, updates: &CameraParams) -> Vec<String> {
        let mut settings = self.settings.lock();
        let mut applied = Vec::new();
        for (key, value) in updates {
            let accepted = match key.as_str() {
                "iso" => value.as_u64().map(|iso| settings.iso = iso).is_some(),
                "shutter_speed" => value
                    .as_u64()
                    .map(|speed| settings.shutter_speed = speed)
                    .is_some(),
                "awb_mode" => value
                    .as_str()
                    .map(|mode| settings.awb_mode = mode.to_string())
                    .is_some(),
                "brightness" => value
                    .as_i64()
                    .filter(|b| (0..=100).contains(b))
                    .map(|b| settings.brightness = b)
                    .is_some(),
                "resolution" => match value.as_array().map(|dims| dims.as_slice()) {
                    Some([w, h]) => match (dimension(w), dimension(h)) {
                        (Some(w), Some(h)) => {
                            settings.width = w;
                            settings.height = h;
                            true
                        }
                        _ => false,
                    },
                    _ => false,
                },
                _ => false,
            };
            if accepted {
                applied.push(key.clone());
            }
        }
        applied
    }
}

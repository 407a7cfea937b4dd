use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use picam_proto::CaptureResult;
use serde_json::Value;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("capture image is not valid base64: {0}")]
    Image(#[from] picam_proto::messages::ImageDecodeError),
    #[error("failed to encode capture metadata: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where a recorded capture ended up.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCapture {
    pub target: String,
    pub capture_time: f64,
    pub image_path: Option<PathBuf>,
    pub metadata_path: Option<PathBuf>,
}

#[async_trait]
pub trait CaptureStore: Send + Sync {
    async fn store(&self, target: &str, capture: &CaptureResult)
        -> Result<StoredCapture, StoreError>;
}

/// Writes each capture as an image file plus a JSON sidecar holding
/// everything but the image blob.
#[derive(Debug, Clone)]
pub struct FileCaptureStore {
    dir: PathBuf,
    prefix: String,
}

impl FileCaptureStore {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_stem(&self, target: &str, capture: &CaptureResult) -> String {
        let stamp = capture
            .capture_time
            .datetime
            .clone()
            .unwrap_or_else(|| format!("{:.3}", capture.capture_time.time));
        format!(
            "{}_{}_{}",
            sanitize(&self.prefix),
            sanitize(target),
            sanitize(&stamp)
        )
    }
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

async fn write(path: PathBuf, contents: &[u8]) -> Result<PathBuf, StoreError> {
    match tokio::fs::write(&path, contents).await {
        Ok(()) => Ok(path),
        Err(source) => Err(StoreError::Io { path, source }),
    }
}

#[async_trait]
impl CaptureStore for FileCaptureStore {
    async fn store(
        &self,
        target: &str,
        capture: &CaptureResult,
    ) -> Result<StoredCapture, StoreError> {
        let image = capture.image_bytes()?;
        let mut metadata = serde_json::to_value(capture)?;
        if let Value::Object(fields) = &mut metadata {
            fields.remove("image");
        }
        let metadata = serde_json::to_vec_pretty(&metadata)?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| StoreError::Io {
                path: self.dir.clone(),
                source,
            })?;
        let stem = self.file_stem(target, capture);
        let image_path = write(
            self.dir.join(format!("{stem}.{}", sanitize(&capture.format))),
            &image,
        )
        .await?;
        let metadata_path = write(self.dir.join(format!("{stem}.json")), &metadata).await?;

        Ok(StoredCapture {
            target: target.to_string(),
            capture_time: capture.capture_time.time,
            image_path: Some(image_path),
            metadata_path: Some(metadata_path),
        })
    }
}

/// In-memory adapter for tests and dry runs.
#[derive(Default)]
pub struct InMemoryCaptureStore {
    captures: Mutex<Vec<(String, CaptureResult)>>,
}

impl InMemoryCaptureStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn captures(&self) -> Vec<(String, CaptureResult)> {
        self.captures.lock().await.clone()
    }
}

#[async_trait]
impl CaptureStore for InMemoryCaptureStore {
    async fn store(
        &self,
        target: &str,
        capture: &CaptureResult,
    ) -> Result<StoredCapture, StoreError> {
        self.captures
            .lock()
            .await
            .push((target.to_string(), capture.clone()));
        Ok(StoredCapture {
            target: target.to_string(),
            capture_time: capture.capture_time.time,
            image_path: None,
            metadata_path: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use picam_proto::{CameraParams, FormatParams, Timestamp};
    use serde_json::json;

    fn capture(image: &[u8]) -> CaptureResult {
        CaptureResult {
            metadata: json!({"client_name": "cam-1"}),
            command_time: Timestamp::from_epoch(10.0),
            capture_time: Timestamp {
                time: 11.25,
                datetime: Some("2026-10-16T08:30:00.25Z".into()),
            },
            format: "jpeg".into(),
            capture_format_params: FormatParams::with_quality(100),
            transport_format_params: FormatParams::with_quality(80),
            camera_params: CameraParams::new(),
            image: CaptureResult::encode_image(image),
        }
    }

    #[tokio::test]
    async fn writes_image_and_sidecar() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileCaptureStore::new(dir.path().join("captures"), "acquire");

        let stored = store
            .store("cam-1", &capture(&[1, 2, 3]))
            .await
            .expect("stored");
        let image_path = stored.image_path.expect("image path");
        assert_eq!(
            image_path.file_name().and_then(|n| n.to_str()),
            Some("acquire_cam-1_2026-10-16T08-30-00.25Z.jpeg")
        );
        assert_eq!(std::fs::read(&image_path).expect("image"), vec![1, 2, 3]);

        let sidecar: Value = serde_json::from_slice(
            &std::fs::read(stored.metadata_path.expect("metadata path")).expect("sidecar"),
        )
        .expect("json");
        assert!(sidecar.get("image").is_none());
        assert_eq!(sidecar["metadata"]["client_name"], "cam-1");
        assert_eq!(sidecar["capture_time"]["time"], 11.25);
    }

    #[tokio::test]
    async fn rejects_corrupt_images() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileCaptureStore::new(dir.path(), "acquire");
        let mut broken = capture(&[1]);
        broken.image = "%%%".into();
        let err = store.store("cam-1", &broken).await.expect_err("bad base64");
        assert!(matches!(err, StoreError::Image(_)));
    }

    #[tokio::test]
    async fn in_memory_store_keeps_order() {
        let store = InMemoryCaptureStore::new();
        store.store("cam-1", &capture(&[1])).await.expect("stored");
        store.store("cam-2", &capture(&[2])).await.expect("stored");
        let targets: Vec<_> = store
            .captures()
            .await
            .into_iter()
            .map(|(target, _)| target)
            .collect();
        assert_eq!(targets, vec!["cam-1", "cam-2"]);
    }
}

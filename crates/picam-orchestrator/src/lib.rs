//! Host side of the picam control plane.
//!
//! An [`AcquisitionOrchestrator`] pushes parameters to a fixed set of
//! targets, waits until at least one of them reports back, requests one
//! capture from every target and then gives the replies a grace period to
//! arrive. Received captures are handed to a [`CaptureStore`].

pub mod acquisition;
pub mod store;
pub mod targets;

pub use acquisition::{
    AcquisitionOrchestrator, AcquisitionPlan, AcquisitionTimings, Phase, PhaseTransition,
    RunOutcome, RunReport, StopHandle, FINAL_IMAGE_RECEIVE_TIMEOUT, PARAM_RECEIVE_POLL_INTERVAL,
};
pub use store::{CaptureStore, FileCaptureStore, InMemoryCaptureStore, StoreError, StoredCapture};
pub use targets::{TargetState, TargetTracker};

use picam_proto::ProtoError;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Proto(#[from] ProtoError),
    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("bus closed before the run started")]
    BusClosed,
    #[error("orchestrator has already run")]
    AlreadyRun,
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

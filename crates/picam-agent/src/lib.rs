//! Device-side picam agent.
//!
//! Responsibilities:
//! - decoding and routing control commands (`capture`, `update_parameters`)
//! - capturing images and publishing them on the imaging topic
//! - reporting camera parameters whenever the bus (re)connects
//! - handing lifecycle commands to a deployment collaborator without blocking

pub mod camera;
pub mod deploy;
pub mod dispatcher;
pub mod imaging;
pub mod runtime;

pub use camera::{Camera, CameraError, TestPatternCamera};
pub use deploy::{
    dispatch_deployment, DeployError, DeploymentAgent, DeploymentDisposition,
    DryRunDeploymentAgent, SystemDeploymentAgent,
};
pub use dispatcher::{ControlDispatcher, Dispatch, DropReason};
pub use imaging::{CaptureDefaults, ImagingAgent};
pub use runtime::{AgentExit, AgentRuntime};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error(transparent)]
    Proto(#[from] picam_proto::ProtoError),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type AgentResult<T> = Result<T, AgentError>;

//! Shared protocol definitions for the picam control plane.
//!
//! Agents and orchestrators agree on three things through this crate:
//! - the topic table and how topic paths are namespaced per client identity
//! - the JSON shapes carried on the control, params and imaging topics
//! - the plain-text deployment vocabulary

pub mod client;
pub mod messages;
pub mod topics;

pub use client::TopicClient;
pub use messages::{
    CameraParams, CaptureRequest, CaptureResult, ControlAction, DeploymentCommand, FormatParams,
    Timestamp, DEFAULT_CAPTURE_QUALITY, DEFAULT_FORMAT, DEFAULT_TRANSPORT_QUALITY,
};
pub use topics::{target_of, TopicConfig, TopicName, TopicTable, NAMESPACE_SEPARATOR};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("topic {0} is not configured for this client")]
    UnknownTopic(TopicName),
    #[error(transparent)]
    Bus(#[from] transport_bus::BusError),
}

pub type ProtoResult<T> = Result<T, ProtoError>;

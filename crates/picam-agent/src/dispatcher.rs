use std::sync::Arc;

use picam_proto::{CaptureRequest, ControlAction};
use serde_json::Value;
use tracing::{error, info};
use transport_bus::Bus;

use crate::imaging::ImagingAgent;
use crate::AgentResult;

/// Why a control message was dropped without running a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Payload was not a JSON document.
    Malformed,
    MissingAction,
    UnknownAction(String),
    /// Action was known but its fields did not fit the action's shape.
    InvalidBody(ControlAction),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Handled(ControlAction),
    Dropped(DropReason),
}

/// Decodes control-topic payloads and routes them to the imaging agent.
///
/// Bad input is logged and dropped here. Handler failures are returned to the
/// caller untouched.
pub struct ControlDispatcher<B: Bus> {
    imaging: Arc<ImagingAgent<B>>,
}

impl<B: Bus> ControlDispatcher<B> {
    pub fn new(imaging: Arc<ImagingAgent<B>>) -> Self {
        Self { imaging }
    }

    pub fn on_message(&self, topic: &str, raw: &[u8]) -> AgentResult<Dispatch> {
        let command: Value = match serde_json::from_slice(raw) {
            Ok(value) => value,
            Err(err) => {
                error!(
                    target = "picam.control",
                    %topic,
                    error = %err,
                    payload = %String::from_utf8_lossy(raw),
                    "malformed control command"
                );
                return Ok(Dispatch::Dropped(DropReason::Malformed));
            }
        };

        let action = match command.get("action").and_then(Value::as_str) {
            Some(name) => match ControlAction::from_action(name) {
                Some(action) => action,
                None => {
                    error!(target = "picam.control", %topic, action = name, "unknown control action");
                    return Ok(Dispatch::Dropped(DropReason::UnknownAction(name.to_string())));
                }
            },
            None => {
                error!(target = "picam.control", %topic, %command, "missing control action");
                return Ok(Dispatch::Dropped(DropReason::MissingAction));
            }
        };

        match action {
            ControlAction::Capture => {
                let request: CaptureRequest = match serde_json::from_value(command) {
                    Ok(request) => request,
                    Err(err) => return Ok(invalid_body(topic, action, &err)),
                };
                log_running(action);
                self.imaging.capture(request)?;
            }
            ControlAction::UpdateParameters => {
                let Value::Object(params) = command else {
                    return Ok(Dispatch::Dropped(DropReason::InvalidBody(action)));
                };
                log_running(action);
                self.imaging.update_parameters(&params)?;
            }
        }
        Ok(Dispatch::Handled(action))
    }
}

fn log_running(action: ControlAction) {
    info!(target = "picam.control", action = action.as_str(), "running control command");
}

fn invalid_body(topic: &str, action: ControlAction, err: &serde_json::Error) -> Dispatch {
    error!(
        target = "picam.control",
        %topic,
        action = action.as_str(),
        error = %err,
        "malformed control command"
    );
    Dispatch::Dropped(DropReason::InvalidBody(action))
}

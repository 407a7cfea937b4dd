use std::collections::BTreeMap;

use parking_lot::Mutex;
use picam_proto::CameraParams;

/// What the orchestrator knows about one target during a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetState {
    /// Set by the first parameter report; never cleared during a run.
    pub received_params: bool,
    pub params: Option<CameraParams>,
    pub reports: u32,
}

/// Per-target state shared between the bus workers and the run loop.
///
/// The lock is only held for the duration of a single read or update and
/// never across an await point.
#[derive(Debug, Default)]
pub struct TargetTracker {
    targets: Mutex<BTreeMap<String, TargetState>>,
}

impl TargetTracker {
    pub fn new<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            targets: Mutex::new(
                targets
                    .into_iter()
                    .map(|target| (target.into(), TargetState::default()))
                    .collect(),
            ),
        }
    }

    /// Records a parameter report. Returns false for identities that are not
    /// configured targets; those reports are ignored.
    pub fn record_params(&self, target: &str, params: Option<CameraParams>) -> bool {
        let mut guard = self.targets.lock();
        let Some(state) = guard.get_mut(target) else {
            return false;
        };
        state.received_params = true;
        state.reports += 1;
        if params.is_some() {
            state.params = params;
        }
        true
    }

    pub fn any_reported(&self) -> bool {
        self.targets.lock().values().any(|state| state.received_params)
    }

    pub fn reported(&self) -> Vec<String> {
        self.targets
            .lock()
            .iter()
            .filter(|(_, state)| state.received_params)
            .map(|(target, _)| target.clone())
            .collect()
    }

    pub fn targets(&self) -> Vec<String> {
        self.targets.lock().keys().cloned().collect()
    }

    pub fn state(&self, target: &str) -> Option<TargetState> {
        self.targets.lock().get(target).cloned()
    }
}

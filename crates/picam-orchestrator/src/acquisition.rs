use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use picam_proto::{
    target_of, CameraParams, CaptureRequest, CaptureResult, ControlAction, Timestamp, TopicClient,
    TopicName,
};
use serde_json::json;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, info, warn};
use transport_bus::{Bus, BusMessage, ConnectionState};

use crate::store::{CaptureStore, StoredCapture};
use crate::targets::TargetTracker;
use crate::{OrchestratorError, OrchestratorResult};

pub const PARAM_RECEIVE_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const FINAL_IMAGE_RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionTimings {
    pub param_poll_interval: Duration,
    /// Grace period granted to replies after the requests go out.
    pub final_image_receive_timeout: Duration,
    /// Hard cap on the whole run, including the wait for parameters.
    pub max_run_duration: Option<Duration>,
}

impl Default for AcquisitionTimings {
    fn default() -> Self {
        Self {
            param_poll_interval: PARAM_RECEIVE_POLL_INTERVAL,
            final_image_receive_timeout: FINAL_IMAGE_RECEIVE_TIMEOUT,
            max_run_duration: None,
        }
    }
}

/// Targets of a run and the default parameters pushed to each of them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AcquisitionPlan {
    pub targets: BTreeMap<String, CameraParams>,
    /// Tag attached to every capture request.
    pub capture_name: String,
}

impl AcquisitionPlan {
    pub fn new<I, S>(targets: I, capture_name: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            targets: targets
                .into_iter()
                .map(|target| (target.into(), CameraParams::new()))
                .collect(),
            capture_name: capture_name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingParams,
    RequestingImages,
    Draining,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The grace period elapsed after requests went out.
    Completed,
    Stopped,
    DeadlineReached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTransition {
    pub phase: Phase,
    /// Offset from the moment the run started.
    pub at: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub transitions: Vec<PhaseTransition>,
    /// Targets that had reported parameters when the run ended.
    pub reported: Vec<String>,
    /// Targets a capture request was published to.
    pub requested: Vec<String>,
    /// Results recorded by the time the run ended.
    pub results_received: usize,
}

impl RunReport {
    pub fn entered(&self, phase: Phase) -> Option<Duration> {
        self.transitions
            .iter()
            .find(|transition| transition.phase == phase)
            .map(|transition| transition.at)
    }

    /// Time spent in `phase`. `None` if the phase was never entered or is
    /// the last one.
    pub fn time_in(&self, phase: Phase) -> Option<Duration> {
        let index = self
            .transitions
            .iter()
            .position(|transition| transition.phase == phase)?;
        let next = self.transitions.get(index + 1)?;
        Some(next.at - self.transitions[index].at)
    }
}

/// Ends a run from outside the run loop.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }
}

enum Wake {
    Elapsed,
    Stopped,
    Deadline,
}

struct Transitions {
    started: Instant,
    log: Vec<PhaseTransition>,
}

impl Transitions {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            log: Vec::new(),
        }
    }

    fn enter(&mut self, phase: Phase) {
        let at = self.started.elapsed();
        debug!(target = "picam.acquire", ?phase, ?at, "entering phase");
        self.log.push(PhaseTransition { phase, at });
    }
}

/// Drives one acquisition run over a fixed set of targets.
///
/// An orchestrator runs at most once; target state is never carried into a
/// second run, so a fresh instance is needed for each acquisition.
///
/// Parameter reports and capture results are consumed by background workers
/// that only share the [`TargetTracker`] and the record of stored captures
/// with the run loop. Results keep being recorded after the run terminates,
/// until [`AcquisitionOrchestrator::shutdown`] is called or the orchestrator
/// is dropped.
pub struct AcquisitionOrchestrator<B: Bus + 'static> {
    client: TopicClient<B>,
    plan: AcquisitionPlan,
    timings: AcquisitionTimings,
    tracker: Arc<TargetTracker>,
    store: Arc<dyn CaptureStore>,
    recorded: Arc<Mutex<Vec<StoredCapture>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stop: Arc<watch::Sender<bool>>,
    started: AtomicBool,
}

impl<B: Bus + 'static> AcquisitionOrchestrator<B> {
    pub fn new(
        client: TopicClient<B>,
        plan: AcquisitionPlan,
        timings: AcquisitionTimings,
        store: Arc<dyn CaptureStore>,
    ) -> Self {
        let tracker = Arc::new(TargetTracker::new(plan.targets.keys().cloned()));
        let (stop, _) = watch::channel(false);
        Self {
            client,
            plan,
            timings,
            tracker,
            store,
            recorded: Arc::new(Mutex::new(Vec::new())),
            workers: Mutex::new(Vec::new()),
            stop: Arc::new(stop),
            started: AtomicBool::new(false),
        }
    }

    pub fn tracker(&self) -> &Arc<TargetTracker> {
        &self.tracker
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: Arc::clone(&self.stop),
        }
    }

    /// Captures recorded so far, including any that arrived after the run ended.
    pub fn recorded(&self) -> Vec<StoredCapture> {
        self.recorded.lock().clone()
    }

    pub fn shutdown(&self) {
        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }
    }

    /// Runs the acquisition. Fails with [`OrchestratorError::AlreadyRun`] when
    /// called a second time.
    pub async fn run(&self) -> OrchestratorResult<RunReport> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(OrchestratorError::AlreadyRun);
        }
        let mut stop = self.stop.subscribe();
        if !self.wait_for_connection(&mut stop).await? {
            return Ok(self.report(RunOutcome::Stopped, Vec::new(), Vec::new()));
        }

        self.start_workers()?;
        self.request_params();

        let mut transitions = Transitions::new();
        let deadline = self
            .timings
            .max_run_duration
            .map(|cap| transitions.started + cap);
        let mut requested = Vec::new();
        let mut phase = Phase::AwaitingParams;
        transitions.enter(phase);

        let outcome = loop {
            match phase {
                Phase::AwaitingParams => {
                    if self.tracker.any_reported() {
                        info!(
                            target = "picam.acquire",
                            reported = ?self.tracker.reported(),
                            "received camera params, requesting images"
                        );
                        phase = Phase::RequestingImages;
                        transitions.enter(phase);
                        continue;
                    }
                    match pause(self.timings.param_poll_interval, deadline, &mut stop).await {
                        Wake::Elapsed => {}
                        Wake::Stopped => break RunOutcome::Stopped,
                        Wake::Deadline => break RunOutcome::DeadlineReached,
                    }
                }
                Phase::RequestingImages => {
                    requested = self.request_images();
                    info!(
                        target = "picam.acquire",
                        grace = ?self.timings.final_image_receive_timeout,
                        "requested images, waiting for results"
                    );
                    phase = Phase::Draining;
                    transitions.enter(phase);
                }
                Phase::Draining => {
                    match pause(self.timings.final_image_receive_timeout, deadline, &mut stop).await
                    {
                        Wake::Elapsed => break RunOutcome::Completed,
                        Wake::Stopped => break RunOutcome::Stopped,
                        Wake::Deadline => break RunOutcome::DeadlineReached,
                    }
                }
                Phase::Terminated => break RunOutcome::Completed,
            }
        };
        transitions.enter(Phase::Terminated);

        let report = self.report(outcome, transitions.log, requested);
        info!(
            target = "picam.acquire",
            outcome = ?report.outcome,
            results = report.results_received,
            requested = report.requested.len(),
            "acquisition run finished"
        );
        Ok(report)
    }

    fn report(
        &self,
        outcome: RunOutcome,
        transitions: Vec<PhaseTransition>,
        requested: Vec<String>,
    ) -> RunReport {
        RunReport {
            outcome,
            transitions,
            reported: self.tracker.reported(),
            requested,
            results_received: self.recorded.lock().len(),
        }
    }

    /// Returns false when stopped before the bus came up.
    async fn wait_for_connection(
        &self,
        stop: &mut watch::Receiver<bool>,
    ) -> OrchestratorResult<bool> {
        let mut connection = self.client.connection();
        loop {
            if *stop.borrow() {
                return Ok(false);
            }
            if *connection.borrow_and_update() == ConnectionState::Connected {
                return Ok(true);
            }
            info!(target = "picam.acquire", "waiting for bus connection");
            tokio::select! {
                changed = connection.changed() => {
                    changed.map_err(|_| OrchestratorError::BusClosed)?;
                }
                _ = stop.changed() => return Ok(false),
            }
        }
    }

    fn start_workers(&self) -> OrchestratorResult<()> {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return Ok(());
        }
        for target in self.plan.targets.keys() {
            let params = self.client.subscribe_to(TopicName::Params, target)?;
            workers.push(tokio::spawn(params_worker(
                self.client.clone(),
                params,
                Arc::clone(&self.tracker),
            )));

            let imaging = self.client.subscribe_to(TopicName::Imaging, target)?;
            workers.push(tokio::spawn(results_worker(
                self.client.clone(),
                imaging,
                Arc::clone(&self.store),
                Arc::clone(&self.recorded),
            )));
        }
        Ok(())
    }

    /// Pushes each target's stored parameters, which makes it report back.
    fn request_params(&self) {
        for (target, params) in &self.plan.targets {
            let sent = ControlAction::UpdateParameters
                .encode(params)
                .map_err(OrchestratorError::from)
                .and_then(|payload| {
                    self.client
                        .publish_to(TopicName::Control, target, payload)
                        .map_err(OrchestratorError::from)
                });
            if let Err(err) = sent {
                warn!(target = "picam.acquire", %target, error = %err, "failed to request params");
            }
        }
    }

    /// Requests one capture from every configured target, reported or not.
    fn request_images(&self) -> Vec<String> {
        let mut requested = Vec::with_capacity(self.plan.targets.len());
        for target in self.plan.targets.keys() {
            let request = CaptureRequest {
                command_time: Some(Timestamp::now()),
                metadata: Some(json!({
                    "client_name": target,
                    "host": self.client.identity(),
                    "capture_name": self.plan.capture_name,
                })),
                ..CaptureRequest::default()
            };
            let sent = request
                .encode()
                .map_err(OrchestratorError::from)
                .and_then(|payload| {
                    self.client
                        .publish_to(TopicName::Control, target, payload)
                        .map_err(OrchestratorError::from)
                });
            match sent {
                Ok(()) => requested.push(target.clone()),
                Err(err) => {
                    warn!(target = "picam.acquire", %target, error = %err, "failed to request image")
                }
            }
        }
        requested
    }
}

impl<B: Bus + 'static> Drop for AcquisitionOrchestrator<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn pause(
    duration: Duration,
    deadline: Option<Instant>,
    stop: &mut watch::Receiver<bool>,
) -> Wake {
    if *stop.borrow() {
        return Wake::Stopped;
    }
    let wake_at = Instant::now() + duration;
    let (until, capped) = match deadline {
        Some(deadline) if deadline <= wake_at => (deadline, true),
        _ => (wake_at, false),
    };
    tokio::select! {
        _ = sleep_until(until) => if capped { Wake::Deadline } else { Wake::Elapsed },
        _ = stop.changed() => Wake::Stopped,
    }
}

async fn params_worker<B: Bus>(
    client: TopicClient<B>,
    mut rx: broadcast::Receiver<BusMessage>,
    tracker: Arc<TargetTracker>,
) {
    loop {
        let message = match rx.recv().await {
            Ok(message) => message,
            Err(RecvError::Lagged(skipped)) => {
                warn!(target = "picam.acquire", skipped, "params subscriber lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        client.log_inbound(TopicName::Params, &message);
        let target = target_of(&message.topic);
        let params = match serde_json::from_slice::<CameraParams>(&message.payload) {
            Ok(params) => Some(params),
            Err(err) => {
                warn!(target = "picam.acquire", %target, error = %err, "unreadable camera params");
                None
            }
        };
        if !tracker.record_params(target, params) {
            debug!(target = "picam.acquire", %target, "params from unknown target ignored");
        }
    }
}

async fn results_worker<B: Bus>(
    client: TopicClient<B>,
    mut rx: broadcast::Receiver<BusMessage>,
    store: Arc<dyn CaptureStore>,
    recorded: Arc<Mutex<Vec<StoredCapture>>>,
) {
    loop {
        let message = match rx.recv().await {
            Ok(message) => message,
            Err(RecvError::Lagged(skipped)) => {
                warn!(target = "picam.acquire", skipped, "imaging subscriber lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        client.log_inbound(TopicName::Imaging, &message);
        let target = target_of(&message.topic);
        let capture: CaptureResult = match serde_json::from_slice(&message.payload) {
            Ok(capture) => capture,
            Err(err) => {
                warn!(target = "picam.acquire", %target, error = %err, "unreadable capture result");
                continue;
            }
        };
        match store.store(target, &capture).await {
            Ok(stored) => {
                info!(
                    target = "picam.acquire",
                    %target,
                    path = ?stored.image_path,
                    "recorded capture"
                );
                recorded.lock().push(stored);
            }
            Err(err) => warn!(target = "picam.acquire", %target, error = %err, "failed to store capture"),
        }
    }
}

use std::sync::Arc;

use picam_proto::{TopicClient, TopicName};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use transport_bus::{Bus, BusMessage, ConnectionState};

use crate::deploy::{dispatch_deployment, DeploymentAgent, DeploymentDisposition};
use crate::dispatcher::ControlDispatcher;
use crate::imaging::ImagingAgent;
use crate::AgentResult;

/// Why the agent's run loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentExit {
    /// A `stop` command arrived on the deployment topic.
    Stopped,
    /// The bus went away underneath the agent.
    BusClosed,
}

struct Subscriptions {
    control: broadcast::Receiver<BusMessage>,
    deployment: broadcast::Receiver<BusMessage>,
    connection: watch::Receiver<ConnectionState>,
}

/// Single-loop agent: control commands, deployment commands and connection
/// changes are served one at a time from the same task.
pub struct AgentRuntime<B: Bus + 'static> {
    client: TopicClient<B>,
    imaging: Arc<ImagingAgent<B>>,
    dispatcher: ControlDispatcher<B>,
    deployment: Arc<dyn DeploymentAgent>,
}

impl<B: Bus + 'static> AgentRuntime<B> {
    pub fn new(
        client: TopicClient<B>,
        imaging: ImagingAgent<B>,
        deployment: Arc<dyn DeploymentAgent>,
    ) -> Self {
        let imaging = Arc::new(imaging);
        Self {
            client,
            dispatcher: ControlDispatcher::new(Arc::clone(&imaging)),
            imaging,
            deployment,
        }
    }

    /// Subscribes immediately, then serves on a spawned task.
    pub fn spawn(self) -> AgentResult<JoinHandle<AgentExit>> {
        let subscriptions = self.subscribe()?;
        Ok(tokio::spawn(self.serve(subscriptions)))
    }

    pub async fn run(self) -> AgentResult<AgentExit> {
        let subscriptions = self.subscribe()?;
        Ok(self.serve(subscriptions).await)
    }

    fn subscribe(&self) -> AgentResult<Subscriptions> {
        Ok(Subscriptions {
            control: self.client.subscribe(TopicName::Control)?,
            deployment: self.client.subscribe(TopicName::Deployment)?,
            connection: self.client.connection(),
        })
    }

    async fn serve(self, mut subs: Subscriptions) -> AgentExit {
        info!(target = "picam.agent", identity = self.client.identity(), "agent started");
        if *subs.connection.borrow_and_update() == ConnectionState::Connected {
            self.on_connect();
        }

        loop {
            tokio::select! {
                received = subs.control.recv() => match received {
                    Ok(message) => self.on_control(&message),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(target = "picam.agent", skipped, "control subscriber lagged");
                    }
                    Err(RecvError::Closed) => return AgentExit::BusClosed,
                },
                received = subs.deployment.recv() => match received {
                    Ok(message) => {
                        if self.on_deployment(&message) {
                            info!(target = "picam.agent", "stop requested, leaving run loop");
                            return AgentExit::Stopped;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(target = "picam.agent", skipped, "deployment subscriber lagged");
                    }
                    Err(RecvError::Closed) => return AgentExit::BusClosed,
                },
                changed = subs.connection.changed() => {
                    if changed.is_err() {
                        return AgentExit::BusClosed;
                    }
                    let state = *subs.connection.borrow_and_update();
                    match state {
                        ConnectionState::Connected => self.on_connect(),
                        ConnectionState::Disconnected => self.on_disconnect(),
                    }
                }
            }
        }
    }

    fn on_control(&self, message: &BusMessage) {
        self.client.log_inbound(TopicName::Control, message);
        match self.dispatcher.on_message(&message.topic, &message.payload) {
            Ok(outcome) => debug!(target = "picam.agent", ?outcome, "control message processed"),
            Err(err) => error!(
                target = "picam.agent",
                topic = %message.topic,
                error = %err,
                "control command failed"
            ),
        }
    }

    /// Returns true when the loop must stop.
    fn on_deployment(&self, message: &BusMessage) -> bool {
        self.client.log_inbound(TopicName::Deployment, message);
        let text = String::from_utf8_lossy(&message.payload);
        match dispatch_deployment(&self.deployment, &text) {
            DeploymentDisposition::Stop => true,
            DeploymentDisposition::Spawned(command, _detached) => {
                info!(target = "picam.agent", command = command.as_str(), "deployment action started");
                false
            }
            DeploymentDisposition::Ignored => false,
        }
    }

    fn on_connect(&self) {
        info!(target = "picam.agent", "connected, reporting camera parameters");
        if let Err(err) = self.imaging.publish_params() {
            warn!(target = "picam.agent", error = %err, "failed to publish camera parameters");
        }
    }

    fn on_disconnect(&self) {
        warn!(target = "picam.agent", "bus disconnected, attempting reconnect");
        let deployment = Arc::clone(&self.deployment);
        tokio::spawn(async move {
            if let Err(err) = deployment.reconnect().await {
                warn!(target = "picam.agent", error = %err, "reconnect attempt failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::TestPatternCamera;
    use crate::deploy::tests::RecordingDeploymentAgent;
    use crate::imaging::tests::BrokenCamera;
    use crate::imaging::CaptureDefaults;
    use bytes::Bytes;
    use picam_proto::{CaptureResult, TopicTable};
    use tokio::time::{timeout, Duration};
    use transport_bus::{LocalBus, QoS};

    fn runtime(
        bus: &Arc<LocalBus>,
        camera: Arc<dyn crate::camera::Camera>,
        deployment: Arc<RecordingDeploymentAgent>,
    ) -> AgentRuntime<LocalBus> {
        let client = TopicClient::new(bus.clone(), "cam-1", TopicTable::agent());
        let imaging = ImagingAgent::new(client.clone(), camera, CaptureDefaults::default());
        AgentRuntime::new(client, imaging, deployment)
    }

    fn send(bus: &LocalBus, topic: &str, payload: &'static [u8]) {
        bus.publish(topic, Bytes::from_static(payload), QoS::ExactlyOnce)
            .expect("publish ok");
    }

    #[tokio::test]
    async fn reports_params_on_start_and_captures_on_request() {
        let bus = Arc::new(LocalBus::new());
        let mut params = bus.subscribe("cam-1/params", QoS::ExactlyOnce);
        let mut imaging = bus.subscribe("cam-1/imaging", QoS::ExactlyOnce);
        let deployment = Arc::new(RecordingDeploymentAgent::default());
        let handle = runtime(&bus, Arc::new(TestPatternCamera::new()), deployment)
            .spawn()
            .expect("spawn");

        timeout(Duration::from_secs(2), params.recv())
            .await
            .expect("params on connect")
            .expect("message");

        send(&bus, "cam-1/control", br#"{"action": "capture"}"#);
        let msg = timeout(Duration::from_secs(2), imaging.recv())
            .await
            .expect("capture result")
            .expect("message");
        let result: CaptureResult = serde_json::from_slice(&msg.payload).expect("json");
        assert_eq!(result.metadata["client_name"], "cam-1");

        send(&bus, "cam-1/deployment", b"stop");
        let exit = timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop ends")
            .expect("join");
        assert_eq!(exit, AgentExit::Stopped);
    }

    async fn wait_for_attempts(camera: &BrokenCamera, attempts: u32) {
        timeout(Duration::from_secs(2), async {
            while *camera.attempts.lock() < attempts {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("capture attempted");
    }

    #[tokio::test]
    async fn camera_faults_do_not_end_the_loop() {
        let bus = Arc::new(LocalBus::new());
        let camera = Arc::new(BrokenCamera::default());
        let deployment = Arc::new(RecordingDeploymentAgent::default());
        let handle = runtime(&bus, camera.clone(), deployment.clone())
            .spawn()
            .expect("spawn");

        send(&bus, "cam-1/control", br#"{"action": "capture"}"#);
        wait_for_attempts(&camera, 1).await;

        send(&bus, "cam-1/control", b"garbage");
        send(&bus, "cam-1/control", br#"{"action": "capture"}"#);
        wait_for_attempts(&camera, 2).await;
        assert!(!handle.is_finished());

        send(&bus, "cam-1/deployment", b"stop");
        let exit = timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop ends")
            .expect("join");
        assert_eq!(exit, AgentExit::Stopped);
        assert_eq!(*camera.attempts.lock(), 2);
    }

    #[tokio::test]
    async fn deployment_actions_run_in_background() {
        let bus = Arc::new(LocalBus::new());
        let deployment = Arc::new(RecordingDeploymentAgent::default());
        let handle = runtime(&bus, Arc::new(TestPatternCamera::new()), deployment.clone())
            .spawn()
            .expect("spawn");

        send(&bus, "cam-1/deployment", b"git pull");
        send(&bus, "cam-1/deployment", b"make coffee");
        send(&bus, "cam-1/deployment", b"stop");
        let exit = timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop ends")
            .expect("join");
        assert_eq!(exit, AgentExit::Stopped);

        timeout(Duration::from_secs(2), async {
            while deployment.calls.lock().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("background task ran");
        assert_eq!(deployment.calls.lock().as_slice(), ["pull_and_restart"]);
    }

    #[tokio::test]
    async fn reconnects_and_reports_again_after_outage() {
        let bus = Arc::new(LocalBus::new());
        let mut params = bus.subscribe("cam-1/params", QoS::ExactlyOnce);
        let deployment = Arc::new(RecordingDeploymentAgent::default());
        let handle = runtime(&bus, Arc::new(TestPatternCamera::new()), deployment.clone())
            .spawn()
            .expect("spawn");

        timeout(Duration::from_secs(2), params.recv())
            .await
            .expect("initial params")
            .expect("message");

        bus.disconnect();
        timeout(Duration::from_secs(2), async {
            while deployment.calls.lock().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("reconnect hook invoked");
        assert_eq!(deployment.calls.lock().as_slice(), ["reconnect"]);

        bus.connect();
        timeout(Duration::from_secs(2), params.recv())
            .await
            .expect("params after reconnect")
            .expect("message");

        send(&bus, "cam-1/deployment", b"stop");
        timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop ends")
            .expect("join");
    }
}

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use picam_agent::{
    AgentExit, AgentRuntime, CaptureDefaults, DeploymentAgent, DryRunDeploymentAgent,
    ImagingAgent, SystemDeploymentAgent, TestPatternCamera,
};
use picam_orchestrator::{AcquisitionOrchestrator, AcquisitionPlan, FileCaptureStore, RunReport};
use picam_proto::{DeploymentCommand, TopicClient, TopicName, TopicTable};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use transport_bus::LocalBus;

use crate::cli::{AcquireArgs, Role, TopicsArgs};
use crate::config::{DeployConfig, FleetConfig};

const AGENT_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs one acquisition against agents hosted on the in-process bus.
pub async fn acquire(config: &FleetConfig, args: AcquireArgs) -> Result<RunReport> {
    if config.targets.is_empty() {
        bail!("no targets configured; add a [targets.<identity>] section");
    }
    info!(
        broker = %config.broker.hostname,
        port = config.broker.port,
        keepalive_secs = config.broker.keepalive_secs,
        targets = config.targets.len(),
        "starting acquisition on loopback bus"
    );

    let bus = Arc::new(LocalBus::new());
    let deployment = deployment_agent(&config.deploy);
    let mut agents = Vec::with_capacity(config.targets.len());
    for identity in config.targets.keys() {
        agents.push((identity.clone(), spawn_agent(&bus, identity, Arc::clone(&deployment))?));
    }

    let client = TopicClient::new(bus, &config.host.client_name, TopicTable::orchestrator());
    let plan = AcquisitionPlan {
        targets: config.targets.clone(),
        capture_name: args.output_prefix.clone(),
    };
    let store = Arc::new(FileCaptureStore::new(&args.output_dir, &args.output_prefix));
    let orchestrator =
        AcquisitionOrchestrator::new(client.clone(), plan, config.timings.acquisition(), store);

    let stop = orchestrator.stop_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping acquisition");
            stop.stop();
        }
    });

    let report = orchestrator.run().await.context("acquisition run failed");
    interrupt.abort();
    orchestrator.shutdown();
    stop_agents(&client, agents).await;
    let report = report?;

    info!(
        outcome = ?report.outcome,
        reported = report.reported.len(),
        requested = report.requested.len(),
        results = report.results_received,
        output_dir = %args.output_dir.display(),
        "acquisition finished"
    );
    Ok(report)
}

fn deployment_agent(config: &DeployConfig) -> Arc<dyn DeploymentAgent> {
    if config.dry_run {
        Arc::new(DryRunDeploymentAgent)
    } else {
        Arc::new(SystemDeploymentAgent {
            username: config.username.clone(),
            repo_path: config.repo_path.clone(),
            service_name: config.service_name.clone(),
            reconnect_command: config.reconnect_command.clone(),
        })
    }
}

fn spawn_agent(
    bus: &Arc<LocalBus>,
    identity: &str,
    deployment: Arc<dyn DeploymentAgent>,
) -> Result<JoinHandle<AgentExit>> {
    let client = TopicClient::new(Arc::clone(bus), identity, TopicTable::agent());
    let imaging = ImagingAgent::new(
        client.clone(),
        Arc::new(TestPatternCamera::new()),
        CaptureDefaults::default(),
    );
    AgentRuntime::new(client, imaging, deployment)
        .spawn()
        .with_context(|| format!("failed to start agent {identity}"))
}

async fn stop_agents(client: &TopicClient<LocalBus>, agents: Vec<(String, JoinHandle<AgentExit>)>) {
    for (identity, handle) in agents {
        let stop = DeploymentCommand::Stop.as_str().as_bytes().to_vec();
        if let Err(err) = client.publish_to(TopicName::Deployment, &identity, stop) {
            warn!(%identity, error = %err, "failed to send stop");
            handle.abort();
            continue;
        }
        match tokio::time::timeout(AGENT_STOP_TIMEOUT, handle).await {
            Ok(Ok(exit)) => info!(%identity, ?exit, "agent exited"),
            Ok(Err(err)) => warn!(%identity, error = %err, "agent task failed"),
            Err(_) => warn!(%identity, "agent did not stop in time"),
        }
    }
}

/// Lists the topic paths `args.identity` would use in the given role.
pub fn topic_lines(args: &TopicsArgs) -> Vec<String> {
    let table = match args.role {
        Role::Agent => TopicTable::agent(),
        Role::Orchestrator => TopicTable::orchestrator(),
    };
    table
        .iter()
        .map(|topic| {
            format!(
                "{:<10} {:<24} qos={} subscribe={} log={}",
                topic.name.as_str(),
                topic.resolve(&args.identity),
                topic.qos.level(),
                topic.subscribe,
                topic.log
            )
        })
        .collect()
}

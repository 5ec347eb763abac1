//! Per-host worker runtime: one agent fronting one likelihood worker.

use std::time::Duration;

use anyhow::Context;
use kiln_comms::agent::{Agent, AgentSettings};
use kiln_comms::worker::{run_worker, LikelihoodFn, WorkerSettings};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub struct WorkerRuntime {
    shutdown: broadcast::Sender<()>,
    agent_task: JoinHandle<anyhow::Result<()>>,
    worker_task: JoinHandle<anyhow::Result<()>>,
}

impl WorkerRuntime {
    /// Connect an agent to the delegator and attach a likelihood worker to it
    /// over a private ipc socket.
    pub async fn start(
        network_addr: &str,
        job_type_range: (u32, u32),
        likelihood: LikelihoodFn,
        heartbeat_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let agent_addr = format!(
            "ipc://{}/kiln-worker-{:06x}.sock",
            std::env::temp_dir().display(),
            rand::random::<u32>() & 0xff_ffff
        );

        let agent_settings = AgentSettings {
            bind_addr: agent_addr.clone(),
            network_addr: network_addr.to_string(),
            heartbeat_timeout,
        };
        let agent = Agent::connect(agent_settings)
            .await
            .context("failed to start agent")?;

        let (shutdown, _) = broadcast::channel(4);
        let agent_task = tokio::spawn(agent.run(shutdown.subscribe()));

        let worker_settings = WorkerSettings {
            agent_addr,
            job_type_range,
            hb_timeout: heartbeat_timeout,
        };
        let worker_task = tokio::spawn(run_worker(
            worker_settings,
            likelihood,
            shutdown.subscribe(),
        ));

        Ok(WorkerRuntime {
            shutdown,
            agent_task,
            worker_task,
        })
    }

    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }

    /// Wait for either side to finish, wind the other down, and surface the
    /// first error; an agent error (delegator loss) lands here so a
    /// supervisor can restart the host.
    pub async fn join(mut self) -> anyhow::Result<()> {
        enum First {
            Agent(Result<anyhow::Result<()>, tokio::task::JoinError>),
            Worker(Result<anyhow::Result<()>, tokio::task::JoinError>),
        }

        let first = tokio::select! {
            r = &mut self.agent_task => First::Agent(r),
            r = &mut self.worker_task => First::Worker(r),
        };
        let _ = self.shutdown.send(());

        match first {
            First::Agent(result) => {
                let _ = self.worker_task.await;
                result.context("agent task panicked")?
            }
            First::Worker(result) => {
                let _ = self.agent_task.await;
                result.context("worker task panicked")?
            }
        }
    }
}

//! The worker: fetches jobs from its agent, runs the user likelihood, and
//! returns results.
//!
//! A worker is strictly request/reply: it announces itself with HELLO, then
//! alternates between receiving a JOB and answering with a RESULT. The user
//! likelihood runs on the blocking pool so a slow model never starves the
//! poll loops; a panicking likelihood is reported as infinite energy, which
//! the sampler treats as a rejection.

use std::sync::Arc;
use std::time::Duration;

use kiln_proto::{wire, Message, Subject};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use zeromq::{ReqSocket, Socket};

use crate::channel::Channel;
use crate::CommsError;

/// The likelihood component evaluator: `(job_type, sample) -> energy`.
pub type LikelihoodFn = Arc<dyn Fn(u32, &[f32]) -> f64 + Send + Sync>;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Address of the local agent's worker-facing socket.
    pub agent_addr: String,
    /// Inclusive range of job types this worker evaluates.
    pub job_type_range: (u32, u32),
    /// Heartbeat timeout proposed upstream through the agent.
    pub hb_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        WorkerSettings {
            agent_addr: "ipc:///tmp/kiln-agent.sock".to_string(),
            job_type_range: (1, 1),
            hb_timeout: Duration::from_secs(15),
        }
    }
}

pub struct Worker {
    channel: Channel<ReqSocket>,
}

impl Worker {
    /// Connect to the agent and announce our job-type range.
    pub async fn connect(settings: &WorkerSettings) -> Result<Self, CommsError> {
        let mut socket = ReqSocket::new();
        info!(addr = %settings.agent_addr, "worker connecting to agent");
        socket.connect(&settings.agent_addr).await?;

        let mut channel = Channel::direct("toAgent", socket);
        let hello = wire::Hello {
            hb_timeout_secs: settings.hb_timeout.as_secs() as u32,
            job_type_lo: settings.job_type_range.0,
            job_type_hi: settings.job_type_range.1,
        };
        channel
            .send(&Message::direct(Subject::Hello, hello.encode()))
            .await;

        Ok(Worker { channel })
    }

    /// Block until the agent hands us a job.
    pub async fn next_job(&mut self) -> Result<wire::Job, CommsError> {
        let msg = self.channel.recv().await?;
        if msg.subject != Subject::Job {
            return Err(CommsError::UnexpectedSubject {
                link: "toAgent",
                actual: msg.subject,
            });
        }
        Ok(wire::Job::decode(&msg.payload)?)
    }

    /// Answer the current job.
    pub async fn submit_result(&mut self, id: u32, energy: f64) -> Result<(), CommsError> {
        let result = wire::JobResult {
            id,
            data: energy as f32,
        };
        self.channel
            .send(&Message::direct(Subject::Result, result.encode()))
            .await;
        Ok(())
    }
}

/// Drive a likelihood function until shutdown.
pub async fn run_worker(
    settings: WorkerSettings,
    likelihood: LikelihoodFn,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let mut worker = Worker::connect(&settings).await?;

    loop {
        let job = tokio::select! {
            job = worker.next_job() => job?,
            _ = shutdown.recv() => break,
        };

        let f = likelihood.clone();
        let data = job.data;
        let job_type = job.job_type;
        let energy = match tokio::task::spawn_blocking(move || f(job_type, &data)).await {
            Ok(energy) => energy,
            Err(err) => {
                // A panicking likelihood rejects the proposal instead of
                // killing the worker.
                warn!(job = job.id, error = %err, "likelihood failed, reporting infinite energy");
                f64::INFINITY
            }
        };

        debug!(job = job.id, job_type, energy, "job evaluated");
        worker.submit_result(job.id, energy).await?;
    }
    Ok(())
}

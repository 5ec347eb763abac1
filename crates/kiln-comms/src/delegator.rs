//! The delegator: central broker between the requester and remote workers.
//!
//! Owns the global job queue and the roster of live workers. Every batch is
//! split into one job per configured job type; jobs are dispatched to the
//! best eligible worker, and a worker's death (heartbeat expiry, BYE, or a
//! failed send) pushes its in-flight jobs back to the front of the queue so
//! stalled batches complete as soon as another worker is available.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use kiln_proto::{wire, Message, Subject};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use zeromq::{RouterSocket, Socket};

use crate::channel::Channel;
use crate::endpoint::{dispatch, Endpoint};
use crate::heartbeat::Action;
use crate::CommsError;

/// Seed estimate for a job type we have never timed, in microseconds.
const DEFAULT_SERVICE_US: f64 = 100.0;

/// Step size of the service-time moving average.
const SERVICE_EMA_ALPHA: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct DelegatorSettings {
    /// Front socket the requester connects to.
    pub requester_addr: String,
    /// Network socket agents connect to.
    pub network_addr: String,
    /// Number of component jobs per batch; job types are `1..=n_job_types`.
    pub n_job_types: u32,
    /// Our side of the heartbeat-timeout negotiation.
    pub heartbeat_timeout: Duration,
    /// Cap on in-flight jobs per worker.
    pub max_jobs_per_worker: usize,
}

impl Default for DelegatorSettings {
    fn default() -> Self {
        DelegatorSettings {
            requester_addr: "ipc:///tmp/kiln-delegator.sock".to_string(),
            network_addr: "tcp://0.0.0.0:5555".to_string(),
            n_job_types: 1,
            heartbeat_timeout: Duration::from_secs(15),
            max_jobs_per_worker: 10,
        }
    }
}

/// A job waiting for a worker. Refers to its batch by id; ids are assigned
/// only at dispatch time.
#[derive(Debug, Clone)]
struct QueuedJob {
    batch: u32,
    job_type: u32,
    queued_at: Instant,
}

/// A job a worker is currently evaluating.
#[derive(Debug, Clone)]
struct ActiveJob {
    batch: u32,
    job_type: u32,
    started_at: Instant,
}

/// Roster entry for one live worker.
pub struct WorkerRecord {
    job_type_range: (u32, u32),
    in_progress: HashMap<u32, ActiveJob>,
    mean_service_us: HashMap<u32, f64>,
}

impl WorkerRecord {
    fn new(job_type_range: (u32, u32)) -> Self {
        WorkerRecord {
            job_type_range,
            in_progress: HashMap::new(),
            mean_service_us: HashMap::new(),
        }
    }

    fn supports(&self, job_type: u32) -> bool {
        self.job_type_range.0 <= job_type && job_type <= self.job_type_range.1
    }

    pub fn in_flight(&self) -> usize {
        self.in_progress.len()
    }

    fn expected_service_us(&self, job_type: u32) -> f64 {
        self.mean_service_us
            .get(&job_type)
            .copied()
            .unwrap_or(DEFAULT_SERVICE_US)
    }

    /// Expected time to drain the current queue plus serve one more job of
    /// this type.
    fn eta_us(&self, job_type: u32) -> f64 {
        let backlog: f64 = self
            .in_progress
            .values()
            .map(|j| self.expected_service_us(j.job_type))
            .sum();
        backlog + self.expected_service_us(job_type)
    }

    fn observe_service(&mut self, job_type: u32, elapsed_us: f64) {
        match self.mean_service_us.get_mut(&job_type) {
            Some(mean) => *mean = *mean * (1.0 - SERVICE_EMA_ALPHA) + elapsed_us * SERVICE_EMA_ALPHA,
            None => {
                self.mean_service_us.insert(job_type, elapsed_us);
            }
        }
    }
}

/// A batch waiting for its component results.
struct PendingBatch {
    requester: Bytes,
    data: Vec<f64>,
    results: Vec<Option<f64>>,
    n_done: usize,
}

/// Picks a worker for a queued job. The shipped policies are [`EtaPolicy`]
/// and [`AnyWorker`]; the delegator takes any implementation.
pub trait SchedulePolicy: Send {
    fn choose(
        &self,
        job_type: u32,
        workers: &HashMap<Bytes, WorkerRecord>,
        max_in_flight: usize,
    ) -> Option<Bytes>;
}

/// Least expected-time-to-completion, estimated from per-type service-time
/// averages. Ties break on in-flight count, then address.
pub struct EtaPolicy;

impl SchedulePolicy for EtaPolicy {
    fn choose(
        &self,
        job_type: u32,
        workers: &HashMap<Bytes, WorkerRecord>,
        max_in_flight: usize,
    ) -> Option<Bytes> {
        workers
            .iter()
            .filter(|(_, w)| w.supports(job_type) && w.in_flight() < max_in_flight)
            .min_by(|(a_addr, a), (b_addr, b)| {
                let a_eta = a.eta_us(job_type);
                let b_eta = b.eta_us(job_type);
                a_eta
                    .total_cmp(&b_eta)
                    .then(a.in_flight().cmp(&b.in_flight()))
                    .then(a_addr.cmp(b_addr))
            })
            .map(|(addr, _)| addr.clone())
    }
}

/// First eligible worker, the minimal correct policy.
pub struct AnyWorker;

impl SchedulePolicy for AnyWorker {
    fn choose(
        &self,
        job_type: u32,
        workers: &HashMap<Bytes, WorkerRecord>,
        max_in_flight: usize,
    ) -> Option<Bytes> {
        workers
            .iter()
            .find(|(_, w)| w.supports(job_type) && w.in_flight() < max_in_flight)
            .map(|(addr, _)| addr.clone())
    }
}

/// Outbound actions produced by the delegator's handlers.
#[derive(Debug)]
pub enum DelegatorOut {
    /// Send on the requester link.
    Requester(Message),
    /// Send on the network link.
    Network(Message),
    /// Begin heartbeat monitoring for a new worker.
    StartHeartbeats { addr: Bytes, timeout: Duration },
    /// Stop heartbeat monitoring for a departed worker.
    StopHeartbeats(Bytes),
}

/// All broker state, free of socket I/O. Workers, batches and jobs live in
/// maps and refer to each other by key only.
pub struct DelegatorState {
    settings: DelegatorSettings,
    policy: Box<dyn SchedulePolicy>,
    workers: HashMap<Bytes, WorkerRecord>,
    pending: HashMap<u32, PendingBatch>,
    job_queue: VecDeque<QueuedJob>,
    last_job_id: u32,
}

impl DelegatorState {
    pub fn new(settings: DelegatorSettings) -> Self {
        DelegatorState::with_policy(settings, Box::new(EtaPolicy))
    }

    pub fn with_policy(settings: DelegatorSettings, policy: Box<dyn SchedulePolicy>) -> Self {
        DelegatorState {
            settings,
            policy,
            workers: HashMap::new(),
            pending: HashMap::new(),
            job_queue: VecDeque::new(),
            last_job_id: 0,
        }
    }

    pub fn queue_len(&self) -> usize {
        self.job_queue.len()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// A new batch: one queued job per configured job type.
    fn add_batch(&mut self, requester: Bytes, batch: wire::BatchJob) {
        let n = self.settings.n_job_types;
        self.pending.insert(
            batch.id,
            PendingBatch {
                requester,
                data: batch.data,
                results: vec![None; n as usize],
                n_done: 0,
            },
        );
        let now = Instant::now();
        for job_type in 1..=n {
            self.job_queue.push_back(QueuedJob {
                batch: batch.id,
                job_type,
                queued_at: now,
            });
        }
        debug!(batch = batch.id, pending = self.pending.len(), "batch queued");
    }

    /// A worker announced itself. The agreed timeout is the more lenient of
    /// the two proposals, and the WELCOME goes out before any heartbeat
    /// accounting can count against the peer.
    fn add_worker(&mut self, addr: Bytes, hello: wire::Hello) -> Vec<DelegatorOut> {
        let timeout = Duration::from_secs(u64::from(hello.hb_timeout_secs))
            .max(self.settings.heartbeat_timeout);

        info!(
            worker = %String::from_utf8_lossy(&addr),
            job_types = ?(hello.job_type_lo, hello.job_type_hi),
            timeout_secs = timeout.as_secs(),
            "worker connected"
        );
        self.workers.insert(
            addr.clone(),
            WorkerRecord::new((hello.job_type_lo, hello.job_type_hi)),
        );

        let welcome = wire::Welcome {
            hb_timeout_secs: timeout.as_secs() as u32,
        };
        vec![
            DelegatorOut::Network(Message::new(addr.clone(), Subject::Welcome, welcome.encode())),
            DelegatorOut::StartHeartbeats { addr, timeout },
        ]
    }

    /// A worker finished a job: record the service time, fill the batch slot,
    /// and emit the BATCH_RESULT when the batch completes.
    fn complete_job(&mut self, addr: &Bytes, result: wire::JobResult) -> Vec<DelegatorOut> {
        let Some(worker) = self.workers.get_mut(addr) else {
            debug!(worker = %String::from_utf8_lossy(addr), "result from unknown worker");
            return Vec::new();
        };
        let Some(job) = worker.in_progress.remove(&result.id) else {
            debug!(job = result.id, "result for unknown job");
            return Vec::new();
        };

        let elapsed_us = job.started_at.elapsed().as_micros() as f64;
        worker.observe_service(job.job_type, elapsed_us);

        let Some(batch) = self.pending.get_mut(&job.batch) else {
            return Vec::new();
        };
        let slot = (job.job_type - 1) as usize;
        if batch.results[slot].replace(f64::from(result.data)).is_none() {
            batch.n_done += 1;
        }

        if batch.n_done == batch.results.len() {
            let done = self.pending.remove(&job.batch).expect("batch present");
            let reply = wire::BatchResult {
                id: job.batch,
                data: done.results.into_iter().map(|r| r.unwrap_or(f64::INFINITY)).collect(),
            };
            debug!(batch = job.batch, "batch complete");
            return vec![DelegatorOut::Requester(Message::new(
                done.requester,
                Subject::BatchResult,
                reply.encode(),
            ))];
        }
        Vec::new()
    }

    /// Remove a worker and push its in-flight jobs back to the front of the
    /// queue. This is the recovery primitive behind worker-crash tolerance.
    pub fn disconnect_worker(&mut self, addr: &Bytes) -> usize {
        let Some(worker) = self.workers.remove(addr) else {
            return 0;
        };
        let requeued = worker.in_progress.len();
        let now = Instant::now();
        for (_, job) in worker.in_progress {
            self.job_queue.push_front(QueuedJob {
                batch: job.batch,
                job_type: job.job_type,
                queued_at: now,
            });
        }
        if requeued > 0 {
            warn!(
                worker = %String::from_utf8_lossy(addr),
                requeued,
                "worker gone, re-queueing its jobs"
            );
        } else {
            info!(worker = %String::from_utf8_lossy(addr), "worker gone");
        }
        requeued
    }

    /// Hand every queued job that has an eligible worker to the scheduler's
    /// pick. Job ids come from a monotone counter, so they are unique for the
    /// delegator's lifetime.
    pub fn assign_jobs(&mut self) -> Vec<(Bytes, Message)> {
        let mut sends = Vec::new();
        let mut still_queued = VecDeque::new();

        while let Some(job) = self.job_queue.pop_front() {
            let Some(data) = self.pending.get(&job.batch).map(|b| &b.data) else {
                // Batch evaporated; drop the orphan job.
                continue;
            };
            match self.policy.choose(
                job.job_type,
                &self.workers,
                self.settings.max_jobs_per_worker,
            ) {
                Some(addr) => {
                    self.last_job_id += 1;
                    let id = self.last_job_id;
                    let msg = Message::new(
                        addr.clone(),
                        Subject::Job,
                        wire::Job {
                            id,
                            job_type: job.job_type,
                            data: data.iter().map(|v| *v as f32).collect(),
                        }
                        .encode(),
                    );
                    debug!(
                        job = id,
                        job_type = job.job_type,
                        queued_us = job.queued_at.elapsed().as_micros() as u64,
                        "job dispatched"
                    );
                    let worker = self.workers.get_mut(&addr).expect("policy picked a live worker");
                    worker.in_progress.insert(
                        id,
                        ActiveJob {
                            batch: job.batch,
                            job_type: job.job_type,
                            started_at: Instant::now(),
                        },
                    );
                    sends.push((addr, msg));
                }
                None => still_queued.push_back(job),
            }
        }

        self.job_queue = still_queued;
        sends
    }
}

/// Handler table for the requester-facing socket.
struct RequesterEndpoint<'a>(&'a mut DelegatorState);

impl Endpoint for RequesterEndpoint<'_> {
    type Out = DelegatorOut;

    fn on_batch_job(&mut self, m: Message) -> Vec<DelegatorOut> {
        match wire::BatchJob::decode(&m.payload) {
            Ok(batch) => {
                self.0.add_batch(m.address, batch);
                Vec::new()
            }
            Err(err) => {
                warn!(error = %err, "bad BATCH_JOB payload");
                Vec::new()
            }
        }
    }
}

/// Handler table for the network-facing socket.
struct NetworkEndpoint<'a>(&'a mut DelegatorState);

impl Endpoint for NetworkEndpoint<'_> {
    type Out = DelegatorOut;

    fn on_hello(&mut self, m: Message) -> Vec<DelegatorOut> {
        match wire::Hello::decode(&m.payload) {
            Ok(hello) => self.0.add_worker(m.address, hello),
            Err(err) => {
                warn!(error = %err, "bad HELLO payload");
                Vec::new()
            }
        }
    }

    fn on_result(&mut self, m: Message) -> Vec<DelegatorOut> {
        match wire::JobResult::decode(&m.payload) {
            Ok(result) => self.0.complete_job(&m.address, result),
            Err(err) => {
                warn!(error = %err, "bad RESULT payload");
                Vec::new()
            }
        }
    }

    fn on_bye(&mut self, m: Message) -> Vec<DelegatorOut> {
        self.0.disconnect_worker(&m.address);
        vec![DelegatorOut::StopHeartbeats(m.address)]
    }

    fn on_heartbeat(&mut self, _m: Message) -> Vec<DelegatorOut> {
        // last_recv is already updated by the channel.
        Vec::new()
    }
}

/// The delegator's socket shell: two ROUTER sockets and the poll loop.
pub struct Delegator {
    requester: Channel<RouterSocket>,
    network: Channel<RouterSocket>,
    state: DelegatorState,
}

impl Delegator {
    pub fn settings(&self) -> &DelegatorSettings {
        &self.state.settings
    }

    /// Bind both sockets.
    pub async fn bind(settings: DelegatorSettings) -> Result<Self, CommsError> {
        Delegator::bind_with_policy(settings, Box::new(EtaPolicy)).await
    }

    pub async fn bind_with_policy(
        settings: DelegatorSettings,
        policy: Box<dyn SchedulePolicy>,
    ) -> Result<Self, CommsError> {
        let mut front = RouterSocket::new();
        front.bind(&settings.requester_addr).await?;

        let mut network = RouterSocket::new();
        network.bind(&settings.network_addr).await?;
        info!(addr = %settings.network_addr, "delegator listening");

        Ok(Delegator {
            requester: Channel::routed("toRequester", front),
            network: Channel::routed("toNetwork", network),
            state: DelegatorState::with_policy(settings, policy),
        })
    }

    /// Poll until the shutdown signal. In-flight messages are fully processed
    /// before the loop exits.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        enum Polled {
            Requester(Message),
            Network(Message),
            Tick,
            Shutdown,
        }

        loop {
            let deadline = tokio::time::Instant::from_std(self.network.poll_deadline());
            let polled = {
                let requester = &mut self.requester;
                let network = &mut self.network;
                tokio::select! {
                    m = requester.recv() => Polled::Requester(m?),
                    m = network.recv() => Polled::Network(m?),
                    _ = tokio::time::sleep_until(deadline) => Polled::Tick,
                    _ = shutdown.recv() => Polled::Shutdown,
                }
            };

            match polled {
                Polled::Requester(m) => {
                    let outs = dispatch(&mut RequesterEndpoint(&mut self.state), m);
                    self.perform(outs).await;
                }
                Polled::Network(m) => {
                    let outs = dispatch(&mut NetworkEndpoint(&mut self.state), m);
                    self.perform(outs).await;
                }
                Polled::Tick => {}
                Polled::Shutdown => break,
            }

            self.idle().await;
        }
        Ok(())
    }

    async fn perform(&mut self, outs: Vec<DelegatorOut>) {
        for out in outs {
            match out {
                DelegatorOut::Requester(msg) => {
                    if !self.requester.send(&msg).await {
                        warn!("requester link send failed");
                    }
                }
                DelegatorOut::Network(msg) => {
                    let addr = msg.address.clone();
                    if !self.network.send(&msg).await {
                        self.drop_worker(addr);
                    }
                }
                DelegatorOut::StartHeartbeats { addr, timeout } => {
                    self.network.start_heartbeats(addr, timeout);
                }
                DelegatorOut::StopHeartbeats(addr) => {
                    self.network.stop_heartbeats(&addr);
                }
            }
        }
    }

    /// Between polls: heartbeat maintenance, then hand out queued jobs.
    async fn idle(&mut self) {
        for action in self.network.hb_idle() {
            match action {
                Action::Ping(addr) => {
                    let ping = Message::heartbeat(addr.clone());
                    if !self.network.send(&ping).await {
                        self.drop_worker(addr);
                    }
                }
                Action::Expire(addr) => {
                    self.state.disconnect_worker(&addr);
                }
            }
        }

        for (addr, msg) in self.state.assign_jobs() {
            if !self.network.send(&msg).await {
                self.drop_worker(addr);
            }
        }
    }

    fn drop_worker(&mut self, addr: Bytes) {
        self.network.stop_heartbeats(&addr);
        self.state.disconnect_worker(&addr);
    }
}

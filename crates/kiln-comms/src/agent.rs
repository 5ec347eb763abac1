//! The agent: a per-host bridge between one local worker and the delegator.
//!
//! Presents a single DEALER connection upstream while fronting a
//! request/reply-synchronous worker on a REP socket. Because the worker can
//! only hold one job at a time, the agent needs just a FIFO queue and a
//! single `worker_waiting` flag.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use kiln_proto::{wire, Message, Subject};
use tokio::sync::broadcast;
use tracing::{info, warn};
use zeromq::{DealerSocket, RepSocket, Socket};

use crate::channel::Channel;
use crate::endpoint::{dispatch, Endpoint};
use crate::heartbeat::Action;
use crate::CommsError;

#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Local address the worker connects to.
    pub bind_addr: String,
    /// The delegator's network address.
    pub network_addr: String,
    /// Our side of the heartbeat-timeout negotiation.
    pub heartbeat_timeout: Duration,
}

impl Default for AgentSettings {
    fn default() -> Self {
        AgentSettings {
            bind_addr: "ipc:///tmp/kiln-agent.sock".to_string(),
            network_addr: "tcp://localhost:5555".to_string(),
            heartbeat_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug)]
enum AgentOut {
    ToWorker(Message),
    ToNetwork(Message),
    StartHeartbeats(Duration),
    Shutdown,
}

/// The agent's state machine, free of socket I/O.
struct AgentCore {
    settings: AgentSettings,
    queue: VecDeque<Message>,
    worker_waiting: bool,
}

impl AgentCore {
    fn new(settings: AgentSettings) -> Self {
        AgentCore {
            settings,
            queue: VecDeque::new(),
            worker_waiting: false,
        }
    }
}

/// Handlers for the worker-facing REP socket.
struct WorkerEndpoint<'a>(&'a mut AgentCore);

impl Endpoint for WorkerEndpoint<'_> {
    type Out = AgentOut;

    fn on_hello(&mut self, m: Message) -> Vec<AgentOut> {
        // The worker is now blocked waiting for its first job.
        self.0.worker_waiting = true;

        let hello = match wire::Hello::decode(&m.payload) {
            Ok(hello) => hello,
            Err(err) => {
                warn!(error = %err, "bad HELLO from worker");
                return Vec::new();
            }
        };
        // Forward upstream with the lenient side of the negotiation.
        let negotiated = wire::Hello {
            hb_timeout_secs: hello
                .hb_timeout_secs
                .max(self.0.settings.heartbeat_timeout.as_secs() as u32),
            ..hello
        };
        vec![AgentOut::ToNetwork(Message::direct(
            Subject::Hello,
            negotiated.encode(),
        ))]
    }

    fn on_result(&mut self, m: Message) -> Vec<AgentOut> {
        let mut outs = vec![AgentOut::ToNetwork(Message::direct(
            Subject::Result,
            m.payload,
        ))];
        match self.0.queue.pop_front() {
            Some(job) => outs.push(AgentOut::ToWorker(job)),
            None => self.0.worker_waiting = true,
        }
        outs
    }
}

/// Handlers for the delegator-facing DEALER socket.
struct NetworkEndpoint<'a>(&'a mut AgentCore);

impl Endpoint for NetworkEndpoint<'_> {
    type Out = AgentOut;

    fn on_welcome(&mut self, m: Message) -> Vec<AgentOut> {
        match wire::Welcome::decode(&m.payload) {
            Ok(welcome) => {
                info!(timeout_secs = welcome.hb_timeout_secs, "welcomed by delegator");
                vec![AgentOut::StartHeartbeats(Duration::from_secs(u64::from(
                    welcome.hb_timeout_secs,
                )))]
            }
            Err(err) => {
                warn!(error = %err, "bad WELCOME payload");
                Vec::new()
            }
        }
    }

    fn on_job(&mut self, m: Message) -> Vec<AgentOut> {
        let job = Message::direct(Subject::Job, m.payload);
        if self.0.worker_waiting {
            self.0.worker_waiting = false;
            vec![AgentOut::ToWorker(job)]
        } else {
            self.0.queue.push_back(job);
            Vec::new()
        }
    }

    fn on_bye(&mut self, _m: Message) -> Vec<AgentOut> {
        info!("delegator said BYE, shutting down");
        vec![AgentOut::Shutdown]
    }

    fn on_heartbeat(&mut self, _m: Message) -> Vec<AgentOut> {
        Vec::new()
    }
}

/// The agent's socket shell.
pub struct Agent {
    worker: Channel<RepSocket>,
    network: Channel<DealerSocket>,
    core: AgentCore,
}

impl Agent {
    /// Bind the worker-facing socket and connect upstream.
    pub async fn connect(settings: AgentSettings) -> Result<Self, CommsError> {
        let mut worker = RepSocket::new();
        worker.bind(&settings.bind_addr).await?;

        let mut network = DealerSocket::new();
        info!(addr = %settings.network_addr, "agent connecting to delegator");
        network.connect(&settings.network_addr).await?;

        Ok(Agent {
            worker: Channel::direct("toWorker", worker),
            network: Channel::direct("toNetwork", network),
            core: AgentCore::new(settings),
        })
    }

    /// Poll until shutdown is requested, the delegator says BYE, or its
    /// heartbeats stop (the latter returns an error so a supervisor can
    /// restart the agent).
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        enum Polled {
            Worker(Message),
            Network(Message),
            Tick,
            Shutdown,
        }

        loop {
            let deadline = tokio::time::Instant::from_std(self.network.poll_deadline());
            let polled = {
                let worker = &mut self.worker;
                let network = &mut self.network;
                let worker_waiting = self.core.worker_waiting;
                tokio::select! {
                    // A REP socket owes a reply whenever the worker is
                    // waiting, so only poll it between exchanges.
                    m = worker.recv(), if !worker_waiting => Polled::Worker(m?),
                    m = network.recv() => Polled::Network(m?),
                    _ = tokio::time::sleep_until(deadline) => Polled::Tick,
                    _ = shutdown.recv() => Polled::Shutdown,
                }
            };

            let outs = match polled {
                Polled::Worker(m) => dispatch(&mut WorkerEndpoint(&mut self.core), m),
                Polled::Network(m) => dispatch(&mut NetworkEndpoint(&mut self.core), m),
                Polled::Tick => Vec::new(),
                Polled::Shutdown => {
                    self.network.send(&Message::bye(Bytes::new())).await;
                    break;
                }
            };

            for out in outs {
                match out {
                    AgentOut::ToWorker(msg) => {
                        self.worker.send(&msg).await;
                    }
                    AgentOut::ToNetwork(msg) => {
                        self.network.send(&msg).await;
                    }
                    AgentOut::StartHeartbeats(timeout) => {
                        self.network.start_heartbeats(Bytes::new(), timeout);
                    }
                    AgentOut::Shutdown => return Ok(()),
                }
            }

            for action in self.network.hb_idle() {
                match action {
                    Action::Ping(addr) => {
                        self.network.send(&Message::heartbeat(addr)).await;
                    }
                    Action::Expire(_) => {
                        warn!("delegator heartbeats stopped");
                        return Err(CommsError::PeerLost("delegator").into());
                    }
                }
            }
        }
        Ok(())
    }
}

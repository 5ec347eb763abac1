//! The kiln job-dispatch fabric.
//!
//! A three-tier messaging topology over ZMQ: the sampler's [`Requester`]
//! submits batches to the [`Delegator`], which splits each batch into one job
//! per configured job type and spreads them across remote [`Agent`]s; each
//! agent fronts a local [`Worker`] that evaluates the user likelihood. Every
//! link is a [`Channel`] owning its own [`Heartbeat`] monitor, so dead peers
//! are detected and their in-flight jobs requeued without losing samples.

pub mod agent;
pub mod channel;
pub mod delegator;
pub mod endpoint;
pub mod heartbeat;
pub mod requester;
pub mod worker;

pub use agent::{Agent, AgentSettings};
pub use channel::Channel;
pub use delegator::{Delegator, DelegatorSettings};
pub use heartbeat::Heartbeat;
pub use requester::Requester;
pub use worker::{Worker, WorkerSettings};

/// Errors surfaced by the fabric.
#[derive(Debug, thiserror::Error)]
pub enum CommsError {
    #[error("transport error: {0}")]
    Zmq(#[from] zeromq::ZmqError),
    #[error(transparent)]
    Wire(#[from] kiln_proto::WireError),
    #[error("unexpected {actual} on {link} link")]
    UnexpectedSubject {
        link: &'static str,
        actual: kiln_proto::Subject,
    },
    #[error("lost contact with {0}")]
    PeerLost(&'static str),
}

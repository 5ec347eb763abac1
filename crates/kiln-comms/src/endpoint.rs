//! Subject-dispatched message handling.
//!
//! An endpoint is the handler table for one socket: [`dispatch`] routes a
//! message to the handler for its subject, unhandled subjects fall through to
//! `on_default` (drop), and `on_any` runs after the subject handler. Handlers
//! are synchronous and return outbound actions for the owning poll loop to
//! perform, which keeps the state machines free of socket I/O and directly
//! testable.

use kiln_proto::{Message, Subject};
use tracing::debug;

pub trait Endpoint {
    /// Actions the poll loop performs after dispatch (sends, disconnects...).
    type Out;

    fn on_heartbeat(&mut self, m: Message) -> Vec<Self::Out> {
        self.on_default(m)
    }
    fn on_hello(&mut self, m: Message) -> Vec<Self::Out> {
        self.on_default(m)
    }
    fn on_welcome(&mut self, m: Message) -> Vec<Self::Out> {
        self.on_default(m)
    }
    fn on_bye(&mut self, m: Message) -> Vec<Self::Out> {
        self.on_default(m)
    }
    fn on_job(&mut self, m: Message) -> Vec<Self::Out> {
        self.on_default(m)
    }
    fn on_result(&mut self, m: Message) -> Vec<Self::Out> {
        self.on_default(m)
    }
    fn on_batch_job(&mut self, m: Message) -> Vec<Self::Out> {
        self.on_default(m)
    }
    fn on_batch_result(&mut self, m: Message) -> Vec<Self::Out> {
        self.on_default(m)
    }

    /// Fallback for subjects this endpoint does not care about.
    fn on_default(&mut self, m: Message) -> Vec<Self::Out> {
        debug!(subject = %m.subject, "dropping unhandled message");
        Vec::new()
    }

    /// Runs after the subject-specific handler for every message.
    fn on_any(&mut self, _m: &Message) {}
}

/// Route one message through an endpoint's handler table.
pub fn dispatch<E: Endpoint>(endpoint: &mut E, m: Message) -> Vec<E::Out> {
    let copy = m.clone();
    let out = match m.subject {
        Subject::Heartbeat => endpoint.on_heartbeat(m),
        Subject::Hello => endpoint.on_hello(m),
        Subject::Welcome => endpoint.on_welcome(m),
        Subject::Bye => endpoint.on_bye(m),
        Subject::Job => endpoint.on_job(m),
        Subject::Result => endpoint.on_result(m),
        Subject::BatchJob => endpoint.on_batch_job(m),
        Subject::BatchResult => endpoint.on_batch_result(m),
    };
    endpoint.on_any(&copy);
    out
}

//! Named socket wrapper with heartbeat bookkeeping.
//!
//! A [`Channel`] pairs one ZMQ socket with its own [`Heartbeat`] monitor.
//! Sends and receives keep the monitor's last-send/last-recv clocks current;
//! a failed send reports the peer so the owner can disconnect it.

use std::time::{Duration, Instant};

use bytes::Bytes;
use kiln_proto::Message;
use tracing::{trace, warn};
use zeromq::{SocketRecv, SocketSend, ZmqMessage};

use crate::heartbeat::{Action, DisconnectReason, Heartbeat};
use crate::CommsError;

/// Fallback poll bound when no heartbeats are armed.
const IDLE_POLL: Duration = Duration::from_secs(1);

pub struct Channel<S> {
    name: &'static str,
    socket: S,
    routed: bool,
    hb: Heartbeat,
}

impl<S> Channel<S> {
    /// Wrap a ROUTER socket: received messages carry the sender identity and
    /// outgoing messages are routed by address.
    pub fn routed(name: &'static str, socket: S) -> Self {
        Channel {
            name,
            socket,
            routed: true,
            hb: Heartbeat::new(),
        }
    }

    /// Wrap a connected socket (DEALER/REQ/REP): addresses are empty.
    pub fn direct(name: &'static str, socket: S) -> Self {
        Channel {
            name,
            socket,
            routed: false,
            hb: Heartbeat::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Begin heartbeat monitoring for a peer with the negotiated timeout.
    pub fn start_heartbeats(&mut self, addr: Bytes, timeout: Duration) {
        self.hb.connect(addr, timeout);
    }

    pub fn stop_heartbeats(&mut self, addr: &Bytes) {
        self.hb.disconnect(addr, DisconnectReason::Requested);
    }

    /// Run one heartbeat maintenance pass; see [`Heartbeat::idle`].
    pub fn hb_idle(&mut self) -> Vec<Action> {
        self.hb.idle()
    }

    /// Deadline bounding the next poll wait: the earliest due heartbeat, or
    /// a coarse idle tick when no peers are monitored.
    pub fn poll_deadline(&self) -> Instant {
        self.hb
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + IDLE_POLL)
    }
}

impl<S: SocketSend + SocketRecv + Send> Channel<S> {
    /// Send a message. Returns false on transport failure, after logging;
    /// the caller is expected to treat the peer as gone.
    pub async fn send(&mut self, msg: &Message) -> bool {
        trace!(channel = self.name, %msg, "send");

        let mut frames = msg.to_frames().into_iter();
        let mut zmsg = ZmqMessage::from(frames.next().expect("message has a body frame").to_vec());
        for frame in frames {
            zmsg.push_back(frame);
        }

        match self.socket.send(zmsg).await {
            Ok(()) => {
                self.hb.update_last_send(&msg.address);
                true
            }
            Err(err) => {
                warn!(channel = self.name, peer = %String::from_utf8_lossy(&msg.address),
                    error = %err, "send failed");
                false
            }
        }
    }

    /// Receive the next well-formed message, dropping malformed frames with a
    /// warning. Blocks until a message arrives.
    pub async fn recv(&mut self) -> Result<Message, CommsError> {
        loop {
            let zmsg = self.socket.recv().await?;
            let frames = zmsg.into_vec();
            match Message::from_frames(&frames, self.routed) {
                Ok(msg) => {
                    trace!(channel = self.name, %msg, "recv");
                    self.hb.update_last_recv(&msg.address);
                    return Ok(msg);
                }
                Err(err) => {
                    warn!(channel = self.name, error = %err, "dropping malformed frame");
                }
            }
        }
    }
}


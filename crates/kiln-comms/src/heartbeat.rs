//! Per-peer liveness tracking.
//!
//! Each connection records when we last sent to and last heard from the peer.
//! A peer gets a HEARTBEAT once per interval of silence on the send side, and
//! is expired once it has been quiet for two full intervals on the receive
//! side. The interval is half the negotiated timeout, so expiry lands at the
//! agreed timeout.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::debug;

/// Why a peer was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer said BYE or the caller asked for the removal.
    Requested,
    /// No traffic within two heartbeat intervals.
    Timeout,
}

/// What the owning channel should do after an [`Heartbeat::idle`] pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send a HEARTBEAT to this peer.
    Ping(Bytes),
    /// The peer timed out and has been removed from the monitor.
    Expire(Bytes),
}

struct Connection {
    interval: Duration,
    last_send: Instant,
    last_recv: Instant,
}

/// Tracks liveness for every peer of one socket.
#[derive(Default)]
pub struct Heartbeat {
    conns: HashMap<Bytes, Connection>,
}

impl Heartbeat {
    pub fn new() -> Self {
        Heartbeat::default()
    }

    /// Start monitoring a peer with the given negotiated timeout. We send two
    /// heartbeats per timeout. Reconnecting an already-tracked peer keeps the
    /// larger of the two intervals.
    pub fn connect(&mut self, addr: Bytes, timeout: Duration) {
        self.connect_at(addr, timeout, Instant::now());
    }

    pub(crate) fn connect_at(&mut self, addr: Bytes, timeout: Duration, now: Instant) {
        let interval = timeout / 2;
        match self.conns.get_mut(&addr) {
            Some(conn) => {
                conn.interval = conn.interval.max(interval);
                conn.last_recv = now;
            }
            None => {
                self.conns.insert(
                    addr,
                    Connection {
                        interval,
                        last_send: now,
                        last_recv: now,
                    },
                );
            }
        }
    }

    /// Stop monitoring a peer.
    pub fn disconnect(&mut self, addr: &Bytes, reason: DisconnectReason) {
        if self.conns.remove(addr).is_some() {
            debug!(peer = %String::from_utf8_lossy(addr), ?reason, "peer disconnected");
        }
    }

    pub fn update_last_send(&mut self, addr: &Bytes) {
        if let Some(conn) = self.conns.get_mut(addr) {
            conn.last_send = Instant::now();
        }
    }

    pub fn update_last_recv(&mut self, addr: &Bytes) {
        if let Some(conn) = self.conns.get_mut(addr) {
            conn.last_recv = Instant::now();
        }
    }

    pub fn is_monitoring(&self, addr: &Bytes) -> bool {
        self.conns.contains_key(addr)
    }

    /// Run one maintenance pass: expire quiet peers, then emit pings for
    /// connections whose send side has gone an interval without traffic.
    ///
    /// A peer that is due both a ping and an expiry only gets the expiry;
    /// expired peers are removed, so each fires the expiry exactly once.
    pub fn idle(&mut self) -> Vec<Action> {
        self.idle_at(Instant::now())
    }

    pub(crate) fn idle_at(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();

        let expired: Vec<Bytes> = self
            .conns
            .iter()
            .filter(|(_, c)| c.last_recv + c.interval * 2 < now)
            .map(|(addr, _)| addr.clone())
            .collect();
        for addr in expired {
            self.conns.remove(&addr);
            debug!(peer = %String::from_utf8_lossy(&addr), "peer timed out");
            actions.push(Action::Expire(addr));
        }

        for (addr, conn) in &mut self.conns {
            if conn.last_send + conn.interval <= now {
                conn.last_send = now;
                actions.push(Action::Ping(addr.clone()));
            }
        }

        actions
    }

    /// When the next ping is due, to bound the poll wait. `None` with no
    /// connections.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.conns
            .values()
            .map(|c| c.last_send + c.interval)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn pings_once_per_interval() {
        let mut hb = Heartbeat::new();
        let start = Instant::now();
        hb.connect_at(addr("a"), Duration::from_secs(2), start);

        // Nothing due before the interval elapses.
        assert!(hb.idle_at(start + Duration::from_millis(500)).is_empty());

        let actions = hb.idle_at(start + Duration::from_secs(1));
        assert_eq!(actions, vec![Action::Ping(addr("a"))]);

        // The ping reset last_send, so nothing is due right after.
        assert!(hb.idle_at(start + Duration::from_millis(1100)).is_empty());
    }

    #[test]
    fn expires_after_two_quiet_intervals() {
        let mut hb = Heartbeat::new();
        let start = Instant::now();
        hb.connect_at(addr("a"), Duration::from_secs(2), start);

        // Exactly at 2 * interval the peer is still alive (strict inequality).
        let at_limit = hb.idle_at(start + Duration::from_secs(2));
        assert!(!at_limit.contains(&Action::Expire(addr("a"))));

        let actions = hb.idle_at(start + Duration::from_millis(2001));
        assert!(actions.contains(&Action::Expire(addr("a"))));
        assert!(!hb.is_monitoring(&addr("a")));
    }

    #[test]
    fn expiry_fires_exactly_once() {
        let mut hb = Heartbeat::new();
        let start = Instant::now();
        hb.connect_at(addr("a"), Duration::from_secs(1), start);

        let first = hb.idle_at(start + Duration::from_secs(5));
        assert_eq!(
            first.iter().filter(|a| matches!(a, Action::Expire(_))).count(),
            1
        );
        assert!(hb.idle_at(start + Duration::from_secs(6)).is_empty());
    }

    #[test]
    fn timeout_wins_over_ping() {
        let mut hb = Heartbeat::new();
        let start = Instant::now();
        hb.connect_at(addr("a"), Duration::from_secs(2), start);

        // Both a ping and the expiry are overdue; only the expiry fires.
        let actions = hb.idle_at(start + Duration::from_secs(10));
        assert_eq!(actions, vec![Action::Expire(addr("a"))]);
    }

    #[test]
    fn traffic_defers_expiry() {
        let mut hb = Heartbeat::new();
        let start = Instant::now();
        hb.connect_at(addr("a"), Duration::from_secs(2), start);

        std::thread::sleep(Duration::from_millis(5));
        hb.update_last_recv(&addr("a"));
        let actions = hb.idle_at(start + Duration::from_millis(2004));
        assert!(!actions.iter().any(|a| matches!(a, Action::Expire(_))));
    }

    #[test]
    fn reconnect_keeps_larger_interval() {
        let mut hb = Heartbeat::new();
        let start = Instant::now();
        hb.connect_at(addr("a"), Duration::from_secs(10), start);
        hb.connect_at(addr("a"), Duration::from_secs(2), start);

        // Interval stayed at 5s: no ping due at 2s.
        assert!(hb.idle_at(start + Duration::from_secs(2)).is_empty());
        assert_eq!(
            hb.idle_at(start + Duration::from_secs(5)),
            vec![Action::Ping(addr("a"))]
        );
    }

    #[test]
    fn next_deadline_tracks_earliest_ping() {
        let mut hb = Heartbeat::new();
        assert!(hb.next_deadline().is_none());

        let start = Instant::now();
        hb.connect_at(addr("slow"), Duration::from_secs(20), start);
        hb.connect_at(addr("fast"), Duration::from_secs(2), start);

        let deadline = hb.next_deadline().unwrap();
        assert_eq!(deadline, start + Duration::from_secs(1));
    }
}

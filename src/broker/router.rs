//! Subscription table and message fan-out for the embedded broker.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use super::protocol::ServerFrame;
use crate::subjects;

pub type ConnId = u64;

struct ConnEntry {
    name: String,
    tx: mpsc::UnboundedSender<ServerFrame>,
    connected_at: DateTime<Utc>,
}

#[derive(Clone)]
struct SubEntry {
    subject: String,
    queue: Option<String>,
}

#[derive(Default)]
struct RouterState {
    conns: HashMap<ConnId, ConnEntry>,
    subs: BTreeMap<(ConnId, u64), SubEntry>,
    /// Round-robin cursor per queue group.
    cursors: HashMap<String, usize>,
}

/// Counters reported by the monitor endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerStats {
    pub connections: usize,
    pub subscriptions: usize,
    pub in_msgs: u64,
    pub out_msgs: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnId,
    pub name: String,
    pub subscriptions: usize,
    pub connected_at: DateTime<Utc>,
}

pub struct Router {
    state: Mutex<RouterState>,
    next_conn: AtomicU64,
    in_msgs: AtomicU64,
    out_msgs: AtomicU64,
    started_at: DateTime<Utc>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RouterState::default()),
            next_conn: AtomicU64::new(1),
            in_msgs: AtomicU64::new(0),
            out_msgs: AtomicU64::new(0),
            started_at: Utc::now(),
        }
    }

    pub fn register(&self, name: String, tx: mpsc::UnboundedSender<ServerFrame>) -> ConnId {
        let id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        self.state.lock().conns.insert(
            id,
            ConnEntry {
                name,
                tx,
                connected_at: Utc::now(),
            },
        );
        id
    }

    /// Forget a connection and every subscription it holds.
    pub fn remove(&self, conn: ConnId) {
        let mut state = self.state.lock();
        state.conns.remove(&conn);
        state.subs.retain(|(c, _), _| *c != conn);
    }

    pub fn subscribe(&self, conn: ConnId, sid: u64, subject: String, queue: Option<String>) {
        self.state
            .lock()
            .subs
            .insert((conn, sid), SubEntry { subject, queue });
    }

    pub fn unsubscribe(&self, conn: ConnId, sid: u64) {
        self.state.lock().subs.remove(&(conn, sid));
    }

    /// Deliver a message to every matching plain subscriber and to one member
    /// of every matching queue group. Returns the number of deliveries.
    pub fn publish(&self, subject: &str, reply: Option<&str>, payload: &Value) -> usize {
        self.in_msgs.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.lock();
        let mut targets: Vec<(ConnId, u64)> = Vec::new();
        let mut groups: BTreeMap<String, Vec<(ConnId, u64)>> = BTreeMap::new();

        for (key, sub) in state.subs.iter() {
            if !subjects::matches(&sub.subject, subject) {
                continue;
            }
            match &sub.queue {
                Some(queue) => groups.entry(queue.clone()).or_default().push(*key),
                None => targets.push(*key),
            }
        }

        for (queue, members) in groups {
            let cursor = state.cursors.entry(queue).or_insert(0);
            let pick = members[*cursor % members.len()];
            *cursor = cursor.wrapping_add(1);
            targets.push(pick);
        }

        let mut delivered = 0;
        for (conn, sid) in targets {
            let Some(entry) = state.conns.get(&conn) else {
                continue;
            };
            let frame = ServerFrame::Msg {
                sid,
                subject: subject.to_string(),
                reply: reply.map(str::to_string),
                payload: payload.clone(),
            };
            if entry.tx.send(frame).is_ok() {
                delivered += 1;
            }
        }
        self.out_msgs.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Drop every connection's outbound channel so connection tasks wind down.
    pub fn close_all(&self) {
        let mut state = self.state.lock();
        state.conns.clear();
        state.subs.clear();
    }

    pub fn stats(&self) -> BrokerStats {
        let state = self.state.lock();
        BrokerStats {
            connections: state.conns.len(),
            subscriptions: state.subs.len(),
            in_msgs: self.in_msgs.load(Ordering::Relaxed),
            out_msgs: self.out_msgs.load(Ordering::Relaxed),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
        }
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let state = self.state.lock();
        let mut list: Vec<ConnectionInfo> = state
            .conns
            .iter()
            .map(|(id, entry)| ConnectionInfo {
                id: *id,
                name: entry.name.clone(),
                subscriptions: state.subs.keys().filter(|(c, _)| c == id).count(),
                connected_at: entry.connected_at,
            })
            .collect();
        list.sort_by_key(|c| c.id);
        list
    }
}

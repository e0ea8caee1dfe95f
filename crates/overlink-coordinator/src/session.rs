//! Live session table
//!
//! The table is the coordinator's only cross-task shared mutable structure.
//! Entries are `Arc`ed so stream handlers keep working with a session that
//! has already been displaced; removal is one-way and keyed by id.
//!
//! Each entry owns a bounded outbound mailbox. Dispatch into a session is a
//! non-blocking enqueue: when the destination's relay writer cannot keep
//! up, the oldest queued frame is evicted and counted as a drop, so one
//! slow agent never blocks the router.

use overlink_proto::{AgentKind, ControlMessage, TrafficStats};
use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use uuid::Uuid;

/// Outbound frames buffered per destination session.
pub const MAILBOX_DEPTH: usize = 256;

/// Bounded FIFO with drop-oldest overflow.
#[derive(Debug)]
pub struct Mailbox {
    queue: Mutex<VecDeque<ControlMessage>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl Mailbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue without blocking. Returns the number of frames evicted to
    /// make room (0 or 1).
    pub fn push(&self, msg: ControlMessage) -> usize {
        if self.closed.load(Ordering::SeqCst) {
            return 1;
        }

        let evicted = {
            let mut queue = self.queue.lock().unwrap();
            let evicted = if queue.len() >= self.capacity {
                queue.pop_front();
                1
            } else {
                0
            };
            queue.push_back(msg);
            evicted
        };

        self.notify.notify_one();
        evicted
    }

    /// Dequeue the next frame, waiting if the mailbox is empty. Returns
    /// `None` once the mailbox is closed and drained.
    pub async fn pop(&self) -> Option<ControlMessage> {
        loop {
            {
                let mut queue = self.queue.lock().unwrap();
                if let Some(msg) = queue.pop_front() {
                    return Some(msg);
                }
                if self.closed.load(Ordering::SeqCst) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One live agent session.
#[derive(Debug)]
pub struct SessionEntry {
    pub session_id: String,
    pub agent_id: String,
    pub user_id: Uuid,
    pub kind: AgentKind,
    pub overlay_ip: Ipv4Addr,
    pub connection_id: String,
    pub peer_addr: SocketAddr,

    mailbox: Mailbox,
    last_activity: RwLock<Instant>,
    /// Counters the agent reported on its last heartbeat
    reported_stats: RwLock<TrafficStats>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    drops: AtomicU64,

    relay_bound: AtomicBool,
    relay_abort: Mutex<Option<AbortHandle>>,
    closed: AtomicBool,
    closed_notify: Notify,
}

impl SessionEntry {
    pub fn new(
        session_id: String,
        agent_id: String,
        user_id: Uuid,
        kind: AgentKind,
        overlay_ip: Ipv4Addr,
        connection_id: String,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            session_id,
            agent_id,
            user_id,
            kind,
            overlay_ip,
            connection_id,
            peer_addr,
            mailbox: Mailbox::new(MAILBOX_DEPTH),
            last_activity: RwLock::new(Instant::now()),
            reported_stats: RwLock::new(TrafficStats::default()),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            drops: AtomicU64::new(0),
            relay_bound: AtomicBool::new(false),
            relay_abort: Mutex::new(None),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        }
    }

    pub fn touch(&self) {
        *self.last_activity.write().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.read().unwrap().elapsed()
    }

    pub fn record_reported_stats(&self, stats: TrafficStats) {
        *self.reported_stats.write().unwrap() = stats;
    }

    pub fn reported_stats(&self) -> TrafficStats {
        *self.reported_stats.read().unwrap()
    }

    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    pub fn record_drop(&self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Queue an outbound frame for this session's relay writer. Evictions
    /// and enqueue-after-close both count as drops.
    pub fn enqueue(&self, msg: ControlMessage, payload_len: usize) {
        let evicted = self.mailbox.push(msg);
        if evicted > 0 {
            self.drops.fetch_add(evicted as u64, Ordering::Relaxed);
        } else {
            self.bytes_out.fetch_add(payload_len as u64, Ordering::Relaxed);
        }
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Mark this entry's relay stream as bound and remember how to abort
    /// the task driving it.
    pub fn bind_relay(&self, abort: AbortHandle) {
        self.relay_bound.store(true, Ordering::SeqCst);
        *self.relay_abort.lock().unwrap() = Some(abort);
    }

    pub fn relay_bound(&self) -> bool {
        self.relay_bound.load(Ordering::SeqCst)
    }

    /// Stop this session's relay: close the mailbox and abort the task
    /// that owns the stream, which drops the stream and surfaces an
    /// end-of-stream to the agent.
    pub fn shutdown(&self) {
        self.mailbox.close();
        if let Some(abort) = self.relay_abort.lock().unwrap().take() {
            abort.abort();
        }
    }

    /// Mark the relay fully torn down and wake anyone waiting on it.
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.closed_notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait (bounded) until the relay task has torn down. Sessions that
    /// never bound a relay stream have nothing to wait for.
    pub async fn wait_closed(&self, limit: std::time::Duration) {
        if !self.relay_bound() || self.is_closed() {
            return;
        }
        let _ = tokio::time::timeout(limit, self.closed_notify.notified()).await;
    }
}

#[derive(Debug, Default)]
struct TableInner {
    by_session: HashMap<String, std::sync::Arc<SessionEntry>>,
    by_agent: HashMap<String, String>,
}

/// Table of live sessions, keyed by session id with an agent-id index.
#[derive(Debug, Default)]
pub struct SessionTable {
    inner: RwLock<TableInner>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session. If the agent already had a live session the
    /// displaced entry is removed from the table and returned; the caller
    /// is responsible for closing it before acknowledging the new one.
    pub fn insert(
        &self,
        entry: std::sync::Arc<SessionEntry>,
    ) -> Option<std::sync::Arc<SessionEntry>> {
        let mut inner = self.inner.write().unwrap();

        let displaced = inner
            .by_agent
            .get(&entry.agent_id)
            .cloned()
            .and_then(|old_session| inner.by_session.remove(&old_session));

        inner
            .by_agent
            .insert(entry.agent_id.clone(), entry.session_id.clone());
        inner
            .by_session
            .insert(entry.session_id.clone(), entry.clone());

        displaced
    }

    /// Remove a session, but only if the table still maps its id to this
    /// exact entry. Prevents a displaced session's teardown from removing
    /// its replacement.
    pub fn remove_if_current(&self, entry: &std::sync::Arc<SessionEntry>) -> bool {
        let mut inner = self.inner.write().unwrap();

        match inner.by_session.get(&entry.session_id) {
            Some(current) if std::sync::Arc::ptr_eq(current, entry) => {}
            _ => return false,
        }

        inner.by_session.remove(&entry.session_id);
        if inner
            .by_agent
            .get(&entry.agent_id)
            .is_some_and(|sid| *sid == entry.session_id)
        {
            inner.by_agent.remove(&entry.agent_id);
        }

        true
    }

    pub fn get(&self, session_id: &str) -> Option<std::sync::Arc<SessionEntry>> {
        self.inner.read().unwrap().by_session.get(session_id).cloned()
    }

    pub fn get_by_agent(&self, agent_id: &str) -> Option<std::sync::Arc<SessionEntry>> {
        let inner = self.inner.read().unwrap();
        inner
            .by_agent
            .get(agent_id)
            .and_then(|sid| inner.by_session.get(sid))
            .cloned()
    }

    /// Deterministic gateway selection: the live gateway session of this
    /// user with the smallest agent id.
    pub fn gateway_for_user(&self, user_id: Uuid) -> Option<std::sync::Arc<SessionEntry>> {
        let inner = self.inner.read().unwrap();
        inner
            .by_session
            .values()
            .filter(|entry| entry.kind == AgentKind::Gateway && entry.user_id == user_id)
            .min_by(|a, b| a.agent_id.cmp(&b.agent_id))
            .cloned()
    }

    pub fn list(&self) -> Vec<std::sync::Arc<SessionEntry>> {
        self.inner.read().unwrap().by_session.values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.inner.read().unwrap().by_session.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn entry(session_id: &str, agent_id: &str, kind: AgentKind) -> Arc<SessionEntry> {
        entry_for_user(session_id, agent_id, kind, Uuid::nil())
    }

    fn entry_for_user(
        session_id: &str,
        agent_id: &str,
        kind: AgentKind,
        user_id: Uuid,
    ) -> Arc<SessionEntry> {
        Arc::new(SessionEntry::new(
            session_id.to_string(),
            agent_id.to_string(),
            user_id,
            kind,
            Ipv4Addr::new(10, 200, 0, 2),
            format!("conn-{}", session_id),
            "127.0.0.1:9999".parse().unwrap(),
        ))
    }

    fn frame(n: u64) -> ControlMessage {
        ControlMessage::Packet {
            session_id: format!("sess-{}", n),
            source_agent_id: "src".to_string(),
            destination_agent_id: None,
            payload: vec![0u8; 8],
        }
    }

    #[tokio::test]
    async fn test_mailbox_fifo() {
        let mailbox = Mailbox::new(4);

        mailbox.push(frame(1));
        mailbox.push(frame(2));

        assert_eq!(mailbox.pop().await, Some(frame(1)));
        assert_eq!(mailbox.pop().await, Some(frame(2)));
    }

    #[tokio::test]
    async fn test_mailbox_drops_oldest_when_full() {
        let mailbox = Mailbox::new(2);

        assert_eq!(mailbox.push(frame(1)), 0);
        assert_eq!(mailbox.push(frame(2)), 0);
        assert_eq!(mailbox.push(frame(3)), 1);

        // Oldest frame was evicted
        assert_eq!(mailbox.pop().await, Some(frame(2)));
        assert_eq!(mailbox.pop().await, Some(frame(3)));
    }

    #[tokio::test]
    async fn test_mailbox_close_drains_then_ends() {
        let mailbox = Mailbox::new(4);
        mailbox.push(frame(1));
        mailbox.close();

        assert_eq!(mailbox.pop().await, Some(frame(1)));
        assert_eq!(mailbox.pop().await, None);
    }

    #[test]
    fn test_insert_displaces_same_agent() {
        let table = SessionTable::new();

        let first = entry("sess-1", "agent-1", AgentKind::Client);
        assert!(table.insert(first.clone()).is_none());

        let second = entry("sess-2", "agent-1", AgentKind::Client);
        let displaced = table.insert(second.clone()).expect("should displace");
        assert_eq!(displaced.session_id, "sess-1");

        // Only the new session remains
        assert_eq!(table.count(), 1);
        assert!(table.get("sess-1").is_none());
        assert_eq!(
            table.get_by_agent("agent-1").unwrap().session_id,
            "sess-2"
        );
    }

    #[test]
    fn test_remove_if_current_spares_replacement() {
        let table = SessionTable::new();

        let old = entry("sess-1", "agent-1", AgentKind::Client);
        table.insert(old.clone());
        let new = entry("sess-2", "agent-1", AgentKind::Client);
        table.insert(new.clone());

        // The displaced entry's teardown is a no-op
        assert!(!table.remove_if_current(&old));
        assert_eq!(table.count(), 1);

        assert!(table.remove_if_current(&new));
        assert_eq!(table.count(), 0);
    }

    #[test]
    fn test_gateway_selection_is_deterministic() {
        let table = SessionTable::new();
        let user = Uuid::new_v4();
        let other_user = Uuid::new_v4();

        table.insert(entry_for_user("s1", "gw-charlie", AgentKind::Gateway, user));
        table.insert(entry_for_user("s2", "gw-alpha", AgentKind::Gateway, user));
        table.insert(entry_for_user("s3", "client-1", AgentKind::Client, user));
        table.insert(entry_for_user("s4", "gw-aaa", AgentKind::Gateway, other_user));

        let chosen = table.gateway_for_user(user).unwrap();
        assert_eq!(chosen.agent_id, "gw-alpha");

        assert!(table.gateway_for_user(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_enqueue_counts_drops_on_overflow() {
        let e = entry("sess-1", "agent-1", AgentKind::Gateway);

        for n in 0..(MAILBOX_DEPTH as u64 + 10) {
            e.enqueue(frame(n), 8);
        }

        assert_eq!(e.drops(), 10);
        assert_eq!(e.mailbox().len(), MAILBOX_DEPTH);
    }
}

//! Replay buffering for reconnect catch-up.
//!
//! Every block a session emits is recorded in a bounded ring before it is
//! re-broadcast, so a front end that reconnects can be brought up to date
//! from the buffer and then follow the live stream without missing or
//! double-receiving the item emitted mid-handshake.

use crate::block::{epoch_millis, Block};
use crate::session::{LoginOutcome, ParsedSession, SessionEvent};
use crate::error::BridgeResult;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::warn;

/// Default number of blocks kept for catch-up.
pub const DEFAULT_REPLAY_CAPACITY: usize = 100;

/// A recorded emission.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayEntry {
    /// Emission time, epoch milliseconds.
    pub timestamp: u64,
    pub block: Block,
}

/// Fixed-capacity ring of recent blocks, oldest evicted first.
///
/// Eviction on overflow is the bounded-memory tradeoff, not an error:
/// a client further behind than the capacity simply catches up from the
/// oldest retained block.
#[derive(Debug)]
pub struct ReplayBuffer {
    entries: VecDeque<ReplayEntry>,
    capacity: usize,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a block, evicting the oldest entry if full.
    pub fn push(&mut self, block: Block) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        let timestamp = block.emitted.unwrap_or_else(epoch_millis);
        self.entries.push_back(ReplayEntry { timestamp, block });
    }

    /// All retained entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &ReplayEntry> {
        self.entries.iter()
    }

    /// Entries recorded strictly after `timestamp`, oldest first.
    pub fn iter_after(&self, timestamp: u64) -> impl Iterator<Item = &ReplayEntry> {
        self.entries.iter().filter(move |e| e.timestamp > timestamp)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A session with replay buffering attached: the unit the connection
/// directory hands out.
pub struct BufferedSession {
    key: String,
    inner: ParsedSession,
    ring: Arc<Mutex<ReplayBuffer>>,
    tx: broadcast::Sender<SessionEvent>,
}

impl std::fmt::Debug for BufferedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedSession")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl BufferedSession {
    /// Wrap a session, recording every block it emits.
    pub fn new(key: String, inner: ParsedSession, capacity: usize) -> Self {
        let ring = Arc::new(Mutex::new(ReplayBuffer::new(capacity)));
        let (tx, _) = broadcast::channel(256);

        let rx = inner.subscribe();
        tokio::spawn(forward(rx, ring.clone(), tx.clone()));

        Self {
            key,
            inner,
            ring,
            tx,
        }
    }

    /// Directory key of this session.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Subscribe to the live stream only.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Invoke `f` for every buffered block, oldest first.
    pub fn replay(&self, mut f: impl FnMut(&ReplayEntry)) {
        for entry in self.lock_ring().iter() {
            f(entry);
        }
    }

    /// Invoke `f` for every buffered block recorded strictly after
    /// `timestamp`, oldest first.
    pub fn replay_from(&self, timestamp: u64, mut f: impl FnMut(&ReplayEntry)) {
        for entry in self.lock_ring().iter_after(timestamp) {
            f(entry);
        }
    }

    /// Replay and subscribe atomically with respect to the recording task,
    /// so the item being emitted right now is delivered exactly once —
    /// either in the replay or on the returned receiver.
    pub fn catch_up(
        &self,
        from: Option<u64>,
        mut f: impl FnMut(&ReplayEntry),
    ) -> broadcast::Receiver<SessionEvent> {
        let ring = self.lock_ring();
        let rx = self.tx.subscribe();
        match from {
            Some(timestamp) => {
                for entry in ring.iter_after(timestamp) {
                    f(entry);
                }
            }
            None => {
                for entry in ring.iter() {
                    f(entry);
                }
            }
        }
        rx
    }

    pub fn write(&self, text: &str) {
        self.inner.write(text);
    }

    pub fn close(&self) {
        self.inner.close();
    }

    pub fn pause(&self) {
        self.inner.pause();
    }

    pub fn resume(&self) {
        self.inner.resume();
    }

    pub fn protocol_state(&self) -> BTreeMap<String, String> {
        self.inner.protocol_state()
    }

    pub async fn wait_login(&self) -> BridgeResult<LoginOutcome> {
        self.inner.wait_login().await
    }

    fn lock_ring(&self) -> MutexGuard<'_, ReplayBuffer> {
        self.ring.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Record blocks, then re-broadcast. The lock is held across both steps so
/// `catch_up` observes push and emit as one atomic transition.
async fn forward(
    mut rx: broadcast::Receiver<SessionEvent>,
    ring: Arc<Mutex<ReplayBuffer>>,
    tx: broadcast::Sender<SessionEvent>,
) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let mut guard = ring.lock().unwrap_or_else(|e| e.into_inner());
                if let SessionEvent::Block(block) = &event {
                    guard.push(block.clone());
                }
                let _ = tx.send(event);
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "replay recorder lagged behind the session");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Block;

    fn stamped(qual: &str, ts: u64) -> Block {
        let mut block = Block::new(qual);
        block.emitted = Some(ts);
        block
    }

    #[test]
    fn replay_preserves_order_and_content() {
        let mut ring = ReplayBuffer::new(10);
        for ts in 1..=5 {
            ring.push(stamped("root", ts));
        }
        let stamps: Vec<u64> = ring.iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn overflow_evicts_exactly_the_oldest() {
        let mut ring = ReplayBuffer::new(3);
        for ts in 1..=4 {
            ring.push(stamped("root", ts));
        }
        assert_eq!(ring.len(), 3);
        let stamps: Vec<u64> = ring.iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, vec![2, 3, 4]);
    }

    #[test]
    fn replay_from_is_a_strict_suffix() {
        let mut ring = ReplayBuffer::new(10);
        for ts in 1..=5 {
            ring.push(stamped("root", ts));
        }
        let stamps: Vec<u64> = ring.iter_after(3).map(|e| e.timestamp).collect();
        assert_eq!(stamps, vec![4, 5]);
        assert_eq!(ring.iter_after(5).count(), 0);
    }

    #[test]
    fn zero_capacity_records_nothing() {
        let mut ring = ReplayBuffer::new(0);
        ring.push(stamped("root", 1));
        assert!(ring.is_empty());
    }

    mod buffered {
        use super::*;
        use crate::classify::NoopTagger;
        use crate::connection::{ConnectionEvent, GameConnection};
        use crate::session::{NoopTabulator, ParsedSession};
        use crate::splitter::DirtyTailPolicy;
        use std::sync::Arc;
        use tokio::sync::mpsc;

        struct ScriptedConnection {
            events: Option<mpsc::Receiver<ConnectionEvent>>,
        }

        impl ScriptedConnection {
            fn new() -> (Self, mpsc::Sender<ConnectionEvent>) {
                let (tx, rx) = mpsc::channel(64);
                (Self { events: Some(rx) }, tx)
            }
        }

        impl GameConnection for ScriptedConnection {
            fn take_events(&mut self) -> Option<mpsc::Receiver<ConnectionEvent>> {
                self.events.take()
            }
            fn write(&self, _text: &str) {}
            fn close(&self) {}
            fn pause(&self) {}
            fn resume(&self) {}
        }

        async fn buffered_session() -> (BufferedSession, mpsc::Sender<ConnectionEvent>) {
            let (conn, feed) = ScriptedConnection::new();
            let session = ParsedSession::new(
                Box::new(conn),
                Arc::new(NoopTagger),
                Arc::new(NoopTabulator),
                DirtyTailPolicy::ProtocolOnly,
            )
            .unwrap();
            let buffered = BufferedSession::new("tester".into(), session, 100);
            feed.send(ConnectionEvent::LoginResult {
                success: true,
                reason: None,
            })
            .await
            .unwrap();
            (buffered, feed)
        }

        #[tokio::test]
        async fn live_blocks_are_also_recorded() {
            let (buffered, feed) = buffered_session().await;
            let mut rx = buffered.subscribe();

            feed.send(ConnectionEvent::Data(b"hello there\r\nprompt\xFF\xF9".to_vec()))
                .await
                .unwrap();

            // Skip the login result, then take the block.
            loop {
                match rx.recv().await.unwrap() {
                    SessionEvent::Block(live) => {
                        let mut replayed = Vec::new();
                        buffered.replay(|entry| replayed.push(entry.block.clone()));
                        assert_eq!(replayed, vec![live]);
                        break;
                    }
                    _ => continue,
                }
            }
        }

        #[tokio::test]
        async fn catch_up_from_timestamp_filters_the_buffer() {
            let (buffered, feed) = buffered_session().await;
            let mut rx = buffered.subscribe();

            for text in [&b"one\r\np1\xFF\xF9"[..], &b"two\r\np2\xFF\xF9"[..]] {
                feed.send(ConnectionEvent::Data(text.to_vec())).await.unwrap();
            }
            // Wait until both blocks are through the recorder.
            let mut seen = 0;
            while seen < 2 {
                if let SessionEvent::Block(_) = rx.recv().await.unwrap() {
                    seen += 1;
                }
            }

            let mut all = Vec::new();
            buffered.replay(|entry| all.push(entry.timestamp));
            assert_eq!(all.len(), 2);

            // Strictly-after filter; blocks emitted in the same millisecond
            // share a stamp, so compute the expectation with the same rule.
            let cutoff = all[0];
            let expected: Vec<u64> = all.iter().copied().filter(|t| *t > cutoff).collect();
            let mut after = Vec::new();
            let _live = buffered.catch_up(Some(cutoff), |entry| after.push(entry.timestamp));
            assert_eq!(after, expected);
        }
    }
}

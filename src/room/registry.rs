use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::Identity;
use crate::config::Config;
use crate::models::{AppError, ServerMessage};
use crate::room::writer::{JoinResponse, RoomCmd, RoomStats, RoomTiming, RoomWriter};

const JOIN_ATTEMPTS: u32 = 3;
const ROOM_CMD_QUEUE: usize = 256;

/// Aggregate counters over every live room, for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryStats {
    pub rooms: u32,
    pub conns: u32,
    pub dirty_rooms: u32,
}

struct RoomEntry {
    tx: mpsc::Sender<RoomCmd>,
    epoch: u64,
}

/// Owns the map from document id to live room writer. Rooms are spawned
/// lazily on the first join and remove themselves when their grace period
/// expires; epochs disambiguate a dying room from its successor.
pub struct RoomRegistry {
    store: crate::persist::DocStore,
    rooms: Mutex<HashMap<Uuid, RoomEntry>>,
    epochs: AtomicU64,
    timing: RoomTiming,
}

impl RoomRegistry {
    pub fn new(store: crate::persist::DocStore, config: &Config) -> Arc<Self> {
        Arc::new(Self {
            store,
            rooms: Mutex::new(HashMap::new()),
            epochs: AtomicU64::new(0),
            timing: RoomTiming {
                flush_debounce: config.flush_debounce(),
                grace: config.room_grace(),
                load_timeout: config.room_load_timeout(),
            },
        })
    }

    /// Join a connection to a document room, spawning the room if needed.
    /// On success the returned sender carries this connection's subsequent
    /// commands; the join handshake (init plus awareness state) is already
    /// queued on `out` when this returns.
    pub async fn join(
        self: &Arc<Self>,
        doc_id: Uuid,
        conn_id: Uuid,
        identity: &Identity,
        out: &mpsc::Sender<ServerMessage>,
    ) -> Result<mpsc::Sender<RoomCmd>, AppError> {
        for attempt in 0..JOIN_ATTEMPTS {
            if attempt > 0 {
                // The previous epoch is mid-teardown; give its final flush a
                // beat before resolving the successor.
                tokio::time::sleep(Duration::from_millis(10)).await;
            }

            let tx = self.resolve(doc_id).await;
            let (reply_tx, reply_rx) = oneshot::channel();
            let cmd = RoomCmd::Join {
                conn_id,
                identity: identity.clone(),
                out: out.clone(),
                reply: reply_tx,
            };
            if tx.send(cmd).await.is_err() {
                continue;
            }
            match reply_rx.await {
                Ok(JoinResponse::Ok) => return Ok(tx),
                Ok(JoinResponse::Retry) | Err(_) => continue,
            }
        }

        warn!(
            "Connection {} exhausted {} join attempts for room {}",
            conn_id, JOIN_ATTEMPTS, doc_id
        );
        Err(AppError::Persistence(format!(
            "Room '{}' is shutting down, please retry",
            doc_id
        )))
    }

    /// Current room handle, spawning a fresh writer when none is live.
    async fn resolve(self: &Arc<Self>, doc_id: Uuid) -> mpsc::Sender<RoomCmd> {
        let mut rooms = self.rooms.lock().await;
        if let Some(entry) = rooms.get(&doc_id) {
            if !entry.tx.is_closed() {
                return entry.tx.clone();
            }
        }

        let epoch = self.epochs.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(ROOM_CMD_QUEUE);
        let writer = RoomWriter::new(
            doc_id,
            epoch,
            self.store.clone(),
            self.clone(),
            self.timing.clone(),
        );
        tokio::spawn(writer.run(rx));
        rooms.insert(doc_id, RoomEntry { tx: tx.clone(), epoch });
        debug!("Room {} spawned (epoch {})", doc_id, epoch);
        tx
    }

    /// Called by a room writer at the end of its teardown. Ignored when a
    /// successor epoch has already replaced the entry.
    pub(crate) async fn retire(&self, doc_id: Uuid, epoch: u64) {
        let mut rooms = self.rooms.lock().await;
        if rooms.get(&doc_id).map_or(false, |e| e.epoch == epoch) {
            rooms.remove(&doc_id);
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }

    /// Poll every live room for its counters. Rooms that close mid-query are
    /// simply skipped.
    pub async fn stats(&self) -> RegistryStats {
        let txs: Vec<mpsc::Sender<RoomCmd>> = {
            let rooms = self.rooms.lock().await;
            rooms.values().map(|e| e.tx.clone()).collect()
        };

        let mut stats = RegistryStats::default();
        for tx in txs {
            let (reply_tx, reply_rx) = oneshot::channel();
            if tx.send(RoomCmd::Stats { reply: reply_tx }).await.is_err() {
                continue;
            }
            if let Ok(RoomStats { conns, dirty }) = reply_rx.await {
                stats.rooms += 1;
                stats.conns += conns;
                if dirty {
                    stats.dirty_rooms += 1;
                }
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DocEngine;
    use crate::models::{AwarenessPayload, ClientMessage};
    use crate::persist::mem::MemStore;
    use crate::persist::DocStore;
    use tokio::time::{advance, timeout};

    fn fast_config() -> Config {
        Config {
            flush_debounce_ms: 50,
            room_grace_secs: 1,
            room_load_timeout_ms: 1_000,
            ..Config::default()
        }
    }

    fn identity(user: &str) -> Identity {
        Identity { user_id: user.to_string(), name: user.to_string() }
    }

    fn setup() -> (Arc<RoomRegistry>, DocStore, Arc<MemStore>) {
        let mem = Arc::new(MemStore::new());
        let store = DocStore::Mem(mem.clone());
        let registry = RoomRegistry::new(store.clone(), &fast_config());
        (registry, store, mem)
    }

    async fn recv(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a server message")
            .expect("channel closed")
    }

    /// Join and consume the init/awarenessState handshake, returning the
    /// command sender, the client-side engine and the outbound receiver.
    async fn join_client(
        registry: &Arc<RoomRegistry>,
        doc_id: Uuid,
        user: &str,
    ) -> (mpsc::Sender<RoomCmd>, Uuid, DocEngine, mpsc::Receiver<ServerMessage>) {
        let conn_id = Uuid::new_v4();
        let (out_tx, mut out_rx) = mpsc::channel(64);
        let tx = registry
            .join(doc_id, conn_id, &identity(user), &out_tx)
            .await
            .expect("join failed");

        let engine = match recv(&mut out_rx).await {
            ServerMessage::Init(init) => {
                DocEngine::from_snapshot(init.peer_id, &init.snapshot).expect("bad init snapshot")
            }
            other => panic!("expected init first, got {:?}", other),
        };
        match recv(&mut out_rx).await {
            ServerMessage::AwarenessState(_) => {}
            other => panic!("expected awarenessState second, got {:?}", other),
        }
        (tx, conn_id, engine, out_rx)
    }

    async fn send_insert(
        tx: &mpsc::Sender<RoomCmd>,
        conn_id: Uuid,
        engine: &mut DocEngine,
        index: usize,
        text: &str,
    ) {
        let update = engine.insert_local(index, text).encode().unwrap();
        tx.send(RoomCmd::Update { conn_id, update }).await.unwrap();
    }

    async fn wait_for_state(store: &DocStore, doc_id: Uuid) -> Vec<u8> {
        for _ in 0..200 {
            if let Some(bytes) = store.load_state(doc_id).await.unwrap() {
                return bytes;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("state was never persisted");
    }

    #[tokio::test(start_paused = true)]
    async fn edits_are_flushed_when_the_room_closes() {
        let (registry, store, _) = setup();
        let doc_id = Uuid::new_v4();
        store.create(doc_id, "notes", "alice").await.unwrap();

        let (tx, conn_id, mut engine, _out) = join_client(&registry, doc_id, "alice").await;
        send_insert(&tx, conn_id, &mut engine, 0, "Hello").await;
        tx.send(RoomCmd::Leave { conn_id }).await.unwrap();

        advance(Duration::from_secs(2)).await;
        let bytes = wait_for_state(&store, doc_id).await;
        let restored = DocEngine::from_snapshot(0, &bytes).unwrap();
        assert_eq!(restored.content(), "Hello");

        // The writer retired itself from the registry.
        for _ in 0..200 {
            if registry.room_count().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("room never retired");
    }

    #[tokio::test(start_paused = true)]
    async fn flush_upserts_when_no_record_exists() {
        let (registry, store, _) = setup();
        // No create() call: the store has never seen this document, and the
        // flush must still persist rather than silently affecting nothing.
        let doc_id = Uuid::new_v4();

        let (tx, conn_id, mut engine, _out) = join_client(&registry, doc_id, "alice").await;
        send_insert(&tx, conn_id, &mut engine, 0, "late").await;
        tx.send(RoomCmd::Leave { conn_id }).await.unwrap();

        advance(Duration::from_secs(2)).await;
        let bytes = wait_for_state(&store, doc_id).await;
        let restored = DocEngine::from_snapshot(0, &bytes).unwrap();
        assert_eq!(restored.content(), "late");
    }

    #[tokio::test(start_paused = true)]
    async fn persisted_state_seeds_a_new_room() {
        let (registry, store, _) = setup();
        let doc_id = Uuid::new_v4();
        store.create(doc_id, "notes", "alice").await.unwrap();

        let mut seed = DocEngine::new(1);
        seed.insert_local(0, "Hi");
        store
            .save_state(doc_id, &seed.snapshot().unwrap())
            .await
            .unwrap();

        let (_tx, _conn, engine, _out) = join_client(&registry, doc_id, "alice").await;
        assert_eq!(engine.content(), "Hi");
    }

    #[tokio::test(start_paused = true)]
    async fn updates_broadcast_to_others_but_not_the_sender() {
        let (registry, store, _) = setup();
        let doc_id = Uuid::new_v4();
        store.create(doc_id, "notes", "alice").await.unwrap();

        let (tx_a, conn_a, mut engine_a, mut out_a) = join_client(&registry, doc_id, "alice").await;
        let (_tx_b, _conn_b, mut engine_b, mut out_b) = join_client(&registry, doc_id, "bob").await;

        send_insert(&tx_a, conn_a, &mut engine_a, 0, "abc").await;

        match recv(&mut out_b).await {
            ServerMessage::Update(u) => {
                assert!(engine_b.apply_update(&u.update).unwrap());
                assert_eq!(engine_b.content(), "abc");
            }
            other => panic!("expected update, got {:?}", other),
        }
        // No echo back to the sender.
        assert!(out_a.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rejoin_during_grace_revives_unpersisted_state() {
        let (registry, store, mem) = setup();
        let doc_id = Uuid::new_v4();
        store.create(doc_id, "notes", "alice").await.unwrap();

        // Saves fail, so whatever the revived room serves cannot have come
        // from the store.
        mem.set_fail_saves(true);

        let (tx, conn_id, mut engine, _out) = join_client(&registry, doc_id, "alice").await;
        send_insert(&tx, conn_id, &mut engine, 0, "draft").await;
        tx.send(RoomCmd::Leave { conn_id }).await.unwrap();

        // Rejoin well inside the grace period.
        advance(Duration::from_millis(200)).await;
        let (_tx2, _conn2, engine2, _out2) = join_client(&registry, doc_id, "alice").await;
        assert_eq!(engine2.content(), "draft");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_flush_is_retried_until_it_succeeds() {
        let (registry, store, mem) = setup();
        let doc_id = Uuid::new_v4();
        store.create(doc_id, "notes", "alice").await.unwrap();

        let (tx, conn_id, mut engine, _out) = join_client(&registry, doc_id, "alice").await;

        mem.set_fail_saves(true);
        send_insert(&tx, conn_id, &mut engine, 0, "ab").await;
        advance(Duration::from_millis(200)).await;
        assert!(store.load_state(doc_id).await.unwrap().is_none());

        mem.set_fail_saves(false);
        send_insert(&tx, conn_id, &mut engine, 2, "c").await;
        advance(Duration::from_millis(200)).await;

        let bytes = wait_for_state(&store, doc_id).await;
        let restored = DocEngine::from_snapshot(0, &bytes).unwrap();
        assert_eq!(restored.content(), "abc");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_consumer_is_disconnected() {
        let (registry, store, _) = setup();
        let doc_id = Uuid::new_v4();
        store.create(doc_id, "notes", "alice").await.unwrap();

        let (tx_a, conn_a, mut engine_a, _out_a) = join_client(&registry, doc_id, "alice").await;

        // Bob's outbound queue only fits the handshake, which he never
        // drains.
        let conn_b = Uuid::new_v4();
        let (out_b, _out_b_rx) = mpsc::channel(2);
        registry
            .join(doc_id, conn_b, &identity("bob"), &out_b)
            .await
            .unwrap();

        send_insert(&tx_a, conn_a, &mut engine_a, 0, "x").await;

        for _ in 0..200 {
            if registry.stats().await.conns == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("slow consumer was never dropped");
    }

    #[tokio::test(start_paused = true)]
    async fn awareness_diffs_reach_peers_and_clear_on_leave() {
        let (registry, store, _) = setup();
        let doc_id = Uuid::new_v4();
        store.create(doc_id, "notes", "alice").await.unwrap();

        let (tx_a, conn_a, _engine_a, mut out_a) = join_client(&registry, doc_id, "alice").await;
        let (_tx_b, _conn_b, _engine_b, mut out_b) = join_client(&registry, doc_id, "bob").await;

        let payload = AwarenessPayload {
            user: "alice".into(),
            name: "Alice".into(),
            color: "#ff0000".into(),
            cursor: None,
        };
        tx_a.send(RoomCmd::Awareness { conn_id: conn_a, payload: Some(payload.clone()) })
            .await
            .unwrap();
        match recv(&mut out_b).await {
            ServerMessage::Awareness(diff) => {
                assert_eq!(diff.conn_id, conn_a);
                assert_eq!(diff.payload, Some(payload));
            }
            other => panic!("expected awareness diff, got {:?}", other),
        }

        tx_a.send(RoomCmd::Leave { conn_id: conn_a }).await.unwrap();
        match recv(&mut out_b).await {
            ServerMessage::Awareness(diff) => {
                assert_eq!(diff.conn_id, conn_a);
                assert!(diff.payload.is_none());
            }
            other => panic!("expected awareness removal, got {:?}", other),
        }
        assert!(out_a.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn sync_request_returns_the_missing_delta() {
        let (registry, store, _) = setup();
        let doc_id = Uuid::new_v4();
        store.create(doc_id, "notes", "alice").await.unwrap();

        let (tx_a, conn_a, mut engine_a, _out_a) = join_client(&registry, doc_id, "alice").await;
        send_insert(&tx_a, conn_a, &mut engine_a, 0, "abc").await;

        // Bob joins later and explicitly asks for everything past his
        // (stale) version.
        let (tx_b, conn_b, mut engine_b, mut out_b) = join_client(&registry, doc_id, "bob").await;
        let stale = engine_b.version();
        tx_b.send(RoomCmd::SyncRequest { conn_id: conn_b, version: stale })
            .await
            .unwrap();
        match recv(&mut out_b).await {
            ServerMessage::SyncDelta(delta) => {
                engine_b.apply_update(&delta.update).unwrap();
                assert_eq!(engine_b.content(), "abc");
            }
            other => panic!("expected syncDelta, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_update_drops_only_the_offender() {
        let (registry, store, _) = setup();
        let doc_id = Uuid::new_v4();
        store.create(doc_id, "notes", "alice").await.unwrap();

        let (tx_a, conn_a, _engine_a, _out_a) = join_client(&registry, doc_id, "alice").await;
        let (tx_b, conn_b, mut engine_b, mut out_b) = join_client(&registry, doc_id, "bob").await;

        tx_a.send(RoomCmd::Update { conn_id: conn_a, update: b"garbage".to_vec() })
            .await
            .unwrap();
        send_insert(&tx_b, conn_b, &mut engine_b, 0, "ok").await;

        for _ in 0..200 {
            if registry.stats().await.conns == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(registry.stats().await.conns, 1);
        assert!(out_b.try_recv().is_err());

        // Client message parsing treats the same class of garbage as an
        // error too.
        assert!(serde_json::from_str::<ClientMessage>("garbage").is_err());
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::Identity;
use crate::engine::DocEngine;
use crate::models::{
    AwarenessPayload, AwarenessStateMessage, InitMessage, ServerMessage, SyncDeltaMessage,
    UpdateMessage,
};
use crate::persist::DocStore;
use crate::room::awareness::AwarenessTracker;
use crate::room::registry::RoomRegistry;

/// Peer id the room engine stamps on ops it originates (none today, but the
/// snapshot format records it). Client peers are uuid-derived and never 0.
pub const SERVER_PEER: u64 = 0;

/// Commands a room writer accepts. The writer task is the only owner of the
/// room engine, so every mutation flows through this channel and is applied
/// in a single total order.
pub enum RoomCmd {
    Join {
        conn_id: Uuid,
        identity: Identity,
        out: mpsc::Sender<ServerMessage>,
        reply: oneshot::Sender<JoinResponse>,
    },
    Leave {
        conn_id: Uuid,
    },
    Update {
        conn_id: Uuid,
        update: Vec<u8>,
    },
    Awareness {
        conn_id: Uuid,
        payload: Option<AwarenessPayload>,
    },
    SyncRequest {
        conn_id: Uuid,
        version: HashMap<u64, u32>,
    },
    Stats {
        reply: oneshot::Sender<RoomStats>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinResponse {
    Ok,
    /// The room is tearing down; re-resolve through the registry.
    Retry,
}

#[derive(Debug, Clone, Copy)]
pub struct RoomStats {
    pub conns: u32,
    pub dirty: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct RoomTiming {
    pub flush_debounce: Duration,
    pub grace: Duration,
    pub load_timeout: Duration,
}

struct Conn {
    out: mpsc::Sender<ServerMessage>,
    user: String,
}

/// Single-writer task for one document room. Owns the engine, the awareness
/// tracker and the connection set; persists snapshots on a debounce while
/// dirty and tears the room down after a grace period with no connections.
pub(crate) struct RoomWriter {
    doc_id: Uuid,
    epoch: u64,
    store: DocStore,
    registry: Arc<RoomRegistry>,
    timing: RoomTiming,
    engine: DocEngine,
    awareness: AwarenessTracker,
    conns: HashMap<Uuid, Conn>,
    dirty: bool,
    last_flush: Instant,
    grace_deadline: Option<Instant>,
    had_conn: bool,
}

impl RoomWriter {
    pub(crate) fn new(
        doc_id: Uuid,
        epoch: u64,
        store: DocStore,
        registry: Arc<RoomRegistry>,
        timing: RoomTiming,
    ) -> Self {
        Self {
            doc_id,
            epoch,
            store,
            registry,
            timing,
            engine: DocEngine::new(SERVER_PEER),
            awareness: AwarenessTracker::new(),
            conns: HashMap::new(),
            dirty: false,
            last_flush: Instant::now(),
            grace_deadline: None,
            had_conn: false,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<RoomCmd>) {
        self.load().await;

        loop {
            let flush_at = if self.dirty {
                Some(self.last_flush + self.timing.flush_debounce)
            } else {
                None
            };
            let grace_at = self.grace_deadline;

            tokio::select! {
                biased;

                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    // Registry dropped every sender; nothing can reach us.
                    None => break,
                },
                _ = tokio::time::sleep_until(flush_at.unwrap_or_else(Instant::now)),
                        if flush_at.is_some() => {
                    self.flush().await;
                },
                _ = tokio::time::sleep_until(grace_at.unwrap_or_else(Instant::now)),
                        if grace_at.is_some() => {
                    if self.conns.is_empty() {
                        debug!("Room {} grace period expired, closing", self.doc_id);
                        break;
                    }
                    self.grace_deadline = None;
                },
            }

            if self.had_conn && self.conns.is_empty() && self.grace_deadline.is_none() {
                self.begin_closing().await;
            }
        }

        self.teardown(rx).await;
    }

    /// Loading phase. Any failure leaves an empty engine and a clean dirty
    /// flag so an idle room cannot overwrite good persisted state with
    /// nothing.
    async fn load(&mut self) {
        let loaded =
            tokio::time::timeout(self.timing.load_timeout, self.store.load_state(self.doc_id))
                .await;
        self.engine = match loaded {
            Ok(Ok(Some(bytes))) => match DocEngine::from_snapshot(SERVER_PEER, &bytes) {
                Ok(engine) => {
                    info!(
                        "Room {} loaded persisted state ({} chars)",
                        self.doc_id,
                        engine.len()
                    );
                    engine
                }
                Err(e) => {
                    error!(
                        "Room {} has an undecodable snapshot, starting empty: {}",
                        self.doc_id, e
                    );
                    DocEngine::new(SERVER_PEER)
                }
            },
            Ok(Ok(None)) => {
                debug!("Room {} has no persisted state yet", self.doc_id);
                DocEngine::new(SERVER_PEER)
            }
            Ok(Err(e)) => {
                error!(
                    "Room {} failed to load persisted state, starting empty: {}",
                    self.doc_id, e
                );
                DocEngine::new(SERVER_PEER)
            }
            Err(_) => {
                error!(
                    "Room {} state load timed out after {:?}, starting empty",
                    self.doc_id, self.timing.load_timeout
                );
                DocEngine::new(SERVER_PEER)
            }
        };
        self.dirty = false;
        self.last_flush = Instant::now();
    }

    async fn handle(&mut self, cmd: RoomCmd) {
        match cmd {
            RoomCmd::Join { conn_id, identity, out, reply } => {
                self.join(conn_id, identity, out);
                let _ = reply.send(JoinResponse::Ok);
            }
            RoomCmd::Leave { conn_id } => {
                if let Some(conn) = self.conns.remove(&conn_id) {
                    info!(
                        "Connection {} ({}) left room {} ({} still connected)",
                        conn_id,
                        conn.user,
                        self.doc_id,
                        self.conns.len()
                    );
                    if let Some(diff) = self.awareness.remove(conn_id) {
                        self.broadcast_except(conn_id, ServerMessage::Awareness(diff));
                    }
                }
            }
            // Commands from a connection the room already dropped are
            // ignored; the channel may still carry a few.
            RoomCmd::Update { conn_id, .. } if !self.conns.contains_key(&conn_id) => {
                debug!(
                    "Room {} ignoring update from dropped connection {}",
                    self.doc_id, conn_id
                );
            }
            RoomCmd::Awareness { conn_id, .. } if !self.conns.contains_key(&conn_id) => {}
            RoomCmd::Update { conn_id, update } => match self.engine.apply_update(&update) {
                Ok(true) => {
                    self.dirty = true;
                    self.broadcast_except(conn_id, ServerMessage::Update(UpdateMessage { update }));
                }
                Ok(false) => {
                    debug!("Room {} ignored a no-op update from {}", self.doc_id, conn_id);
                }
                Err(e) => {
                    warn!(
                        "Room {} dropping connection {} over undecodable update: {}",
                        self.doc_id, conn_id, e
                    );
                    self.drop_conn(conn_id);
                }
            },
            RoomCmd::Awareness { conn_id, payload } => {
                let diff = match payload {
                    Some(payload) => Some(self.awareness.set_local(conn_id, payload)),
                    None => self.awareness.remove(conn_id),
                };
                if let Some(diff) = diff {
                    self.broadcast_except(conn_id, ServerMessage::Awareness(diff));
                }
            }
            RoomCmd::SyncRequest { conn_id, version } => {
                let delta = self.engine.delta_since(&version);
                match delta.encode() {
                    Ok(update) => {
                        if let Some(conn) = self.conns.get(&conn_id) {
                            if Self::deliver(
                                conn_id,
                                conn,
                                ServerMessage::SyncDelta(SyncDeltaMessage { update }),
                            )
                            .is_err()
                            {
                                self.drop_conn(conn_id);
                            }
                        }
                    }
                    Err(e) => error!("Room {} failed to encode sync delta: {}", self.doc_id, e),
                }
            }
            RoomCmd::Stats { reply } => {
                let _ = reply.send(RoomStats {
                    conns: self.conns.len() as u32,
                    dirty: self.dirty,
                });
            }
        }
    }

    fn join(&mut self, conn_id: Uuid, identity: Identity, out: mpsc::Sender<ServerMessage>) {
        // A join during the grace period revives the room without a reload.
        self.grace_deadline = None;
        self.had_conn = true;

        let snapshot = match self.engine.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                // Snapshot encoding only fails on a broken engine; refuse the
                // join rather than hand out garbage.
                error!("Room {} failed to encode join snapshot: {}", self.doc_id, e);
                return;
            }
        };
        let init = ServerMessage::Init(InitMessage {
            peer_id: peer_id_for(conn_id),
            snapshot,
            version: self.engine.version(),
        });
        let state = ServerMessage::AwarenessState(AwarenessStateMessage {
            entries: self.awareness.snapshot_all(),
        });

        // Handshake goes straight into the outbound queue here, before any
        // later broadcast can be enqueued, so the client always sees init
        // first.
        if out.try_send(init).is_err() || out.try_send(state).is_err() {
            warn!(
                "Connection {} went away before the join handshake for room {}",
                conn_id, self.doc_id
            );
            return;
        }

        self.conns.insert(
            conn_id,
            Conn {
                out,
                user: identity.user_id.clone(),
            },
        );
        info!(
            "Connection {} ({}) joined room {} ({} connected)",
            conn_id,
            identity.user_id,
            self.doc_id,
            self.conns.len()
        );
    }

    fn deliver(conn_id: Uuid, conn: &Conn, msg: ServerMessage) -> Result<(), ()> {
        match conn.out.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Outbound queue full for connection {} ({}), disconnecting slow consumer",
                    conn_id, conn.user
                );
                Err(())
            }
            Err(TrySendError::Closed(_)) => Err(()),
        }
    }

    fn broadcast_except(&mut self, sender: Uuid, msg: ServerMessage) {
        let mut dead = Vec::new();
        for (conn_id, conn) in &self.conns {
            if *conn_id == sender {
                continue;
            }
            if Self::deliver(*conn_id, conn, msg.clone()).is_err() {
                dead.push(*conn_id);
            }
        }
        for conn_id in dead {
            self.drop_conn(conn_id);
        }
    }

    fn drop_conn(&mut self, conn_id: Uuid) {
        if self.conns.remove(&conn_id).is_some() {
            if let Some(diff) = self.awareness.remove(conn_id) {
                self.broadcast_except(conn_id, ServerMessage::Awareness(diff));
            }
        }
    }

    /// Last connection gone: flush now and start the grace timer.
    async fn begin_closing(&mut self) {
        self.flush().await;
        self.grace_deadline = Some(Instant::now() + self.timing.grace);
        debug!(
            "Room {} is empty, closing in {:?} unless rejoined",
            self.doc_id, self.timing.grace
        );
    }

    /// Persist the current snapshot. On failure the dirty flag stays set so
    /// the next debounce tick or the teardown retries.
    async fn flush(&mut self) {
        if !self.dirty {
            return;
        }
        let snapshot = match self.engine.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("Room {} failed to encode snapshot: {}", self.doc_id, e);
                self.last_flush = Instant::now();
                return;
            }
        };
        match self.store.save_state(self.doc_id, &snapshot).await {
            Ok(()) => {
                self.dirty = false;
                debug!(
                    "Room {} flushed snapshot ({} bytes)",
                    self.doc_id,
                    snapshot.len()
                );
            }
            Err(e) => {
                error!("Room {} failed to persist snapshot: {}", self.doc_id, e);
            }
        }
        self.last_flush = Instant::now();
    }

    /// Final flush, then remove this epoch from the registry and bounce any
    /// late joins back for a retry against the successor room.
    async fn teardown(mut self, mut rx: mpsc::Receiver<RoomCmd>) {
        self.flush().await;
        if self.dirty {
            error!(
                "Room {} closed with an unflushed snapshot, recent edits were lost",
                self.doc_id
            );
        }
        self.registry.retire(self.doc_id, self.epoch).await;

        rx.close();
        while let Some(cmd) = rx.recv().await {
            if let RoomCmd::Join { reply, .. } = cmd {
                let _ = reply.send(JoinResponse::Retry);
            }
        }
        info!("Room {} closed", self.doc_id);
    }
}

/// Stable per-connection peer id for engine ops, derived from the random
/// connection uuid.
pub fn peer_id_for(conn_id: Uuid) -> u64 {
    conn_id.as_u64_pair().0
}

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Identity of a single operation: issuing peer plus a Lamport counter.
///
/// The counter is bumped past every remote operation applied, so for any two
/// operations where one causally follows the other, the later one carries the
/// larger `seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub peer: u64,
    pub seq: u32,
}

/// One element of the replicated sequence.
///
/// `origin` is the id of the element immediately to the left when the insert
/// was made (`None` for document start). Deleted elements stay behind as
/// tombstones carrying the id of the delete, so they keep anchoring later
/// inserts and deltas can replay the delete for peers that missed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Item {
    id: OpId,
    origin: Option<OpId>,
    ch: char,
    deleted_by: Option<OpId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Op {
    Insert { id: OpId, origin: Option<OpId>, ch: char },
    Delete { id: OpId, target: OpId },
}

/// A batch of operations produced by one local edit. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Update {
    pub ops: Vec<Op>,
}

impl Update {
    pub fn encode(&self) -> Result<Vec<u8>, EngineError> {
        serde_cbor::to_vec(self).map_err(EngineError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Update, EngineError> {
        serde_cbor::from_slice(bytes).map_err(EngineError::Decode)
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRepr {
    items: Vec<Item>,
    pending_inserts: Vec<(OpId, Option<OpId>, char)>,
    pending_deletes: Vec<(OpId, OpId)>,
}

#[derive(Debug)]
pub enum EngineError {
    Encode(serde_cbor::Error),
    Decode(serde_cbor::Error),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Encode(e) => write!(f, "Failed to encode engine state: {}", e),
            EngineError::Decode(e) => write!(f, "Failed to decode engine payload: {}", e),
        }
    }
}

impl std::error::Error for EngineError {}

/// Replicated document engine: an RGA-style list CRDT over characters.
///
/// Merges are commutative and idempotent; any permutation of the same update
/// set converges to the same content. Concurrent inserts at the same spot are
/// ordered deterministically: siblings under the same origin sort by
/// descending `seq`, ties by ascending `peer`, so each peer's run stays
/// contiguous and every replica sequences them identically. There is no
/// conflict error kind anywhere in here.
#[derive(Debug, Clone)]
pub struct DocEngine {
    peer: u64,
    next_seq: u32,
    /// Materialized document order.
    items: Vec<Item>,
    /// Every op id ever applied, inserts and deletes alike.
    seen: HashSet<OpId>,
    /// Highest seq applied per peer.
    version: HashMap<u64, u32>,
    /// Inserts whose origin has not arrived yet: `(id, origin, ch)`.
    pending_inserts: Vec<(OpId, Option<OpId>, char)>,
    /// Deletes whose target has not arrived yet: `(delete id, target)`.
    pending_deletes: Vec<(OpId, OpId)>,
}

impl DocEngine {
    pub fn new(peer: u64) -> Self {
        Self {
            peer,
            next_seq: 0,
            items: Vec::new(),
            seen: HashSet::new(),
            version: HashMap::new(),
            pending_inserts: Vec::new(),
            pending_deletes: Vec::new(),
        }
    }

    /// Rebuild an engine from a snapshot. The Lamport counter resumes past
    /// every operation in the snapshot, so fresh local ops never collide.
    pub fn from_snapshot(peer: u64, bytes: &[u8]) -> Result<Self, EngineError> {
        let repr: SnapshotRepr = serde_cbor::from_slice(bytes).map_err(EngineError::Decode)?;
        let mut engine = Self::new(peer);
        for item in &repr.items {
            engine.record(item.id);
            if let Some(d) = item.deleted_by {
                engine.record(d);
            }
        }
        for (id, _, _) in &repr.pending_inserts {
            engine.record(*id);
        }
        for (id, _) in &repr.pending_deletes {
            engine.record(*id);
        }
        engine.items = repr.items;
        engine.pending_inserts = repr.pending_inserts;
        engine.pending_deletes = repr.pending_deletes;
        Ok(engine)
    }

    /// Full state encoding. `from_snapshot(snapshot())` is content-identical.
    pub fn snapshot(&self) -> Result<Vec<u8>, EngineError> {
        let repr = SnapshotRepr {
            items: self.items.clone(),
            pending_inserts: self.pending_inserts.clone(),
            pending_deletes: self.pending_deletes.clone(),
        };
        serde_cbor::to_vec(&repr).map_err(EngineError::Encode)
    }

    pub fn peer(&self) -> u64 {
        self.peer
    }

    /// Highest seq applied per peer; the compact state summary clients send
    /// in a sync request. Valid as a summary because every connection emits
    /// its operations in order over a single stream.
    pub fn version(&self) -> HashMap<u64, u32> {
        self.version.clone()
    }

    /// Visible text.
    pub fn content(&self) -> String {
        self.items
            .iter()
            .filter(|it| it.deleted_by.is_none())
            .map(|it| it.ch)
            .collect()
    }

    /// Visible length in characters.
    pub fn len(&self) -> usize {
        self.items.iter().filter(|it| it.deleted_by.is_none()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert `text` at visible character `index` (clamped), returning the
    /// update to broadcast. Never fails on well-formed input.
    pub fn insert_local(&mut self, index: usize, text: &str) -> Update {
        let index = index.min(self.len());
        let mut origin = if index == 0 {
            None
        } else {
            self.visible_item(index - 1).map(|i| self.items[i].id)
        };

        let mut ops = Vec::new();
        for ch in text.chars() {
            let id = self.alloc_id();
            // Always integrable: the origin is locally present.
            self.integrate_insert(id, origin, ch);
            ops.push(Op::Insert { id, origin, ch });
            origin = Some(id);
        }
        Update { ops }
    }

    /// Tombstone up to `len` visible characters starting at `index`.
    pub fn delete_local(&mut self, index: usize, len: usize) -> Update {
        let mut ops = Vec::new();
        for _ in 0..len {
            // Each tombstone shifts the next victim into the same index.
            let Some(i) = self.visible_item(index) else { break };
            let id = self.alloc_id();
            let target = self.items[i].id;
            self.items[i].deleted_by = Some(id);
            ops.push(Op::Delete { id, target });
        }
        Update { ops }
    }

    /// Merge a remote update blob. Idempotent; returns whether anything new
    /// was applied.
    pub fn apply_update(&mut self, bytes: &[u8]) -> Result<bool, EngineError> {
        let update = Update::decode(bytes)?;
        Ok(self.apply(update))
    }

    /// Merge an already-decoded update.
    pub fn apply(&mut self, update: Update) -> bool {
        let mut applied = false;
        for op in update.ops {
            match op {
                Op::Insert { id, origin, ch } => {
                    if self.seen.contains(&id) {
                        continue;
                    }
                    self.record(id);
                    if self.integrate_insert(id, origin, ch) {
                        self.settle_pending(id);
                    } else {
                        self.pending_inserts.push((id, origin, ch));
                    }
                    applied = true;
                }
                Op::Delete { id, target } => {
                    if self.seen.contains(&id) {
                        continue;
                    }
                    self.record(id);
                    if !self.tombstone(target, id) && self.awaits_insert(target) {
                        self.pending_deletes.push((id, target));
                    }
                    applied = true;
                }
            }
        }
        applied
    }

    /// Everything the given version vector has not covered, regenerated from
    /// the item sequence; the minimal delta for a sync request.
    pub fn delta_since(&self, remote: &HashMap<u64, u32>) -> Update {
        let missing = |id: &OpId| remote.get(&id.peer).map_or(true, |&s| id.seq > s);
        let mut ops = Vec::new();
        for item in &self.items {
            if missing(&item.id) {
                ops.push(Op::Insert {
                    id: item.id,
                    origin: item.origin,
                    ch: item.ch,
                });
            }
            if let Some(d) = item.deleted_by {
                if missing(&d) {
                    ops.push(Op::Delete { id: d, target: item.id });
                }
            }
        }
        for (id, origin, ch) in &self.pending_inserts {
            if missing(id) {
                ops.push(Op::Insert { id: *id, origin: *origin, ch: *ch });
            }
        }
        for (id, target) in &self.pending_deletes {
            if missing(id) {
                ops.push(Op::Delete { id: *id, target: *target });
            }
        }
        Update { ops }
    }

    /// Drop tombstones. Shrinks the representation; observable content is
    /// unchanged. Dropped tombstones can no longer anchor late inserts or be
    /// replayed in deltas, so this is only safe once every replica of
    /// interest has caught up past them.
    pub fn compact(&mut self) {
        self.items.retain(|it| it.deleted_by.is_none());
    }

    fn alloc_id(&mut self) -> OpId {
        let id = OpId { peer: self.peer, seq: self.next_seq };
        self.record(id);
        id
    }

    fn record(&mut self, id: OpId) {
        self.seen.insert(id);
        if id.seq >= self.next_seq {
            self.next_seq = id.seq + 1;
        }
        let entry = self.version.entry(id.peer).or_insert(id.seq);
        if id.seq > *entry {
            *entry = id.seq;
        }
    }

    /// True if `a` sorts before `b` among siblings sharing one origin:
    /// descending seq, ties broken by ascending peer.
    fn sibling_precedes(a: OpId, b: OpId) -> bool {
        a.seq > b.seq || (a.seq == b.seq && a.peer < b.peer)
    }

    /// RGA integration scan. Returns false when the origin is not present
    /// yet (caller parks the insert).
    fn integrate_insert(&mut self, id: OpId, origin: Option<OpId>, ch: char) -> bool {
        let parent: isize = match origin {
            None => -1,
            Some(o) => match self.index_of(o) {
                Some(i) => i as isize,
                None => return false,
            },
        };

        let mut at = (parent + 1) as usize;
        while at < self.items.len() {
            let y = &self.items[at];
            let y_parent: isize = y
                .origin
                .and_then(|o| self.index_of(o))
                .map(|i| i as isize)
                .unwrap_or(-1);
            if y_parent < parent {
                break;
            }
            if y_parent == parent && Self::sibling_precedes(id, y.id) {
                break;
            }
            at += 1;
        }
        self.items.insert(at, Item { id, origin, ch, deleted_by: None });
        true
    }

    /// Retry parked operations after `id` became available; integrating one
    /// insert can unblock others, so loop to a fixpoint.
    fn settle_pending(&mut self, id: OpId) {
        if let Some(i) = self.pending_deletes.iter().position(|(_, t)| *t == id) {
            let (did, target) = self.pending_deletes.remove(i);
            self.tombstone(target, did);
        }
        loop {
            let Some(i) = self
                .pending_inserts
                .iter()
                .position(|(_, origin, _)| origin.map_or(true, |o| self.index_of(o).is_some()))
            else {
                return;
            };
            let (pid, origin, ch) = self.pending_inserts.remove(i);
            self.integrate_insert(pid, origin, ch);
            if let Some(j) = self.pending_deletes.iter().position(|(_, t)| *t == pid) {
                let (did, target) = self.pending_deletes.remove(j);
                self.tombstone(target, did);
            }
        }
    }

    fn tombstone(&mut self, target: OpId, by: OpId) -> bool {
        match self.items.iter_mut().find(|it| it.id == target) {
            Some(item) => {
                if item.deleted_by.is_none() {
                    item.deleted_by = Some(by);
                }
                true
            }
            None => false,
        }
    }

    /// A delete target that is neither integrated nor compacted away: either
    /// never seen, or sitting in the pending insert queue.
    fn awaits_insert(&self, target: OpId) -> bool {
        !self.seen.contains(&target)
            || self.pending_inserts.iter().any(|(id, _, _)| *id == target)
    }

    fn index_of(&self, id: OpId) -> Option<usize> {
        self.items.iter().position(|it| it.id == id)
    }

    /// Item index of the nth visible character.
    fn visible_item(&self, n: usize) -> Option<usize> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, it)| it.deleted_by.is_none())
            .map(|(i, _)| i)
            .nth(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(a: &mut DocEngine, b: &mut DocEngine, update: &Update) {
        a.apply(update.clone());
        b.apply(update.clone());
    }

    #[test]
    fn concurrent_inserts_at_same_position_converge() {
        let mut a = DocEngine::new(1);
        let mut b = DocEngine::new(2);

        let ua = a.insert_local(0, "Hello");
        let ub = b.insert_local(0, "World");
        a.apply(ub.clone());
        b.apply(ua.clone());

        assert_eq!(a.content(), b.content());
        // Equal Lamport seqs, so the lower peer's run sorts first.
        assert_eq!(a.content(), "HelloWorld");

        // Stable under repeated merge.
        a.apply(ub);
        b.apply(ua);
        assert_eq!(a.content(), "HelloWorld");
        assert_eq!(b.content(), "HelloWorld");
    }

    #[test]
    fn convergence_under_permuted_delivery() {
        let mut a = DocEngine::new(1);
        let mut b = DocEngine::new(2);
        let mut c = DocEngine::new(3);

        let u1 = a.insert_local(0, "abc");
        let u2 = b.insert_local(0, "xyz");
        let u3 = c.insert_local(0, "123");

        // Deliver the same set in three different orders.
        for u in [&u2, &u3] {
            a.apply((*u).clone());
        }
        for u in [&u3, &u1] {
            b.apply((*u).clone());
        }
        for u in [&u1, &u2] {
            c.apply((*u).clone());
        }

        assert_eq!(a.content(), b.content());
        assert_eq!(b.content(), c.content());
        assert_eq!(a.content(), "abcxyz123");
    }

    #[test]
    fn apply_update_is_idempotent() {
        let mut a = DocEngine::new(1);
        let mut b = DocEngine::new(2);

        let u = a.insert_local(0, "hi").encode().unwrap();
        assert!(b.apply_update(&u).unwrap());
        assert!(!b.apply_update(&u).unwrap());
        assert_eq!(b.content(), "hi");
    }

    #[test]
    fn interleaved_edits_converge() {
        let mut a = DocEngine::new(1);
        let mut b = DocEngine::new(2);

        let u1 = a.insert_local(0, "shared");
        b.apply(u1.clone());

        // Concurrent: a deletes "sha", b appends "!".
        let u2 = a.delete_local(0, 3);
        let u3 = b.insert_local(6, "!");
        exchange(&mut a, &mut b, &u2);
        exchange(&mut a, &mut b, &u3);

        assert_eq!(a.content(), b.content());
        assert_eq!(a.content(), "red!");
    }

    #[test]
    fn insert_into_concurrently_deleted_region_keeps_anchor() {
        let mut a = DocEngine::new(1);
        let mut b = DocEngine::new(2);

        let u1 = a.insert_local(0, "abc");
        b.apply(u1);

        // a deletes "b" while b inserts after it; the tombstone still
        // anchors b's insert.
        let u2 = a.delete_local(1, 1);
        let u3 = b.insert_local(2, "X");
        exchange(&mut a, &mut b, &u2);
        exchange(&mut a, &mut b, &u3);

        assert_eq!(a.content(), b.content());
        assert_eq!(a.content(), "aXc");
    }

    #[test]
    fn out_of_order_insert_delivery() {
        let mut a = DocEngine::new(1);
        let mut b = DocEngine::new(2);

        let u1 = a.insert_local(0, "a");
        let u2 = a.insert_local(1, "b");

        // Later update reaches b first; it parks until the anchor arrives.
        b.apply(u2);
        assert_eq!(b.content(), "");
        b.apply(u1);
        assert_eq!(b.content(), "ab");
        assert_eq!(a.content(), b.content());
    }

    #[test]
    fn delete_before_insert_arrives() {
        let mut a = DocEngine::new(1);
        let mut b = DocEngine::new(2);

        let ins = a.insert_local(0, "x");
        let del = a.delete_local(0, 1);

        // Delete reaches b first.
        b.apply(del);
        assert_eq!(b.content(), "");
        b.apply(ins);
        assert_eq!(b.content(), "");
        assert_eq!(a.content(), b.content());
    }

    #[test]
    fn snapshot_round_trip() {
        let mut a = DocEngine::new(1);
        a.insert_local(0, "hello world");
        a.delete_local(5, 6);
        a.insert_local(5, "!");

        let snap = a.snapshot().unwrap();
        let b = DocEngine::from_snapshot(2, &snap).unwrap();
        assert_eq!(b.content(), a.content());
        assert_eq!(b.version(), a.version());
    }

    #[test]
    fn restored_engine_resumes_own_counter() {
        let mut a = DocEngine::new(1);
        a.insert_local(0, "abc");
        let snap = a.snapshot().unwrap();

        let mut again = DocEngine::from_snapshot(1, &snap).unwrap();
        let u = again.insert_local(3, "d");
        // Fresh ops must not collide with ids already in the snapshot.
        let mut other = DocEngine::from_snapshot(9, &snap).unwrap();
        assert!(other.apply(u));
        assert_eq!(other.content(), "abcd");
    }

    #[test]
    fn delta_since_covers_missing_ops() {
        let mut a = DocEngine::new(1);
        let mut b = DocEngine::new(2);

        let u1 = a.insert_local(0, "abc");
        b.apply(u1);
        let vv = b.version();

        a.insert_local(3, "def");
        a.delete_local(0, 1);

        let delta = a.delta_since(&vv);
        b.apply(delta);
        assert_eq!(b.content(), a.content());
        assert_eq!(b.content(), "bcdef");
    }

    #[test]
    fn compaction_preserves_content() {
        let mut a = DocEngine::new(1);
        a.insert_local(0, "abcdef");
        a.delete_local(1, 3);
        let before = a.content();

        a.compact();
        assert_eq!(a.content(), before);
        assert_eq!(a.content(), "aef");

        // Editing continues to work around the compacted region.
        a.insert_local(1, "Z");
        assert_eq!(a.content(), "aZef");
    }
}

//! # Persistent Record Store
//!
//! The record cache every node serves lookups from. Three record families,
//! each in its own LRU, plus the refresh slots that make announce renewal
//! cheap:
//!
//! | Cache | Key | Holds |
//! |-------|-----|-------|
//! | announces | target, then public key | signed peer records |
//! | mutable | `hash(publicKey)` | versioned signed blobs |
//! | immutable | `hash(value)` | content-addressed blobs |
//! | refreshes | `hash(token)` | re-installable announce snapshots |
//!
//! Records expire by LRU (`max_size` targets per cache) and by `max_age`.
//! Every handler verifies before it stores and **drops silently** on any
//! validation failure; the only typed wire errors are the mutable sequence
//! conflicts, which writers need to see to make progress.

use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::crypto::{self, NS_ANNOUNCE, NS_UNANNOUNCE};
use crate::identity::{Identity, Target};
use crate::messages::{
    decode_bounded, encode, target_for_key, Announce, ErrorCode, MutableGet, MutablePut,
    MutableRecord, MutableSignable, NodeAddr, PeerRecord, MAX_STORED_VALUE,
};
use crate::router::{Router, RouterEntry};
use crate::rpc::ReplyBody;

/// Records returned per lookup reply.
pub const MAX_LOOKUP_RECORDS: usize = 20;

/// Announce records kept per target slot.
const MAX_RECORDS_PER_TARGET: usize = 32;

/// Store tuning. Defaults match a 30-minute record TTL with servers
/// refreshing at 25 minutes.
#[derive(Clone, Copy, Debug)]
pub struct StoreConfig {
    /// Target slots per cache before LRU eviction.
    pub max_size: usize,
    /// Age beyond which a record is no longer served.
    pub max_age: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_size: 65_536,
            max_age: Duration::from_secs(30 * 60),
        }
    }
}

struct StoredRecord {
    record: PeerRecord,
    stored_at: Instant,
}

struct StoredMutable {
    record: MutableRecord,
    stored_at: Instant,
}

struct StoredImmutable {
    value: Vec<u8>,
    stored_at: Instant,
}

/// Snapshot needed to re-install an announce from a refresh token alone.
struct RefreshSlot {
    target: Target,
    public_key: [u8; 32],
    record: PeerRecord,
    announce_self: bool,
}

/// The per-node record store. All mutation runs on the owning node's task.
pub struct Store {
    announces: LruCache<Target, Vec<([u8; 32], StoredRecord)>>,
    mutable: LruCache<Target, StoredMutable>,
    immutable: LruCache<Target, StoredImmutable>,
    refreshes: LruCache<[u8; 32], RefreshSlot>,
    config: StoreConfig,
}

impl Store {
    pub fn new(config: StoreConfig) -> Self {
        let cap = NonZeroUsize::new(config.max_size.max(1)).unwrap();
        Self {
            announces: LruCache::new(cap),
            mutable: LruCache::new(cap),
            immutable: LruCache::new(cap),
            refreshes: LruCache::new(cap),
            config,
        }
    }

    // ========================================================================
    // Announce records
    // ========================================================================

    /// Up to [`MAX_LOOKUP_RECORDS`] records for `target`, the local router
    /// entry appended when room remains. `None` encodes an empty reply.
    pub fn lookup(&mut self, target: &Target, router: &Router) -> Option<Vec<u8>> {
        let max_age = self.config.max_age;
        let mut records: Vec<PeerRecord> = Vec::new();
        if let Some(slot) = self.announces.get_mut(target) {
            slot.retain(|(_, stored)| stored.stored_at.elapsed() <= max_age);
            records.extend(
                slot.iter()
                    .take(MAX_LOOKUP_RECORDS)
                    .map(|(_, stored)| stored.record.clone()),
            );
        }
        if records.len() < MAX_LOOKUP_RECORDS {
            if let Some(entry) = router.get(target) {
                if let Ok(record) = decode_bounded::<PeerRecord>(&entry.record) {
                    records.push(record);
                }
            }
        }
        if records.is_empty() {
            return None;
        }
        encode(&records).ok()
    }

    /// The router entry's record, or `None`. Lookup is fan-out-and-collect;
    /// findPeer is the single targeted fetch.
    pub fn find_peer(&self, target: &Target, router: &Router) -> Option<Vec<u8>> {
        router.get(target).map(|entry| entry.record.clone())
    }

    /// Handle a signed announce (or a refresh-only renewal).
    #[allow(clippy::too_many_arguments)]
    pub fn announce(
        &mut self,
        node_id: &[u8; 32],
        from: NodeAddr,
        target: &Target,
        token: Option<&[u8; 32]>,
        token_ok: bool,
        value: Option<&[u8]>,
        router: &mut Router,
    ) -> Option<ReplyBody> {
        let announce: Announce = decode_bounded(value?).ok()?;

        if announce.is_refresh_only() {
            return self.refresh(&announce.refresh?, from, router);
        }

        let peer = announce.peer?;
        let signature = announce.signature?;
        let token = token?;
        if !token_ok {
            debug!(target = %hex::encode(&target[..8]), "announce dropped: stale token");
            return None;
        }

        let identity = Identity::from_bytes(peer.public_key);
        if !identity.is_valid() {
            debug!(target = %hex::encode(&target[..8]), "announce dropped: invalid identity");
            return None;
        }
        let peer_bytes = encode(&peer).ok()?;
        let refresh = announce.refresh.as_ref();
        if !crypto::verify_announce(
            &identity,
            NS_ANNOUNCE,
            target,
            node_id,
            token,
            &peer_bytes,
            refresh,
            &signature,
        ) {
            debug!(
                target = %hex::encode(&target[..8]),
                peer = %hex::encode(&peer.public_key[..8]),
                "announce dropped: signature verification failed"
            );
            return None;
        }

        let record = peer.truncated();
        let announce_self = target_for_key(&peer.public_key) == *target;
        if announce_self {
            router.install(
                *target,
                RouterEntry {
                    relay: Some(from),
                    record: encode(&record).ok()?,
                    actions: None,
                },
            );
            // A self-announce supersedes any cached copy of the same record.
            if let Some(slot) = self.announces.get_mut(target) {
                slot.retain(|(pk, _)| *pk != peer.public_key);
            }
            trace!(target = %hex::encode(&target[..8]), "announce: router entry installed");
        } else {
            self.insert_announce(target, record.clone());
        }

        if let Some(refresh) = announce.refresh {
            self.refreshes.put(
                refresh,
                RefreshSlot {
                    target: *target,
                    public_key: peer.public_key,
                    record,
                    announce_self,
                },
            );
        }

        Some(ReplyBody::empty())
    }

    fn insert_announce(&mut self, target: &Target, record: PeerRecord) {
        let public_key = record.public_key;
        let stored = StoredRecord {
            record,
            stored_at: Instant::now(),
        };
        match self.announces.get_mut(target) {
            Some(slot) => {
                slot.retain(|(pk, _)| *pk != public_key);
                slot.push((public_key, stored));
                if slot.len() > MAX_RECORDS_PER_TARGET {
                    slot.remove(0);
                }
            }
            None => {
                self.announces.put(*target, vec![(public_key, stored)]);
            }
        }
    }

    /// Handle a signed unannounce: same signable under the unannounce
    /// namespace; clears the router entry and the cached tuple.
    #[allow(clippy::too_many_arguments)]
    pub fn unannounce(
        &mut self,
        node_id: &[u8; 32],
        target: &Target,
        token: Option<&[u8; 32]>,
        token_ok: bool,
        value: Option<&[u8]>,
        router: &mut Router,
    ) -> Option<ReplyBody> {
        let announce: Announce = decode_bounded(value?).ok()?;
        let peer = announce.peer?;
        let signature = announce.signature?;
        let token = token?;
        if !token_ok {
            return None;
        }

        let identity = Identity::from_bytes(peer.public_key);
        let peer_bytes = encode(&peer).ok()?;
        if !crypto::verify_announce(
            &identity,
            NS_UNANNOUNCE,
            target,
            node_id,
            token,
            &peer_bytes,
            announce.refresh.as_ref(),
            &signature,
        ) {
            debug!(
                target = %hex::encode(&target[..8]),
                "unannounce dropped: signature verification failed"
            );
            return None;
        }

        if target_for_key(&peer.public_key) == *target {
            router.remove(target);
        }
        if let Some(slot) = self.announces.get_mut(target) {
            slot.retain(|(pk, _)| *pk != peer.public_key);
        }
        Some(ReplyBody::empty())
    }

    /// Re-install a stored record from a revealed chain token. The slot is
    /// single-use: it is consumed here and re-bound under the token itself,
    /// which the owner opens with the next preimage down its chain.
    fn refresh(
        &mut self,
        token: &[u8; 32],
        from: NodeAddr,
        router: &mut Router,
    ) -> Option<ReplyBody> {
        let slot_key = crypto::hash(token);
        let slot = self.refreshes.pop(&slot_key)?;

        if slot.announce_self {
            router.install(
                slot.target,
                RouterEntry {
                    relay: Some(from),
                    record: encode(&slot.record).ok()?,
                    actions: None,
                },
            );
        } else {
            self.insert_announce(&slot.target, slot.record.clone());
        }
        trace!(
            target = %hex::encode(&slot.target[..8]),
            "refresh: record re-installed, token rotated"
        );
        self.refreshes.put(*token, slot);
        Some(ReplyBody::empty())
    }

    // ========================================================================
    // Mutable records
    // ========================================================================

    /// Return the stored record iff its seq is at least the requested one,
    /// letting requesters skip re-fetching values they already hold.
    pub fn mutable_get(&mut self, target: &Target, value: Option<&[u8]>) -> Option<ReplyBody> {
        let want = match value {
            Some(bytes) => decode_bounded::<MutableGet>(bytes).ok()?.seq,
            None => 0,
        };
        let max_age = self.config.max_age;
        let stored = self.mutable.get(target)?;
        if stored.stored_at.elapsed() > max_age || stored.record.seq < want {
            return None;
        }
        Some(ReplyBody::with_value(encode(&stored.record).ok()?))
    }

    /// Verify and apply a mutable put. Sequence conflicts are the one place
    /// the store answers with a typed error instead of dropping.
    pub fn mutable_put(&mut self, target: &Target, value: Option<&[u8]>) -> Option<ReplyBody> {
        let put: MutablePut = decode_bounded(value?).ok()?;
        if put.value.len() > MAX_STORED_VALUE {
            return None;
        }
        if target_for_key(&put.public_key) != *target {
            debug!(target = %hex::encode(&target[..8]), "mutable put dropped: key/target mismatch");
            return None;
        }
        let identity = Identity::from_bytes(put.public_key);
        let signable_body = encode(&MutableSignable {
            seq: put.seq,
            value: put.value.clone(),
        })
        .ok()?;
        let signable = crypto::mutable_signable(&signable_body);
        if !identity.verify(&signable, &put.signature) {
            debug!(target = %hex::encode(&target[..8]), "mutable put dropped: bad signature");
            return None;
        }

        let max_age = self.config.max_age;
        if let Some(existing) = self.mutable.get(target) {
            if existing.stored_at.elapsed() <= max_age {
                if put.seq < existing.record.seq {
                    return Some(ReplyBody::with_error(ErrorCode::SeqTooLow));
                }
                if put.seq == existing.record.seq {
                    if put.value != existing.record.value {
                        return Some(ReplyBody::with_error(ErrorCode::SeqReused));
                    }
                    return Some(ReplyBody::empty());
                }
            }
        }

        self.mutable.put(
            *target,
            StoredMutable {
                record: MutableRecord {
                    seq: put.seq,
                    value: put.value,
                    signature: put.signature,
                },
                stored_at: Instant::now(),
            },
        );
        Some(ReplyBody::empty())
    }

    // ========================================================================
    // Immutable records
    // ========================================================================

    pub fn immutable_get(&mut self, target: &Target) -> Option<ReplyBody> {
        let max_age = self.config.max_age;
        let stored = self.immutable.get(target)?;
        if stored.stored_at.elapsed() > max_age {
            return None;
        }
        Some(ReplyBody::with_value(stored.value.clone()))
    }

    /// Accept iff the value hashes to the target; the key is the integrity
    /// check.
    pub fn immutable_put(&mut self, target: &Target, value: Option<&[u8]>) -> Option<ReplyBody> {
        let value = value?;
        if value.len() > MAX_STORED_VALUE || crypto::hash(value) != *target {
            debug!(target = %hex::encode(&target[..8]), "immutable put dropped: hash mismatch");
            return None;
        }
        self.immutable.put(
            *target,
            StoredImmutable {
                value: value.to_vec(),
                stored_at: Instant::now(),
            },
        );
        Some(ReplyBody::empty())
    }

    // ========================================================================
    // Maintenance and introspection
    // ========================================================================

    /// Drop expired entries. Run periodically by the owning node.
    pub fn evict_expired(&mut self) {
        let max_age = self.config.max_age;
        let expired_targets: Vec<Target> = self
            .announces
            .iter()
            .filter(|(_, slot)| {
                slot.iter()
                    .all(|(_, stored)| stored.stored_at.elapsed() > max_age)
            })
            .map(|(target, _)| *target)
            .collect();
        for target in expired_targets {
            self.announces.pop(&target);
        }

        let stale: Vec<Target> = self
            .mutable
            .iter()
            .filter(|(_, stored)| stored.stored_at.elapsed() > max_age)
            .map(|(target, _)| *target)
            .collect();
        for target in stale {
            self.mutable.pop(&target);
        }

        let stale: Vec<Target> = self
            .immutable
            .iter()
            .filter(|(_, stored)| stored.stored_at.elapsed() > max_age)
            .map(|(target, _)| *target)
            .collect();
        for target in stale {
            self.immutable.pop(&target);
        }
    }

    /// Live announce records held for `target`. Diagnostic surface only.
    pub fn announce_count(&mut self, target: &Target) -> usize {
        let max_age = self.config.max_age;
        match self.announces.get_mut(target) {
            Some(slot) => {
                slot.retain(|(_, stored)| stored.stored_at.elapsed() <= max_age);
                slot.len()
            }
            None => 0,
        }
    }
}

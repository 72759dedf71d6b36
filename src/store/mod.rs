/// Local persistence contract.
///
/// The application owns the real database; this crate only needs a
/// group-keyed record holding the current model, the two send-endorsement
/// tables (combined and per-member, replaced wholesale on refresh), durable
/// refresh timestamps, and the local blocklists. `MemoryGroupStore` is the
/// reference implementation and the test double.
///
/// Schema hint for a SQL-backed implementation:
/// ```sql
/// CREATE TABLE IF NOT EXISTS group_thread (
///   group_id      BLOB PRIMARY KEY,
///   model         BLOB NOT NULL,
///   refreshed_at  INTEGER
/// );
/// CREATE TABLE IF NOT EXISTS group_send_endorsement (
///   group_id      BLOB NOT NULL,
///   member_id     BLOB,              -- NULL for the combined token
///   token         BLOB NOT NULL,
///   expiration_ms INTEGER NOT NULL,
///   PRIMARY KEY (group_id, member_id)
/// );
/// ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use crate::groups::ids::{GroupIdentifier, LocalIdentifiers, ServiceId};
use crate::groups::model::GroupModel;
use crate::limits::AUTO_REFRESH_MAX_AGE_MS;

// ---------------------------------------------------------------------------
// Send endorsements
// ---------------------------------------------------------------------------

/// Opaque token authorizing sends to a group or member without revealing
/// full membership. Expires; replaced wholesale on every refresh.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct GroupSendEndorsement {
    pub token: Vec<u8>,
    pub expiration_ms: i64,
}

impl GroupSendEndorsement {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expiration_ms <= now_ms
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SendEndorsementRecords {
    pub combined: GroupSendEndorsement,
    pub per_member: BTreeMap<ServiceId, GroupSendEndorsement>,
}

// ---------------------------------------------------------------------------
// Store contract
// ---------------------------------------------------------------------------

pub trait GroupStore: Send + Sync {
    fn load_group(&self, group_id: &GroupIdentifier) -> Option<GroupModel>;

    /// Replace the stored model wholesale.
    fn upsert_group(&self, model: &GroupModel);

    fn remove_group(&self, group_id: &GroupIdentifier);

    fn all_group_ids(&self) -> Vec<GroupIdentifier>;

    /// Delete-then-insert of both endorsement tables for the group.
    fn replace_endorsements(
        &self,
        group_id: &GroupIdentifier,
        records: Option<SendEndorsementRecords>,
    );

    fn endorsements(&self, group_id: &GroupIdentifier) -> Option<SendEndorsementRecords>;

    /// Record that the group was brought up to the current revision.
    fn set_refreshed_at(&self, group_id: &GroupIdentifier, timestamp_ms: i64);

    fn refreshed_at(&self, group_id: &GroupIdentifier) -> Option<i64>;

    fn is_group_blocked(&self, group_id: &GroupIdentifier) -> bool;

    fn is_service_id_blocked(&self, id: &ServiceId) -> bool;

    /// The single best candidate for opportunistic background refresh: a
    /// group the local user belongs to that has never been refreshed, or
    /// failing that the one most-stale beyond the age threshold.
    fn find_group_to_auto_refresh(
        &self,
        local: &LocalIdentifiers,
        now_ms: i64,
    ) -> Option<GroupIdentifier> {
        let mut best: Option<(GroupIdentifier, i64)> = None;
        for group_id in self.all_group_ids() {
            let Some(model) = self.load_group(&group_id) else {
                continue;
            };
            // Refreshing a group we're not in only produces auth errors.
            if !model.membership.is_local_user_full_or_invited(local) {
                continue;
            }
            match self.refreshed_at(&group_id) {
                None => return Some(group_id),
                Some(at) => {
                    if now_ms.saturating_sub(at) < AUTO_REFRESH_MAX_AGE_MS {
                        continue;
                    }
                    match best {
                        Some((_, best_at)) if best_at <= at => {}
                        _ => best = Some((group_id, at)),
                    }
                }
            }
        }
        best.map(|(group_id, _)| group_id)
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryGroupStoreInner {
    groups: HashMap<GroupIdentifier, GroupModel>,
    endorsements: HashMap<GroupIdentifier, SendEndorsementRecords>,
    refreshed_at: HashMap<GroupIdentifier, i64>,
    blocked_groups: HashSet<GroupIdentifier>,
    blocked_users: HashSet<ServiceId>,
}

#[derive(Default)]
pub struct MemoryGroupStore {
    inner: Mutex<MemoryGroupStoreInner>,
}

impl MemoryGroupStore {
    pub fn new() -> Self {
        MemoryGroupStore::default()
    }

    pub fn block_group(&self, group_id: GroupIdentifier) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.blocked_groups.insert(group_id);
        }
    }

    pub fn block_service_id(&self, id: ServiceId) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.blocked_users.insert(id);
        }
    }
}

impl GroupStore for MemoryGroupStore {
    fn load_group(&self, group_id: &GroupIdentifier) -> Option<GroupModel> {
        self.inner.lock().ok()?.groups.get(group_id).cloned()
    }

    fn upsert_group(&self, model: &GroupModel) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.groups.insert(model.group_id(), model.clone());
        }
    }

    fn remove_group(&self, group_id: &GroupIdentifier) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.groups.remove(group_id);
            inner.endorsements.remove(group_id);
            inner.refreshed_at.remove(group_id);
        }
    }

    fn all_group_ids(&self) -> Vec<GroupIdentifier> {
        match self.inner.lock() {
            Ok(inner) => inner.groups.keys().copied().collect(),
            Err(_) => Vec::new(),
        }
    }

    fn replace_endorsements(
        &self,
        group_id: &GroupIdentifier,
        records: Option<SendEndorsementRecords>,
    ) {
        if let Ok(mut inner) = self.inner.lock() {
            match records {
                Some(records) => inner.endorsements.insert(*group_id, records),
                None => inner.endorsements.remove(group_id),
            };
        }
    }

    fn endorsements(&self, group_id: &GroupIdentifier) -> Option<SendEndorsementRecords> {
        self.inner.lock().ok()?.endorsements.get(group_id).cloned()
    }

    fn set_refreshed_at(&self, group_id: &GroupIdentifier, timestamp_ms: i64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.refreshed_at.insert(*group_id, timestamp_ms);
        }
    }

    fn refreshed_at(&self, group_id: &GroupIdentifier) -> Option<i64> {
        self.inner.lock().ok()?.refreshed_at.get(group_id).copied()
    }

    fn is_group_blocked(&self, group_id: &GroupIdentifier) -> bool {
        match self.inner.lock() {
            Ok(inner) => inner.blocked_groups.contains(group_id),
            Err(_) => false,
        }
    }

    fn is_service_id_blocked(&self, id: &ServiceId) -> bool {
        match self.inner.lock() {
            Ok(inner) => inner.blocked_users.contains(id),
            Err(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

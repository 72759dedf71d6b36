/// Group membership state.
///
/// One state per identity: full member, invited, or requesting. Banned
/// identities are tracked separately and are disjoint from current members.
/// Invalid invites (entries whose user id never decrypted to an identity)
/// are carried as opaque ciphertext pairs so they can still be revoked.
///
/// Membership is rebuilt wholesale on every merge, only through
/// `GroupMembershipBuilder`. Equality ignores the two provenance flags on
/// full members: server snapshots never carry them, so re-applying a
/// snapshot must not register a spurious state change.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::groups::ids::{Aci, LocalIdentifiers, ServiceId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MembershipError {
    #[error("Identity is already banned: {0:?}")]
    DuplicateBan(Aci),

    #[error("Cannot ban a current member: {0:?}")]
    BannedMemberIsCurrentMember(Aci),
}

// ---------------------------------------------------------------------------
// Roles and member states
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Role {
    Normal = 1,
    Administrator = 2,
}

impl Role {
    pub fn to_wire(self) -> u8 {
        self as u8
    }

    pub fn from_wire(value: u8) -> Option<Role> {
        match value {
            1 => Some(Role::Normal),
            2 => Some(Role::Administrator),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberState {
    Full {
        role: Role,
        /// Provenance only; excluded from membership equality.
        joined_via_invite_link: bool,
        /// Provenance only; excluded from membership equality.
        joined_via_accepted_request: bool,
    },
    Invited {
        role: Role,
        added_by: Aci,
    },
    Requesting,
}

impl MemberState {
    pub fn role(&self) -> Option<Role> {
        match self {
            MemberState::Full { role, .. } | MemberState::Invited { role, .. } => Some(*role),
            MemberState::Requesting => None,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, MemberState::Full { .. })
    }
}

/// What an "add" intent can become for a given identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddableResult {
    /// Already a member of some kind; the add is redundant.
    AlreadyInGroup,
    /// A profile key credential is on hand, so a direct add is possible.
    AddableWithProfileKeyCredential,
    /// No credential (or a secondary identity): only an invite is possible.
    AddableOrInvitable,
}

// ---------------------------------------------------------------------------
// GroupMembership
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct GroupMembership {
    states: BTreeMap<ServiceId, MemberState>,
    /// Banned identity -> banned-at timestamp (ms).
    banned: BTreeMap<Aci, i64>,
    /// Opaque user-id ciphertext -> opaque adder ciphertext, for invites
    /// whose identity never decrypted.
    invalid_invites: BTreeMap<Vec<u8>, Vec<u8>>,
}

/// Member state with provenance stripped, for equality.
#[derive(PartialEq, Eq)]
enum NormalizedState {
    Full(Role),
    Invited(Role, Aci),
    Requesting,
}

impl GroupMembership {
    pub fn empty() -> Self {
        GroupMembership::default()
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn member_state(&self, id: &ServiceId) -> Option<&MemberState> {
        self.states.get(id)
    }

    pub fn is_member_of_any_kind(&self, id: &ServiceId) -> bool {
        self.states.contains_key(id)
    }

    pub fn is_full_member(&self, id: &ServiceId) -> bool {
        matches!(self.states.get(id), Some(MemberState::Full { .. }))
    }

    pub fn is_invited_member(&self, id: &ServiceId) -> bool {
        matches!(self.states.get(id), Some(MemberState::Invited { .. }))
    }

    pub fn is_requesting_member(&self, aci: &Aci) -> bool {
        matches!(
            self.states.get(&ServiceId::Aci(*aci)),
            Some(MemberState::Requesting)
        )
    }

    pub fn is_banned(&self, aci: &Aci) -> bool {
        self.banned.contains_key(aci)
    }

    pub fn role_of(&self, id: &ServiceId) -> Option<Role> {
        self.states.get(id).and_then(MemberState::role)
    }

    pub fn is_full_member_and_administrator(&self, id: &ServiceId) -> bool {
        matches!(
            self.states.get(id),
            Some(MemberState::Full { role: Role::Administrator, .. })
        )
    }

    pub fn full_members(&self) -> Vec<ServiceId> {
        self.states
            .iter()
            .filter(|(_, state)| state.is_full())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn invited_members(&self) -> Vec<ServiceId> {
        self.states
            .iter()
            .filter(|(_, state)| matches!(state, MemberState::Invited { .. }))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn requesting_members(&self) -> Vec<Aci> {
        self.states
            .iter()
            .filter(|(_, state)| matches!(state, MemberState::Requesting))
            .filter_map(|(id, _)| id.aci())
            .collect()
    }

    pub fn banned_members(&self) -> &BTreeMap<Aci, i64> {
        &self.banned
    }

    /// Banned identities ordered oldest ban first: the eviction order when
    /// the banned set overflows.
    pub fn banned_sorted_by_age(&self) -> Vec<(Aci, i64)> {
        let mut entries: Vec<(Aci, i64)> = self.banned.iter().map(|(a, t)| (*a, *t)).collect();
        entries.sort_by_key(|(_, banned_at)| *banned_at);
        entries
    }

    pub fn invalid_invites(&self) -> &BTreeMap<Vec<u8>, Vec<u8>> {
        &self.invalid_invites
    }

    pub fn full_or_invited_count(&self) -> usize {
        self.states
            .values()
            .filter(|state| !matches!(state, MemberState::Requesting))
            .count()
    }

    pub fn all_members_count(&self) -> usize {
        self.states.len()
    }

    /// The identity under which the local user is invited, preferring the
    /// primary identity when both are invited.
    pub fn local_user_invited_at(&self, local: &LocalIdentifiers) -> Option<ServiceId> {
        let aci_id = ServiceId::Aci(local.aci);
        if self.is_invited_member(&aci_id) {
            return Some(aci_id);
        }
        if let Some(pni) = local.pni {
            let pni_id = ServiceId::Pni(pni);
            if self.is_invited_member(&pni_id) {
                return Some(pni_id);
            }
        }
        None
    }

    pub fn is_local_user_full_or_invited(&self, local: &LocalIdentifiers) -> bool {
        let aci_id = ServiceId::Aci(local.aci);
        if self.is_full_member(&aci_id) || self.is_invited_member(&aci_id) {
            return true;
        }
        match local.pni {
            Some(pni) => self.is_invited_member(&ServiceId::Pni(pni)),
            None => false,
        }
    }

    /// Whether an "add" intent for this identity is redundant, a direct add,
    /// or only an invite. A direct add needs a profile key credential and a
    /// primary identity.
    pub fn can_try_to_add(&self, id: &ServiceId, has_credential: bool) -> AddableResult {
        if self.is_member_of_any_kind(id) {
            AddableResult::AlreadyInGroup
        } else if id.is_primary() && has_credential {
            AddableResult::AddableWithProfileKeyCredential
        } else {
            AddableResult::AddableOrInvitable
        }
    }

    pub fn to_builder(&self) -> GroupMembershipBuilder {
        GroupMembershipBuilder {
            states: self.states.clone(),
            banned: self.banned.clone(),
            invalid_invites: self.invalid_invites.clone(),
        }
    }
}

impl GroupMembership {
    fn normalized(&self) -> BTreeMap<ServiceId, NormalizedState> {
        self.states
            .iter()
            .map(|(id, state)| {
                let normalized = match state {
                    MemberState::Full { role, .. } => NormalizedState::Full(*role),
                    MemberState::Invited { role, added_by } => {
                        NormalizedState::Invited(*role, *added_by)
                    }
                    MemberState::Requesting => NormalizedState::Requesting,
                };
                (*id, normalized)
            })
            .collect()
    }
}

impl PartialEq for GroupMembership {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
            && self.banned == other.banned
            && self.invalid_invites == other.invalid_invites
    }
}

impl Eq for GroupMembership {}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct GroupMembershipBuilder {
    states: BTreeMap<ServiceId, MemberState>,
    banned: BTreeMap<Aci, i64>,
    invalid_invites: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl GroupMembershipBuilder {
    pub fn new() -> Self {
        GroupMembershipBuilder::default()
    }

    /// Add a full member. A duplicate full-member entry (as happens when a
    /// malformed snapshot repeats a member) is logged and skipped, not
    /// fatal. An invited/requesting entry is replaced: that is a promotion.
    pub fn add_full_member(&mut self, id: ServiceId, role: Role) {
        self.add_full_member_with_provenance(id, role, false, false);
    }

    pub fn add_full_member_with_provenance(
        &mut self,
        id: ServiceId,
        role: Role,
        joined_via_invite_link: bool,
        joined_via_accepted_request: bool,
    ) {
        if matches!(self.states.get(&id), Some(MemberState::Full { .. })) {
            log::warn!("Duplicate full member entry, skipping: {:?}", id);
            return;
        }
        self.states.insert(
            id,
            MemberState::Full { role, joined_via_invite_link, joined_via_accepted_request },
        );
    }

    pub fn add_invited_member(&mut self, id: ServiceId, role: Role, added_by: Aci) {
        if self.states.contains_key(&id) {
            log::warn!("Invite for an identity already present, skipping: {:?}", id);
            return;
        }
        self.states.insert(id, MemberState::Invited { role, added_by });
    }

    pub fn add_requesting_member(&mut self, aci: Aci) {
        let id = ServiceId::Aci(aci);
        if self.states.contains_key(&id) {
            log::warn!("Join request for an identity already present, skipping: {:?}", id);
            return;
        }
        self.states.insert(id, MemberState::Requesting);
    }

    /// Remove a member of any kind. Returns whether an entry was removed.
    pub fn remove_member(&mut self, id: &ServiceId) -> bool {
        self.states.remove(id).is_some()
    }

    /// Change the role of an existing full or invited member, preserving
    /// provenance. Returns whether the member existed with a role.
    pub fn change_role(&mut self, id: &ServiceId, new_role: Role) -> bool {
        match self.states.get_mut(id) {
            Some(MemberState::Full { role, .. }) | Some(MemberState::Invited { role, .. }) => {
                *role = new_role;
                true
            }
            _ => false,
        }
    }

    /// Ban an identity. Banning twice, or banning a current member, is a
    /// caller bug.
    pub fn add_banned_member(
        &mut self,
        aci: Aci,
        banned_at_ms: i64,
    ) -> Result<(), MembershipError> {
        if self.banned.contains_key(&aci) {
            return Err(MembershipError::DuplicateBan(aci));
        }
        if self.states.contains_key(&ServiceId::Aci(aci)) {
            return Err(MembershipError::BannedMemberIsCurrentMember(aci));
        }
        self.banned.insert(aci, banned_at_ms);
        Ok(())
    }

    pub fn remove_banned_member(&mut self, aci: &Aci) -> bool {
        self.banned.remove(aci).is_some()
    }

    pub fn add_invalid_invite(&mut self, user_id_ciphertext: Vec<u8>, added_by_ciphertext: Vec<u8>) {
        self.invalid_invites.insert(user_id_ciphertext, added_by_ciphertext);
    }

    pub fn remove_invalid_invite(&mut self, user_id_ciphertext: &[u8]) -> bool {
        self.invalid_invites.remove(user_id_ciphertext).is_some()
    }

    pub fn build(self) -> GroupMembership {
        GroupMembership {
            states: self.states,
            banned: self.banned,
            invalid_invites: self.invalid_invites,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

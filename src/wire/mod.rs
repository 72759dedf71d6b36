/// Wire format for the group service.
///
/// Message structs mirror the service's schema one field per field; bodies
/// are bincode-encoded. Sealed fields (titles, timers, user ids, profile
/// keys) travel as opaque ciphertext byte strings and are translated to and
/// from domain types by `translate`.

pub mod translate;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors and codec
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Wire encoding failed: {0}")]
    Encode(String),

    #[error("Wire decoding failed: {0}")]
    Decode(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    bincode::serialize(value).map_err(|e| WireError::Encode(e.to_string()))
}

pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, WireError> {
    bincode::deserialize(bytes).map_err(|e| WireError::Decode(e.to_string()))
}

// ---------------------------------------------------------------------------
// Membership entries
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct MemberWire {
    /// Sealed identity.
    pub user_id: Vec<u8>,
    pub role: u8,
    /// Sealed profile key, bound to the identity.
    pub profile_key: Vec<u8>,
    pub joined_at_revision: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct PendingMemberWire {
    pub user_id: Vec<u8>,
    pub role: u8,
    /// Sealed identity of the inviter.
    pub added_by_user_id: Vec<u8>,
    pub timestamp_ms: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestingMemberWire {
    pub user_id: Vec<u8>,
    pub profile_key: Vec<u8>,
    pub timestamp_ms: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct BannedMemberWire {
    pub user_id: Vec<u8>,
    pub banned_at_ms: u64,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AccessControlWire {
    pub members: u8,
    pub attributes: u8,
    pub add_from_invite_link: u8,
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupSnapshotWire {
    pub revision: u32,
    /// Sealed title. Empty means absent.
    pub title: Vec<u8>,
    /// Sealed description. Empty means absent.
    pub description: Vec<u8>,
    pub avatar_url_path: Option<String>,
    /// Sealed disappearing-timer token. Empty means absent.
    pub timer: Vec<u8>,
    pub access: AccessControlWire,
    pub members: Vec<MemberWire>,
    pub pending_members: Vec<PendingMemberWire>,
    pub requesting_members: Vec<RequestingMemberWire>,
    pub banned_members: Vec<BannedMemberWire>,
    /// Empty means no invite link password is set.
    pub invite_link_password: Vec<u8>,
    pub is_announcements_only: bool,
}

// ---------------------------------------------------------------------------
// Change actions
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct AddMemberActionWire {
    pub member: MemberWire,
    pub join_from_invite_link: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ModifyRoleActionWire {
    pub user_id: Vec<u8>,
    pub role: u8,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ModifyProfileKeyActionWire {
    pub user_id: Vec<u8>,
    pub profile_key: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct PromotePendingMemberActionWire {
    pub user_id: Vec<u8>,
    pub profile_key: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct PromotePniPendingMemberActionWire {
    pub aci_user_id: Vec<u8>,
    pub pni_user_id: Vec<u8>,
    pub profile_key: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct PromoteRequestingMemberActionWire {
    pub user_id: Vec<u8>,
    pub role: u8,
}

/// An authored delta. `revision` must be exactly one above the state it was
/// built against.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupChangeActions {
    pub revision: u32,
    /// Sealed author identity. Empty when unknown (server-synthesized).
    pub source_user_id: Vec<u8>,

    pub add_members: Vec<AddMemberActionWire>,
    pub delete_members: Vec<Vec<u8>>,
    pub modify_member_roles: Vec<ModifyRoleActionWire>,
    pub modify_member_profile_keys: Vec<ModifyProfileKeyActionWire>,

    pub add_pending_members: Vec<PendingMemberWire>,
    pub delete_pending_members: Vec<Vec<u8>>,
    pub promote_pending_members: Vec<PromotePendingMemberActionWire>,
    pub promote_pni_pending_members: Vec<PromotePniPendingMemberActionWire>,

    pub add_requesting_members: Vec<RequestingMemberWire>,
    pub delete_requesting_members: Vec<Vec<u8>>,
    pub promote_requesting_members: Vec<PromoteRequestingMemberActionWire>,

    pub add_banned_members: Vec<BannedMemberWire>,
    pub delete_banned_members: Vec<Vec<u8>>,

    pub modify_title: Option<Vec<u8>>,
    pub modify_description: Option<Vec<u8>>,
    /// `Some(None)` clears the avatar.
    pub modify_avatar: Option<Option<String>>,
    pub modify_timer: Option<Vec<u8>>,
    pub modify_members_access: Option<u8>,
    pub modify_attributes_access: Option<u8>,
    pub modify_add_from_invite_link_access: Option<u8>,
    pub modify_announcements_only: Option<bool>,
    /// `Some(empty)` clears the password.
    pub modify_invite_link_password: Option<Vec<u8>>,
}

impl GroupChangeActions {
    /// Whether the delta carries no actions at all.
    pub fn is_empty(&self) -> bool {
        self.add_members.is_empty()
            && self.delete_members.is_empty()
            && self.modify_member_roles.is_empty()
            && self.modify_member_profile_keys.is_empty()
            && self.add_pending_members.is_empty()
            && self.delete_pending_members.is_empty()
            && self.promote_pending_members.is_empty()
            && self.promote_pni_pending_members.is_empty()
            && self.add_requesting_members.is_empty()
            && self.delete_requesting_members.is_empty()
            && self.promote_requesting_members.is_empty()
            && self.add_banned_members.is_empty()
            && self.delete_banned_members.is_empty()
            && self.modify_title.is_none()
            && self.modify_description.is_none()
            && self.modify_avatar.is_none()
            && self.modify_timer.is_none()
            && self.modify_members_access.is_none()
            && self.modify_attributes_access.is_none()
            && self.modify_add_from_invite_link_access.is_none()
            && self.modify_announcements_only.is_none()
            && self.modify_invite_link_password.is_none()
    }

    /// Whether the delta carries profile key credential material. Requests
    /// submitting such deltas get one forced-refresh retry on a 400.
    pub fn carries_profile_key_credentials(&self) -> bool {
        !self.add_members.is_empty()
            || !self.promote_pending_members.is_empty()
            || !self.promote_pni_pending_members.is_empty()
            || !self.add_requesting_members.is_empty()
            || !self.modify_member_profile_keys.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Log pages, endorsements, invite links
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupChangeEntryWire {
    pub actions: Option<GroupChangeActions>,
    pub snapshot: Option<GroupSnapshotWire>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct SendEndorsementsWire {
    pub expiration_ms: i64,
    pub combined: Vec<u8>,
    /// Sealed member identity -> endorsement token.
    pub per_member: Vec<(Vec<u8>, Vec<u8>)>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupChangePageWire {
    pub entries: Vec<GroupChangeEntryWire>,
    pub endorsements: Option<SendEndorsementsWire>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupSnapshotResponseWire {
    pub snapshot: GroupSnapshotWire,
    pub endorsements: Option<SendEndorsementsWire>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JoinedAtRevisionWire {
    pub joined_at_revision: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct GroupInviteLinkContentsWire {
    pub master_key: [u8; 32],
    pub invite_password: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupInviteLinkPreviewWire {
    /// Sealed title.
    pub title: Vec<u8>,
    /// Sealed description. Empty means absent.
    pub description: Vec<u8>,
    pub avatar_url_path: Option<String>,
    pub member_count: u32,
    pub add_from_invite_link_access: u8,
    pub revision: u32,
    pub is_local_user_requesting_member: bool,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// The aggregate group model: membership, access, sealed attributes,
/// revision, and the key material that scopes them.

use serde::{Deserialize, Serialize};

use crate::crypto::GroupParams;
use crate::groups::access::GroupAccess;
use crate::groups::ids::GroupIdentifier;
use crate::groups::membership::GroupMembership;

// ---------------------------------------------------------------------------
// Disappearing-timer token
// ---------------------------------------------------------------------------

/// Disappearing-message timer state, sealed into a blob on the wire.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerToken {
    pub is_enabled: bool,
    pub duration_secs: u32,
}

impl TimerToken {
    pub fn disabled() -> Self {
        TimerToken { is_enabled: false, duration_secs: 0 }
    }

    pub fn enabled(duration_secs: u32) -> Self {
        TimerToken { is_enabled: duration_secs > 0, duration_secs }
    }
}

impl Default for TimerToken {
    fn default() -> Self {
        TimerToken::disabled()
    }
}

// ---------------------------------------------------------------------------
// Model options
// ---------------------------------------------------------------------------

/// Recognized options when building or merging a model. A closed set, not
/// free-form configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupModelOptions {
    /// Let refresh throttling suppress a recently refreshed group.
    pub throttle: bool,
    /// Mark the model as just-self-joined via the invite link.
    pub marked_self_joined_via_link: bool,
}

impl GroupModelOptions {
    pub fn none() -> Self {
        GroupModelOptions::default()
    }

    pub fn throttled() -> Self {
        GroupModelOptions { throttle: true, ..Default::default() }
    }

    pub fn self_joined_via_link() -> Self {
        GroupModelOptions { marked_self_joined_via_link: true, ..Default::default() }
    }
}

// ---------------------------------------------------------------------------
// GroupModel
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct GroupModel {
    /// Authoritative order key. Never decreases once persisted.
    pub revision: u32,
    pub title: String,
    pub description: Option<String>,
    /// Where the current avatar lives on the service, if any.
    pub avatar_url_path: Option<String>,
    /// Decrypted avatar bytes, when the download succeeded.
    pub avatar_data: Option<Vec<u8>>,
    pub membership: GroupMembership,
    pub access: GroupAccess,
    pub invite_link_password: Option<Vec<u8>>,
    pub is_announcements_only: bool,
    pub timer: TimerToken,
    pub params: GroupParams,
    /// Locally synthesized, incomplete model: we requested to join but
    /// cannot yet fetch authoritative state.
    pub is_join_request_placeholder: bool,
    /// Transient: set when the local user just joined via the invite link.
    /// Excluded from persisted-state equality.
    pub did_just_add_self_via_group_link: bool,
}

impl GroupModel {
    /// A minimal model at revision 0 for a group being created locally.
    pub fn empty(params: GroupParams) -> Self {
        GroupModel {
            revision: 0,
            title: String::new(),
            description: None,
            avatar_url_path: None,
            avatar_data: None,
            membership: GroupMembership::empty(),
            access: crate::groups::access::GroupAccess::default_for_new_group(),
            invite_link_password: None,
            is_announcements_only: false,
            timer: TimerToken::disabled(),
            params,
            is_join_request_placeholder: false,
            did_just_add_self_via_group_link: false,
        }
    }

    pub fn group_id(&self) -> GroupIdentifier {
        self.params.group_id
    }

    pub fn apply_options(&mut self, options: &GroupModelOptions) {
        if options.marked_self_joined_via_link {
            self.did_just_add_self_via_group_link = true;
        }
    }

    /// Equality of everything that is persisted. Transient flags are
    /// excluded, so re-marking a model does not register as a state change.
    pub fn persisted_state_eq(&self, other: &GroupModel) -> bool {
        self.revision == other.revision
            && self.title == other.title
            && self.description == other.description
            && self.avatar_url_path == other.avatar_url_path
            && self.membership == other.membership
            && self.access == other.access
            && self.invite_link_password == other.invite_link_password
            && self.is_announcements_only == other.is_announcements_only
            && self.timer == other.timer
            && self.group_id() == other.group_id()
            && self.is_join_request_placeholder == other.is_join_request_placeholder
    }

    /// Whether a transition from `self` to `new` changes anything a user
    /// can see. Drives notification-message insertion and UI-list touch.
    pub fn has_user_facing_change(&self, new: &GroupModel) -> bool {
        self.title != new.title
            || self.description != new.description
            || self.avatar_url_path != new.avatar_url_path
            || self.membership != new.membership
            || self.access != new.access
            || self.is_announcements_only != new.is_announcements_only
            || self.timer != new.timer
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::groups::ids::{Aci, GroupMasterKey};
    use crate::groups::membership::Role;

    fn model() -> GroupModel {
        let params = GroupParams::from_master_key(&GroupMasterKey::from_bytes([1; 32]));
        let mut model = GroupModel::empty(params);
        model.title = "hiking".into();
        model
    }

    #[test]
    fn test_timer_token() {
        assert!(!TimerToken::disabled().is_enabled);
        assert!(TimerToken::enabled(60).is_enabled);
        assert!(!TimerToken::enabled(0).is_enabled);
    }

    #[test]
    fn test_transient_flag_excluded_from_persisted_equality() {
        let a = model();
        let mut b = model();
        b.did_just_add_self_via_group_link = true;

        assert!(a.persisted_state_eq(&b));
        assert!(!a.has_user_facing_change(&b));
    }

    #[test]
    fn test_revision_participates_in_persisted_equality() {
        let a = model();
        let mut b = model();
        b.revision = 5;
        assert!(!a.persisted_state_eq(&b));
        // A bare revision bump is not user-facing.
        assert!(!a.has_user_facing_change(&b));
    }

    #[test]
    fn test_user_facing_change_classification() {
        let a = model();

        let mut title_changed = model();
        title_changed.title = "climbing".into();
        assert!(a.has_user_facing_change(&title_changed));

        let mut member_added = model();
        let mut builder = member_added.membership.to_builder();
        builder.add_full_member(Aci::from_bytes([7; 16]).into(), Role::Normal);
        member_added.membership = builder.build();
        assert!(a.has_user_facing_change(&member_added));

        let mut timer_changed = model();
        timer_changed.timer = TimerToken::enabled(3600);
        assert!(a.has_user_facing_change(&timer_changed));
    }

    #[test]
    fn test_apply_options() {
        let mut m = model();
        m.apply_options(&GroupModelOptions::throttled());
        assert!(!m.did_just_add_self_via_group_link);

        m.apply_options(&GroupModelOptions::self_joined_via_link());
        assert!(m.did_just_add_self_via_group_link);
    }
}

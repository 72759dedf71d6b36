/// Outgoing change proposals.
///
/// An `OutgoingChanges` captures the local user's original intent, not new
/// group state. When the proposal is submitted, the intent is resolved
/// against the freshest authoritative model into the minimal delta that is
/// still necessary:
///
/// - identical-to-current changes are dropped (redundant, success);
/// - overlapping changes are not conflicts: adding {A, B} when another
///   writer already added A submits only B;
/// - an add of someone already requesting becomes a promotion;
/// - an add with a valid profile key credential is a direct add, otherwise
///   an invite;
/// - a role change for someone no longer a full member is a hard conflict
///   and aborts the whole batch.
///
/// If nothing remains to do, the build returns `None`; callers treat that
/// as success.

use std::collections::{BTreeMap, BTreeSet};

use rand::RngCore;

use crate::error::GroupsError;
use crate::groups::access::AccessLevel;
use crate::groups::ids::{Aci, LocalIdentifiers, ProfileKeyCredential, ServiceId};
use crate::groups::membership::Role;
use crate::groups::model::{GroupModel, TimerToken};
use crate::limits::{
    check_group_size, GroupSizeStatus, MAX_BANNED_MEMBERS, MAX_DESCRIPTION_BYTES, MAX_TITLE_BYTES,
};
use crate::wire::{
    AddMemberActionWire, BannedMemberWire, GroupChangeActions, MemberWire,
    ModifyProfileKeyActionWire, ModifyRoleActionWire, PendingMemberWire,
    PromotePendingMemberActionWire, PromotePniPendingMemberActionWire,
    PromoteRequestingMemberActionWire,
};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Whether the post-commit notification fan-out should happen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationBehavior {
    SendUpdateToOtherMembers,
    /// Declining an invite held by the local user's secondary identity must
    /// not produce outbound traffic: a message would link the identities.
    SendNothing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InviteLinkMode {
    Disabled,
    EnabledWithoutApproval,
    EnabledWithApproval,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum InviteLinkPasswordMode {
    Ignore,
    Rotate,
    EnsureValid,
}

/// The resolved minimal delta plus post-commit behavior.
#[derive(Clone, Debug)]
pub struct BuiltGroupChange {
    pub actions: GroupChangeActions,
    pub notification: NotificationBehavior,
}

pub fn generate_invite_link_password() -> Vec<u8> {
    let mut password = vec![0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut password);
    password
}

// ---------------------------------------------------------------------------
// OutgoingChanges
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct OutgoingChanges {
    new_title: Option<String>,
    /// `Some("")` clears the description.
    new_description: Option<String>,

    should_update_avatar: bool,
    new_avatar_data: Option<Vec<u8>>,
    new_avatar_url_path: Option<String>,

    members_to_add: Vec<ServiceId>,
    members_to_remove: Vec<ServiceId>,
    members_to_unban: Vec<Aci>,
    members_to_change_role: BTreeMap<Aci, Role>,

    access_for_members: Option<AccessLevel>,
    access_for_attributes: Option<AccessLevel>,
    access_for_add_from_invite_link: Option<AccessLevel>,
    invite_link_password_mode: Option<InviteLinkPasswordMode>,

    should_accept_invite: bool,
    should_leave_group_decline_invite: bool,
    should_revoke_invalid_invites: bool,
    should_update_local_profile_key: bool,

    is_announcements_only: Option<bool>,
    new_timer: Option<TimerToken>,
}

impl OutgoingChanges {
    pub fn new() -> Self {
        OutgoingChanges::default()
    }

    pub fn set_title(&mut self, title: &str) {
        if title.is_empty() {
            log::warn!("Ignoring empty title");
            return;
        }
        self.new_title = Some(title.to_string());
    }

    pub fn set_description(&mut self, description: Option<&str>) {
        self.new_description = Some(description.unwrap_or_default().to_string());
    }

    /// Record an avatar change. `None` clears the avatar. The data is
    /// uploaded before the proposal is built; `set_uploaded_avatar_url_path`
    /// records where it landed.
    pub fn set_avatar_data(&mut self, data: Option<Vec<u8>>) {
        self.should_update_avatar = true;
        self.new_avatar_data = data;
        self.new_avatar_url_path = None;
    }

    pub fn set_uploaded_avatar_url_path(&mut self, url_path: String) {
        self.new_avatar_url_path = Some(url_path);
    }

    pub fn pending_avatar_upload(&self) -> Option<&[u8]> {
        if self.should_update_avatar && self.new_avatar_url_path.is_none() {
            self.new_avatar_data.as_deref()
        } else {
            None
        }
    }

    pub fn uploaded_avatar(&self) -> Option<(&str, &[u8])> {
        match (&self.new_avatar_url_path, &self.new_avatar_data) {
            (Some(path), Some(data)) => Some((path.as_str(), data.as_slice())),
            _ => None,
        }
    }

    pub fn add_member(&mut self, service_id: ServiceId) {
        if !self.members_to_add.contains(&service_id) {
            self.members_to_add.push(service_id);
        }
    }

    pub fn remove_member(&mut self, service_id: ServiceId) {
        if !self.members_to_remove.contains(&service_id) {
            self.members_to_remove.push(service_id);
        }
    }

    pub fn change_role(&mut self, aci: Aci, role: Role) {
        self.members_to_change_role.insert(aci, role);
    }

    /// Lift a ban without re-adding the member.
    pub fn unban_member(&mut self, aci: Aci) {
        if !self.members_to_unban.contains(&aci) {
            self.members_to_unban.push(aci);
        }
    }

    pub fn set_access_for_members(&mut self, access: AccessLevel) {
        self.access_for_members = Some(access);
    }

    pub fn set_access_for_attributes(&mut self, access: AccessLevel) {
        self.access_for_attributes = Some(access);
    }

    pub fn set_link_mode(&mut self, mode: InviteLinkMode) {
        match mode {
            InviteLinkMode::Disabled => {
                self.access_for_add_from_invite_link = Some(AccessLevel::Unsatisfiable);
                self.invite_link_password_mode = Some(InviteLinkPasswordMode::Ignore);
            }
            InviteLinkMode::EnabledWithoutApproval => {
                self.access_for_add_from_invite_link = Some(AccessLevel::Any);
                self.invite_link_password_mode = Some(InviteLinkPasswordMode::EnsureValid);
            }
            InviteLinkMode::EnabledWithApproval => {
                self.access_for_add_from_invite_link = Some(AccessLevel::Administrator);
                self.invite_link_password_mode = Some(InviteLinkPasswordMode::EnsureValid);
            }
        }
    }

    pub fn rotate_invite_link_password(&mut self) {
        self.invite_link_password_mode = Some(InviteLinkPasswordMode::Rotate);
    }

    pub fn set_local_should_accept_invite(&mut self) {
        self.should_accept_invite = true;
    }

    pub fn set_should_leave_group_decline_invite(&mut self) {
        self.should_leave_group_decline_invite = true;
    }

    pub fn revoke_invalid_invites(&mut self) {
        self.should_revoke_invalid_invites = true;
    }

    pub fn set_should_update_local_profile_key(&mut self) {
        self.should_update_local_profile_key = true;
    }

    pub fn set_is_announcements_only(&mut self, value: bool) {
        self.is_announcements_only = Some(value);
    }

    pub fn set_timer(&mut self, timer: TimerToken) {
        self.new_timer = Some(timer);
    }

    /// Identities we may want profile key credentials for. The local user is
    /// always included: accepting invites and key updates need our own.
    pub fn credential_acis(&self, local: Aci) -> Vec<Aci> {
        let mut acis: Vec<Aci> = self
            .members_to_add
            .iter()
            .filter_map(ServiceId::aci)
            .collect();
        if !acis.contains(&local) {
            acis.push(local);
        }
        acis
    }

    // -----------------------------------------------------------------------
    // Conflict resolution
    // -----------------------------------------------------------------------

    /// Resolve the intent against the current authoritative model into the
    /// minimal remaining delta. Returns `None` when nothing is left to do.
    pub fn build_change_actions(
        &self,
        current: &GroupModel,
        local: &LocalIdentifiers,
        credentials: &BTreeMap<Aci, ProfileKeyCredential>,
        now_ms: i64,
    ) -> Result<Option<BuiltGroupChange>, GroupsError> {
        let params = &current.params;
        let membership = &current.membership;
        let new_revision = current.revision.wrapping_add(1);
        let local_aci = local.aci;

        let mut actions = GroupChangeActions { revision: new_revision, ..Default::default() };
        let mut notification = NotificationBehavior::SendUpdateToOtherMembers;

        let valid_credential = |aci: &Aci| -> Option<&ProfileKeyCredential> {
            credentials.get(aci).filter(|c| !c.is_expired(now_ms))
        };

        if let Some(new_title) = &self.new_title {
            if *new_title == current.title {
                // Redundant, not a conflict.
            } else {
                if new_title.len() > MAX_TITLE_BYTES {
                    return Err(GroupsError::AttributeTooLong);
                }
                actions.modify_title = Some(params.encrypt_title(new_title)?);
            }
        }

        if let Some(new_description) = &self.new_description {
            let normalized_new = if new_description.is_empty() { None } else { Some(new_description.clone()) };
            if normalized_new == current.description {
                // Redundant, not a conflict.
            } else {
                if new_description.len() > MAX_DESCRIPTION_BYTES {
                    return Err(GroupsError::AttributeTooLong);
                }
                actions.modify_description = Some(params.encrypt_description(new_description)?);
            }
        }

        if self.should_update_avatar {
            if self.new_avatar_url_path == current.avatar_url_path {
                // Redundant, not a conflict.
            } else {
                actions.modify_avatar = Some(self.new_avatar_url_path.clone());
            }
        }

        if let Some(password_mode) = self.invite_link_password_mode {
            let new_password: Option<Vec<u8>> = match password_mode {
                InviteLinkPasswordMode::Ignore => current.invite_link_password.clone(),
                InviteLinkPasswordMode::Rotate => Some(generate_invite_link_password()),
                InviteLinkPasswordMode::EnsureValid => match &current.invite_link_password {
                    Some(password) if !password.is_empty() => Some(password.clone()),
                    _ => Some(generate_invite_link_password()),
                },
            };
            if new_password != current.invite_link_password {
                actions.modify_invite_link_password = Some(new_password.unwrap_or_default());
            }
        }

        let mut members_to_unban: Vec<Aci> = self.members_to_unban.clone();
        let mut members_to_ban: Vec<Aci> = Vec::new();

        if !self.members_to_add.is_empty() {
            let mut full_or_invited: BTreeSet<ServiceId> = membership
                .full_members()
                .into_iter()
                .chain(membership.invited_members())
                .collect();

            for service_id in &self.members_to_add {
                if membership.is_full_member(service_id) {
                    // Another writer already added them, possibly with a
                    // different role. Overlap, not a conflict.
                    continue;
                }
                let aci = service_id.aci();
                if let Some(aci) = aci.filter(|aci| membership.is_requesting_member(aci)) {
                    actions.promote_requesting_members.push(PromoteRequestingMemberActionWire {
                        user_id: params.encrypt_service_id(service_id)?,
                        role: Role::Normal.to_wire(),
                    });
                    members_to_unban.push(aci);
                    full_or_invited.insert(*service_id);
                } else if let Some((aci, credential)) =
                    aci.and_then(|aci| valid_credential(&aci).map(|c| (aci, c)))
                {
                    actions.add_members.push(AddMemberActionWire {
                        member: MemberWire {
                            user_id: params.encrypt_service_id(service_id)?,
                            role: Role::Normal.to_wire(),
                            profile_key: params
                                .encrypt_profile_key(&credential.profile_key, &aci)?,
                            joined_at_revision: new_revision,
                        },
                        join_from_invite_link: false,
                    });
                    members_to_unban.push(aci);
                    full_or_invited.insert(*service_id);
                } else if membership.is_invited_member(service_id) {
                    // Already invited by someone else. Overlap, not a conflict.
                    continue;
                } else {
                    actions.add_pending_members.push(PendingMemberWire {
                        user_id: params.encrypt_service_id(service_id)?,
                        role: Role::Normal.to_wire(),
                        added_by_user_id: params
                            .encrypt_service_id(&ServiceId::Aci(local_aci))?,
                        timestamp_ms: now_ms as u64,
                    });
                    if let Some(aci) = aci {
                        members_to_unban.push(aci);
                    }
                    full_or_invited.insert(*service_id);
                }
            }

            if check_group_size(full_or_invited.len()) == GroupSizeStatus::OverHardLimit {
                return Err(GroupsError::TooManyMembers);
            }
        }

        for service_id in &self.members_to_remove {
            if let Some(aci) = service_id.aci().filter(|_| membership.is_full_member(service_id)) {
                actions.delete_members.push(params.encrypt_service_id(service_id)?);
                members_to_ban.push(aci);
            } else if membership.is_invited_member(service_id) {
                // Revoking a plain invite does not ban.
                actions.delete_pending_members.push(params.encrypt_service_id(service_id)?);
            } else if let Some(aci) =
                service_id.aci().filter(|aci| membership.is_requesting_member(aci))
            {
                actions.delete_requesting_members.push(params.encrypt_service_id(service_id)?);
                members_to_ban.push(aci);
            } else {
                // Already removed or revoked by another writer. Redundant.
            }
        }

        {
            // Only ban/unban where the current membership makes it relevant.
            let acis_to_ban: Vec<Aci> = members_to_ban
                .into_iter()
                .filter(|aci| !membership.is_banned(aci))
                .collect();
            let mut acis_to_unban: Vec<Aci> = members_to_unban
                .into_iter()
                .filter(|aci| membership.is_banned(aci))
                .collect();

            // If the banned set would overflow, evict the least-recently
            // banned entries until the new bans fit.
            let current_banned = membership.banned_members();
            let net_new = acis_to_ban.len() as i64 - acis_to_unban.len() as i64;
            let overflow = current_banned.len() as i64 + net_new - MAX_BANNED_MEMBERS as i64;
            if overflow > 0 {
                let evicted: Vec<Aci> = membership
                    .banned_sorted_by_age()
                    .into_iter()
                    .filter(|(aci, _)| !acis_to_unban.contains(aci))
                    .take(overflow as usize)
                    .map(|(aci, _)| aci)
                    .collect();
                acis_to_unban.extend(evicted);
            }

            for aci in acis_to_ban {
                actions.add_banned_members.push(BannedMemberWire {
                    user_id: params.encrypt_service_id(&ServiceId::Aci(aci))?,
                    banned_at_ms: now_ms as u64,
                });
            }
            for aci in acis_to_unban {
                actions
                    .delete_banned_members
                    .push(params.encrypt_service_id(&ServiceId::Aci(aci))?);
            }
        }

        if self.should_revoke_invalid_invites {
            if membership.invalid_invites().is_empty() {
                // Someone else already revoked them. Redundant.
                log::info!("No invalid invites left to revoke");
            }
            for user_id_ciphertext in membership.invalid_invites().keys() {
                actions.delete_pending_members.push(user_id_ciphertext.clone());
            }
        }

        for (aci, new_role) in &self.members_to_change_role {
            let service_id = ServiceId::Aci(*aci);
            if !membership.is_full_member(&service_id) {
                // The target was removed concurrently. This intent cannot be
                // reinterpreted; the whole batch aborts.
                return Err(GroupsError::ConflictingRoleChange);
            }
            if membership.role_of(&service_id) == Some(*new_role) {
                // Another writer already made this change. Redundant.
                continue;
            }
            actions.modify_member_roles.push(ModifyRoleActionWire {
                user_id: params.encrypt_service_id(&service_id)?,
                role: new_role.to_wire(),
            });
        }

        if let Some(access) = self.access_for_members {
            if access != current.access.members {
                actions.modify_members_access = Some(access.to_wire());
            }
        }
        if let Some(access) = self.access_for_attributes {
            if access != current.access.attributes {
                actions.modify_attributes_access = Some(access.to_wire());
            }
        }

        let mut access_for_link = self.access_for_add_from_invite_link;
        if self.should_leave_group_decline_invite
            && membership.all_members_count() == 1
            && membership.is_full_member_and_administrator(&ServiceId::Aci(local_aci))
        {
            // The last administrator is leaving: close the invite link.
            access_for_link = Some(AccessLevel::Unsatisfiable);
        }
        if let Some(access) = access_for_link {
            if access != current.access.add_from_invite_link {
                actions.modify_add_from_invite_link_access = Some(access.to_wire());
            }
        }

        if self.should_accept_invite {
            let credential = valid_credential(&local_aci)
                .ok_or(GroupsError::MissingLocalCredential)?;
            let local_id = ServiceId::Aci(local_aci);
            let invited_by_aci = membership.is_invited_member(&local_id);
            let invited_by_pni = local
                .pni
                .map(|pni| membership.is_invited_member(&ServiceId::Pni(pni)))
                .unwrap_or(false);

            if invited_by_aci {
                if invited_by_pni {
                    log::warn!("Invited under both identities; accepting by the primary");
                }
                actions.promote_pending_members.push(PromotePendingMemberActionWire {
                    user_id: params.encrypt_service_id(&local_id)?,
                    profile_key: params
                        .encrypt_profile_key(&credential.profile_key, &local_aci)?,
                });
            } else if invited_by_pni {
                let pni = local.pni.ok_or(GroupsError::ConflictingChange)?;
                actions.promote_pni_pending_members.push(PromotePniPendingMemberActionWire {
                    aci_user_id: params.encrypt_service_id(&local_id)?,
                    pni_user_id: params.encrypt_service_id(&ServiceId::Pni(pni))?,
                    profile_key: params
                        .encrypt_profile_key(&credential.profile_key, &local_aci)?,
                });
            } else if membership.is_full_member(&local_id) {
                log::warn!("Accepting an invite but already a full member");
            } else {
                // Neither invited nor a member; the invite was revoked.
                return Err(GroupsError::ConflictingChange);
            }
        }

        if self.should_leave_group_decline_invite {
            if let Some(invited_at) = membership.local_user_invited_at(local) {
                if matches!(invited_at, ServiceId::Pni(_)) {
                    // Messages cannot come from the secondary identity
                    // without linking it to the primary one.
                    notification = NotificationBehavior::SendNothing;
                }
                actions.delete_pending_members.push(params.encrypt_service_id(&invited_at)?);
            } else if membership.is_full_member(&ServiceId::Aci(local_aci)) {
                actions
                    .delete_members
                    .push(params.encrypt_service_id(&ServiceId::Aci(local_aci))?);
            } else {
                // Already out of the group. Redundant.
            }
        }

        if let Some(new_timer) = &self.new_timer {
            if *new_timer != current.timer {
                actions.modify_timer = Some(params.encrypt_timer(new_timer)?);
            }
        }

        if let Some(announcements_only) = self.is_announcements_only {
            if announcements_only != current.is_announcements_only {
                actions.modify_announcements_only = Some(announcements_only);
            }
        }

        if self.should_update_local_profile_key {
            let credential = valid_credential(&local_aci)
                .ok_or(GroupsError::MissingLocalCredential)?;
            actions.modify_member_profile_keys.push(ModifyProfileKeyActionWire {
                user_id: params.encrypt_service_id(&ServiceId::Aci(local_aci))?,
                profile_key: params.encrypt_profile_key(&credential.profile_key, &local_aci)?,
            });
        }

        if actions.is_empty() {
            return Ok(None);
        }

        log::info!("Built group change at revision {}", new_revision);
        Ok(Some(BuiltGroupChange { actions, notification }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// Stateless translation between the wire format and the domain model.
///
/// Parsing is lenient where the data is sealed: an entry whose identity or
/// field fails to decrypt is logged and treated as absent (or carried as an
/// invalid invite), never a fatal error. Building is strict: we only build
/// from state we fully understand.

use std::collections::BTreeMap;

use crate::error::GroupsError;
use crate::crypto::GroupParams;
use crate::groups::access::{AccessLevel, GroupAccess};
use crate::groups::change::{AppliedChange, DownloadedAvatars, GroupChange, GroupSnapshot};
use crate::groups::ids::{Aci, LocalIdentifiers, ProfileKey, ServiceId};
use crate::groups::membership::{GroupMembershipBuilder, MemberState, Role};
use crate::groups::model::{GroupModel, GroupModelOptions, TimerToken};
use crate::store::{GroupSendEndorsement, SendEndorsementRecords};
use crate::wire::{
    GroupChangeActions, GroupChangeEntryWire, GroupSnapshotWire, MemberWire, PendingMemberWire,
    RequestingMemberWire, SendEndorsementsWire,
};

// ---------------------------------------------------------------------------
// Snapshot parsing
// ---------------------------------------------------------------------------

/// Decrypt a server snapshot into domain state. Malformed entries are
/// skipped with a warning; undecryptable invites are carried as invalid
/// invites so they can still be revoked.
pub fn parse_snapshot(wire: &GroupSnapshotWire, params: &GroupParams) -> GroupSnapshot {
    let mut builder = GroupMembershipBuilder::new();
    let mut profile_keys = BTreeMap::new();

    for member in &wire.members {
        let Ok(service_id) = params.decrypt_service_id(&member.user_id) else {
            log::warn!("Skipping member with undecryptable id");
            continue;
        };
        let role = Role::from_wire(member.role).unwrap_or_else(|| {
            log::warn!("Member with invalid role {}, assuming normal", member.role);
            Role::Normal
        });
        builder.add_full_member(service_id, role);
        record_profile_key(&mut profile_keys, params, &service_id, &member.profile_key);
    }

    for pending in &wire.pending_members {
        let added_by = params
            .decrypt_service_id(&pending.added_by_user_id)
            .ok()
            .and_then(|id| id.aci());
        match (params.decrypt_service_id(&pending.user_id), added_by) {
            (Ok(service_id), Some(added_by)) => {
                let role = Role::from_wire(pending.role).unwrap_or(Role::Normal);
                builder.add_invited_member(service_id, role, added_by);
            }
            _ => {
                log::warn!("Carrying undecryptable invite as invalid");
                builder.add_invalid_invite(
                    pending.user_id.clone(),
                    pending.added_by_user_id.clone(),
                );
            }
        }
    }

    for requesting in &wire.requesting_members {
        match params.decrypt_service_id(&requesting.user_id) {
            Ok(ServiceId::Aci(aci)) => {
                builder.add_requesting_member(aci);
                record_profile_key(
                    &mut profile_keys,
                    params,
                    &ServiceId::Aci(aci),
                    &requesting.profile_key,
                );
            }
            _ => log::warn!("Skipping requesting member with undecryptable id"),
        }
    }

    for banned in &wire.banned_members {
        match params.decrypt_service_id(&banned.user_id) {
            Ok(ServiceId::Aci(aci)) => {
                if let Err(e) = builder.add_banned_member(aci, banned.banned_at_ms as i64) {
                    log::warn!("Skipping banned entry: {}", e);
                }
            }
            _ => log::warn!("Skipping banned member with undecryptable id"),
        }
    }

    GroupSnapshot {
        revision: wire.revision,
        title: decrypt_title_field(params, &wire.title),
        description: decrypt_description_field(params, &wire.description),
        avatar_url_path: wire.avatar_url_path.clone(),
        membership: builder.build(),
        access: parse_access(&wire.access),
        invite_link_password: optional_bytes(&wire.invite_link_password),
        is_announcements_only: wire.is_announcements_only,
        timer: decrypt_timer_field(params, &wire.timer),
        profile_keys,
    }
}

/// Build a local model from a parsed snapshot.
pub fn model_from_snapshot(
    snapshot: &GroupSnapshot,
    params: &GroupParams,
    avatars: &DownloadedAvatars,
    options: &GroupModelOptions,
) -> GroupModel {
    let avatar_data = snapshot
        .avatar_url_path
        .as_deref()
        .and_then(|path| avatars.get(path).cloned());
    let mut model = GroupModel {
        revision: snapshot.revision,
        title: snapshot.title.clone(),
        description: snapshot.description.clone(),
        avatar_url_path: snapshot.avatar_url_path.clone(),
        avatar_data,
        membership: snapshot.membership.clone(),
        access: snapshot.access,
        invite_link_password: snapshot.invite_link_password.clone(),
        is_announcements_only: snapshot.is_announcements_only,
        timer: snapshot.timer,
        params: params.clone(),
        is_join_request_placeholder: false,
        did_just_add_self_via_group_link: false,
    };
    model.apply_options(options);
    model
}

/// Parse one change-log entry: decode the snapshot half (if present) and
/// validate that at least one half exists.
pub fn parse_change_entry(
    entry: &GroupChangeEntryWire,
    params: &GroupParams,
) -> Result<GroupChange, GroupsError> {
    let snapshot = entry
        .snapshot
        .as_ref()
        .map(|wire| parse_snapshot(wire, params));
    GroupChange::new(entry.actions.clone(), snapshot)
}

// ---------------------------------------------------------------------------
// Applying authored deltas
// ---------------------------------------------------------------------------

/// Apply an authored delta to a model. The delta must be the immediate next
/// revision; anything else cannot be applied incrementally.
pub fn apply_change_actions(
    old: &GroupModel,
    actions: &GroupChangeActions,
    avatars: &DownloadedAvatars,
    local: &LocalIdentifiers,
) -> Result<AppliedChange, GroupsError> {
    if actions.revision != old.revision.wrapping_add(1) || old.revision == u32::MAX {
        return Err(GroupsError::IncompatibleRevision);
    }

    let params = &old.params;
    let mut builder = old.membership.to_builder();
    let mut profile_keys = BTreeMap::new();
    let mut newly_learned = Vec::new();

    // Adds and promotions.
    for add in &actions.add_members {
        let Ok(service_id) = params.decrypt_service_id(&add.member.user_id) else {
            log::warn!("Skipping added member with undecryptable id");
            continue;
        };
        let role = Role::from_wire(add.member.role).unwrap_or(Role::Normal);
        builder.remove_member(&service_id);
        builder.add_full_member_with_provenance(
            service_id,
            role,
            add.join_from_invite_link,
            false,
        );
        record_profile_key(&mut profile_keys, params, &service_id, &add.member.profile_key);
    }

    for promote in &actions.promote_pending_members {
        let Ok(service_id) = params.decrypt_service_id(&promote.user_id) else {
            log::warn!("Skipping promoted invite with undecryptable id");
            continue;
        };
        builder.remove_member(&service_id);
        builder.add_full_member(service_id, Role::Normal);
        record_profile_key(&mut profile_keys, params, &service_id, &promote.profile_key);
    }

    for promote in &actions.promote_pni_pending_members {
        let aci = params
            .decrypt_service_id(&promote.aci_user_id)
            .ok()
            .and_then(|id| id.aci());
        let pni = params
            .decrypt_service_id(&promote.pni_user_id)
            .ok()
            .and_then(|id| id.pni());
        let (Some(aci), Some(pni)) = (aci, pni) else {
            log::warn!("Skipping secondary-identity promotion with undecryptable ids");
            continue;
        };
        builder.remove_member(&ServiceId::Pni(pni));
        builder.remove_member(&ServiceId::Aci(aci));
        builder.add_full_member(ServiceId::Aci(aci), Role::Normal);
        newly_learned.push((pni, aci));
        record_profile_key(&mut profile_keys, params, &ServiceId::Aci(aci), &promote.profile_key);
    }

    for promote in &actions.promote_requesting_members {
        match params.decrypt_service_id(&promote.user_id) {
            Ok(ServiceId::Aci(aci)) => {
                let role = Role::from_wire(promote.role).unwrap_or(Role::Normal);
                builder.remove_member(&ServiceId::Aci(aci));
                builder.add_full_member_with_provenance(ServiceId::Aci(aci), role, false, true);
            }
            _ => log::warn!("Skipping promoted join request with undecryptable id"),
        }
    }

    for pending in &actions.add_pending_members {
        let added_by = params
            .decrypt_service_id(&pending.added_by_user_id)
            .ok()
            .and_then(|id| id.aci());
        match (params.decrypt_service_id(&pending.user_id), added_by) {
            (Ok(service_id), Some(added_by)) => {
                let role = Role::from_wire(pending.role).unwrap_or(Role::Normal);
                builder.add_invited_member(service_id, role, added_by);
            }
            _ => builder.add_invalid_invite(
                pending.user_id.clone(),
                pending.added_by_user_id.clone(),
            ),
        }
    }

    for requesting in &actions.add_requesting_members {
        match params.decrypt_service_id(&requesting.user_id) {
            Ok(ServiceId::Aci(aci)) => {
                builder.add_requesting_member(aci);
                record_profile_key(
                    &mut profile_keys,
                    params,
                    &ServiceId::Aci(aci),
                    &requesting.profile_key,
                );
            }
            _ => log::warn!("Skipping join request with undecryptable id"),
        }
    }

    // Removals.
    for deleted in &actions.delete_members {
        match params.decrypt_service_id(deleted) {
            Ok(service_id) => {
                builder.remove_member(&service_id);
            }
            Err(_) => log::warn!("Skipping member removal with undecryptable id"),
        }
    }

    for deleted in &actions.delete_pending_members {
        match params.decrypt_service_id(deleted) {
            Ok(service_id) => {
                builder.remove_member(&service_id);
            }
            Err(_) => {
                // Revocation of an invite we never managed to decrypt.
                builder.remove_invalid_invite(deleted);
            }
        }
    }

    for deleted in &actions.delete_requesting_members {
        match params.decrypt_service_id(deleted) {
            Ok(service_id) => {
                builder.remove_member(&service_id);
            }
            Err(_) => log::warn!("Skipping join-request removal with undecryptable id"),
        }
    }

    // Role changes.
    for modify in &actions.modify_member_roles {
        let Ok(service_id) = params.decrypt_service_id(&modify.user_id) else {
            log::warn!("Skipping role change with undecryptable id");
            continue;
        };
        match Role::from_wire(modify.role) {
            Some(role) => {
                if !builder.change_role(&service_id, role) {
                    log::warn!("Role change for a non-member, ignoring");
                }
            }
            None => log::warn!("Role change with invalid role {}", modify.role),
        }
    }

    // Profile key updates.
    for modify in &actions.modify_member_profile_keys {
        if let Ok(service_id) = params.decrypt_service_id(&modify.user_id) {
            record_profile_key(&mut profile_keys, params, &service_id, &modify.profile_key);
        }
    }

    // Ban-list changes, after removals so the disjointness holds.
    for deleted in &actions.delete_banned_members {
        match params.decrypt_service_id(deleted) {
            Ok(ServiceId::Aci(aci)) => {
                builder.remove_banned_member(&aci);
            }
            _ => log::warn!("Skipping unban with undecryptable id"),
        }
    }

    for banned in &actions.add_banned_members {
        match params.decrypt_service_id(&banned.user_id) {
            Ok(ServiceId::Aci(aci)) => {
                if let Err(e) = builder.add_banned_member(aci, banned.banned_at_ms as i64) {
                    log::warn!("Skipping ban: {}", e);
                }
            }
            _ => log::warn!("Skipping ban with undecryptable id"),
        }
    }

    // Attribute changes.
    let mut new_model = old.clone();
    new_model.revision = actions.revision;
    new_model.membership = builder.build();

    if let Some(sealed) = &actions.modify_title {
        new_model.title = decrypt_title_field(params, sealed);
    }
    if let Some(sealed) = &actions.modify_description {
        new_model.description = decrypt_description_field(params, sealed);
    }
    if let Some(avatar) = &actions.modify_avatar {
        new_model.avatar_url_path = avatar.clone();
        new_model.avatar_data = avatar
            .as_deref()
            .and_then(|path| avatars.get(path).cloned());
    }
    if let Some(sealed) = &actions.modify_timer {
        new_model.timer = decrypt_timer_field(params, sealed);
    }
    if let Some(value) = actions.modify_members_access {
        new_model.access.members = AccessLevel::members_axis_from_wire(value);
    }
    if let Some(value) = actions.modify_attributes_access {
        new_model.access.attributes = AccessLevel::members_axis_from_wire(value);
    }
    if let Some(value) = actions.modify_add_from_invite_link_access {
        new_model.access.add_from_invite_link = AccessLevel::invite_link_axis_from_wire(value);
    }
    if let Some(value) = actions.modify_announcements_only {
        new_model.is_announcements_only = value;
    }
    if let Some(password) = &actions.modify_invite_link_password {
        new_model.invite_link_password = optional_bytes(password);
    }

    let was_local_user_added = actions_added_local_user(actions, params, local);

    Ok(AppliedChange {
        new_model,
        profile_keys,
        update_source: update_source(actions, params),
        newly_learned_pni_to_aci: newly_learned,
        was_local_user_added,
    })
}

/// Establish the author of a delta. A secondary-identity author is only
/// meaningful for the two actions a secondary identity can take: declining
/// its own invite, or being promoted alongside its primary identity.
pub fn update_source(actions: &GroupChangeActions, params: &GroupParams) -> Option<ServiceId> {
    if actions.source_user_id.is_empty() {
        return None;
    }
    let source = match params.decrypt_service_id(&actions.source_user_id) {
        Ok(source) => source,
        Err(_) => {
            log::warn!("Undecryptable change author");
            return None;
        }
    };
    match source {
        ServiceId::Aci(_) => Some(source),
        ServiceId::Pni(pni) => {
            if actions.delete_pending_members.len() == 1 {
                let deleted = &actions.delete_pending_members[0];
                if params.decrypt_service_id(deleted).ok() == Some(ServiceId::Pni(pni)) {
                    // The identity declined its own invite.
                    return Some(ServiceId::Pni(pni));
                }
            }
            if actions.promote_pni_pending_members.len() == 1 {
                let promote = &actions.promote_pni_pending_members[0];
                let promoted_pni = params
                    .decrypt_service_id(&promote.pni_user_id)
                    .ok()
                    .and_then(|id| id.pni());
                if promoted_pni == Some(pni) {
                    // Attribute the change to the primary identity we just
                    // learned about.
                    return params
                        .decrypt_service_id(&promote.aci_user_id)
                        .ok()
                        .filter(|id| id.is_primary());
                }
            }
            log::warn!("Unrecognized secondary-identity-authored change");
            None
        }
    }
}

/// Whether a change-log entry added the local user. Revision 0 is the
/// group's creation and has no add actions for the founding membership.
pub fn was_local_user_added(
    change: &GroupChange,
    params: &GroupParams,
    local: &LocalIdentifiers,
) -> bool {
    if change.revision == 0 {
        return true;
    }
    match &change.actions {
        Some(actions) => actions_added_local_user(actions, params, local),
        None => false,
    }
}

fn actions_added_local_user(
    actions: &GroupChangeActions,
    params: &GroupParams,
    local: &LocalIdentifiers,
) -> bool {
    let local_id = ServiceId::Aci(local.aci);
    let decrypts_to_local =
        |sealed: &[u8]| params.decrypt_service_id(sealed).ok() == Some(local_id);

    actions
        .add_members
        .iter()
        .any(|add| decrypts_to_local(&add.member.user_id))
        || actions
            .promote_pending_members
            .iter()
            .any(|promote| decrypts_to_local(&promote.user_id))
        || actions
            .promote_pni_pending_members
            .iter()
            .any(|promote| decrypts_to_local(&promote.aci_user_id))
        || actions
            .promote_requesting_members
            .iter()
            .any(|promote| decrypts_to_local(&promote.user_id))
}

// ---------------------------------------------------------------------------
// Building wire state
// ---------------------------------------------------------------------------

/// Build the wire form of a model, for group creation and for serving
/// snapshots in tests. Members without a known profile key get an empty
/// profile-key field.
pub fn build_snapshot_wire(
    model: &GroupModel,
    profile_keys: &BTreeMap<Aci, ProfileKey>,
) -> Result<GroupSnapshotWire, GroupsError> {
    let params = &model.params;
    let mut wire = GroupSnapshotWire {
        revision: model.revision,
        title: if model.title.is_empty() {
            Vec::new()
        } else {
            params.encrypt_title(&model.title)?
        },
        description: match &model.description {
            Some(description) => params.encrypt_description(description)?,
            None => Vec::new(),
        },
        avatar_url_path: model.avatar_url_path.clone(),
        timer: params.encrypt_timer(&model.timer)?,
        access: crate::wire::AccessControlWire {
            members: model.access.members.to_wire(),
            attributes: model.access.attributes.to_wire(),
            add_from_invite_link: model.access.add_from_invite_link.to_wire(),
        },
        members: Vec::new(),
        pending_members: Vec::new(),
        requesting_members: Vec::new(),
        banned_members: Vec::new(),
        invite_link_password: model.invite_link_password.clone().unwrap_or_default(),
        is_announcements_only: model.is_announcements_only,
    };

    for id in model.membership.full_members() {
        let role = model.membership.role_of(&id).unwrap_or(Role::Normal);
        wire.members.push(MemberWire {
            user_id: params.encrypt_service_id(&id)?,
            role: role.to_wire(),
            profile_key: encrypt_known_profile_key(params, profile_keys, &id)?,
            joined_at_revision: model.revision,
        });
    }

    for id in model.membership.invited_members() {
        let Some(MemberState::Invited { role, added_by }) = model.membership.member_state(&id)
        else {
            continue;
        };
        wire.pending_members.push(PendingMemberWire {
            user_id: params.encrypt_service_id(&id)?,
            role: role.to_wire(),
            added_by_user_id: params.encrypt_service_id(&ServiceId::Aci(*added_by))?,
            timestamp_ms: 0,
        });
    }

    for aci in model.membership.requesting_members() {
        wire.requesting_members.push(RequestingMemberWire {
            user_id: params.encrypt_service_id(&ServiceId::Aci(aci))?,
            profile_key: encrypt_known_profile_key(params, profile_keys, &ServiceId::Aci(aci))?,
            timestamp_ms: 0,
        });
    }

    for (aci, banned_at_ms) in model.membership.banned_members() {
        wire.banned_members.push(crate::wire::BannedMemberWire {
            user_id: params.encrypt_service_id(&ServiceId::Aci(*aci))?,
            banned_at_ms: *banned_at_ms as u64,
        });
    }

    Ok(wire)
}

// ---------------------------------------------------------------------------
// Endorsements
// ---------------------------------------------------------------------------

pub fn parse_endorsements(
    wire: &SendEndorsementsWire,
    params: &GroupParams,
) -> SendEndorsementRecords {
    let mut per_member = BTreeMap::new();
    for (sealed_id, token) in &wire.per_member {
        match params.decrypt_service_id(sealed_id) {
            Ok(service_id) => {
                per_member.insert(
                    service_id,
                    GroupSendEndorsement {
                        token: token.clone(),
                        expiration_ms: wire.expiration_ms,
                    },
                );
            }
            Err(_) => log::warn!("Skipping endorsement with undecryptable member id"),
        }
    }
    SendEndorsementRecords {
        combined: GroupSendEndorsement {
            token: wire.combined.clone(),
            expiration_ms: wire.expiration_ms,
        },
        per_member,
    }
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn optional_bytes(bytes: &[u8]) -> Option<Vec<u8>> {
    if bytes.is_empty() {
        None
    } else {
        Some(bytes.to_vec())
    }
}

fn decrypt_title_field(params: &GroupParams, sealed: &[u8]) -> String {
    if sealed.is_empty() {
        return String::new();
    }
    match params.decrypt_title(sealed) {
        Ok(title) => title,
        Err(_) => {
            log::warn!("Undecryptable title, treating as absent");
            String::new()
        }
    }
}

fn decrypt_description_field(params: &GroupParams, sealed: &[u8]) -> Option<String> {
    if sealed.is_empty() {
        return None;
    }
    match params.decrypt_description(sealed) {
        Ok(description) if description.is_empty() => None,
        Ok(description) => Some(description),
        Err(_) => {
            log::warn!("Undecryptable description, treating as absent");
            None
        }
    }
}

fn decrypt_timer_field(params: &GroupParams, sealed: &[u8]) -> TimerToken {
    if sealed.is_empty() {
        return TimerToken::disabled();
    }
    match params.decrypt_timer(sealed) {
        Ok(timer) => timer,
        Err(_) => {
            log::warn!("Undecryptable timer, treating as disabled");
            TimerToken::disabled()
        }
    }
}

fn parse_access(wire: &crate::wire::AccessControlWire) -> GroupAccess {
    GroupAccess {
        members: AccessLevel::members_axis_from_wire(wire.members),
        attributes: AccessLevel::members_axis_from_wire(wire.attributes),
        add_from_invite_link: AccessLevel::invite_link_axis_from_wire(wire.add_from_invite_link),
    }
}

fn record_profile_key(
    profile_keys: &mut BTreeMap<Aci, ProfileKey>,
    params: &GroupParams,
    service_id: &ServiceId,
    sealed: &[u8],
) {
    let Some(aci) = service_id.aci() else {
        return;
    };
    if sealed.is_empty() {
        return;
    }
    match params.decrypt_profile_key(sealed, &aci) {
        Ok(profile_key) => {
            profile_keys.insert(aci, profile_key);
        }
        Err(_) => log::warn!("Undecryptable profile key for {:?}", aci),
    }
}

fn encrypt_known_profile_key(
    params: &GroupParams,
    profile_keys: &BTreeMap<Aci, ProfileKey>,
    service_id: &ServiceId,
) -> Result<Vec<u8>, GroupsError> {
    match service_id.aci().and_then(|aci| profile_keys.get(&aci).map(|pk| (aci, *pk))) {
        Some((aci, profile_key)) => Ok(params.encrypt_profile_key(&profile_key, &aci)?),
        None => Ok(Vec::new()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// Invite links and the join-request building blocks.
///
/// A link carries the group master key and the invite password:
/// `https://signal.group/#<base64url(contents)>`. From the preview behind a
/// link, a join submission is either a direct add (open link) or a join
/// request (approval required); a requesting member that cannot fetch group
/// state gets a locally synthesized placeholder model instead.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use subtle::ConstantTimeEq;

use crate::crypto::GroupParams;
use crate::error::GroupsError;
use crate::groups::access::AccessLevel;
use crate::groups::ids::{GroupMasterKey, LocalIdentifiers, ProfileKeyCredential, ServiceId};
use crate::groups::membership::{GroupMembershipBuilder, Role};
use crate::groups::model::{GroupModel, TimerToken};
use crate::wire;
use crate::wire::{
    AddMemberActionWire, GroupChangeActions, GroupInviteLinkContentsWire,
    GroupInviteLinkPreviewWire, MemberWire, RequestingMemberWire,
};

pub const INVITE_LINK_PREFIX: &str = "https://signal.group/#";

// ---------------------------------------------------------------------------
// Preview
// ---------------------------------------------------------------------------

/// What a non-member can learn about a group from its invite link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupInviteLinkPreview {
    pub title: String,
    pub description: Option<String>,
    pub avatar_url_path: Option<String>,
    pub member_count: u32,
    pub add_from_invite_link_access: AccessLevel,
    pub revision: u32,
    pub is_local_user_requesting_member: bool,
}

pub(crate) fn parse_invite_link_preview(
    wire: &GroupInviteLinkPreviewWire,
    params: &GroupParams,
) -> GroupInviteLinkPreview {
    let title = if wire.title.is_empty() {
        String::new()
    } else {
        params.decrypt_title(&wire.title).unwrap_or_else(|_| {
            log::warn!("Undecryptable preview title");
            String::new()
        })
    };
    let description = if wire.description.is_empty() {
        None
    } else {
        params.decrypt_description(&wire.description).ok().filter(|d| !d.is_empty())
    };
    GroupInviteLinkPreview {
        title,
        description,
        avatar_url_path: wire.avatar_url_path.clone(),
        member_count: wire.member_count,
        add_from_invite_link_access: AccessLevel::invite_link_axis_from_wire(
            wire.add_from_invite_link_access,
        ),
        revision: wire.revision,
        is_local_user_requesting_member: wire.is_local_user_requesting_member,
    }
}

// ---------------------------------------------------------------------------
// Link encode/parse
// ---------------------------------------------------------------------------

pub fn build_invite_link(
    master_key: &GroupMasterKey,
    invite_password: &[u8],
) -> Result<String, GroupsError> {
    let contents = GroupInviteLinkContentsWire {
        master_key: *master_key.as_bytes(),
        invite_password: invite_password.to_vec(),
    };
    let encoded = URL_SAFE_NO_PAD.encode(wire::encode(&contents)?);
    Ok(format!("{}{}", INVITE_LINK_PREFIX, encoded))
}

pub fn parse_invite_link(link: &str) -> Result<(GroupMasterKey, Vec<u8>), GroupsError> {
    let fragment = link
        .strip_prefix(INVITE_LINK_PREFIX)
        .ok_or(GroupsError::ExpiredInviteLink)?;
    let bytes = URL_SAFE_NO_PAD
        .decode(fragment)
        .map_err(|_| GroupsError::ExpiredInviteLink)?;
    let contents: GroupInviteLinkContentsWire =
        wire::decode(&bytes).map_err(|_| GroupsError::ExpiredInviteLink)?;
    if contents.invite_password.is_empty() {
        return Err(GroupsError::ExpiredInviteLink);
    }
    Ok((
        GroupMasterKey::from_bytes(contents.master_key),
        contents.invite_password,
    ))
}

/// Constant-time invite password comparison.
pub fn invite_password_matches(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

// ---------------------------------------------------------------------------
// Join submissions
// ---------------------------------------------------------------------------

/// Build the delta that joins via the link, pinned at the revision right
/// after the preview. Open links add us outright; approval-gated links file
/// a join request.
pub(crate) fn build_join_change_actions(
    preview: &GroupInviteLinkPreview,
    params: &GroupParams,
    local: &LocalIdentifiers,
    credential: &ProfileKeyCredential,
    now_ms: i64,
) -> Result<(GroupChangeActions, u32), GroupsError> {
    let revision = preview.revision.wrapping_add(1);
    let local_id = ServiceId::Aci(local.aci);
    let mut actions = GroupChangeActions { revision, ..Default::default() };

    match preview.add_from_invite_link_access {
        AccessLevel::Any => {
            actions.add_members.push(AddMemberActionWire {
                member: MemberWire {
                    user_id: params.encrypt_service_id(&local_id)?,
                    role: Role::Normal.to_wire(),
                    profile_key: params
                        .encrypt_profile_key(&credential.profile_key, &local.aci)?,
                    joined_at_revision: revision,
                },
                join_from_invite_link: true,
            });
        }
        AccessLevel::Administrator => {
            actions.add_requesting_members.push(RequestingMemberWire {
                user_id: params.encrypt_service_id(&local_id)?,
                profile_key: params.encrypt_profile_key(&credential.profile_key, &local.aci)?,
                timestamp_ms: now_ms as u64,
            });
        }
        _ => return Err(GroupsError::ExpiredInviteLink),
    }
    Ok((actions, revision))
}

/// Build the delta that withdraws the local user's join request.
pub(crate) fn build_cancel_request_actions(
    revision: u32,
    params: &GroupParams,
    local: &LocalIdentifiers,
) -> Result<GroupChangeActions, GroupsError> {
    Ok(GroupChangeActions {
        revision,
        delete_requesting_members: vec![params.encrypt_service_id(&ServiceId::Aci(local.aci))?],
        ..Default::default()
    })
}

/// Synthesize the local placeholder for a submitted join request. We are a
/// requesting member at `revision`, and everything else we know comes from
/// the preview; the server will not show us more until we are approved.
pub(crate) fn synthesize_placeholder_model(
    params: &GroupParams,
    preview: &GroupInviteLinkPreview,
    revision: u32,
    local: &LocalIdentifiers,
) -> GroupModel {
    let mut builder = GroupMembershipBuilder::new();
    builder.add_requesting_member(local.aci);

    let mut model = GroupModel::empty(params.clone());
    model.revision = revision;
    model.title = preview.title.clone();
    model.description = preview.description.clone();
    model.avatar_url_path = preview.avatar_url_path.clone();
    model.membership = builder.build();
    model.access.add_from_invite_link = preview.add_from_invite_link_access;
    model.timer = TimerToken::disabled();
    model.is_join_request_placeholder = true;
    model
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// Write façade: the single entry point for every mutation intent.
///
/// Execution is serialized per group through a lazily created registry of
/// single-concurrency queues, and each whole attempt runs under a domain
/// timeout distinct from transport timeouts. On success the new model is
/// persisted, the diff is classified as user-facing or not, and outbound
/// fan-out is scheduled to current and newly removed members. A proposal
/// that resolves to "nothing to do" is success, not an error.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use crate::crypto::{GroupParams, GroupSecretParams};
use crate::error::GroupsError;
use crate::events::GroupEvent;
use crate::groups::access::AccessLevel;
use crate::groups::change::DownloadedAvatars;
use crate::groups::ids::{GroupIdentifier, GroupMasterKey, ServiceId};
use crate::groups::membership::{GroupMembershipBuilder, Role};
use crate::groups::model::{GroupModel, GroupModelOptions, TimerToken};
use crate::limits::{GROUP_UPDATE_TIMEOUT, MAX_TITLE_BYTES};
use crate::outgoing::{NotificationBehavior, OutgoingChanges};
use crate::refresh::{GroupUpdateMode, RefreshOrchestrator};
use crate::service::invite_link;
use crate::service::transport::{Behavior403, GroupTransport};
use crate::service::GroupGateway;
use crate::store::GroupStore;
use crate::wire;
use crate::wire::translate;

// ---------------------------------------------------------------------------
// Outbound delivery contract
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NoticeRecipients {
    /// All current members of the group.
    AllMembers,
    /// Users this very update removed; they will not see further group
    /// traffic, so they get a final targeted notice.
    RemovedMembers(Vec<ServiceId>),
}

/// A prepared group-update notification handed to the application's
/// delivery pipeline for durable async send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupUpdateNotice {
    pub group_id: GroupIdentifier,
    pub revision: u32,
    /// The authored delta, when one exists (creations and placeholder
    /// states have none).
    pub change_actions: Option<Vec<u8>>,
    pub recipients: NoticeRecipients,
}

pub trait OutboundDelivery: Send + Sync {
    fn enqueue_group_update(&self, notice: GroupUpdateNotice);
}

/// Reference delivery sink; also the test double.
#[derive(Default)]
pub struct MemoryOutbox {
    notices: StdMutex<Vec<GroupUpdateNotice>>,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        MemoryOutbox::default()
    }

    pub fn notices(&self) -> Vec<GroupUpdateNotice> {
        self.notices.lock().map(|n| n.clone()).unwrap_or_default()
    }
}

impl OutboundDelivery for MemoryOutbox {
    fn enqueue_group_update(&self, notice: GroupUpdateNotice) {
        if let Ok(mut notices) = self.notices.lock() {
            notices.push(notice);
        }
    }
}

// ---------------------------------------------------------------------------
// Updater
// ---------------------------------------------------------------------------

pub struct GroupUpdater<T: GroupTransport> {
    gateway: Arc<GroupGateway<T>>,
    refresh: Arc<RefreshOrchestrator<T>>,
    delivery: Arc<dyn OutboundDelivery>,
    /// Per-group single-concurrency executors; created lazily, retained for
    /// the life of the process.
    group_queues: StdMutex<HashMap<GroupIdentifier, Arc<tokio::sync::Mutex<()>>>>,
}

impl<T: GroupTransport> GroupUpdater<T> {
    pub fn new(
        gateway: Arc<GroupGateway<T>>,
        refresh: Arc<RefreshOrchestrator<T>>,
        delivery: Arc<dyn OutboundDelivery>,
    ) -> Self {
        GroupUpdater {
            gateway,
            refresh,
            delivery,
            group_queues: StdMutex::new(HashMap::new()),
        }
    }

    fn group_queue(&self, group_id: &GroupIdentifier) -> Arc<tokio::sync::Mutex<()>> {
        let mut queues = match self.group_queues.lock() {
            Ok(queues) => queues,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(
            queues
                .entry(*group_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    // -----------------------------------------------------------------------
    // Group creation
    // -----------------------------------------------------------------------

    /// Create a new group with the local user as administrator. Members
    /// with a profile key credential become full members; everyone else is
    /// invited.
    pub async fn create_new_group(
        &self,
        title: &str,
        members: Vec<ServiceId>,
        timer: TimerToken,
    ) -> Result<GroupModel, GroupsError> {
        if title.is_empty() || title.len() > MAX_TITLE_BYTES {
            return Err(GroupsError::AttributeTooLong);
        }
        let account = self.gateway.account().clone();
        let local = account.identifiers;
        let now_ms = Self::now_ms();
        let params = GroupParams::new(GroupSecretParams::generate());

        let mut acis: Vec<_> = members.iter().filter_map(ServiceId::aci).collect();
        acis.push(local.aci);
        let mut credentials = self
            .gateway
            .load_profile_key_credentials(acis.clone(), false, now_ms)
            .await?;

        let mut force_refresh_used = false;
        loop {
            let mut builder = GroupMembershipBuilder::new();
            builder.add_full_member(ServiceId::Aci(local.aci), Role::Administrator);
            let mut profile_keys = std::collections::BTreeMap::new();
            profile_keys.insert(local.aci, account.profile_key);

            for member in &members {
                if local.contains(member) {
                    continue;
                }
                match member.aci().and_then(|aci| credentials.get(&aci)) {
                    Some(credential) => {
                        builder.add_full_member(*member, Role::Normal);
                        profile_keys.insert(credential.aci, credential.profile_key);
                    }
                    None => builder.add_invited_member(*member, Role::Normal, local.aci),
                }
            }

            let mut model = GroupModel::empty(params.clone());
            model.title = title.to_string();
            model.timer = timer;
            model.membership = builder.build();

            let snapshot = translate::build_snapshot_wire(&model, &profile_keys)?;
            match self.gateway.create_group(&snapshot).await {
                Ok(()) => {
                    self.gateway.store().upsert_group(&model);
                    self.gateway.events().emit(GroupEvent::UpdatedToRevision {
                        group_id: model.group_id(),
                        revision: 0,
                        user_facing: true,
                    });
                    self.delivery.enqueue_group_update(GroupUpdateNotice {
                        group_id: model.group_id(),
                        revision: 0,
                        change_actions: None,
                        recipients: NoticeRecipients::AllMembers,
                    });
                    return Ok(model);
                }
                Err(GroupsError::Recoverable400) if !force_refresh_used => {
                    // Credentials may have gone stale between issuance and
                    // submission; refresh them once and resubmit.
                    log::warn!("Group creation rejected; refreshing credentials");
                    force_refresh_used = true;
                    credentials = self
                        .gateway
                        .load_profile_key_credentials(acis.clone(), true, now_ms)
                        .await?;
                }
                Err(error) => return Err(error),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Updates
    // -----------------------------------------------------------------------

    /// Apply a mutation intent to an existing group.
    pub async fn update_group(
        &self,
        group_id: GroupIdentifier,
        changes: OutgoingChanges,
    ) -> Result<GroupModel, GroupsError> {
        let queue = self.group_queue(&group_id);
        let _serialized = queue.lock().await;
        tokio::time::timeout(
            GROUP_UPDATE_TIMEOUT,
            self.update_group_serialized(group_id, changes),
        )
        .await
        .unwrap_or(Err(GroupsError::Timeout))
    }

    async fn update_group_serialized(
        &self,
        group_id: GroupIdentifier,
        mut changes: OutgoingChanges,
    ) -> Result<GroupModel, GroupsError> {
        let mut force_credentials = false;
        let mut retried_conflict = false;
        let mut retried_recoverable = false;
        loop {
            match self.attempt_update(&group_id, &mut changes, force_credentials).await {
                Ok(model) => return Ok(model),
                Err(GroupsError::ConflictingChange) if !retried_conflict => {
                    // Rebase: fetch the authoritative state, then rebuild
                    // the intent against it.
                    retried_conflict = true;
                    let params = self
                        .gateway
                        .store()
                        .load_group(&group_id)
                        .ok_or(GroupsError::NotInGroup)?
                        .params;
                    self.refresh
                        .refresh_group(
                            &params,
                            GroupUpdateMode::UpToCurrentRevisionImmediately,
                            GroupModelOptions::none(),
                        )
                        .await?;
                }
                Err(GroupsError::Recoverable400) if !retried_recoverable => {
                    retried_recoverable = true;
                    force_credentials = true;
                }
                Err(GroupsError::NotInGroup) => {
                    // Could be real removal or a mere permission gap; a
                    // refresh distinguishes them before the error surfaces.
                    if let Some(model) = self.gateway.store().load_group(&group_id) {
                        let _ = self
                            .refresh
                            .refresh_group(
                                &model.params,
                                GroupUpdateMode::UpToCurrentRevisionThrottled,
                                GroupModelOptions::none(),
                            )
                            .await;
                    }
                    return Err(GroupsError::NotInGroup);
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn attempt_update(
        &self,
        group_id: &GroupIdentifier,
        changes: &mut OutgoingChanges,
        force_credentials: bool,
    ) -> Result<GroupModel, GroupsError> {
        let store = self.gateway.store();
        let local = self.gateway.account().identifiers;
        let now_ms = Self::now_ms();

        let model = store.load_group(group_id).ok_or(GroupsError::NotInGroup)?;
        if model.is_join_request_placeholder {
            return Err(GroupsError::CantApplyToPlaceholder);
        }

        let credentials = self
            .gateway
            .load_profile_key_credentials(
                changes.credential_acis(local.aci),
                force_credentials,
                now_ms,
            )
            .await?;

        let pending_avatar = changes.pending_avatar_upload().map(<[u8]>::to_vec);
        if let Some(data) = pending_avatar {
            let url_path = self.gateway.upload_avatar(&model.params, &data).await?;
            changes.set_uploaded_avatar_url_path(url_path);
        }

        let Some(built) = changes.build_change_actions(&model, &local, &credentials, now_ms)?
        else {
            // Everything we wanted is already true. Success.
            log::info!("No actions needed for {:?}", group_id);
            return Ok(model);
        };

        let signed = self.gateway.update_group(&model.params, &built.actions).await?;

        let mut avatars = DownloadedAvatars::new();
        if let Some((url_path, data)) = changes.uploaded_avatar() {
            avatars.set(url_path.to_string(), data.to_vec());
        }
        let applied = translate::apply_change_actions(&model, &signed, &avatars, &local)?;

        // Re-validate against freshly read state immediately before commit.
        let fresh = store.load_group(group_id).ok_or(GroupsError::NotInGroup)?;
        if fresh.revision != model.revision {
            return Err(GroupsError::ConflictingChange);
        }

        let mut new_model = applied.new_model;
        if fresh.did_just_add_self_via_group_link {
            new_model.did_just_add_self_via_group_link = true;
        }
        let user_facing = fresh.has_user_facing_change(&new_model);
        store.upsert_group(&new_model);
        self.gateway.events().emit(GroupEvent::UpdatedToRevision {
            group_id: *group_id,
            revision: new_model.revision,
            user_facing,
        });

        self.fan_out(&fresh, &new_model, &signed, built.notification);
        Ok(new_model)
    }

    fn fan_out(
        &self,
        old_model: &GroupModel,
        new_model: &GroupModel,
        signed_actions: &wire::GroupChangeActions,
        notification: NotificationBehavior,
    ) {
        if notification == NotificationBehavior::SendNothing {
            log::info!("Suppressing outbound notification for {:?}", new_model.group_id());
            return;
        }
        let encoded = wire::encode(signed_actions).ok();
        self.delivery.enqueue_group_update(GroupUpdateNotice {
            group_id: new_model.group_id(),
            revision: new_model.revision,
            change_actions: encoded.clone(),
            recipients: NoticeRecipients::AllMembers,
        });

        let local = self.gateway.account().identifiers;
        let removed: Vec<ServiceId> = old_model
            .membership
            .full_members()
            .into_iter()
            .chain(old_model.membership.invited_members())
            .chain(
                old_model
                    .membership
                    .requesting_members()
                    .into_iter()
                    .map(ServiceId::Aci),
            )
            .filter(|id| !new_model.membership.is_member_of_any_kind(id))
            .filter(|id| !local.contains(id))
            .collect();
        if !removed.is_empty() {
            self.delivery.enqueue_group_update(GroupUpdateNotice {
                group_id: new_model.group_id(),
                revision: new_model.revision,
                change_actions: encoded,
                recipients: NoticeRecipients::RemovedMembers(removed),
            });
        }
    }

    // -----------------------------------------------------------------------
    // Invite sugar
    // -----------------------------------------------------------------------

    pub async fn accept_invite(&self, group_id: GroupIdentifier) -> Result<GroupModel, GroupsError> {
        let mut changes = OutgoingChanges::new();
        changes.set_local_should_accept_invite();
        self.update_group(group_id, changes).await
    }

    pub async fn leave_group_or_decline_invite(
        &self,
        group_id: GroupIdentifier,
    ) -> Result<GroupModel, GroupsError> {
        let mut changes = OutgoingChanges::new();
        changes.set_should_leave_group_decline_invite();
        self.update_group(group_id, changes).await
    }

    // -----------------------------------------------------------------------
    // Invite-link join state machine
    // -----------------------------------------------------------------------

    pub async fn join_group_via_invite_link(&self, link: &str) -> Result<GroupModel, GroupsError> {
        let (master_key, invite_password) = invite_link::parse_invite_link(link)?;
        self.join_group_with_link_contents(&master_key, &invite_password).await
    }

    pub async fn join_group_with_link_contents(
        &self,
        master_key: &GroupMasterKey,
        invite_password: &[u8],
    ) -> Result<GroupModel, GroupsError> {
        let params = GroupParams::from_master_key(master_key);
        let local = self.gateway.account().identifiers;
        let store = self.gateway.store();

        // The preview proves the link works and pins the revision we will
        // submit against.
        let mut preview = self
            .gateway
            .fetch_invite_link_preview(&params, Some(invite_password), false)
            .await?;

        // We might already be in the group, or hold an invite we can accept
        // outright instead of filing a join request.
        match self
            .refresh
            .refresh_group(
                &params,
                GroupUpdateMode::UpToCurrentRevisionImmediately,
                GroupModelOptions::none(),
            )
            .await
        {
            Ok(model) => {
                let membership = &model.membership;
                if membership.is_full_member(&ServiceId::Aci(local.aci))
                    || membership.is_requesting_member(&local.aci)
                {
                    return Ok(model);
                }
                if membership.local_user_invited_at(&local).is_some() {
                    return self.accept_invite(params.group_id).await;
                }
            }
            Err(GroupsError::GroupBlocked) => return Err(GroupsError::GroupBlocked),
            Err(error) if error.is_retryable() => return Err(error),
            Err(_) => {
                // Expected for non-members; fall through to the join
                // submission.
            }
        }

        if preview.is_local_user_requesting_member {
            // A previous request is still pending but the group is not in
            // the database; synthesize the placeholder for it.
            let model = invite_link::synthesize_placeholder_model(
                &params,
                &preview,
                preview.revision,
                &local,
            );
            store.upsert_group(&model);
            self.gateway.events().emit(GroupEvent::UpdatedToRevision {
                group_id: params.group_id,
                revision: model.revision,
                user_facing: true,
            });
            return Ok(model);
        }

        let now_ms = Self::now_ms();
        let credentials = self
            .gateway
            .load_profile_key_credentials(vec![local.aci], false, now_ms)
            .await?;
        let credential = credentials
            .get(&local.aci)
            .ok_or(GroupsError::MissingLocalCredential)?;

        let mut attempts = 0;
        loop {
            let (actions, revision) = invite_link::build_join_change_actions(
                &preview, &params, &local, credential, now_ms,
            )?;
            let result = self
                .gateway
                .update_group_with_behavior(
                    &params,
                    &actions,
                    Some(invite_password.to_vec()),
                    Behavior403::ReportInvalidOrBlockedGroupLink,
                )
                .await;
            match result {
                Ok(signed) => {
                    return match preview.add_from_invite_link_access {
                        AccessLevel::Any => {
                            // Joined as a full member; the patch response is
                            // not a snapshot, so fetch the real state.
                            let model = self
                                .refresh
                                .refresh_group(
                                    &params,
                                    GroupUpdateMode::UpToCurrentRevisionImmediately,
                                    GroupModelOptions::self_joined_via_link(),
                                )
                                .await
                                .map_err(|_| GroupsError::RequestingMemberCantLoadState)?;
                            self.delivery.enqueue_group_update(GroupUpdateNotice {
                                group_id: params.group_id,
                                revision: model.revision,
                                change_actions: wire::encode(&signed).ok(),
                                recipients: NoticeRecipients::AllMembers,
                            });
                            Ok(model)
                        }
                        _ => {
                            // Joined as a requesting member. Non-members
                            // cannot fetch full state, and there is no one
                            // to notify from a placeholder.
                            let model = invite_link::synthesize_placeholder_model(
                                &params, &preview, revision, &local,
                            );
                            store.upsert_group(&model);
                            self.gateway.events().emit(GroupEvent::UpdatedToRevision {
                                group_id: params.group_id,
                                revision,
                                user_facing: true,
                            });
                            Ok(model)
                        }
                    };
                }
                Err(GroupsError::ConflictingChange) if attempts == 0 => {
                    // Another writer advanced the group; re-anchor on a
                    // fresh preview and resubmit once.
                    attempts += 1;
                    preview = self
                        .gateway
                        .fetch_invite_link_preview(&params, Some(invite_password), false)
                        .await?;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Withdraw the local user's join request. Tolerates the request having
    /// already been approved or denied by another actor.
    pub async fn cancel_join_request(
        &self,
        group_id: GroupIdentifier,
    ) -> Result<(), GroupsError> {
        let store = self.gateway.store();
        let local = self.gateway.account().identifiers;
        let queue = self.group_queue(&group_id);
        let _serialized = queue.lock().await;

        let model = store.load_group(&group_id).ok_or(GroupsError::NotARequestingMember)?;
        if !model.membership.is_requesting_member(&local.aci) {
            return Err(GroupsError::NotARequestingMember);
        }
        let params = model.params;

        let mut attempts = 0;
        loop {
            let preview = match self
                .gateway
                .fetch_invite_link_preview(&params, None, false)
                .await
            {
                Ok(preview) => preview,
                Err(GroupsError::NotARequestingMember) => {
                    // Resolved externally; the preview fetch already
                    // dropped the placeholder.
                    self.forget_join_request(&group_id);
                    return Ok(());
                }
                Err(error) => return Err(error),
            };
            if !preview.is_local_user_requesting_member {
                self.forget_join_request(&group_id);
                return Ok(());
            }

            let actions = invite_link::build_cancel_request_actions(
                preview.revision.wrapping_add(1),
                &params,
                &local,
            )?;
            match self
                .gateway
                .update_group_with_behavior(
                    &params,
                    &actions,
                    None,
                    Behavior403::NotARequestingMember,
                )
                .await
            {
                Ok(_) => {
                    self.forget_join_request(&group_id);
                    return Ok(());
                }
                Err(GroupsError::ConflictingChange) if attempts == 0 => {
                    attempts += 1;
                }
                Err(GroupsError::NotARequestingMember) => {
                    self.forget_join_request(&group_id);
                    return Ok(());
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn forget_join_request(&self, group_id: &GroupIdentifier) {
        if self.gateway.store().load_group(group_id).is_some() {
            self.gateway.store().remove_group(group_id);
            self.gateway
                .events()
                .emit(GroupEvent::RemovedLocally { group_id: *group_id });
        }
    }

    /// Refresh a placeholder's visible attributes from the invite-link
    /// preview. Placeholders cannot be refreshed any other way.
    pub async fn update_placeholder_from_preview(
        &self,
        group_id: GroupIdentifier,
    ) -> Result<(), GroupsError> {
        let store = self.gateway.store();
        let Some(model) = store.load_group(&group_id) else {
            return Ok(());
        };
        if !model.is_join_request_placeholder {
            return Ok(());
        }
        match self
            .gateway
            .fetch_invite_link_preview(&model.params, None, false)
            .await
        {
            Ok(preview) => {
                let mut updated = model;
                updated.title = preview.title;
                updated.description = preview.description;
                updated.avatar_url_path = preview.avatar_url_path;
                updated.access.add_from_invite_link = preview.add_from_invite_link_access;
                store.upsert_group(&updated);
                Ok(())
            }
            Err(GroupsError::NotARequestingMember) | Err(GroupsError::BlockedFromJoining) => {
                // The preview fetch already reconciled the dropped request.
                Ok(())
            }
            Err(error) => Err(error),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::GroupEvents;
    use crate::groups::ids::{LocalAccount, LocalIdentifiers, Pni};
    use crate::outgoing::OutgoingChanges;
    use crate::service::invite_link::build_invite_link;
    use crate::service::GatewayConfig;
    use crate::store::{GroupStore, MemoryGroupStore};
    use crate::testing::{test_aci, test_params, test_profile_key, TestClient, TestServer};
    use std::collections::BTreeMap;

    const LOCAL: u8 = 1;
    const REMOTE_ADMIN: u8 = 2;

    fn local_identifiers() -> LocalIdentifiers {
        LocalIdentifiers::new(test_aci(LOCAL), Some(Pni::from_bytes([LOCAL; 16])))
    }

    struct Fixture {
        server: TestServer,
        store: Arc<MemoryGroupStore>,
        updater: GroupUpdater<TestClient>,
        outbox: Arc<MemoryOutbox>,
        events: GroupEvents,
        params: GroupParams,
    }

    fn build_fixture(configure: impl FnOnce(&mut GroupModel)) -> Fixture {
        let params = test_params(13);
        let server = TestServer::new(params.clone());
        let store = Arc::new(MemoryGroupStore::new());
        let outbox = Arc::new(MemoryOutbox::new());
        let events = GroupEvents::new();

        server.register_user(test_aci(LOCAL), test_profile_key(LOCAL));
        server.register_user(test_aci(REMOTE_ADMIN), test_profile_key(REMOTE_ADMIN));

        let mut model = GroupModel::empty(params.clone());
        model.title = "base".into();
        let mut builder = model.membership.to_builder();
        builder.add_full_member(test_aci(REMOTE_ADMIN).into(), Role::Administrator);
        model.membership = builder.build();
        configure(&mut model);

        let mut profile_keys = BTreeMap::new();
        profile_keys.insert(test_aci(REMOTE_ADMIN), test_profile_key(REMOTE_ADMIN));
        server.seed(&model, profile_keys);

        let dyn_store: Arc<dyn GroupStore> = store.clone();
        let gateway = Arc::new(GroupGateway::new(
            Arc::new(server.client(local_identifiers())),
            dyn_store,
            LocalAccount::new(local_identifiers(), test_profile_key(LOCAL)),
            events.clone(),
            GatewayConfig::default(),
        ));
        let refresh = Arc::new(RefreshOrchestrator::new(Arc::clone(&gateway)));
        let updater = GroupUpdater::new(gateway, refresh, outbox.clone());
        Fixture { server, store, updater, outbox, events, params }
    }

    /// A fixture where the local user is already a full administrator, with
    /// the local store in sync at revision 0.
    fn member_fixture() -> Fixture {
        let fixture = build_fixture(|model| {
            let mut builder = model.membership.to_builder();
            builder.add_full_member(test_aci(LOCAL).into(), Role::Administrator);
            model.membership = builder.build();
        });
        fixture
            .store
            .upsert_group(&fixture.server.model().unwrap());
        fixture
    }

    // -------------------------------------------------------------------
    // Creation
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_create_group_with_mixed_credentials() {
        let fixture = build_fixture(|_| {});
        let alice = test_aci(3);
        let bob = test_aci(4);
        fixture.server.register_user(alice, test_profile_key(3));
        // Bob is not registered: no credential can be issued for him.

        let model = fixture
            .updater
            .create_new_group("hikers", vec![alice.into(), bob.into()], TimerToken::disabled())
            .await
            .unwrap();

        assert_eq!(model.revision, 0);
        assert!(model
            .membership
            .is_full_member_and_administrator(&test_aci(LOCAL).into()));
        assert_eq!(model.membership.role_of(&alice.into()), Some(Role::Normal));
        assert!(model.membership.is_full_member(&alice.into()));
        assert!(model.membership.is_invited_member(&bob.into()));

        // The persisted copy and the broadcast notice match.
        let stored = fixture.store.load_group(&model.group_id()).unwrap();
        assert!(stored.persisted_state_eq(&model));
        let notices = fixture.outbox.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].recipients, NoticeRecipients::AllMembers);
        assert_eq!(notices[0].revision, 0);
    }

    #[tokio::test]
    async fn test_create_group_retries_recoverable_400() {
        let fixture = build_fixture(|_| {});
        fixture.server.inject_one_400();

        let model = fixture
            .updater
            .create_new_group("retry", vec![], TimerToken::disabled())
            .await
            .unwrap();
        assert_eq!(model.revision, 0);
    }

    // -------------------------------------------------------------------
    // Updates
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_update_title_persists_and_fans_out() {
        let fixture = member_fixture();
        let mut receiver = fixture.events.subscribe();

        let mut changes = OutgoingChanges::new();
        changes.set_title("renamed");
        let model = fixture
            .updater
            .update_group(fixture.params.group_id, changes)
            .await
            .unwrap();

        assert_eq!(model.revision, 1);
        assert_eq!(model.title, "renamed");
        assert_eq!(fixture.server.revision(), 1);

        assert_eq!(
            receiver.try_recv().unwrap(),
            GroupEvent::UpdatedToRevision {
                group_id: fixture.params.group_id,
                revision: 1,
                user_facing: true,
            }
        );
        let notices = fixture.outbox.notices();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].change_actions.is_some());
    }

    #[tokio::test]
    async fn test_no_actions_needed_is_success() {
        let fixture = member_fixture();
        let mut changes = OutgoingChanges::new();
        changes.set_title("base"); // already the title

        let model = fixture
            .updater
            .update_group(fixture.params.group_id, changes)
            .await
            .unwrap();
        assert_eq!(model.revision, 0);
        assert_eq!(fixture.server.revision(), 0);
        assert!(fixture.outbox.notices().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_add_converges_to_noop() {
        let fixture = member_fixture();
        let carol = test_aci(5);
        fixture.server.register_user(carol, test_profile_key(5));

        // Another writer adds Carol first; our local copy is stale.
        let mut remote = OutgoingChanges::new();
        remote.add_member(carol.into());
        fixture.server.submit_change_as(test_aci(REMOTE_ADMIN), &remote);

        let mut changes = OutgoingChanges::new();
        changes.add_member(carol.into());
        let model = fixture
            .updater
            .update_group(fixture.params.group_id, changes)
            .await
            .unwrap();

        // After the automatic refetch and rebuild, nothing was submitted:
        // the server saw exactly one add.
        assert_eq!(fixture.server.revision(), 1);
        assert_eq!(model.revision, 1);
        assert!(model.membership.is_full_member(&carol.into()));
        assert!(fixture.outbox.notices().is_empty());
    }

    #[tokio::test]
    async fn test_removed_members_get_targeted_notice() {
        let fixture = build_fixture(|model| {
            let mut builder = model.membership.to_builder();
            builder.add_full_member(test_aci(LOCAL).into(), Role::Administrator);
            builder.add_full_member(test_aci(5).into(), Role::Normal);
            model.membership = builder.build();
        });
        fixture.store.upsert_group(&fixture.server.model().unwrap());

        let mut changes = OutgoingChanges::new();
        changes.remove_member(test_aci(5).into());
        let model = fixture
            .updater
            .update_group(fixture.params.group_id, changes)
            .await
            .unwrap();

        assert!(!model.membership.is_member_of_any_kind(&test_aci(5).into()));
        assert!(model.membership.is_banned(&test_aci(5)));

        let notices = fixture.outbox.notices();
        assert_eq!(notices.len(), 2);
        assert_eq!(notices[0].recipients, NoticeRecipients::AllMembers);
        assert_eq!(
            notices[1].recipients,
            NoticeRecipients::RemovedMembers(vec![test_aci(5).into()])
        );
    }

    #[tokio::test]
    async fn test_recoverable_400_retried_with_forced_credentials() {
        let fixture = member_fixture();
        let carol = test_aci(5);
        fixture.server.register_user(carol, test_profile_key(5));
        fixture.server.inject_one_400();

        let mut changes = OutgoingChanges::new();
        changes.add_member(carol.into());
        let model = fixture
            .updater
            .update_group(fixture.params.group_id, changes)
            .await
            .unwrap();
        assert!(model.membership.is_full_member(&carol.into()));
    }

    #[tokio::test]
    async fn test_update_unknown_group_is_not_in_group() {
        let fixture = build_fixture(|_| {});
        let mut changes = OutgoingChanges::new();
        changes.set_title("anything");
        let result = fixture
            .updater
            .update_group(test_params(99).group_id, changes)
            .await;
        assert!(matches!(result, Err(GroupsError::NotInGroup)));
    }

    #[tokio::test]
    async fn test_update_on_placeholder_rejected() {
        let fixture = build_fixture(|_| {});
        let preview = crate::service::invite_link::GroupInviteLinkPreview {
            title: "base".into(),
            description: None,
            avatar_url_path: None,
            member_count: 1,
            add_from_invite_link_access: AccessLevel::Administrator,
            revision: 0,
            is_local_user_requesting_member: true,
        };
        let placeholder = invite_link::synthesize_placeholder_model(
            &fixture.params,
            &preview,
            1,
            &local_identifiers(),
        );
        fixture.store.upsert_group(&placeholder);

        let mut changes = OutgoingChanges::new();
        changes.set_title("nope");
        let result = fixture
            .updater
            .update_group(fixture.params.group_id, changes)
            .await;
        assert!(matches!(result, Err(GroupsError::CantApplyToPlaceholder)));
    }

    // -------------------------------------------------------------------
    // Invites
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_accept_invite_under_primary_identity() {
        let fixture = build_fixture(|model| {
            let mut builder = model.membership.to_builder();
            builder.add_invited_member(
                test_aci(LOCAL).into(),
                Role::Normal,
                test_aci(REMOTE_ADMIN),
            );
            model.membership = builder.build();
        });
        fixture.store.upsert_group(&fixture.server.model().unwrap());

        let model = fixture.updater.accept_invite(fixture.params.group_id).await.unwrap();
        assert!(model.membership.is_full_member(&test_aci(LOCAL).into()));
        assert_eq!(fixture.outbox.notices().len(), 1);
    }

    #[tokio::test]
    async fn test_decline_pni_invite_sends_nothing() {
        let fixture = build_fixture(|model| {
            let mut builder = model.membership.to_builder();
            builder.add_invited_member(
                Pni::from_bytes([LOCAL; 16]).into(),
                Role::Normal,
                test_aci(REMOTE_ADMIN),
            );
            model.membership = builder.build();
        });
        fixture.store.upsert_group(&fixture.server.model().unwrap());

        let model = fixture
            .updater
            .leave_group_or_decline_invite(fixture.params.group_id)
            .await
            .unwrap();
        assert!(!model
            .membership
            .is_member_of_any_kind(&Pni::from_bytes([LOCAL; 16]).into()));
        // Declining an invite held by the secondary identity must not leak
        // the identity link through outbound traffic.
        assert!(fixture.outbox.notices().is_empty());
    }

    // -------------------------------------------------------------------
    // Invite-link joins
    // -------------------------------------------------------------------

    fn open_link_fixture(access: AccessLevel) -> (Fixture, String) {
        let password = vec![0x51; 16];
        let fixture = build_fixture(|model| {
            model.access.add_from_invite_link = access;
            model.invite_link_password = Some(vec![0x51; 16]);
        });
        fixture.server.set_invite_password(password.clone());
        let link = build_invite_link(
            &fixture.params.secret_params().master_key(),
            &password,
        )
        .unwrap();
        (fixture, link)
    }

    #[tokio::test]
    async fn test_join_open_link_becomes_full_member() {
        let (fixture, link) = open_link_fixture(AccessLevel::Any);

        let model = fixture.updater.join_group_via_invite_link(&link).await.unwrap();
        assert!(model.membership.is_full_member(&test_aci(LOCAL).into()));
        assert!(!model.is_join_request_placeholder);
        assert!(model.did_just_add_self_via_group_link);
        assert_eq!(model.revision, fixture.server.revision());
        assert_eq!(fixture.outbox.notices().len(), 1);
    }

    #[tokio::test]
    async fn test_join_approval_link_creates_placeholder() {
        let (fixture, link) = open_link_fixture(AccessLevel::Administrator);
        let preview_revision = fixture.server.revision();

        let model = fixture.updater.join_group_via_invite_link(&link).await.unwrap();
        assert!(model.is_join_request_placeholder);
        assert!(model.membership.is_requesting_member(&test_aci(LOCAL)));
        assert_eq!(model.revision, preview_revision + 1);
        // A placeholder has no one to notify.
        assert!(fixture.outbox.notices().is_empty());

        // The server really holds our join request.
        let server_model = fixture.server.model().unwrap();
        assert!(server_model.membership.is_requesting_member(&test_aci(LOCAL)));
    }

    #[tokio::test]
    async fn test_join_with_wrong_password_is_expired_link() {
        let (fixture, _) = open_link_fixture(AccessLevel::Any);
        let bad_link = build_invite_link(
            &fixture.params.secret_params().master_key(),
            &[0x99; 16],
        )
        .unwrap();

        let result = fixture.updater.join_group_via_invite_link(&bad_link).await;
        assert!(matches!(result, Err(GroupsError::ExpiredInviteLink)));
    }

    #[tokio::test]
    async fn test_join_when_banned_is_blocked() {
        let (fixture, link) = open_link_fixture(AccessLevel::Any);
        fixture.server.ban_from_link(test_aci(LOCAL));

        let result = fixture.updater.join_group_via_invite_link(&link).await;
        assert!(matches!(result, Err(GroupsError::BlockedFromJoining)));
    }

    #[tokio::test]
    async fn test_join_with_pending_invite_accepts_it() {
        let (fixture, link) = open_link_fixture(AccessLevel::Administrator);
        // An admin already invited us out-of-band.
        let mut server_model = fixture.server.model().unwrap();
        server_model.invite_link_password = Some(vec![0x51; 16]);
        let mut builder = server_model.membership.to_builder();
        builder.add_invited_member(
            test_aci(LOCAL).into(),
            Role::Normal,
            test_aci(REMOTE_ADMIN),
        );
        server_model.membership = builder.build();
        server_model.revision = 1;
        fixture.server.seed(&server_model, BTreeMap::new());

        let model = fixture.updater.join_group_via_invite_link(&link).await.unwrap();
        // The invite was accepted: full member, not a requesting member.
        assert!(model.membership.is_full_member(&test_aci(LOCAL).into()));
        assert!(!model.is_join_request_placeholder);
    }

    // -------------------------------------------------------------------
    // Cancel join request
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_cancel_join_request() {
        let (fixture, link) = open_link_fixture(AccessLevel::Administrator);
        fixture.updater.join_group_via_invite_link(&link).await.unwrap();

        let mut receiver = fixture.events.subscribe();
        fixture
            .updater
            .cancel_join_request(fixture.params.group_id)
            .await
            .unwrap();

        assert!(fixture.store.load_group(&fixture.params.group_id).is_none());
        let server_model = fixture.server.model().unwrap();
        assert!(!server_model.membership.is_requesting_member(&test_aci(LOCAL)));
        let mut saw_removed = false;
        while let Ok(event) = receiver.try_recv() {
            if event == (GroupEvent::RemovedLocally { group_id: fixture.params.group_id }) {
                saw_removed = true;
            }
        }
        assert!(saw_removed);
    }

    #[tokio::test]
    async fn test_cancel_join_request_already_resolved_elsewhere() {
        let (fixture, link) = open_link_fixture(AccessLevel::Administrator);
        fixture.updater.join_group_via_invite_link(&link).await.unwrap();

        // Another admin denies the request before we cancel.
        let mut deny = OutgoingChanges::new();
        deny.remove_member(test_aci(LOCAL).into());
        fixture.server.submit_change_as(test_aci(REMOTE_ADMIN), &deny);

        fixture
            .updater
            .cancel_join_request(fixture.params.group_id)
            .await
            .unwrap();
        assert!(fixture.store.load_group(&fixture.params.group_id).is_none());
    }

    #[tokio::test]
    async fn test_cancel_without_request_is_error() {
        let fixture = member_fixture();
        let result = fixture.updater.cancel_join_request(fixture.params.group_id).await;
        assert!(matches!(result, Err(GroupsError::NotARequestingMember)));
    }
}

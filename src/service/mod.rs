/// Service gateway: authenticated requests against the group service with
/// per-call-site 4xx policy, bounded retries with backoff, credential
/// caching, paginated change-log fetches, and bounded avatar transfer.

pub mod invite_link;
pub mod transport;

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use lru::LruCache;
use tokio::sync::{Mutex, Semaphore};

use crate::crypto::GroupParams;
use crate::error::GroupsError;
use crate::events::{GroupEvent, GroupEvents};
use crate::groups::change::{DownloadedAvatars, GroupChange, GroupSnapshot};
use crate::groups::ids::{Aci, GroupIdentifier, LocalAccount, ProfileKeyCredential, ServiceId};
use crate::limits::{
    backoff_delay, MAX_AVATAR_BYTES, MAX_CONCURRENT_AVATAR_TRANSFERS, PREVIEW_CACHE_CAPACITY,
    SERVICE_REQUEST_RETRIES,
};
use crate::service::invite_link::GroupInviteLinkPreview;
use crate::service::transport::{
    paths, AuthCredential, Behavior400, Behavior403, Behavior404, GroupRequest, GroupResponse,
    GroupTransport, HttpMethod, FORBIDDEN_REASON_BANNED, FORBIDDEN_REASON_HEADER,
};
use crate::store::{GroupStore, SendEndorsementRecords};
use crate::wire;
use crate::wire::translate;
use crate::wire::{
    GroupChangeActions, GroupChangePageWire, GroupSnapshotResponseWire, GroupSnapshotWire,
    JoinedAtRevisionWire,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
pub struct GatewayConfig {
    /// When set, avatar downloads for groups the local user is not a full
    /// or invited member of are skipped (marked, not fetched).
    pub block_untrusted_avatar_fetches: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig { block_untrusted_avatar_fetches: false }
    }
}

// ---------------------------------------------------------------------------
// Change pages
// ---------------------------------------------------------------------------

/// One page of the server's change log.
#[derive(Clone, Debug)]
pub struct GroupChangePage {
    pub changes: Vec<GroupChange>,
    /// Set when the server truncated the log: the last revision this page
    /// reached. More history remains past it.
    pub early_end: Option<u32>,
    pub endorsements: Option<SendEndorsementRecords>,
}

impl GroupChangePage {
    /// Parse `Content-Range: versions A-B/C`: A is the last revision this
    /// page reached, B the latest on the server, C the total count.
    fn parse_early_end(header: Option<&str>) -> Option<u32> {
        let Some(header) = header else {
            log::warn!("Missing Content-Range on a partial change-log response");
            return None;
        };
        let parsed = (|| {
            let rest = header.strip_prefix("versions ")?;
            let (range, _total) = rest.split_once('/')?;
            let (first, last) = range.split_once('-')?;
            let early: u32 = first.trim().parse().ok()?;
            let _latest: u32 = last.trim().parse().ok()?;
            Some(early)
        })();
        if parsed.is_none() {
            log::warn!("Unparsable Content-Range: {}", header);
        }
        parsed
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

pub struct GroupGateway<T: GroupTransport> {
    transport: Arc<T>,
    store: Arc<dyn GroupStore>,
    account: LocalAccount,
    config: GatewayConfig,
    events: GroupEvents,
    auth_cache: Mutex<Option<AuthCredential>>,
    preview_cache: StdMutex<LruCache<GroupIdentifier, GroupInviteLinkPreview>>,
    avatar_semaphore: Arc<Semaphore>,
}

impl<T: GroupTransport> GroupGateway<T> {
    pub fn new(
        transport: Arc<T>,
        store: Arc<dyn GroupStore>,
        account: LocalAccount,
        events: GroupEvents,
        config: GatewayConfig,
    ) -> Self {
        let preview_capacity =
            NonZeroUsize::new(PREVIEW_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        GroupGateway {
            transport,
            store,
            account,
            config,
            events,
            auth_cache: Mutex::new(None),
            preview_cache: StdMutex::new(LruCache::new(preview_capacity)),
            avatar_semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_AVATAR_TRANSFERS)),
        }
    }

    pub fn account(&self) -> &LocalAccount {
        &self.account
    }

    pub(crate) fn store(&self) -> &Arc<dyn GroupStore> {
        &self.store
    }

    pub(crate) fn events(&self) -> &GroupEvents {
        &self.events
    }

    // -----------------------------------------------------------------------
    // Request machinery
    // -----------------------------------------------------------------------

    async fn auth_credential(&self) -> Result<AuthCredential, GroupsError> {
        let mut cached = self.auth_cache.lock().await;
        if let Some(credential) = cached.as_ref() {
            return Ok(credential.clone());
        }
        let credential = self.transport.fetch_auth_credential().await?;
        *cached = Some(credential.clone());
        Ok(credential)
    }

    async fn clear_auth_credential(&self) {
        *self.auth_cache.lock().await = None;
    }

    /// Perform a request with bounded retries and the given 4xx policy.
    pub(crate) async fn perform_service_request<F>(
        &self,
        build_request: F,
        group_id: Option<GroupIdentifier>,
        behavior400: Behavior400,
        behavior403: Behavior403,
        behavior404: Behavior404,
    ) -> Result<GroupResponse, GroupsError>
    where
        F: Fn(AuthCredential) -> GroupRequest,
    {
        let mut remaining = SERVICE_REQUEST_RETRIES;
        let mut attempt: u32 = 0;
        loop {
            let auth = self.auth_credential().await?;
            let request = build_request(auth);
            log::debug!("Group request: {:?} {}", request.method, request.path);

            let response = match self.transport.send(request).await {
                Ok(response) => response,
                Err(error) if error.is_retryable() && remaining > 0 => {
                    log::warn!("Retrying after transport failure: {}", error);
                    remaining -= 1;
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    attempt += 1;
                    continue;
                }
                Err(error) => return Err(error.into()),
            };

            match response.status {
                200 | 206 => return Ok(response),
                400 => {
                    return match behavior400 {
                        Behavior400::Fail => {
                            log::error!("Unexpected 400 from the group service");
                            Err(GroupsError::HttpStatus(400))
                        }
                        Behavior400::ReportForRecovery => Err(GroupsError::Recoverable400),
                    };
                }
                401 => {
                    // Stale short-lived credential; refresh and retry.
                    self.clear_auth_credential().await;
                    if remaining > 0 {
                        remaining -= 1;
                        continue;
                    }
                    return Err(GroupsError::HttpStatus(401));
                }
                403 => return Err(self.handle_403(behavior403, group_id, &response)),
                404 => {
                    return match behavior404 {
                        Behavior404::Fail => Err(GroupsError::HttpStatus(404)),
                        Behavior404::GroupDoesNotExist => {
                            log::warn!("Group does not exist on the service");
                            Err(GroupsError::GroupDoesNotExist)
                        }
                    };
                }
                409 => return Err(GroupsError::ConflictingChange),
                status => return Err(GroupsError::HttpStatus(status)),
            }
        }
    }

    fn handle_403(
        &self,
        behavior: Behavior403,
        group_id: Option<GroupIdentifier>,
        response: &GroupResponse,
    ) -> GroupsError {
        match behavior {
            Behavior403::Fail => {
                log::error!("Unexpected 403 from the group service");
                GroupsError::NotInGroup
            }
            Behavior403::Ignore => GroupsError::NotInGroup,
            Behavior403::RemoveFromGroup => {
                if let Some(group_id) = group_id {
                    self.mark_not_in_group(&group_id);
                } else {
                    log::error!("403 with remove-from-group policy but no group id");
                }
                GroupsError::NotInGroup
            }
            Behavior403::FetchGroupUpdates => {
                // Might be real removal, might be a mere permission gap. The
                // caller refreshes to the latest revision to find out.
                log::info!("403 on a privileged mutation; refresh needed");
                GroupsError::NotInGroup
            }
            Behavior403::ReportInvalidOrBlockedGroupLink => {
                if response.header(FORBIDDEN_REASON_HEADER) == Some(FORBIDDEN_REASON_BANNED) {
                    GroupsError::BlockedFromJoining
                } else {
                    GroupsError::ExpiredInviteLink
                }
            }
            Behavior403::NotARequestingMember => GroupsError::NotARequestingMember,
        }
    }

    /// Correct local state after learning we are out of the group: drop a
    /// placeholder entirely, otherwise strip the local user's entries.
    pub(crate) fn mark_not_in_group(&self, group_id: &GroupIdentifier) {
        let Some(model) = self.store.load_group(group_id) else {
            return;
        };
        if model.is_join_request_placeholder {
            self.store.remove_group(group_id);
            self.events.emit(GroupEvent::RemovedLocally { group_id: *group_id });
            return;
        }
        let local = self.account.identifiers;
        let mut builder = model.membership.to_builder();
        let mut changed = builder.remove_member(&ServiceId::Aci(local.aci));
        if let Some(pni) = local.pni {
            changed |= builder.remove_member(&ServiceId::Pni(pni));
        }
        if changed {
            let mut updated = model;
            updated.membership = builder.build();
            self.store.upsert_group(&updated);
            self.events.emit(GroupEvent::RemovedLocally { group_id: *group_id });
        }
    }

    // -----------------------------------------------------------------------
    // Group state operations
    // -----------------------------------------------------------------------

    /// Create a group. New-group requests always carry credentials, so a
    /// 400 is reported for one forced-credential-refresh retry.
    pub async fn create_group(&self, snapshot: &GroupSnapshotWire) -> Result<(), GroupsError> {
        let body = wire::encode(snapshot)?;
        self.perform_service_request(
            move |auth| GroupRequest {
                method: HttpMethod::Put,
                path: paths::GROUP.to_string(),
                auth,
                body: body.clone(),
                invite_link_password: None,
            },
            None,
            Behavior400::ReportForRecovery,
            Behavior403::Fail,
            Behavior404::Fail,
        )
        .await?;
        Ok(())
    }

    /// Submit a change proposal. Returns the server-stamped (authored)
    /// actions to apply locally.
    pub async fn update_group(
        &self,
        params: &GroupParams,
        actions: &GroupChangeActions,
    ) -> Result<GroupChangeActions, GroupsError> {
        self.update_group_with_behavior(params, actions, None, Behavior403::FetchGroupUpdates)
            .await
    }

    pub(crate) async fn update_group_with_behavior(
        &self,
        params: &GroupParams,
        actions: &GroupChangeActions,
        invite_link_password: Option<Vec<u8>>,
        behavior403: Behavior403,
    ) -> Result<GroupChangeActions, GroupsError> {
        let behavior400 = if actions.carries_profile_key_credentials() {
            Behavior400::ReportForRecovery
        } else {
            Behavior400::Fail
        };
        let body = wire::encode(actions)?;
        let response = self
            .perform_service_request(
                move |auth| GroupRequest {
                    method: HttpMethod::Patch,
                    path: paths::GROUP.to_string(),
                    auth,
                    body: body.clone(),
                    invite_link_password: invite_link_password.clone(),
                },
                Some(params.group_id),
                behavior400,
                behavior403,
                Behavior404::Fail,
            )
            .await?;
        Ok(wire::decode(&response.body)?)
    }

    /// Fetch the latest full snapshot. A 403 here means we are out of the
    /// group; local state is corrected before the error surfaces.
    pub async fn fetch_snapshot(
        &self,
        params: &GroupParams,
    ) -> Result<(GroupSnapshot, Option<SendEndorsementRecords>), GroupsError> {
        let response = self
            .perform_service_request(
                |auth| GroupRequest {
                    method: HttpMethod::Get,
                    path: paths::GROUP.to_string(),
                    auth,
                    body: Vec::new(),
                    invite_link_password: None,
                },
                Some(params.group_id),
                Behavior400::Fail,
                Behavior403::RemoveFromGroup,
                Behavior404::GroupDoesNotExist,
            )
            .await?;
        let wire: GroupSnapshotResponseWire = wire::decode(&response.body)?;
        let snapshot = translate::parse_snapshot(&wire.snapshot, params);
        let endorsements = wire
            .endorsements
            .as_ref()
            .map(|e| translate::parse_endorsements(e, params));
        Ok((snapshot, endorsements))
    }

    /// Fetch one page of the change log starting at `from_revision`.
    pub async fn fetch_change_page(
        &self,
        params: &GroupParams,
        from_revision: u32,
        require_first_snapshot: bool,
    ) -> Result<GroupChangePage, GroupsError> {
        let path = format!(
            "{}/{}?firstSnapshot={}",
            paths::GROUP_LOGS,
            from_revision,
            require_first_snapshot
        );
        let response = self
            .perform_service_request(
                move |auth| GroupRequest {
                    method: HttpMethod::Get,
                    path: path.clone(),
                    auth,
                    body: Vec::new(),
                    invite_link_password: None,
                },
                Some(params.group_id),
                Behavior400::Fail,
                Behavior403::Fail,
                Behavior404::Fail,
            )
            .await?;

        let early_end = if response.status == 206 {
            GroupChangePage::parse_early_end(response.header("content-range"))
        } else {
            None
        };

        let page: GroupChangePageWire = wire::decode(&response.body)?;
        let mut changes = Vec::with_capacity(page.entries.len());
        for entry in &page.entries {
            changes.push(translate::parse_change_entry(entry, params)?);
        }
        let endorsements = page
            .endorsements
            .as_ref()
            .map(|e| translate::parse_endorsements(e, params));
        Ok(GroupChangePage { changes, early_end, endorsements })
    }

    /// Look up the revision at which the local user was (re)added. A 403
    /// propagates as not-in-group without touching local state: callers use
    /// this exactly when membership is uncertain.
    pub async fn fetch_joined_at_revision(&self, params: &GroupParams) -> Result<u32, GroupsError> {
        let response = self
            .perform_service_request(
                |auth| GroupRequest {
                    method: HttpMethod::Get,
                    path: paths::JOINED_AT_REVISION.to_string(),
                    auth,
                    body: Vec::new(),
                    invite_link_password: None,
                },
                Some(params.group_id),
                Behavior400::Fail,
                Behavior403::Ignore,
                Behavior404::Fail,
            )
            .await?;
        let wire: JoinedAtRevisionWire = wire::decode(&response.body)?;
        Ok(wire.joined_at_revision)
    }

    /// Fetch the group's external send credential.
    pub async fn fetch_external_credential(
        &self,
        params: &GroupParams,
    ) -> Result<Vec<u8>, GroupsError> {
        let response = self
            .perform_service_request(
                |auth| GroupRequest {
                    method: HttpMethod::Get,
                    path: paths::EXTERNAL_CREDENTIAL.to_string(),
                    auth,
                    body: Vec::new(),
                    invite_link_password: None,
                },
                Some(params.group_id),
                Behavior400::Fail,
                Behavior403::RemoveFromGroup,
                Behavior404::Fail,
            )
            .await?;
        Ok(response.body)
    }

    // -----------------------------------------------------------------------
    // Profile key credentials
    // -----------------------------------------------------------------------

    /// Load profile key credentials, dropping any the service returned
    /// already expired.
    pub async fn load_profile_key_credentials(
        &self,
        acis: Vec<Aci>,
        force_refresh: bool,
        now_ms: i64,
    ) -> Result<BTreeMap<Aci, ProfileKeyCredential>, GroupsError> {
        let mut credentials = self
            .transport
            .fetch_profile_key_credentials(acis, force_refresh)
            .await?;
        credentials.retain(|aci, credential| {
            let valid = !credential.is_expired(now_ms);
            if !valid {
                log::warn!("Dropping expired profile key credential for {:?}", aci);
            }
            valid
        });
        Ok(credentials)
    }

    // -----------------------------------------------------------------------
    // Avatars
    // -----------------------------------------------------------------------

    /// Encrypt and upload avatar bytes; returns the service url path.
    pub async fn upload_avatar(
        &self,
        params: &GroupParams,
        data: &[u8],
    ) -> Result<String, GroupsError> {
        if data.len() > MAX_AVATAR_BYTES {
            return Err(GroupsError::AttributeTooLong);
        }
        let sealed = params.encrypt_avatar(data)?;
        let response = self
            .perform_service_request(
                move |auth| GroupRequest {
                    method: HttpMethod::Put,
                    path: paths::AVATAR.to_string(),
                    auth,
                    body: sealed.clone(),
                    invite_link_password: None,
                },
                Some(params.group_id),
                Behavior400::Fail,
                Behavior403::Fail,
                Behavior404::Fail,
            )
            .await?;
        String::from_utf8(response.body).map_err(|_| GroupsError::Wire(
            wire::WireError::Decode("avatar url path is not utf-8".into()),
        ))
    }

    /// Download and decrypt one avatar. Every failure degrades to `None`:
    /// a missing or oversized avatar never fails the surrounding update.
    pub async fn download_avatar(
        &self,
        params: &GroupParams,
        url_path: &str,
    ) -> Option<Vec<u8>> {
        let _permit = self.avatar_semaphore.clone().acquire_owned().await.ok()?;
        let path = url_path.to_string();
        let result = self
            .perform_service_request(
                move |auth| GroupRequest {
                    method: HttpMethod::Get,
                    path: path.clone(),
                    auth,
                    body: Vec::new(),
                    invite_link_password: None,
                },
                Some(params.group_id),
                Behavior400::Fail,
                Behavior403::Fail,
                Behavior404::Fail,
            )
            .await;
        let sealed = match result {
            Ok(response) => response.body,
            Err(error) => {
                log::warn!("Avatar download failed for {}: {}", url_path, error);
                return None;
            }
        };
        if sealed.len() > MAX_AVATAR_BYTES {
            log::warn!("Avatar too large, marking failed: {}", url_path);
            return None;
        }
        match params.decrypt_avatar(&sealed) {
            Ok(data) => Some(data),
            Err(_) => {
                log::warn!("Avatar failed to decrypt, marking failed: {}", url_path);
                None
            }
        }
    }

    /// Resolve the avatars needed to apply server state. Just-uploaded and
    /// already-held avatars are not re-downloaded; low-trust fetches may be
    /// skipped by policy.
    pub async fn fetch_avatars(
        &self,
        params: &GroupParams,
        url_paths: Vec<String>,
        just_uploaded: &DownloadedAvatars,
    ) -> DownloadedAvatars {
        let mut downloaded = just_uploaded.clone();
        let current_model = self.store.load_group(&params.group_id);
        if let Some(model) = &current_model {
            downloaded.merge(&DownloadedAvatars::from_model(model));
        }

        let untrusted = self.config.block_untrusted_avatar_fetches
            && !current_model
                .map(|m| m.membership.is_local_user_full_or_invited(&self.account.identifiers))
                .unwrap_or(false);

        for url_path in url_paths {
            if downloaded.contains(&url_path) {
                continue;
            }
            if untrusted {
                log::info!("Skipping low-trust avatar fetch: {}", url_path);
                continue;
            }
            if let Some(data) = self.download_avatar(params, &url_path).await {
                downloaded.set(url_path, data);
            }
        }
        downloaded
    }

    // -----------------------------------------------------------------------
    // Invite link previews
    // -----------------------------------------------------------------------

    pub fn cached_invite_link_preview(
        &self,
        params: &GroupParams,
    ) -> Option<GroupInviteLinkPreview> {
        self.preview_cache
            .lock()
            .ok()?
            .get(&params.group_id)
            .cloned()
    }

    /// Fetch the unauthenticated preview behind an invite link. The
    /// password is not needed once we are a member or requesting member.
    pub async fn fetch_invite_link_preview(
        &self,
        params: &GroupParams,
        invite_link_password: Option<&[u8]>,
        allow_cached: bool,
    ) -> Result<GroupInviteLinkPreview, GroupsError> {
        if allow_cached {
            if let Some(preview) = self.cached_invite_link_preview(params) {
                return Ok(preview);
            }
        }

        let behavior403 = if invite_link_password.is_some() {
            Behavior403::ReportInvalidOrBlockedGroupLink
        } else {
            Behavior403::NotARequestingMember
        };
        let password = invite_link_password.map(<[u8]>::to_vec);

        let result = self
            .perform_service_request(
                move |auth| GroupRequest {
                    method: HttpMethod::Get,
                    path: paths::INVITE_LINK_PREVIEW.to_string(),
                    auth,
                    body: Vec::new(),
                    invite_link_password: password.clone(),
                },
                None,
                Behavior400::Fail,
                behavior403,
                Behavior404::GroupDoesNotExist,
            )
            .await;

        match result {
            Ok(response) => {
                let wire: wire::GroupInviteLinkPreviewWire = wire::decode(&response.body)?;
                let preview = invite_link::parse_invite_link_preview(&wire, params);
                if let Ok(mut cache) = self.preview_cache.lock() {
                    cache.put(params.group_id, preview.clone());
                }
                self.update_placeholder_from_preview(
                    params,
                    preview.is_local_user_requesting_member,
                );
                Ok(preview)
            }
            Err(GroupsError::NotARequestingMember) => {
                self.update_placeholder_from_preview(params, false);
                Err(GroupsError::NotARequestingMember)
            }
            Err(error) => Err(error),
        }
    }

    /// Reconcile a local placeholder with what a preview told us. A
    /// placeholder for a request the server no longer knows about is
    /// dropped.
    fn update_placeholder_from_preview(&self, params: &GroupParams, is_requesting: bool) {
        let Some(model) = self.store.load_group(&params.group_id) else {
            return;
        };
        if model.is_join_request_placeholder && !is_requesting {
            self.store.remove_group(&params.group_id);
            self.events.emit(GroupEvent::RemovedLocally { group_id: params.group_id });
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GroupsError;
    use crate::events::GroupEvent;
    use crate::groups::access::AccessLevel;
    use crate::groups::ids::{LocalIdentifiers, ServiceId};
    use crate::groups::membership::Role;
    use crate::groups::model::GroupModel;
    use crate::store::MemoryGroupStore;
    use crate::testing::{test_aci, test_params, test_profile_key, TestClient, TestServer};
    use crate::wire::GroupChangeActions;
    use std::collections::BTreeMap;

    fn local_identifiers() -> LocalIdentifiers {
        LocalIdentifiers::new(test_aci(1), None)
    }

    fn account() -> LocalAccount {
        LocalAccount::new(local_identifiers(), test_profile_key(1))
    }

    struct Fixture {
        server: TestServer,
        store: Arc<MemoryGroupStore>,
        gateway: Arc<GroupGateway<TestClient>>,
        events: GroupEvents,
        params: GroupParams,
    }

    /// A group at revision 0. `local_is_member` controls both the server
    /// and the local store copy.
    fn fixture(local_is_member: bool) -> Fixture {
        let params = test_params(7);
        let server = TestServer::new(params.clone());
        let store = Arc::new(MemoryGroupStore::new());
        let events = GroupEvents::new();

        let mut model = GroupModel::empty(params.clone());
        model.title = "fixture".into();
        let mut builder = model.membership.to_builder();
        if local_is_member {
            builder.add_full_member(test_aci(1).into(), Role::Administrator);
        }
        builder.add_full_member(test_aci(2).into(), Role::Administrator);
        model.membership = builder.build();

        let mut profile_keys = BTreeMap::new();
        profile_keys.insert(test_aci(2), test_profile_key(2));
        if local_is_member {
            profile_keys.insert(test_aci(1), test_profile_key(1));
        }
        server.seed(&model, profile_keys);
        store.upsert_group(&model);

        let dyn_store: Arc<dyn GroupStore> = store.clone();
        let gateway = Arc::new(GroupGateway::new(
            Arc::new(server.client(local_identifiers())),
            dyn_store,
            account(),
            events.clone(),
            GatewayConfig::default(),
        ));
        Fixture { server, store, gateway, events, params }
    }

    /// Advance the server a few revisions via a concurrent admin.
    fn advance_server(fixture: &Fixture, revisions: u8) {
        for i in 0..revisions {
            let mut changes = crate::outgoing::OutgoingChanges::new();
            changes.set_title(&format!("title {}", i));
            fixture.server.submit_change_as(test_aci(2), &changes);
        }
    }

    #[tokio::test]
    async fn test_stale_revision_maps_to_conflicting_change() {
        let fixture = fixture(true);
        let actions = GroupChangeActions {
            revision: 5, // server is at 0
            modify_announcements_only: Some(true),
            ..Default::default()
        };
        let result = fixture.gateway.update_group(&fixture.params, &actions).await;
        assert!(matches!(result, Err(GroupsError::ConflictingChange)));
    }

    #[tokio::test]
    async fn test_update_returns_authored_actions() {
        let fixture = fixture(true);
        let actions = GroupChangeActions {
            revision: 1,
            modify_announcements_only: Some(true),
            ..Default::default()
        };
        let signed = fixture.gateway.update_group(&fixture.params, &actions).await.unwrap();
        let author = fixture.params.decrypt_service_id(&signed.source_user_id).unwrap();
        assert_eq!(author, ServiceId::Aci(test_aci(1)));
        assert_eq!(fixture.server.revision(), 1);
    }

    #[tokio::test]
    async fn test_401_retried_with_fresh_credential() {
        let fixture = fixture(true);
        fixture.server.inject_auth_failures(1);
        let (snapshot, endorsements) =
            fixture.gateway.fetch_snapshot(&fixture.params).await.unwrap();
        assert_eq!(snapshot.revision, 0);
        assert!(endorsements.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_failures_retried_with_backoff() {
        let fixture = fixture(true);
        fixture.server.inject_network_failures(2);
        let (snapshot, _) = fixture.gateway.fetch_snapshot(&fixture.params).await.unwrap();
        assert_eq!(snapshot.revision, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_failures_exhaust_retries() {
        let fixture = fixture(true);
        fixture.server.inject_network_failures(10);
        let result = fixture.gateway.fetch_snapshot(&fixture.params).await;
        assert!(matches!(result, Err(GroupsError::Transport(_))));
    }

    #[tokio::test]
    async fn test_snapshot_403_corrects_local_state() {
        // Local store still believes we are a member; the server disagrees.
        let fixture = fixture(false);
        let mut stale = fixture.store.load_group(&fixture.params.group_id).unwrap();
        let mut builder = stale.membership.to_builder();
        builder.add_full_member(test_aci(1).into(), Role::Normal);
        stale.membership = builder.build();
        fixture.store.upsert_group(&stale);

        let mut receiver = fixture.events.subscribe();
        let result = fixture.gateway.fetch_snapshot(&fixture.params).await;
        assert!(matches!(result, Err(GroupsError::NotInGroup)));

        let corrected = fixture.store.load_group(&fixture.params.group_id).unwrap();
        assert!(!corrected.membership.is_full_member(&test_aci(1).into()));
        assert_eq!(
            receiver.try_recv().unwrap(),
            GroupEvent::RemovedLocally { group_id: fixture.params.group_id }
        );
    }

    #[tokio::test]
    async fn test_recoverable_400_for_credentialed_update() {
        let fixture = fixture(true);
        fixture.server.inject_one_400();
        let actions = GroupChangeActions {
            revision: 1,
            add_members: vec![crate::wire::AddMemberActionWire::default()],
            ..Default::default()
        };
        let result = fixture.gateway.update_group(&fixture.params, &actions).await;
        assert!(matches!(result, Err(GroupsError::Recoverable400)));
    }

    #[tokio::test]
    async fn test_plain_400_fails_hard() {
        let fixture = fixture(true);
        fixture.server.inject_one_400();
        let actions = GroupChangeActions {
            revision: 1,
            modify_announcements_only: Some(true),
            ..Default::default()
        };
        let result = fixture.gateway.update_group(&fixture.params, &actions).await;
        assert!(matches!(result, Err(GroupsError::HttpStatus(400))));
    }

    #[test]
    fn test_content_range_parsing() {
        assert_eq!(
            GroupChangePage::parse_early_end(Some("versions 7-12/13")),
            Some(7)
        );
        assert_eq!(GroupChangePage::parse_early_end(Some("bogus")), None);
        assert_eq!(GroupChangePage::parse_early_end(Some("versions x-12/13")), None);
        assert_eq!(GroupChangePage::parse_early_end(None), None);
    }

    #[tokio::test]
    async fn test_change_page_pagination() {
        let fixture = fixture(true);
        advance_server(&fixture, 4); // revisions 1..=4
        fixture.server.set_page_size(2);

        let page = fixture
            .gateway
            .fetch_change_page(&fixture.params, 0, true)
            .await
            .unwrap();
        assert_eq!(page.changes.len(), 2);
        assert_eq!(page.early_end, Some(1));

        let rest = fixture
            .gateway
            .fetch_change_page(&fixture.params, 2, false)
            .await
            .unwrap();
        assert_eq!(rest.changes.len(), 2);
        assert_eq!(rest.early_end, Some(3));

        let last = fixture
            .gateway
            .fetch_change_page(&fixture.params, 4, false)
            .await
            .unwrap();
        assert_eq!(last.changes.len(), 1);
        assert_eq!(last.early_end, None);
    }

    #[tokio::test]
    async fn test_joined_at_revision_lookup() {
        let fixture = fixture(true);
        assert_eq!(
            fixture.gateway.fetch_joined_at_revision(&fixture.params).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_joined_at_revision_when_not_member() {
        let fixture = fixture(false);
        let result = fixture.gateway.fetch_joined_at_revision(&fixture.params).await;
        assert!(matches!(result, Err(GroupsError::NotInGroup)));
        // The ignore policy must not touch local state.
        assert!(fixture.store.load_group(&fixture.params.group_id).is_some());
    }

    #[tokio::test]
    async fn test_avatar_roundtrip_and_failure_degradation() {
        let fixture = fixture(true);
        let data = vec![0x42; 1024];
        let url_path = fixture.gateway.upload_avatar(&fixture.params, &data).await.unwrap();
        assert_eq!(
            fixture.gateway.download_avatar(&fixture.params, &url_path).await,
            Some(data)
        );
        // Missing avatars degrade to None, never an error.
        assert_eq!(
            fixture.gateway.download_avatar(&fixture.params, "/avatars/nope").await,
            None
        );
    }

    #[tokio::test]
    async fn test_oversized_avatar_upload_rejected() {
        let fixture = fixture(true);
        let data = vec![0; crate::limits::MAX_AVATAR_BYTES + 1];
        let result = fixture.gateway.upload_avatar(&fixture.params, &data).await;
        assert!(matches!(result, Err(GroupsError::AttributeTooLong)));
    }

    #[tokio::test]
    async fn test_preview_password_failures() {
        let fixture = fixture(false);
        fixture.server.set_invite_password(vec![1; 16]);

        let result = fixture
            .gateway
            .fetch_invite_link_preview(&fixture.params, Some(&[9; 16]), false)
            .await;
        assert!(matches!(result, Err(GroupsError::ExpiredInviteLink)));

        fixture.server.ban_from_link(test_aci(1));
        let result = fixture
            .gateway
            .fetch_invite_link_preview(&fixture.params, Some(&[1; 16]), false)
            .await;
        assert!(matches!(result, Err(GroupsError::BlockedFromJoining)));
    }

    #[tokio::test]
    async fn test_preview_cache() {
        let fixture = fixture(false);
        fixture.server.set_invite_password(vec![1; 16]);
        let mut open = fixture.server.model().unwrap();
        open.access.add_from_invite_link = AccessLevel::Any;
        open.invite_link_password = Some(vec![1; 16]);
        fixture.server.seed(&open, BTreeMap::new());

        let first = fixture
            .gateway
            .fetch_invite_link_preview(&fixture.params, Some(&[1; 16]), false)
            .await
            .unwrap();
        let requests_after_first = fixture.server.requests_seen();

        let second = fixture
            .gateway
            .fetch_invite_link_preview(&fixture.params, Some(&[1; 16]), true)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(fixture.server.requests_seen(), requests_after_first);
    }

    #[tokio::test]
    async fn test_external_credential_fetch() {
        let fixture = fixture(true);
        let token = fixture
            .gateway
            .fetch_external_credential(&fixture.params)
            .await
            .unwrap();
        assert!(!token.is_empty());
    }
}

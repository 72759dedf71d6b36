/// Refresh/merge orchestration.
///
/// Brings the local copy of a group up to the server's revision. Full
/// members prefer the incremental change log (entries carry authorship);
/// anything the log cannot fix (an incompatible revision, a placeholder
/// model, not being in the group) fails over to the latest snapshot.
///
/// General refreshes serialize through a single-slot queue with request
/// coalescing. Message-reactive refreshes (those pinned to a revision an
/// incoming message proved exists) bypass the queue entirely: they are
/// invoked from the message-processing pipeline and must not deadlock
/// behind it.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Instant;

use lru::LruCache;
use tokio::sync::{oneshot, Semaphore};

use crate::crypto::GroupParams;
use crate::error::GroupsError;
use crate::events::GroupEvent;
use crate::groups::change::{DownloadedAvatars, GroupChange};
use crate::groups::ids::{Aci, GroupIdentifier, LocalIdentifiers, Pni, ProfileKey, ServiceId};
use crate::groups::membership::GroupMembership;
use crate::groups::model::{GroupModel, GroupModelOptions};
use crate::limits::{
    CHANGE_PAGE_CACHE_CAPACITY, GROUP_UPDATE_TIMEOUT, LAST_REFRESH_CACHE_CAPACITY,
    REFRESH_THROTTLE_INTERVAL,
};
use crate::service::transport::GroupTransport;
use crate::service::{GroupChangePage, GroupGateway};
use crate::store::GroupStore;
use crate::wire::translate;

// ---------------------------------------------------------------------------
// Modes
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupUpdateMode {
    /// Reacting to a specific incoming message: the revision it proved
    /// exists bounds the refresh, and the refresh queue is bypassed.
    UpToSpecificRevisionImmediately { up_to_revision: u32 },
    /// General refresh, throttled to once per interval per group.
    UpToCurrentRevisionThrottled,
    /// General refresh, unthrottled (user-initiated or join flows).
    UpToCurrentRevisionImmediately,
}

impl GroupUpdateMode {
    pub fn up_to_revision(&self) -> Option<u32> {
        match self {
            GroupUpdateMode::UpToSpecificRevisionImmediately { up_to_revision } => {
                Some(*up_to_revision)
            }
            _ => None,
        }
    }

    pub fn is_message_reactive(&self) -> bool {
        matches!(self, GroupUpdateMode::UpToSpecificRevisionImmediately { .. })
    }

    pub fn should_throttle(&self) -> bool {
        matches!(self, GroupUpdateMode::UpToCurrentRevisionThrottled)
    }

    /// Whether the log fetch should include the revision we already have
    /// (general refreshes re-anchor on it; reactive ones start past it).
    pub fn includes_current_revision(&self) -> bool {
        !self.is_message_reactive()
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

type RefreshResult = Result<GroupModel, GroupsError>;

pub struct RefreshOrchestrator<T: GroupTransport> {
    gateway: Arc<GroupGateway<T>>,
    /// Single slot for general refreshes.
    queue: Arc<Semaphore>,
    /// Callers coalesced onto an in-flight general refresh of the same group.
    waiters: StdMutex<HashMap<GroupIdentifier, Vec<oneshot::Sender<RefreshResult>>>>,
    last_success: StdMutex<LruCache<GroupIdentifier, Instant>>,
    page_cache: StdMutex<LruCache<GroupIdentifier, Vec<GroupChange>>>,
}

impl<T: GroupTransport> RefreshOrchestrator<T> {
    pub fn new(gateway: Arc<GroupGateway<T>>) -> Self {
        RefreshOrchestrator {
            gateway,
            queue: Arc::new(Semaphore::new(1)),
            waiters: StdMutex::new(HashMap::new()),
            last_success: StdMutex::new(LruCache::new(
                NonZeroUsize::new(LAST_REFRESH_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
            page_cache: StdMutex::new(LruCache::new(
                NonZeroUsize::new(CHANGE_PAGE_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    /// Bring the group up to date per `mode`. Returns the resulting local
    /// model.
    pub async fn refresh_group(
        &self,
        params: &GroupParams,
        mode: GroupUpdateMode,
        options: GroupModelOptions,
    ) -> RefreshResult {
        let group_id = params.group_id;
        let store = self.gateway.store();

        if store.is_group_blocked(&group_id) {
            return Err(GroupsError::GroupBlocked);
        }

        if (mode.should_throttle() || options.throttle) && self.recently_refreshed(&group_id) {
            if let Some(model) = store.load_group(&group_id) {
                log::debug!("Refresh throttled for {:?}", group_id);
                return Ok(model);
            }
        }

        if let Some(bound) = mode.up_to_revision() {
            if let Some(model) = store.load_group(&group_id) {
                if model.revision >= bound && !model.is_join_request_placeholder {
                    // Already at (or past) everything the message proved.
                    return Ok(model);
                }
            }
        }

        if mode.is_message_reactive() {
            let result = self.run_refresh(params, mode, options).await;
            if result.is_ok() {
                self.record_success(&group_id, mode);
            }
            return result;
        }

        // General refresh: coalesce onto any in-flight run for this group.
        if let Some(receiver) = self.register_or_wait(&group_id) {
            return receiver.await.unwrap_or(Err(GroupsError::Cancelled));
        }

        let result = match self.queue.acquire().await {
            Ok(_permit) => self.run_refresh(params, mode, options).await,
            Err(_) => Err(GroupsError::Cancelled),
        };
        if result.is_ok() {
            self.record_success(&group_id, mode);
        }
        self.resolve_waiters(&group_id, &result);
        result
    }

    /// Opportunistically refresh the single most-stale group, if any.
    pub async fn refresh_most_stale_group(&self, now_ms: i64) -> Option<RefreshResult> {
        let store = self.gateway.store();
        let local = self.gateway.account().identifiers;
        let group_id = store.find_group_to_auto_refresh(&local, now_ms)?;
        let model = store.load_group(&group_id)?;
        log::info!("Auto-refreshing most-stale group {:?}", group_id);
        Some(
            self.refresh_group(
                &model.params,
                GroupUpdateMode::UpToCurrentRevisionThrottled,
                GroupModelOptions::none(),
            )
            .await,
        )
    }

    // -----------------------------------------------------------------------
    // Coalescing and throttling
    // -----------------------------------------------------------------------

    fn register_or_wait(&self, group_id: &GroupIdentifier) -> Option<oneshot::Receiver<RefreshResult>> {
        let mut waiters = match self.waiters.lock() {
            Ok(waiters) => waiters,
            Err(_) => return None,
        };
        match waiters.get_mut(group_id) {
            Some(list) => {
                let (sender, receiver) = oneshot::channel();
                list.push(sender);
                Some(receiver)
            }
            None => {
                waiters.insert(*group_id, Vec::new());
                None
            }
        }
    }

    fn resolve_waiters(&self, group_id: &GroupIdentifier, result: &RefreshResult) {
        let pending = match self.waiters.lock() {
            Ok(mut waiters) => waiters.remove(group_id),
            Err(_) => None,
        };
        for sender in pending.into_iter().flatten() {
            let _ = sender.send(result.clone());
        }
    }

    fn recently_refreshed(&self, group_id: &GroupIdentifier) -> bool {
        match self.last_success.lock() {
            Ok(mut cache) => cache
                .get(group_id)
                .map(|at| at.elapsed() < REFRESH_THROTTLE_INTERVAL)
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    fn record_success(&self, group_id: &GroupIdentifier, mode: GroupUpdateMode) {
        if let Ok(mut cache) = self.last_success.lock() {
            cache.put(*group_id, Instant::now());
        }
        if !mode.is_message_reactive() {
            let now_ms = chrono::Utc::now().timestamp_millis();
            self.gateway.store().set_refreshed_at(group_id, now_ms);
        }
    }

    fn cached_changes(
        &self,
        group_id: &GroupIdentifier,
        up_to_revision: Option<u32>,
    ) -> Option<Vec<GroupChange>> {
        // Only reactive refreshes can prove a cached page is still enough.
        let up_to = up_to_revision?;
        let local_revision = self.gateway.store().load_group(group_id)?.revision;
        if local_revision >= up_to {
            self.discard_cached_changes(group_id);
            return None;
        }
        let mut cache = self.page_cache.lock().ok()?;
        let cached = cache.get(group_id)?;
        let usable: Vec<GroupChange> = cached
            .iter()
            .filter(|change| change.revision >= local_revision && change.revision <= up_to)
            .cloned()
            .collect();
        if !usable.iter().any(|change| change.revision == up_to) {
            cache.pop(group_id);
            return None;
        }
        Some(usable)
    }

    fn store_cached_changes(&self, group_id: &GroupIdentifier, changes: &[GroupChange]) {
        if let Ok(mut cache) = self.page_cache.lock() {
            if changes.is_empty() {
                cache.pop(group_id);
            } else {
                cache.put(*group_id, changes.to_vec());
            }
        }
    }

    fn discard_cached_changes(&self, group_id: &GroupIdentifier) {
        if let Ok(mut cache) = self.page_cache.lock() {
            cache.pop(group_id);
        }
    }

    // -----------------------------------------------------------------------
    // The refresh itself
    // -----------------------------------------------------------------------

    async fn run_refresh(
        &self,
        params: &GroupParams,
        mode: GroupUpdateMode,
        options: GroupModelOptions,
    ) -> RefreshResult {
        let incremental = tokio::time::timeout(
            GROUP_UPDATE_TIMEOUT,
            self.fetch_and_apply_changes(params, mode, options),
        )
        .await
        .unwrap_or(Err(GroupsError::Timeout));

        match incremental {
            Ok(model) => Ok(model),
            Err(error) if error.is_snapshot_recoverable() => {
                log::warn!("Incremental refresh failed ({}); trying a snapshot", error);
                tokio::time::timeout(
                    GROUP_UPDATE_TIMEOUT,
                    self.fetch_and_apply_snapshot(params, options),
                )
                .await
                .unwrap_or(Err(GroupsError::Timeout))
            }
            Err(error) => Err(error),
        }
    }

    async fn fetch_and_apply_changes(
        &self,
        params: &GroupParams,
        mode: GroupUpdateMode,
        options: GroupModelOptions,
    ) -> RefreshResult {
        let group_id = params.group_id;
        let store = self.gateway.store();
        let local = self.gateway.account().identifiers;

        loop {
            let model = store.load_group(&group_id);
            let member_locally = model
                .as_ref()
                .map(|m| {
                    !m.is_join_request_placeholder
                        && m.membership.is_local_user_full_or_invited(&local)
                })
                .unwrap_or(false);

            let page = match self.cached_changes(&group_id, mode.up_to_revision()) {
                Some(changes) => {
                    log::debug!("Using {} cached change entries", changes.len());
                    GroupChangePage { changes, early_end: None, endorsements: None }
                }
                None => {
                    let page = self
                        .fetch_change_page(params, model.as_ref(), member_locally, mode)
                        .await?;
                    self.store_cached_changes(&group_id, &page.changes);
                    page
                }
            };

            let model = self.apply_change_page(params, &page, mode, options).await?;
            if let Some(records) = page.endorsements {
                store.replace_endorsements(&group_id, Some(records));
            }

            match page.early_end {
                None => return Ok(model),
                Some(early_end) => {
                    if let Some(bound) = mode.up_to_revision() {
                        if bound <= early_end {
                            // Didn't fetch everything, but fetched enough.
                            return Ok(model);
                        }
                    }
                    log::info!("Change log truncated at {}, fetching more", early_end);
                }
            }
        }
    }

    async fn fetch_change_page(
        &self,
        params: &GroupParams,
        model: Option<&GroupModel>,
        member_locally: bool,
        mode: GroupUpdateMode,
    ) -> Result<GroupChangePage, GroupsError> {
        if member_locally {
            let revision = model.map(|m| m.revision).unwrap_or(0);
            let (from, require_first_snapshot) = if mode.includes_current_revision() {
                (revision, true)
            } else {
                (revision.wrapping_add(1), false)
            };
            match self
                .gateway
                .fetch_change_page(params, from, require_first_snapshot)
                .await
            {
                Ok(page) => Ok(page),
                Err(GroupsError::NotInGroup) => {
                    // Local state says member, the service says otherwise.
                    // Find the revision we were (re)added at and retry from
                    // there, including the first state.
                    log::info!("Not in group at {}; looking up re-add revision", from);
                    let joined_at = self.gateway.fetch_joined_at_revision(params).await?;
                    self.gateway.fetch_change_page(params, joined_at, true).await
                }
                Err(error) => Err(error),
            }
        } else {
            // We have never seen this group (or don't think we're in it):
            // ask the service where our membership starts.
            let joined_at = self.gateway.fetch_joined_at_revision(params).await?;
            self.gateway.fetch_change_page(params, joined_at, true).await
        }
    }

    async fn apply_change_page(
        &self,
        params: &GroupParams,
        page: &GroupChangePage,
        mode: GroupUpdateMode,
        options: GroupModelOptions,
    ) -> RefreshResult {
        let group_id = params.group_id;
        let store = self.gateway.store();
        let local = self.gateway.account().identifiers;
        let events = self.gateway.events();

        let mut all_profile_keys: BTreeMap<Aci, ProfileKey> = BTreeMap::new();
        let mut authoritative_profile_keys: BTreeMap<Aci, ProfileKey> = BTreeMap::new();
        let mut local_added_by: Option<ServiceId> = None;

        for (index, change) in page.changes.iter().enumerate() {
            if let Some(bound) = mode.up_to_revision() {
                if change.revision > bound {
                    log::info!(
                        "Stopping at revision bound {}; {} not applied",
                        bound,
                        change.revision
                    );
                    break;
                }
            }

            // Fresh read immediately before every commit.
            let current = store.load_group(&group_id);

            let Some(current) = current else {
                // First contact with this group: only a snapshot can seed it.
                let Some(snapshot) = &change.snapshot else {
                    return Err(GroupsError::MissingChangeActions);
                };
                let avatars = self
                    .avatars_for_paths(params, snapshot.avatar_url_path.clone().into_iter().collect())
                    .await;
                let model = translate::model_from_snapshot(snapshot, params, &avatars, &options);
                store.upsert_group(&model);
                events.emit(GroupEvent::UpdatedToRevision {
                    group_id,
                    revision: model.revision,
                    user_facing: true,
                });
                if translate::was_local_user_added(change, params, &local) {
                    local_added_by = change
                        .actions
                        .as_ref()
                        .and_then(|actions| translate::update_source(actions, params));
                }
                for (aci, profile_key) in &snapshot.profile_keys {
                    all_profile_keys.insert(*aci, *profile_key);
                }
                continue;
            };

            if change.revision <= current.revision {
                // Already reflected locally; applying again is a no-op.
                continue;
            }

            let is_single_revision_step = current.revision.wrapping_add(1) == change.revision;

            // Placeholders can only be healed by the first entry approving
            // our join request; everything else needs the snapshot path.
            if current.is_join_request_placeholder {
                let acceptable = index == 0
                    && is_single_revision_step
                    && change.snapshot.is_some()
                    && current.membership.is_requesting_member(&local.aci);
                if !acceptable {
                    return Err(GroupsError::CantApplyToPlaceholder);
                }
            }

            let applied = if is_single_revision_step
                && change.actions.is_some()
                && !current.is_join_request_placeholder
            {
                let actions = change.actions.as_ref().ok_or(GroupsError::MissingChangeActions)?;
                let avatar_paths = actions
                    .modify_avatar
                    .clone()
                    .flatten()
                    .into_iter()
                    .collect();
                let avatars = self.avatars_for_paths(params, avatar_paths).await;
                let applied = translate::apply_change_actions(&current, actions, &avatars, &local)?;
                applied
            } else if let Some(snapshot) = &change.snapshot {
                let avatars = self
                    .avatars_for_paths(params, snapshot.avatar_url_path.clone().into_iter().collect())
                    .await;
                let model = translate::model_from_snapshot(snapshot, params, &avatars, &options);
                crate::groups::change::AppliedChange {
                    new_model: model,
                    profile_keys: snapshot.profile_keys.clone(),
                    update_source: None,
                    newly_learned_pni_to_aci: Vec::new(),
                    was_local_user_added: translate::was_local_user_added(change, params, &local),
                }
            } else {
                // A delta that skips revisions cannot be applied.
                return Err(GroupsError::IncompatibleRevision);
            };

            let mut new_model = applied.new_model;
            if current.is_join_request_placeholder
                && !new_model.membership.is_full_member(&ServiceId::Aci(local.aci))
            {
                return Err(GroupsError::CantApplyToPlaceholder);
            }
            if current.did_just_add_self_via_group_link {
                new_model.did_just_add_self_via_group_link = true;
            }

            // Promotions: explicit from the delta, or inferred when an
            // unauthored snapshot moved exactly one invite to one member.
            for (pni, aci) in &applied.newly_learned_pni_to_aci {
                events.emit(GroupEvent::MemberPromoted { group_id, pni: *pni, aci: *aci });
            }
            if change.actions.is_none() {
                if let Some((pni, aci)) =
                    detect_promotion(&current.membership, &new_model.membership)
                {
                    events.emit(GroupEvent::MemberPromoted { group_id, pni, aci });
                }
            }

            let user_facing = current.has_user_facing_change(&new_model);
            store.upsert_group(&new_model);
            events.emit(GroupEvent::UpdatedToRevision {
                group_id,
                revision: new_model.revision,
                user_facing,
            });

            if applied.was_local_user_added {
                local_added_by = applied.update_source;
            }
            if let Some(ServiceId::Aci(author)) = applied.update_source {
                if let Some(profile_key) = applied.profile_keys.get(&author) {
                    authoritative_profile_keys.insert(author, *profile_key);
                }
            }
            for (aci, profile_key) in &applied.profile_keys {
                all_profile_keys.insert(*aci, *profile_key);
            }
        }

        // Authoritative entries override whatever else we observed.
        for (aci, profile_key) in &authoritative_profile_keys {
            all_profile_keys.insert(*aci, *profile_key);
        }

        self.post_merge_checks(&group_id, &local, local_added_by, &all_profile_keys);

        store.load_group(&group_id).ok_or(GroupsError::NotInGroup)
    }

    async fn fetch_and_apply_snapshot(
        &self,
        params: &GroupParams,
        options: GroupModelOptions,
    ) -> RefreshResult {
        let group_id = params.group_id;
        let store = self.gateway.store();
        let local = self.gateway.account().identifiers;

        let (snapshot, endorsements) = self.gateway.fetch_snapshot(params).await?;
        let avatars = self
            .avatars_for_paths(params, snapshot.avatar_url_path.clone().into_iter().collect())
            .await;

        let current = store.load_group(&group_id);
        if let Some(current) = &current {
            if !current.is_join_request_placeholder && snapshot.revision < current.revision {
                // The service cannot move us backwards.
                log::warn!(
                    "Snapshot at {} older than local {}; ignoring",
                    snapshot.revision,
                    current.revision
                );
                return Ok(current.clone());
            }
        }

        let mut new_model = translate::model_from_snapshot(&snapshot, params, &avatars, &options);
        if let Some(current) = &current {
            // Preserve the transient marker when overwriting at the same
            // revision.
            if current.revision == new_model.revision && current.did_just_add_self_via_group_link
            {
                new_model.did_just_add_self_via_group_link = true;
            }
            if current.persisted_state_eq(&new_model) {
                store.upsert_group(&new_model);
                store.replace_endorsements(&group_id, endorsements);
                return Ok(new_model);
            }
            if let Some((pni, aci)) = detect_promotion(&current.membership, &new_model.membership)
            {
                self.gateway.events().emit(GroupEvent::MemberPromoted { group_id, pni, aci });
            }
        }

        let user_facing = current
            .as_ref()
            .map(|c| c.has_user_facing_change(&new_model))
            .unwrap_or(true);
        store.upsert_group(&new_model);
        store.replace_endorsements(&group_id, endorsements);
        self.gateway.events().emit(GroupEvent::UpdatedToRevision {
            group_id,
            revision: new_model.revision,
            user_facing,
        });

        self.post_merge_checks(&group_id, &local, None, &snapshot.profile_keys);
        Ok(new_model)
    }

    fn post_merge_checks(
        &self,
        group_id: &GroupIdentifier,
        local: &LocalIdentifiers,
        local_added_by: Option<ServiceId>,
        profile_keys: &BTreeMap<Aci, ProfileKey>,
    ) {
        let store = self.gateway.store();
        let events = self.gateway.events();

        if let Some(adder) = local_added_by {
            let added_by_self = local.contains(&adder);
            if !added_by_self && store.is_service_id_blocked(&adder) {
                // Added by someone we blocked: leave once message
                // processing quiesces.
                log::info!("Added to {:?} by a blocked user", group_id);
                events.emit(GroupEvent::ScheduledAutoLeave { group_id: *group_id });
                return;
            }
        }

        if let Some(profile_key) = profile_keys.get(&local.aci) {
            if *profile_key != self.gateway.account().profile_key {
                // The group carries a stale key for us; push a fresh one.
                log::info!("Stale local profile key in {:?}", group_id);
                events.emit(GroupEvent::ScheduledProfileKeyRotation { group_id: *group_id });
            }
        }
    }

    async fn avatars_for_paths(
        &self,
        params: &GroupParams,
        url_paths: Vec<String>,
    ) -> DownloadedAvatars {
        if url_paths.is_empty() {
            return DownloadedAvatars::new();
        }
        self.gateway
            .fetch_avatars(params, url_paths, &DownloadedAvatars::new())
            .await
    }
}

/// The promotion heuristic: a symmetric difference of exactly one invited
/// secondary identity removed and one primary identity added is one
/// promotion, not two unrelated membership changes. Known approximation: it
/// can misfire when two unrelated single-member changes land in the same
/// revision.
fn detect_promotion(old: &GroupMembership, new: &GroupMembership) -> Option<(Pni, Aci)> {
    let invited_removed: Vec<Pni> = old
        .invited_members()
        .into_iter()
        .filter(|id| !new.is_member_of_any_kind(id))
        .filter_map(|id| id.pni())
        .collect();
    let full_added: Vec<Aci> = new
        .full_members()
        .into_iter()
        .filter(|id| !old.is_member_of_any_kind(id))
        .filter_map(|id| id.aci())
        .collect();
    match (invited_removed.as_slice(), full_added.as_slice()) {
        ([pni], [aci]) => Some((*pni, *aci)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

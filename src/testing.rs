/// In-memory group service for hermetic tests.
///
/// `TestServer` holds authoritative group state and an append-only change
/// log; `TestClient` implements the transport contract for one acting user.
/// The server enforces the same contract the engine is written against:
/// optimistic concurrency (409 on a stale revision), membership-gated reads
/// (403), invite-password checks with the ban marker header, and paginated
/// change logs with a `Content-Range` header.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::crypto::GroupParams;
use crate::groups::change::DownloadedAvatars;
use crate::groups::ids::{
    Aci, GroupIdentifier, LocalIdentifiers, ProfileKey, ProfileKeyCredential, ServiceId,
};
use crate::groups::model::GroupModel;
use crate::service::invite_link::invite_password_matches;
use crate::service::transport::{
    paths, AuthCredential, GroupRequest, GroupResponse, GroupTransport, HttpMethod,
    TransportError, FORBIDDEN_REASON_BANNED, FORBIDDEN_REASON_HEADER,
};
use crate::wire;
use crate::wire::translate;
use crate::wire::{
    GroupChangeActions, GroupChangeEntryWire, GroupChangePageWire, GroupSnapshotResponseWire,
    GroupSnapshotWire, JoinedAtRevisionWire, SendEndorsementsWire,
};

const FAR_FUTURE_MS: i64 = 4_000_000_000_000;

struct LogEntry {
    revision: u32,
    actions: Option<GroupChangeActions>,
    snapshot: GroupSnapshotWire,
}

struct ServerState {
    params: GroupParams,
    model: Option<GroupModel>,
    profile_keys: BTreeMap<Aci, ProfileKey>,
    log: Vec<LogEntry>,
    joined_at: BTreeMap<Aci, u32>,
    invite_password: Option<Vec<u8>>,
    banned_from_link: HashSet<Aci>,
    registered: BTreeMap<Aci, ProfileKey>,
    avatars: HashMap<String, Vec<u8>>,
    next_avatar: u32,
    page_size: usize,
    inject_auth_failures: u32,
    inject_network_failures: u32,
    inject_one_400: bool,
    requests_seen: u32,
}

pub(crate) struct TestServer {
    state: Arc<Mutex<ServerState>>,
}

impl TestServer {
    pub(crate) fn new(params: GroupParams) -> Self {
        TestServer {
            state: Arc::new(Mutex::new(ServerState {
                params,
                model: None,
                profile_keys: BTreeMap::new(),
                log: Vec::new(),
                joined_at: BTreeMap::new(),
                invite_password: None,
                banned_from_link: HashSet::new(),
                registered: BTreeMap::new(),
                avatars: HashMap::new(),
                next_avatar: 0,
                page_size: usize::MAX,
                inject_auth_failures: 0,
                inject_network_failures: 0,
                inject_one_400: false,
                requests_seen: 0,
            })),
        }
    }

    pub(crate) fn client(&self, acting: LocalIdentifiers) -> TestClient {
        TestClient { state: Arc::clone(&self.state), acting }
    }

    /// Make a user known to the credential issuer.
    pub(crate) fn register_user(&self, aci: Aci, profile_key: ProfileKey) {
        let mut state = self.state.lock().unwrap();
        state.registered.insert(aci, profile_key);
    }

    /// Install authoritative state directly, bypassing the create flow.
    pub(crate) fn seed(&self, model: &GroupModel, profile_keys: BTreeMap<Aci, ProfileKey>) {
        let mut state = self.state.lock().unwrap();
        state.profile_keys = profile_keys;
        let snapshot = translate::build_snapshot_wire(model, &state.profile_keys).unwrap();
        for id in model.membership.full_members() {
            if let Some(aci) = id.aci() {
                state.joined_at.entry(aci).or_insert(model.revision);
            }
        }
        state.log.push(LogEntry { revision: model.revision, actions: None, snapshot });
        state.model = Some(model.clone());
    }

    pub(crate) fn set_invite_password(&self, password: Vec<u8>) {
        self.state.lock().unwrap().invite_password = Some(password);
    }

    pub(crate) fn ban_from_link(&self, aci: Aci) {
        self.state.lock().unwrap().banned_from_link.insert(aci);
    }

    pub(crate) fn set_page_size(&self, page_size: usize) {
        self.state.lock().unwrap().page_size = page_size;
    }

    /// Drop log entries below the given revision, as a server that expired
    /// old history would.
    pub(crate) fn truncate_log_below(&self, revision: u32) {
        self.state.lock().unwrap().log.retain(|entry| entry.revision >= revision);
    }

    pub(crate) fn inject_auth_failures(&self, count: u32) {
        self.state.lock().unwrap().inject_auth_failures = count;
    }

    pub(crate) fn inject_network_failures(&self, count: u32) {
        self.state.lock().unwrap().inject_network_failures = count;
    }

    pub(crate) fn inject_one_400(&self) {
        self.state.lock().unwrap().inject_one_400 = true;
    }

    pub(crate) fn requests_seen(&self) -> u32 {
        self.state.lock().unwrap().requests_seen
    }

    pub(crate) fn revision(&self) -> u32 {
        self.state.lock().unwrap().model.as_ref().map(|m| m.revision).unwrap_or(0)
    }

    pub(crate) fn model(&self) -> Option<GroupModel> {
        self.state.lock().unwrap().model.clone()
    }

    /// Apply a change authored by `actor` directly on the server, as a
    /// concurrent writer would.
    pub(crate) fn submit_change_as(
        &self,
        actor: Aci,
        changes: &crate::outgoing::OutgoingChanges,
    ) {
        let mut state = self.state.lock().unwrap();
        let model = state.model.clone().expect("group not created");
        let local = LocalIdentifiers::new(actor, None);
        let credentials: BTreeMap<Aci, ProfileKeyCredential> = state
            .registered
            .iter()
            .map(|(aci, profile_key)| {
                (
                    *aci,
                    ProfileKeyCredential {
                        aci: *aci,
                        profile_key: *profile_key,
                        expiration_ms: FAR_FUTURE_MS,
                    },
                )
            })
            .collect();
        let built = changes
            .build_change_actions(&model, &local, &credentials, 1_000)
            .expect("failed to build concurrent change")
            .expect("concurrent change was a no-op");
        let mut actions = built.actions;
        actions.source_user_id = state
            .params
            .encrypt_service_id(&ServiceId::Aci(actor))
            .unwrap();
        apply_actions_locked(&mut state, &actions, &local).expect("concurrent apply failed");
    }
}

fn apply_actions_locked(
    state: &mut ServerState,
    actions: &GroupChangeActions,
    actor: &LocalIdentifiers,
) -> Result<(), crate::error::GroupsError> {
    let model = state.model.clone().ok_or(crate::error::GroupsError::GroupDoesNotExist)?;
    let applied =
        translate::apply_change_actions(&model, actions, &DownloadedAvatars::new(), actor)?;
    for (aci, profile_key) in &applied.profile_keys {
        state.profile_keys.insert(*aci, *profile_key);
    }
    for id in applied.new_model.membership.full_members() {
        if let Some(aci) = id.aci() {
            state.joined_at.entry(aci).or_insert(actions.revision);
        }
    }
    let snapshot = translate::build_snapshot_wire(&applied.new_model, &state.profile_keys)
        .expect("snapshot build failed");
    state.log.push(LogEntry {
        revision: actions.revision,
        actions: Some(actions.clone()),
        snapshot,
    });
    state.model = Some(applied.new_model);
    Ok(())
}

// ---------------------------------------------------------------------------
// TestClient
// ---------------------------------------------------------------------------

pub(crate) struct TestClient {
    state: Arc<Mutex<ServerState>>,
    acting: LocalIdentifiers,
}

impl TestClient {
    fn handle(&self, request: GroupRequest) -> Result<GroupResponse, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.requests_seen += 1;

        if state.inject_network_failures > 0 {
            state.inject_network_failures -= 1;
            return Err(TransportError::Network("injected".into()));
        }
        if state.inject_auth_failures > 0 {
            state.inject_auth_failures -= 1;
            return Ok(GroupResponse::new(401, Vec::new()));
        }

        let actor = self.acting.aci;
        let is_full_member = state
            .model
            .as_ref()
            .map(|m| m.membership.is_full_member(&ServiceId::Aci(actor)))
            .unwrap_or(false);
        let is_requesting = state
            .model
            .as_ref()
            .map(|m| m.membership.is_requesting_member(&actor))
            .unwrap_or(false);
        // Full and invited members may read group state.
        let is_reader = state
            .model
            .as_ref()
            .map(|m| {
                m.membership.is_full_member(&ServiceId::Aci(actor))
                    || m.membership.is_invited_member(&ServiceId::Aci(actor))
                    || self
                        .acting
                        .pni
                        .map(|pni| m.membership.is_invited_member(&ServiceId::Pni(pni)))
                        .unwrap_or(false)
            })
            .unwrap_or(false);

        match (request.method, request.path.as_str()) {
            (HttpMethod::Put, path) if path == paths::GROUP => {
                if state.inject_one_400 {
                    state.inject_one_400 = false;
                    return Ok(GroupResponse::new(400, Vec::new()));
                }
                let snapshot: GroupSnapshotWire = match wire::decode(&request.body) {
                    Ok(snapshot) => snapshot,
                    Err(_) => return Ok(GroupResponse::new(400, Vec::new())),
                };
                let params = state.params.clone();
                let parsed = translate::parse_snapshot(&snapshot, &params);
                let model = translate::model_from_snapshot(
                    &parsed,
                    &params,
                    &DownloadedAvatars::new(),
                    &Default::default(),
                );
                for (aci, profile_key) in &parsed.profile_keys {
                    state.profile_keys.insert(*aci, *profile_key);
                }
                for id in model.membership.full_members() {
                    if let Some(aci) = id.aci() {
                        state.joined_at.entry(aci).or_insert(0);
                    }
                }
                state.invite_password = model.invite_link_password.clone();
                state.log.push(LogEntry { revision: 0, actions: None, snapshot });
                state.model = Some(model);
                Ok(GroupResponse::new(200, Vec::new()))
            }

            (HttpMethod::Patch, path) if path == paths::GROUP => {
                if state.inject_one_400 {
                    state.inject_one_400 = false;
                    return Ok(GroupResponse::new(400, Vec::new()));
                }
                let mut actions: GroupChangeActions = match wire::decode(&request.body) {
                    Ok(actions) => actions,
                    Err(_) => return Ok(GroupResponse::new(400, Vec::new())),
                };
                let Some(model) = state.model.clone() else {
                    return Ok(GroupResponse::new(404, Vec::new()));
                };

                // Authorization: members act freely; outsiders only through
                // a valid invite link or on their own pending state.
                let is_member_of_any_kind = model
                    .membership
                    .is_member_of_any_kind(&ServiceId::Aci(actor))
                    || self
                        .acting
                        .pni
                        .map(|pni| {
                            model.membership.is_member_of_any_kind(&ServiceId::Pni(pni))
                        })
                        .unwrap_or(false);
                if let Some(submitted_password) = &request.invite_link_password {
                    if state.banned_from_link.contains(&actor) {
                        return Ok(GroupResponse::new(403, Vec::new())
                            .with_header(FORBIDDEN_REASON_HEADER, FORBIDDEN_REASON_BANNED));
                    }
                    let link_open = model.access.is_invite_link_enabled();
                    let password_ok = state
                        .invite_password
                        .as_ref()
                        .map(|expected| invite_password_matches(expected, submitted_password))
                        .unwrap_or(false);
                    if !link_open || !password_ok {
                        return Ok(GroupResponse::new(403, Vec::new()));
                    }
                } else if !is_member_of_any_kind {
                    return Ok(GroupResponse::new(403, Vec::new()));
                }

                if actions.revision != model.revision + 1 {
                    return Ok(GroupResponse::new(409, Vec::new()));
                }

                actions.source_user_id = state
                    .params
                    .encrypt_service_id(&ServiceId::Aci(actor))
                    .unwrap();
                if apply_actions_locked(&mut state, &actions, &self.acting).is_err() {
                    return Ok(GroupResponse::new(400, Vec::new()));
                }
                let body = wire::encode(&actions).unwrap();
                Ok(GroupResponse::new(200, body))
            }

            (HttpMethod::Get, path) if path == paths::GROUP => {
                if !is_reader {
                    return Ok(GroupResponse::new(403, Vec::new()));
                }
                let model = state.model.clone().unwrap();
                let snapshot =
                    translate::build_snapshot_wire(&model, &state.profile_keys).unwrap();
                let response = GroupSnapshotResponseWire {
                    snapshot,
                    endorsements: Some(make_endorsements(&state, &model)),
                };
                Ok(GroupResponse::new(200, wire::encode(&response).unwrap()))
            }

            (HttpMethod::Get, path) if path.starts_with(paths::GROUP_LOGS) => {
                if !is_reader {
                    return Ok(GroupResponse::new(403, Vec::new()));
                }
                let (from, require_first_snapshot) = parse_logs_path(path);
                let model = state.model.clone().unwrap();
                let matching: Vec<&LogEntry> =
                    state.log.iter().filter(|entry| entry.revision >= from).collect();
                let truncated = matching.len() > state.page_size;
                let page: Vec<&LogEntry> =
                    matching.into_iter().take(state.page_size).collect();

                let mut entries = Vec::new();
                for (index, entry) in page.iter().enumerate() {
                    let want_snapshot =
                        entry.actions.is_none() || (index == 0 && require_first_snapshot);
                    entries.push(GroupChangeEntryWire {
                        actions: entry.actions.clone(),
                        snapshot: want_snapshot.then(|| entry.snapshot.clone()),
                    });
                }
                let last_included = page.last().map(|entry| entry.revision).unwrap_or(from);
                let body = wire::encode(&GroupChangePageWire {
                    entries,
                    endorsements: Some(make_endorsements(&state, &model)),
                })
                .unwrap();

                if truncated {
                    let header = format!(
                        "versions {}-{}/{}",
                        last_included,
                        model.revision,
                        state.log.len()
                    );
                    Ok(GroupResponse::new(206, body).with_header("content-range", &header))
                } else {
                    Ok(GroupResponse::new(200, body))
                }
            }

            (HttpMethod::Get, path) if path == paths::JOINED_AT_REVISION => {
                match state.joined_at.get(&actor) {
                    Some(revision) if is_full_member => {
                        let body = wire::encode(&JoinedAtRevisionWire {
                            joined_at_revision: *revision,
                        })
                        .unwrap();
                        Ok(GroupResponse::new(200, body))
                    }
                    _ => Ok(GroupResponse::new(403, Vec::new())),
                }
            }

            (HttpMethod::Get, path) if path == paths::INVITE_LINK_PREVIEW => {
                let Some(model) = state.model.clone() else {
                    return Ok(GroupResponse::new(404, Vec::new()));
                };
                let authorized = if is_full_member || is_requesting {
                    true
                } else if let Some(submitted) = &request.invite_link_password {
                    if state.banned_from_link.contains(&actor) {
                        return Ok(GroupResponse::new(403, Vec::new())
                            .with_header(FORBIDDEN_REASON_HEADER, FORBIDDEN_REASON_BANNED));
                    }
                    model.access.is_invite_link_enabled()
                        && state
                            .invite_password
                            .as_ref()
                            .map(|expected| invite_password_matches(expected, submitted))
                            .unwrap_or(false)
                } else {
                    false
                };
                if !authorized {
                    return Ok(GroupResponse::new(403, Vec::new()));
                }

                let params = state.params.clone();
                let preview = wire::GroupInviteLinkPreviewWire {
                    title: if model.title.is_empty() {
                        Vec::new()
                    } else {
                        params.encrypt_title(&model.title).unwrap()
                    },
                    description: match &model.description {
                        Some(description) => params.encrypt_description(description).unwrap(),
                        None => Vec::new(),
                    },
                    avatar_url_path: model.avatar_url_path.clone(),
                    member_count: model.membership.full_members().len() as u32,
                    add_from_invite_link_access: model.access.add_from_invite_link.to_wire(),
                    revision: model.revision,
                    is_local_user_requesting_member: is_requesting,
                };
                Ok(GroupResponse::new(200, wire::encode(&preview).unwrap()))
            }

            (HttpMethod::Put, path) if path == paths::AVATAR => {
                state.next_avatar += 1;
                let url_path = format!("/avatars/{}", state.next_avatar);
                state.avatars.insert(url_path.clone(), request.body);
                Ok(GroupResponse::new(200, url_path.into_bytes()))
            }

            (HttpMethod::Get, path) if path.starts_with("/avatars/") => {
                match state.avatars.get(path) {
                    Some(data) => Ok(GroupResponse::new(200, data.clone())),
                    None => Ok(GroupResponse::new(404, Vec::new())),
                }
            }

            (HttpMethod::Get, path) if path == paths::EXTERNAL_CREDENTIAL => {
                if !is_full_member {
                    return Ok(GroupResponse::new(403, Vec::new()));
                }
                Ok(GroupResponse::new(200, vec![0xCC; 16]))
            }

            _ => Ok(GroupResponse::new(404, Vec::new())),
        }
    }
}

fn parse_logs_path(path: &str) -> (u32, bool) {
    let rest = path.strip_prefix(paths::GROUP_LOGS).unwrap_or(path);
    let rest = rest.strip_prefix('/').unwrap_or(rest);
    let (from, query) = rest.split_once('?').unwrap_or((rest, ""));
    let from = from.parse().unwrap_or(0);
    let require_first_snapshot = query.contains("firstSnapshot=true");
    (from, require_first_snapshot)
}

fn make_endorsements(state: &ServerState, model: &GroupModel) -> SendEndorsementsWire {
    let per_member = model
        .membership
        .full_members()
        .into_iter()
        .map(|id| {
            let sealed = state.params.encrypt_service_id(&id).unwrap();
            (sealed, vec![0xE0])
        })
        .collect();
    SendEndorsementsWire {
        expiration_ms: FAR_FUTURE_MS,
        combined: vec![0xEE; 8],
        per_member,
    }
}

impl GroupTransport for TestClient {
    async fn send(&self, request: GroupRequest) -> Result<GroupResponse, TransportError> {
        self.handle(request)
    }

    async fn fetch_auth_credential(&self) -> Result<AuthCredential, TransportError> {
        Ok(AuthCredential { token: self.acting.aci.as_bytes().to_vec() })
    }

    async fn fetch_profile_key_credentials(
        &self,
        acis: Vec<Aci>,
        _force_refresh: bool,
    ) -> Result<BTreeMap<Aci, ProfileKeyCredential>, TransportError> {
        let state = self.state.lock().unwrap();
        Ok(acis
            .into_iter()
            .filter_map(|aci| {
                state.registered.get(&aci).map(|profile_key| {
                    (
                        aci,
                        ProfileKeyCredential {
                            aci,
                            profile_key: *profile_key,
                            expiration_ms: FAR_FUTURE_MS,
                        },
                    )
                })
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Shared fixtures
// ---------------------------------------------------------------------------

pub(crate) fn test_aci(n: u8) -> Aci {
    Aci::from_bytes([n; 16])
}

pub(crate) fn test_profile_key(n: u8) -> ProfileKey {
    ProfileKey::from_bytes([n; 32])
}

pub(crate) fn test_params(n: u8) -> GroupParams {
    GroupParams::from_master_key(&crate::groups::ids::GroupMasterKey::from_bytes([n; 32]))
}

pub(crate) fn test_group_id(n: u8) -> GroupIdentifier {
    test_params(n).group_id
}

/// Domain representation of server-observed group changes.
///
/// A change log entry carries an authored delta (change actions at revision
/// prev+1), an unauthored full snapshot, or both. Snapshots have no per-field
/// authorship; deltas are preferred when applicable because they do.

use std::collections::BTreeMap;

use crate::error::GroupsError;
use crate::groups::access::GroupAccess;
use crate::groups::ids::{Aci, Pni, ProfileKey, ServiceId};
use crate::groups::membership::GroupMembership;
use crate::groups::model::{GroupModel, TimerToken};
use crate::wire::GroupChangeActions;

/// Full authoritative group state at one revision, decrypted.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupSnapshot {
    pub revision: u32,
    pub title: String,
    pub description: Option<String>,
    pub avatar_url_path: Option<String>,
    pub membership: GroupMembership,
    pub access: GroupAccess,
    pub invite_link_password: Option<Vec<u8>>,
    pub is_announcements_only: bool,
    pub timer: TimerToken,
    /// Profile keys observed in the snapshot. Non-authoritative: snapshots
    /// have no author.
    pub profile_keys: BTreeMap<Aci, ProfileKey>,
}

/// One entry of the server's change log.
#[derive(Clone, Debug)]
pub struct GroupChange {
    pub revision: u32,
    /// Authored delta, when the server provided one.
    pub actions: Option<GroupChangeActions>,
    /// Full state, when the server provided one.
    pub snapshot: Option<GroupSnapshot>,
}

impl GroupChange {
    /// At least one of actions/snapshot must be present.
    pub fn new(
        actions: Option<GroupChangeActions>,
        snapshot: Option<GroupSnapshot>,
    ) -> Result<Self, GroupsError> {
        let revision = match (&actions, &snapshot) {
            (Some(actions), _) => actions.revision,
            (None, Some(snapshot)) => snapshot.revision,
            (None, None) => return Err(GroupsError::MissingChangeActions),
        };
        Ok(GroupChange { revision, actions, snapshot })
    }
}

/// The result of applying one authored delta to a model.
#[derive(Clone, Debug)]
pub struct AppliedChange {
    pub new_model: GroupModel,
    /// All profile keys observed in the delta.
    pub profile_keys: BTreeMap<Aci, ProfileKey>,
    /// The author of the delta, when it could be established.
    pub update_source: Option<ServiceId>,
    /// Secondary-to-primary identity associations the delta revealed.
    pub newly_learned_pni_to_aci: Vec<(Pni, Aci)>,
    /// Whether this delta added the local user to the group.
    pub was_local_user_added: bool,
}

/// Decrypted avatar bytes keyed by service url path. Downloads that failed
/// or were skipped are simply absent; a missing avatar never fails a merge.
#[derive(Clone, Debug, Default)]
pub struct DownloadedAvatars {
    avatars: BTreeMap<String, Vec<u8>>,
}

impl DownloadedAvatars {
    pub fn new() -> Self {
        DownloadedAvatars::default()
    }

    pub fn from_model(model: &GroupModel) -> Self {
        let mut downloaded = DownloadedAvatars::new();
        if let (Some(path), Some(data)) = (&model.avatar_url_path, &model.avatar_data) {
            downloaded.set(path.clone(), data.clone());
        }
        downloaded
    }

    pub fn set(&mut self, url_path: String, data: Vec<u8>) {
        self.avatars.insert(url_path, data);
    }

    pub fn get(&self, url_path: &str) -> Option<&Vec<u8>> {
        self.avatars.get(url_path)
    }

    pub fn contains(&self, url_path: &str) -> bool {
        self.avatars.contains_key(url_path)
    }

    pub fn merge(&mut self, other: &DownloadedAvatars) {
        for (path, data) in &other.avatars {
            self.avatars.insert(path.clone(), data.clone());
        }
    }

    pub fn url_paths(&self) -> Vec<String> {
        self.avatars.keys().cloned().collect()
    }
}

/// Transport contract for the group service.
///
/// The application provides the actual HTTP stack; this crate only needs an
/// HTTP-shaped exchange: a method, a path, an auth credential, a body, and
/// back a status code, headers, and a body. Non-2xx statuses are data, not
/// transport errors; the gateway maps them per call site.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use thiserror::Error;

use crate::groups::ids::{Aci, ProfileKeyCredential};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection-level failure; retryable with backoff.
    #[error("Network failure: {0}")]
    Network(String),

    /// Transport-level timeout; retryable with backoff.
    #[error("Request timed out")]
    Timeout,

    /// The request was cancelled. Never retried, never conflated with a
    /// real failure.
    #[error("Request cancelled")]
    Cancelled,
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Network(_) | TransportError::Timeout)
    }
}

// ---------------------------------------------------------------------------
// Requests and responses
// ---------------------------------------------------------------------------

/// Short-lived token scoped to the group service; combined with the group's
/// public id it authenticates every request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthCredential {
    pub token: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Put,
    Patch,
    Delete,
}

#[derive(Clone, Debug)]
pub struct GroupRequest {
    pub method: HttpMethod,
    pub path: String,
    pub auth: AuthCredential,
    pub body: Vec<u8>,
    /// Present on invite-link endpoints only.
    pub invite_link_password: Option<Vec<u8>>,
}

#[derive(Clone, Debug)]
pub struct GroupResponse {
    pub status: u16,
    /// Header names stored lowercase.
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl GroupResponse {
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        GroupResponse { status, headers: BTreeMap::new(), body }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, 200 | 206)
    }
}

/// Header marker distinguishing a banned user from an expired link on 403.
pub const FORBIDDEN_REASON_HEADER: &str = "x-forbidden-reason";
pub const FORBIDDEN_REASON_BANNED: &str = "banned";

// ---------------------------------------------------------------------------
// Request paths
// ---------------------------------------------------------------------------

pub mod paths {
    pub const GROUP: &str = "/v2/groups";
    pub const GROUP_LOGS: &str = "/v2/groups/logs";
    pub const JOINED_AT_REVISION: &str = "/v2/groups/joined_at_revision";
    pub const INVITE_LINK_PREVIEW: &str = "/v2/groups/join";
    pub const AVATAR: &str = "/v2/groups/avatar";
    pub const EXTERNAL_CREDENTIAL: &str = "/v2/groups/token";
}

// ---------------------------------------------------------------------------
// Transport contract
// ---------------------------------------------------------------------------

pub trait GroupTransport: Send + Sync {
    /// Perform one exchange. Any HTTP status is an `Ok` response; `Err` is
    /// reserved for connection-level failures.
    fn send(
        &self,
        request: GroupRequest,
    ) -> impl Future<Output = Result<GroupResponse, TransportError>> + Send;

    /// Fetch a fresh short-lived auth credential.
    fn fetch_auth_credential(
        &self,
    ) -> impl Future<Output = Result<AuthCredential, TransportError>> + Send;

    /// Fetch profile key credentials for the given identities. Identities
    /// the service cannot vouch for are simply absent from the result.
    fn fetch_profile_key_credentials(
        &self,
        acis: Vec<Aci>,
        force_refresh: bool,
    ) -> impl Future<Output = Result<BTreeMap<Aci, ProfileKeyCredential>, TransportError>> + Send;
}

// ---------------------------------------------------------------------------
// Per-call 4xx policy
// ---------------------------------------------------------------------------

/// How to respond to a 400.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Behavior400 {
    Fail,
    /// The request carried profile key credentials; report for a single
    /// forced-credential-refresh retry.
    ReportForRecovery,
}

/// How to respond to a 403. The same status means very different things at
/// different call sites.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Behavior403 {
    Fail,
    /// Expected when we are not yet a member (e.g. joining via link); let
    /// the not-in-group error propagate without local correction.
    Ignore,
    /// An authenticated state fetch failed: we are out of the group and
    /// local state must reflect that.
    RemoveFromGroup,
    /// A privileged mutation failed: might be removal, might be a mere
    /// permission gap. The caller refreshes to find out, then surfaces.
    FetchGroupUpdates,
    /// An invite-link endpoint failed: translate via the ban header into
    /// blocked-from-joining vs expired-link.
    ReportInvalidOrBlockedGroupLink,
    /// A join-request endpoint failed: we are not a requesting member.
    NotARequestingMember,
}

/// How to respond to a 404.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Behavior404 {
    Fail,
    GroupDoesNotExist,
}

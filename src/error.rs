/// Error taxonomy for the group synchronization engine.
///
/// Structural conflicts (`TooManyMembers`, `ConflictingRoleChange`) surface
/// to the caller immediately. `ConflictingChange` and `Timeout` are
/// retryable at the write façade. `NotInGroup` is partly self-healing: the
/// gateway corrects local state or the refresh path recovers via snapshot.

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::groups::membership::MembershipError;
use crate::service::transport::TransportError;
use crate::wire::WireError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GroupsError {
    /// The server rejected the change because it was based on a stale
    /// revision. Refetch authoritative state, rebuild, retry once.
    #[error("Conflicting change on service")]
    ConflictingChange,

    /// Domain-level timeout around a whole update/refresh attempt.
    #[error("Group operation timed out")]
    Timeout,

    /// The local user is not a member of this group (or the group is
    /// unknown locally).
    #[error("Local user is not in the group")]
    NotInGroup,

    /// The proposed change would exceed the member hard cap.
    #[error("Too many members")]
    TooManyMembers,

    /// A role change targets an identity that is no longer a full member.
    #[error("Conflicting role change")]
    ConflictingRoleChange,

    /// The local user is not a requesting member of this group.
    #[error("Local user is not a requesting member")]
    NotARequestingMember,

    /// The local user already has a pending join request.
    #[error("Local user is already a requesting member")]
    AlreadyRequestingMember,

    /// Incremental changes cannot be applied to a placeholder model.
    #[error("Cannot apply changes to a placeholder group")]
    CantApplyToPlaceholder,

    /// The invite link is no longer valid.
    #[error("Expired or revoked group invite link")]
    ExpiredInviteLink,

    /// The local user has been banned from joining via this link.
    #[error("Local user is blocked from joining this group")]
    BlockedFromJoining,

    /// A change entry arrived for a revision that cannot be applied
    /// incrementally against local state.
    #[error("Change actions for an incompatible revision")]
    IncompatibleRevision,

    /// A change log entry carried neither change actions nor a snapshot.
    #[error("Change entry is missing both actions and snapshot")]
    MissingChangeActions,

    /// A 400 from a request that carried profile key credentials; retried
    /// once with a forced credential refresh before degrading.
    #[error("Recoverable request rejection")]
    Recoverable400,

    /// The group does not exist on the service.
    #[error("Group does not exist on the service")]
    GroupDoesNotExist,

    /// We joined as a requesting member and cannot fetch full group state.
    #[error("Requesting member cannot load group state")]
    RequestingMemberCantLoadState,

    /// The group is blocked locally; no refresh or update may run.
    #[error("Group is blocked")]
    GroupBlocked,

    /// A required profile key credential for the local user is missing.
    #[error("Missing local profile key credential")]
    MissingLocalCredential,

    /// A sealed attribute exceeds its size cap.
    #[error("Group attribute too long")]
    AttributeTooLong,

    /// The operation was cancelled. Never conflated with real failures.
    #[error("Operation cancelled")]
    Cancelled,

    /// Unexpected HTTP status surfaced verbatim.
    #[error("Service returned status {0}")]
    HttpStatus(u16),

    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("Crypto failure: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Wire codec failure: {0}")]
    Wire(#[from] WireError),

    #[error("Membership failure: {0}")]
    Membership(#[from] MembershipError),
}

impl GroupsError {
    /// Whether a higher layer may retry the failed operation wholesale.
    pub fn is_retryable(&self) -> bool {
        match self {
            GroupsError::ConflictingChange | GroupsError::Timeout => true,
            GroupsError::Transport(TransportError::Network(_))
            | GroupsError::Transport(TransportError::Timeout) => true,
            _ => false,
        }
    }

    /// Whether a failed incremental refresh should fail over to fetching
    /// and applying the latest snapshot.
    pub fn is_snapshot_recoverable(&self) -> bool {
        matches!(
            self,
            GroupsError::NotInGroup
                | GroupsError::CantApplyToPlaceholder
                | GroupsError::MissingChangeActions
                | GroupsError::IncompatibleRevision
        )
    }
}

/// Groupsync: a synchronization and conflict-resolution engine for
/// multi-party group state.
///
/// Group membership, roles and attributes live on a server as an opaque,
/// partially-encrypted revision log; many independent, occasionally-offline
/// clients converge on it through a monotonic revision counter. This crate
/// computes minimal outgoing change proposals, submits them under
/// optimistic concurrency, fetches and merges incremental change logs or
/// full snapshots, translates crypto-sealed fields and identifiers, and
/// reconciles local state with server revisions, including the invite-link
/// join state machine and placeholder models for pending join requests.
///
/// The application supplies three collaborators: a `GroupTransport` (the
/// HTTP stack), a `GroupStore` (the local database), and an
/// `OutboundDelivery` (the message-send pipeline). Everything else lives
/// here.

pub mod crypto;
pub mod error;
pub mod events;
pub mod groups;
pub mod limits;
pub mod outgoing;
pub mod refresh;
pub mod service;
pub mod store;
pub mod updater;
pub mod wire;

#[cfg(test)]
pub(crate) mod testing;

pub use crypto::{GroupParams, GroupSecretParams};
pub use error::GroupsError;
pub use events::{GroupEvent, GroupEvents};
pub use groups::access::{AccessLevel, GroupAccess};
pub use groups::ids::{
    Aci, GroupIdentifier, GroupMasterKey, LocalAccount, LocalIdentifiers, Pni, ProfileKey,
    ProfileKeyCredential, ServiceId,
};
pub use groups::membership::{AddableResult, GroupMembership, MemberState, Role};
pub use groups::model::{GroupModel, GroupModelOptions, TimerToken};
pub use outgoing::{InviteLinkMode, NotificationBehavior, OutgoingChanges};
pub use refresh::{GroupUpdateMode, RefreshOrchestrator};
pub use service::invite_link::{build_invite_link, parse_invite_link, GroupInviteLinkPreview};
pub use service::transport::{
    AuthCredential, GroupRequest, GroupResponse, GroupTransport, HttpMethod, TransportError,
};
pub use service::{GatewayConfig, GroupGateway};
pub use store::{GroupSendEndorsement, GroupStore, MemoryGroupStore, SendEndorsementRecords};
pub use updater::{
    GroupUpdateNotice, GroupUpdater, MemoryOutbox, NoticeRecipients, OutboundDelivery,
};

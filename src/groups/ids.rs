/// Identity types for the group system.
///
/// - `Aci`: a user's primary account identity
/// - `Pni`: a privacy-preserving phone-number-derived identity; may only be
///   invited to groups, never added directly
/// - `ServiceId`: either of the above
/// - `GroupMasterKey` / `GroupIdentifier`: per-group key material and the
///   stable public id derived from it

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Aci / Pni / ServiceId
// ---------------------------------------------------------------------------

/// Primary account identity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Aci(pub Uuid);

impl Aci {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Aci(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for Aci {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Aci({})", &self.0.simple().to_string()[..8])
    }
}

impl fmt::Display for Aci {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Phone-number-derived secondary identity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pni(pub Uuid);

impl Pni {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Pni(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for Pni {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pni({})", &self.0.simple().to_string()[..8])
    }
}

impl fmt::Display for Pni {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user identity of either kind.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ServiceId {
    Aci(Aci),
    Pni(Pni),
}

impl ServiceId {
    /// The primary identity, if this is one.
    pub fn aci(&self) -> Option<Aci> {
        match self {
            ServiceId::Aci(aci) => Some(*aci),
            ServiceId::Pni(_) => None,
        }
    }

    /// The secondary identity, if this is one.
    pub fn pni(&self) -> Option<Pni> {
        match self {
            ServiceId::Aci(_) => None,
            ServiceId::Pni(pni) => Some(*pni),
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, ServiceId::Aci(_))
    }

    pub fn raw_uuid(&self) -> Uuid {
        match self {
            ServiceId::Aci(aci) => aci.0,
            ServiceId::Pni(pni) => pni.0,
        }
    }
}

impl From<Aci> for ServiceId {
    fn from(aci: Aci) -> Self {
        ServiceId::Aci(aci)
    }
}

impl From<Pni> for ServiceId {
    fn from(pni: Pni) -> Self {
        ServiceId::Pni(pni)
    }
}

impl fmt::Debug for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceId::Aci(aci) => write!(f, "{:?}", aci),
            ServiceId::Pni(pni) => write!(f, "{:?}", pni),
        }
    }
}

// ---------------------------------------------------------------------------
// Local identity
// ---------------------------------------------------------------------------

/// The local user's identities. The secondary identity is optional; older
/// registrations may not have one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalIdentifiers {
    pub aci: Aci,
    pub pni: Option<Pni>,
}

impl LocalIdentifiers {
    pub fn new(aci: Aci, pni: Option<Pni>) -> Self {
        LocalIdentifiers { aci, pni }
    }

    /// Whether the given identity is one of the local user's.
    pub fn contains(&self, service_id: &ServiceId) -> bool {
        match service_id {
            ServiceId::Aci(aci) => *aci == self.aci,
            ServiceId::Pni(pni) => Some(*pni) == self.pni,
        }
    }
}

/// Local identities plus the local profile key.
#[derive(Clone)]
pub struct LocalAccount {
    pub identifiers: LocalIdentifiers,
    pub profile_key: ProfileKey,
}

impl LocalAccount {
    pub fn new(identifiers: LocalIdentifiers, profile_key: ProfileKey) -> Self {
        LocalAccount { identifiers, profile_key }
    }

    pub fn aci(&self) -> Aci {
        self.identifiers.aci
    }
}

// ---------------------------------------------------------------------------
// Profile keys and credentials
// ---------------------------------------------------------------------------

/// 32-byte profile key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProfileKey(pub [u8; 32]);

impl ProfileKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        ProfileKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ProfileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log key material.
        write!(f, "ProfileKey(..)")
    }
}

/// Short-lived proof that permits adding its holder directly to a group.
/// The contents are opaque to this crate beyond the fields needed to build
/// member entries and check expiration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileKeyCredential {
    pub aci: Aci,
    pub profile_key: ProfileKey,
    /// Expiration, milliseconds since the unix epoch.
    pub expiration_ms: i64,
}

impl ProfileKeyCredential {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expiration_ms <= now_ms
    }
}

// ---------------------------------------------------------------------------
// Group keys and identifiers
// ---------------------------------------------------------------------------

/// Per-group root key, carried in invite links. All other group key material
/// derives from it.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMasterKey(pub [u8; 32]);

impl GroupMasterKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        GroupMasterKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for GroupMasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupMasterKey(..)")
    }
}

/// Stable public group id, a BLAKE3 derivation from the group's key material.
/// Safe to log truncated, used as the database key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupIdentifier(pub [u8; 32]);

impl GroupIdentifier {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        GroupIdentifier(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut id = [0u8; 32];
        id.copy_from_slice(&bytes);
        Ok(GroupIdentifier(id))
    }
}

impl Ord for GroupIdentifier {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for GroupIdentifier {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for GroupIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupIdentifier({}..)", &self.to_hex()[..12])
    }
}

impl fmt::Display for GroupIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// Group-scoped encryption and identifier translation.
///
/// Every sealed field in a group record (title, description, avatar,
/// disappearing timer) and every opaque identifier (user id ciphertexts,
/// profile key ciphertexts) is encrypted under keys derived from the group's
/// master key:
///
/// - Blobs: XChaCha20-Poly1305 with a fresh random nonce, nonce prepended.
/// - Identifiers and profile keys: XChaCha20-Poly1305 with a synthetic
///   HMAC-derived nonce, so identical plaintext yields identical ciphertext
///   and the server can compare entries without reading them.
///
/// Decrypt paths consult the process-wide LRU cache in `cache.rs`; encrypt
/// paths populate it opportunistically.

use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::cache;
use crate::groups::ids::{Aci, GroupIdentifier, GroupMasterKey, Pni, ProfileKey, ServiceId};
use crate::groups::model::TimerToken;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Malformed sealed content")]
    MalformedContent,
}

pub type Result<T> = std::result::Result<T, CryptoError>;

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

const NONCE_LEN: usize = 24;

/// Domain tags for sealed blob kinds. The tag is the first plaintext byte,
/// so a ciphertext decrypted as the wrong kind fails closed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
enum BlobKind {
    Title = 1,
    Description = 2,
    Avatar = 3,
    Timer = 4,
}

const SERVICE_ID_TAG_ACI: u8 = 1;
const SERVICE_ID_TAG_PNI: u8 = 2;

/// Per-group key material. Derived from the master key; zeroized on drop;
/// never serialized in plaintext by this crate.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct GroupSecretParams {
    master: [u8; 32],
    blob_key: [u8; 32],
    member_key: [u8; 32],
    profile_key_key: [u8; 32],
}

impl GroupSecretParams {
    /// Derive the full parameter set from a master key.
    pub fn derive(master_key: &GroupMasterKey) -> Self {
        let hkdf = Hkdf::<Sha256>::new(None, master_key.as_bytes());
        let mut blob_key = [0u8; 32];
        let mut member_key = [0u8; 32];
        let mut profile_key_key = [0u8; 32];

        // expand() only fails for oversized outputs; 32 bytes always fits.
        let _ = hkdf.expand(b"Groupsync-Blob-v1", &mut blob_key);
        let _ = hkdf.expand(b"Groupsync-Member-v1", &mut member_key);
        let _ = hkdf.expand(b"Groupsync-ProfileKey-v1", &mut profile_key_key);

        GroupSecretParams {
            master: *master_key.as_bytes(),
            blob_key,
            member_key,
            profile_key_key,
        }
    }

    /// Generate parameters for a brand-new group.
    pub fn generate() -> Self {
        let mut master = [0u8; 32];
        OsRng.fill_bytes(&mut master);
        Self::derive(&GroupMasterKey::from_bytes(master))
    }

    pub fn master_key(&self) -> GroupMasterKey {
        GroupMasterKey::from_bytes(self.master)
    }

    /// The stable public group id.
    pub fn group_identifier(&self) -> GroupIdentifier {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"GROUPSYNC-GROUP-ID");
        hasher.update(&self.master);
        GroupIdentifier::from_bytes(*hasher.finalize().as_bytes())
    }
}

impl std::fmt::Debug for GroupSecretParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GroupSecretParams({:?})", self.group_identifier())
    }
}

// ---------------------------------------------------------------------------
// GroupParams
// ---------------------------------------------------------------------------

/// Secret params plus the derived public id; the handle every encrypt,
/// decrypt, and translate operation goes through.
#[derive(Clone, Debug)]
pub struct GroupParams {
    pub group_id: GroupIdentifier,
    secret: GroupSecretParams,
}

impl GroupParams {
    pub fn new(secret: GroupSecretParams) -> Self {
        let group_id = secret.group_identifier();
        GroupParams { group_id, secret }
    }

    pub fn from_master_key(master_key: &GroupMasterKey) -> Self {
        Self::new(GroupSecretParams::derive(master_key))
    }

    pub fn secret_params(&self) -> &GroupSecretParams {
        &self.secret
    }

    // -----------------------------------------------------------------------
    // Blob sealing
    // -----------------------------------------------------------------------

    fn seal_blob(&self, kind: BlobKind, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = XChaCha20Poly1305::new_from_slice(&self.secret.blob_key)
            .map_err(|_| CryptoError::InvalidKeyLength)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);

        let mut framed = Vec::with_capacity(1 + plaintext.len());
        framed.push(kind as u8);
        framed.extend_from_slice(plaintext);

        let ciphertext = cipher
            .encrypt(nonce, framed.as_slice())
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);

        cache::store(cache::cache_key(&self.group_id, &out), &framed);
        Ok(out)
    }

    fn open_blob(&self, kind: BlobKind, sealed: &[u8]) -> Result<Vec<u8>> {
        let key = cache::cache_key(&self.group_id, sealed);
        let framed = match cache::lookup(&key) {
            Some(framed) => framed,
            None => {
                if sealed.len() < NONCE_LEN + 16 {
                    return Err(CryptoError::DecryptionFailed);
                }
                let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
                let cipher = XChaCha20Poly1305::new_from_slice(&self.secret.blob_key)
                    .map_err(|_| CryptoError::InvalidKeyLength)?;
                let framed = cipher
                    .decrypt(XNonce::from_slice(nonce_bytes), ciphertext)
                    .map_err(|_| CryptoError::DecryptionFailed)?;
                cache::store(key, &framed);
                framed
            }
        };

        match framed.split_first() {
            Some((tag, rest)) if *tag == kind as u8 => Ok(rest.to_vec()),
            _ => Err(CryptoError::MalformedContent),
        }
    }

    pub fn encrypt_title(&self, title: &str) -> Result<Vec<u8>> {
        self.seal_blob(BlobKind::Title, title.as_bytes())
    }

    pub fn decrypt_title(&self, sealed: &[u8]) -> Result<String> {
        let bytes = self.open_blob(BlobKind::Title, sealed)?;
        String::from_utf8(bytes).map_err(|_| CryptoError::MalformedContent)
    }

    pub fn encrypt_description(&self, description: &str) -> Result<Vec<u8>> {
        self.seal_blob(BlobKind::Description, description.as_bytes())
    }

    pub fn decrypt_description(&self, sealed: &[u8]) -> Result<String> {
        let bytes = self.open_blob(BlobKind::Description, sealed)?;
        String::from_utf8(bytes).map_err(|_| CryptoError::MalformedContent)
    }

    pub fn encrypt_avatar(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.seal_blob(BlobKind::Avatar, data)
    }

    pub fn decrypt_avatar(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        self.open_blob(BlobKind::Avatar, sealed)
    }

    pub fn encrypt_timer(&self, timer: &TimerToken) -> Result<Vec<u8>> {
        let mut plaintext = Vec::new();
        ciborium::ser::into_writer(timer, &mut plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        self.seal_blob(BlobKind::Timer, &plaintext)
    }

    pub fn decrypt_timer(&self, sealed: &[u8]) -> Result<TimerToken> {
        let bytes = self.open_blob(BlobKind::Timer, sealed)?;
        ciborium::de::from_reader(bytes.as_slice()).map_err(|_| CryptoError::MalformedContent)
    }

    // -----------------------------------------------------------------------
    // Identifier translation (deterministic)
    // -----------------------------------------------------------------------

    fn synthetic_nonce(key: &[u8; 32], domain: u8, material: &[u8]) -> Result<[u8; NONCE_LEN]> {
        type HmacSha256 = Hmac<Sha256>;
        let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        mac.update(&[domain]);
        mac.update(material);
        let digest = mac.finalize().into_bytes();
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&digest[..NONCE_LEN]);
        Ok(nonce)
    }

    /// Translate an identity to its opaque ciphertext. Deterministic: the
    /// same identity always maps to the same bytes under the same params.
    pub fn encrypt_service_id(&self, service_id: &ServiceId) -> Result<Vec<u8>> {
        let mut framed = Vec::with_capacity(17);
        match service_id {
            ServiceId::Aci(aci) => {
                framed.push(SERVICE_ID_TAG_ACI);
                framed.extend_from_slice(aci.as_bytes());
            }
            ServiceId::Pni(pni) => {
                framed.push(SERVICE_ID_TAG_PNI);
                framed.extend_from_slice(pni.as_bytes());
            }
        }

        let nonce_bytes = Self::synthetic_nonce(&self.secret.member_key, 0x01, &framed)?;
        let cipher = XChaCha20Poly1305::new_from_slice(&self.secret.member_key)
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce_bytes), framed.as_slice())
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);

        cache::store(cache::cache_key(&self.group_id, &out), &framed);
        Ok(out)
    }

    /// Translate an opaque user-id ciphertext back to the identity.
    pub fn decrypt_service_id(&self, sealed: &[u8]) -> Result<ServiceId> {
        let key = cache::cache_key(&self.group_id, sealed);
        let framed = match cache::lookup(&key) {
            Some(framed) => framed,
            None => {
                if sealed.len() < NONCE_LEN + 16 {
                    return Err(CryptoError::DecryptionFailed);
                }
                let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
                let cipher = XChaCha20Poly1305::new_from_slice(&self.secret.member_key)
                    .map_err(|_| CryptoError::InvalidKeyLength)?;
                let framed = cipher
                    .decrypt(XNonce::from_slice(nonce_bytes), ciphertext)
                    .map_err(|_| CryptoError::DecryptionFailed)?;
                cache::store(key, &framed);
                framed
            }
        };

        if framed.len() != 17 {
            return Err(CryptoError::MalformedContent);
        }
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes.copy_from_slice(&framed[1..]);
        match framed[0] {
            SERVICE_ID_TAG_ACI => Ok(ServiceId::Aci(Aci::from_bytes(uuid_bytes))),
            SERVICE_ID_TAG_PNI => Ok(ServiceId::Pni(Pni::from_bytes(uuid_bytes))),
            _ => Err(CryptoError::MalformedContent),
        }
    }

    /// Seal a profile key, bound to its owner so a ciphertext cannot be
    /// replayed onto another member entry.
    pub fn encrypt_profile_key(&self, profile_key: &ProfileKey, owner: &Aci) -> Result<Vec<u8>> {
        let mut material = Vec::with_capacity(48);
        material.extend_from_slice(owner.as_bytes());
        material.extend_from_slice(profile_key.as_bytes());

        let nonce_bytes = Self::synthetic_nonce(&self.secret.profile_key_key, 0x02, &material)?;
        let cipher = XChaCha20Poly1305::new_from_slice(&self.secret.profile_key_key)
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        let ciphertext = cipher
            .encrypt(
                XNonce::from_slice(&nonce_bytes),
                Payload { msg: profile_key.as_bytes(), aad: owner.as_bytes() },
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);

        cache::store(cache::cache_key(&self.group_id, &out), profile_key.as_bytes());
        Ok(out)
    }

    pub fn decrypt_profile_key(&self, sealed: &[u8], owner: &Aci) -> Result<ProfileKey> {
        let key = cache::cache_key(&self.group_id, sealed);
        let plaintext = match cache::lookup(&key) {
            Some(plaintext) => plaintext,
            None => {
                if sealed.len() < NONCE_LEN + 16 {
                    return Err(CryptoError::DecryptionFailed);
                }
                let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
                let cipher = XChaCha20Poly1305::new_from_slice(&self.secret.profile_key_key)
                    .map_err(|_| CryptoError::InvalidKeyLength)?;
                let plaintext = cipher
                    .decrypt(
                        XNonce::from_slice(nonce_bytes),
                        Payload { msg: ciphertext, aad: owner.as_bytes() },
                    )
                    .map_err(|_| CryptoError::DecryptionFailed)?;
                cache::store(key, &plaintext);
                plaintext
            }
        };

        if plaintext.len() != 32 {
            return Err(CryptoError::MalformedContent);
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&plaintext);
        Ok(ProfileKey::from_bytes(bytes))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> GroupParams {
        GroupParams::from_master_key(&GroupMasterKey::from_bytes([7; 32]))
    }

    fn other_params() -> GroupParams {
        GroupParams::from_master_key(&GroupMasterKey::from_bytes([8; 32]))
    }

    #[test]
    fn test_group_identifier_is_stable() {
        assert_eq!(params().group_id, params().group_id);
        assert_ne!(params().group_id, other_params().group_id);
    }

    #[test]
    fn test_title_roundtrip() {
        let p = params();
        let sealed = p.encrypt_title("book club").unwrap();
        assert_eq!(p.decrypt_title(&sealed).unwrap(), "book club");
    }

    #[test]
    fn test_description_roundtrip() {
        let p = params();
        let sealed = p.encrypt_description("we read books").unwrap();
        assert_eq!(p.decrypt_description(&sealed).unwrap(), "we read books");
    }

    #[test]
    fn test_avatar_roundtrip() {
        let p = params();
        let data = vec![0xAB; 512];
        let sealed = p.encrypt_avatar(&data).unwrap();
        assert_eq!(p.decrypt_avatar(&sealed).unwrap(), data);
    }

    #[test]
    fn test_timer_roundtrip() {
        let p = params();
        let timer = TimerToken { is_enabled: true, duration_secs: 86_400 };
        let sealed = p.encrypt_timer(&timer).unwrap();
        assert_eq!(p.decrypt_timer(&sealed).unwrap(), timer);
    }

    #[test]
    fn test_wrong_params_fails() {
        crate::crypto::cache::clear();
        let sealed = params().encrypt_title("secret").unwrap();
        assert!(other_params().decrypt_title(&sealed).is_err());
    }

    #[test]
    fn test_wrong_kind_fails() {
        let p = params();
        let sealed = p.encrypt_title("secret").unwrap();
        assert_eq!(
            p.decrypt_description(&sealed).unwrap_err(),
            CryptoError::MalformedContent
        );
    }

    #[test]
    fn test_service_id_roundtrip_both_kinds() {
        let p = params();
        let aci = ServiceId::Aci(Aci::from_bytes([1; 16]));
        let pni = ServiceId::Pni(Pni::from_bytes([1; 16]));

        let aci_ct = p.encrypt_service_id(&aci).unwrap();
        let pni_ct = p.encrypt_service_id(&pni).unwrap();

        assert_eq!(p.decrypt_service_id(&aci_ct).unwrap(), aci);
        assert_eq!(p.decrypt_service_id(&pni_ct).unwrap(), pni);
        // Same uuid, different kind, different ciphertext.
        assert_ne!(aci_ct, pni_ct);
    }

    #[test]
    fn test_service_id_translation_is_deterministic() {
        let p = params();
        let id = ServiceId::Aci(Aci::from_bytes([9; 16]));
        assert_eq!(
            p.encrypt_service_id(&id).unwrap(),
            p.encrypt_service_id(&id).unwrap()
        );
    }

    #[test]
    fn test_service_id_wrong_params_fails() {
        crate::crypto::cache::clear();
        let id = ServiceId::Aci(Aci::from_bytes([9; 16]));
        let sealed = params().encrypt_service_id(&id).unwrap();
        assert!(other_params().decrypt_service_id(&sealed).is_err());
    }

    #[test]
    fn test_profile_key_roundtrip() {
        let p = params();
        let owner = Aci::from_bytes([3; 16]);
        let profile_key = ProfileKey::from_bytes([0x5A; 32]);

        let sealed = p.encrypt_profile_key(&profile_key, &owner).unwrap();
        assert_eq!(p.decrypt_profile_key(&sealed, &owner).unwrap(), profile_key);
    }

    #[test]
    fn test_profile_key_bound_to_owner() {
        crate::crypto::cache::clear();
        let p = params();
        let owner = Aci::from_bytes([3; 16]);
        let other = Aci::from_bytes([4; 16]);
        let profile_key = ProfileKey::from_bytes([0x5A; 32]);

        let sealed = p.encrypt_profile_key(&profile_key, &owner).unwrap();
        assert!(p.decrypt_profile_key(&sealed, &other).is_err());
    }

    #[test]
    fn test_blob_encryption_is_randomized() {
        let p = params();
        let a = p.encrypt_title("same").unwrap();
        let b = p.encrypt_title("same").unwrap();
        assert_ne!(a, b);
        assert_eq!(p.decrypt_title(&a).unwrap(), p.decrypt_title(&b).unwrap());
    }

    #[test]
    fn test_truncated_ciphertext_fails() {
        let p = params();
        let sealed = p.encrypt_title("secret").unwrap();
        assert!(p.decrypt_title(&sealed[..10]).is_err());
    }
}

/// Group-scoped cryptography: blob sealing, identifier translation, and the
/// process-wide decrypted-field cache.

mod cache;
mod params;

pub use params::{CryptoError, GroupParams, GroupSecretParams, Result};

//! Frozen HKDF domain-separation labels.
//!
//! Each of these is used exactly once, as the `info` parameter to an HKDF
//! expansion, and must never change once messages or backups produced under
//! it exist in the wild.

/// Double Ratchet root-chain expansion (`kdf_rk`).
pub const CONST_ROOT_V1: &[u8] = b"lychee-root-v1";
/// Double Ratchet symmetric-chain expansion (`kdf_ck`).
pub const CONST_MSG_V1: &[u8] = b"lychee-msg-v1";
/// Per-transfer file encryption key, derived from the session root.
pub const CONST_FILE_V1: &[u8] = b"lychee-file-v1";
/// X3DH-lite shared-secret derivation.
pub const CONST_X3DH_V1: &[u8] = b"lychee-x3dh-v1";
/// Backup-envelope AEAD key derivation from the Argon2id output.
pub const CONST_AEAD_V1: &[u8] = b"lychee-aead-v1";

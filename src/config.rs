//! Centralised configuration.
//!
//! Every tunable constant lives here instead of being hardcoded at its call
//! site, following a single global singleton initialised lazily (or
//! explicitly, for tests that need non-default values).

use std::sync::OnceLock;

static GLOBAL_CONFIG: OnceLock<Config> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct Config {
    // ============================================
    // CRYPTOGRAPHIC PARAMETERS
    // ============================================
    /// Argon2id time cost for the backup/master-key KDF.
    pub argon2_time_cost: u32,
    /// Argon2id memory cost in KiB.
    pub argon2_memory_cost_kib: u32,
    /// Argon2id parallelism (lanes).
    pub argon2_parallelism: u32,
    /// Salt length for the backup envelope KDF (bytes).
    pub salt_length: usize,
    /// AEAD key length (bytes).
    pub key_length: usize,
    /// AEAD nonce length (bytes), ChaCha20-Poly1305.
    pub nonce_length: usize,
    /// AEAD tag length (bytes).
    pub aead_tag_length: usize,
    /// X25519 public key size (bytes).
    pub public_key_size: usize,
    /// Ed25519 signature size (bytes).
    pub signature_size: usize,
    /// Classic crypto suite identifier.
    pub classic_suite_id: u16,

    // ============================================
    // DOUBLE RATCHET PARAMETERS
    // ============================================
    /// Maximum buffered skipped-message keys per chain (DoS ceiling).
    pub max_skipped_messages: u32,
    /// Maximum age of a buffered skipped-message key before cleanup (seconds).
    pub max_skipped_message_age_seconds: i64,

    // ============================================
    // MESSAGING SERVICE PARAMETERS
    // ============================================
    /// Window during which an edit referencing an unknown message is buffered
    /// waiting for the original to arrive.
    pub edit_buffer_window_secs: i64,
    /// Minimum interval between outgoing `typing` frames for the same contact.
    pub typing_throttle_secs: i64,
    /// Whether `delete_message` soft-deletes (keeps the row, clears the body)
    /// or hard-deletes (removes the row).
    pub soft_delete_messages: bool,

    // ============================================
    // FILE TRANSFER PARAMETERS
    // ============================================
    /// Chunk size for file transfer, in bytes.
    pub file_chunk_size: usize,
    /// Files at or below this size are stored inline as an encrypted BLOB.
    pub file_inline_threshold: usize,
    /// Persist transfer progress to the store every N chunks.
    pub transfer_persist_every_n_chunks: u64,
    /// Smoothing factor for the exponential moving average of transfer speed.
    pub speed_ema_alpha: f64,

    // ============================================
    // BACKPRESSURE / TRANSPORT PARAMETERS
    // ============================================
    /// High watermark for a data channel's buffered-amount (bytes).
    pub backpressure_high_watermark: usize,
    /// Low watermark for a data channel's buffered-amount (bytes).
    pub backpressure_low_watermark: usize,
    /// Grace period allowed for in-flight sends to complete on teardown (ms).
    pub signalling_send_grace_ms: u64,
    /// Upper bound on how long `send_ready` will wait for the buffered
    /// amount to drain back to the low watermark before giving up (ms).
    pub backpressure_wait_timeout_ms: u64,

    // ============================================
    // VALIDATION
    // ============================================
    pub username_min_length: usize,
    pub username_max_length: usize,
    pub password_min_length: usize,
    pub uuid_length: usize,
    pub ephemeral_key_size: usize,
    pub base64_public_key_length: usize,
    pub base64_signature_length: usize,

    // ============================================
    // TIME TOLERANCES
    // ============================================
    pub message_timestamp_future_tolerance_secs: i64,
    pub message_timestamp_past_tolerance_secs: i64,

    // ============================================
    // NETWORK PARAMETERS
    // ============================================
    pub websocket_retry_initial_ms: u64,
    pub websocket_retry_max_ms: u64,
    /// STUN servers offered to every peer connection. No TURN relay is
    /// configured (spec §1 non-goal); a symmetric-NAT peer is allowed to
    /// fail to connect rather than fall back to a relay.
    pub ice_servers: Vec<String>,
    /// How often the facade's connection poller checks the signalling
    /// client's state for a transition worth pushing as a `connection`
    /// event (ms).
    pub connection_poll_interval_ms: u64,
}

impl Config {
    pub fn default() -> Self {
        Self {
            argon2_time_cost: 3,
            argon2_memory_cost_kib: 64 * 1024,
            argon2_parallelism: 4,
            salt_length: 16,
            key_length: 32,
            nonce_length: 12,
            aead_tag_length: 16,
            public_key_size: 32,
            signature_size: 64,
            classic_suite_id: 1,

            max_skipped_messages: 1000,
            max_skipped_message_age_seconds: 7 * 24 * 60 * 60,

            edit_buffer_window_secs: 30,
            typing_throttle_secs: 3,
            soft_delete_messages: true,

            file_chunk_size: 16 * 1024,
            file_inline_threshold: 100 * 1024,
            transfer_persist_every_n_chunks: 32,
            speed_ema_alpha: 0.30,

            backpressure_high_watermark: 1024 * 1024,
            backpressure_low_watermark: 256 * 1024,
            signalling_send_grace_ms: 1000,
            backpressure_wait_timeout_ms: 30_000,

            username_min_length: 3,
            username_max_length: 32,
            password_min_length: 8,
            uuid_length: 36,
            ephemeral_key_size: 32,
            base64_public_key_length: 44,
            base64_signature_length: 88,

            message_timestamp_future_tolerance_secs: 300,
            message_timestamp_past_tolerance_secs: 3600,

            websocket_retry_initial_ms: 1000,
            websocket_retry_max_ms: 30_000,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            connection_poll_interval_ms: 250,
        }
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();

        macro_rules! override_from_env {
            ($field:ident, $var:literal) => {
                if let Ok(val) = std::env::var($var) {
                    if let Ok(parsed) = val.parse() {
                        config.$field = parsed;
                    }
                }
            };
        }

        override_from_env!(max_skipped_messages, "MAX_SKIPPED_MESSAGES");
        override_from_env!(
            max_skipped_message_age_seconds,
            "MAX_SKIPPED_MESSAGE_AGE_SECONDS"
        );
        override_from_env!(file_chunk_size, "FILE_CHUNK_SIZE");
        override_from_env!(websocket_retry_max_ms, "WEBSOCKET_RETRY_MAX_MS");
        override_from_env!(soft_delete_messages, "SOFT_DELETE_MESSAGES");

        config
    }

    /// Get the global configuration instance, initialising it with defaults
    /// on first access if nobody called `init*` first.
    pub fn global() -> &'static Config {
        GLOBAL_CONFIG.get_or_init(Self::default)
    }

    pub fn init() -> Result<(), &'static str> {
        GLOBAL_CONFIG
            .set(Self::default())
            .map_err(|_| "Config already initialized")
    }

    pub fn init_from_env() -> Result<(), &'static str> {
        GLOBAL_CONFIG
            .set(Self::from_env())
            .map_err(|_| "Config already initialized")
    }

    pub fn init_with(config: Config) -> Result<(), &'static str> {
        GLOBAL_CONFIG
            .set(config)
            .map_err(|_| "Config already initialized")
    }

    pub fn is_initialized() -> bool {
        GLOBAL_CONFIG.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.max_skipped_messages, 1000);
        assert_eq!(config.username_min_length, 3);
        assert!(config.max_skipped_messages >= config.max_skipped_messages);
    }

    #[test]
    fn test_file_transfer_defaults() {
        let config = Config::default();
        assert_eq!(config.file_chunk_size, 16 * 1024);
        assert_eq!(config.file_inline_threshold, 100 * 1024);
        assert_eq!(config.transfer_persist_every_n_chunks, 32);
        assert!(config.backpressure_low_watermark < config.backpressure_high_watermark);
    }

    #[test]
    fn test_network_defaults() {
        let config = Config::default();
        assert_eq!(config.websocket_retry_initial_ms, 1000);
        assert_eq!(config.websocket_retry_max_ms, 30_000);
    }
}

/// Application name
pub const APP_NAME: &str = "Huddle";

/// Maximum username length in characters
pub const MAX_USERNAME_LEN: usize = 32;

/// Maximum room name length in characters
pub const MAX_ROOM_NAME_LEN: usize = 64;

/// Default maximum text length of a single message, in characters
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 4096;

/// Default upper bound on messages returned by one history fetch
pub const DEFAULT_HISTORY_LIMIT_MAX: usize = 500;

/// Default session token lifetime (24 hours)
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 86_400;

/// Longest accepted session lifetime: one year.
pub const MAX_TOKEN_TTL_SECS: i64 = 365 * 86_400;

/// Default HTTP API port
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Default maximum media blob size (10 MiB)
pub const DEFAULT_MAX_MEDIA_SIZE: usize = 10 * 1024 * 1024;

/// Salt length for credential hashing
pub const CREDENTIAL_SALT_SIZE: usize = 16;

/// Argon2id cost for new credential hashes: 19 MiB, two passes, one lane
pub const CREDENTIAL_MEMORY_KIB: u32 = 19 * 1024;
pub const CREDENTIAL_ITERATIONS: u32 = 2;
pub const CREDENTIAL_LANES: u32 = 1;

/// Domain separation contexts, bound into the salt with BLAKE3
pub const KDF_CONTEXT_CREDENTIAL: &str = "huddle-credential-v1";
pub const KDF_CONTEXT_ROOM_PASSWORD: &str = "huddle-room-password-v1";

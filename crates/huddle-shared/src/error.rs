use thiserror::Error;

/// Every failure the coordinator can report to a caller.
///
/// All variants except [`ChatError::Internal`] are caller-caused and are
/// surfaced verbatim; none are retried by the server.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("Invalid username or password")]
    InvalidCredential,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Username already taken")]
    UsernameTaken,

    #[error("Room name already taken")]
    RoomNameTaken,

    #[error("Room not found")]
    RoomNotFound,

    #[error("Wrong room password")]
    WrongPassword,

    #[error("Private rooms require a password")]
    PasswordRequired,

    #[error("Not authorized")]
    NotAuthorized,

    #[error("Cannot kick a room admin")]
    CannotKickAdmin,

    #[error("Not a member of this conversation")]
    NotAMember,

    #[error("Message has neither text nor media")]
    EmptyMessage,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Media not found")]
    MediaNotFound,

    #[error("Media too large: {size} bytes (max {max})")]
    MediaTooLarge { size: usize, max: usize },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChatError {
    /// HTTP-equivalent status code.
    pub fn status(&self) -> u16 {
        match self {
            Self::InvalidCredential | Self::InvalidToken => 401,
            Self::UsernameTaken | Self::RoomNameTaken => 409,
            Self::RoomNotFound | Self::MediaNotFound => 404,
            Self::WrongPassword | Self::NotAuthorized | Self::CannotKickAdmin | Self::NotAMember => {
                403
            }
            Self::PasswordRequired | Self::EmptyMessage | Self::InvalidRequest(_) => 400,
            Self::RateLimited => 429,
            Self::MediaTooLarge { .. } => 413,
            Self::Internal(_) => 500,
        }
    }

    /// Stable machine-readable tag.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCredential => "invalidCredential",
            Self::InvalidToken => "invalidToken",
            Self::UsernameTaken => "usernameTaken",
            Self::RoomNameTaken => "roomNameTaken",
            Self::RoomNotFound => "roomNotFound",
            Self::WrongPassword => "wrongPassword",
            Self::PasswordRequired => "passwordRequired",
            Self::NotAuthorized => "notAuthorized",
            Self::CannotKickAdmin => "cannotKickAdmin",
            Self::NotAMember => "notAMember",
            Self::EmptyMessage => "emptyMessage",
            Self::InvalidRequest(_) => "invalidRequest",
            Self::RateLimited => "rateLimited",
            Self::MediaNotFound => "mediaNotFound",
            Self::MediaTooLarge { .. } => "mediaTooLarge",
            Self::Internal(_) => "internal",
        }
    }

    /// Message safe to hand to a client. Internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

pub type ChatResult<T> = Result<T, ChatError>;

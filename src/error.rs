use thiserror::Error;

/// Numeric error codes carried in reply envelopes and relay responses.
pub mod code {
    pub const NONE: i32 = 0;
    pub const ARGS: i32 = 90001;
    pub const INTERNAL: i32 = 90003;
    pub const NO_PERMISSION: i32 = 90005;

    pub const TOKEN_EXPIRED: i32 = 95001;
    pub const TOKEN_INVALID: i32 = 95002;
    pub const TOKEN_MALFORMED: i32 = 95003;
    pub const TOKEN_NOT_VALID_YET: i32 = 95004;
    pub const TOKEN_UNKNOWN: i32 = 95005;
    pub const TOKEN_KICKED: i32 = 95006;
    pub const TOKEN_DIFFERENT_PLATFORM_ID: i32 = 95007;
    pub const TOKEN_DIFFERENT_USER_ID: i32 = 95008;
    pub const TOKEN_NOT_EXIST: i32 = 95009;
}

/// Authentication failures.
///
/// Every variant has its own client-visible code so a client can tell
/// "log in again" apart from "you were kicked elsewhere" and from clock skew.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    /// Signature verified but `exp` has passed
    #[error("token is timed out, please log in again")]
    Expired,
    /// Claims do not match the session the token is presented for
    #[error("token has been invalidated")]
    Invalid,
    /// Not a token at all
    #[error("that's not even a token")]
    Malformed,
    /// `nbf` is still in the future
    #[error("token not active yet")]
    NotValidYet,
    /// Signature mismatch or any other verification failure
    #[error("couldn't handle this token")]
    Unknown,
    /// A newer login or a force-logout replaced this token
    #[error("token has been kicked")]
    Kicked,
    /// Token was issued for a different platform
    #[error("token platform does not match")]
    DifferentPlatformId,
    /// Token was issued for a different user
    #[error("token user does not match")]
    DifferentUserId,
    /// The token store holds no record for this token
    #[error("token does not exist")]
    NotExist,
}

impl TokenError {
    pub fn code(&self) -> i32 {
        match self {
            TokenError::Expired => code::TOKEN_EXPIRED,
            TokenError::Invalid => code::TOKEN_INVALID,
            TokenError::Malformed => code::TOKEN_MALFORMED,
            TokenError::NotValidYet => code::TOKEN_NOT_VALID_YET,
            TokenError::Unknown => code::TOKEN_UNKNOWN,
            TokenError::Kicked => code::TOKEN_KICKED,
            TokenError::DifferentPlatformId => code::TOKEN_DIFFERENT_PLATFORM_ID,
            TokenError::DifferentUserId => code::TOKEN_DIFFERENT_USER_ID,
            TokenError::NotExist => code::TOKEN_NOT_EXIST,
        }
    }
}

/// Error types that can occur in the gateway, relay and token layers.
#[derive(Error, Debug)]
pub enum ImError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration validation failed
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Undecodable frame or handshake
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Request decoded but failed validation
    #[error("Args error: {0}")]
    Args(String),

    /// Authentication failed
    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    /// Privileged operation attempted by a non-privileged caller
    #[error("No permission: {0}")]
    NoPermission(String),

    /// Service discovery returned nothing or a downstream call failed
    #[error("Downstream unavailable: {0}")]
    Unavailable(String),

    /// A bounded downstream call did not complete in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The connection has already been closed
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ImError {
    /// Code placed into a reply envelope for this error.
    pub fn code(&self) -> i32 {
        match self {
            ImError::Args(_) | ImError::Protocol(_) => code::ARGS,
            ImError::Token(e) => e.code(),
            ImError::NoPermission(_) => code::NO_PERMISSION,
            ImError::Io(_)
            | ImError::InvalidConfig(_)
            | ImError::Unavailable(_)
            | ImError::Timeout(_)
            | ImError::ConnectionClosed
            | ImError::Internal(_) => code::INTERNAL,
        }
    }

    /// Rebuild an error from a code received over the relay wire.
    pub fn from_code(code: i32, msg: String) -> Self {
        let token = match code {
            code::TOKEN_EXPIRED => Some(TokenError::Expired),
            code::TOKEN_INVALID => Some(TokenError::Invalid),
            code::TOKEN_MALFORMED => Some(TokenError::Malformed),
            code::TOKEN_NOT_VALID_YET => Some(TokenError::NotValidYet),
            code::TOKEN_UNKNOWN => Some(TokenError::Unknown),
            code::TOKEN_KICKED => Some(TokenError::Kicked),
            code::TOKEN_DIFFERENT_PLATFORM_ID => Some(TokenError::DifferentPlatformId),
            code::TOKEN_DIFFERENT_USER_ID => Some(TokenError::DifferentUserId),
            code::TOKEN_NOT_EXIST => Some(TokenError::NotExist),
            _ => None,
        };
        if let Some(t) = token {
            return ImError::Token(t);
        }
        match code {
            code::ARGS => ImError::Args(msg),
            code::NO_PERMISSION => ImError::NoPermission(msg),
            _ => ImError::Internal(msg),
        }
    }
}

impl From<serde_json::Error> for ImError {
    fn from(e: serde_json::Error) -> Self {
        ImError::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ImError>;

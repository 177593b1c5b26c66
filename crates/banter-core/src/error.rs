//! Error taxonomy for the engine and the persistence interface.
//!
//! Engine errors map one-to-one onto the HTTP-like `ctrl` codes; nothing
//! internal leaks to the wire beyond the code and short text.

use thiserror::Error;

/// Well-known `ctrl` codes.
pub mod codes {
    pub const OK: u16 = 200;
    pub const CREATED: u16 = 201;
    pub const ACCEPTED: u16 = 202;
    pub const NO_CONTENT: u16 = 204;
    pub const NOT_MODIFIED: u16 = 304;
    pub const BAD_REQUEST: u16 = 400;
    pub const UNAUTHORIZED: u16 = 401;
    pub const FORBIDDEN: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const NOT_ALLOWED: u16 = 405;
    pub const CONFLICT: u16 = 409;
    pub const TOO_LARGE: u16 = 413;
    pub const UNPROCESSABLE: u16 = 422;
    pub const RATE_LIMITED: u16 = 429;
    pub const INTERNAL: u16 = 500;
    pub const BAD_GATEWAY: u16 = 502;
    pub const UNAVAILABLE: u16 = 503;
}

/// Tagged errors returned by every persistence operation.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("record already exists")]
    Duplicate,

    #[error("operation not permitted")]
    Permission,

    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("storage failure: {0}")]
    Internal(String),
}

/// Errors produced while handling a client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("malformed request")]
    Malformed,

    #[error("authentication required")]
    AuthRequired,

    #[error("permission denied")]
    Permission,

    #[error("not found")]
    NotFound,

    #[error("operation not allowed on this topic")]
    NotAllowed,

    #[error("conflict")]
    Conflict,

    #[error("payload too large")]
    TooLarge,

    #[error("invalid request")]
    Invalid,

    #[error("rate limited")]
    RateLimited,

    #[error("internal error")]
    Internal,

    #[error("topic unavailable")]
    Unavailable,

    #[error("server too busy")]
    Overloaded,
}

impl EngineError {
    /// The `ctrl` code reported to the client.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            EngineError::Malformed => codes::BAD_REQUEST,
            EngineError::AuthRequired => codes::UNAUTHORIZED,
            EngineError::Permission => codes::FORBIDDEN,
            EngineError::NotFound => codes::NOT_FOUND,
            EngineError::NotAllowed => codes::NOT_ALLOWED,
            EngineError::Conflict => codes::CONFLICT,
            EngineError::TooLarge => codes::TOO_LARGE,
            EngineError::Invalid => codes::UNPROCESSABLE,
            EngineError::RateLimited => codes::RATE_LIMITED,
            EngineError::Internal => codes::INTERNAL,
            EngineError::Unavailable => codes::BAD_GATEWAY,
            EngineError::Overloaded => codes::UNAVAILABLE,
        }
    }

    /// Short text reported alongside the code.
    #[must_use]
    pub fn text(&self) -> &'static str {
        match self {
            EngineError::Malformed => "malformed",
            EngineError::AuthRequired => "authentication required",
            EngineError::Permission => "permission denied",
            EngineError::NotFound => "not found",
            EngineError::NotAllowed => "operation not allowed",
            EngineError::Conflict => "already exists",
            EngineError::TooLarge => "payload too large",
            EngineError::Invalid => "invalid request",
            EngineError::RateLimited => "too many requests",
            EngineError::Internal => "internal error",
            EngineError::Unavailable => "topic unavailable, try later",
            EngineError::Overloaded => "server too busy",
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => EngineError::NotFound,
            StoreError::Duplicate => EngineError::Conflict,
            StoreError::Permission => EngineError::Permission,
            StoreError::InvalidArg(_) => EngineError::Invalid,
            StoreError::Internal(_) => EngineError::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_mapping() {
        assert_eq!(EngineError::Permission.code(), 403);
        assert_eq!(EngineError::Overloaded.code(), 503);
        assert_eq!(EngineError::Unavailable.code(), 502);
        assert_eq!(EngineError::from(StoreError::Duplicate).code(), 409);
        assert_eq!(
            EngineError::from(StoreError::Internal("disk".into())).code(),
            500
        );
    }
}

//! # Errors
//!
//! Every error kind maps to exactly one status code. Handlers propagate
//! typed errors with `?` and the endpoint boundary maps them to a reply.

use http::StatusCode;
use serde_json::{Value, json};
use thiserror::Error;

/// Web node errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The message was malformed or failed an integrity check.
    #[error("{0}")]
    BadRequest(String),

    /// Message authentication failed.
    #[error("{0}")]
    Unauthorized(String),

    /// The message was authenticated but is not permitted to perform the
    /// requested action.
    #[error("{0}")]
    Forbidden(String),

    /// The requested record, grant, or protocol does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The message is older than an already-accepted version. Success-class:
    /// the web node state is unchanged but current.
    #[error("{0}")]
    Conflict(String),

    /// The method is not supported by this web node instance.
    #[error("{0}")]
    Unsupported(String),

    /// A store or provider failure not covered by the kinds above.
    #[error("{0}")]
    Unexpected(String),
}

impl Error {
    /// The status code associated with the error kind.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) | Self::Forbidden(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
            Self::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Render the error as a `{code, detail}` reply status.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let (Self::BadRequest(detail)
        | Self::Unauthorized(detail)
        | Self::Forbidden(detail)
        | Self::NotFound(detail)
        | Self::Conflict(detail)
        | Self::Unsupported(detail)
        | Self::Unexpected(detail)) = self;

        json!({"code": self.status().as_u16(), "detail": detail})
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Unexpected(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Unexpected(format!("serialization issue: {err}"))
    }
}

impl From<base64ct::Error> for Error {
    fn from(err: base64ct::Error) -> Self {
        Self::Unexpected(format!("base64 issue: {err}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Unexpected(format!("io issue: {err}"))
    }
}

/// Construct an `Error::Forbidden` error from a string or format expression.
#[macro_export]
macro_rules! forbidden {
    ($fmt:expr) => {
        $crate::Error::Forbidden(format!($fmt))
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::Forbidden(format!($fmt, $($arg)*))
    };
}

/// Construct an `Error::BadRequest` error from a string or format expression.
#[macro_export]
macro_rules! invalid {
    ($fmt:expr) => {
        $crate::Error::BadRequest(format!($fmt))
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::BadRequest(format!($fmt, $($arg)*))
    };
}

/// Construct an `Error::Unexpected` error from a string or format expression.
#[macro_export]
macro_rules! unexpected {
    ($fmt:expr) => {
        $crate::Error::Unexpected(format!($fmt))
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::Unexpected(format!($fmt, $($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(Error::BadRequest(String::new()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(Error::Forbidden(String::new()).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(Error::Unauthorized(String::new()).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(Error::NotFound(String::new()).status(), StatusCode::NOT_FOUND);
        assert_eq!(Error::Conflict(String::new()).status(), StatusCode::CONFLICT);
        assert_eq!(Error::Unsupported(String::new()).status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[test]
    fn to_json() {
        let err = Error::NotFound("no matching record found".to_string());
        assert_eq!(err.to_json(), json!({"code": 404, "detail": "no matching record found"}));
    }
}

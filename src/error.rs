//! Error taxonomy of the licensing runtime.
//!
//! Every error rendered to a caller or to the asynchronous error observer ends
//! with an `[errCode=<N>]` marker so that the numeric code can be recovered
//! from the message alone.

use std::{fmt, sync::LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use thiserror::Error;

/// Numeric error codes carried in the `[errCode=<N>]` marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    BadArg = 1,
    BadFormat = 2,
    ExternFail = 3,
    BadUsage = 4,
    WsRespError = 10001,
    WsReqError = 10002,
    WsError = 10003,
    WsMayRetry = 10004,
    CtlrError = 10006,
    Debug = 20003,
    Exit = 20004,
}

impl ErrorCode {
    pub const fn value(self) -> u32 {
        self as u32
    }

    pub fn from_value(value: u32) -> Option<Self> {
        Some(match value {
            1 => Self::BadArg,
            2 => Self::BadFormat,
            3 => Self::ExternFail,
            4 => Self::BadUsage,
            10001 => Self::WsRespError,
            10002 => Self::WsReqError,
            10003 => Self::WsError,
            10004 => Self::WsMayRetry,
            10006 => Self::CtlrError,
            20003 => Self::Debug,
            20004 => Self::Exit,
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// Which request loop gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsOperation {
    Authentication,
    License,
}

impl fmt::Display for WsOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WsOperation::Authentication => write!(f, "Authentication"),
            WsOperation::License => write!(f, "License"),
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DrmError {
    /// Malformed or missing settings. Fatal, raised at construction or `set`.
    #[error("{message} [errCode={code}]")]
    Configuration { message: String, code: ErrorCode },

    /// Bounded retries exhausted.
    #[error(
        "Timeout on {operation} request after {attempts} attempts; last failure: {last_failure} [errCode={code}]",
        code = ErrorCode::WsError
    )]
    TransportTimeout {
        operation: WsOperation,
        attempts: u32,
        last_failure: String,
    },

    /// A single retryable failure, surfaced only when retries are disabled.
    #[error("{message} [errCode={code}]", code = ErrorCode::WsMayRetry)]
    Transport { message: String },

    /// Well-formed application-level denial from the licensing server.
    #[error(
        "DRM WS request failed: License Web Service error {status}: {{\"error\": \"{details}\"}} [errCode={code}]",
        code = ErrorCode::WsReqError
    )]
    RequestDenied { status: u16, details: String },

    #[error(
        "Malformed response from License Web Service: {message} [errCode={code}]",
        code = ErrorCode::WsRespError
    )]
    MalformedResponse { message: String },

    #[error(
        "Register access failed at address {address:#x}: {message} [errCode={code}]",
        code = ErrorCode::CtlrError
    )]
    HardwareAccess { address: u64, message: String },

    #[error("{message} [errCode={code}]", code = ErrorCode::BadUsage)]
    BadUsage { message: String },

    #[error("{context}: {source} [errCode={code}]", code = ErrorCode::ExternFail)]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Caller-triggered message pushed through the asynchronous reporter.
    #[error("{message} [errCode={code}]", code = ErrorCode::Debug)]
    Debug { message: String },

    /// Internal cancellation of a retry loop. Never reported.
    #[error("Exit requested [errCode={code}]", code = ErrorCode::Exit)]
    Exit,
}

pub type Result<T, E = DrmError> = std::result::Result<T, E>;

impl DrmError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DrmError::Configuration { code, .. } => *code,
            DrmError::TransportTimeout { .. } => ErrorCode::WsError,
            DrmError::Transport { .. } => ErrorCode::WsMayRetry,
            DrmError::RequestDenied { .. } => ErrorCode::WsReqError,
            DrmError::MalformedResponse { .. } => ErrorCode::WsRespError,
            DrmError::HardwareAccess { .. } => ErrorCode::CtlrError,
            DrmError::BadUsage { .. } => ErrorCode::BadUsage,
            DrmError::Io { .. } => ErrorCode::ExternFail,
            DrmError::Debug { .. } => ErrorCode::Debug,
            DrmError::Exit => ErrorCode::Exit,
        }
    }

    pub(crate) fn bad_arg(message: impl Into<String>) -> Self {
        DrmError::Configuration {
            message: message.into(),
            code: ErrorCode::BadArg,
        }
    }

    pub(crate) fn bad_format(message: impl Into<String>) -> Self {
        DrmError::Configuration {
            message: message.into(),
            code: ErrorCode::BadFormat,
        }
    }

    pub(crate) fn bad_usage(message: impl Into<String>) -> Self {
        DrmError::BadUsage {
            message: message.into(),
        }
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        DrmError::MalformedResponse {
            message: message.into(),
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        DrmError::Io {
            context: context.into(),
            source,
        }
    }

    /// A denial from the server means the entitlement is exhausted, not that
    /// the session is broken.
    pub fn is_denial(&self) -> bool {
        matches!(self, DrmError::RequestDenied { .. })
    }
}

static ERROR_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[errCode=(\d+)\]").expect("static regex is valid"));

static ERROR_DETAILS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\{"error": "(.+)"\}"#).expect("static regex is valid"));

/// Extracts the numeric code from an `[errCode=<N>]` marker.
pub fn error_code(message: &str) -> Option<u32> {
    ERROR_CODE_RE
        .captures(message)
        .and_then(|captures| captures.get(1))
        .and_then(|code| code.as_str().parse().ok())
}

/// Extracts `<details>` from an embedded `{"error": "<details>"}` fragment.
pub fn error_details(message: &str) -> Option<String> {
    ERROR_DETAILS_RE
        .captures(message)
        .and_then(|captures| captures.get(1))
        .map(|details| details.as_str().to_owned())
}

/// One failure as delivered to the asynchronous observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub code: u32,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ErrorEvent {
    /// Parses a reported message. A message without an `[errCode=<N>]` marker
    /// violates the reporting contract and is rejected.
    pub fn parse(message: &str) -> Result<Self> {
        let code = error_code(message).ok_or_else(|| {
            DrmError::bad_format(format!(
                "Could not find 'errCode' in error message: {message}"
            ))
        })?;

        Ok(Self {
            code,
            message: message.to_owned(),
            timestamp: Utc::now(),
        })
    }

    pub fn from_error(error: &DrmError) -> Self {
        Self {
            code: error.code().value(),
            message: error.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn details(&self) -> Option<String> {
        error_details(&self.message)
    }
}

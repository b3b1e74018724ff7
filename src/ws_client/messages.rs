use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of license request sent to the metering endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Open,
    Running,
    Close,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Open => write!(f, "open"),
            RequestKind::Running => write!(f, "running"),
            RequestKind::Close => write!(f, "close"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LicenseType {
    NodeLocked,
    Metered,
    FloatingMetered,
}

impl LicenseType {
    /// Value of the `mode` field of a license request.
    pub(crate) fn mode(self) -> u8 {
        match self {
            LicenseType::Metered | LicenseType::FloatingMetered => 0,
            LicenseType::NodeLocked => 1,
        }
    }

    /// License type announced by the server in the `metering.licenseType`
    /// field, if any.
    pub(crate) fn from_server(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "metered" | "metering" => Some(LicenseType::Metered),
            "floating" | "floating/metering" => Some(LicenseType::FloatingMetered),
            "nodelocked" | "node-locked" => Some(LicenseType::NodeLocked),
            _ => None,
        }
    }
}

impl fmt::Display for LicenseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LicenseType::NodeLocked => write!(f, "Node-Locked"),
            LicenseType::Metered | LicenseType::FloatingMetered => write!(f, "Floating/Metering"),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct LicenseRequest<'a> {
    pub(crate) request: RequestKind,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub(crate) session_id: Option<&'a str>,
    #[serde(rename = "meteringData")]
    pub(crate) metering_data: u64,
    pub(crate) mode: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) drm_frequency: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) udid: Option<&'a str>,
    #[serde(rename = "boardType", skip_serializing_if = "Option::is_none")]
    pub(crate) board_type: Option<&'a str>,
    #[serde(rename = "drmlibVersion")]
    pub(crate) drmlib_version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) product: Option<&'a Value>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct LicenseResponse {
    pub(crate) metering: Option<MeteringNode>,
    pub(crate) license: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MeteringNode {
    pub(crate) session_id: Option<String>,
    pub(crate) timeout_second: Option<u32>,
    pub(crate) quota_remaining: Option<u64>,
    pub(crate) license_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub(crate) access_token: String,
    pub(crate) expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Human-readable reason of a denial: the `error` string of a JSON body, or
/// the trimmed raw body otherwise.
pub(crate) fn denial_details(body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody { error }) => error,
        Err(_) => body.trim().to_owned(),
    }
}

use std::{fmt, str::FromStr};

/// Built-in keys of the `get`/`set` parameter surface. Any other key names a
/// free-form custom parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterKey {
    LicenseStatus,
    SessionStatus,
    SessionId,
    MeteredData,
    LicenseDuration,
    LicenseType,
    DrmLicenseType,
    LicenseState,
    NumActivators,
    ActivatorsStatus,
    DrmFrequency,
    NodelockedRequestFile,
    CustomField,
    TokenString,
    TokenValidity,
    TokenTimeLeft,
    WsRetryPeriodLong,
    WsRetryPeriodShort,
    WsRequestTimeout,
    LogVerbosity,
    LogMessageLevel,
    LogMessage,
    TriggerAsyncCallback,
    BadOauth2Token,
    ListAll,
    DumpAll,
}

impl ParameterKey {
    pub const ALL: [ParameterKey; 26] = [
        ParameterKey::LicenseStatus,
        ParameterKey::SessionStatus,
        ParameterKey::SessionId,
        ParameterKey::MeteredData,
        ParameterKey::LicenseDuration,
        ParameterKey::LicenseType,
        ParameterKey::DrmLicenseType,
        ParameterKey::LicenseState,
        ParameterKey::NumActivators,
        ParameterKey::ActivatorsStatus,
        ParameterKey::DrmFrequency,
        ParameterKey::NodelockedRequestFile,
        ParameterKey::CustomField,
        ParameterKey::TokenString,
        ParameterKey::TokenValidity,
        ParameterKey::TokenTimeLeft,
        ParameterKey::WsRetryPeriodLong,
        ParameterKey::WsRetryPeriodShort,
        ParameterKey::WsRequestTimeout,
        ParameterKey::LogVerbosity,
        ParameterKey::LogMessageLevel,
        ParameterKey::LogMessage,
        ParameterKey::TriggerAsyncCallback,
        ParameterKey::BadOauth2Token,
        ParameterKey::ListAll,
        ParameterKey::DumpAll,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ParameterKey::LicenseStatus => "license_status",
            ParameterKey::SessionStatus => "session_status",
            ParameterKey::SessionId => "session_id",
            ParameterKey::MeteredData => "metered_data",
            ParameterKey::LicenseDuration => "license_duration",
            ParameterKey::LicenseType => "license_type",
            ParameterKey::DrmLicenseType => "drm_license_type",
            ParameterKey::LicenseState => "license_state",
            ParameterKey::NumActivators => "num_activators",
            ParameterKey::ActivatorsStatus => "activators_status",
            ParameterKey::DrmFrequency => "drm_frequency",
            ParameterKey::NodelockedRequestFile => "nodelocked_request_file",
            ParameterKey::CustomField => "custom_field",
            ParameterKey::TokenString => "token_string",
            ParameterKey::TokenValidity => "token_validity",
            ParameterKey::TokenTimeLeft => "token_time_left",
            ParameterKey::WsRetryPeriodLong => "ws_retry_period_long",
            ParameterKey::WsRetryPeriodShort => "ws_retry_period_short",
            ParameterKey::WsRequestTimeout => "ws_request_timeout",
            ParameterKey::LogVerbosity => "log_verbosity",
            ParameterKey::LogMessageLevel => "log_message_level",
            ParameterKey::LogMessage => "log_message",
            ParameterKey::TriggerAsyncCallback => "trigger_async_callback",
            ParameterKey::BadOauth2Token => "bad_oauth2_token",
            ParameterKey::ListAll => "list_all",
            ParameterKey::DumpAll => "dump_all",
        }
    }

    pub fn is_readable(self) -> bool {
        !matches!(
            self,
            ParameterKey::LogMessage
                | ParameterKey::TriggerAsyncCallback
                | ParameterKey::BadOauth2Token
        )
    }

    /// Keys included in `dump_all`.
    pub(crate) fn dumpable() -> impl Iterator<Item = ParameterKey> {
        Self::ALL.into_iter().filter(|key| {
            key.is_readable() && !matches!(key, ParameterKey::ListAll | ParameterKey::DumpAll)
        })
    }
}

impl fmt::Display for ParameterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownParameter;

impl FromStr for ParameterKey {
    type Err = UnknownParameter;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|key| key.as_str() == value)
            .ok_or(UnknownParameter)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn names_round_trip_and_are_unique() {
        let names: HashSet<_> = ParameterKey::ALL.iter().map(|key| key.as_str()).collect();
        assert_eq!(names.len(), ParameterKey::ALL.len());

        assert_eq!("license_status".parse(), Ok(ParameterKey::LicenseStatus));
        assert_eq!("my_custom_key".parse::<ParameterKey>(), Err(UnknownParameter));
    }

    #[test]
    fn dump_excludes_write_only_and_meta_keys() {
        let dumped: Vec<_> = ParameterKey::dumpable().collect();

        assert!(dumped.contains(&ParameterKey::MeteredData));
        assert!(!dumped.contains(&ParameterKey::LogMessage));
        assert!(!dumped.contains(&ParameterKey::DumpAll));
        assert!(!dumped.contains(&ParameterKey::ListAll));
    }

    #[test]
    fn write_only_keys_are_not_readable() {
        assert!(!ParameterKey::TriggerAsyncCallback.is_readable());
        assert!(ParameterKey::SessionId.is_readable());
    }
}

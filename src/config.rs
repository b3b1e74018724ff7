use std::{fs, path::Path, path::PathBuf, time::Duration};

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use tracing::debug;
use url::Url;

use crate::{
    error::{DrmError, Result},
    register::ActivatorLayout,
};

/// Runtime configuration, deserialized from the `conf.json` layout.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub licensing: LicensingConfig,
    #[serde(default)]
    pub drm: DrmConfig,
    #[serde(default)]
    pub design: DesignConfig,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub webservice: WebServiceConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LicensingConfig {
    pub url: Option<Url>,
    #[serde(default)]
    pub nodelocked: bool,
    pub license_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DrmConfig {
    pub frequency_mhz: Option<u32>,
    #[serde(default)]
    pub activators: ActivatorLayout,
}

/// Design identity echoed into every license request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DesignConfig {
    pub udid: Option<String>,
    #[serde(rename = "boardType")]
    pub board_type: Option<String>,
    pub product: Option<serde_json::Value>,
}

/// Explicit endpoint overrides. Both default to paths under `licensing.url`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebServiceConfig {
    pub oauth2_url: Option<Url>,
    pub metering_url: Option<Url>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub log_verbosity: u8,
    pub log_format: LogFormat,
    pub log_file_path: Option<PathBuf>,
    pub log_file_verbosity: u8,
    #[serde(deserialize_with = "deserialize_secs")]
    pub ws_retry_period_long: Duration,
    #[serde(deserialize_with = "deserialize_secs")]
    pub ws_retry_period_short: Duration,
    #[serde(deserialize_with = "deserialize_secs")]
    pub ws_request_timeout: Duration,
    #[serde(deserialize_with = "deserialize_secs")]
    pub ws_attempt_timeout: Duration,
    pub ws_max_attempts: u32,
    #[serde(deserialize_with = "deserialize_secs")]
    pub renewal_threshold: Duration,
    #[serde(deserialize_with = "deserialize_secs")]
    pub scheduler_tick: Duration,
    #[serde(deserialize_with = "deserialize_secs")]
    pub scheduler_stop_grace: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_verbosity: 2,
            log_format: LogFormat::default(),
            log_file_path: None,
            log_file_verbosity: 2,
            ws_retry_period_long: Duration::from_secs(60),
            ws_retry_period_short: Duration::from_secs(2),
            ws_request_timeout: Duration::from_secs(10),
            ws_attempt_timeout: Duration::from_secs(10),
            ws_max_attempts: 8,
            renewal_threshold: Duration::from_secs(2),
            scheduler_tick: Duration::from_secs(1),
            scheduler_stop_grace: Duration::from_secs(5),
        }
    }
}

impl Settings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.ws_max_attempts,
            period_short: self.ws_retry_period_short,
            period_long: self.ws_retry_period_long,
            attempt_timeout: self.ws_attempt_timeout,
            request_timeout: self.ws_request_timeout,
        }
    }
}

/// Bounded retry schedule applied to each WS request cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub period_short: Duration,
    pub period_long: Duration,
    pub attempt_timeout: Duration,
    /// Deadline of a foreground request cycle.
    pub request_timeout: Duration,
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() {
            return Err(DrmError::bad_arg("ws_request_timeout must not be 0"));
        }
        if self.max_attempts == 0 {
            return Err(DrmError::bad_arg("ws_max_attempts must not be 0"));
        }
        if self.period_long <= self.period_short {
            return Err(DrmError::bad_arg(format!(
                "ws_retry_period_long ({}) must be greater than ws_retry_period_short ({})",
                self.period_long.as_secs_f64(),
                self.period_short.as_secs_f64()
            )));
        }
        Ok(())
    }

    /// Wait before the attempt following `attempt` failures: doubles from the
    /// short period, capped by the long period.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.period_short
            .saturating_mul(1 << exponent)
            .min(self.period_long)
    }
}

fn deserialize_secs<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

impl Config {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)
            .map_err(|err| DrmError::bad_format(format!("Error in configuration: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|err| {
            DrmError::io(
                format!("Failed to read configuration file '{}'", path.display()),
                err,
            )
        })?;

        Self::from_json_str(&json).map_err(|err| match err {
            DrmError::Configuration { message, code } => DrmError::Configuration {
                message: format!("Error in configuration file '{}': {message}", path.display()),
                code,
            },
            other => other,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.licensing.nodelocked {
            if self.licensing.license_dir.is_none() {
                return Err(DrmError::bad_format(
                    "Node-locked licensing requires 'licensing.license_dir'",
                ));
            }
            debug!("Configuration specifies a Node-locked license");
        } else {
            if self.licensing.url.is_none() {
                return Err(DrmError::bad_format("Missing required 'licensing.url'"));
            }
            if self.drm.frequency_mhz.is_none() {
                return Err(DrmError::bad_format("Missing required 'drm.frequency_mhz'"));
            }
            debug!("Configuration specifies a floating/metered license");
        }

        if self.settings.log_verbosity > 6 || self.settings.log_file_verbosity > 6 {
            return Err(DrmError::bad_arg("Log verbosity must be in range [0:6]"));
        }

        self.drm.activators.validate()?;
        self.settings.retry_policy().validate()
    }

    pub fn oauth2_url(&self) -> Result<Url> {
        self.endpoint(self.webservice.oauth2_url.as_ref(), "o/token/")
    }

    pub fn metering_url(&self) -> Result<Url> {
        self.endpoint(
            self.webservice.metering_url.as_ref(),
            "auth/metering/genlicense/",
        )
    }

    fn endpoint(&self, explicit: Option<&Url>, path: &str) -> Result<Url> {
        if let Some(url) = explicit {
            return Ok(url.clone());
        }

        let Some(base) = &self.licensing.url else {
            return Err(DrmError::bad_format("Missing required 'licensing.url'"));
        };

        Url::parse(&format!("{}/{path}", base.as_str().trim_end_matches('/')))
            .map_err(|err| DrmError::bad_format(format!("Invalid licensing URL {base}: {err}")))
    }
}

/// OAuth2 client credentials, deserialized from the `cred.json` layout.
#[derive(Debug, Deserialize)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: SecretString,
}

impl Credentials {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: SecretString::from(client_secret.into()),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let credentials: Credentials = serde_json::from_str(json)
            .map_err(|err| DrmError::bad_format(format!("Error in credentials: {err}")))?;

        if credentials.client_id.is_empty() {
            return Err(DrmError::bad_format("'client_id' must not be empty"));
        }
        Ok(credentials)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|err| {
            DrmError::io(
                format!("Failed to read credentials file '{}'", path.display()),
                err,
            )
        })?;
        Self::from_json_str(&json)
    }
}

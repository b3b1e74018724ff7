use chrono::{DateTime, Duration as ChronoDuration, Utc};
use http::{HeaderValue, header::CONTENT_TYPE};
use secrecy::{ExposeSecret as _, SecretString};
use tokio::{
    sync::Mutex,
    time::{Instant, timeout},
};
use tracing::{debug, info, instrument};
use url::{Url, form_urlencoded};

use super::{
    messages::{TokenResponse, denial_details},
    retry::{AttemptError, StopSignal, is_retryable, with_retries},
};
use crate::{
    config::{Credentials, RetryPolicy},
    error::{DrmError, Result, WsOperation},
};

/// Tokens are refreshed this long before the server-announced expiry.
const EXPIRY_MARGIN_SECS: i64 = 5;

#[derive(Debug, Clone)]
struct AccessToken {
    token: SecretString,
    header_value: HeaderValue,
    validity_secs: u64,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    fn new(token: &str, validity_secs: u64) -> Result<Self> {
        let mut header_value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| DrmError::malformed("OAuth2 access token is not a valid header value"))?;
        header_value.set_sensitive(true);

        let validity = i64::try_from(validity_secs)
            .ok()
            .and_then(ChronoDuration::try_seconds)
            .unwrap_or(ChronoDuration::MAX);
        Ok(Self {
            token: SecretString::from(token.to_owned()),
            header_value,
            validity_secs,
            expires_at: Utc::now()
                .checked_add_signed(validity)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        })
    }

    fn is_usable(&self, now: DateTime<Utc>) -> bool {
        now + ChronoDuration::seconds(EXPIRY_MARGIN_SECS) < self.expires_at
    }
}

/// Snapshot of the cached bearer token, for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct TokenInfo {
    pub token: String,
    pub validity_secs: u64,
    pub time_left_secs: i64,
}

/// OAuth2 client-credentials grant with a cached bearer token.
#[derive(Debug)]
pub(crate) struct OAuth2Client {
    token_url: Url,
    credentials: Credentials,
    cached: Mutex<Option<AccessToken>>,
}

impl OAuth2Client {
    pub(crate) fn new(token_url: Url, credentials: Credentials) -> Self {
        Self {
            token_url,
            credentials,
            cached: Mutex::new(None),
        }
    }

    /// Returns the `Authorization` header value, fetching a new token when
    /// none is cached or the cached one is about to expire.
    #[instrument(level = "debug", skip_all, fields(url = %self.token_url))]
    pub(crate) async fn authorization(
        &self,
        http: &reqwest::Client,
        gate: &Mutex<()>,
        policy: &RetryPolicy,
        deadline: Instant,
        stop: StopSignal,
    ) -> Result<HeaderValue> {
        if let Some(token) = self.cached.lock().await.as_ref()
            && token.is_usable(Utc::now())
        {
            return Ok(token.header_value.clone());
        }

        let token = with_retries(WsOperation::Authentication, policy, deadline, stop, |_| {
            self.fetch(http, gate, policy)
        })
        .await?;

        info!(
            validity_secs = token.validity_secs,
            "Obtained a new OAuth2 access token"
        );
        let header_value = token.header_value.clone();
        *self.cached.lock().await = Some(token);
        Ok(header_value)
    }

    async fn fetch(
        &self,
        http: &reqwest::Client,
        gate: &Mutex<()>,
        policy: &RetryPolicy,
    ) -> std::result::Result<AccessToken, AttemptError> {
        let body = form_urlencoded::Serializer::new(String::new())
            .append_pair("client_id", &self.credentials.client_id)
            .append_pair("client_secret", self.credentials.client_secret.expose_secret())
            .append_pair("grant_type", "client_credentials")
            .finish();

        let _gate = gate.lock().await;
        let url = &self.token_url;

        let response = match timeout(
            policy.attempt_timeout,
            http.post(url.clone())
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(body)
                .send(),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                return Err(AttemptError::Retryable(format!(
                    "Failed to request OAuth2 token from {url}: {err}"
                )));
            }
            Err(_) => {
                return Err(AttemptError::Retryable(format!(
                    "OAuth2 token request to {url} timed out ({:?})",
                    policy.attempt_timeout
                )));
            }
        };

        let status = response.status();
        let text = match timeout(policy.attempt_timeout, response.text()).await {
            Ok(Ok(text)) => text,
            Ok(Err(err)) => {
                return Err(AttemptError::Retryable(format!(
                    "OAuth2 error {status} <Error while receiving response body>: {err}"
                )));
            }
            Err(_) => {
                return Err(AttemptError::Retryable(format!(
                    "OAuth2 error {status} <Timed out while receiving response body>"
                )));
            }
        };

        if status.is_success() {
            let response: TokenResponse = serde_json::from_str(&text).map_err(|err| {
                AttemptError::Fatal(DrmError::malformed(format!(
                    "Invalid OAuth2 token response: {err}"
                )))
            })?;
            debug!(expires_in = response.expires_in, "OAuth2 token response received");
            return AccessToken::new(&response.access_token, response.expires_in)
                .map_err(AttemptError::Fatal);
        }

        if is_retryable(status) {
            Err(AttemptError::Retryable(format!(
                "OAuth2 Web Service error {status}: {text}"
            )))
        } else {
            Err(AttemptError::Fatal(DrmError::RequestDenied {
                status: status.as_u16(),
                details: denial_details(&text),
            }))
        }
    }

    pub(crate) async fn invalidate(&self) {
        if self.cached.lock().await.take().is_some() {
            debug!("Cached OAuth2 token invalidated");
        }
    }

    /// Replaces the cached token value, keeping its expiry.
    pub(crate) async fn corrupt(&self, bogus: &str) -> Result<()> {
        let mut cached = self.cached.lock().await;
        let validity_secs = cached.as_ref().map_or(3600, |token| token.validity_secs);
        let mut token = AccessToken::new(bogus, validity_secs)
            .map_err(|_| DrmError::bad_arg("Bogus OAuth2 token must be a valid header value"))?;
        if let Some(previous) = cached.as_ref() {
            token.expires_at = previous.expires_at;
        }
        debug!("Cached OAuth2 token replaced by a bogus value");
        *cached = Some(token);
        Ok(())
    }

    pub(crate) async fn info(&self) -> TokenInfo {
        match self.cached.lock().await.as_ref() {
            Some(token) => TokenInfo {
                token: token.token.expose_secret().to_owned(),
                validity_secs: token.validity_secs,
                time_left_secs: (token.expires_at - Utc::now()).num_seconds().max(0),
            },
            None => TokenInfo::default(),
        }
    }
}

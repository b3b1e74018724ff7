//! Client of the License Web Service.
//!
//! Every request cycle authenticates with an OAuth2 bearer token, then posts
//! a license request to the metering endpoint. Transient failures are retried
//! under the caller's [`RetryPolicy`]; well-formed denials are not.

mod messages;
mod oauth;
mod retry;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use http::{HeaderValue, StatusCode, header::AUTHORIZATION};
use serde_json::Value;
use tokio::{
    sync::Mutex,
    time::{Instant, timeout},
};
use tracing::{debug, info, instrument, warn};
use url::Url;
use uuid::Uuid;

pub use messages::{LicenseType, RequestKind};
pub use oauth::TokenInfo;
pub use retry::StopSignal;

use self::{
    messages::{LicenseRequest, LicenseResponse, denial_details},
    oauth::OAuth2Client,
    retry::{AttemptError, is_retryable, with_retries},
};
use crate::{
    config::{Config, Credentials, DesignConfig, RetryPolicy},
    error::{DrmError, Result, WsOperation},
};

pub const DRMLIB_VERSION: &str = env!("CARGO_PKG_VERSION");

/// License granted by the server.
#[derive(Debug, Clone)]
pub struct LicenseToken {
    session_id: String,
    license_type: LicenseType,
    license_duration: u32,
    issued_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    quota_remaining: Option<u64>,
    payload: Value,
}

impl LicenseToken {
    /// A token for a node-locked license, which never expires.
    pub(crate) fn node_locked(session_id: String, payload: Value) -> Self {
        Self {
            session_id,
            license_type: LicenseType::NodeLocked,
            license_duration: 0,
            issued_at: Utc::now(),
            expires_at: None,
            quota_remaining: None,
            payload,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn license_type(&self) -> LicenseType {
        self.license_type
    }

    /// Seconds granted by the server for this token.
    pub fn license_duration(&self) -> u32 {
        self.license_duration
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// `None` for licenses that never expire.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn quota_remaining(&self) -> Option<u64> {
        self.quota_remaining
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|expires_at| now < expires_at)
    }

    /// Lifetime left at `now`, zero once expired, `None` if it never expires.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Option<ChronoDuration> {
        self.expires_at
            .map(|expires_at| (expires_at - now).max(ChronoDuration::zero()))
    }
}

/// What a license request is about.
#[derive(Debug, Clone, Copy)]
pub struct SessionContext<'a> {
    pub kind: RequestKind,
    /// Current session, absent when opening a new one.
    pub session_id: Option<&'a str>,
    pub metered_data: u64,
    pub license_type: LicenseType,
}

#[derive(Debug)]
pub struct WsClient {
    http: reqwest::Client,
    oauth: OAuth2Client,
    metering_url: Url,
    design: DesignConfig,
    frequency_mhz: Option<u32>,
    gate: Mutex<()>,
}

impl WsClient {
    pub fn new(config: &Config, credentials: Credentials) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("drm-manager/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| DrmError::bad_arg(format!("Failed to build HTTP client: {err}")))?;

        Ok(Self {
            http,
            oauth: OAuth2Client::new(config.oauth2_url()?, credentials),
            metering_url: config.metering_url()?,
            design: config.design.clone(),
            frequency_mhz: config.drm.frequency_mhz,
            gate: Mutex::new(()),
        })
    }

    /// Opens a new session, or requests a node-locked license.
    #[instrument(skip_all, fields(license_type = ?ctx.license_type))]
    pub async fn request_license(
        &self,
        ctx: &SessionContext<'_>,
        policy: &RetryPolicy,
    ) -> Result<LicenseToken> {
        let deadline = Instant::now() + policy.request_timeout;
        let response = self
            .exchange(ctx, policy, deadline, StopSignal::never())
            .await?;
        let token = token_from_response(response, ctx)?;

        info!(
            session_id = token.session_id(),
            license_duration = token.license_duration(),
            "License granted"
        );
        Ok(token)
    }

    /// Extends the current session. `deadline` bounds the whole cycle and
    /// `stop` interrupts its retry waits.
    #[instrument(skip_all, fields(session_id = ctx.session_id, metered_data = ctx.metered_data))]
    pub async fn renew(
        &self,
        ctx: &SessionContext<'_>,
        policy: &RetryPolicy,
        deadline: Instant,
        stop: StopSignal,
    ) -> Result<LicenseToken> {
        let response = self.exchange(ctx, policy, deadline, stop).await?;
        let token = token_from_response(response, ctx)?;

        debug!(
            license_duration = token.license_duration(),
            quota_remaining = token.quota_remaining(),
            "License renewed"
        );
        Ok(token)
    }

    /// Closes the session on the server side.
    #[instrument(skip_all, fields(session_id = ctx.session_id, metered_data = ctx.metered_data))]
    pub async fn release(&self, ctx: &SessionContext<'_>, policy: &RetryPolicy) -> Result<()> {
        let deadline = Instant::now() + policy.request_timeout;
        let response = self
            .exchange(ctx, policy, deadline, StopSignal::never())
            .await?;

        if let (Some(expected), Some(returned)) = (
            ctx.session_id,
            response.metering.and_then(|metering| metering.session_id),
        ) && expected != returned
        {
            warn!(
                returned,
                "License Web Service closed a different session than requested"
            );
        }

        info!("Session released");
        Ok(())
    }

    /// Obtains an OAuth2 token unless a usable one is cached.
    pub async fn authenticate(&self, policy: &RetryPolicy) -> Result<TokenInfo> {
        let deadline = Instant::now() + policy.request_timeout;
        self.oauth
            .authorization(&self.http, &self.gate, policy, deadline, StopSignal::never())
            .await?;
        Ok(self.oauth.info().await)
    }

    pub async fn token_info(&self) -> TokenInfo {
        self.oauth.info().await
    }

    pub async fn corrupt_token(&self, bogus: &str) -> Result<()> {
        self.oauth.corrupt(bogus).await
    }

    async fn exchange(
        &self,
        ctx: &SessionContext<'_>,
        policy: &RetryPolicy,
        deadline: Instant,
        stop: StopSignal,
    ) -> Result<LicenseResponse> {
        let request = LicenseRequest {
            request: ctx.kind,
            session_id: ctx.session_id,
            metering_data: ctx.metered_data,
            mode: ctx.license_type.mode(),
            drm_frequency: self.frequency_mhz,
            udid: self.design.udid.as_deref(),
            board_type: self.design.board_type.as_deref(),
            drmlib_version: DRMLIB_VERSION,
            product: self.design.product.as_ref(),
        };
        debug!(request = %ctx.kind, "Sending license request");

        with_retries(WsOperation::License, policy, deadline, stop.clone(), |_| {
            let stop = stop.clone();
            let request = &request;
            async move {
                let authorization = self
                    .oauth
                    .authorization(&self.http, &self.gate, policy, deadline, stop)
                    .await
                    .map_err(AttemptError::Fatal)?;
                self.license_attempt(&authorization, request, policy).await
            }
        })
        .await
    }

    async fn license_attempt(
        &self,
        authorization: &HeaderValue,
        request: &LicenseRequest<'_>,
        policy: &RetryPolicy,
    ) -> std::result::Result<LicenseResponse, AttemptError> {
        let _gate = self.gate.lock().await;
        let url = &self.metering_url;

        let response = match timeout(
            policy.attempt_timeout,
            self.http
                .post(url.clone())
                .header(AUTHORIZATION, authorization)
                .json(request)
                .send(),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                return Err(AttemptError::Retryable(format!(
                    "Failed to send license request to {url}: {err}"
                )));
            }
            Err(_) => {
                return Err(AttemptError::Retryable(format!(
                    "License request to {url} timed out ({:?})",
                    policy.attempt_timeout
                )));
            }
        };

        let status = response.status();
        let text = match timeout(policy.attempt_timeout, response.text()).await {
            Ok(Ok(text)) => text,
            Ok(Err(err)) => {
                return Err(AttemptError::Retryable(format!(
                    "License Web Service error {status} <Error while receiving response body>: {err}"
                )));
            }
            Err(_) => {
                return Err(AttemptError::Retryable(format!(
                    "License Web Service error {status} <Timed out while receiving response body>"
                )));
            }
        };

        if status.is_success() {
            return serde_json::from_str(&text).map_err(|err| {
                AttemptError::Fatal(DrmError::malformed(format!(
                    "Invalid license response: {err}"
                )))
            });
        }

        if status == StatusCode::UNAUTHORIZED {
            self.oauth.invalidate().await;
            return Err(AttemptError::Retryable(format!(
                "License Web Service error {status}: OAuth2 token rejected"
            )));
        }

        if is_retryable(status) {
            Err(AttemptError::Retryable(format!(
                "License Web Service error {status}: {text}"
            )))
        } else {
            Err(AttemptError::Fatal(DrmError::RequestDenied {
                status: status.as_u16(),
                details: denial_details(&text),
            }))
        }
    }
}

fn token_from_response(response: LicenseResponse, ctx: &SessionContext<'_>) -> Result<LicenseToken> {
    let LicenseResponse { metering, license } = response;
    let issued_at = Utc::now();

    let Some(payload) = license else {
        return Err(DrmError::malformed("Missing 'license' node"));
    };

    if ctx.license_type == LicenseType::NodeLocked {
        let session_id = metering
            .and_then(|metering| metering.session_id)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        return Ok(LicenseToken::node_locked(session_id, payload));
    }

    let Some(metering) = metering else {
        return Err(DrmError::malformed("Missing 'metering' node"));
    };
    let Some(license_duration) = metering.timeout_second else {
        return Err(DrmError::malformed("Missing 'metering.timeoutSecond'"));
    };
    if license_duration == 0 {
        warn!("License duration is 0, the license expires immediately");
    }

    let session_id = match (ctx.session_id, metering.session_id) {
        (Some(current), Some(returned)) if current != returned => {
            return Err(DrmError::malformed(format!(
                "Session ID mismatch: received '{returned}' from License Web Service, expected '{current}'"
            )));
        }
        (_, Some(returned)) => returned,
        (Some(current), None) => current.to_owned(),
        (None, None) => Uuid::new_v4().to_string(),
    };

    let license_type = metering
        .license_type
        .as_deref()
        .and_then(LicenseType::from_server)
        .unwrap_or(ctx.license_type);

    Ok(LicenseToken {
        session_id,
        license_type,
        license_duration,
        issued_at,
        expires_at: Some(issued_at + ChronoDuration::seconds(i64::from(license_duration))),
        quota_remaining: metering.quota_remaining,
        payload,
    })
}

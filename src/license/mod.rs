//! License session runtime.
//!
//! [`DrmManager`] owns one license session at a time. Foreground calls
//! (`activate`, `deactivate`, `get`, `set`) and the background renewal
//! scheduler share the session state behind a single lock that is never held
//! across a License Web Service request.
//!
//! ## Session lifecycle
//!
//! - `activate(false)` opens a new session (stopping any existing one) and
//!   enables the activators.
//! - `deactivate(true)` pauses the session: the activators are disabled, the
//!   scheduler stops, the session and its license are kept.
//! - `activate(true)` resumes a paused session, renewing its license first if
//!   it expired meanwhile.
//! - `deactivate(false)` closes the session on the server and resets metering.
//!
//! Failures of the background scheduler never reach a caller. They are
//! delivered to the error observer and reflected in `license_status`.

mod nodelock;
mod parameters;
mod scheduler;
mod state;

pub use parameters::{ParameterKey, UnknownParameter};
pub use state::StateName;

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info, instrument, warn};

use self::{
    nodelock::NodeLockFiles,
    scheduler::Scheduler,
    state::{LicenseState, Session},
};
use crate::{
    config::{Config, Credentials, RetryPolicy},
    error::{DrmError, Result},
    logging,
    metering::MeteringAccumulator,
    register::RegisterPort,
    reporter::{ErrorObserver, ErrorReporter},
    ws_client::{LicenseToken, LicenseType, RequestKind, SessionContext, StopSignal, WsClient},
};

#[derive(Debug, Clone, Copy)]
struct SchedulerTiming {
    tick: Duration,
    renewal_threshold: Duration,
    stop_grace: Duration,
}

/// State shared between foreground calls and the renewal scheduler.
#[derive(Debug)]
struct Shared {
    state: Mutex<LicenseState>,
    metering: MeteringAccumulator,
    ws: Option<WsClient>,
    reporter: ErrorReporter,
    policy: Mutex<RetryPolicy>,
    timing: SchedulerTiming,
}

impl Shared {
    async fn retry_policy(&self) -> RetryPolicy {
        *self.policy.lock().await
    }

    fn ws(&self) -> Result<&WsClient> {
        self.ws.as_ref().ok_or_else(|| {
            DrmError::bad_usage("No License Web Service configured: 'licensing.url' is missing")
        })
    }

    /// Requests a new license for `session`, reporting the usage sampled now.
    async fn renew(
        &self,
        session: &Session,
        policy: &RetryPolicy,
        deadline: Instant,
        stop: StopSignal,
    ) -> Result<LicenseToken> {
        let metered_data = self.metering.sample().await?;
        let ctx = SessionContext {
            kind: RequestKind::Running,
            session_id: Some(&session.id),
            metered_data,
            license_type: session.license_type,
        };
        self.ws()?.renew(&ctx, policy, deadline, stop).await
    }

    /// Closes `session` on the server with the final usage. Failures are
    /// logged only.
    async fn release(&self, session: &Session) {
        let metered_data = match self.metering.sample().await {
            Ok(total) => total,
            Err(err) => {
                warn!("Final metering sample failed: {err}");
                self.metering.cumulative()
            }
        };
        let ctx = SessionContext {
            kind: RequestKind::Close,
            session_id: Some(&session.id),
            metered_data,
            license_type: session.license_type,
        };
        let policy = self.retry_policy().await;

        let result = match self.ws() {
            Ok(ws) => ws.release(&ctx, &policy).await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            warn!(session_id = %session.id, "Failed to release session: {err}");
        }
    }

    /// Closes whatever session is left when the manager is dropped.
    async fn security_stop(&self) {
        self.metering.try_set_enabled(false).await;

        let previous = self.state.lock().await.transition(LicenseState::Idle);
        if let Some(session) = previous.into_session()
            && !session.is_node_locked()
        {
            self.release(&session).await;
        }
    }
}

#[derive(Debug)]
struct ParameterStore {
    custom_field: Value,
    custom: BTreeMap<String, Value>,
    log_message_level: u8,
}

/// Licensing runtime of one accelerator design.
///
/// Must be created and used from within a tokio runtime. Dropping a manager
/// that still holds a session stops the scheduler and releases the session in
/// the background. Call [`DrmManager::deactivate`] to do so deterministically.
#[derive(Debug)]
pub struct DrmManager {
    shared: Arc<Shared>,
    operation: Mutex<()>,
    scheduler: Mutex<Option<Scheduler>>,
    license_type: LicenseType,
    nodelock: Option<NodeLockFiles>,
    frequency_mhz: Option<u32>,
    log_verbosity: u8,
    parameters: Mutex<ParameterStore>,
}

impl DrmManager {
    pub fn new(
        config: Config,
        credentials: Credentials,
        port: Arc<dyn RegisterPort>,
        observer: ErrorObserver,
    ) -> Result<Self> {
        config.validate()?;

        let settings = &config.settings;
        let layout = config.drm.activators;
        let license_type = if config.licensing.nodelocked {
            LicenseType::NodeLocked
        } else {
            LicenseType::Metered
        };

        let ws = match &config.licensing.url {
            Some(_) => Some(WsClient::new(&config, credentials)?),
            None => None,
        };

        let nodelock = match &config.licensing.license_dir {
            Some(dir) if config.licensing.nodelocked => {
                Some(NodeLockFiles::new(dir, &config.design, &layout))
            }
            _ => None,
        };

        info!(
            %license_type,
            activators = layout.count,
            frequency_mhz = config.drm.frequency_mhz,
            "DRM manager initialized"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(LicenseState::Idle),
                metering: MeteringAccumulator::new(port, layout),
                ws,
                reporter: ErrorReporter::spawn(observer),
                policy: Mutex::new(settings.retry_policy()),
                timing: SchedulerTiming {
                    tick: settings.scheduler_tick,
                    renewal_threshold: settings.renewal_threshold,
                    stop_grace: settings.scheduler_stop_grace,
                },
            }),
            operation: Mutex::new(()),
            scheduler: Mutex::new(None),
            license_type,
            nodelock,
            frequency_mhz: config.drm.frequency_mhz,
            log_verbosity: settings.log_verbosity,
            parameters: Mutex::new(ParameterStore {
                custom_field: Value::from(""),
                custom: BTreeMap::new(),
                log_message_level: settings.log_verbosity,
            }),
        })
    }

    /// Starts a session, or resumes the current one when `resume` is set.
    #[instrument(skip(self))]
    pub async fn activate(&self, resume: bool) -> Result<()> {
        let _operation = self.operation.lock().await;

        if self.license_type == LicenseType::NodeLocked {
            return self.install_node_locked().await;
        }

        let (name, has_session) = {
            let state = self.shared.state.lock().await;
            (state.name(), state.session_status())
        };

        match name {
            StateName::Active | StateName::Renewing if resume => {
                debug!("Session is already running");
                Ok(())
            }
            StateName::Paused | StateName::Locked | StateName::Error if resume && has_session => {
                self.resume_session().await
            }
            _ => {
                if has_session {
                    debug!("Session is already running but resume is not requested: stopping it");
                    self.stop_session().await;
                }
                self.start_session().await
            }
        }
    }

    /// Pauses the current session when `pause` is set, closes it otherwise.
    #[instrument(skip(self))]
    pub async fn deactivate(&self, pause: bool) -> Result<()> {
        let _operation = self.operation.lock().await;

        if self.license_type == LicenseType::NodeLocked {
            let previous = self.shared.state.lock().await.transition(LicenseState::Idle);
            if previous.session_status() {
                self.shared.metering.try_set_enabled(false).await;
                info!("Node-locked license deactivated");
            }
            return Ok(());
        }

        {
            let mut state = self.shared.state.lock().await;
            if !state.session_status() {
                debug!("No session is currently running");
                if state.name() != StateName::Idle {
                    state.transition(LicenseState::Idle);
                }
                return Ok(());
            }
        }

        if pause {
            self.pause_session().await;
        } else {
            self.stop_session().await;
        }
        Ok(())
    }

    pub async fn state(&self) -> StateName {
        self.shared.state.lock().await.name()
    }

    pub async fn license_status(&self) -> bool {
        self.shared.state.lock().await.license_status(Utc::now())
    }

    pub async fn session_id(&self) -> Option<String> {
        self.shared
            .state
            .lock()
            .await
            .session()
            .map(|session| session.id.clone())
    }

    async fn start_session(&self) -> Result<()> {
        info!("Starting a new metering session...");
        self.shared
            .state
            .lock()
            .await
            .transition(LicenseState::Activating);

        let result = self.open_session().await;

        let mut state = self.shared.state.lock().await;
        match result {
            Ok(session) => {
                info!(
                    session_id = %session.id,
                    license_duration = session.token.license_duration(),
                    "Session started"
                );
                state.transition(LicenseState::Active(session));
                drop(state);
                self.start_scheduler().await;
                Ok(())
            }
            Err(err) => {
                state.transition(if err.is_denial() {
                    LicenseState::Locked(None)
                } else {
                    LicenseState::Error(None)
                });
                Err(err)
            }
        }
    }

    async fn open_session(&self) -> Result<Session> {
        let ws = self.shared.ws()?;
        self.shared.metering.reset().await?;

        let policy = self.shared.retry_policy().await;
        let ctx = SessionContext {
            kind: RequestKind::Open,
            session_id: None,
            metered_data: 0,
            license_type: self.license_type,
        };
        let session = Session::new(ws.request_license(&ctx, &policy).await?);

        if let Err(err) = self.shared.metering.set_enabled(true).await {
            self.shared.release(&session).await;
            return Err(err);
        }
        Ok(session)
    }

    async fn resume_session(&self) -> Result<()> {
        info!("Resuming DRM session...");
        self.stop_scheduler().await;

        let session = {
            let mut state = self.shared.state.lock().await;
            let Some(session) = state.session().cloned() else {
                return Err(DrmError::bad_usage("No session to resume"));
            };

            if matches!(*state, LicenseState::Paused(_)) && session.token.is_valid_at(Utc::now()) {
                self.shared.metering.set_enabled(true).await?;
                state.transition(LicenseState::Active(session));
                drop(state);
                self.start_scheduler().await;
                return Ok(());
            }

            state.transition(LicenseState::Renewing(session.clone()));
            session
        };

        let policy = self.shared.retry_policy().await;
        let result = match self
            .shared
            .renew(
                &session,
                &policy,
                Instant::now() + policy.request_timeout,
                StopSignal::never(),
            )
            .await
        {
            Ok(token) => self.shared.metering.set_enabled(true).await.map(|()| token),
            Err(err) => Err(err),
        };

        let mut state = self.shared.state.lock().await;
        let outcome = match result {
            Ok(token) => {
                info!(session_id = %session.id, "Session resumed with a renewed license");
                state.transition(LicenseState::Active(Session { token, ..session }));
                Ok(())
            }
            Err(err) => {
                state.transition(if err.is_denial() {
                    LicenseState::Locked(Some(session))
                } else {
                    LicenseState::Error(Some(session))
                });
                Err(err)
            }
        };
        drop(state);

        if outcome.is_err() {
            self.shared.metering.try_set_enabled(false).await;
        }
        self.start_scheduler().await;
        outcome
    }

    async fn pause_session(&self) {
        info!("Pausing DRM session...");
        self.stop_scheduler().await;

        {
            let mut state = self.shared.state.lock().await;
            let Some(session) = state.session().cloned() else {
                return;
            };
            state.transition(LicenseState::Paused(session));
        }

        self.shared.metering.try_set_enabled(false).await;
    }

    async fn stop_session(&self) {
        info!("Stopping DRM session...");
        self.stop_scheduler().await;
        self.shared.metering.try_set_enabled(false).await;

        let session = self.shared.state.lock().await.session().cloned();
        if let Some(session) = &session
            && !session.is_node_locked()
        {
            self.shared.release(session).await;
        }

        self.shared.state.lock().await.transition(LicenseState::Idle);
        if let Err(err) = self.shared.metering.reset().await {
            warn!("Failed to reset metering: {err}");
        }

        if let Some(session) = session {
            info!(session_id = %session.id, "Session stopped");
        }
    }

    async fn install_node_locked(&self) -> Result<()> {
        let Some(files) = &self.nodelock else {
            return Err(DrmError::bad_format(
                "Node-locked licensing requires 'licensing.license_dir'",
            ));
        };

        if self.shared.state.lock().await.name() == StateName::Active {
            debug!("Node-locked license is already installed");
            return Ok(());
        }

        self.shared
            .state
            .lock()
            .await
            .transition(LicenseState::Activating);

        let result = match self.node_locked_token(files).await {
            Ok(token) => self.shared.metering.set_enabled(true).await.map(|()| token),
            Err(err) => Err(err),
        };

        let mut state = self.shared.state.lock().await;
        match result {
            Ok(token) => {
                let session = Session::new(token);
                info!(session_id = %session.id, "Node-locked license installed");
                state.transition(LicenseState::Active(session));
                Ok(())
            }
            Err(err) => {
                state.transition(if err.is_denial() {
                    LicenseState::Locked(None)
                } else {
                    LicenseState::Error(None)
                });
                Err(err)
            }
        }
    }

    async fn node_locked_token(&self, files: &NodeLockFiles) -> Result<LicenseToken> {
        if let Some(token) = files.load().await? {
            return Ok(token);
        }

        files.write_request().await?;
        info!(
            request = %files.request_path().display(),
            "No node-locked license installed yet, requesting one"
        );

        let policy = self.shared.retry_policy().await;
        let ctx = SessionContext {
            kind: RequestKind::Open,
            session_id: None,
            metered_data: 0,
            license_type: LicenseType::NodeLocked,
        };
        let token = self.shared.ws()?.request_license(&ctx, &policy).await?;
        files.save(&token).await?;
        Ok(token)
    }

    async fn start_scheduler(&self) {
        let mut scheduler = self.scheduler.lock().await;
        if scheduler.is_none() {
            *scheduler = Some(Scheduler::spawn(self.shared.clone()));
        }
    }

    async fn stop_scheduler(&self) {
        let scheduler = self.scheduler.lock().await.take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown(self.shared.timing.stop_grace).await;
        }
    }

    /// Reads one parameter. Unknown keys name custom parameters stored with
    /// [`DrmManager::set`].
    #[instrument(level = "debug", skip(self))]
    pub async fn get(&self, key: &str) -> Result<Value> {
        match key.parse::<ParameterKey>() {
            Ok(key) => self.read_parameter(key).await,
            Err(UnknownParameter) => self
                .parameters
                .lock()
                .await
                .custom
                .get(key)
                .cloned()
                .ok_or_else(|| DrmError::bad_arg(format!("Cannot find parameter: {key}"))),
        }
    }

    async fn read_parameter(&self, key: ParameterKey) -> Result<Value> {
        let value = match key {
            ParameterKey::LicenseStatus => Value::from(self.license_status().await),
            ParameterKey::SessionStatus => {
                Value::from(self.shared.state.lock().await.session_status())
            }
            ParameterKey::SessionId => Value::from(self.session_id().await.unwrap_or_default()),
            ParameterKey::MeteredData => {
                if self.shared.state.lock().await.session_status() {
                    self.shared.metering.sample().await?;
                }
                Value::from(self.shared.metering.cumulative())
            }
            ParameterKey::LicenseDuration => Value::from(
                self.shared
                    .state
                    .lock()
                    .await
                    .session()
                    .map_or(0, |session| session.token.license_duration()),
            ),
            ParameterKey::LicenseType => Value::from(self.license_type.to_string()),
            ParameterKey::DrmLicenseType => Value::from(
                self.shared
                    .state
                    .lock()
                    .await
                    .session()
                    .map_or_else(|| "Idle".to_owned(), |session| session.license_type.to_string()),
            ),
            ParameterKey::LicenseState => Value::from(self.state().await.to_string()),
            ParameterKey::NumActivators => Value::from(self.shared.metering.num_activators()),
            ParameterKey::ActivatorsStatus => Value::Array(
                self.shared
                    .metering
                    .statuses()
                    .await?
                    .into_iter()
                    .map(|status| {
                        let mut entry = Map::new();
                        entry.insert("active".to_owned(), Value::from(status.active));
                        entry.insert("ready".to_owned(), Value::from(status.ready));
                        Value::Object(entry)
                    })
                    .collect(),
            ),
            ParameterKey::DrmFrequency => Value::from(self.frequency_mhz),
            ParameterKey::NodelockedRequestFile => match &self.nodelock {
                Some(files) => Value::from(files.request_path().display().to_string()),
                None => Value::from("Not applicable"),
            },
            ParameterKey::CustomField => self.parameters.lock().await.custom_field.clone(),
            ParameterKey::TokenString
            | ParameterKey::TokenValidity
            | ParameterKey::TokenTimeLeft => {
                let info = match &self.shared.ws {
                    Some(ws) => ws.token_info().await,
                    None => Default::default(),
                };
                match key {
                    ParameterKey::TokenString => Value::from(info.token),
                    ParameterKey::TokenValidity => Value::from(info.validity_secs),
                    _ => Value::from(info.time_left_secs),
                }
            }
            ParameterKey::WsRetryPeriodLong => {
                Value::from(self.shared.retry_policy().await.period_long.as_secs_f64())
            }
            ParameterKey::WsRetryPeriodShort => {
                Value::from(self.shared.retry_policy().await.period_short.as_secs_f64())
            }
            ParameterKey::WsRequestTimeout => {
                Value::from(self.shared.retry_policy().await.request_timeout.as_secs_f64())
            }
            ParameterKey::LogVerbosity => Value::from(self.log_verbosity),
            ParameterKey::LogMessageLevel => {
                Value::from(self.parameters.lock().await.log_message_level)
            }
            ParameterKey::ListAll => Value::Array(
                ParameterKey::ALL
                    .iter()
                    .map(|key| Value::from(key.as_str()))
                    .collect(),
            ),
            ParameterKey::DumpAll => Box::pin(self.dump_all()).await?,
            ParameterKey::LogMessage
            | ParameterKey::TriggerAsyncCallback
            | ParameterKey::BadOauth2Token => {
                return Err(DrmError::bad_usage(format!(
                    "Parameter '{key}' is write-only"
                )));
            }
        };

        debug!(%key, %value, "Parameter read");
        Ok(value)
    }

    async fn dump_all(&self) -> Result<Value> {
        let mut dump = Map::new();
        for key in ParameterKey::dumpable() {
            dump.insert(key.as_str().to_owned(), self.read_parameter(key).await?);
        }
        Ok(Value::Object(dump))
    }

    /// Writes one parameter. Unknown keys are stored as custom parameters.
    #[instrument(level = "debug", skip(self, value))]
    pub async fn set(&self, key: &str, value: Value) -> Result<()> {
        let Ok(parameter) = key.parse::<ParameterKey>() else {
            debug!("Storing custom parameter");
            self.parameters
                .lock()
                .await
                .custom
                .insert(key.to_owned(), value);
            return Ok(());
        };

        match parameter {
            ParameterKey::CustomField => self.parameters.lock().await.custom_field = value,
            ParameterKey::WsRetryPeriodLong
            | ParameterKey::WsRetryPeriodShort
            | ParameterKey::WsRequestTimeout => {
                let duration = value
                    .as_f64()
                    .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                    .ok_or_else(|| {
                        DrmError::bad_arg(format!(
                            "'{parameter}' must be a non-negative number of seconds, got {value}"
                        ))
                    })?;

                let mut policy = self.shared.policy.lock().await;
                let mut updated = *policy;
                match parameter {
                    ParameterKey::WsRetryPeriodLong => updated.period_long = duration,
                    ParameterKey::WsRetryPeriodShort => updated.period_short = duration,
                    _ => updated.request_timeout = duration,
                }
                updated.validate()?;
                *policy = updated;
                debug!(%parameter, secs = duration.as_secs_f64(), "Retry policy updated");
            }
            ParameterKey::LogMessageLevel => {
                let level = value
                    .as_u64()
                    .and_then(|level| u8::try_from(level).ok())
                    .ok_or_else(|| {
                        DrmError::bad_arg(format!("Log message level must be an integer, got {value}"))
                    })?;
                logging::verbosity_filter(level)?;
                self.parameters.lock().await.log_message_level = level;
            }
            ParameterKey::LogMessage => {
                let level = self.parameters.lock().await.log_message_level;
                match value.as_str() {
                    Some(message) => logging::log_message(level, message),
                    None => logging::log_message(level, &value.to_string()),
                }
            }
            ParameterKey::TriggerAsyncCallback => {
                let message = match value {
                    Value::String(message) => message,
                    other => other.to_string(),
                };
                self.shared.reporter.report(&DrmError::Debug { message });
            }
            ParameterKey::BadOauth2Token => {
                let bogus = value.as_str().unwrap_or("BAD_TOKEN");
                self.shared.ws()?.corrupt_token(bogus).await?;
            }
            _ => {
                return Err(DrmError::bad_usage(format!(
                    "Parameter '{parameter}' cannot be overwritten"
                )));
            }
        }
        Ok(())
    }

    /// Fills every key of a JSON object with its current value.
    pub async fn get_json(&self, json: &str) -> Result<String> {
        let request = parse_object(json)?;
        let mut response = Map::new();
        for key in request.keys() {
            response.insert(key.clone(), self.get(key).await?);
        }
        Ok(Value::Object(response).to_string())
    }

    /// Applies every key/value pair of a JSON object.
    pub async fn set_json(&self, json: &str) -> Result<()> {
        for (key, value) in parse_object(json)? {
            self.set(&key, value).await?;
        }
        Ok(())
    }
}

fn parse_object(json: &str) -> Result<Map<String, Value>> {
    serde_json::from_str(json)
        .map_err(|err| DrmError::bad_format(format!("Cannot parse JSON object '{json}': {err}")))
}

impl Drop for DrmManager {
    fn drop(&mut self) {
        let scheduler = self.scheduler.get_mut().take();
        if let Some(scheduler) = &scheduler {
            scheduler.request_stop();
        }

        let holds_session = scheduler.is_some()
            || self
                .shared
                .state
                .try_lock()
                .map_or(true, |state| state.session_status());
        if !holds_session {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Security stop skipped: no tokio runtime available");
            return;
        };

        debug!("Security stop triggered: stopping current session");
        let shared = self.shared.clone();
        runtime.spawn(async move {
            if let Some(scheduler) = scheduler {
                scheduler.shutdown(shared.timing.stop_grace).await;
            }
            shared.security_stop().await;
        });
    }
}

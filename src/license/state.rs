use chrono::{DateTime, Utc};
use tracing::debug;

use crate::ws_client::{LicenseToken, LicenseType};

/// One authorized-use episode, spanning pause/resume cycles.
#[derive(Debug, Clone)]
pub(crate) struct Session {
    pub(crate) id: String,
    pub(crate) license_type: LicenseType,
    pub(crate) token: LicenseToken,
}

impl Session {
    pub(crate) fn new(token: LicenseToken) -> Self {
        Self {
            id: token.session_id().to_owned(),
            license_type: token.license_type(),
            token,
        }
    }

    pub(crate) fn is_node_locked(&self) -> bool {
        self.license_type == LicenseType::NodeLocked
    }
}

/// Name of a [`LicenseState`], as exposed by `get("license_state")`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateName {
    Idle,
    Activating,
    Active,
    Paused,
    Renewing,
    Locked,
    Error,
}

impl std::fmt::Display for StateName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateName::Idle => write!(f, "Idle"),
            StateName::Activating => write!(f, "Activating"),
            StateName::Active => write!(f, "Active"),
            StateName::Paused => write!(f, "Paused"),
            StateName::Renewing => write!(f, "Renewing"),
            StateName::Locked => write!(f, "Locked"),
            StateName::Error => write!(f, "Error"),
        }
    }
}

/// License session state. A session exists exactly when the variant holds one.
///
/// `Locked` and `Error` carry no session when they result from a failed
/// activation, and keep the session when a renewal of a running one failed.
#[derive(Debug, Clone, Default)]
pub(crate) enum LicenseState {
    #[default]
    Idle,
    Activating,
    Active(Session),
    Paused(Session),
    Renewing(Session),
    Locked(Option<Session>),
    Error(Option<Session>),
}

impl LicenseState {
    pub(crate) fn name(&self) -> StateName {
        match self {
            LicenseState::Idle => StateName::Idle,
            LicenseState::Activating => StateName::Activating,
            LicenseState::Active(_) => StateName::Active,
            LicenseState::Paused(_) => StateName::Paused,
            LicenseState::Renewing(_) => StateName::Renewing,
            LicenseState::Locked(_) => StateName::Locked,
            LicenseState::Error(_) => StateName::Error,
        }
    }

    pub(crate) fn session(&self) -> Option<&Session> {
        match self {
            LicenseState::Active(session)
            | LicenseState::Paused(session)
            | LicenseState::Renewing(session) => Some(session),
            LicenseState::Locked(session) | LicenseState::Error(session) => session.as_ref(),
            LicenseState::Idle | LicenseState::Activating => None,
        }
    }

    pub(crate) fn into_session(self) -> Option<Session> {
        match self {
            LicenseState::Active(session)
            | LicenseState::Paused(session)
            | LicenseState::Renewing(session) => Some(session),
            LicenseState::Locked(session) | LicenseState::Error(session) => session,
            LicenseState::Idle | LicenseState::Activating => None,
        }
    }

    /// True only while `Active` with an unexpired token.
    pub(crate) fn license_status(&self, now: DateTime<Utc>) -> bool {
        match self {
            LicenseState::Active(session) => session.token.is_valid_at(now),
            _ => false,
        }
    }

    pub(crate) fn session_status(&self) -> bool {
        self.session().is_some()
    }

    /// Replaces the state, returning the previous one.
    pub(crate) fn transition(&mut self, next: LicenseState) -> LicenseState {
        debug!(
            from = %self.name(),
            to = %next.name(),
            session_id = next.session().map(|session| session.id.as_str()),
            "License state transition"
        );
        std::mem::replace(self, next)
    }
}

use std::{env, fs::OpenOptions, io::IsTerminal, sync::Mutex};

use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{
    Layer, Registry,
    filter::{EnvFilter, LevelFilter},
    fmt,
    layer::SubscriberExt as _,
    util::SubscriberInitExt as _,
};

use crate::{
    config::{LogFormat, Settings},
    error::{DrmError, Result},
};

/// Highest value of the verbosity scale: logging disabled.
pub const VERBOSITY_OFF: u8 = 6;

/// Maps the 0 (trace) ..= 6 (off) verbosity scale to a level filter.
/// Critical (5) has no own level and maps to error.
pub fn verbosity_filter(verbosity: u8) -> Result<LevelFilter> {
    Ok(match verbosity {
        0 => LevelFilter::TRACE,
        1 => LevelFilter::DEBUG,
        2 => LevelFilter::INFO,
        3 => LevelFilter::WARN,
        4 | 5 => LevelFilter::ERROR,
        VERBOSITY_OFF => LevelFilter::OFF,
        _ => {
            return Err(DrmError::bad_arg(format!(
                "Log verbosity {verbosity} must be in range [0:6]"
            )));
        }
    })
}

fn color_terminal() -> bool {
    std::io::stdout().is_terminal()
        && (match env::var("COLORTERM") {
            Ok(value) => value == "truecolor" || value == "24bit",
            _ => false,
        } || match env::var("TERM") {
            Ok(value) => value == "direct" || value == "truecolor",
            _ => false,
        })
}

/// Installs the global subscriber: a console layer filtered by
/// `log_verbosity` (overridable with `RUST_LOG`) and, when `log_file_path` is
/// set, a file layer filtered by `log_file_verbosity`.
pub fn setup_logging(settings: &Settings) -> Result<()> {
    let console_filter = EnvFilter::builder()
        .with_default_directive(verbosity_filter(settings.log_verbosity)?.into())
        .from_env_lossy();

    let console: Box<dyn Layer<Registry> + Send + Sync> = match settings.log_format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(false)
            .with_line_number(false)
            .with_ansi(color_terminal())
            .boxed(),
        LogFormat::Plain => fmt::layer()
            .with_file(false)
            .with_line_number(false)
            .with_ansi(false)
            .boxed(),
    };

    let file = match &settings.log_file_path {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|err| {
                    DrmError::io(
                        format!("Failed to open log file '{}'", path.display()),
                        err,
                    )
                })?;

            Some(
                fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_filter(verbosity_filter(settings.log_file_verbosity)?),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console.with_filter(console_filter))
        .with(file)
        .try_init()
        .map_err(|err| DrmError::bad_usage(format!("Logging is already initialized: {err}")))
}

/// Emits a caller-supplied message at a level of the verbosity scale.
pub(crate) fn log_message(verbosity: u8, message: &str) {
    match verbosity {
        0 => trace!(target: "drm_manager::user", "{message}"),
        1 => debug!(target: "drm_manager::user", "{message}"),
        2 => info!(target: "drm_manager::user", "{message}"),
        3 => warn!(target: "drm_manager::user", "{message}"),
        4 | 5 => error!(target: "drm_manager::user", "{message}"),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_scale() {
        assert_eq!(verbosity_filter(0).unwrap(), LevelFilter::TRACE);
        assert_eq!(verbosity_filter(2).unwrap(), LevelFilter::INFO);
        assert_eq!(verbosity_filter(5).unwrap(), LevelFilter::ERROR);
        assert_eq!(verbosity_filter(6).unwrap(), LevelFilter::OFF);
        assert!(verbosity_filter(7).is_err());
    }
}

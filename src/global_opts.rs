use std::path::PathBuf;

use clap::Args;

#[derive(Debug, Args)]
pub(crate) struct GlobalOpts {
    /// Path to the configuration file
    ///
    /// JSON file holding the licensing server URL, the DRM frequency, the
    /// activator layout and the runtime settings.
    #[arg(short, long, env = "DRM_MANAGER_CONF", default_value = "conf.json")]
    pub(crate) conf: PathBuf,

    /// Path to the credentials file
    ///
    /// JSON file holding the OAuth2 `client_id` and `client_secret`. The
    /// secret is never logged.
    #[arg(long, env = "DRM_MANAGER_CRED", hide_env_values = true, default_value = "cred.json")]
    pub(crate) cred: PathBuf,
}

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info};

use crate::{
    config::DesignConfig,
    error::{DrmError, Result},
    register::ActivatorLayout,
    ws_client::{DRMLIB_VERSION, LicenseToken, LicenseType},
};

/// License installed on disk for a node-locked design.
#[derive(Debug, Serialize, Deserialize)]
struct LicenseFile {
    #[serde(rename = "sessionId")]
    session_id: String,
    license: Value,
}

/// Location of the request and license files of one design.
///
/// Both names derive from a SHA-256 digest of the design identity so that
/// several designs can share a license directory.
#[derive(Debug, Clone)]
pub(crate) struct NodeLockFiles {
    request: PathBuf,
    license: PathBuf,
    identity: Value,
}

impl NodeLockFiles {
    pub(crate) fn new(license_dir: &Path, design: &DesignConfig, layout: &ActivatorLayout) -> Self {
        let identity = json!({
            "udid": design.udid,
            "boardType": design.board_type,
            "activators": {
                "base_address": layout.base_address,
                "address_range": layout.address_range,
                "count": layout.count,
            },
        });

        let digest = hex::encode(Sha256::digest(identity.to_string().as_bytes()));
        debug!(%digest, "Node-locked design identity hashed");

        Self {
            request: license_dir.join(format!("{digest}.req")),
            license: license_dir.join(format!("{digest}.lic")),
            identity,
        }
    }

    pub(crate) fn request_path(&self) -> &Path {
        &self.request
    }

    #[cfg(test)]
    pub(crate) fn license_path(&self) -> &Path {
        &self.license
    }

    /// Loads the installed license, if any.
    pub(crate) async fn load(&self) -> Result<Option<LicenseToken>> {
        let content = match fs::read_to_string(&self.license).await {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(DrmError::io(
                    format!(
                        "Failed to read node-locked license file '{}'",
                        self.license.display()
                    ),
                    err,
                ));
            }
        };

        let file: LicenseFile = serde_json::from_str(&content).map_err(|err| {
            DrmError::bad_format(format!(
                "Invalid node-locked license file '{}': {err}",
                self.license.display()
            ))
        })?;

        info!(path = %self.license.display(), "Installed node-locked license file");
        Ok(Some(LicenseToken::node_locked(file.session_id, file.license)))
    }

    /// Writes the license request file, creating the license directory.
    pub(crate) async fn write_request(&self) -> Result<()> {
        let request = json!({
            "request": "open",
            "mode": LicenseType::NodeLocked.mode(),
            "drmlibVersion": DRMLIB_VERSION,
            "design": self.identity,
        });
        self.write(&self.request, &request).await?;
        debug!(path = %self.request.display(), "Node-locked license request file saved");
        Ok(())
    }

    pub(crate) async fn save(&self, token: &LicenseToken) -> Result<()> {
        let file = LicenseFile {
            session_id: token.session_id().to_owned(),
            license: token.payload().clone(),
        };
        let value = serde_json::to_value(&file)
            .map_err(|err| DrmError::bad_format(format!("Failed to encode license file: {err}")))?;
        self.write(&self.license, &value).await?;
        info!(path = %self.license.display(), "Node-locked license file saved");
        Ok(())
    }

    async fn write(&self, path: &Path, value: &Value) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|err| {
                DrmError::io(
                    format!("Failed to create license directory '{}'", parent.display()),
                    err,
                )
            })?;
        }

        let content = serde_json::to_string_pretty(value)
            .map_err(|err| DrmError::bad_format(format!("Failed to encode '{}': {err}", path.display())))?;
        fs::write(path, content)
            .await
            .map_err(|err| DrmError::io(format!("Failed to write '{}'", path.display()), err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn design(udid: &str) -> DesignConfig {
        DesignConfig {
            udid: Some(udid.to_owned()),
            board_type: Some("DRM_125".to_owned()),
            product: None,
        }
    }

    #[test]
    fn file_names_depend_on_design_identity() {
        let dir = Path::new("/licenses");
        let layout = ActivatorLayout::default();
        let first = NodeLockFiles::new(dir, &design("A"), &layout);
        let again = NodeLockFiles::new(dir, &design("A"), &layout);
        let other = NodeLockFiles::new(dir, &design("B"), &layout);

        assert_eq!(first.request_path(), again.request_path());
        assert_ne!(first.license_path(), other.license_path());

        let name = first.license_path().file_name().unwrap().to_str().unwrap();
        assert!(name.ends_with(".lic"));
        assert_eq!(name.len(), 64 + 4);
    }

    #[tokio::test]
    async fn saved_license_is_loaded_back() {
        let dir = tempfile::tempdir().unwrap();
        let files = NodeLockFiles::new(
            &dir.path().join("nested"),
            &design("A"),
            &ActivatorLayout::default(),
        );
        assert!(files.load().await.unwrap().is_none());

        files.write_request().await.unwrap();
        assert!(files.request_path().exists());

        let token = LicenseToken::node_locked("s-1".to_owned(), json!({"key": "k"}));
        files.save(&token).await.unwrap();

        let loaded = files.load().await.unwrap().unwrap();
        assert_eq!(loaded.session_id(), "s-1");
        assert_eq!(loaded.payload(), &json!({"key": "k"}));
        assert!(loaded.expires_at().is_none());
    }

    #[tokio::test]
    async fn corrupted_license_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let files = NodeLockFiles::new(dir.path(), &design("A"), &ActivatorLayout::default());
        std::fs::write(files.license_path(), "not json").unwrap();

        let err = files.load().await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::BadFormat);
    }
}

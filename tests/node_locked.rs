mod common;

use std::path::Path;

use common::{ErrorRecorder, FakeBoard, FakeLicenseServer, LAYOUT, ServerOptions, fast_settings, manager};
use drm_manager::{Config, ErrorCode, StateName};
use serde_json::{Value, json};

fn node_locked_config(url: Option<&str>, license_dir: &Path) -> Config {
    let mut licensing = json!({
        "nodelocked": true,
        "license_dir": license_dir,
    });
    if let Some(url) = url {
        licensing["url"] = json!(url);
    }

    Config::from_json_str(
        &json!({
            "licensing": licensing,
            "drm": {
                "activators": {
                    "base_address": LAYOUT.base_address,
                    "address_range": LAYOUT.address_range,
                    "count": LAYOUT.count,
                },
            },
            "design": {"udid": "6AE1A700-0000-0000-0000-00000000000A", "boardType": "FAKE_BOARD"},
            "settings": fast_settings(),
        })
        .to_string(),
    )
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn license_is_requested_once_then_loaded_from_disk() {
    let server = FakeLicenseServer::start(ServerOptions::default()).await;
    let license_dir = tempfile::tempdir().unwrap();
    let board = FakeBoard::new();
    let recorder = ErrorRecorder::default();

    let drm = manager(
        node_locked_config(Some(&server.url), license_dir.path()),
        &board,
        &recorder,
    );
    assert_eq!(drm.get("license_type").await.unwrap(), json!("Node-Locked"));

    drm.activate(false).await.unwrap();
    assert_eq!(drm.state().await, StateName::Active);
    assert!(drm.license_status().await);
    assert!(board.is_active(0));
    assert_eq!(drm.get("drm_license_type").await.unwrap(), json!("Node-Locked"));
    assert_eq!(server.requests_of_kind("open").len(), 1);
    assert_eq!(server.requests_of_kind("open")[0]["mode"], json!(1));

    let request_file = drm.get("nodelocked_request_file").await.unwrap();
    let request_file = Path::new(request_file.as_str().unwrap()).to_owned();
    assert!(request_file.starts_with(license_dir.path()));
    assert!(request_file.exists());
    let license_file = request_file.with_extension("lic");
    let saved: Value = serde_json::from_str(&std::fs::read_to_string(&license_file).unwrap()).unwrap();
    assert_eq!(saved["license"]["nodelocked"], json!(true));
    assert!(saved["sessionId"].is_string());

    drm.deactivate(false).await.unwrap();
    assert_eq!(drm.state().await, StateName::Idle);
    assert!(!board.is_active(0));
    assert!(server.requests_of_kind("close").is_empty());
    drop(drm);

    // Without any server the installed license is enough.
    let offline = manager(node_locked_config(None, license_dir.path()), &board, &recorder);
    offline.activate(false).await.unwrap();
    assert!(offline.license_status().await);
    assert_eq!(
        offline.get("session_id").await.unwrap(),
        saved["sessionId"]
    );
    assert_eq!(server.requests_of_kind("open").len(), 1);
    offline.deactivate(false).await.unwrap();
    assert!(recorder.messages().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_license_without_server_is_a_usage_error() {
    let license_dir = tempfile::tempdir().unwrap();
    let board = FakeBoard::new();
    let recorder = ErrorRecorder::default();
    let drm = manager(node_locked_config(None, license_dir.path()), &board, &recorder);

    let err = drm.activate(false).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::BadUsage);
    assert!(!drm.license_status().await);

    // The request file is left for an offline license request.
    let request_file = drm.get("nodelocked_request_file").await.unwrap();
    let request: Value =
        serde_json::from_str(&std::fs::read_to_string(request_file.as_str().unwrap()).unwrap())
            .unwrap();
    assert_eq!(request["mode"], json!(1));
    assert_eq!(request["design"]["boardType"], json!("FAKE_BOARD"));
}

#[tokio::test]
async fn node_locked_configuration_requires_a_license_directory() {
    let err = Config::from_json_str(r#"{"licensing": {"nodelocked": true}}"#).unwrap_err();
    assert_eq!(err.code(), ErrorCode::BadFormat);
}

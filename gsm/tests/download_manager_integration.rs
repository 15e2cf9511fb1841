//! End-to-end exercises of the download manager over the real bus, with
//! the content tool replaced by a shell stand-in.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use gsm::bus::MessageBus;
use gsm::config::{Settings, SteamLogin};
use gsm::lock::LockService;
use gsm::manager::{download, ModuleContext};
use gsm::rpc::{payload, request, ReplyEvent};
use gsm::signals::SignalHub;

fn test_settings(root: &Path) -> Settings {
    Settings {
        manager_tmpdir: root.join("tmp"),
        server_files_root: root.join("files"),
        game_id: None,
        instance_id: None,
        steamcmd_files_force: false,
        server_files_force: false,
        server_config_files_force: false,
        steam_login: SteamLogin::Anonymous,
        steamcmd_twofactor_enabled: false,
        steamcmd_initial_download_validate: false,
        server_config_repo: None,
        server_config_ssh_key: None,
        steamcmd_download_url: "http://127.0.0.1:1/unused.tgz".to_string(),
    }
}

/// Install a fake `steamcmd.sh` so no bootstrap or network is needed.
fn install_fake_tool(settings: &Settings, body: &str) {
    let tool_dir = settings.steamcmd_dir();
    std::fs::create_dir_all(&tool_dir).unwrap();
    let script = tool_dir.join("steamcmd.sh");
    std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}

struct Harness {
    _tmp: tempfile::TempDir,
    settings: Settings,
    hub: SignalHub,
    client_bus: Arc<MessageBus>,
    manager: tokio::task::JoinHandle<()>,
}

impl Harness {
    async fn start(tool_body: &str) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let settings = test_settings(tmp.path());
        install_fake_tool(&settings, tool_body);

        let bus = Arc::new(MessageBus::new(settings.ipc_dir()).unwrap());
        let locks = Arc::new(LockService::new(settings.lock_dir()).unwrap());
        let hub = SignalHub::disconnected();
        let ctx = ModuleContext::with_parts(
            download::MODULE,
            settings.clone(),
            bus,
            locks,
            hub.clone(),
        );
        let runtime = download::build(ctx);
        let manager = tokio::spawn(async move {
            runtime.run().await.unwrap();
        });
        // Let the manager subscribe before clients publish.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let client_bus = Arc::new(MessageBus::new(settings.ipc_dir()).unwrap());
        Self {
            _tmp: tmp,
            settings,
            hub,
            client_bus,
            manager,
        }
    }

    async fn stop(self) {
        self.hub.begin_shutdown();
        let _ = self.manager.await;
        self.client_bus.stop_watching().await;
    }
}

#[tokio::test]
async fn test_download_game_happy_path() {
    let harness = Harness::start(
        r"printf ' Update state (0x61) downloading, progress: 10.00 (100 / 1000)\r\n'; \
          printf ' Update state (0x61) downloading, progress: 60.00 (600 / 1000)\r\n'; \
          printf ' Update state (0x61) downloading, progress: 100.00 (1000 / 1000)\r\n'; \
          printf 'Success! App fully installed.\r\n'; exit 0",
    )
    .await;

    let mut pending = request(
        &harness.client_bus,
        "itest",
        "downloadManager",
        "downloadUpdateGame",
        payload(&[("gameId", json!("csgo"))]),
    )
    .unwrap();

    let ack = pending.await_ack(Duration::from_secs(10)).await.unwrap();
    assert!(matches!(ack, ReplyEvent::Ack(_)));

    let mut percents: Vec<f64> = Vec::new();
    let terminal = pending
        .await_final(Duration::from_secs(30), |event| {
            if let ReplyEvent::Progress(progress) = event {
                assert_eq!(progress["stage"], json!("game-download"));
                percents.push(progress["percent"].as_f64().unwrap());
            }
        })
        .await
        .unwrap();

    // Monotonically increasing game-download progress.
    assert!(!percents.is_empty());
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));

    match terminal {
        ReplyEvent::FinalStatus(status) => assert_eq!(status["reason"], json!("completed")),
        other => panic!("expected finalStatus, got {other:?}"),
    }

    harness.stop().await;
}

#[tokio::test]
async fn test_download_unknown_game_is_error() {
    let harness = Harness::start("exit 0").await;

    let mut pending = request(
        &harness.client_bus,
        "itest",
        "downloadManager",
        "downloadUpdateGame",
        payload(&[("gameId", json!("xyzzy"))]),
    )
    .unwrap();

    let reply = pending.await_ack(Duration::from_secs(10)).await.unwrap();
    match reply {
        ReplyEvent::Error(payload) => {
            let message = payload["message"].as_str().unwrap();
            assert!(message.contains("gameId unsupported"), "got: {message}");
        }
        other => panic!("expected error, got {other:?}"),
    }

    harness.stop().await;
}

#[tokio::test]
async fn test_duplicate_download_is_deflected() {
    let harness = Harness::start("sleep 5; exit 0").await;

    let mut first = request(
        &harness.client_bus,
        "itest",
        "downloadManager",
        "downloadUpdateGame",
        payload(&[("gameId", json!("csgo"))]),
    )
    .unwrap();
    let ack = first.await_ack(Duration::from_secs(10)).await.unwrap();
    let first_channel = match ack {
        ReplyEvent::Ack(payload) => payload["subscribeTo"].as_str().unwrap().to_string(),
        other => panic!("expected ack, got {other:?}"),
    };

    // Second identical request shortly after: nacked onto the first.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut second = request(
        &harness.client_bus,
        "itest",
        "downloadManager",
        "downloadUpdateGame",
        payload(&[("gameId", json!("csgo"))]),
    )
    .unwrap();
    match second.await_ack(Duration::from_secs(10)).await.unwrap() {
        ReplyEvent::Nack(payload) => {
            assert_eq!(payload["alreadyRequested"], json!(true));
            assert_eq!(payload["subscribeTo"].as_str().unwrap(), first_channel);
        }
        other => panic!("expected nack, got {other:?}"),
    }
    second.abandon();

    // The first exchange still completes normally.
    let terminal = first
        .await_final(Duration::from_secs(30), |_| {})
        .await
        .unwrap();
    assert!(matches!(terminal, ReplyEvent::FinalStatus(_)));

    harness.stop().await;
}

#[tokio::test]
async fn test_cancel_download_with_cleanup() {
    let harness = Harness::start("sleep 30").await;
    let install_dir = harness.settings.base_dir("csgo");

    let mut download = request(
        &harness.client_bus,
        "itest",
        "downloadManager",
        "downloadUpdateGame",
        payload(&[("gameId", json!("csgo"))]),
    )
    .unwrap();
    let ack = download.await_ack(Duration::from_secs(10)).await.unwrap();
    assert!(matches!(ack, ReplyEvent::Ack(_)));
    // The worker creates the install tree shortly after the ack.
    let dir_deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !install_dir.exists() && std::time::Instant::now() < dir_deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(install_dir.exists());

    // Cancel from a second client while the tool sleeps.
    let mut cancel = request(
        &harness.client_bus,
        "itest",
        "downloadManager",
        "cancelDownload",
        payload(&[("game", json!("csgo")), ("cleanup", json!(true))]),
    )
    .unwrap();

    let canceled_at = std::time::Instant::now();
    let download_terminal = download
        .await_final(Duration::from_secs(10), |_| {})
        .await
        .unwrap();
    match download_terminal {
        ReplyEvent::FinalStatus(status) => {
            assert_eq!(status["reason"], json!("canceled"));
        }
        other => panic!("expected finalStatus, got {other:?}"),
    }
    // Honored well within the two-second cancellation budget.
    assert!(canceled_at.elapsed() < Duration::from_secs(5));

    let cancel_terminal = cancel
        .await_final(Duration::from_secs(10), |_| {})
        .await
        .unwrap();
    match cancel_terminal {
        ReplyEvent::FinalStatus(status) => {
            assert_eq!(status["reason"], json!("canceled"));
        }
        other => panic!("expected finalStatus, got {other:?}"),
    }

    // --cleanup removed the partial download tree.
    assert!(!install_dir.exists());

    harness.stop().await;
}

#[tokio::test]
async fn test_list_downloads_shows_running_task() {
    let harness = Harness::start("sleep 5; exit 0").await;

    let mut download = request(
        &harness.client_bus,
        "itest",
        "downloadManager",
        "downloadUpdateGame",
        payload(&[("gameId", json!("csgo"))]),
    )
    .unwrap();
    download.await_ack(Duration::from_secs(10)).await.unwrap();

    let mut list = request(
        &harness.client_bus,
        "itest",
        "downloadManager",
        "listDownloads",
        payload(&[]),
    )
    .unwrap();
    let terminal = list
        .await_final(Duration::from_secs(10), |_| {})
        .await
        .unwrap();
    match terminal {
        ReplyEvent::FinalStatus(status) => {
            let downloads = status["downloads"].as_array().unwrap();
            assert_eq!(downloads.len(), 1);
            assert_eq!(downloads[0]["key"], json!("csgo"));
        }
        other => panic!("expected finalStatus, got {other:?}"),
    }

    download.abandon();
    harness.stop().await;
}

//! `downloadManager`: base-file downloads via the content tool.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::info;

use crate::lock::LockName;
use crate::manifest::{DownloadType, ManifestStore};
use crate::rpc::{ReplySub, RequestEnvelope};
use crate::steam::{DownloadRequest, SteamDownloadWorker};
use crate::task::{TaskError, TaskSpec};

use super::runtime::{ModuleContext, ModuleRuntime};

/// Module identity on the bus.
pub const MODULE: &str = "downloadManager";

/// How long a cancel may take before the canceller gives up waiting.
const CANCEL_WIND_DOWN: Duration = Duration::from_secs(10);

/// Build the download manager's runtime with its handlers registered.
pub fn build(ctx: Arc<ModuleContext>) -> ModuleRuntime {
    let mut runtime = ModuleRuntime::new(ctx);
    runtime.register("downloadUpdateGame", handle_download_update_game);
    runtime.register("cancelDownload", handle_cancel_download);
    runtime.register("listDownloads", handle_list_downloads);
    runtime
}

async fn handle_download_update_game(ctx: Arc<ModuleContext>, envelope: RequestEnvelope) {
    let request = match validate(&ctx, &envelope) {
        Ok(request) => request,
        Err(e) => {
            ctx.supervisor.reject(&envelope, &e);
            return;
        }
    };

    let spec = TaskSpec::new(
        request.game_id.clone(),
        LockName::download_game(&request.game_id),
    )
    // Mounted base files are active readers of the download target.
    .wait_for(LockName::base_mount_pattern(&request.game_id));

    let worker = SteamDownloadWorker {
        request,
        hub: ctx.hub.clone(),
    };
    ctx.supervisor.run(envelope, spec, worker).await;
}

fn validate(
    ctx: &ModuleContext,
    envelope: &RequestEnvelope,
) -> Result<DownloadRequest, TaskError> {
    let game_id = envelope
        .field_str("gameId")
        .ok_or_else(|| TaskError::Validation("gameId is required".to_string()))?
        .to_string();

    let manifests = ManifestStore::load(&ctx.settings.manifest_dir())
        .map_err(|e| TaskError::Validation(e.to_string()))?;
    let manifest = manifests
        .get(&game_id)
        .map_err(|e| TaskError::Validation(e.to_string()))?;
    match manifest.download_type {
        DownloadType::Steamcmd => {}
    }

    // Two-factor must be rejected before any lock is touched.
    if ctx.settings.steamcmd_twofactor_enabled || envelope.field_bool("twofactor") {
        return Err(TaskError::Unsupported(
            "two-factor authentication is not supported".to_string(),
        ));
    }

    let login = match (
        envelope.field_str("username"),
        envelope.field_str("password"),
    ) {
        (Some(username), Some(password)) => crate::config::SteamLogin::Credentials {
            username: username.to_string(),
            password: password.to_string(),
        },
        _ => ctx.settings.steam_login.clone(),
    };

    let install_dir = match envelope.field_str("rootDirectory") {
        Some(root) => std::path::Path::new(root).join("base").join(&game_id),
        None => ctx.settings.base_dir(&game_id),
    };

    Ok(DownloadRequest {
        app_id: manifest.download_id,
        install_dir,
        tool_dir: ctx.settings.steamcmd_dir(),
        login,
        validate: envelope.field_bool("validate")
            || ctx.settings.steamcmd_initial_download_validate,
        force_tool: envelope.field_bool("steamcmdClean") || ctx.settings.steamcmd_files_force,
        force_server_files: envelope.field_bool("clean")
            || envelope.field_bool("force")
            || ctx.settings.server_files_force,
        download_url: ctx.settings.steamcmd_download_url.clone(),
        twofactor: false,
        game_id,
    })
}

async fn handle_cancel_download(ctx: Arc<ModuleContext>, envelope: RequestEnvelope) {
    let Some(game_id) = envelope
        .field_str("game")
        .or_else(|| envelope.field_str("gameId"))
        .map(str::to_string)
    else {
        ctx.supervisor.reject(
            &envelope,
            &TaskError::Validation("game is required".to_string()),
        );
        return;
    };

    if !ctx.registry.contains(&game_id) {
        publish(
            &ctx,
            &envelope,
            ReplySub::Nack,
            json!({ "message": format!("no active download for {game_id}") }),
        );
        return;
    }

    publish(
        &ctx,
        &envelope,
        ReplySub::Ack,
        json!({ "subscribeTo": envelope.reply_to }),
    );

    ctx.supervisor
        .cancel_and_wait(&game_id, CANCEL_WIND_DOWN)
        .await;

    if envelope.field_bool("cleanup") {
        let dir = ctx.settings.base_dir(&game_id);
        info!(game_id, dir = %dir.display(), "removing canceled download");
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                publish(
                    &ctx,
                    &envelope,
                    ReplySub::Error,
                    json!({ "message": format!("cleanup failed: {e}") }),
                );
                return;
            }
        }
    }

    publish(
        &ctx,
        &envelope,
        ReplySub::FinalStatus,
        json!({ "reason": "canceled", "key": game_id }),
    );
}

async fn handle_list_downloads(ctx: Arc<ModuleContext>, envelope: RequestEnvelope) {
    publish(
        &ctx,
        &envelope,
        ReplySub::Ack,
        json!({ "subscribeTo": envelope.reply_to }),
    );
    let downloads = ctx.registry.snapshots();
    publish(
        &ctx,
        &envelope,
        ReplySub::FinalStatus,
        json!({ "reason": "completed", "downloads": downloads }),
    );
}

fn publish(
    ctx: &ModuleContext,
    envelope: &RequestEnvelope,
    sub: ReplySub,
    payload: serde_json::Value,
) {
    if let Err(e) = ctx.bus.publish(&envelope.reply_topic(sub), payload) {
        tracing::error!("reply publish failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageBus;
    use crate::config::{Settings, SteamLogin};
    use crate::lock::LockService;
    use crate::rpc::payload;
    use crate::signals::SignalHub;

    fn context(root: &std::path::Path) -> Arc<ModuleContext> {
        let settings = Settings {
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
        };
        let bus = Arc::new(MessageBus::new(settings.ipc_dir()).unwrap());
        let locks = Arc::new(LockService::new(settings.lock_dir()).unwrap());
        ModuleContext::with_parts(MODULE, settings, bus, locks, SignalHub::disconnected())
    }

    fn envelope(fields: &[(&str, serde_json::Value)]) -> RequestEnvelope {
        RequestEnvelope::new("tester", payload(fields))
    }

    #[tokio::test]
    async fn test_validate_requires_game_id() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path());
        let err = validate(&ctx, &envelope(&[])).unwrap_err();
        assert!(err.to_string().contains("gameId is required"));
        ctx.bus.stop_watching().await;
    }

    #[tokio::test]
    async fn test_validate_unknown_game() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path());
        let err = validate(&ctx, &envelope(&[("gameId", json!("xyzzy"))])).unwrap_err();
        assert!(err.to_string().contains("gameId unsupported"));
        ctx.bus.stop_watching().await;
    }

    #[tokio::test]
    async fn test_validate_rejects_twofactor() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path());
        let err = validate(
            &ctx,
            &envelope(&[("gameId", json!("csgo")), ("twofactor", json!(true))]),
        )
        .unwrap_err();
        assert!(matches!(err, TaskError::Unsupported(_)));
        ctx.bus.stop_watching().await;
    }

    #[tokio::test]
    async fn test_validate_builds_request_from_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path());
        let request = validate(
            &ctx,
            &envelope(&[
                ("gameId", json!("csgo")),
                ("validate", json!(true)),
                ("clean", json!(true)),
            ]),
        )
        .unwrap();

        assert_eq!(request.app_id, 740);
        assert!(request.validate);
        assert!(request.force_server_files);
        assert!(!request.force_tool);
        assert_eq!(request.install_dir, ctx.settings.base_dir("csgo"));
        assert_eq!(request.login, SteamLogin::Anonymous);
        ctx.bus.stop_watching().await;
    }

    #[tokio::test]
    async fn test_validate_credentials_from_request() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path());
        let request = validate(
            &ctx,
            &envelope(&[
                ("gameId", json!("csgo")),
                ("username", json!("steamuser")),
                ("password", json!("hunter2")),
            ]),
        )
        .unwrap();
        assert_eq!(
            request.login,
            SteamLogin::Credentials {
                username: "steamuser".to_string(),
                password: "hunter2".to_string(),
            }
        );
        ctx.bus.stop_watching().await;
    }

    #[tokio::test]
    async fn test_cancel_without_task_nacks() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path());
        let envelope = envelope(&[("game", json!("csgo"))]);
        let mut sub = ctx.bus.subscribe(&format!("{}.#", envelope.reply_to));

        handle_cancel_download(Arc::clone(&ctx), envelope).await;

        let message = sub
            .recv_timeout(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert!(message.topic.ends_with(".nack"));
        ctx.bus.stop_watching().await;
    }

    #[tokio::test]
    async fn test_list_downloads_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path());
        let envelope = envelope(&[]);
        let mut sub = ctx.bus.subscribe(&format!("{}.#", envelope.reply_to));

        handle_list_downloads(Arc::clone(&ctx), envelope).await;

        let ack = sub
            .recv_timeout(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert!(ack.topic.ends_with(".ack"));
        let final_status = sub
            .recv_timeout(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert!(final_status.topic.ends_with(".finalStatus"));
        assert_eq!(final_status.payload["downloads"], json!([]));
        ctx.bus.stop_watching().await;
    }
}

//! `configManager`: instance configuration via the VCS driver.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::validate_instance_id;
use crate::lock::LockName;
use crate::repo::{RepoAction, RepoRequest, RepoWorker};
use crate::rpc::RequestEnvelope;
use crate::task::{TaskError, TaskSpec};

use super::runtime::{ModuleContext, ModuleRuntime};

/// Module identity on the bus.
pub const MODULE: &str = "configManager";

/// Build the config manager's runtime with its handlers registered.
pub fn build(ctx: Arc<ModuleContext>) -> ModuleRuntime {
    let mut runtime = ModuleRuntime::new(ctx);
    runtime.register("downloadUpdateRepo", handle_download_update_repo);
    runtime
}

async fn handle_download_update_repo(ctx: Arc<ModuleContext>, envelope: RequestEnvelope) {
    let request = match validate(&ctx, &envelope) {
        Ok(request) => request,
        Err(e) => {
            ctx.supervisor.reject(&envelope, &e);
            return;
        }
    };

    let spec = TaskSpec::new(
        request.instance_id.clone(),
        LockName::repo_download(&request.instance_id),
    )
    // A mounted config layer is an active reader of the checkout.
    .wait_for(LockName::config_mount_pattern(&request.instance_id));

    ctx.supervisor
        .run(envelope, spec, RepoWorker { request })
        .await;
}

fn validate(ctx: &ModuleContext, envelope: &RequestEnvelope) -> Result<RepoRequest, TaskError> {
    let instance_id = envelope
        .field_str("instanceId")
        .ok_or_else(|| TaskError::Validation("instanceId is required".to_string()))?
        .to_string();
    validate_instance_id(&instance_id).map_err(|e| TaskError::Validation(e.to_string()))?;

    let settings_repo = ctx.settings.server_config_repo.as_ref();
    let repo_url = envelope
        .field_str("repoUrl")
        .map(str::to_string)
        .or_else(|| settings_repo.map(|r| r.url.clone()))
        .ok_or_else(|| TaskError::Validation("repoUrl is required".to_string()))?;

    let branch = envelope
        .field_str("repoBranch")
        .map(str::to_string)
        .or_else(|| settings_repo.map(|r| r.branch.clone()))
        .unwrap_or_else(|| "main".to_string());

    let repo_dir = match envelope.field_str("repoDir") {
        Some(dir) => PathBuf::from(dir),
        None => {
            // Layout: config/<gameId>/<instanceId>[/<layerIdent>], with the
            // game segment omitted when the request does not carry one.
            let mut dir = ctx.settings.server_files_root.join("config");
            if let Some(game_id) = envelope.field_str("gameId") {
                dir = dir.join(game_id);
            }
            dir = dir.join(&instance_id);
            if let Some(layer) = envelope.field_str("layerIdent") {
                dir = dir.join(layer);
            }
            dir
        }
    };

    let action = match envelope.field_str("action") {
        Some(value) => RepoAction::parse(value).ok_or_else(|| {
            TaskError::Validation(format!("action must be 'clone' or 'pull', got '{value}'"))
        })?,
        // Without an explicit action, pull an existing checkout and clone
        // a missing one.
        None => {
            if repo_dir.join(".git").exists() {
                RepoAction::Pull
            } else {
                RepoAction::Clone
            }
        }
    };

    Ok(RepoRequest {
        instance_id,
        repo_url,
        repo_dir,
        branch,
        action,
        clean: envelope.field_bool("clean") || ctx.settings.server_config_files_force,
        ssh_key: ctx.settings.server_config_ssh_key.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageBus;
    use crate::config::{parse_repo_source, Settings, SteamLogin};
    use crate::lock::LockService;
    use crate::rpc::payload;
    use crate::signals::SignalHub;
    use serde_json::json;

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
            server_config_repo: Some(
                parse_repo_source("https://github.com/example/csgo-config#production").unwrap(),
            ),
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
    async fn test_validate_requires_instance_id() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path());
        let err = validate(&ctx, &envelope(&[])).unwrap_err();
        assert!(err.to_string().contains("instanceId is required"));
        ctx.bus.stop_watching().await;
    }

    #[tokio::test]
    async fn test_validate_rejects_bad_instance_id() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path());
        let err = validate(&ctx, &envelope(&[("instanceId", json!("bad id"))])).unwrap_err();
        assert!(matches!(err, TaskError::Validation(_)));
        ctx.bus.stop_watching().await;
    }

    #[tokio::test]
    async fn test_validate_defaults_from_settings() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path());
        let request = validate(&ctx, &envelope(&[("instanceId", json!("main-1"))])).unwrap();

        assert_eq!(request.repo_url, "https://github.com/example/csgo-config");
        assert_eq!(request.branch, "production");
        assert_eq!(request.action, RepoAction::Clone);
        assert_eq!(
            request.repo_dir,
            ctx.settings.server_files_root.join("config/main-1")
        );
        ctx.bus.stop_watching().await;
    }

    #[tokio::test]
    async fn test_validate_request_fields_win() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path());
        let request = validate(
            &ctx,
            &envelope(&[
                ("instanceId", json!("main-1")),
                ("gameId", json!("csgo")),
                ("layerIdent", json!("maps")),
                ("repoUrl", json!("https://github.com/example/maps")),
                ("repoBranch", json!("stable")),
                ("action", json!("clone")),
                ("clean", json!(true)),
            ]),
        )
        .unwrap();

        assert_eq!(request.repo_url, "https://github.com/example/maps");
        assert_eq!(request.branch, "stable");
        assert!(request.clean);
        assert_eq!(
            request.repo_dir,
            ctx.settings
                .server_files_root
                .join("config/csgo/main-1/maps")
        );
        ctx.bus.stop_watching().await;
    }

    #[tokio::test]
    async fn test_validate_auto_action_pull_for_existing_checkout() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path());
        let checkout = ctx.settings.server_files_root.join("config/main-1");
        std::fs::create_dir_all(checkout.join(".git")).unwrap();

        let request = validate(&ctx, &envelope(&[("instanceId", json!("main-1"))])).unwrap();
        assert_eq!(request.action, RepoAction::Pull);
        ctx.bus.stop_watching().await;
    }

    #[tokio::test]
    async fn test_validate_rejects_unknown_action() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path());
        let err = validate(
            &ctx,
            &envelope(&[("instanceId", json!("main-1")), ("action", json!("rebase"))]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("action must be"));
        ctx.bus.stop_watching().await;
    }
}

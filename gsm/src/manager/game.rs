//! `gameManager`: supervises the game process of an instance.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::game::{GameWorker, LaunchPlan};
use crate::lock::LockName;
use crate::manifest::{InstanceConfig, ManifestStore};
use crate::rpc::{ReplySub, RequestEnvelope};
use crate::task::{TaskError, TaskSpec};

use super::runtime::{ModuleContext, ModuleRuntime};

/// Module identity on the bus.
pub const MODULE: &str = "gameManager";

/// Budget for a stop request to wind the game task down. Covers the
/// SIGTERM grace window plus the SIGKILL escalation.
const STOP_WIND_DOWN: Duration = Duration::from_secs(40);

/// Build the game manager's runtime with its handlers registered.
pub fn build(ctx: Arc<ModuleContext>) -> ModuleRuntime {
    let mut runtime = ModuleRuntime::new(ctx);
    runtime.register("start", handle_start);
    runtime.register("stop", handle_stop);
    runtime
}

async fn handle_start(ctx: Arc<ModuleContext>, envelope: RequestEnvelope) {
    let (spec, worker) = match validate(&ctx, &envelope) {
        Ok(parts) => parts,
        Err(e) => {
            ctx.supervisor.reject(&envelope, &e);
            return;
        }
    };
    ctx.supervisor.run(envelope, spec, worker).await;
}

fn validate(
    ctx: &ModuleContext,
    envelope: &RequestEnvelope,
) -> Result<(TaskSpec, GameWorker), TaskError> {
    let game_id = envelope
        .field_str("gameId")
        .ok_or_else(|| TaskError::Validation("gameId is required".to_string()))?
        .to_string();
    let instance_id = envelope
        .field_str("instanceId")
        .ok_or_else(|| TaskError::Validation("instanceId is required".to_string()))?
        .to_string();

    let manifests = ManifestStore::load(&ctx.settings.manifest_dir())
        .map_err(|e| TaskError::Validation(e.to_string()))?;
    let manifest = manifests
        .get(&game_id)
        .map_err(|e| TaskError::Validation(e.to_string()))?;

    // The merged view must be mounted: both mount locks held by a live
    // overlay manager.
    for lock in [
        LockName::base_mount(&game_id, &instance_id),
        LockName::config_mount(&game_id, &instance_id),
    ] {
        let held = ctx
            .locks
            .is_held(&regex::escape(&lock), false)
            .map_err(TaskError::Lock)?;
        if !held {
            return Err(TaskError::Validation(format!(
                "merged view not mounted (lock '{lock}' is not held)"
            )));
        }
    }

    let instance_file = ctx.settings.instance_file(&game_id, &instance_id);
    let instance = InstanceConfig::load(&instance_file)
        .map_err(|e| TaskError::Validation(e.to_string()))?;

    let merged = ctx.settings.merged_dir(&game_id, &instance_id);
    let plan = LaunchPlan::build(manifest, &instance, &merged);

    let spec = TaskSpec::new(
        format!("{game_id}-{instance_id}"),
        LockName::running(&game_id, &instance_id),
    );
    let worker = GameWorker::new(plan, ctx.hub.clone());
    Ok((spec, worker))
}

async fn handle_stop(ctx: Arc<ModuleContext>, envelope: RequestEnvelope) {
    let (Some(game_id), Some(instance_id)) = (
        envelope.field_str("gameId"),
        envelope.field_str("instanceId"),
    ) else {
        ctx.supervisor.reject(
            &envelope,
            &TaskError::Validation("gameId and instanceId are required".to_string()),
        );
        return;
    };
    let key = format!("{game_id}-{instance_id}");

    if !ctx.registry.contains(&key) {
        publish(
            &ctx,
            &envelope,
            ReplySub::Nack,
            json!({ "message": format!("no running game for {key}") }),
        );
        return;
    }

    publish(
        &ctx,
        &envelope,
        ReplySub::Ack,
        json!({ "subscribeTo": envelope.reply_to }),
    );

    ctx.supervisor.cancel_and_wait(&key, STOP_WIND_DOWN).await;

    publish(
        &ctx,
        &envelope,
        ReplySub::FinalStatus,
        json!({ "reason": "completed", "key": key }),
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

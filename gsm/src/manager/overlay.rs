//! `overlayManager`: composes and tears down merged views.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;

use crate::overlay::{MountSpec, Mounter, OverlayComposer, OverlayError, SystemMounter};
use crate::rpc::{ReplySub, RequestEnvelope};

use super::runtime::{ModuleContext, ModuleRuntime};

/// Module identity on the bus.
pub const MODULE: &str = "overlayManager";

/// Build the overlay manager's runtime with its handlers registered.
pub fn build(ctx: Arc<ModuleContext>) -> ModuleRuntime {
    build_with_mounter(ctx, SystemMounter)
}

/// Build with a custom [`Mounter`] (tests use a mock).
pub fn build_with_mounter<M: Mounter>(ctx: Arc<ModuleContext>, mounter: M) -> ModuleRuntime {
    let composer = Arc::new(OverlayComposer::new(Arc::clone(&ctx.locks), mounter));

    let mut runtime = ModuleRuntime::new(ctx);
    let setup_composer = Arc::clone(&composer);
    runtime.register("setupMount", move |ctx, envelope| {
        let composer = Arc::clone(&setup_composer);
        async move { handle_setup_mount(ctx, envelope, composer).await }
    });
    let remove_composer = Arc::clone(&composer);
    runtime.register("removeMount", move |ctx, envelope| {
        let composer = Arc::clone(&remove_composer);
        async move { handle_remove_mount(ctx, envelope, composer).await }
    });
    runtime
}

async fn handle_setup_mount<M: Mounter>(
    ctx: Arc<ModuleContext>,
    envelope: RequestEnvelope,
    composer: Arc<OverlayComposer<M>>,
) {
    let (game_id, instance_id) = match ids(&envelope) {
        Ok(ids) => ids,
        Err(message) => {
            publish(&ctx, &envelope, ReplySub::Error, json!({ "message": message }));
            return;
        }
    };

    // A duplicate mount is a nack (the lifecycle coordinator maps it to
    // its own exit code), not an error.
    if composer.is_mounted(&game_id, &instance_id) {
        publish(
            &ctx,
            &envelope,
            ReplySub::Nack,
            json!({ "alreadyMounted": true }),
        );
        return;
    }

    publish(
        &ctx,
        &envelope,
        ReplySub::Ack,
        json!({ "subscribeTo": envelope.reply_to }),
    );

    let spec = mount_spec(&ctx, &envelope, &game_id, &instance_id);
    match composer.setup_mount(spec).await {
        Ok(()) => publish(
            &ctx,
            &envelope,
            ReplySub::FinalStatus,
            json!({ "reason": "completed", "key": format!("{game_id}-{instance_id}") }),
        ),
        Err(e) => publish(
            &ctx,
            &envelope,
            ReplySub::Error,
            json!({ "message": e.to_string() }),
        ),
    }
}

async fn handle_remove_mount<M: Mounter>(
    ctx: Arc<ModuleContext>,
    envelope: RequestEnvelope,
    composer: Arc<OverlayComposer<M>>,
) {
    let (game_id, instance_id) = match ids(&envelope) {
        Ok(ids) => ids,
        Err(message) => {
            publish(&ctx, &envelope, ReplySub::Error, json!({ "message": message }));
            return;
        }
    };

    if !composer.is_mounted(&game_id, &instance_id) {
        publish(
            &ctx,
            &envelope,
            ReplySub::Nack,
            json!({ "message": format!("not mounted: {game_id}-{instance_id}") }),
        );
        return;
    }

    publish(
        &ctx,
        &envelope,
        ReplySub::Ack,
        json!({ "subscribeTo": envelope.reply_to }),
    );

    match composer.remove_mount(&game_id, &instance_id).await {
        Ok(()) => publish(
            &ctx,
            &envelope,
            ReplySub::FinalStatus,
            json!({ "reason": "completed", "key": format!("{game_id}-{instance_id}") }),
        ),
        Err(e @ OverlayError::UnmountBudgetExhausted { .. }) => publish(
            &ctx,
            &envelope,
            ReplySub::FinalStatus,
            json!({ "reason": "failed", "message": e.to_string() }),
        ),
        Err(e) => publish(
            &ctx,
            &envelope,
            ReplySub::Error,
            json!({ "message": e.to_string() }),
        ),
    }
}

fn ids(envelope: &RequestEnvelope) -> Result<(String, String), String> {
    let game_id = envelope
        .field_str("gameId")
        .ok_or_else(|| "gameId is required".to_string())?;
    let instance_id = envelope
        .field_str("instanceId")
        .ok_or_else(|| "instanceId is required".to_string())?;
    Ok((game_id.to_string(), instance_id.to_string()))
}

fn mount_spec(
    ctx: &ModuleContext,
    envelope: &RequestEnvelope,
    game_id: &str,
    instance_id: &str,
) -> MountSpec {
    // Config layers may be listed explicitly (ordered, earlier = lower);
    // the default is the instance's whole config checkout as one layer.
    let config_layers: Vec<PathBuf> = envelope
        .payload
        .get("configLayers")
        .and_then(|v| v.as_array())
        .map(|layers| {
            layers
                .iter()
                .filter_map(|v| v.as_str())
                .map(|layer| ctx.settings.config_dir(game_id, instance_id).join(layer))
                .collect()
        })
        .unwrap_or_else(|| vec![ctx.settings.config_dir(game_id, instance_id)]);

    MountSpec {
        game_id: game_id.to_string(),
        instance_id: instance_id.to_string(),
        base: ctx.settings.base_dir(game_id),
        config_layers,
        persist: ctx.settings.persist_dir(game_id, instance_id),
        work: ctx.settings.work_dir(game_id, instance_id),
        merged: ctx.settings.merged_dir(game_id, instance_id),
    }
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

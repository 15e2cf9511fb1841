//! `gsm download-game-config` - fetch an instance's config repository.

use gsm::rpc::ReplyEvent;
use serde_json::json;

use crate::error::CliError;
use crate::runner::{CliRunner, ACK_BUDGET};

pub struct ConfigFetchArgs {
    pub instance_id: String,
    pub repo_url: String,
    pub layer_ident: String,
    pub clean: bool,
    pub root_directory: Option<String>,
}

pub async fn run(args: ConfigFetchArgs) -> Result<i32, CliError> {
    let runner = CliRunner::new("download-game-config")?;

    // The URL may carry a branch suffix (user@host:org/repo#branch).
    let source = gsm::config::parse_repo_source(&args.repo_url)
        .map_err(|e| CliError::Config(e.to_string()))?;

    let mut payload = serde_json::Map::new();
    payload.insert("instanceId".to_string(), json!(args.instance_id));
    payload.insert("repoUrl".to_string(), json!(source.url));
    payload.insert("repoBranch".to_string(), json!(source.branch));
    payload.insert("layerIdent".to_string(), json!(args.layer_ident));
    payload.insert("clean".to_string(), json!(args.clean));
    if let Some(root) = args.root_directory {
        payload.insert(
            "repoDir".to_string(),
            json!(format!(
                "{root}/config/{}/{}",
                args.instance_id, args.layer_ident
            )),
        );
    }

    println!(
        "fetching config for instance '{}' from {}...",
        args.instance_id, source.url
    );
    let mut pending = runner.request("configManager", "downloadUpdateRepo", payload)?;

    let ack = pending
        .await_ack(ACK_BUDGET)
        .await
        .map_err(|e| CliError::Request {
            target: "configManager".to_string(),
            message: e.to_string(),
        })?;

    let code = match ack {
        ReplyEvent::Ack(_) => runner.follow_to_end("configManager", pending).await?,
        ReplyEvent::Nack(payload) => {
            if let Some(channel) = payload.get("subscribeTo").and_then(|v| v.as_str()) {
                println!("fetch already in flight, following it");
                let channel = channel.to_string();
                pending.abandon();
                runner.follow_channel(&channel).await?
            } else {
                eprintln!("request refused: {payload}");
                1
            }
        }
        ReplyEvent::Error(payload) => {
            eprintln!(
                "error: {}",
                payload.get("message").and_then(|v| v.as_str()).unwrap_or("?")
            );
            1
        }
        _ => 1,
    };

    runner.finish().await;
    Ok(code)
}

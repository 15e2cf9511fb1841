//! `gsm download-game` - start or join a base-file download.

use gsm::rpc::ReplyEvent;
use serde_json::json;

use crate::error::CliError;
use crate::runner::{CliRunner, ACK_BUDGET};

pub struct DownloadArgs {
    pub game: String,
    pub force: bool,
    pub validate: bool,
    pub clean: bool,
    pub steamcmd_clean: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub root_directory: Option<String>,
}

pub async fn run(args: DownloadArgs) -> Result<i32, CliError> {
    let runner = CliRunner::new("download-game")?;

    let mut payload = serde_json::Map::new();
    payload.insert("gameId".to_string(), json!(args.game));
    payload.insert("force".to_string(), json!(args.force));
    payload.insert("validate".to_string(), json!(args.validate));
    payload.insert("clean".to_string(), json!(args.clean));
    payload.insert("steamcmdClean".to_string(), json!(args.steamcmd_clean));
    if let Some(username) = args.username {
        payload.insert("username".to_string(), json!(username));
    }
    if let Some(password) = args.password {
        payload.insert("password".to_string(), json!(password));
    }
    if let Some(root) = args.root_directory {
        payload.insert("rootDirectory".to_string(), json!(root));
    }

    println!("requesting download of '{}'...", args.game);
    let mut pending = runner.request("downloadManager", "downloadUpdateGame", payload)?;

    let ack = pending
        .await_ack(ACK_BUDGET)
        .await
        .map_err(|e| CliError::Request {
            target: "downloadManager".to_string(),
            message: e.to_string(),
        })?;

    let code = match ack {
        ReplyEvent::Ack(_) => runner.follow_to_end("downloadManager", pending).await?,
        ReplyEvent::Nack(payload) => {
            if let Some(channel) = payload.get("subscribeTo").and_then(|v| v.as_str()) {
                println!("download already in flight, following it");
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

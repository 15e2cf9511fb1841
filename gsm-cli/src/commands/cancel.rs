//! `gsm cancel-download <game>` - cancel a running download.

use serde_json::json;

use crate::error::CliError;
use crate::runner::{CliRunner, ACK_BUDGET};
use gsm::rpc::ReplyEvent;

pub async fn run(game: String, cleanup: bool) -> Result<i32, CliError> {
    let runner = CliRunner::new("cancel-download")?;

    let mut payload = serde_json::Map::new();
    payload.insert("game".to_string(), json!(game));
    payload.insert("cleanup".to_string(), json!(cleanup));

    let mut pending = runner.request("downloadManager", "cancelDownload", payload)?;
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
            eprintln!(
                "nothing to cancel: {}",
                payload.get("message").and_then(|v| v.as_str()).unwrap_or("?")
            );
            1
        }
        ReplyEvent::Error(payload) => {
            eprintln!("error: {payload}");
            1
        }
        _ => 1,
    };

    runner.finish().await;
    Ok(code)
}

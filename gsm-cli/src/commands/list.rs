//! `gsm list-downloads` - show in-flight downloads.

use gsm::rpc::ReplyEvent;
use serde_json::Map;
use std::time::Duration;

use crate::error::CliError;
use crate::runner::CliRunner;

pub async fn run() -> Result<i32, CliError> {
    let runner = CliRunner::new("list-downloads")?;

    let mut pending = runner.request("downloadManager", "listDownloads", Map::new())?;
    let terminal = pending
        .await_final(Duration::from_secs(30), |_| {})
        .await
        .map_err(|e| CliError::Request {
            target: "downloadManager".to_string(),
            message: e.to_string(),
        })?;

    let code = match terminal {
        ReplyEvent::FinalStatus(payload) => {
            let downloads = payload
                .get("downloads")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            if downloads.is_empty() {
                println!("no downloads in flight");
            } else {
                for download in downloads {
                    let key = download.get("key").and_then(|v| v.as_str()).unwrap_or("?");
                    let state = download
                        .get("state")
                        .and_then(|v| v.as_str())
                        .unwrap_or("?");
                    let percent = download
                        .get("lastProgress")
                        .and_then(|p| p.get("percent"))
                        .and_then(|v| v.as_f64());
                    match percent {
                        Some(percent) => println!("{key}  {state}  {percent:.1}%"),
                        None => println!("{key}  {state}"),
                    }
                }
            }
            0
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

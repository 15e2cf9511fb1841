//! `gsm send <channel> <message>` - raw bus publish.

use serde_json::json;

use crate::error::CliError;
use crate::runner::CliRunner;

pub async fn run(channel: String, message: String) -> Result<i32, CliError> {
    let runner = CliRunner::new("send")?;

    // A JSON message goes out as-is; anything else is wrapped.
    let payload = serde_json::from_str(&message).unwrap_or_else(|_| json!({ "message": message }));

    runner
        .bus()
        .publish(&channel, payload)
        .map_err(|e| CliError::Bus(e.to_string()))?;
    println!("published on {channel}");

    runner.finish().await;
    Ok(0)
}

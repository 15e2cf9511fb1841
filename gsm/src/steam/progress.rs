//! Progress extraction from content-tool output.
//!
//! The tool interleaves two progress dialects on its terminal:
//!
//! - while updating itself: `[ 45%] Downloading update (1234 of 5678 KB)...`
//! - while downloading a game: ` Update state (0x61) downloading, progress: 42.42 (1234567 / 2345678)`
//!
//! Each non-empty output line is tested against both forms; a match is
//! translated into a [`ProgressSnapshot`].

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Which phase of the tool produced a progress line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressStage {
    #[serde(rename = "tool-self-update")]
    ToolSelfUpdate,
    #[serde(rename = "game-download")]
    GameDownload,
}

/// One structured progress observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub stage: ProgressStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_hex: Option<String>,
    pub state_name: String,
    pub percent: f64,
    pub bytes_received: u64,
    pub bytes_total: u64,
    pub raw_line: String,
}

fn self_update_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\[\s{0,2}(\d+)%\] (\w+).*\((\d+) of (\d+).*$").expect("static regex")
    })
}

fn game_download_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^ Update state \((0x[0-9a-f]+)\) ([\w ]*), progress: (\d+\.\d+) \((\d+) / (\d+)\)$")
            .expect("static regex")
    })
}

/// Try to parse one output line as a progress observation.
pub fn parse_progress_line(line: &str) -> Option<ProgressSnapshot> {
    if let Some(caps) = self_update_re().captures(line) {
        return Some(ProgressSnapshot {
            stage: ProgressStage::ToolSelfUpdate,
            state_hex: None,
            state_name: caps[2].to_string(),
            percent: caps[1].parse().ok()?,
            bytes_received: caps[3].parse().ok()?,
            bytes_total: caps[4].parse().ok()?,
            raw_line: line.to_string(),
        });
    }
    if let Some(caps) = game_download_re().captures(line) {
        return Some(ProgressSnapshot {
            stage: ProgressStage::GameDownload,
            state_hex: Some(caps[1].to_string()),
            state_name: caps[2].trim().to_string(),
            percent: caps[3].parse().ok()?,
            bytes_received: caps[4].parse().ok()?,
            bytes_total: caps[5].parse().ok()?,
            raw_line: line.to_string(),
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_update_line() {
        let line = "[ 45%] Downloading update (1234 of 5678 KB)...";
        let snapshot = parse_progress_line(line).unwrap();
        assert_eq!(snapshot.stage, ProgressStage::ToolSelfUpdate);
        assert_eq!(snapshot.state_name, "Downloading");
        assert_eq!(snapshot.percent, 45.0);
        assert_eq!(snapshot.bytes_received, 1234);
        assert_eq!(snapshot.bytes_total, 5678);
        assert_eq!(snapshot.state_hex, None);
        assert_eq!(snapshot.raw_line, line);
    }

    #[test]
    fn test_self_update_line_full_width_percent() {
        let line = "[100%] Verifying installation (58564 of 58564 KB)...";
        let snapshot = parse_progress_line(line).unwrap();
        assert_eq!(snapshot.percent, 100.0);
        assert_eq!(snapshot.state_name, "Verifying");
    }

    #[test]
    fn test_game_download_line() {
        let line = " Update state (0x61) downloading, progress: 42.42 (1234567 / 2345678)";
        let snapshot = parse_progress_line(line).unwrap();
        assert_eq!(snapshot.stage, ProgressStage::GameDownload);
        assert_eq!(snapshot.state_hex.as_deref(), Some("0x61"));
        assert_eq!(snapshot.state_name, "downloading");
        assert_eq!(snapshot.percent, 42.42);
        assert_eq!(snapshot.bytes_received, 1_234_567);
        assert_eq!(snapshot.bytes_total, 2_345_678);
    }

    #[test]
    fn test_game_verify_state_with_spaces() {
        let line = " Update state (0x81) verifying update, progress: 7.01 (164023446 / 2338535011)";
        let snapshot = parse_progress_line(line).unwrap();
        assert_eq!(snapshot.state_name, "verifying update");
        assert_eq!(snapshot.state_hex.as_deref(), Some("0x81"));
    }

    #[test]
    fn test_non_progress_lines() {
        assert!(parse_progress_line("").is_none());
        assert!(parse_progress_line("Loading Steam API...OK").is_none());
        assert!(parse_progress_line("Success! App '740' fully installed.").is_none());
        // Missing the byte counts: not a progress line.
        assert!(parse_progress_line("[ 45%] Downloading update").is_none());
        // A leading-space variant of the self-update form must not match.
        assert!(parse_progress_line(" [ 45%] Downloading update (1 of 2 KB)").is_none());
    }

    #[test]
    fn test_wire_spelling() {
        let snapshot =
            parse_progress_line(" Update state (0x61) downloading, progress: 1.00 (1 / 100)")
                .unwrap();
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["stage"], serde_json::json!("game-download"));
        assert_eq!(value["stateHex"], serde_json::json!("0x61"));
        assert_eq!(value["bytesReceived"], serde_json::json!(1));
        assert_eq!(value["rawLine"].as_str().unwrap().contains("0x61"), true);
    }
}

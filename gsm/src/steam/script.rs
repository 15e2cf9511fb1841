//! Non-interactive script assembly for the content tool.
//!
//! The tool is driven via `+runscript <file>`; the script sets the install
//! directory, logs in, runs the app update and quits. Interactive prompts
//! are disabled so a wrong password fails fast instead of hanging the PTY.

use std::io;
use std::path::{Path, PathBuf};

use crate::config::SteamLogin;

/// Builder for a tool run script.
#[derive(Debug, Clone)]
pub struct ScriptBuilder {
    install_dir: PathBuf,
    login: SteamLogin,
    app_id: u32,
    validate: bool,
}

impl ScriptBuilder {
    pub fn new(install_dir: impl Into<PathBuf>, login: SteamLogin, app_id: u32) -> Self {
        Self {
            install_dir: install_dir.into(),
            login,
            app_id,
            validate: false,
        }
    }

    /// Run `app_update` with validation.
    pub fn validate(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    /// Render the script text.
    pub fn render(&self) -> String {
        let mut lines = vec![
            "@ShutdownOnFailedCommand 1".to_string(),
            "@NoPromptForPassword 1".to_string(),
            format!("force_install_dir {}", self.install_dir.display()),
        ];
        match &self.login {
            SteamLogin::Anonymous => lines.push("login anonymous".to_string()),
            SteamLogin::Credentials { username, password } => {
                lines.push(format!("login {username} {password}"));
            }
        }
        let validate = if self.validate { " validate" } else { "" };
        lines.push(format!("app_update {}{}", self.app_id, validate));
        lines.push("quit".to_string());
        lines.join("\n") + "\n"
    }

    /// Write the script to `path` with owner-only permissions (it may
    /// contain credentials).
    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        std::fs::write(path, self.render())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

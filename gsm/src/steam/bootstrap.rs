//! Content-tool presence and bootstrap.

use std::path::Path;

use tracing::{debug, info};

use crate::fetch;

use super::SteamError;

/// Tool entry script name inside the tool directory.
pub const TOOL_SCRIPT: &str = "steamcmd.sh";

/// Bundled 32-bit library directory used for the tool's library path.
pub const TOOL_LIB_DIR: &str = "linux32";

/// Ensure the content tool is installed and executable at `tool_dir`.
///
/// With `force` the directory is removed and reinstalled unconditionally.
/// Returns `true` when a fresh install was performed.
pub async fn ensure_tool(tool_dir: &Path, url: &str, force: bool) -> Result<bool, SteamError> {
    let script = tool_dir.join(TOOL_SCRIPT);

    if force {
        info!(dir = %tool_dir.display(), "force reinstalling content tool");
        remove_dir_if_present(tool_dir)?;
    } else if is_executable(&script) {
        debug!(script = %script.display(), "content tool present");
        return Ok(false);
    } else if tool_dir.exists() {
        // Partial or broken install: start over.
        info!(dir = %tool_dir.display(), "removing broken content tool install");
        remove_dir_if_present(tool_dir)?;
    }

    std::fs::create_dir_all(tool_dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tool_dir, std::fs::Permissions::from_mode(0o755))?;
    }

    let tarball = fetch::fetch(url).await?;
    fetch::untar_gz(&tarball, tool_dir)?;

    if !is_executable(&script) {
        return Err(SteamError::Bootstrap(format!(
            "tool tarball did not produce an executable {}",
            script.display()
        )));
    }
    info!(dir = %tool_dir.display(), "content tool installed");
    Ok(true)
}

fn remove_dir_if_present(dir: &Path) -> Result<(), SteamError> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SteamError::Io(e)),
    }
}

/// Whether `path` exists and has any execute bit set.
pub fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(path) {
            Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
            Err(_) => false,
        }
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

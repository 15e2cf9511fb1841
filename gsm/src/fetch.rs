//! HTTPS fetch and tarball extraction for tool bootstrapping.
//!
//! Extraction is defensive: path traversal, absolute paths and links are
//! rejected outright, and file modes from the archive are preserved so
//! executables stay executable.

use std::path::{Component, Path};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

/// Errors raised while fetching or unpacking a tool tarball.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed for {url}: {message}")]
    Http { url: String, message: String },

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("bad archive: {0}")]
    Archive(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Download `url` fully into memory.
///
/// Tool tarballs are small (single-digit megabytes); buffering keeps the
/// extraction step simple and restartable.
pub async fn fetch(url: &str) -> Result<Vec<u8>, FetchError> {
    info!(url, "fetching");
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()
        .map_err(|e| FetchError::Http {
            url: url.to_string(),
            message: e.to_string(),
        })?;

    let response = client.get(url).send().await.map_err(|e| FetchError::Http {
        url: url.to_string(),
        message: e.to_string(),
    })?;

    if !response.status().is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }

    let bytes = response.bytes().await.map_err(|e| FetchError::Http {
        url: url.to_string(),
        message: e.to_string(),
    })?;
    debug!(url, bytes = bytes.len(), "fetched");
    Ok(bytes.to_vec())
}

/// Extract a gzipped tarball into `dest_dir`, rejecting:
/// - paths containing `..` (directory traversal)
/// - absolute paths
/// - symlinks and hardlinks
///
/// Regular-file modes from the archive are applied to the extracted files.
pub fn untar_gz(tarball: &[u8], dest_dir: &Path) -> Result<(), FetchError> {
    let decoder = flate2::read::GzDecoder::new(tarball);
    let mut archive = tar::Archive::new(decoder);

    let entries = archive
        .entries()
        .map_err(|e| FetchError::Archive(format!("failed to read tar entries: {e}")))?;

    for entry_result in entries {
        let mut entry =
            entry_result.map_err(|e| FetchError::Archive(format!("bad tar entry: {e}")))?;
        let entry_path = entry
            .path()
            .map_err(|e| FetchError::Archive(format!("bad tar entry path: {e}")))?
            .to_path_buf();

        if entry_path.is_absolute() {
            return Err(FetchError::Archive(format!(
                "tar contains absolute path: {}",
                entry_path.display()
            )));
        }
        if entry_path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(FetchError::Archive(format!(
                "tar contains path traversal: {}",
                entry_path.display()
            )));
        }

        let entry_type = entry.header().entry_type();
        if entry_type == tar::EntryType::Symlink || entry_type == tar::EntryType::Link {
            return Err(FetchError::Archive(format!(
                "tar contains symlink/hardlink: {}",
                entry_path.display()
            )));
        }

        let full_path = dest_dir.join(&entry_path);
        if entry_type == tar::EntryType::Directory {
            std::fs::create_dir_all(&full_path)?;
        } else if entry_type == tar::EntryType::Regular || entry_type == tar::EntryType::GNUSparse {
            if let Some(parent) = full_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::File::create(&full_path)?;
            std::io::copy(&mut entry, &mut file)?;

            #[cfg(unix)]
            if let Ok(mode) = entry.header().mode() {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&full_path, std::fs::Permissions::from_mode(mode))?;
            }
        }
        // Other entry types (devices, fifos) are skipped.
    }

    Ok(())
}

/// Read the whole of a gzipped byte stream (test helper for archives).
#[cfg(test)]
fn gunzip(bytes: &[u8]) -> Vec<u8> {
    use std::io::Read;

    let mut out = Vec::new();
    flate2::read::GzDecoder::new(bytes)
        .read_to_end(&mut out)
        .expect("gunzip");
    out
}

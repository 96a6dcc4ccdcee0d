use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use errors::Result;
use errors::error::DownloadError;
use log::{debug, warn};
use reqwest::Client;

/// Downloads the sample behind `uri` into a freshly created file under
/// the scratch directory and returns the file's basename, which from
/// here on identifies the sample across the pipeline.
pub(crate) async fn fetch_sample(client: &Client, uri: &str, scratch_dir: &Path) -> Result<String> {
    let resp = client
        .get(uri)
        .send()
        .await
        .map_err(|e| DownloadError::DownloadFailed(Box::new(e)))?;

    let status = resp.status();
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| DownloadError::DownloadFailed(Box::new(e)))?;

    if status.as_u16() != 200 {
        return Err(DownloadError::InvalidStatus(status.as_u16()).into());
    }

    let mut file = tempfile::Builder::new()
        .prefix("totem-dynamic")
        .tempfile_in(scratch_dir)
        .map_err(|e| DownloadError::FileWriteError(Box::new(e)))?;

    file.write_all(&bytes)
        .map_err(|e| DownloadError::FileWriteError(Box::new(e)))?;
    file.as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o644))
        .map_err(|e| DownloadError::FileWriteError(Box::new(e)))?;

    // Keep the file; submit deletes it once the results are out.
    let (_file, path) = file
        .keep()
        .map_err(|e| DownloadError::FileWriteError(Box::new(e)))?;

    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.to_string())
        .ok_or_else(|| DownloadError::FileWriteError("temp file has no basename".into()))?;

    debug!("Staged {} bytes from {} as {}", bytes.len(), uri, name);
    Ok(name)
}

/// Removes a staged sample once its message reached a terminal state.
/// Non-downloadable samples never touched the disk, so there is
/// nothing to remove for them.
pub(crate) async fn discard(scratch_dir: &str, file_path: &str, downloaded: bool) {
    if !downloaded {
        return;
    }
    let path = Path::new(scratch_dir).join(file_path);
    if let Err(e) = tokio::fs::remove_file(&path).await {
        warn!("Could not delete file {}: {}", file_path, e);
    }
}

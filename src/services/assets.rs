//! Installable artifact resolution
//!
//! An artifact reference is either a local path or an http(s) URL. URLs are
//! downloaded once per run into a temporary directory owned by the
//! [`AssetManager`]; the directory is removed when the manager is cleaned up or
//! dropped, whichever comes first.

use crate::config::{DEFAULT_AIRGAP_TARBALL, DEFAULT_K3S_BINARY};
use crate::error::AssetError;
use crate::utils::format::format_bytes;
use crate::utils::progress::ProgressWriter;
use reqwest::Url;
use reqwest::blocking::Client;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Overall deadline for a single artifact download
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const BINARY_HINT: &str = "Please download k3s binary:
  wget https://github.com/k3s-io/k3s/releases/download/v1.28.5+k3s1/k3s
  chmod +x k3s
Or configure a URL in your init.yaml under assets.k3s-binary";

const AIRGAP_HINT: &str = "Please download k3s airgap images:
  wget https://github.com/k3s-io/k3s/releases/download/v1.28.5+k3s1/k3s-airgap-images-amd64.tar.gz
Or configure a URL in your init.yaml under assets.k3s-airgap-tarball";

fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// Remediation hint for the two well-known default artifacts
fn remediation_hint(source: &str) -> Option<&'static str> {
    let name = source.strip_prefix("./").unwrap_or(source);
    if name == DEFAULT_K3S_BINARY {
        Some(BINARY_HINT)
    } else if name == DEFAULT_AIRGAP_TARBALL {
        Some(AIRGAP_HINT)
    } else {
        None
    }
}

/// Last path segment of a URL, used as the downloaded file name
fn filename_from_url(source: &str) -> Option<String> {
    let url = Url::parse(source).ok()?;
    url.path_segments()?
        .last()
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
}

pub struct AssetManager {
    temp_dir: Mutex<Option<TempDir>>,
    assets_dir: PathBuf,
    client: Client,
    download_timeout: Duration,
    resolved: Mutex<HashMap<String, PathBuf>>,
    downloaded: Mutex<Vec<PathBuf>>,
}

impl AssetManager {
    /// Create the run's temp directory. Relative local references that are not
    /// found in the working directory are also looked up under `assets_dir`.
    pub fn new(assets_dir: impl Into<PathBuf>) -> Result<Self, AssetError> {
        let client = Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(AssetError::Client)?;
        Self::with_client(assets_dir, client, DOWNLOAD_TIMEOUT)
    }

    fn with_client(
        assets_dir: impl Into<PathBuf>,
        client: Client,
        download_timeout: Duration,
    ) -> Result<Self, AssetError> {
        let temp_dir = tempfile::Builder::new()
            .prefix("k3lift-assets-")
            .tempdir()
            .map_err(AssetError::TempDir)?;
        Ok(Self {
            temp_dir: Mutex::new(Some(temp_dir)),
            assets_dir: assets_dir.into(),
            client,
            download_timeout,
            resolved: Mutex::new(HashMap::new()),
            downloaded: Mutex::new(Vec::new()),
        })
    }

    /// Temp directory path, `None` after cleanup
    pub fn temp_dir(&self) -> Option<PathBuf> {
        lock(&self.temp_dir)
            .as_ref()
            .map(|dir| dir.path().to_path_buf())
    }

    pub fn downloaded_files(&self) -> Vec<PathBuf> {
        lock(&self.downloaded).clone()
    }

    /// Resolve an artifact reference to a local file.
    ///
    /// Existing local paths are returned as they are. URLs are downloaded into
    /// the temp directory; a reference already resolved in this run is reused.
    pub fn resolve_asset(&self, source: &str, description: &str) -> Result<PathBuf, AssetError> {
        // Held across the download so concurrent callers share one transfer
        let mut resolved = lock(&self.resolved);
        if let Some(path) = resolved.get(source) {
            return Ok(path.clone());
        }

        let path = if is_url(source) {
            tracing::info!(description, url = source, "downloading asset");
            let path = self.download(source, description)?;
            tracing::info!(path = %path.display(), "download complete");
            lock(&self.downloaded).push(path.clone());
            path
        } else {
            self.resolve_local(source, description)?
        };

        resolved.insert(source.to_string(), path.clone());
        Ok(path)
    }

    fn resolve_local(&self, source: &str, description: &str) -> Result<PathBuf, AssetError> {
        let path = Path::new(source);
        match fs::metadata(path) {
            Ok(_) => return Ok(path.to_path_buf()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(AssetError::Access {
                    description: description.to_string(),
                    source,
                });
            }
        }

        if path.is_relative() {
            let candidate = self.assets_dir.join(path);
            if candidate.is_file() {
                tracing::debug!(path = %candidate.display(), "found {} in assets directory", description);
                return Ok(candidate);
            }
        }

        Err(AssetError::NotFound {
            description: description.to_string(),
            source_ref: source.to_string(),
            hint: remediation_hint(source),
        })
    }

    fn download(&self, source: &str, description: &str) -> Result<PathBuf, AssetError> {
        let filename =
            filename_from_url(source).ok_or_else(|| AssetError::NoFilename(source.to_string()))?;
        let dir = self.temp_dir().ok_or_else(|| {
            AssetError::TempDir(io::Error::new(
                io::ErrorKind::NotFound,
                "asset manager already cleaned up",
            ))
        })?;
        let local_path = dir.join(&filename);

        let download_err = |source_err: reqwest::Error| AssetError::Download {
            description: description.to_string(),
            url: source.to_string(),
            source: source_err,
        };

        // The client timeout only bounds each read; this bounds the whole transfer
        let deadline = Instant::now() + self.download_timeout;
        let mut response = self.client.get(source).send().map_err(download_err)?;
        if !response.status().is_success() {
            return Err(AssetError::Status {
                url: source.to_string(),
                status: response.status(),
            });
        }

        let mut file = File::create(&local_path).map_err(|source| AssetError::Write {
            path: local_path.clone(),
            source,
        })?;

        let copied = match response.content_length() {
            Some(total) if total > 0 => {
                tracing::info!(file = %filename, size = %format_bytes(total), "downloading");
                let mut writer = ProgressWriter::new(&mut file, format!("downloading {}", filename), total);
                self.copy_body(source, &local_path, &mut response, &mut writer, deadline)
            }
            _ => self.copy_body(source, &local_path, &mut response, &mut file, deadline),
        };

        if let Err(e) = copied {
            drop(file);
            if let Err(remove_err) = fs::remove_file(&local_path) {
                tracing::debug!(path = %local_path.display(), error = %remove_err, "failed to remove partial download");
            }
            return Err(e);
        }
        Ok(local_path)
    }

    /// Copy the response body, failing once `deadline` has passed
    fn copy_body(
        &self,
        url: &str,
        local_path: &Path,
        body: &mut impl Read,
        out: &mut impl Write,
        deadline: Instant,
    ) -> Result<u64, AssetError> {
        let mut buf = vec![0u8; 64 * 1024];
        let mut copied = 0u64;
        loop {
            let n = match body.read(&mut buf) {
                Ok(0) => return Ok(copied),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(AssetError::Read {
                        url: url.to_string(),
                        source,
                    });
                }
            };
            if Instant::now() > deadline {
                return Err(AssetError::Timeout {
                    url: url.to_string(),
                    limit: self.download_timeout,
                });
            }
            out.write_all(&buf[..n]).map_err(|source| AssetError::Write {
                path: local_path.to_path_buf(),
                source,
            })?;
            copied += n as u64;
        }
    }

    /// Remove the temp directory and everything downloaded into it. Idempotent.
    pub fn cleanup(&self) -> io::Result<()> {
        let Some(dir) = lock(&self.temp_dir).take() else {
            return Ok(());
        };
        tracing::debug!(temp_dir = %dir.path().display(), "cleaning up downloaded assets");
        lock(&self.resolved).retain(|_, path| !path.starts_with(dir.path()));
        match dir.close() {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

impl Drop for AssetManager {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::warn!(error = %e, "cleanup failed");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::Stream;
use std::fmt;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc::UnboundedSender;

pub mod box_com;
pub mod dropbox;
pub mod googledrive;
pub mod httpupload;
pub mod nextcloud;
pub mod opendrive;
pub mod seafile;

use crate::config::ProviderEntry;
use crate::error::ConfigError;

/// The closed set of supported backend kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    HttpUpload,
    Nextcloud,
    Dropbox,
    GoogleDrive,
    Box,
    OpenDrive,
    Seafile,
}

impl ProviderKind {
    /// Canonical order for setup menus.
    pub const ALL: [ProviderKind; 7] = [
        ProviderKind::HttpUpload,
        ProviderKind::Nextcloud,
        ProviderKind::Dropbox,
        ProviderKind::GoogleDrive,
        ProviderKind::Box,
        ProviderKind::OpenDrive,
        ProviderKind::Seafile,
    ];

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "httpupload" => Some(ProviderKind::HttpUpload),
            "nextcloud" => Some(ProviderKind::Nextcloud),
            "dropbox" => Some(ProviderKind::Dropbox),
            "googledrive" => Some(ProviderKind::GoogleDrive),
            "box" => Some(ProviderKind::Box),
            "opendrive" => Some(ProviderKind::OpenDrive),
            "seafile" => Some(ProviderKind::Seafile),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::HttpUpload => "httpupload",
            ProviderKind::Nextcloud => "nextcloud",
            ProviderKind::Dropbox => "dropbox",
            ProviderKind::GoogleDrive => "googledrive",
            ProviderKind::Box => "box",
            ProviderKind::OpenDrive => "opendrive",
            ProviderKind::Seafile => "seafile",
        }
    }

    /// Settings key the serialized OAuth token lives under, for the kinds
    /// that carry one.
    pub fn token_setting_key(&self) -> Option<&'static str> {
        match self {
            ProviderKind::Dropbox | ProviderKind::Box => Some("token"),
            ProviderKind::GoogleDrive => Some("googletoken"),
            _ => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A replacement credential an adapter obtained by refreshing an expired
/// access token mid-operation. The upload driver persists it into the
/// provider entry's settings under `key`.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub key: &'static str,
    pub value: String,
}

/// A storage backend adapter.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Fully consumes `src` and transmits it, returning an identifier only
    /// `get_link` on the same adapter understands.
    async fn upload(&self, src: UploadSource, filename: &str, size: u64) -> Result<String>;

    /// Produces a publicly dereferenceable URL for an identifier returned
    /// by `upload`, performing any "make public" step the backend needs.
    async fn get_link(&self, file_id: &str) -> Result<String>;

    /// A token refreshed during a previous operation, if this adapter
    /// manages OAuth credentials. The caller persists it.
    fn refreshed_token(&self) -> Option<RefreshedToken> {
        None
    }
}

/// Instantiates the adapter for a stored provider entry, injecting the
/// settings keys its type needs. An unrecognized type tag is a
/// configuration error.
pub fn create(entry: &ProviderEntry) -> Result<Box<dyn Provider>> {
    let kind = ProviderKind::from_str(&entry.kind)
        .ok_or_else(|| ConfigError::UnknownProviderType(entry.kind.clone()))?;

    let settings = &entry.settings;
    let get = |key: &str| settings.get(key).cloned().unwrap_or_default();

    Ok(match kind {
        ProviderKind::HttpUpload => Box::new(httpupload::HttpUploadProvider::new(
            &get("url"),
            &get("headers"),
        )),
        ProviderKind::Nextcloud => Box::new(nextcloud::NextcloudProvider::new(nextcloud::Settings {
            url: get("url"),
            username: get("username"),
            password: get("password"),
            link_share_with_password: get("linkShareWithPassword") == "true",
            random_password_chars: settings
                .get("randomPasswordChars")
                .and_then(|v| v.parse().ok())
                .unwrap_or(32),
        })?),
        ProviderKind::Dropbox => Box::new(dropbox::DropboxProvider::new(&get("token"))?),
        ProviderKind::GoogleDrive => {
            Box::new(googledrive::GoogleDriveProvider::new(&get("googletoken"))?)
        }
        ProviderKind::Box => Box::new(box_com::BoxProvider::new(&get("token"))?),
        ProviderKind::OpenDrive => {
            Box::new(opendrive::OpenDriveProvider::new(&get("user"), &get("pass"))?)
        }
        ProviderKind::Seafile => Box::new(seafile::SeafileProvider::new(
            &get("url"),
            &get("token"),
            &get("repoid"),
        )?),
    })
}

/// A progress sample emitted as the source file is read.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub bytes_read: u64,
    pub total: u64,
}

impl Progress {
    /// Completed fraction, clamped to 1.0. Zero-byte files report 1.0.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        (self.bytes_read as f64 / self.total as f64).min(1.0)
    }
}

const READ_CHUNK: usize = 64 * 1024;

/// The opened source file plus a progress observer. Every read reports the
/// running byte count, so observed fractions are non-decreasing. Adapters
/// drain it as a streaming request body, in fixed-size windows, or fully
/// buffered, depending on what their backend's API requires.
pub struct UploadSource {
    file: File,
    total: u64,
    read: u64,
    progress: Option<UnboundedSender<Progress>>,
}

impl UploadSource {
    pub async fn open(
        path: &Path,
        progress: Option<UnboundedSender<Progress>>,
    ) -> Result<(Self, u64)> {
        let file = File::open(path)
            .await
            .with_context(|| format!("can't open file {}", path.display()))?;
        let total = file.metadata().await?.len();
        Ok((
            UploadSource {
                file,
                total,
                read: 0,
                progress,
            },
            total,
        ))
    }

    fn observe(&mut self, n: usize) {
        self.read += n as u64;
        if let Some(tx) = &self.progress {
            let _ = tx.send(Progress {
                bytes_read: self.read,
                total: self.total,
            });
        }
    }

    /// Reads up to `max` bytes; short only at end of file.
    pub async fn read_chunk(&mut self, max: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; max];
        let mut filled = 0;
        while filled < max {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
            self.observe(n);
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Buffers the remaining content in memory, for backends that may need
    /// to send the same bytes twice.
    pub async fn read_to_end(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.total as usize);
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = self.file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
            self.observe(n);
        }
        Ok(out)
    }

    /// The remaining content as a byte stream.
    pub fn into_stream(self) -> impl Stream<Item = std::io::Result<Vec<u8>>> + Send {
        futures::stream::unfold(self, |mut src| async move {
            let mut buf = vec![0u8; READ_CHUNK];
            match src.file.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    src.observe(n);
                    Some((Ok(buf), src))
                }
                Err(err) => Some((Err(err), src)),
            }
        })
    }

    pub fn into_body(self) -> reqwest::Body {
        reqwest::Body::wrap_stream(self.into_stream())
    }

    /// A multipart file part streaming the remaining content.
    pub fn into_part(self, filename: &str) -> reqwest::multipart::Part {
        let size = self.total - self.read;
        reqwest::multipart::Part::stream_with_length(self.into_body(), size)
            .file_name(filename.to_string())
    }
}

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::{Provider, RefreshedToken, UploadSource};
use crate::oauth::{self, TokenManager};

const CONTENT_URL: &str = "https://content.dropboxapi.com/2";
const API_URL: &str = "https://api.dropboxapi.com/2";

/// Files above this size go through an upload session in fixed windows.
const CHUNK_SIZE: u64 = 1 << 24;

/// Dropbox API client.
pub struct DropboxProvider {
    auth: TokenManager,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct UploadSessionStartResponse {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct SharedLink {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ListSharedLinksResponse {
    links: Vec<SharedLink>,
}

impl DropboxProvider {
    /// `token_setting` is either a JSON token blob (with refresh support)
    /// or a bare legacy access token.
    pub fn new(token_setting: &str) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            auth: TokenManager::from_setting(oauth::DROPBOX, "token", token_setting),
            client,
        })
    }

    /// Clears any stale copy so the overwrite commit can't collide.
    /// Failures (usually "not found") are ignored.
    async fn delete_existing(&self, token: &str, path: &str) {
        let result = self
            .client
            .post(format!("{API_URL}/files/delete_v2"))
            .bearer_auth(token)
            .json(&json!({ "path": path }))
            .send()
            .await;
        if let Ok(resp) = result {
            debug!("delete before upload: {}", resp.status());
        }
    }

    async fn upload_small(
        &self,
        token: &str,
        path: &str,
        client_modified: &str,
        src: UploadSource,
    ) -> Result<()> {
        let arg = json!({
            "path": path,
            "mode": "overwrite",
            "client_modified": client_modified,
        });
        let resp = self
            .client
            .post(format!("{CONTENT_URL}/files/upload"))
            .bearer_auth(token)
            .header("Dropbox-API-Arg", arg.to_string())
            .header("Content-Type", "application/octet-stream")
            .body(src.into_body())
            .send()
            .await?;

        if !resp.status().is_success() {
            let text = resp.text().await?;
            return Err(anyhow!("Dropbox upload error: {text}"));
        }
        Ok(())
    }

    async fn upload_chunked(
        &self,
        token: &str,
        path: &str,
        client_modified: &str,
        mut src: UploadSource,
        size: u64,
    ) -> Result<()> {
        let first = src.read_chunk(CHUNK_SIZE as usize).await?;
        let resp = self
            .client
            .post(format!("{CONTENT_URL}/files/upload_session/start"))
            .bearer_auth(token)
            .header("Dropbox-API-Arg", "{}")
            .header("Content-Type", "application/octet-stream")
            .body(first)
            .send()
            .await?;
        if !resp.status().is_success() {
            let text = resp.text().await?;
            return Err(anyhow!("Dropbox upload session start error: {text}"));
        }
        let session: UploadSessionStartResponse = resp.json().await?;
        debug!("upload session {} started for {path}", session.session_id);

        let mut written = CHUNK_SIZE;
        while size - written > CHUNK_SIZE {
            let chunk = src.read_chunk(CHUNK_SIZE as usize).await?;
            let arg = json!({
                "cursor": { "session_id": session.session_id, "offset": written },
            });
            let resp = self
                .client
                .post(format!("{CONTENT_URL}/files/upload_session/append_v2"))
                .bearer_auth(token)
                .header("Dropbox-API-Arg", arg.to_string())
                .header("Content-Type", "application/octet-stream")
                .body(chunk)
                .send()
                .await?;
            if !resp.status().is_success() {
                let text = resp.text().await?;
                return Err(anyhow!("Dropbox upload session append error: {text}"));
            }
            written += CHUNK_SIZE;
        }

        let arg = json!({
            "cursor": { "session_id": session.session_id, "offset": written },
            "commit": {
                "path": path,
                "mode": "overwrite",
                "client_modified": client_modified,
            },
        });
        let resp = self
            .client
            .post(format!("{CONTENT_URL}/files/upload_session/finish"))
            .bearer_auth(token)
            .header("Dropbox-API-Arg", arg.to_string())
            .header("Content-Type", "application/octet-stream")
            .body(src.into_body())
            .send()
            .await?;
        if !resp.status().is_success() {
            let text = resp.text().await?;
            return Err(anyhow!("Dropbox upload session finish error: {text}"));
        }
        Ok(())
    }

    /// An existing share for this path is reused instead of erroring.
    async fn existing_link(&self, token: &str, path: &str) -> Result<String> {
        let resp = self
            .client
            .post(format!("{API_URL}/sharing/list_shared_links"))
            .bearer_auth(token)
            .json(&json!({ "path": path, "direct_only": true }))
            .send()
            .await?;
        if !resp.status().is_success() {
            let text = resp.text().await?;
            return Err(anyhow!("Dropbox list shared links error: {text}"));
        }
        let listing: ListSharedLinksResponse = resp.json().await?;
        listing
            .links
            .into_iter()
            .next()
            .map(|l| l.url)
            .context("Dropbox reported an existing shared link but returned none")
    }
}

#[async_trait]
impl Provider for DropboxProvider {
    async fn upload(&self, src: UploadSource, filename: &str, size: u64) -> Result<String> {
        let path = format!("/{filename}");
        let token = self.auth.bearer().await?;

        self.delete_existing(&token, &path).await;

        // Dropbox only accepts timestamps in UTC with second precision.
        let client_modified = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();

        if size > CHUNK_SIZE {
            self.upload_chunked(&token, &path, &client_modified, src, size)
                .await?;
        } else {
            self.upload_small(&token, &path, &client_modified, src)
                .await?;
        }
        Ok(path)
    }

    async fn get_link(&self, file_id: &str) -> Result<String> {
        let token = self.auth.bearer().await?;

        let resp = self
            .client
            .post(format!("{API_URL}/sharing/create_shared_link_with_settings"))
            .bearer_auth(&token)
            .json(&json!({ "path": file_id }))
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if status.is_success() {
            let link: SharedLink = serde_json::from_str(&body)
                .with_context(|| format!("unexpected Dropbox share response: {body}"))?;
            return Ok(fix_download_link(&link.url));
        }
        if body.contains("shared_link_already_exists") {
            let url = self.existing_link(&token, file_id).await?;
            return Ok(fix_download_link(&url));
        }
        Err(anyhow!("Dropbox share error: {body}"))
    }

    fn refreshed_token(&self) -> Option<RefreshedToken> {
        self.auth.refreshed_token()
    }
}

/// Dropbox hands out preview links ending in `dl=0`; flip them to `dl=1`
/// for a direct download without the signup interstitial.
fn fix_download_link(link: &str) -> String {
    match link.strip_suffix("dl=0") {
        Some(base) => format!("{base}dl=1"),
        None => link.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fix_download_link() {
        assert_eq!(
            fix_download_link("https://www.dropbox.com/s/abc/f.pdf?dl=0"),
            "https://www.dropbox.com/s/abc/f.pdf?dl=1"
        );
        assert_eq!(
            fix_download_link("https://www.dropbox.com/s/abc/f.pdf?dl=1"),
            "https://www.dropbox.com/s/abc/f.pdf?dl=1"
        );
        assert_eq!(fix_download_link("https://example.com/x"), "https://example.com/x");
    }
}

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use log::debug;
use reqwest::{Client, StatusCode, multipart};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::{Provider, RefreshedToken, UploadSource};
use crate::oauth::{self, TokenManager};

const API_URL: &str = "https://api.box.com/2.0";
const UPLOAD_URL: &str = "https://upload.box.com/api/2.0";

const FOLDER_NAME: &str = "sharecmd";

/// Box API client.
pub struct BoxProvider {
    auth: TokenManager,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct EntriesResponse {
    entries: Vec<Entry>,
}

#[derive(Debug, Deserialize)]
struct Entry {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct ConflictResponse {
    context_info: ConflictContext,
}

#[derive(Debug, Deserialize)]
struct ConflictContext {
    conflicts: Entry,
}

#[derive(Debug, Deserialize)]
struct SharedLinkResponse {
    shared_link: SharedLink,
}

#[derive(Debug, Deserialize)]
struct SharedLink {
    url: String,
}

impl BoxProvider {
    pub fn new(token_setting: &str) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            auth: TokenManager::from_setting(oauth::BOX, "token", token_setting),
            client,
        })
    }

    /// ID of the upload folder under root, created on first use.
    async fn get_or_create_folder(&self, token: &str) -> Result<String> {
        let resp = self
            .client
            .get(format!(
                "{API_URL}/folders/0/items?fields=id,name,type&limit=1000"
            ))
            .bearer_auth(token)
            .send()
            .await?;
        if !resp.status().is_success() {
            let text = resp.text().await?;
            return Err(anyhow!("Box folder listing error: {text}"));
        }
        let listing: EntriesResponse = resp.json().await?;
        for entry in listing.entries {
            if entry.kind == "folder" && entry.name == FOLDER_NAME {
                return Ok(entry.id);
            }
        }

        let resp = self
            .client
            .post(format!("{API_URL}/folders"))
            .bearer_auth(token)
            .json(&json!({ "name": FOLDER_NAME, "parent": { "id": "0" } }))
            .send()
            .await?;
        if !resp.status().is_success() {
            let text = resp.text().await?;
            return Err(anyhow!("Box create folder error: {text}"));
        }
        let folder: Entry = resp.json().await?;
        Ok(folder.id)
    }

    fn upload_form(filename: &str, attributes: String, content: Vec<u8>) -> multipart::Form {
        multipart::Form::new()
            .text("attributes", attributes)
            .part(
                "file",
                multipart::Part::bytes(content).file_name(filename.to_string()),
            )
    }

    /// Replaces an existing file's content after an upload conflict.
    async fn upload_new_version(
        &self,
        token: &str,
        file_id: &str,
        filename: &str,
        content: Vec<u8>,
    ) -> Result<String> {
        let attributes = json!({ "name": filename }).to_string();
        let resp = self
            .client
            .post(format!("{UPLOAD_URL}/files/{file_id}/content"))
            .bearer_auth(token)
            .multipart(Self::upload_form(filename, attributes, content))
            .send()
            .await?;
        if resp.status() != StatusCode::CREATED {
            let text = resp.text().await?;
            return Err(anyhow!("Box upload new version error: {text}"));
        }
        let result: EntriesResponse = resp.json().await?;
        result
            .entries
            .into_iter()
            .next()
            .map(|e| e.id)
            .context("Box upload response contained no file entries")
    }
}

#[async_trait]
impl Provider for BoxProvider {
    async fn upload(&self, src: UploadSource, filename: &str, _size: u64) -> Result<String> {
        let token = self.auth.bearer().await?;
        let folder_id = self.get_or_create_folder(&token).await?;

        // Buffered so the same bytes can go out again as a new version if
        // the name already exists.
        let content = src.read_to_end().await?;

        let attributes = json!({ "name": filename, "parent": { "id": folder_id } }).to_string();
        let resp = self
            .client
            .post(format!("{UPLOAD_URL}/files/content"))
            .bearer_auth(&token)
            .multipart(Self::upload_form(filename, attributes, content.clone()))
            .send()
            .await?;

        if resp.status() == StatusCode::CONFLICT {
            let body = resp.text().await?;
            let conflict: ConflictResponse = serde_json::from_str(&body).map_err(|_| {
                anyhow!("Box upload conflict but could not parse existing file ID: {body}")
            })?;
            debug!("file exists on Box, uploading a new version");
            return self
                .upload_new_version(&token, &conflict.context_info.conflicts.id, filename, content)
                .await;
        }

        if resp.status() != StatusCode::CREATED {
            let text = resp.text().await?;
            return Err(anyhow!("Box upload error: {text}"));
        }
        let result: EntriesResponse = resp.json().await?;
        result
            .entries
            .into_iter()
            .next()
            .map(|e| e.id)
            .context("Box upload response contained no file entries")
    }

    async fn get_link(&self, file_id: &str) -> Result<String> {
        let token = self.auth.bearer().await?;

        let resp = self
            .client
            .put(format!("{API_URL}/files/{file_id}?fields=shared_link"))
            .bearer_auth(&token)
            .json(&json!({ "shared_link": { "access": "open" } }))
            .send()
            .await?;
        if !resp.status().is_success() {
            let text = resp.text().await?;
            return Err(anyhow!("Box shared link error: {text}"));
        }
        let result: SharedLinkResponse = resp.json().await?;
        Ok(result.shared_link.url)
    }

    fn refreshed_token(&self) -> Option<RefreshedToken> {
        self.auth.refreshed_token()
    }
}

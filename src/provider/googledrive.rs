use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use log::{debug, info};
use reqwest::{Client, header};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::{Provider, RefreshedToken, UploadSource};
use crate::oauth::{self, TokenManager};

const API_URL: &str = "https://www.googleapis.com/drive/v3";
const UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3";

const FOLDER_NAME: &str = "sharecmd";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

/// Google Drive API client.
pub struct GoogleDriveProvider {
    auth: TokenManager,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct FileListResponse {
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
}

fn mime_for_extension(filename: &str) -> Option<&'static str> {
    let ext = std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())?;
    let mime = match ext.to_lowercase().as_str() {
        "epub" => "application/epub+zip",
        "json" => "application/json",
        "doc" => "application/msword",
        "pdf" => "application/pdf",
        "rtf" => "application/rtf",
        "xls" => "application/vnd.ms-excel",
        "odp" => "application/vnd.oasis.opendocument.presentation",
        "ods" => "application/vnd.oasis.opendocument.spreadsheet",
        "odt" => "application/vnd.oasis.opendocument.text",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "wmf" => "application/x-msmetafile",
        "zip" => "application/zip",
        "bmp" => "image/bmp",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "svg" => "image/svg+xml",
        "csv" => "text/csv",
        "html" => "text/html",
        "txt" => "text/plain",
        "tsv" => "text/tab-separated-values",
        _ => return None,
    };
    Some(mime)
}

impl GoogleDriveProvider {
    pub fn new(token_setting: &str) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            auth: TokenManager::from_setting(oauth::GOOGLE_DRIVE, "googletoken", token_setting),
            client,
        })
    }

    /// ID of the upload folder, created on first use.
    async fn get_or_create_folder(&self, token: &str) -> Result<String> {
        let query = format!(
            "name='{FOLDER_NAME}' and mimeType='{FOLDER_MIME}' and trashed=false"
        );
        let url = format!(
            "{API_URL}/files?q={}&fields=files(id)",
            urlencoding::encode(&query)
        );

        let resp = self.client.get(&url).bearer_auth(token).send().await?;
        if !resp.status().is_success() {
            let text = resp.text().await?;
            return Err(anyhow!("Google Drive API error: {text}"));
        }
        let listing: FileListResponse = resp.json().await?;
        if let Some(folder) = listing.files.into_iter().next() {
            return Ok(folder.id);
        }

        info!("folder {FOLDER_NAME:?} not found on Drive, creating it");
        let resp = self
            .client
            .post(format!("{API_URL}/files"))
            .bearer_auth(token)
            .json(&json!({
                "name": FOLDER_NAME,
                "mimeType": FOLDER_MIME,
                "description": "Auto Create by sharecmd",
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            let text = resp.text().await?;
            return Err(anyhow!("Google Drive create folder error: {text}"));
        }
        let folder: DriveFile = resp.json().await?;
        Ok(folder.id)
    }
}

#[async_trait]
impl Provider for GoogleDriveProvider {
    async fn upload(&self, src: UploadSource, filename: &str, size: u64) -> Result<String> {
        let token = self.auth.bearer().await?;
        let parent_id = self.get_or_create_folder(&token).await?;

        let mut metadata = json!({
            "name": filename,
            "parents": [parent_id],
        });
        if let Some(mime) = mime_for_extension(filename) {
            metadata["mimeType"] = json!(mime);
        }

        // Resumable upload: announce the metadata, then stream the bytes to
        // the session URL Google hands back.
        let resp = self
            .client
            .post(format!("{UPLOAD_URL}/files?uploadType=resumable"))
            .bearer_auth(&token)
            .json(&metadata)
            .send()
            .await?;
        if !resp.status().is_success() {
            let text = resp.text().await?;
            return Err(anyhow!("Google Drive upload error: {text}"));
        }
        let session_url = resp
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .context("Google Drive returned no resumable session URL")?
            .to_string();
        debug!("resumable upload session opened for {filename}");

        let resp = self
            .client
            .put(&session_url)
            .header(header::CONTENT_LENGTH, size)
            .body(src.into_body())
            .send()
            .await?;
        if !resp.status().is_success() {
            let text = resp.text().await?;
            return Err(anyhow!("Google Drive upload error: {text}"));
        }
        let file: DriveFile = resp.json().await?;
        Ok(file.id)
    }

    async fn get_link(&self, file_id: &str) -> Result<String> {
        let token = self.auth.bearer().await?;

        let resp = self
            .client
            .post(format!("{API_URL}/files/{file_id}/permissions"))
            .bearer_auth(&token)
            .json(&json!({ "type": "anyone", "role": "reader" }))
            .send()
            .await?;
        if !resp.status().is_success() {
            let text = resp.text().await?;
            return Err(anyhow!("Google Drive permission error: {text}"));
        }

        Ok(format!(
            "https://drive.google.com/file/d/{file_id}/view?usp=sharing"
        ))
    }

    fn refreshed_token(&self) -> Option<RefreshedToken> {
        self.auth.refreshed_token()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_for_extension() {
        assert_eq!(mime_for_extension("report.pdf"), Some("application/pdf"));
        assert_eq!(mime_for_extension("photo.JPG"), Some("image/jpeg"));
        assert_eq!(mime_for_extension("archive.tar.gz"), None);
        assert_eq!(mime_for_extension("noextension"), None);
    }
}

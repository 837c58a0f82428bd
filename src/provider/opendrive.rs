use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use log::debug;
use reqwest::{Client, StatusCode, multipart};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::{Provider, UploadSource};

const API_URL: &str = "https://dev.opendrive.com/api/v1";

const FOLDER_NAME: &str = "sharecmd";

/// OpenDrive REST client. Every call carries a session id obtained by
/// logging in with the stored username and password.
pub struct OpenDriveProvider {
    username: String,
    password: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(rename = "SessionID")]
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct FolderResponse {
    #[serde(rename = "FolderID", alias = "FolderId")]
    folder_id: String,
}

#[derive(Debug, Deserialize)]
struct CreateFileResponse {
    #[serde(rename = "FileId")]
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct OpenUploadResponse {
    #[serde(rename = "TempLocation")]
    temp_location: String,
}

#[derive(Debug, Deserialize)]
struct CloseUploadResponse {
    #[serde(rename = "DownloadLink", default)]
    download_link: String,
}

impl OpenDriveProvider {
    pub fn new(username: &str, password: &str) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            username: username.to_string(),
            password: password.to_string(),
            client,
        })
    }

    async fn login(&self) -> Result<String> {
        let resp = self
            .client
            .post(format!("{API_URL}/session/login.json"))
            .json(&json!({ "username": self.username, "passwd": self.password }))
            .send()
            .await?;
        let body = resp.text().await?;
        let login: LoginResponse = serde_json::from_str(&body)
            .map_err(|_| anyhow!("expecting session id from opendrive, got: {body}"))?;
        Ok(login.session_id)
    }

    async fn folder_id_by_path(&self, session_id: &str) -> Result<String> {
        let resp = self
            .client
            .post(format!("{API_URL}/folder/idbypath.json"))
            .json(&json!({ "session_id": session_id, "path": FOLDER_NAME }))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            bail!("folder not found");
        }
        let body = resp.text().await?;
        let folder: FolderResponse = serde_json::from_str(&body)
            .map_err(|_| anyhow!("expecting folder id from opendrive, got: {body}"))?;
        Ok(folder.folder_id)
    }

    async fn create_folder(&self, session_id: &str) -> Result<String> {
        let resp = self
            .client
            .post(format!("{API_URL}/folder.json"))
            .json(&json!({ "session_id": session_id, "folder_name": FOLDER_NAME }))
            .send()
            .await?;
        let body = resp.text().await?;
        let folder: FolderResponse = serde_json::from_str(&body)
            .map_err(|_| anyhow!("expecting folder id from opendrive, got: {body}"))?;
        Ok(folder.folder_id)
    }

    async fn get_or_create_folder(&self, session_id: &str) -> Result<String> {
        match self.folder_id_by_path(session_id).await {
            Ok(id) => Ok(id),
            Err(_) => self.create_folder(session_id).await,
        }
    }

    async fn create_file(
        &self,
        session_id: &str,
        folder_id: &str,
        filename: &str,
    ) -> Result<String> {
        let resp = self
            .client
            .post(format!("{API_URL}/upload/create_file.json"))
            .json(&json!({
                "session_id": session_id,
                "folder_id": folder_id,
                "file_name": filename,
                "open_if_exists": 1,
            }))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            bail!("folder not found");
        }
        let body = resp.text().await?;
        let file: CreateFileResponse = serde_json::from_str(&body)
            .map_err(|_| anyhow!("expecting file id from opendrive, got: {body}"))?;
        Ok(file.file_id)
    }

    async fn upload_file(
        &self,
        session_id: &str,
        file_id: &str,
        filename: &str,
        src: UploadSource,
        size: u64,
    ) -> Result<String> {
        let resp = self
            .client
            .post(format!("{API_URL}/upload/open_file_upload.json"))
            .json(&json!({
                "session_id": session_id,
                "file_id": file_id,
                "file_size": size,
            }))
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if status == StatusCode::FORBIDDEN {
            bail!("{body}");
        }
        let opened: OpenUploadResponse = serde_json::from_str(&body)
            .map_err(|_| anyhow!("expecting temp location from opendrive, got: {body}"))?;
        debug!("upload opened at temp location {}", opened.temp_location);

        let form = multipart::Form::new()
            .text("session_id", session_id.to_string())
            .text("file_id", file_id.to_string())
            .text("temp_location", opened.temp_location.clone())
            .text("chunk_offset", "0".to_string())
            .text("chunk_size", size.to_string())
            .part("file_data", src.into_part(filename));
        let resp = self
            .client
            .post(format!("{API_URL}/upload/upload_file_chunk.json"))
            .multipart(form)
            .send()
            .await?;
        if !resp.status().is_success() {
            let text = resp.text().await?;
            return Err(anyhow!("OpenDrive chunk upload error: {text}"));
        }

        let resp = self
            .client
            .post(format!("{API_URL}/upload/close_file_upload.json"))
            .json(&json!({
                "session_id": session_id,
                "file_id": file_id,
                "file_size": size,
                "temp_location": opened.temp_location,
            }))
            .send()
            .await?;
        let body = resp.text().await?;
        let closed: CloseUploadResponse = serde_json::from_str(&body)
            .map_err(|_| anyhow!("expecting download link from opendrive, got: {body}"))?;
        if closed.download_link.is_empty() {
            bail!("no download link from opendrive, got: {body}");
        }
        Ok(closed.download_link)
    }
}

#[async_trait]
impl Provider for OpenDriveProvider {
    async fn upload(&self, src: UploadSource, filename: &str, size: u64) -> Result<String> {
        let session_id = self.login().await?;
        let folder_id = self.get_or_create_folder(&session_id).await?;
        let file_id = self.create_file(&session_id, &folder_id, filename).await?;
        self.upload_file(&session_id, &file_id, filename, src, size)
            .await
    }

    /// Upload already yields the final download link; it passes through
    /// here unchanged.
    async fn get_link(&self, file_id: &str) -> Result<String> {
        if file_id.is_empty() {
            bail!("no download link recorded for this upload");
        }
        Ok(file_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folder_response_accepts_both_casings() {
        let a: FolderResponse = serde_json::from_str(r#"{"FolderID": "f1"}"#).unwrap();
        assert_eq!(a.folder_id, "f1");
        let b: FolderResponse = serde_json::from_str(r#"{"FolderId": "f2"}"#).unwrap();
        assert_eq!(b.folder_id, "f2");
    }

    #[tokio::test]
    async fn test_get_link_echoes_download_link() -> Result<()> {
        let p = OpenDriveProvider::new("u", "p")?;
        assert_eq!(
            p.get_link("https://od.example/dl/abc").await?,
            "https://od.example/dl/abc"
        );
        assert!(p.get_link("").await.is_err());
        Ok(())
    }
}

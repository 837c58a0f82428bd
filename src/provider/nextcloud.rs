use anyhow::{Result, anyhow};
use async_trait::async_trait;
use log::warn;
use rand::Rng;
use reqwest::{Client, Method};
use serde::Deserialize;
use std::time::Duration;

use super::{Provider, UploadSource};

const FOLDER_NAME: &str = "sharecmd";

/// Public link share (OCS shareType 3) with read-only permissions.
const SHARE_TYPE_PUBLIC_LINK: u8 = 3;
const PERMISSION_READ: u8 = 1;

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub url: String,
    pub username: String,
    pub password: String,
    pub link_share_with_password: bool,
    pub random_password_chars: usize,
}

/// Nextcloud client: WebDAV for the upload, the OCS sharing API for the
/// link.
pub struct NextcloudProvider {
    settings: Settings,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct OcsEnvelope {
    ocs: OcsBody,
}

/// `data` is an object on success but an empty array on some failures, so
/// it stays a raw value and the url is extracted leniently.
#[derive(Debug, Deserialize)]
struct OcsBody {
    meta: OcsMeta,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct OcsMeta {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: Option<String>,
}

impl OcsBody {
    fn share_url(&self) -> Option<&str> {
        self.data.get("url").and_then(|u| u.as_str()).filter(|u| !u.is_empty())
    }
}

impl NextcloudProvider {
    pub fn new(mut settings: Settings) -> Result<Self> {
        settings.url = settings.url.trim_end_matches('/').to_string();
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { settings, client })
    }

    /// MKCOL fails when the folder already exists, so a failure here only
    /// warns.
    async fn create_folder(&self) {
        let url = format!(
            "{}/remote.php/dav/files/{}/{}",
            self.settings.url, self.settings.username, FOLDER_NAME
        );
        let mkcol = match Method::from_bytes(b"MKCOL") {
            Ok(m) => m,
            Err(_) => return,
        };
        let result = self
            .client
            .request(mkcol, &url)
            .basic_auth(&self.settings.username, Some(&self.settings.password))
            .header("OCS-APIRequest", "true")
            .send()
            .await;
        if let Err(err) = result {
            warn!("could not create folder: {err}");
        }
    }

    async fn create_share(&self, filename: &str, password: &str) -> Result<String> {
        let url = format!(
            "{}/ocs/v1.php/apps/files_sharing/api/v1/shares?format=json",
            self.settings.url
        );
        let mut form = vec![
            ("path", format!("{FOLDER_NAME}/{filename}")),
            ("shareType", SHARE_TYPE_PUBLIC_LINK.to_string()),
            ("permissions", PERMISSION_READ.to_string()),
        ];
        if !password.is_empty() {
            form.push(("password", password.to_string()));
        }

        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.settings.username, Some(&self.settings.password))
            .header("OCS-APIRequest", "true")
            .form(&form)
            .send()
            .await?;
        let body = resp.text().await?;
        let reply: OcsEnvelope = serde_json::from_str(&body)
            .map_err(|_| anyhow!("unexpected Nextcloud share response: {body}"))?;

        match reply.ocs.share_url() {
            Some(url) => Ok(url.to_string()),
            None => Err(anyhow!(
                "Status: {}, Message: {}",
                reply.ocs.meta.status,
                reply.ocs.meta.message.unwrap_or_default()
            )),
        }
    }
}

#[async_trait]
impl Provider for NextcloudProvider {
    async fn upload(&self, src: UploadSource, filename: &str, size: u64) -> Result<String> {
        self.create_folder().await;

        let url = format!(
            "{}/remote.php/webdav/{FOLDER_NAME}/{filename}",
            self.settings.url
        );
        let resp = self
            .client
            .put(&url)
            .basic_auth(&self.settings.username, Some(&self.settings.password))
            .header("OCS-APIRequest", "true")
            .header(reqwest::header::CONTENT_LENGTH, size)
            .body(src.into_body())
            .send()
            .await?;
        if !resp.status().is_success() {
            let text = resp.text().await?;
            return Err(anyhow!("Nextcloud upload error: {text}"));
        }
        Ok(filename.to_string())
    }

    async fn get_link(&self, file_id: &str) -> Result<String> {
        if self.settings.link_share_with_password {
            let password = random_password(self.settings.random_password_chars);
            let link = self.create_share(file_id, &password).await?;
            println!("=======================================");
            println!("Password generated: {password}");
            println!("=======================================");
            Ok(link)
        } else {
            self.create_share(file_id, "").await
        }
    }
}

fn random_password(chars: usize) -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(chars.max(1))
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_share_response_parsing() {
        let body = r#"{"ocs":{"meta":{"status":"ok","statuscode":100,"message":"OK"},
            "data":{"id":42,"url":"https://nc.example/s/AbCdEf"}}}"#;
        let reply: OcsEnvelope = serde_json::from_str(body).unwrap();
        assert_eq!(reply.ocs.share_url(), Some("https://nc.example/s/AbCdEf"));
    }

    #[test]
    fn test_share_failure_keeps_meta_message() {
        let body = r#"{"ocs":{"meta":{"status":"failure","statuscode":404,"message":"file not found"},
            "data":[]}}"#;
        let reply: OcsEnvelope = serde_json::from_str(body).unwrap();
        assert!(reply.ocs.share_url().is_none());
        assert_eq!(reply.ocs.meta.status, "failure");
        assert_eq!(reply.ocs.meta.message.as_deref(), Some("file not found"));
    }

    #[test]
    fn test_random_password_length() {
        assert_eq!(random_password(32).len(), 32);
        assert_eq!(random_password(0).len(), 1);
        assert!(random_password(16).chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_new_trims_trailing_slash() -> Result<()> {
        let p = NextcloudProvider::new(Settings {
            url: "https://nc.example/".to_string(),
            ..Default::default()
        })?;
        assert_eq!(p.settings.url, "https://nc.example");
        Ok(())
    }
}

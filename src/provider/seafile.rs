use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use log::info;
use reqwest::{Client, header, multipart};
use serde::Deserialize;
use std::time::Duration;

use super::{Provider, UploadSource};

const LIBRARY_NAME: &str = "sharecmd";

/// Seafile REST client. Authentication uses an API token obtained once
/// during setup.
pub struct SeafileProvider {
    url: String,
    token: String,
    repo_id: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct AuthTokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct CreateRepoResponse {
    repo_id: String,
}

impl SeafileProvider {
    pub fn new(url: &str, token: &str, repo_id: &str) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            repo_id: repo_id.to_string(),
            client,
        })
    }

    fn auth_header(&self) -> String {
        format!("Token {}", self.token)
    }

    /// The upload endpoint is handed out per request as a bare JSON string.
    async fn fetch_upload_link(&self) -> Result<String> {
        let url = format!(
            "{}/api2/repos/{}/upload-link/?p=/&replace=1",
            self.url, self.repo_id
        );
        let resp = self
            .client
            .get(&url)
            .header(header::AUTHORIZATION, self.auth_header())
            .send()
            .await?;
        let body = resp.text().await?;
        let link = body.trim().trim_matches('"').to_string();
        if !link.starts_with("http") {
            bail!("expecting an upload link from seafile, got: {body}");
        }
        Ok(link)
    }
}

#[async_trait]
impl Provider for SeafileProvider {
    async fn upload(&self, src: UploadSource, filename: &str, _size: u64) -> Result<String> {
        let upload_link = self.fetch_upload_link().await?;

        let form = multipart::Form::new()
            .part("file", src.into_part(filename))
            .text("filename", filename.to_string())
            .text("parent_dir", "/".to_string());

        let resp = self
            .client
            .post(&upload_link)
            .header(header::AUTHORIZATION, self.auth_header())
            .multipart(form)
            .send()
            .await?;
        if !resp.status().is_success() {
            let text = resp.text().await?;
            return Err(anyhow!("Seafile upload error: {text}"));
        }
        Ok(filename.to_string())
    }

    async fn get_link(&self, file_id: &str) -> Result<String> {
        let url = format!(
            "{}/api2/repos/{}/file/shared-link/",
            self.url, self.repo_id
        );
        let resp = self
            .client
            .put(&url)
            .header(header::AUTHORIZATION, self.auth_header())
            .header(header::ACCEPT, "application/json; indent=4")
            .form(&[("p", format!("/{file_id}"))])
            .send()
            .await?;

        let location = resp
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        match location {
            Some(loc) if !loc.is_empty() => Ok(format!("{loc}?dl=1")),
            _ => Err(anyhow!("expecting location header from seafile")),
        }
    }
}

/// Login credentials used once during setup to obtain the API token.
#[derive(Debug, Clone, Default)]
pub struct LoginConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    pub otp: Option<String>,
}

/// Exchanges username/password (plus an OTP when two-factor is enabled)
/// for an API token.
pub async fn get_token(config: &LoginConfig) -> Result<String> {
    let url = format!("{}/api2/auth-token/", config.url.trim_end_matches('/'));
    let mut request = Client::new().post(&url).form(&[
        ("username", config.username.as_str()),
        ("password", config.password.as_str()),
    ]);
    if let Some(otp) = &config.otp {
        request = request.header("X-Seafile-Otp", otp);
    }

    let resp = request.send().await?;
    let body = resp.text().await?;
    let parsed: AuthTokenResponse = serde_json::from_str(&body)
        .map_err(|_| anyhow!("expecting token from seafile, got: {body}"))?;
    Ok(parsed.token)
}

/// Creates the upload library and returns its repo id.
pub async fn create_library(url: &str, token: &str) -> Result<String> {
    let endpoint = format!("{}/api2/repos/", url.trim_end_matches('/'));
    let resp = Client::new()
        .post(&endpoint)
        .header(header::AUTHORIZATION, format!("Token {token}"))
        .header(header::ACCEPT, "application/json; indent=4")
        .form(&[("name", LIBRARY_NAME), ("desc", "ShareCmd")])
        .send()
        .await?;
    if resp.status().is_success() {
        info!("library {LIBRARY_NAME} created");
    }

    let body = resp.text().await?;
    let parsed: CreateRepoResponse = serde_json::from_str(&body)
        .map_err(|_| anyhow!("expecting repo id from seafile, got: {body}"))?;
    Ok(parsed.repo_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_trims_trailing_slash() -> Result<()> {
        let p = SeafileProvider::new("https://seacloud.cc/", "t", "r")?;
        assert_eq!(p.url, "https://seacloud.cc");
        Ok(())
    }

    #[test]
    fn test_auth_token_response_parsing() {
        let parsed: AuthTokenResponse =
            serde_json::from_str(r#"{"token": "24fd3c026885e3121b52ca630d38b929e91a922e"}"#)
                .unwrap();
        assert_eq!(parsed.token, "24fd3c026885e3121b52ca630d38b929e91a922e");
    }
}

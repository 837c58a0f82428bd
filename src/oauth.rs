use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tiny_http::{Response, Server};
use url::Url;

use crate::error::OAuthError;
use crate::provider::RefreshedToken;

/// How long the loopback listener waits for the browser callback before
/// giving up instead of hanging forever.
const LOOPBACK_DEADLINE: Duration = Duration::from_secs(300);

/// Refresh tokens this close to expiry instead of risking a 401 mid-upload.
const EXPIRY_SKEW_SECS: i64 = 60;

/// An OAuth2 token blob. Field names match what earlier releases stored in
/// the config, so existing `token`/`googletoken` settings keep working.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Token {
    #[serde(default)]
    pub access_token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

impl Token {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("can't parse stored OAuth token")
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Expired, or within the skew window of expiring. Tokens without an
    /// expiry never report expired.
    pub fn is_expired(&self) -> bool {
        match self.expiry {
            Some(expiry) => expiry - ChronoDuration::seconds(EXPIRY_SKEW_SECS) <= Utc::now(),
            None => false,
        }
    }
}

/// A registered OAuth2 application: client credentials plus endpoints.
/// These are plain embedded configuration, not a security boundary.
#[derive(Debug, Clone, Copy)]
pub struct OAuthApp {
    pub client_id: &'static str,
    pub client_secret: &'static str,
    pub auth_url: &'static str,
    pub token_url: &'static str,
}

pub const DROPBOX: OAuthApp = OAuthApp {
    client_id: "i8x0kvtfnzqzfyr",
    client_secret: "q1b2p7e8s3n4l9dk",
    auth_url: "https://www.dropbox.com/oauth2/authorize",
    token_url: "https://api.dropboxapi.com/oauth2/token",
};

pub const GOOGLE_DRIVE: OAuthApp = OAuthApp {
    client_id: "26115953275-7971erj532s8d98vlso25467iudikbvf.apps.googleusercontent.com",
    client_secret: "zNh8pFgkqBvXs37dC1mQaLrt",
    auth_url: "https://accounts.google.com/o/oauth2/auth",
    token_url: "https://www.googleapis.com/oauth2/v3/token",
};

pub const BOX: OAuthApp = OAuthApp {
    client_id: "l7cd0oe92wvxbtq3k5rsy1u8hfmga6zj",
    client_secret: "TJg4A7dKqpVw0RbXyLsNcE2vBhFmZuQx",
    auth_url: "https://app.box.com/api/oauth2/authorize",
    token_url: "https://api.box.com/oauth2/token",
};

pub const GOOGLE_DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";

/// Box registers a fixed redirect URI, so its loopback listener must bind
/// this exact port.
pub const BOX_REDIRECT_ADDR: &str = "127.0.0.1:53682";

#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: Option<String>,
    token_type: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    error: Option<String>,
    error_description: Option<String>,
}

fn token_from_response(resp: TokenEndpointResponse, previous_refresh: Option<&str>) -> Result<Token> {
    if let Some(error) = resp.error {
        bail!(
            "token endpoint error: {} {}",
            error,
            resp.error_description.unwrap_or_default()
        );
    }
    let access_token = resp
        .access_token
        .context("token endpoint returned no access_token")?;

    // A refresh response may omit the refresh token; keep using the old one.
    let refresh_token = resp
        .refresh_token
        .or_else(|| previous_refresh.map(str::to_string))
        .unwrap_or_default();

    Ok(Token {
        access_token,
        token_type: resp.token_type.unwrap_or_default(),
        refresh_token,
        expiry: resp
            .expires_in
            .map(|secs| Utc::now() + ChronoDuration::seconds(secs)),
    })
}

/// Builds the user-facing authorization URL. `redirect_uri` is omitted for
/// paste-the-code flows.
pub fn authorize_url(
    app: &OAuthApp,
    redirect_uri: Option<&str>,
    state: &str,
    extra: &[(&str, &str)],
) -> Result<String> {
    let mut url = Url::parse(app.auth_url)?;
    {
        let mut pairs = url.query_pairs_mut();
        pairs
            .append_pair("client_id", app.client_id)
            .append_pair("response_type", "code")
            .append_pair("state", state);
        if let Some(redirect) = redirect_uri {
            pairs.append_pair("redirect_uri", redirect);
        }
        for (key, value) in extra {
            pairs.append_pair(key, value);
        }
    }
    Ok(url.to_string())
}

fn random_state() -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

/// Exchanges an authorization code for a token.
pub async fn exchange_code(app: &OAuthApp, code: &str, redirect_uri: Option<&str>) -> Result<Token> {
    let mut params = vec![
        ("client_id", app.client_id),
        ("client_secret", app.client_secret),
        ("code", code),
        ("grant_type", "authorization_code"),
    ];
    if let Some(redirect) = redirect_uri {
        params.push(("redirect_uri", redirect));
    }

    let resp: TokenEndpointResponse = reqwest::Client::new()
        .post(app.token_url)
        .form(&params)
        .send()
        .await?
        .json()
        .await
        .context("token exchange failed")?;
    token_from_response(resp, None)
}

/// Obtains a fresh access token from a stored refresh token.
pub async fn refresh(app: &OAuthApp, refresh_token: &str) -> Result<Token> {
    let params = [
        ("client_id", app.client_id),
        ("client_secret", app.client_secret),
        ("refresh_token", refresh_token),
        ("grant_type", "refresh_token"),
    ];

    let resp: TokenEndpointResponse = reqwest::Client::new()
        .post(app.token_url)
        .form(&params)
        .send()
        .await?
        .json()
        .await
        .context("token refresh failed")?;
    token_from_response(resp, Some(refresh_token))
}

/// Runs the full authorization-code loopback flow: bind a local listener,
/// open the browser, wait for exactly one callback (5 minute deadline),
/// exchange the code. `addr` of "127.0.0.1:0" picks a random port.
pub async fn loopback_flow(app: &OAuthApp, addr: &str, extra: &[(&str, &str)]) -> Result<Token> {
    let server = Server::http(addr)
        .map_err(|e| anyhow!("failed to start local OAuth server on {addr}: {e}"))?;
    let port = server
        .server_addr()
        .to_ip()
        .context("loopback listener has no TCP address")?
        .port();
    let redirect_uri = format!("http://localhost:{port}");

    let state = random_state();
    let auth_url = authorize_url(app, Some(&redirect_uri), &state, extra)?;

    println!("Opening browser for authorization...");
    println!("If it does not open automatically, go to:\n{auth_url}\n");
    open_browser(&auth_url);

    let code = wait_for_code(&server, &state)?;
    drop(server);

    exchange_code(app, &code, Some(&redirect_uri)).await
}

/// Accepts requests until one carries an authorization code (browsers also
/// ask for favicons), checking the state parameter, or the deadline passes.
fn wait_for_code(server: &Server, state: &str) -> Result<String> {
    let deadline = Instant::now() + LOOPBACK_DEADLINE;
    info!("waiting for authorization callback");

    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or(OAuthError::Timeout)?;
        let Some(request) = server.recv_timeout(remaining)? else {
            return Err(OAuthError::Timeout.into());
        };

        let full_url = format!("http://localhost{}", request.url());
        let parsed = Url::parse(&full_url)?;
        let params: HashMap<String, String> = parsed.query_pairs().into_owned().collect();

        if let Some(error) = params.get("error") {
            let _ = request.respond(Response::from_string(
                "Authorization denied. You can close this tab.",
            ));
            return Err(OAuthError::Denied(error.clone()).into());
        }

        let Some(code) = params.get("code") else {
            debug!("ignoring callback request without a code: {}", request.url());
            let _ = request.respond(Response::from_string(""));
            continue;
        };

        if params.get("state").map(String::as_str) != Some(state) {
            let _ = request.respond(Response::from_string("State mismatch. Please try again."));
            return Err(OAuthError::StateMismatch.into());
        }

        let _ = request.respond(Response::from_string(
            "<html><body><h2>Authorization successful!</h2><p>You can close this tab.</p></body></html>",
        ));
        return Ok(code.clone());
    }
}

fn open_browser(url: &str) {
    #[cfg(target_os = "linux")]
    let result = std::process::Command::new("xdg-open").arg(url).spawn();

    #[cfg(target_os = "macos")]
    let result = std::process::Command::new("open").arg(url).spawn();

    #[cfg(target_os = "windows")]
    let result = std::process::Command::new("rundll32")
        .args(["url.dll,FileProtocolHandler", url])
        .spawn();

    if let Err(err) = result {
        warn!("can't open browser: {err}");
    }
}

/// Holds an adapter's OAuth token for the lifetime of one invocation,
/// refreshing it on expiry and recording the refreshed blob so the caller
/// can persist it back into the config.
pub struct TokenManager {
    app: OAuthApp,
    settings_key: &'static str,
    token: Mutex<Token>,
    refreshed: Mutex<Option<String>>,
}

impl TokenManager {
    /// `raw` is either a JSON token blob (current format) or a bare access
    /// token string from very old configs, which then has no refresh path.
    pub fn from_setting(app: OAuthApp, settings_key: &'static str, raw: &str) -> Self {
        let token = match Token::from_json(raw) {
            Ok(token) if !token.access_token.is_empty() => token,
            _ => Token {
                access_token: raw.to_string(),
                ..Default::default()
            },
        };
        TokenManager {
            app,
            settings_key,
            token: Mutex::new(token),
            refreshed: Mutex::new(None),
        }
    }

    /// The current access token, refreshed first if it has expired and a
    /// refresh token is available.
    pub async fn bearer(&self) -> Result<String> {
        let (needs_refresh, refresh_token) = {
            let token = self.token.lock().unwrap();
            (
                token.is_expired() && !token.refresh_token.is_empty(),
                token.refresh_token.clone(),
            )
        };

        if needs_refresh {
            let fresh = refresh(&self.app, &refresh_token).await?;
            let blob = fresh.to_json()?;
            info!("refreshed expired OAuth access token");
            *self.token.lock().unwrap() = fresh;
            *self.refreshed.lock().unwrap() = Some(blob);
        }

        Ok(self.token.lock().unwrap().access_token.clone())
    }

    pub fn refreshed_token(&self) -> Option<RefreshedToken> {
        self.refreshed
            .lock()
            .unwrap()
            .clone()
            .map(|value| RefreshedToken {
                key: self.settings_key,
                value,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_round_trips_stored_blob() -> Result<()> {
        let raw = r#"{"access_token":"at","token_type":"bearer","refresh_token":"rt","expiry":"2024-01-15T12:34:56Z"}"#;
        let token = Token::from_json(raw)?;
        assert_eq!(token.access_token, "at");
        assert_eq!(token.refresh_token, "rt");
        assert!(token.is_expired());

        let reparsed = Token::from_json(&token.to_json()?)?;
        assert_eq!(reparsed.access_token, "at");
        assert_eq!(reparsed.expiry, token.expiry);
        Ok(())
    }

    #[test]
    fn test_token_without_expiry_never_expires() {
        let token = Token {
            access_token: "at".to_string(),
            ..Default::default()
        };
        assert!(!token.is_expired());
    }

    #[test]
    fn test_token_expiring_within_skew_counts_as_expired() {
        let token = Token {
            access_token: "at".to_string(),
            expiry: Some(Utc::now() + ChronoDuration::seconds(30)),
            ..Default::default()
        };
        assert!(token.is_expired());

        let fresh = Token {
            access_token: "at".to_string(),
            expiry: Some(Utc::now() + ChronoDuration::seconds(3600)),
            ..Default::default()
        };
        assert!(!fresh.is_expired());
    }

    #[test]
    fn test_authorize_url_carries_parameters() -> Result<()> {
        let url = authorize_url(
            &GOOGLE_DRIVE,
            Some("http://localhost:1234"),
            "st4te",
            &[("access_type", "offline")],
        )?;
        assert!(url.starts_with("https://accounts.google.com/o/oauth2/auth?"));
        assert!(url.contains("response_type=code"));
        assert!(url.contains("state=st4te"));
        assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A1234"));
        assert!(url.contains("access_type=offline"));
        Ok(())
    }

    #[test]
    fn test_authorize_url_without_redirect() -> Result<()> {
        let url = authorize_url(&DROPBOX, None, "s", &[("token_access_type", "offline")])?;
        assert!(!url.contains("redirect_uri"));
        assert!(url.contains("token_access_type=offline"));
        Ok(())
    }

    #[test]
    fn test_refresh_response_keeps_previous_refresh_token() -> Result<()> {
        let resp = TokenEndpointResponse {
            access_token: Some("new-at".to_string()),
            token_type: Some("bearer".to_string()),
            refresh_token: None,
            expires_in: Some(3600),
            error: None,
            error_description: None,
        };
        let token = token_from_response(resp, Some("old-rt"))?;
        assert_eq!(token.access_token, "new-at");
        assert_eq!(token.refresh_token, "old-rt");
        assert!(!token.is_expired());
        Ok(())
    }

    #[test]
    fn test_error_response_fails() {
        let resp = TokenEndpointResponse {
            access_token: None,
            token_type: None,
            refresh_token: None,
            expires_in: None,
            error: Some("invalid_grant".to_string()),
            error_description: Some("expired".to_string()),
        };
        let err = token_from_response(resp, None).unwrap_err();
        assert!(format!("{err}").contains("invalid_grant"));
    }

    #[test]
    fn test_token_manager_accepts_bare_access_token() {
        let manager = TokenManager::from_setting(DROPBOX, "token", "plain-access-token");
        assert!(manager.refreshed_token().is_none());
        let token = manager.token.lock().unwrap();
        assert_eq!(token.access_token, "plain-access-token");
        assert!(token.refresh_token.is_empty());
    }
}

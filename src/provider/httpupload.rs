use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Local};
use log::warn;
use regex::Regex;
use reqwest::{Client, header};
use std::collections::HashMap;
use std::time::Duration;

use super::{Provider, UploadSource};

/// Uploads via HTTP PUT to a base URL; the final URL is base + filename and
/// doubles as the share link.
///
/// Header values support template expressions for dynamic dates:
///
///   {{now "%Y-%m-%d"}}        today, chrono-formatted
///   {{addDays 7 "%Y-%m-%d"}}  today + N days
pub struct HttpUploadProvider {
    base_url: String,
    headers: HashMap<String, String>,
    client: Client,
}

impl HttpUploadProvider {
    /// `headers_json` is a JSON-encoded string map; anything unparsable is
    /// treated as no extra headers.
    pub fn new(base_url: &str, headers_json: &str) -> Self {
        let headers = if headers_json.is_empty() {
            HashMap::new()
        } else {
            serde_json::from_str(headers_json).unwrap_or_else(|err| {
                warn!("ignoring unparsable headers setting: {err}");
                HashMap::new()
            })
        };
        Self {
            base_url: format!("{}/", base_url.trim_end_matches('/')),
            headers,
            client: Client::builder()
                .connect_timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }
}

/// Evaluates the date template expressions in a header value; a value
/// without templates passes through untouched.
fn render_value(value: &str) -> String {
    if !value.contains("{{") {
        return value.to_string();
    }

    let now_re = Regex::new(r#"\{\{\s*now\s+"([^"]*)"\s*\}\}"#).unwrap();
    let add_days_re = Regex::new(r#"\{\{\s*addDays\s+(-?\d+)\s+"([^"]*)"\s*\}\}"#).unwrap();

    let rendered = now_re.replace_all(value, |caps: &regex::Captures| {
        Local::now().format(&caps[1]).to_string()
    });
    add_days_re
        .replace_all(&rendered, |caps: &regex::Captures| {
            let days: i64 = caps[1].parse().unwrap_or(0);
            (Local::now() + ChronoDuration::days(days))
                .format(&caps[2])
                .to_string()
        })
        .to_string()
}

#[async_trait]
impl Provider for HttpUploadProvider {
    async fn upload(&self, src: UploadSource, filename: &str, size: u64) -> Result<String> {
        let url = format!("{}{}", self.base_url, filename);

        let mut request = self
            .client
            .put(&url)
            .header(header::CONTENT_LENGTH, size)
            .header(header::CONTENT_TYPE, "application/octet-stream");
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), render_value(value));
        }

        let resp = request.body(src.into_body()).send().await?;
        if resp.status().as_u16() >= 400 {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("HTTP PUT failed ({status}): {body}"));
        }
        Ok(url)
    }

    /// The URL was already constructed during upload.
    async fn get_link(&self, file_url: &str) -> Result<String> {
        Ok(file_url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_gets_single_trailing_slash() {
        assert_eq!(
            HttpUploadProvider::new("https://up.example/files", "").base_url,
            "https://up.example/files/"
        );
        assert_eq!(
            HttpUploadProvider::new("https://up.example/files///", "").base_url,
            "https://up.example/files/"
        );
    }

    #[test]
    fn test_headers_parse_and_bad_json_is_tolerated() {
        let p = HttpUploadProvider::new("https://u.example", r#"{"X-Auth": "secret"}"#);
        assert_eq!(p.headers["X-Auth"], "secret");

        let p = HttpUploadProvider::new("https://u.example", "not-json");
        assert!(p.headers.is_empty());
    }

    #[test]
    fn test_render_value_plain_passthrough() {
        assert_eq!(render_value("static-value"), "static-value");
    }

    #[test]
    fn test_render_value_now() {
        let rendered = render_value(r#"expires-{{now "%Y"}}"#);
        let year = Local::now().format("%Y").to_string();
        assert_eq!(rendered, format!("expires-{year}"));
    }

    #[test]
    fn test_render_value_add_days() {
        let rendered = render_value(r#"{{addDays 7 "%Y-%m-%d"}}"#);
        let expected = (Local::now() + ChronoDuration::days(7))
            .format("%Y-%m-%d")
            .to_string();
        assert_eq!(rendered, expected);
    }

    #[test]
    fn test_render_value_malformed_template_left_alone() {
        assert_eq!(render_value("{{nope}}"), "{{nope}}");
    }
}

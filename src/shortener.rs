use anyhow::{Result, bail};
use async_trait::async_trait;
use reqwest::multipart;
use serde::Deserialize;

/// The shortener backends offered during setup.
pub const SHORTENERS: &[&str] = &["biturl"];

#[async_trait]
pub trait UrlShortener: Send + Sync {
    fn name(&self) -> &'static str;
    async fn shorten(&self, url: &str) -> Result<String>;
}

pub fn create(name: &str) -> Option<Box<dyn UrlShortener>> {
    match name {
        "biturl" => Some(Box::new(BitUrl)),
        _ => None,
    }
}

/// biturl.top: keyless shortener, multipart POST with the long URL.
pub struct BitUrl;

#[derive(Debug, Deserialize)]
struct BitUrlReply {
    #[serde(default)]
    result: bool,
    #[serde(default)]
    short: String,
    #[serde(default)]
    message: String,
}

#[async_trait]
impl UrlShortener for BitUrl {
    fn name(&self) -> &'static str {
        "biturl"
    }

    async fn shorten(&self, url: &str) -> Result<String> {
        let form = multipart::Form::new().text("url", url.to_string());
        let resp = reqwest::Client::new()
            .post("https://api.biturl.top/short")
            .multipart(form)
            .send()
            .await?;

        let body = resp.text().await?;
        let reply: BitUrlReply = match serde_json::from_str(&body) {
            Ok(reply) => reply,
            Err(_) => bail!("expecting json from biturl, got: {body}"),
        };

        if reply.result && !reply.short.is_empty() {
            Ok(reply.short)
        } else if !reply.message.is_empty() {
            bail!("biturl: {}", reply.message)
        } else {
            bail!("biturl returned no short url: {body}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_known_and_unknown() {
        assert_eq!(create("biturl").map(|s| s.name()), Some("biturl"));
        assert!(create("tinyurl").is_none());
    }

    #[test]
    fn test_reply_parsing() {
        let reply: BitUrlReply = serde_json::from_str(
            r#"{"result":true,"short":"https://biturl.top/EbQjye","message":""}"#,
        )
        .unwrap();
        assert!(reply.result);
        assert_eq!(reply.short, "https://biturl.top/EbQjye");
    }
}

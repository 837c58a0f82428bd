use anyhow::{Context, Result, anyhow};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::{ConfigError, is_auth_error};
use crate::provider::{self, Provider, UploadSource};
use crate::setup;

/// Uploads `path` through the provider stored under `label` and returns the
/// share link. A failure that looks like an expired OAuth credential gets
/// one interactive re-authentication and one retry of the failed step;
/// everything else, and a second auth failure, is terminal.
pub async fn share_file(cfg: &mut Config, label: &str, path: &Path) -> Result<String> {
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("invalid filename: {}", path.display()))?
        .to_string();

    let mut prov = instantiate(cfg, label)?;
    let mut reauthed = false;

    let file_id = loop {
        match run_upload(Arc::clone(&prov), path, &filename).await {
            Ok(id) => break id,
            Err(err) if is_auth_error(&err) && !reauthed => {
                reauthed = true;
                prov = reauthenticate(cfg, label, &err).await?;
            }
            Err(err) => return Err(err.context("upload failed")),
        }
    };
    persist_refreshed_token(cfg, label, prov.as_ref());
    info!("uploaded {filename} as {file_id}");

    // The single retry budget is shared with the upload step.
    let link = loop {
        match prov.get_link(&file_id).await {
            Ok(link) => break link,
            Err(err) if is_auth_error(&err) && !reauthed => {
                reauthed = true;
                prov = reauthenticate(cfg, label, &err).await?;
            }
            Err(err) => return Err(err.context("can't get link")),
        }
    };
    persist_refreshed_token(cfg, label, prov.as_ref());

    Ok(link)
}

fn instantiate(cfg: &Config, label: &str) -> Result<Arc<dyn Provider>> {
    let entry = cfg
        .find_by_label(label)
        .ok_or_else(|| ConfigError::ProviderNotFound(label.to_string()))?;
    Ok(Arc::from(provider::create(entry)?))
}

/// One upload attempt: the adapter runs on a background task while the
/// foreground drains progress events into the bar, then joins the task.
/// The file is reopened at offset zero on every attempt.
async fn run_upload(prov: Arc<dyn Provider>, path: &Path, filename: &str) -> Result<String> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (src, size) = UploadSource::open(path, Some(tx)).await?;

    let bar = progress_bar(filename, size);
    let task = tokio::spawn({
        let prov = Arc::clone(&prov);
        let filename = filename.to_string();
        async move { prov.upload(src, &filename, size).await }
    });

    // The channel closes once the adapter has consumed (or dropped) the
    // source, so this loop cannot outlive the upload.
    while let Some(progress) = rx.recv().await {
        bar.set_position((progress.fraction() * size as f64) as u64);
    }

    let result = task.await.context("upload task panicked")?;
    match &result {
        Ok(_) => bar.finish(),
        Err(_) => bar.abandon(),
    }
    result
}

fn progress_bar(filename: &str, size: u64) -> ProgressBar {
    let bar = ProgressBar::new(size);
    bar.set_style(
        ProgressStyle::with_template(
            "{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, eta {eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-"),
    );
    bar.set_message(filename.to_string());
    bar
}

/// Replaces the stored credential for one provider label, persists it, and
/// hands back a freshly built adapter.
async fn reauthenticate(
    cfg: &mut Config,
    label: &str,
    err: &anyhow::Error,
) -> Result<Arc<dyn Provider>> {
    warn!("auth failure on provider {label:?}: {err:#}");
    println!("\nOAuth token has expired for provider {label:?}.");

    setup::reauthenticate(cfg, label)
        .await
        .context("re-authentication failed")?;

    // Pick up exactly what was persisted.
    let path = cfg.path.clone();
    *cfg = Config::load(&path)?;
    instantiate(cfg, label)
}

/// Write-through for tokens an adapter refreshed on its own mid-operation.
fn persist_refreshed_token(cfg: &mut Config, label: &str, prov: &dyn Provider) {
    let Some(refreshed) = prov.refreshed_token() else {
        return;
    };
    let Some(entry) = cfg.find_by_label_mut(label) else {
        return;
    };
    entry.settings.insert(refreshed.key.to_string(), refreshed.value);
    if let Err(err) = cfg.write() {
        warn!("failed to save refreshed token to config: {err:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderEntry;
    use crate::provider::RefreshedToken;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::{NamedTempFile, TempDir};

    struct FakeProvider {
        upload_errors: Mutex<Vec<String>>,
        uploads: Mutex<u32>,
        refreshed: Option<RefreshedToken>,
    }

    #[async_trait]
    impl Provider for FakeProvider {
        async fn upload(&self, src: UploadSource, filename: &str, _size: u64) -> Result<String> {
            src.read_to_end().await?;
            *self.uploads.lock().unwrap() += 1;
            if let Some(err) = self.upload_errors.lock().unwrap().pop() {
                return Err(anyhow!(err));
            }
            Ok(format!("/{filename}"))
        }

        async fn get_link(&self, file_id: &str) -> Result<String> {
            Ok(format!("https://share.example{file_id}"))
        }

        fn refreshed_token(&self) -> Option<RefreshedToken> {
            self.refreshed.clone()
        }
    }

    #[tokio::test]
    async fn test_run_upload_success_and_progress() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        file.write_all(b"some bytes to ship")?;
        file.flush()?;

        let prov: Arc<dyn Provider> = Arc::new(FakeProvider {
            upload_errors: Mutex::new(vec![]),
            uploads: Mutex::new(0),
            refreshed: None,
        });
        let id = run_upload(Arc::clone(&prov), file.path(), "data.bin").await?;
        assert_eq!(id, "/data.bin");
        Ok(())
    }

    #[tokio::test]
    async fn test_run_upload_propagates_adapter_error_without_retry() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        file.write_all(b"x")?;
        file.flush()?;

        let fake = Arc::new(FakeProvider {
            upload_errors: Mutex::new(vec!["connection refused".to_string()]),
            uploads: Mutex::new(0),
            refreshed: None,
        });
        let prov: Arc<dyn Provider> = fake.clone();
        let err = run_upload(prov, file.path(), "data.bin").await.unwrap_err();
        assert!(format!("{err}").contains("connection refused"));
        assert_eq!(*fake.uploads.lock().unwrap(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_persist_refreshed_token_writes_through() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("config.json");
        let mut cfg = Config::empty(&path);
        cfg.add_provider(ProviderEntry {
            label: "gd".to_string(),
            kind: "googledrive".to_string(),
            settings: BTreeMap::from([("googletoken".to_string(), "old".to_string())]),
        });
        cfg.write()?;

        let prov = FakeProvider {
            upload_errors: Mutex::new(vec![]),
            uploads: Mutex::new(0),
            refreshed: Some(RefreshedToken {
                key: "googletoken",
                value: "new-blob".to_string(),
            }),
        };
        persist_refreshed_token(&mut cfg, "gd", &prov);

        let reloaded = Config::load(&path)?;
        assert_eq!(
            reloaded.find_by_label("gd").unwrap().settings["googletoken"],
            "new-blob"
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_instantiate_unknown_label_is_config_error() {
        let cfg = Config::empty(Path::new("/tmp/none.json"));
        let err = instantiate(&cfg, "missing").map(|_| ()).unwrap_err();
        assert!(format!("{err}").contains("not found"));
    }
}

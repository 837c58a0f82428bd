mod cli;
mod clipboard;
mod config;
mod error;
mod oauth;
mod provider;
mod qr;
mod setup;
mod shortener;
mod upload;

use anyhow::{Result, anyhow, bail};
use clap::Parser;
use colored::*;
use log::{info, warn};
use std::path::PathBuf;

use cli::Args;
use config::Config;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env()
        .format_timestamp_millis()
        .init();

    if let Err(err) = run().await {
        eprintln!("{} {err:#}", "error:".red().bold());
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();

    if args.version {
        println!("ShareCmd Version: {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let mut cfg = Config::load(&config_path)?;
    info!("loaded config from {:?}", config_path);

    if args.setup || cfg.active_provider().is_none() {
        setup::run(&mut cfg).await?;
        if args.args.is_empty() {
            return Ok(());
        }
        // Pick up whatever setup persisted.
        cfg = Config::load(&config_path)?;
    }

    if args.args.is_empty() {
        return Ok(());
    }
    if args.args.len() > 2 {
        bail!("too many arguments; usage: share [provider] <file> or share <file> [provider]");
    }

    // Each positional is either an existing file or a provider label. The
    // file check wins, so a file that happens to be named like a provider
    // still uploads.
    let mut file: Option<PathBuf> = None;
    let mut provider_label: Option<String> = None;

    for arg in &args.args {
        let candidate = PathBuf::from(arg);
        if candidate.exists() {
            if let Some(previous) = &file {
                bail!(
                    "multiple files specified: {} and {}",
                    previous.display(),
                    candidate.display()
                );
            }
            file = Some(candidate);
        } else if cfg.find_by_label(arg).is_some() {
            if let Some(previous) = &provider_label {
                bail!("multiple providers specified: {previous:?} and {arg:?}");
            }
            provider_label = Some(arg.clone());
        } else {
            if cfg.providers.is_empty() {
                bail!(
                    "argument {arg:?} is neither an existing file nor a configured provider, \
                     and no providers are configured"
                );
            }
            println!("Argument {arg:?} is not a configured provider.");
            let selected = setup::pick_provider(&cfg, "Select provider for this upload")?;
            if let Some(previous) = &provider_label {
                bail!("multiple providers specified: {previous:?} and {selected:?}");
            }
            provider_label = Some(selected);
        }
    }

    let Some(file) = file else {
        bail!("no file to upload specified");
    };

    let label = if args.select || provider_label.is_some() {
        match provider_label {
            Some(label) => label,
            None => {
                if cfg.providers.is_empty() {
                    bail!("no providers configured; run 'share --setup' first");
                }
                setup::pick_provider(&cfg, "Select provider for this upload")?
            }
        }
    } else {
        cfg.active_provider()
            .map(|p| p.label.clone())
            .ok_or_else(|| anyhow!("no active provider configured; run 'share --setup' first"))?
    };
    info!("uploading {:?} via provider {label:?}", file);

    let mut link = upload::share_file(&mut cfg, &label, &file).await?;

    if let Some(name) = cfg.url_shortener_provider.clone().filter(|n| !n.is_empty()) {
        match shortener::create(&name) {
            Some(shortener) => match shortener.shorten(&link).await {
                Ok(short) => link = short,
                Err(err) => warn!("URL shortener failed, using the long link: {err:#}"),
            },
            None => warn!("unknown URL shortener {name:?} configured"),
        }
    }

    if cfg.show_qr_code_enabled() {
        match qr::render(&link) {
            Ok(code) => println!("\n{code}"),
            Err(err) => warn!("can't render QR code: {err:#}"),
        }
    }
    println!("{} {link}", "URL:".bold());

    if cfg.copy_to_clipboard_enabled() {
        clipboard::copy(&link);
    }

    Ok(())
}

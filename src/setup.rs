use anyhow::{Result, anyhow, bail};
use colored::*;
use dialoguer::{Confirm, Input, Password, Select};
use log::info;
use std::collections::BTreeMap;

use crate::config::{Config, ProviderEntry};
use crate::error::ConfigError;
use crate::oauth;
use crate::provider::{ProviderKind, seafile};
use crate::shortener;

#[derive(Debug, Clone, Copy)]
enum MenuAction {
    SelectActive,
    Add,
    Edit,
    Delete,
    Preferences,
    Quit,
}

/// Interactive setup: loops a main menu until the user picks an active
/// provider or quits.
pub async fn run(cfg: &mut Config) -> Result<()> {
    loop {
        match main_menu(cfg)? {
            MenuAction::SelectActive => {
                select_active(cfg)?;
                return Ok(());
            }
            MenuAction::Add => add_provider(cfg).await?,
            MenuAction::Edit => edit_provider(cfg).await?,
            MenuAction::Delete => delete_provider(cfg)?,
            MenuAction::Preferences => edit_preferences(cfg)?,
            MenuAction::Quit => return Ok(()),
        }
    }
}

fn main_menu(cfg: &Config) -> Result<MenuAction> {
    let mut items: Vec<(&str, MenuAction)> = Vec::new();
    if !cfg.providers.is_empty() {
        items.push(("Select active provider", MenuAction::SelectActive));
    }
    items.push(("Add new provider", MenuAction::Add));
    if !cfg.providers.is_empty() {
        items.push(("Edit provider", MenuAction::Edit));
        items.push(("Delete provider", MenuAction::Delete));
    }
    items.push(("Preferences", MenuAction::Preferences));
    items.push(("Quit", MenuAction::Quit));

    let mut title = "ShareCmd Setup".bold().to_string();
    if !cfg.active.is_empty() {
        title = format!(
            "{title}  {}",
            format!("(active: {})", cfg.active).bright_black()
        );
    }
    println!("{title}");

    let labels: Vec<&str> = items.iter().map(|(label, _)| *label).collect();
    let choice = Select::new()
        .with_prompt("What would you like to do?")
        .items(&labels)
        .default(0)
        .interact()?;
    Ok(items[choice].1)
}

fn select_active(cfg: &mut Config) -> Result<()> {
    if cfg.providers.is_empty() {
        println!("{}", "No providers configured.".red());
        return Ok(());
    }

    let items: Vec<String> = cfg
        .providers
        .iter()
        .map(|p| {
            if p.label == cfg.active {
                format!("{} — {} (current)", p.label, p.kind)
            } else {
                format!("{} — {}", p.label, p.kind)
            }
        })
        .collect();
    let choice = Select::new()
        .with_prompt("Select active provider")
        .items(&items)
        .default(0)
        .interact()?;
    let label = cfg.providers[choice].label.clone();

    cfg.set_active(&label)?;
    cfg.write()?;
    println!("{}", format!("Active provider set to {label:?}").green());
    Ok(())
}

async fn add_provider(cfg: &mut Config) -> Result<()> {
    let kinds: Vec<&str> = ProviderKind::ALL.iter().map(|k| k.as_str()).collect();
    let choice = Select::new()
        .with_prompt("Select provider type")
        .items(&kinds)
        .default(0)
        .interact()?;
    let kind = ProviderKind::ALL[choice];

    let settings = provider_form(kind, None).await?;

    let mut suggestion = kind.as_str().to_string();
    let label = loop {
        let label: String = Input::new()
            .with_prompt("Label for this provider")
            .default(suggestion.clone())
            .interact_text()?;
        if cfg.find_by_label(&label).is_none() {
            break label;
        }
        println!(
            "{}",
            format!("Label {label:?} already exists, choose another.").red()
        );
        suggestion = format!("{label}-2");
    };

    cfg.add_provider(ProviderEntry {
        label: label.clone(),
        kind: kind.as_str().to_string(),
        settings,
    });
    cfg.write()?;
    println!("{}", format!("Provider {label:?} added.").green());
    Ok(())
}

async fn edit_provider(cfg: &mut Config) -> Result<()> {
    if cfg.providers.is_empty() {
        println!("{}", "No providers to edit.".red());
        return Ok(());
    }

    let label = pick_provider(cfg, "Select provider to edit")?;
    let (kind_str, defaults) = cfg
        .find_by_label(&label)
        .map(|e| (e.kind.clone(), e.settings.clone()))
        .ok_or_else(|| anyhow!("provider {label:?} not found"))?;
    let kind = ProviderKind::from_str(&kind_str)
        .ok_or_else(|| ConfigError::UnknownProviderType(kind_str))?;

    let settings = provider_form(kind, Some(&defaults)).await?;
    if let Some(entry) = cfg.find_by_label_mut(&label) {
        entry.settings = settings;
    }
    cfg.write()?;
    println!("{}", format!("Provider {label:?} updated.").green());
    Ok(())
}

fn delete_provider(cfg: &mut Config) -> Result<()> {
    if cfg.providers.is_empty() {
        println!("{}", "No providers to delete.".red());
        return Ok(());
    }

    let label = pick_provider(cfg, "Select provider to delete")?;
    let confirmed = Confirm::new()
        .with_prompt(format!("Delete provider {label:?}?"))
        .default(false)
        .interact()?;
    if !confirmed {
        return Ok(());
    }

    cfg.remove_provider(&label);
    cfg.write()?;
    println!("{}", format!("Provider {label:?} deleted.").green());
    Ok(())
}

fn edit_preferences(cfg: &mut Config) -> Result<()> {
    let copy_clip = Confirm::new()
        .with_prompt("Copy URL to clipboard after upload?")
        .default(cfg.copy_to_clipboard_enabled())
        .interact()?;
    let show_qr = Confirm::new()
        .with_prompt("Show QR code after upload?")
        .default(cfg.show_qr_code_enabled())
        .interact()?;

    let current = cfg.url_shortener_provider.clone().unwrap_or_default();
    let mut shorteners = vec!["none"];
    shorteners.extend_from_slice(shortener::SHORTENERS);
    let default_idx = shortener::SHORTENERS
        .iter()
        .position(|s| *s == current)
        .map(|i| i + 1)
        .unwrap_or(0);
    let choice = Select::new()
        .with_prompt("Shorten links with")
        .items(&shorteners)
        .default(default_idx)
        .interact()?;

    cfg.copy_to_clipboard = Some(copy_clip);
    cfg.show_qr_code = Some(show_qr);
    cfg.url_shortener_provider = if choice == 0 {
        None
    } else {
        Some(shorteners[choice].to_string())
    };

    cfg.write()?;
    println!("{}", "Preferences saved.".green());
    Ok(())
}

/// Interactive provider picker; returns the chosen label.
pub fn pick_provider(cfg: &Config, prompt: &str) -> Result<String> {
    let items: Vec<String> = cfg
        .providers
        .iter()
        .map(|p| format!("{} ({})", p.label, p.kind))
        .collect();
    let choice = Select::new()
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;
    Ok(cfg.providers[choice].label.clone())
}

/// Re-runs only the credential acquisition for one existing entry and
/// persists the result. Used by the upload driver's auth retry.
pub async fn reauthenticate(cfg: &mut Config, label: &str) -> Result<()> {
    let kind_str = cfg
        .find_by_label(label)
        .map(|e| e.kind.clone())
        .ok_or_else(|| anyhow!("provider {label:?} not found"))?;
    let kind = ProviderKind::from_str(&kind_str)
        .ok_or_else(|| ConfigError::UnknownProviderType(kind_str.clone()))?;

    println!(
        "{}",
        format!("Re-authenticating provider: {label} ({kind_str})").bold()
    );
    println!("Your authentication has expired. Please authenticate again.");

    let settings = provider_form(kind, None).await?;
    if let Some(entry) = cfg.find_by_label_mut(label) {
        entry.settings = settings;
    }
    cfg.write()?;
    println!(
        "{}",
        format!("Provider {label:?} re-authenticated successfully.").green()
    );
    Ok(())
}

fn default_for(defaults: Option<&BTreeMap<String, String>>, key: &str, fallback: &str) -> String {
    defaults
        .and_then(|d| d.get(key))
        .cloned()
        .unwrap_or_else(|| fallback.to_string())
}

fn oauth_note(service: &str) -> Result<()> {
    let proceed = Confirm::new()
        .with_prompt(format!(
            "Your browser will open to authorize {service}. Continue?"
        ))
        .default(true)
        .interact()?;
    if !proceed {
        bail!("cancelled");
    }
    Ok(())
}

/// Collects the settings map for a provider type, running whatever
/// credential flow that type needs.
async fn provider_form(
    kind: ProviderKind,
    defaults: Option<&BTreeMap<String, String>>,
) -> Result<BTreeMap<String, String>> {
    let mut settings = BTreeMap::new();

    match kind {
        ProviderKind::HttpUpload => {
            let url: String = Input::new()
                .with_prompt("Upload base URL (e.g. https://example.com/up)")
                .default(default_for(defaults, "url", ""))
                .interact_text()?;
            let headers: String = Input::new()
                .with_prompt("Extra headers as JSON")
                .default(default_for(defaults, "headers", "{}"))
                .interact_text()?;
            settings.insert("url".to_string(), url);
            settings.insert("headers".to_string(), headers);
        }

        ProviderKind::Nextcloud => {
            let url: String = Input::new()
                .with_prompt("Nextcloud URL (e.g. https://example.com)")
                .default(default_for(defaults, "url", ""))
                .interact_text()?;
            let username: String = Input::new()
                .with_prompt("Username")
                .default(default_for(defaults, "username", ""))
                .interact_text()?;
            let password = Password::new().with_prompt("Password").interact()?;
            let with_password = Confirm::new()
                .with_prompt("Password-protected link shares?")
                .default(default_for(defaults, "linkShareWithPassword", "false") == "true")
                .interact()?;
            let mut password_chars = default_for(defaults, "randomPasswordChars", "32");
            if with_password {
                password_chars = Input::new()
                    .with_prompt("Random password length")
                    .default(password_chars)
                    .interact_text()?;
            }
            settings.insert("url".to_string(), url);
            settings.insert("username".to_string(), username);
            settings.insert("password".to_string(), password);
            settings.insert(
                "linkShareWithPassword".to_string(),
                with_password.to_string(),
            );
            settings.insert("randomPasswordChars".to_string(), password_chars);
        }

        ProviderKind::OpenDrive => {
            let user: String = Input::new()
                .with_prompt("Username")
                .default(default_for(defaults, "user", ""))
                .interact_text()?;
            let pass = Password::new().with_prompt("Password").interact()?;
            settings.insert("user".to_string(), user);
            settings.insert("pass".to_string(), pass);
        }

        ProviderKind::Seafile => {
            let url: String = Input::new()
                .with_prompt("Seafile URL (e.g. https://seacloud.cc)")
                .default(default_for(defaults, "url", ""))
                .interact_text()?;
            let username: String = Input::new().with_prompt("Username").interact_text()?;
            let password = Password::new().with_prompt("Password").interact()?;
            let two_factor = Confirm::new()
                .with_prompt("Is two factor auth enabled?")
                .default(false)
                .interact()?;
            let otp = if two_factor {
                Some(Input::new().with_prompt("OTP Token").interact_text()?)
            } else {
                None
            };

            let login = seafile::LoginConfig {
                url: url.clone(),
                username,
                password,
                otp,
            };
            let token = seafile::get_token(&login).await?;
            let repo_id = seafile::create_library(&url, &token).await?;
            settings.insert("token".to_string(), token);
            settings.insert("url".to_string(), url);
            settings.insert("repoid".to_string(), repo_id);
        }

        ProviderKind::Dropbox => {
            let auth_url = oauth::authorize_url(
                &oauth::DROPBOX,
                None,
                "state",
                &[("token_access_type", "offline")],
            )?;
            println!("\n1. Go to {auth_url}");
            println!("2. Click \"Allow\" (you might have to log in first).");
            println!("3. Copy the authorization code.\n");

            let code: String = Input::new()
                .with_prompt("Authorization Code")
                .interact_text()?;
            let token = oauth::exchange_code(&oauth::DROPBOX, code.trim(), None).await?;
            settings.insert("token".to_string(), token.to_json()?);
        }

        ProviderKind::Box => {
            oauth_note("Box")?;
            let token = oauth::loopback_flow(
                &oauth::BOX,
                oauth::BOX_REDIRECT_ADDR,
                &[("access_type", "offline")],
            )
            .await?;
            settings.insert("token".to_string(), token.to_json()?);
        }

        ProviderKind::GoogleDrive => {
            oauth_note("Google Drive")?;
            let token = oauth::loopback_flow(
                &oauth::GOOGLE_DRIVE,
                "127.0.0.1:0",
                &[
                    ("scope", oauth::GOOGLE_DRIVE_SCOPE),
                    ("access_type", "offline"),
                    ("prompt", "consent"),
                ],
            )
            .await?;
            settings.insert("googletoken".to_string(), token.to_json()?);
        }
    }

    info!("collected settings for a {kind} provider");
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_for_prefers_stored_value() {
        let stored = BTreeMap::from([("url".to_string(), "https://nc.example".to_string())]);
        assert_eq!(default_for(Some(&stored), "url", ""), "https://nc.example");
        assert_eq!(default_for(Some(&stored), "missing", "fb"), "fb");
        assert_eq!(default_for(None, "url", "fb"), "fb");
    }
}

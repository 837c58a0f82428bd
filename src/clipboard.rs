use arboard::Clipboard;
use log::warn;

/// Copies `text` to the system clipboard. Clipboard trouble (headless
/// session, missing display) only warns; the link was already printed.
pub fn copy(text: &str) {
    match Clipboard::new().and_then(|mut clip| clip.set_text(text.to_string())) {
        Ok(()) => println!("URL copied to clipboard!"),
        Err(err) => warn!("can't copy link to clipboard: {err}"),
    }
}

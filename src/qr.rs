use anyhow::Result;
use qrcode::render::unicode;
use qrcode::{EcLevel, QrCode};

/// Renders `data` as a QR code in Unicode half blocks. Colors are inverted
/// so the code scans correctly on dark terminal backgrounds.
pub fn render(data: &str) -> Result<String> {
    let code = QrCode::with_error_correction_level(data.as_bytes(), EcLevel::L)?;
    Ok(code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_produces_half_block_output() -> Result<()> {
        let rendered = render("https://example.com/s/abc")?;
        assert!(!rendered.is_empty());
        assert!(rendered.lines().count() > 10);
        Ok(())
    }
}

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use font8x8::{UnicodeFonts, BASIC_FONTS};
use image::RgbaImage;
use log::{debug, info, warn};
use tiny_skia::{Color, IntSize, Paint, Pixmap, PremultipliedColorU8, Transform};

use crate::{
    geometry::{Pos, Rect},
    handoff::HostSurface,
    scan::{DecodedCode, ScannedQrInfo},
};

pub const NOT_DETECTED: &str = "QRCode not detected!";
const MAX_WIDTH: f32 = 600.;
const MAX_HEIGHT: f32 = 400.;

/// The terminal front end. It has no window to hide, so hiding is a mode it
/// tracks and logs.
#[derive(Debug, Default)]
pub struct TerminalHost {
    hidden: bool,
}

impl TerminalHost {
    #[cfg(test)]
    pub fn is_hidden(&self) -> bool {
        self.hidden
    }
}

impl HostSurface for TerminalHost {
    fn hide(&mut self) {
        self.hidden = true;
        debug!("host hidden while capturing");
    }

    fn show(&mut self) {
        self.hidden = false;
        debug!("host restored");
    }
}

pub fn describe(code: &DecodedCode) -> String {
    format!("{{version: {}, data: {:?}}}", code.version, code.data)
}

/// Display scale fitting a `width` x `height` image into 600x400.
pub fn fit_scale(width: u32, height: u32) -> f32 {
    if width == 0 || height == 0 {
        return 1.;
    }
    let (mut w, mut h) = (width as f32, height as f32);
    if w > MAX_WIDTH {
        h *= MAX_WIDTH / w;
        w = MAX_WIDTH;
    }
    if h > MAX_HEIGHT {
        w *= MAX_HEIGHT / h;
    }
    w / width as f32
}

/// Box the overlay highlights: from the top-left corner across to the
/// top-right corner's x and down to the bottom-left corner's y.
pub fn highlight(code: &DecodedCode) -> Rect {
    let loc = &code.location;
    Rect::from_corners(
        loc.top_left,
        Pos::new(loc.top_right.x, loc.bottom_left.y),
    )
}

/// The captured image with the code's region painted over it.
pub fn annotate(info: &ScannedQrInfo) -> Result<Pixmap> {
    let size = IntSize::from_wh(info.width, info.height).context("empty capture")?;
    let image = RgbaImage::from_raw(info.width, info.height, info.image.clone())
        .context("capture buffer does not match its size")?;
    let mut pixmap = Pixmap::new(size.width(), size.height()).context("failed to allocate pixmap")?;
    for (dst, src) in pixmap.pixels_mut().iter_mut().zip(image.pixels()) {
        let [r, g, b, a] = src.0;
        *dst = premultiply(r, g, b, a);
    }

    let mut paint = Paint::default();
    paint.set_color(Color::from_rgba8(255, 60, 0, 128));
    if let Some(rect) = highlight(&info.code).to_skia() {
        pixmap.fill_rect(rect, &paint, Transform::identity(), None);
    }
    Ok(pixmap)
}

pub fn save_png(pixmap: &Pixmap, path: &Path) -> Result<()> {
    let mut image = RgbaImage::new(pixmap.width(), pixmap.height());
    for (dst, src) in image.pixels_mut().zip(pixmap.pixels()) {
        let c = src.demultiply();
        dst.0 = [c.red(), c.green(), c.blue(), c.alpha()];
    }
    image
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))
}

/// Prints the outcome of a capture, writing the annotated image to `output`.
pub fn present(result: Option<&ScannedQrInfo>, output: Option<&PathBuf>) -> Result<()> {
    let Some(info) = result else {
        warn!("{NOT_DETECTED}");
        println!("{NOT_DETECTED}");
        return Ok(());
    };
    println!("{}", describe(&info.code));
    if let Some(path) = output {
        let pixmap = annotate(info)?;
        save_png(&pixmap, path)?;
        info!(
            "wrote {}x{} capture to {} (display scale {:.2})",
            info.width,
            info.height,
            path.display(),
            fit_scale(info.width, info.height)
        );
    }
    Ok(())
}

/// Width in pixels `text` takes with [`draw_text`].
pub fn text_width(text: &str, scale: u32) -> u32 {
    text.chars().count() as u32 * 8 * scale
}

/// Draws `text` with the 8x8 bitmap font, top-left at `(x, y)`.
pub fn draw_text(pixmap: &mut Pixmap, x: i32, y: i32, text: &str, scale: u32, color: PremultipliedColorU8) {
    let (width, height) = (pixmap.width() as i32, pixmap.height() as i32);
    let scale = scale.max(1) as i32;
    let pixels = pixmap.pixels_mut();
    for (i, ch) in text.chars().enumerate() {
        let Some(glyph) = BASIC_FONTS.get(ch).or_else(|| BASIC_FONTS.get('?')) else {
            continue;
        };
        let origin = x + i as i32 * 8 * scale;
        for (row_idx, row) in glyph.iter().enumerate() {
            for col_idx in 0..8 {
                if (row >> col_idx) & 1 == 0 {
                    continue;
                }
                for sy in 0..scale {
                    for sx in 0..scale {
                        let px = origin + col_idx * scale + sx;
                        let py = y + row_idx as i32 * scale + sy;
                        if px >= 0 && py >= 0 && px < width && py < height {
                            pixels[(py * width + px) as usize] = color;
                        }
                    }
                }
            }
        }
    }
}

fn premultiply(r: u8, g: u8, b: u8, a: u8) -> PremultipliedColorU8 {
    let mul = |c: u8| ((c as u16 * a as u16 + 127) / 255) as u8;
    // components never exceed alpha after multiplying
    PremultipliedColorU8::from_rgba(mul(r), mul(g), mul(b), a).unwrap_or(PremultipliedColorU8::TRANSPARENT)
}

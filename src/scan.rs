use std::{
    fmt,
    time::{Duration, Instant},
};

use anyhow::Result;
use image::{imageops, RgbaImage};
use log::{debug, trace, warn};
use rqrr::PreparedImage;

use crate::{
    geometry::{Pos, Rect, Size},
    rate::ScanRate,
};

pub const FREQUENT_SCAN_INTERVAL: Duration = Duration::from_millis(150);

/// A live screen or camera stream that can be frozen into stills.
pub trait FrameSource {
    fn snapshot(&mut self) -> Result<RgbaImage>;
    /// Releases the underlying stream. Stopping twice is an error.
    fn stop(&mut self) -> Result<()>;
}

pub trait CodeDecoder {
    fn decode(&self, image: &RgbaImage) -> Option<DecodedCode>;
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeLocation {
    pub top_left: Pos,
    pub top_right: Pos,
    pub bottom_right: Pos,
    pub bottom_left: Pos,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCode {
    pub data: String,
    pub version: usize,
    /// Corners in the coordinates of the scanned image.
    pub location: CodeLocation,
}

/// A decoded code with the image it was found in.
#[derive(Clone, PartialEq, Eq)]
pub struct ScannedQrInfo {
    pub code: DecodedCode,
    pub width: u32,
    pub height: u32,
    /// RGBA, `width * height * 4` bytes.
    pub image: Vec<u8>,
}

impl fmt::Debug for ScannedQrInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScannedQrInfo")
            .field("code", &self.code)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("image", &format_args!("[{} bytes]", self.image.len()))
            .finish()
    }
}

#[derive(Default, Debug, Clone, Copy)]
pub struct RqrrDecoder;

impl CodeDecoder for RqrrDecoder {
    fn decode(&self, image: &RgbaImage) -> Option<DecodedCode> {
        let gray = imageops::grayscale(image);
        let (width, height) = gray.dimensions();
        let mut prepared =
            PreparedImage::prepare_from_greyscale(width as usize, height as usize, |x, y| {
                gray.get_pixel(x as u32, y as u32)[0]
            });
        let grids = prepared.detect_grids();
        trace!("found {} candidate grids", grids.len());
        grids.into_iter().find_map(|grid| match grid.decode() {
            Ok((meta, data)) => {
                let [tl, tr, br, bl] = grid.bounds.map(|p| Pos::new(p.x, p.y));
                Some(DecodedCode {
                    data,
                    version: meta.version.0,
                    location: CodeLocation {
                        top_left: tl,
                        top_right: tr,
                        bottom_right: br,
                        bottom_left: bl,
                    },
                })
            }
            Err(err) => {
                trace!("grid decode failed: {err:?}");
                None
            }
        })
    }
}

/// Cuts `rect`, given in viewport space, out of `frame`.
///
/// Frames may come at native resolution, so the rect is scaled by the ratio of
/// frame width to viewport width and clamped to the frame.
pub fn crop(frame: &RgbaImage, rect: Rect, viewport: Size) -> Option<RgbaImage> {
    let scale = if viewport.width == 0 {
        1.0
    } else {
        frame.width() as f64 / viewport.width as f64
    };
    let scaled = Rect::new(
        (rect.x as f64 * scale).round() as i32,
        (rect.y as f64 * scale).round() as i32,
        (rect.width as f64 * scale).round() as u32,
        (rect.height as f64 * scale).round() as u32,
    );
    let bounds = Rect::new(0, 0, frame.width(), frame.height());
    let area = scaled.intersect(&bounds)?;
    Some(imageops::crop_imm(frame, area.x as u32, area.y as u32, area.width, area.height).to_image())
}

/// Repeating deadline polled by the event loop. Stopping is idempotent.
#[derive(Default, Debug)]
pub struct ScanTimer {
    interval: Duration,
    next: Option<Instant>,
}

impl ScanTimer {
    pub fn start(&mut self, interval: Duration, now: Instant) {
        self.interval = interval;
        self.next = Some(now + interval);
    }

    pub fn stop(&mut self) {
        self.next = None;
    }

    #[inline]
    pub fn running(&self) -> bool {
        self.next.is_some()
    }

    /// True once per elapsed interval.
    pub fn due(&mut self, now: Instant) -> bool {
        match self.next {
            Some(next) if next <= now => {
                self.next = Some(now + self.interval);
                true
            }
            _ => false,
        }
    }

    /// How long the event loop may sleep before the next tick.
    pub fn timeout(&self, now: Instant) -> Option<Duration> {
        self.next.map(|next| next.saturating_duration_since(now))
    }
}

#[derive(Debug)]
pub enum ScanOutcome {
    Miss,
    Decoded(ScannedQrInfo),
    /// A code was already delivered, nothing scans any more.
    Finished,
}

pub struct Scanner<D> {
    decoder: D,
    timer: ScanTimer,
    interval: Duration,
    finished: bool,
    last_missed: bool,
}

impl<D: CodeDecoder> Scanner<D> {
    pub fn new(decoder: D, interval: Duration) -> Self {
        Self {
            decoder,
            timer: ScanTimer::default(),
            interval,
            finished: false,
            last_missed: false,
        }
    }

    /// Whether the last periodic attempt came up empty.
    #[inline]
    pub fn last_missed(&self) -> bool {
        self.last_missed && self.timer.running()
    }
    #[inline]
    pub fn timer(&self) -> &ScanTimer {
        &self.timer
    }

    pub fn reset(&mut self, rate: ScanRate, now: Instant) {
        self.stop();
        if rate == ScanRate::Frequent && !self.finished {
            self.timer.start(self.interval, now);
        }
    }

    pub fn stop(&mut self) {
        self.timer.stop();
    }

    pub fn tick(&mut self, now: Instant) -> bool {
        !self.finished && self.timer.due(now)
    }

    pub fn maybe_scan(&mut self, frame: &mut dyn FrameSource, rect: Rect, viewport: Size) -> ScanOutcome {
        if self.finished {
            return ScanOutcome::Finished;
        }
        let still = match frame.snapshot() {
            Ok(still) => still,
            Err(err) => {
                warn!("failed to snapshot frame source: {err:#}");
                return ScanOutcome::Miss;
            }
        };
        let Some(image) = crop(&still, rect, viewport) else {
            trace!("selection {rect:?} is outside the frame");
            return ScanOutcome::Miss;
        };
        match self.decoder.decode(&image) {
            None => {
                self.last_missed = true;
                ScanOutcome::Miss
            }
            Some(code) => {
                debug!("decoded {:?} in {}x{}", code.data, image.width(), image.height());
                self.finished = true;
                self.last_missed = false;
                self.timer.stop();
                ScanOutcome::Decoded(ScannedQrInfo {
                    code,
                    width: image.width(),
                    height: image.height(),
                    image: image.into_raw(),
                })
            }
        }
    }
}

use std::{path::PathBuf, time::Duration};

use clap::Parser;

use crate::{geometry::Pos, interaction::DEFAULT_MIN_SIZE, scan::FREQUENT_SCAN_INTERVAL};

#[derive(Parser, Debug)]
#[command(
    name = "qrsnip",
    version,
    about = "Select a region of the screen and decode the QR code shown in it"
)]
pub struct Cli {
    /// Where to write the captured region, annotated with the code's position
    #[arg(short, long, default_value = "qrcode.png")]
    pub output: PathBuf,

    /// Only print the decoded text
    #[arg(long)]
    pub no_image: bool,

    /// Period of live scans while the selection moves slowly, in milliseconds
    #[arg(long, value_name = "MS", default_value_t = FREQUENT_SCAN_INTERVAL.as_millis() as u64)]
    pub scan_interval: u64,

    /// Smallest width and height a resize may leave
    #[arg(long, value_name = "PX", default_value_t = DEFAULT_MIN_SIZE)]
    pub min_size: u32,

    /// Initial selection corners
    #[arg(long, value_name = "X,Y,X,Y", default_value = "300,300,550,550", value_parser = parse_corners)]
    pub initial: (Pos, Pos),
}

impl Cli {
    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            start: self.initial.0,
            end: self.initial.1,
            min_size: self.min_size,
            scan_interval: Duration::from_millis(self.scan_interval.max(1)),
        }
    }
}

/// What a capture surface needs to set up its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    pub start: Pos,
    pub end: Pos,
    pub min_size: u32,
    pub scan_interval: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            start: Pos::new(300, 300),
            end: Pos::new(550, 550),
            min_size: DEFAULT_MIN_SIZE,
            scan_interval: FREQUENT_SCAN_INTERVAL,
        }
    }
}

fn parse_corners(s: &str) -> Result<(Pos, Pos), String> {
    let values = s
        .split(',')
        .map(|v| v.trim().parse::<i32>().map_err(|e| format!("{v:?}: {e}")))
        .collect::<Result<Vec<_>, _>>()?;
    match values[..] {
        [x0, y0, x1, y1] => Ok((Pos::new(x0, y0), Pos::new(x1, y1))),
        _ => Err(format!("expected 4 comma separated numbers, got {}", values.len())),
    }
}

use std::time::Instant;

use log::{debug, error};

use crate::{
    geometry::{Pos, Rect, Size},
    handoff::SurfaceReporter,
    interaction::{InteractionController, ScanCommand},
    scan::{CodeDecoder, FrameSource, ScanOutcome, Scanner},
};

/// State of one capture surface, from source hand-over until the terminal
/// event. The frame source is released on every way out, dropping included.
pub struct CaptureSession<F: FrameSource, D: CodeDecoder> {
    source_id: String,
    frames: Option<F>,
    scanner: Scanner<D>,
    interaction: InteractionController,
    viewport: Size,
    reporter: Option<SurfaceReporter>,
    epoch: Instant,
}

impl<F: FrameSource, D: CodeDecoder> CaptureSession<F, D> {
    pub fn new(
        source_id: String,
        frames: F,
        scanner: Scanner<D>,
        interaction: InteractionController,
        reporter: SurfaceReporter,
    ) -> Self {
        Self {
            source_id,
            frames: Some(frames),
            scanner,
            interaction,
            viewport: Size::default(),
            reporter: Some(reporter),
            epoch: Instant::now(),
        }
    }

    #[inline]
    pub fn selection(&self) -> Rect {
        self.interaction.rect()
    }
    #[inline]
    pub fn scanner(&self) -> &Scanner<D> {
        &self.scanner
    }
    #[inline]
    pub fn viewport(&self) -> Size {
        self.viewport
    }
    pub fn set_viewport(&mut self, viewport: Size) {
        self.viewport = viewport;
    }

    /// The terminal event has been sent.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.reporter.is_none()
    }

    pub fn pointer_down(&mut self, pos: Pos, now: Instant) {
        let command = self.interaction.pointer_down(pos);
        self.apply(command, now);
    }

    pub fn pointer_move(&mut self, pos: Pos, now: Instant) {
        let now_ms = now.saturating_duration_since(self.epoch).as_millis() as u64;
        let command = self.interaction.pointer_move(pos, now_ms);
        self.apply(command, now);
    }

    pub fn pointer_up(&mut self, now: Instant) {
        let command = self.interaction.pointer_up();
        self.apply(command, now);
    }

    pub fn pointer_leave(&mut self, now: Instant) {
        let command = self.interaction.pointer_leave();
        self.apply(command, now);
    }

    /// Runs the periodic scan when due.
    pub fn tick(&mut self, now: Instant) {
        if self.scanner.tick(now) {
            self.scan();
        }
    }

    pub fn cancel(&mut self) {
        self.release();
        if let Some(reporter) = self.reporter.take() {
            debug!("capture on {} canceled", self.source_id);
            reporter.canceled();
        }
    }

    /// Ends the session on a surface error so the pending request doesn't hang.
    pub fn fail(&mut self, reason: String) {
        self.release();
        if let Some(reporter) = self.reporter.take() {
            reporter.load_failed(reason);
        }
    }

    fn apply(&mut self, command: Option<ScanCommand>, now: Instant) {
        match command {
            Some(ScanCommand::Reset(rate)) => self.scanner.reset(rate, now),
            Some(ScanCommand::StopAndScan) => {
                self.scanner.stop();
                self.scan();
            }
            None => {}
        }
    }

    fn scan(&mut self) {
        let Some(frames) = self.frames.as_mut() else {
            return;
        };
        let rect = self.interaction.rect();
        if let ScanOutcome::Decoded(info) = self.scanner.maybe_scan(frames, rect, self.viewport) {
            self.release();
            if let Some(reporter) = self.reporter.take() {
                reporter.scanned(info);
            }
        }
    }

    fn release(&mut self) {
        self.scanner.stop();
        if let Some(mut frames) = self.frames.take() {
            if let Err(err) = frames.stop() {
                error!("failed to stop frame source {}: {err:#}", self.source_id);
            }
        }
    }
}

impl<F: FrameSource, D: CodeDecoder> Drop for CaptureSession<F, D> {
    fn drop(&mut self) {
        self.release();
    }
}

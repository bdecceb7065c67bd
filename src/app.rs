use anyhow::{Context, Result};
use futures::executor::block_on;
use libc::c_int;
use log::{debug, error, trace};
use smithay_client_toolkit::{
    compositor::{CompositorHandler, CompositorState},
    delegate_compositor, delegate_keyboard, delegate_layer, delegate_output, delegate_pointer,
    delegate_registry, delegate_seat, delegate_shm,
    output::{OutputHandler, OutputState},
    registry::{ProvidesRegistryState, RegistryState},
    registry_handlers,
    seat::{
        keyboard::{KeyEvent, KeyboardHandler, Keysym, Modifiers},
        pointer::{PointerEvent, PointerEventKind, PointerHandler, BTN_LEFT},
        Capability, SeatHandler, SeatState,
    },
    shell::{
        wlr_layer::{
            Anchor, KeyboardInteractivity, Layer, LayerShell, LayerShellHandler, LayerSurface,
            LayerSurfaceConfigure,
        },
        WaylandSurface,
    },
    shm::{slot::SlotPool, Shm, ShmHandler},
};
use std::{
    io,
    os::fd::{AsFd, AsRawFd},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tiny_skia::{Color, Paint, Pixmap, PremultipliedColorU8, Transform};
use wayland_client::{
    backend::WaylandError,
    globals::registry_queue_init,
    protocol::{
        wl_keyboard::WlKeyboard,
        wl_output::{Transform as OutputTransform, WlOutput},
        wl_pointer::WlPointer,
        wl_seat::WlSeat,
        wl_shm,
        wl_surface::WlSurface,
    },
    Connection, EventQueue, QueueHandle,
};

use crate::{
    capture::KwinScreen,
    config::CaptureConfig,
    geometry::{perimeters, Pos, Rect, Size},
    handoff::{CaptureSurface, CaptureSurfaces, SourceIdReceiver, SurfaceLink, SurfaceReporter},
    interaction::InteractionController,
    render::{draw_text, text_width},
    scan::{RqrrDecoder, Scanner},
    session::CaptureSession,
};

pub const CANCEL_LABEL: &str = "Click ESC or press here to cancel scanning";
const CANCEL_BAR_HEIGHT: u32 = 26;
const CANCEL_PADDING: u32 = 5;
const BRACKET_LENGTH: u32 = 16;
const BRACKET_THICKNESS: u32 = 4;
/// Longest sleep between checks of the close request.
const IDLE_POLL: Duration = Duration::from_millis(100);

type Session = CaptureSession<KwinScreen, RqrrDecoder>;

/// Opens capture surfaces on their own threads.
#[derive(Debug, Clone, Default)]
pub struct WaylandSurfaces {
    config: CaptureConfig,
}

impl WaylandSurfaces {
    pub fn new(config: CaptureConfig) -> Self {
        Self { config }
    }
}

impl CaptureSurfaces for WaylandSurfaces {
    fn open(&mut self, link: SurfaceLink) -> Result<Box<dyn CaptureSurface>> {
        let closing = Arc::new(AtomicBool::new(false));
        let thread = thread::Builder::new()
            .name("capture-surface".into())
            .spawn({
                let closing = closing.clone();
                let config = self.config.clone();
                move || run(link, config, closing)
            })
            .context("failed to spawn capture surface")?;
        Ok(Box::new(WaylandCaptureSurface {
            closing,
            thread: Some(thread),
        }))
    }
}

struct WaylandCaptureSurface {
    closing: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureSurface for WaylandCaptureSurface {
    fn close(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("capture surface thread panicked");
            }
        }
    }
}

fn run(link: SurfaceLink, config: CaptureConfig, closing: Arc<AtomicBool>) {
    let SurfaceLink { source, reporter } = link;
    let id = reporter.id();
    let mut reporter = Some(reporter);
    if let Err(err) = serve(source, &mut reporter, &config, &closing) {
        error!("capture surface {id:?} failed: {err:#}");
        if let Some(reporter) = reporter.take() {
            reporter.load_failed(format!("{err:#}"));
        }
    }
}

/// Corner marks of the selection, 8 bars sitting just outside it.
pub fn brackets(rect: Rect) -> [Rect; 8] {
    let (len, thick) = (BRACKET_LENGTH as i32, BRACKET_THICKNESS as i32);
    let (l, t, r, b) = (rect.left() - thick, rect.top() - thick, rect.right(), rect.bottom());
    let (far_x, far_y) = (rect.right() + thick - len, rect.bottom() + thick - len);
    let v = |x, y| Rect::new(x, y, BRACKET_THICKNESS, BRACKET_LENGTH);
    let h = |x, y| Rect::new(x, y, BRACKET_LENGTH, BRACKET_THICKNESS);
    [
        v(l, t),
        h(l, t),
        v(r, t),
        h(far_x, t),
        v(l, far_y),
        h(l, b),
        v(r, far_y),
        h(far_x, b),
    ]
}

pub fn cancel_bar(viewport: Size) -> Rect {
    let height = CANCEL_BAR_HEIGHT.min(viewport.height);
    Rect::new(0, (viewport.height - height) as i32, viewport.width, height)
}

pub fn cancel_button(viewport: Size) -> Rect {
    let bar = cancel_bar(viewport);
    let width = text_width(CANCEL_LABEL, 1) + CANCEL_PADDING * 2;
    let height = 8 + CANCEL_PADDING * 2;
    Rect::new(
        (viewport.width as i32 - width as i32) / 2,
        bar.y + (bar.height as i32 - height as i32) / 2,
        width,
        height,
    )
}

/// Paints the overlay for the current selection.
pub fn paint(pixmap: &mut Pixmap, selection: Rect, missed: bool) {
    let viewport = Size::new(pixmap.width(), pixmap.height());
    let fill = |pixmap: &mut Pixmap, rect: Rect, color: Color| {
        if let Some(rect) = rect.to_skia() {
            let mut paint = Paint::default();
            paint.set_color(color);
            pixmap.fill_rect(rect, &paint, Transform::identity(), None);
        }
    };

    pixmap.fill(Color::TRANSPARENT);
    for panel in perimeters(selection, viewport).iter() {
        fill(pixmap, *panel, Color::from_rgba8(0, 0, 0, 77));
    }
    fill(pixmap, selection, Color::from_rgba8(255, 255, 255, 51));
    let bracket = if missed {
        Color::from_rgba8(0x44, 0xcc, 0x11, 0x80)
    } else {
        Color::from_rgba8(0x44, 0xcc, 0x11, 0xff)
    };
    for mark in brackets(selection) {
        fill(pixmap, mark, bracket);
    }

    fill(pixmap, cancel_bar(viewport), Color::from_rgba8(0, 0, 0, 51));
    let button = cancel_button(viewport);
    let border = Color::from_rgba8(0x99, 0x99, 0x99, 0xff);
    fill(pixmap, Rect::new(button.x, button.y, button.width, 1), border);
    fill(pixmap, Rect::new(button.x, button.bottom() - 1, button.width, 1), border);
    fill(pixmap, Rect::new(button.x, button.y, 1, button.height), border);
    fill(pixmap, Rect::new(button.right() - 1, button.y, 1, button.height), border);
    let white = PremultipliedColorU8::from_rgba(0xff, 0xff, 0xff, 0xff).unwrap_or(PremultipliedColorU8::TRANSPARENT);
    draw_text(
        pixmap,
        button.x + CANCEL_PADDING as i32,
        button.y + CANCEL_PADDING as i32,
        CANCEL_LABEL,
        1,
        white,
    );
}

struct LayerContext {
    layer: LayerSurface,
    size: Size,
    pixmap: Option<Pixmap>,
}

struct CaptureState {
    registry_state: RegistryState,
    shm: Shm,
    output_state: OutputState,
    seat_state: SeatState,

    pool: Option<SlotPool>,
    layer: Option<LayerContext>,
    keyboard: Option<WlKeyboard>,
    pointer: Option<WlPointer>,

    session: Option<Session>,
    exit: bool,
    dirty: bool,
    frame_pending: bool,
}

impl CaptureState {
    pub fn draw(&mut self, qh: &QueueHandle<Self>) -> Result<()> {
        let (Some(ctx), Some(session)) = (self.layer.as_mut(), self.session.as_ref()) else {
            return Ok(());
        };
        let Some(pixmap) = ctx.pixmap.as_mut() else {
            return Ok(());
        };
        let (width, height) = (ctx.size.width, ctx.size.height);
        if self.pool.is_none() {
            self.pool = Some(SlotPool::new((width * height * 4) as usize, &self.shm)?);
        }
        let Some(pool) = self.pool.as_mut() else {
            return Ok(());
        };
        let (buffer, canvas) = pool.create_buffer(
            width as i32,
            height as i32,
            width as i32 * 4,
            wl_shm::Format::Argb8888,
        )?;

        paint(pixmap, session.selection(), session.scanner().last_missed());
        // argb8888 is bgra in memory
        for (dst, src) in canvas.chunks_exact_mut(4).zip(pixmap.data().chunks_exact(4)) {
            dst.copy_from_slice(&[src[2], src[1], src[0], src[3]]);
        }

        let surface = ctx.layer.wl_surface();
        surface.damage_buffer(0, 0, width as i32, height as i32);
        buffer.attach_to(surface)?;

        // request the next frame callback before committing
        surface.frame(qh, surface.clone());
        surface.commit();
        self.dirty = false;
        self.frame_pending = true;
        Ok(())
    }

    fn finish_if_done(&mut self) {
        if self.session.as_ref().is_some_and(|s| s.is_finished()) {
            self.exit = true;
        }
    }

    fn cancel(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.cancel();
        }
        self.exit = true;
    }
}

delegate_registry!(CaptureState);
impl ProvidesRegistryState for CaptureState {
    fn registry(&mut self) -> &mut RegistryState {
        &mut self.registry_state
    }
    registry_handlers![OutputState, SeatState];
}
delegate_compositor!(CaptureState);
impl CompositorHandler for CaptureState {
    fn scale_factor_changed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &WlSurface,
        _new_factor: i32,
    ) {
    }

    fn transform_changed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &WlSurface,
        _new_transform: OutputTransform,
    ) {
    }

    fn frame(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, _surface: &WlSurface, _time: u32) {
        self.frame_pending = false;
    }
}
delegate_output!(CaptureState);
impl OutputHandler for CaptureState {
    fn output_state(&mut self) -> &mut OutputState {
        &mut self.output_state
    }

    fn new_output(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, _output: WlOutput) {}

    fn update_output(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, _output: WlOutput) {}

    fn output_destroyed(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, _output: WlOutput) {}
}

delegate_shm!(CaptureState);
impl ShmHandler for CaptureState {
    fn shm_state(&mut self) -> &mut Shm {
        &mut self.shm
    }
}
delegate_layer!(CaptureState);
impl LayerShellHandler for CaptureState {
    fn closed(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, _layer: &LayerSurface) {
        debug!("capture layer closed by the compositor");
        self.cancel();
    }

    fn configure(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _layer: &LayerSurface,
        configure: LayerSurfaceConfigure,
        _serial: u32,
    ) {
        let Some(ctx) = self.layer.as_mut() else {
            return;
        };
        let (w, h) = configure.new_size;
        if w > 0 && h > 0 {
            ctx.size = Size::new(w, h);
        }
        if ctx.pixmap.as_ref().map(|p| (p.width(), p.height())) != Some((ctx.size.width, ctx.size.height)) {
            ctx.pixmap = Pixmap::new(ctx.size.width, ctx.size.height);
        }
        debug!("capture layer configured at {}x{}", ctx.size.width, ctx.size.height);
        if let Some(session) = self.session.as_mut() {
            session.set_viewport(ctx.size);
        }
        self.dirty = true;
        self.frame_pending = false;
    }
}
delegate_seat!(CaptureState);
impl SeatHandler for CaptureState {
    fn seat_state(&mut self) -> &mut SeatState {
        &mut self.seat_state
    }

    fn new_seat(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, _seat: WlSeat) {}

    fn new_capability(
        &mut self,
        _conn: &Connection,
        qh: &QueueHandle<Self>,
        seat: WlSeat,
        capability: Capability,
    ) {
        if capability == Capability::Keyboard && self.keyboard.is_none() {
            match self.seat_state.get_keyboard(qh, &seat, None) {
                Ok(keyboard) => self.keyboard = Some(keyboard),
                Err(err) => error!("failed to create keyboard: {err}"),
            }
        }
        if capability == Capability::Pointer && self.pointer.is_none() {
            match self.seat_state.get_pointer(qh, &seat) {
                Ok(pointer) => self.pointer = Some(pointer),
                Err(err) => error!("failed to create pointer: {err}"),
            }
        }
    }

    fn remove_capability(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _seat: WlSeat,
        capability: Capability,
    ) {
        if capability == Capability::Keyboard {
            if let Some(keyboard) = self.keyboard.take() {
                debug!("unset keyboard capability");
                keyboard.release();
            }
        }
        if capability == Capability::Pointer {
            if let Some(pointer) = self.pointer.take() {
                debug!("unset pointer capability");
                pointer.release();
            }
        }
    }

    fn remove_seat(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, _seat: WlSeat) {}
}

delegate_keyboard!(CaptureState);
impl KeyboardHandler for CaptureState {
    fn enter(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _keyboard: &WlKeyboard,
        _surface: &WlSurface,
        _serial: u32,
        _raw: &[u32],
        _keysyms: &[Keysym],
    ) {
    }

    fn leave(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _keyboard: &WlKeyboard,
        _surface: &WlSurface,
        _serial: u32,
    ) {
    }

    fn press_key(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _keyboard: &WlKeyboard,
        _serial: u32,
        event: KeyEvent,
    ) {
        if event.keysym == Keysym::Escape {
            self.cancel();
        }
    }

    fn release_key(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _keyboard: &WlKeyboard,
        _serial: u32,
        _event: KeyEvent,
    ) {
    }

    fn update_modifiers(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _keyboard: &WlKeyboard,
        _serial: u32,
        _modifiers: Modifiers,
    ) {
    }
}
delegate_pointer!(CaptureState);
impl PointerHandler for CaptureState {
    fn pointer_frame(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _pointer: &WlPointer,
        events: &[PointerEvent],
    ) {
        use PointerEventKind::*;
        let Some(viewport) = self.session.as_ref().map(|s| s.viewport()) else {
            return;
        };
        let now = Instant::now();
        for event in events {
            let pos = Pos::new(event.position.0.floor() as i32, event.position.1.floor() as i32);
            let Some(session) = self.session.as_mut() else {
                return;
            };
            match event.kind {
                Motion { .. } => session.pointer_move(pos, now),
                Leave { .. } => session.pointer_leave(now),
                Press { button, .. } if button == BTN_LEFT => {
                    if cancel_button(viewport).contains(pos) {
                        self.cancel();
                        return;
                    }
                    session.pointer_down(pos, now);
                }
                Release { button, .. } if button == BTN_LEFT => session.pointer_up(now),
                _ => continue,
            }
            self.dirty = true;
            self.finish_if_done();
            if self.exit {
                return;
            }
        }
    }
}

/// One round of the event loop: dispatch queued events, then sleep on the
/// connection until something arrives or `timeout` passes.
fn dispatch_timeout(
    event_queue: &mut EventQueue<CaptureState>,
    state: &mut CaptureState,
    timeout: Duration,
) -> Result<()> {
    event_queue.dispatch_pending(state)?;
    event_queue.flush()?;
    if let Some(guard) = event_queue.prepare_read() {
        let mut pfd = libc::pollfd {
            fd: guard.connection_fd().as_fd().as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ms = timeout.as_millis().min(c_int::MAX as u128) as c_int;
        let ready = unsafe { libc::poll(&mut pfd, 1, ms) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err.into());
            }
        } else if ready > 0 {
            match guard.read() {
                Ok(_) => {}
                Err(WaylandError::Io(err)) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err.into()),
            }
        }
    }
    event_queue.dispatch_pending(state)?;
    Ok(())
}

fn serve(
    source: SourceIdReceiver,
    reporter: &mut Option<SurfaceReporter>,
    config: &CaptureConfig,
    closing: &AtomicBool,
) -> Result<()> {
    let conn = Connection::connect_to_env()?;
    let (globals, mut event_queue) = registry_queue_init::<CaptureState>(&conn)?;
    let qh = event_queue.handle();

    let compositor = CompositorState::bind(&globals, &qh)?;
    let layer_shell = LayerShell::bind(&globals, &qh)?;
    let shm = Shm::bind(&globals, &qh)?;

    let mut state = CaptureState {
        registry_state: RegistryState::new(&globals),
        shm,
        output_state: OutputState::new(&globals, &qh),
        seat_state: SeatState::new(&globals, &qh),

        pool: None,
        layer: None,
        keyboard: None,
        pointer: None,

        session: None,
        exit: false,
        dirty: false,
        frame_pending: false,
    };
    // get output
    event_queue.roundtrip(&mut state)?;
    event_queue.roundtrip(&mut state)?;

    reporter.as_ref().context("capture surface reported twice")?.ready();
    let source_id = match block_on(source.request()) {
        Ok(id) => id,
        Err(err) => {
            debug!("capture surface dismissed before it got a source: {err}");
            return Ok(());
        }
    };
    debug!("capture surface got source {source_id}");

    let (output, size) = state
        .output_state
        .outputs()
        .find_map(|output| {
            let info = state.output_state.info(&output)?;
            (info.name.as_deref() == Some(source_id.as_str())).then(|| {
                let size = info
                    .logical_size
                    .map(|(w, h)| Size::new(w.max(0) as u32, h.max(0) as u32))
                    .unwrap_or_default();
                (output, size)
            })
        })
        .with_context(|| format!("output {source_id} is gone"))?;

    let frames = KwinScreen::open(&source_id)?;
    let mut session = CaptureSession::new(
        source_id.clone(),
        frames,
        Scanner::new(RqrrDecoder, config.scan_interval),
        InteractionController::new(config.start, config.end, config.min_size),
        reporter.take().context("capture surface reported twice")?,
    );
    session.set_viewport(size);
    state.session = Some(session);

    // init layer
    let surface = compositor.create_surface(&qh);
    let layer = layer_shell.create_layer_surface(&qh, surface, Layer::Overlay, Some("qrsnip"), Some(&output));
    layer.set_anchor(Anchor::TOP | Anchor::BOTTOM | Anchor::LEFT | Anchor::RIGHT);
    layer.set_size(size.width, size.height);
    layer.set_exclusive_zone(-1);
    layer.set_keyboard_interactivity(KeyboardInteractivity::OnDemand);
    layer.commit();
    state.layer = Some(LayerContext {
        layer,
        size,
        pixmap: None,
    });

    let result = event_loop(&mut event_queue, &mut state, &qh, closing);
    if let Some(session) = state.session.as_mut() {
        match &result {
            Err(err) => session.fail(format!("{err:#}")),
            Ok(()) if !session.is_finished() => session.cancel(),
            Ok(()) => {}
        }
    }
    result
}

fn event_loop(
    event_queue: &mut EventQueue<CaptureState>,
    state: &mut CaptureState,
    qh: &QueueHandle<CaptureState>,
    closing: &AtomicBool,
) -> Result<()> {
    while !state.exit {
        if closing.load(Ordering::SeqCst) {
            debug!("capture surface closed by the coordinator");
            break;
        }
        if let Some(session) = state.session.as_mut() {
            let was_missed = session.scanner().last_missed();
            session.tick(Instant::now());
            if session.scanner().last_missed() != was_missed {
                state.dirty = true;
            }
        }
        state.finish_if_done();
        if state.exit {
            break;
        }
        if state.dirty && !state.frame_pending {
            state.draw(qh)?;
        }

        let timeout = state
            .session
            .as_ref()
            .and_then(|s| s.scanner().timer().timeout(Instant::now()))
            .map_or(IDLE_POLL, |t| t.min(IDLE_POLL));
        trace!("waiting up to {timeout:?}");
        dispatch_timeout(event_queue, state, timeout)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_brackets_hug_corners() {
        let marks = brackets(Rect::new(300, 300, 250, 250));
        assert_eq!(marks[0], Rect::new(296, 296, 4, 16));
        assert_eq!(marks[1], Rect::new(296, 296, 16, 4));
        assert_eq!(marks[3], Rect::new(538, 296, 16, 4));
        assert_eq!(marks[7], Rect::new(538, 550, 16, 4));
        for mark in marks {
            assert!(mark.intersect(&Rect::new(300, 300, 250, 250)).is_none());
        }
    }

    #[test]
    fn test_cancel_button_in_bar() {
        let viewport = Size::new(1920, 1080);
        let bar = cancel_bar(viewport);
        let button = cancel_button(viewport);
        assert_eq!(bar.bottom(), 1080);
        assert!(bar.intersect(&button) == Some(button));
        assert!(button.contains(Pos::new(960, 1067)));
    }

    #[test]
    fn test_paint_dims_outside_only() {
        let mut pixmap = Pixmap::new(800, 600).unwrap();
        let selection = Rect::new(300, 200, 250, 250);
        paint(&mut pixmap, selection, false);
        let outside = pixmap.pixel(50, 50).unwrap();
        let inside = pixmap.pixel(400, 300).unwrap();
        let bracket = pixmap.pixel(297, 197).unwrap();
        assert_eq!(outside.alpha(), 77);
        assert_eq!(inside.alpha(), 51);
        assert_eq!(bracket.alpha(), 255);
    }
}

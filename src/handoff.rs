//! One-shot request/response exchange between the coordinator and the
//! capture surface.
//!
//! The coordinator opens a capture surface per request, hands it the
//! capture-source id once the surface reports ready, and waits for exactly
//! one terminal event: a scanned code or a cancellation. Each request gets its
//! own channel tagged with the surface's [`SurfaceId`]; anything from a
//! surface other than the current one is dropped. A surface that goes away
//! without a terminal event closes the channel and fails the request.

use futures::{
    channel::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    StreamExt,
};
use itertools::Itertools;
use log::{debug, error, trace, warn};

use crate::{
    error::{HandoffError, Result},
    scan::ScannedQrInfo,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub u64);

#[derive(Debug)]
pub enum SurfaceEvent {
    Ready,
    Scanned(ScannedQrInfo),
    Canceled,
    LoadFailed(String),
}

#[derive(Debug)]
pub struct SurfaceMessage {
    pub sender: SurfaceId,
    pub event: SurfaceEvent,
}

/// Capture surface side of the event channel.
///
/// Terminal events consume the reporter, a surface can't send two.
#[derive(Debug)]
pub struct SurfaceReporter {
    id: SurfaceId,
    tx: UnboundedSender<SurfaceMessage>,
}

impl SurfaceReporter {
    pub fn new(id: SurfaceId, tx: UnboundedSender<SurfaceMessage>) -> Self {
        Self { id, tx }
    }

    #[inline]
    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn ready(&self) {
        self.send(SurfaceEvent::Ready);
    }

    pub fn scanned(self, info: ScannedQrInfo) {
        self.send(SurfaceEvent::Scanned(info));
    }

    pub fn canceled(self) {
        self.send(SurfaceEvent::Canceled);
    }

    pub fn load_failed(self, reason: String) {
        self.send(SurfaceEvent::LoadFailed(reason));
    }

    fn send(&self, event: SurfaceEvent) {
        let message = SurfaceMessage { sender: self.id, event };
        if let Err(err) = self.tx.unbounded_send(message) {
            warn!("coordinator is gone, dropping {:?}", err.into_inner().event);
        }
    }
}

/// Creates the single-value slot carrying the capture-source id.
///
/// A value delivered before anyone asks is kept until the first request.
pub fn source_slot() -> (SourceIdSender, SourceIdReceiver) {
    let (tx, rx) = oneshot::channel();
    (SourceIdSender(tx), SourceIdReceiver(rx))
}

#[derive(Debug)]
pub struct SourceIdSender(oneshot::Sender<String>);

impl SourceIdSender {
    pub fn deliver(self, id: String) {
        if self.0.send(id).is_err() {
            debug!("capture surface went away before its source id arrived");
        }
    }
}

#[derive(Debug)]
pub struct SourceIdReceiver(oneshot::Receiver<String>);

impl SourceIdReceiver {
    pub async fn request(mut self) -> Result<String> {
        match self.0.try_recv() {
            Ok(Some(id)) => {
                trace!("source id {id} was already delivered");
                return Ok(id);
            }
            Ok(None) => {}
            Err(_) => return Err(HandoffError::SourceUnavailable),
        }
        self.0.await.map_err(|_| HandoffError::SourceUnavailable)
    }
}

/// Everything a capture surface gets at creation.
#[derive(Debug)]
pub struct SurfaceLink {
    pub source: SourceIdReceiver,
    pub reporter: SurfaceReporter,
}

pub trait HostSurface {
    fn hide(&mut self);
    fn show(&mut self);
}

pub trait CaptureSurface {
    /// Tears the surface down. Blocks until it is gone.
    fn close(&mut self);
}

pub trait CaptureSurfaces {
    fn open(&mut self, link: SurfaceLink) -> anyhow::Result<Box<dyn CaptureSurface>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSource {
    pub id: String,
    pub name: String,
}

pub trait SourceProvider {
    fn sources(&mut self) -> anyhow::Result<Vec<CaptureSource>>;
}

pub fn first_named(sources: &[CaptureSource]) -> Option<&CaptureSource> {
    sources.iter().find(|source| !source.name.is_empty())
}

struct PendingHandoff {
    id: SurfaceId,
    source: Option<SourceIdSender>,
}

pub struct Coordinator {
    host: Option<Box<dyn HostSurface>>,
    surfaces: Box<dyn CaptureSurfaces>,
    sources: Box<dyn SourceProvider>,
    last_id: u64,
}

impl Coordinator {
    pub fn new(surfaces: Box<dyn CaptureSurfaces>, sources: Box<dyn SourceProvider>) -> Self {
        Self {
            host: None,
            surfaces,
            sources,
            last_id: 0,
        }
    }

    pub fn register_host(&mut self, host: Box<dyn HostSurface>) {
        self.host = Some(host);
    }

    /// Runs one capture session. `Ok(None)` means the user canceled.
    pub async fn request_capture(&mut self) -> Result<Option<ScannedQrInfo>> {
        self.host.as_mut().ok_or(HandoffError::NoHostSurface)?.hide();

        self.last_id += 1;
        let id = SurfaceId(self.last_id);
        let (source_tx, source_rx) = source_slot();
        // the reporter holds the only sender, so a surface that dies ends the stream
        let (events_tx, mut events) = mpsc::unbounded();
        let link = SurfaceLink {
            source: source_rx,
            reporter: SurfaceReporter::new(id, events_tx),
        };
        debug!("opening capture surface {id:?}");
        let mut surface = match self.surfaces.open(link) {
            Ok(surface) => surface,
            Err(err) => {
                error!("failed to open capture surface: {err:#}");
                self.show_host();
                return Err(HandoffError::SurfaceLoad(format!("{err:#}")));
            }
        };

        let mut pending = PendingHandoff {
            id,
            source: Some(source_tx),
        };
        let outcome = self.resolve(&mut events, &mut pending).await;
        // a surface still waiting for its source id must see the slot close
        drop(pending);
        surface.close();
        self.show_host();
        debug!("capture {id:?} resolved: {outcome:?}");
        outcome
    }

    async fn resolve(
        &mut self,
        events: &mut UnboundedReceiver<SurfaceMessage>,
        pending: &mut PendingHandoff,
    ) -> Result<Option<ScannedQrInfo>> {
        while let Some(SurfaceMessage { sender, event }) = events.next().await {
            if sender != pending.id {
                trace!("ignoring {event:?} from stale surface {sender:?}");
                continue;
            }
            match event {
                SurfaceEvent::Ready => {
                    let Some(slot) = pending.source.take() else {
                        trace!("surface {sender:?} reported ready twice");
                        continue;
                    };
                    let sources = self.sources.sources().unwrap_or_else(|err| {
                        error!("failed to enumerate capture sources: {err:#}");
                        Vec::new()
                    });
                    debug!("capture sources: [{}]", sources.iter().map(|s| &s.id).join(", "));
                    let Some(source) = first_named(&sources) else {
                        return Err(HandoffError::NoCaptureSource);
                    };
                    debug!("selected capture source {} ({})", source.id, source.name);
                    slot.deliver(source.id.clone());
                }
                SurfaceEvent::Scanned(info) => return Ok(Some(info)),
                SurfaceEvent::Canceled => return Ok(None),
                SurfaceEvent::LoadFailed(reason) => return Err(HandoffError::SurfaceLoad(reason)),
            }
        }
        warn!("capture surface {:?} went away without reporting", pending.id);
        Err(HandoffError::SurfaceLoad("capture surface exited without a result".into()))
    }

    fn show_host(&mut self) {
        if let Some(host) = self.host.as_mut() {
            host.show();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::{CodeLocation, DecodedCode};
    use futures::executor::block_on;
    use std::{
        sync::{Arc, Mutex},
        thread::{self, JoinHandle},
    };

    fn info(data: &str) -> ScannedQrInfo {
        ScannedQrInfo {
            code: DecodedCode {
                data: data.into(),
                version: 1,
                location: CodeLocation::default(),
            },
            width: 1,
            height: 1,
            image: vec![0; 4],
        }
    }

    #[derive(Default, Clone)]
    struct Log(Arc<Mutex<Vec<String>>>);
    impl Log {
        fn push(&self, entry: impl Into<String>) {
            self.0.lock().unwrap().push(entry.into());
        }
        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    struct FakeHost(Log);
    impl HostSurface for FakeHost {
        fn hide(&mut self) {
            self.0.push("hide");
        }
        fn show(&mut self) {
            self.0.push("show");
        }
    }

    struct FakeSources(Vec<CaptureSource>);
    impl SourceProvider for FakeSources {
        fn sources(&mut self) -> anyhow::Result<Vec<CaptureSource>> {
            Ok(self.0.clone())
        }
    }

    fn source(id: &str, name: &str) -> CaptureSource {
        CaptureSource {
            id: id.into(),
            name: name.into(),
        }
    }

    type Script = Arc<dyn Fn(SurfaceLink, Log) + Send + Sync>;

    /// Runs `script` on its own thread for every opened surface.
    struct FakeSurfaces {
        script: Script,
        log: Log,
        fail_open: bool,
    }
    struct FakeSurface {
        thread: Option<JoinHandle<()>>,
        log: Log,
    }
    impl CaptureSurface for FakeSurface {
        fn close(&mut self) {
            if let Some(thread) = self.thread.take() {
                if thread.join().is_err() {
                    self.log.push("panicked");
                }
            }
            self.log.push("close");
        }
    }
    impl CaptureSurfaces for FakeSurfaces {
        fn open(&mut self, link: SurfaceLink) -> anyhow::Result<Box<dyn CaptureSurface>> {
            if self.fail_open {
                anyhow::bail!("no display");
            }
            let script = self.script.clone();
            let log = self.log.clone();
            let thread = thread::spawn(move || script(link, log));
            Ok(Box::new(FakeSurface {
                thread: Some(thread),
                log: self.log.clone(),
            }))
        }
    }

    fn coordinator(sources: Vec<CaptureSource>, script: Script, log: &Log) -> Coordinator {
        let mut coordinator = Coordinator::new(
            Box::new(FakeSurfaces {
                script,
                log: log.clone(),
                fail_open: false,
            }),
            Box::new(FakeSources(sources)),
        );
        coordinator.register_host(Box::new(FakeHost(log.clone())));
        coordinator
    }

    #[test]
    fn test_no_host_surface() {
        let mut coordinator = Coordinator::new(
            Box::new(FakeSurfaces {
                script: Arc::new(|_, _| {}),
                log: Log::default(),
                fail_open: false,
            }),
            Box::new(FakeSources(vec![])),
        );
        assert_eq!(block_on(coordinator.request_capture()), Err(HandoffError::NoHostSurface));
    }

    #[test]
    fn test_scanned_result_delivered_once() {
        let log = Log::default();
        let script: Script = Arc::new(|link, log| {
            link.reporter.ready();
            let id = block_on(link.source.request()).unwrap();
            log.push(format!("source {id}"));
            let tx = link.reporter.tx.clone();
            let sender = link.reporter.id();
            link.reporter.scanned(info("first"));
            // a second terminal event must go nowhere
            tx.unbounded_send(SurfaceMessage {
                sender,
                event: SurfaceEvent::Scanned(info("second")),
            })
            .unwrap();
            tx.unbounded_send(SurfaceMessage {
                sender,
                event: SurfaceEvent::Canceled,
            })
            .unwrap();
        });
        let mut coordinator =
            coordinator(vec![source("HDMI-A-1", ""), source("DP-1", "Dell U2720Q")], script, &log);

        let result = block_on(coordinator.request_capture()).unwrap();
        assert_eq!(result.unwrap().code.data, "first");
        assert_eq!(log.entries(), vec!["hide", "source DP-1", "close", "show"]);

        // a later session ignores the leftovers of the first one
        let result = block_on(coordinator.request_capture()).unwrap();
        assert_eq!(result.unwrap().code.data, "first");
        assert_eq!(coordinator.last_id, 2);
    }

    #[test]
    fn test_stale_sender_is_ignored() {
        let log = Log::default();
        let script: Script = Arc::new(|link, _| {
            let stale = SurfaceId(link.reporter.id().0 + 100);
            let tx = link.reporter.tx.clone();
            tx.unbounded_send(SurfaceMessage {
                sender: stale,
                event: SurfaceEvent::Scanned(info("stale")),
            })
            .unwrap();
            link.reporter.ready();
            let _ = block_on(link.source.request());
            link.reporter.canceled();
        });
        let mut coordinator = coordinator(vec![source("DP-1", "Dell")], script, &log);
        assert_eq!(block_on(coordinator.request_capture()), Ok(None));
    }

    #[test]
    fn test_source_id_cached_before_request() {
        let log = Log::default();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<()>();
        let ready_rx = Arc::new(Mutex::new(ready_rx));
        let script: Script = Arc::new(move |link, log| {
            link.reporter.ready();
            // give the coordinator time to deliver before asking
            ready_rx.lock().unwrap().recv().ok();
            thread::sleep(std::time::Duration::from_millis(20));
            let id = block_on(link.source.request()).unwrap();
            log.push(format!("source {id}"));
            link.reporter.canceled();
        });
        let mut coordinator = coordinator(vec![source("DP-2", "LG")], script, &log);
        ready_tx.send(()).unwrap();
        assert_eq!(block_on(coordinator.request_capture()), Ok(None));
        assert!(log.entries().contains(&"source DP-2".to_string()));
    }

    #[test]
    fn test_no_named_source_rejects() {
        let log = Log::default();
        let script: Script = Arc::new(|link, log| {
            link.reporter.ready();
            if block_on(link.source.request()).is_err() {
                log.push("source dropped");
            }
        });
        let mut coordinator = coordinator(vec![source("DP-1", "")], script, &log);
        assert_eq!(
            block_on(coordinator.request_capture()),
            Err(HandoffError::NoCaptureSource)
        );
        assert_eq!(log.entries(), vec!["hide", "source dropped", "close", "show"]);
    }

    #[test]
    fn test_load_failure_rejects() {
        let log = Log::default();
        let script: Script = Arc::new(|link, _| {
            link.reporter.load_failed("no layer shell".into());
        });
        let mut coordinator = coordinator(vec![], script, &log);
        assert_eq!(
            block_on(coordinator.request_capture()),
            Err(HandoffError::SurfaceLoad("no layer shell".into()))
        );
        assert_eq!(log.entries(), vec!["hide", "close", "show"]);

        let mut coordinator = Coordinator::new(
            Box::new(FakeSurfaces {
                script: Arc::new(|_, _| {}),
                log: log.clone(),
                fail_open: true,
            }),
            Box::new(FakeSources(vec![])),
        );
        coordinator.register_host(Box::new(FakeHost(log.clone())));
        assert!(matches!(
            block_on(coordinator.request_capture()),
            Err(HandoffError::SurfaceLoad(_))
        ));
    }

    #[test]
    fn test_dropped_surface_rejects() {
        let log = Log::default();
        let script: Script = Arc::new(|link, _| {
            link.reporter.ready();
            let _ = block_on(link.source.request());
            drop(link.reporter);
        });
        let mut coordinator = coordinator(vec![source("DP-1", "Dell")], script, &log);
        assert!(matches!(
            block_on(coordinator.request_capture()),
            Err(HandoffError::SurfaceLoad(_))
        ));
        assert_eq!(log.entries(), vec!["hide", "close", "show"]);
    }

    #[test]
    fn test_panicked_surface_rejects() {
        let log = Log::default();
        let script: Script = Arc::new(|link, _| {
            link.reporter.ready();
            let _ = block_on(link.source.request());
            panic!("decoder blew up");
        });
        let mut coordinator = coordinator(vec![source("DP-1", "Dell")], script, &log);
        assert!(matches!(
            block_on(coordinator.request_capture()),
            Err(HandoffError::SurfaceLoad(_))
        ));
        assert_eq!(log.entries(), vec!["hide", "panicked", "close", "show"]);
    }

    #[test]
    fn test_source_slot_fast_path() {
        let (tx, rx) = source_slot();
        tx.deliver("DP-1".into());
        assert_eq!(block_on(rx.request()), Ok("DP-1".to_string()));

        let (tx, rx) = source_slot();
        drop(tx);
        assert_eq!(block_on(rx.request()), Err(HandoffError::SourceUnavailable));
    }
}

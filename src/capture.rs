use anyhow::{bail, Context, Result};
use futures::executor::block_on;
use image::RgbaImage;
use libc::{self, c_int};
use log::debug;
use std::{
    collections::HashMap,
    fs::File,
    future::Future,
    io::{self, Read},
    os::fd::{FromRawFd, OwnedFd},
};
use zbus::{
    proxy,
    zvariant::{Fd, OwnedValue, Value},
    Connection,
};

use crate::scan::FrameSource;

pub struct RawCaptured {
    pub width: u32,
    pub height: u32,
    pub scale: f64,
    /// RGBA, tightly packed.
    pub buf: Vec<u8>,
}

#[proxy(
    default_service = "org.kde.KWin.ScreenShot2",
    interface = "org.kde.KWin.ScreenShot2",
    default_path = "/org/kde/KWin/ScreenShot2"
)]
trait KWin {
    /// options:
    ///     include-decoration: bool
    ///     include-cursor: bool
    ///     native-resolution: bool
    fn capture_screen(
        &self,
        name: &str,
        options: HashMap<&str, &Value<'_>>,
        pipe: Fd<'_>,
    ) -> zbus::Result<HashMap<String, OwnedValue>>;
}

fn extract<T>(captured: &HashMap<String, OwnedValue>, key: &str) -> T
where
    T: Default + for<'a> TryFrom<&'a OwnedValue>,
{
    captured
        .get(key)
        .and_then(|v| T::try_from(v).ok())
        .unwrap_or_default()
}

async fn with_kwin<F, Fut>(conn: &Connection, f: F) -> Result<RawCaptured>
where
    F: FnOnce(Connection, OwnedFd) -> Fut,
    Fut: Future<Output = zbus::Result<HashMap<String, OwnedValue>>>,
{
    let mut fds: [c_int; 2] = [0; 2];
    let res = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if res != 0 {
        return Err(io::Error::last_os_error().into());
    }
    let mut reader = unsafe { File::from_raw_fd(fds[0]) };
    // consumed by the call, so our write end is closed once KWin answers
    let writer = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    let captured = f(conn.clone(), writer).await?;

    let owidth: u32 = extract(&captured, "width");
    let oheight: u32 = extract(&captured, "height");
    let ostride: u32 = extract(&captured, "stride");
    let oscale: f64 = extract(&captured, "scale");
    if owidth == 0 || oheight == 0 {
        bail!("empty capture");
    }
    let stride = (if ostride == 0 { owidth * 4 } else { ostride }) as usize;

    // read to buf
    let mut buf = Vec::with_capacity(stride * oheight as usize);
    reader.read_to_end(&mut buf)?;
    if buf.len() < stride * oheight as usize {
        bail!(
            "short capture: {} bytes for {owidth}x{oheight} (stride {stride})",
            buf.len()
        );
    }

    let row = owidth as usize * 4;
    let raw = RawCaptured {
        width: owidth,
        height: oheight,
        scale: oscale,
        buf: buf
            .chunks_exact(stride)
            .take(oheight as usize)
            .flat_map(|line| line[..row].chunks_exact(4))
            .flat_map(|bgra| [bgra[2], bgra[1], bgra[0], bgra[3]])
            .collect::<Vec<u8>>(),
    };

    Ok(raw)
}

pub async fn screen(conn: &Connection, name: &str) -> Result<RawCaptured> {
    let native_resolution = Value::from(true);
    let options = HashMap::from([("native-resolution", &native_resolution)]);
    let img = with_kwin(conn, |conn, fd| async move {
        let proxy = KWinProxy::new(&conn).await?;
        proxy.capture_screen(name, options, fd.into()).await
    })
    .await?;
    Ok(img)
}

/// A screen sampled through KWin, one screenshot per snapshot.
pub struct KwinScreen {
    name: String,
    conn: Connection,
    stopped: bool,
}

impl KwinScreen {
    /// Connects and takes a first screenshot to make sure the screen can be captured.
    pub fn open(name: &str) -> Result<Self> {
        let conn = block_on(Connection::session()).context("failed to connect to session bus")?;
        let first = block_on(screen(&conn, name))
            .with_context(|| format!("failed to capture screen {name}"))?;
        debug!(
            "frame source {name}: {}x{} at scale {}",
            first.width, first.height, first.scale
        );
        Ok(Self {
            name: name.to_owned(),
            conn,
            stopped: false,
        })
    }
}

impl FrameSource for KwinScreen {
    fn snapshot(&mut self) -> Result<RgbaImage> {
        if self.stopped {
            bail!("frame source {} is stopped", self.name);
        }
        let raw = block_on(screen(&self.conn, &self.name))?;
        RgbaImage::from_vec(raw.width, raw.height, raw.buf)
            .with_context(|| format!("bad frame size {}x{}", raw.width, raw.height))
    }

    fn stop(&mut self) -> Result<()> {
        if self.stopped {
            bail!("frame source {} is already stopped", self.name);
        }
        self.stopped = true;
        debug!("frame source {} stopped", self.name);
        Ok(())
    }
}

//! The client-side lifecycle of one toplevel window.
//!
//! A [`Session`] owns the connection and every protocol object derived
//! from it, and moves through a fixed sequence of phases: bind the
//! required globals, create the surface and its xdg-shell objects,
//! negotiate the first configure, dispatch until closed, tear down in
//! reverse creation order. All events are delivered inside the explicit
//! [`Session::dispatch`] and round-trip calls; nothing runs in the
//! background.

use std::ops::RangeInclusive;
use std::os::unix::net::UnixStream;

use thiserror::Error;
use tracing::{debug, info, trace, warn};
use wayland_client::globals::{
    registry_queue_init, BindError, GlobalError, GlobalList, GlobalListContents,
};
use wayland_client::protocol::wl_buffer::{self, WlBuffer};
use wayland_client::protocol::wl_compositor::WlCompositor;
use wayland_client::protocol::wl_registry::{self, WlRegistry};
use wayland_client::protocol::wl_shm::WlShm;
use wayland_client::protocol::wl_shm_pool::WlShmPool;
use wayland_client::protocol::wl_surface::WlSurface;
use wayland_client::{
    ConnectError, Connection, Dispatch, DispatchError, EventQueue, Proxy, QueueHandle,
};
use wayland_protocols::xdg::shell::client::xdg_surface::{self, XdgSurface};
use wayland_protocols::xdg::shell::client::xdg_toplevel::{self, XdgToplevel};
use wayland_protocols::xdg::shell::client::xdg_wm_base::{self, XdgWmBase};

#[cfg(feature = "egl")]
use wayland_client::protocol::wl_region::WlRegion;

#[cfg(feature = "egl")]
use crate::egl::GlWindow;
use crate::{shm, Color};

/// Version range accepted for `wl_compositor`; the window path needs v4.
const COMPOSITOR_VERSIONS: RangeInclusive<u32> = 4..=6;
/// Version range accepted for `wl_shm`.
const SHM_VERSIONS: RangeInclusive<u32> = 1..=1;
/// Version range accepted for `xdg_wm_base`.
const WM_BASE_VERSIONS: RangeInclusive<u32> = 1..=6;

/// A failure that ends the session.
///
/// Everything here is fatal; recoverable redraw problems are
/// [`RedrawError`] instead and never propagate out of the event loop.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The display service could not be reached.
    #[error("cannot connect to the wayland display")]
    Connect(#[from] ConnectError),
    /// The initial registry round-trip failed.
    #[error("global discovery failed")]
    Registry(#[from] GlobalError),
    /// A required global is missing, or advertised at an unusable version.
    #[error("required global {interface} is unavailable")]
    MissingGlobal {
        /// Interface name of the absent capability.
        interface: &'static str,
        /// What the registry offered instead.
        #[source]
        source: BindError,
    },
    /// The compositor refused one of the session's objects.
    #[error("the compositor refused a {interface} object: {message} (code {code})")]
    ObjectCreation {
        /// Interface of the object the error was posted on.
        interface: String,
        /// Protocol error code.
        code: u32,
        /// Compositor-supplied message.
        message: String,
    },
    /// The connection failed while dispatching events.
    #[error("lost the wayland connection")]
    Connection(#[from] DispatchError),
    /// The EGL window could not be brought up.
    #[cfg(feature = "egl")]
    #[error("egl setup failed")]
    Gl(#[from] crate::egl::GlError),
}

/// A failed redraw. The session keeps running on its previous frame.
#[derive(Debug, Error)]
pub enum RedrawError {
    /// Building the shared-memory buffer failed.
    #[error(transparent)]
    Buffer(#[from] shm::BufferError),
    /// The GL frame could not be presented.
    #[cfg(feature = "egl")]
    #[error(transparent)]
    Gl(#[from] crate::egl::GlError),
}

/// Lifecycle phase of a [`Session`]. Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Connected with all required globals bound; no window yet.
    Ready,
    /// Surface and toplevel objects exist.
    SurfaceCreated,
    /// Initial commit sent, waiting for the first configure.
    Negotiating,
    /// Mapped and dispatching events.
    Running,
    /// The compositor asked the window to close.
    Closing,
}

/// Which backend produces frames for the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Solid fill through a shared-memory buffer.
    #[default]
    Shm,
    /// GL clear through an EGL window surface.
    #[cfg(feature = "egl")]
    Gl,
}

/// Startup parameters for a [`Session`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Window title.
    pub title: String,
    /// Application id advertised to the window manager.
    pub app_id: String,
    /// Width used until the compositor proposes a size.
    pub width: u32,
    /// Height used until the compositor proposes a size.
    pub height: u32,
    /// Solid fill color.
    pub color: Color,
    /// Frame backend.
    pub backend: Backend,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            title: "wayland-smoke".into(),
            app_id: "wayland-smoke".into(),
            width: 480,
            height: 360,
            color: Color::BLUE,
            backend: Backend::default(),
        }
    }
}

/// The live frame source. `Gl` only exists once the window is open.
#[derive(Debug)]
enum Frame {
    Shm,
    #[cfg(feature = "egl")]
    Gl(GlWindow),
}

/// One window's worth of client state, from connect to disconnect.
#[derive(Debug)]
pub struct Session {
    conn: Connection,
    qh: QueueHandle<Session>,
    compositor: WlCompositor,
    shm: WlShm,
    wm_base: XdgWmBase,
    surface: Option<WlSurface>,
    xdg_surface: Option<XdgSurface>,
    toplevel: Option<XdgToplevel>,
    buffer: Option<WlBuffer>,
    frame: Frame,
    title: String,
    app_id: String,
    color: Color,
    backend: Backend,
    width: u32,
    height: u32,
    pending_size: Option<(u32, u32)>,
    configured: bool,
    phase: Phase,
}

impl Session {
    /// Connects to the display named by the environment and binds the
    /// globals a window needs.
    ///
    /// Returns the session together with its event queue; every blocking
    /// call on the session borrows the queue.
    pub fn connect(config: SessionConfig) -> Result<(Self, EventQueue<Self>), SessionError> {
        let conn = Connection::connect_to_env()?;
        Self::setup(conn, config)
    }

    /// Like [`Session::connect`], over an already-connected socket.
    pub fn from_socket(
        stream: UnixStream,
        config: SessionConfig,
    ) -> Result<(Self, EventQueue<Self>), SessionError> {
        let conn = Connection::from_socket(stream)?;
        Self::setup(conn, config)
    }

    fn setup(
        conn: Connection,
        config: SessionConfig,
    ) -> Result<(Self, EventQueue<Self>), SessionError> {
        debug!("connected, discovering globals");
        let (globals, queue) = registry_queue_init::<Session>(&conn)?;
        let qh = queue.handle();

        let compositor = bind_required::<WlCompositor>(&globals, &qh, COMPOSITOR_VERSIONS)?;
        let shm = bind_required::<WlShm>(&globals, &qh, SHM_VERSIONS)?;
        let wm_base = bind_required::<XdgWmBase>(&globals, &qh, WM_BASE_VERSIONS)?;
        info!(
            "bound wl_compositor v{}, wl_shm v{}, xdg_wm_base v{}",
            compositor.version(),
            shm.version(),
            wm_base.version()
        );

        let session = Session {
            conn,
            qh,
            compositor,
            shm,
            wm_base,
            surface: None,
            xdg_surface: None,
            toplevel: None,
            buffer: None,
            frame: Frame::Shm,
            title: config.title,
            app_id: config.app_id,
            color: config.color,
            backend: config.backend,
            width: config.width,
            height: config.height,
            pending_size: None,
            configured: false,
            phase: Phase::Ready,
        };
        Ok((session, queue))
    }

    /// Creates the surface and toplevel, then blocks until the window is
    /// mapped: the first configure acknowledged and a first frame drawn.
    pub fn open_window(&mut self, queue: &mut EventQueue<Self>) -> Result<(), SessionError> {
        if self.surface.is_some() {
            debug!("window already open");
            return Ok(());
        }
        debug!("opening a {:?} window at {}x{}", self.backend, self.width, self.height);

        let surface = self.compositor.create_surface(&self.qh, ());
        let xdg_surface = self.wm_base.get_xdg_surface(&surface, &self.qh, ());
        let toplevel = xdg_surface.get_toplevel(&self.qh, ());
        toplevel.set_title(self.title.clone());
        toplevel.set_app_id(self.app_id.clone());
        self.set_phase(Phase::SurfaceCreated);

        #[cfg(feature = "egl")]
        if self.backend == Backend::Gl {
            let region = self.compositor.create_region(&self.qh, ());
            region.add(0, 0, self.width as i32, self.height as i32);
            surface.set_opaque_region(Some(&region));
            region.destroy();
            let window =
                GlWindow::new(&self.conn, &surface, self.width as i32, self.height as i32)?;
            self.frame = Frame::Gl(window);
        }

        // no buffer yet, the first attach waits for the first configure
        surface.commit();
        self.surface = Some(surface);
        self.xdg_surface = Some(xdg_surface);
        self.toplevel = Some(toplevel);
        self.set_phase(Phase::Negotiating);

        queue.roundtrip(self).map_err(|err| self.setup_error(err))?;
        while self.phase == Phase::Negotiating {
            if self.configured {
                // the redraw from the configure handler failed, try again
                self.repaint();
                if self.phase != Phase::Negotiating {
                    break;
                }
            }
            queue.blocking_dispatch(self).map_err(|err| self.setup_error(err))?;
        }
        self.flush()?;
        Ok(())
    }

    /// Dispatches queued events, blocking until at least one arrives, and
    /// flushes whatever the handlers sent back.
    ///
    /// This is the session's only suspension point.
    pub fn dispatch(&mut self, queue: &mut EventQueue<Self>) -> Result<usize, SessionError> {
        let count = queue.blocking_dispatch(self).map_err(SessionError::Connection)?;
        self.flush()?;
        Ok(count)
    }

    /// Blocks dispatching events until the compositor closes the window.
    ///
    /// Returns `Ok` when a close request ended the loop; losing the
    /// connection is an error. Returns immediately unless a window is
    /// open.
    pub fn run(&mut self, queue: &mut EventQueue<Self>) -> Result<(), SessionError> {
        while self.phase == Phase::Running {
            self.dispatch(queue)?;
        }
        Ok(())
    }

    /// Draws a frame at the tracked size and commits it to the surface.
    ///
    /// Failures leave the previously attached frame in place; callers log
    /// them and keep the session alive.
    pub fn redraw(&mut self) -> Result<(), RedrawError> {
        let Some(surface) = self.surface.as_ref() else {
            debug!("redraw without a window");
            return Ok(());
        };
        let (width, height, color) = (self.width, self.height, self.color);
        match &mut self.frame {
            Frame::Shm => {
                let buffer = shm::solid_buffer(&self.shm, &self.qh, width, height, color)?;
                surface.attach(Some(&buffer), 0, 0);
                surface.damage(0, 0, width as i32, height as i32);
                surface.commit();
                // the old buffer goes only now, after its replacement is in
                if let Some(old) = self.buffer.replace(buffer) {
                    old.destroy();
                }
                trace!("committed a {width}x{height} shm frame");
            }
            #[cfg(feature = "egl")]
            Frame::Gl(window) => {
                window.resize(width as i32, height as i32);
                window.draw(color)?;
                trace!("swapped a {width}x{height} gl frame");
            }
        }
        Ok(())
    }

    /// Tears the session down in reverse creation order and disconnects.
    ///
    /// Dropping a `Session` without calling this closes the socket
    /// without the protocol-level destructors; compositors cope, but this
    /// is the polite path.
    pub fn shutdown(mut self) -> Result<(), SessionError> {
        self.set_phase(Phase::Closing);
        #[cfg(feature = "egl")]
        {
            // the EGL window wraps the wl_surface and must go first
            self.frame = Frame::Shm;
        }
        if let Some(buffer) = self.buffer.take() {
            buffer.destroy();
        }
        if let Some(toplevel) = self.toplevel.take() {
            toplevel.destroy();
        }
        if let Some(xdg_surface) = self.xdg_surface.take() {
            xdg_surface.destroy();
        }
        if let Some(surface) = self.surface.take() {
            surface.destroy();
        }
        self.wm_base.destroy();
        // wl_shm and wl_compositor have no destructor request; they are
        // released together with the registry when the connection drops
        self.flush()?;
        info!("disconnected");
        Ok(())
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The tracked window size, in pixels.
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!("session phase {:?} -> {:?}", self.phase, phase);
            self.phase = phase;
        }
    }

    /// Redraws, promoting a negotiating session once a frame made it up.
    fn repaint(&mut self) {
        match self.redraw() {
            Ok(()) => {
                if self.phase == Phase::Negotiating {
                    self.set_phase(Phase::Running);
                }
            }
            Err(err) => warn!("redraw failed, keeping the previous frame: {err}"),
        }
    }

    /// During window setup a dispatch failure usually means the
    /// compositor posted an error on one of the objects just created.
    fn setup_error(&self, err: DispatchError) -> SessionError {
        match self.conn.protocol_error() {
            Some(protocol_err) => SessionError::ObjectCreation {
                interface: protocol_err.object_interface,
                code: protocol_err.code,
                message: protocol_err.message,
            },
            None => SessionError::Connection(err),
        }
    }

    fn flush(&self) -> Result<(), SessionError> {
        self.conn
            .flush()
            .map_err(|err| SessionError::Connection(DispatchError::Backend(err)))
    }
}

fn bind_required<I>(
    globals: &GlobalList,
    qh: &QueueHandle<Session>,
    versions: RangeInclusive<u32>,
) -> Result<I, SessionError>
where
    I: Proxy + 'static,
    Session: Dispatch<I, ()>,
{
    globals.bind(qh, versions, ()).map_err(|source| SessionError::MissingGlobal {
        interface: I::interface().name,
        source,
    })
}

impl Dispatch<WlRegistry, GlobalListContents> for Session {
    fn event(
        _state: &mut Self,
        _registry: &WlRegistry,
        event: wl_registry::Event,
        _data: &GlobalListContents,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        // only the globals bound at setup matter to the session
        if let wl_registry::Event::Global { name, interface, version } = event {
            trace!("global {name}: {interface} v{version}");
        }
    }
}

impl Dispatch<XdgWmBase, ()> for Session {
    fn event(
        _state: &mut Self,
        wm_base: &XdgWmBase,
        event: xdg_wm_base::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let xdg_wm_base::Event::Ping { serial } = event {
            trace!("ping {serial}");
            wm_base.pong(serial);
        }
    }
}

impl Dispatch<XdgSurface, ()> for Session {
    fn event(
        state: &mut Self,
        xdg_surface: &XdgSurface,
        event: xdg_surface::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let xdg_surface::Event::Configure { serial } = event {
            // the ack must precede any commit drawn for this configure
            xdg_surface.ack_configure(serial);
            state.configured = true;
            if let Some((width, height)) = state.pending_size.take() {
                state.width = width;
                state.height = height;
            }
            debug!("configure serial {serial} acknowledged at {}x{}", state.width, state.height);
            state.repaint();
        }
    }
}

impl Dispatch<XdgToplevel, ()> for Session {
    fn event(
        state: &mut Self,
        _toplevel: &XdgToplevel,
        event: xdg_toplevel::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            xdg_toplevel::Event::Configure { width, height, .. } => {
                if width > 0 && height > 0 {
                    state.pending_size = Some((width as u32, height as u32));
                } else {
                    debug!("compositor leaves the window size to us");
                }
            }
            xdg_toplevel::Event::Close => {
                info!("close requested");
                state.set_phase(Phase::Closing);
            }
            _ => {}
        }
    }
}

impl Dispatch<WlBuffer, ()> for Session {
    fn event(
        _state: &mut Self,
        _buffer: &WlBuffer,
        event: wl_buffer::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        // replaced buffers are destroyed eagerly, so releases are informational
        if let wl_buffer::Event::Release = event {
            trace!("buffer released");
        }
    }
}

wayland_client::delegate_noop!(Session: ignore WlCompositor);
wayland_client::delegate_noop!(Session: ignore WlSurface);
wayland_client::delegate_noop!(Session: ignore WlShm);
wayland_client::delegate_noop!(Session: ignore WlShmPool);
#[cfg(feature = "egl")]
wayland_client::delegate_noop!(Session: ignore WlRegion);

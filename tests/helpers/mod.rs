#![allow(dead_code)]

//! An in-process display server for driving real sessions.
//!
//! The server half of a socket pair runs on a helper thread so the
//! session under test can use its normal blocking calls. Every request
//! the session sends is recorded in arrival order; tests assert on that
//! log. A command channel lets tests make the server send configures,
//! pings, or a close mid-session.

use std::fs::File;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use memmap2::Mmap;
use wayland_protocols::xdg::shell::server::{xdg_surface, xdg_toplevel, xdg_wm_base};
use wayland_server::backend::ClientData;
use wayland_server::protocol::{
    wl_buffer, wl_compositor, wl_region, wl_shm, wl_shm_pool, wl_surface,
};
use wayland_server::{
    Client, DataInit, Dispatch, Display, DisplayHandle, GlobalDispatch, New, Resource,
};

/// One request observed by the server, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    CreateSurface,
    GetXdgSurface,
    GetToplevel,
    SetTitle(String),
    SetAppId(String),
    Commit,
    AckConfigure(u32),
    /// Attach with the protocol id of the buffer, if any.
    Attach(Option<u32>),
    Damage { x: i32, y: i32, width: i32, height: i32 },
    CreatePool { size: i32 },
    CreateBuffer { id: u32, width: i32, height: i32, stride: i32, len: usize, uniform: Option<u32> },
    Pong(u32),
    DestroyBuffer(u32),
    DestroyToplevel,
    DestroyXdgSurface,
    DestroySurface,
    DestroyWmBase,
}

pub type RequestLog = Arc<Mutex<Vec<Recorded>>>;

/// What the server advertises and how it answers the initial commit.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Advertised `wl_compositor` version, or absent.
    pub compositor: Option<u32>,
    /// Advertised `wl_shm` version, or absent.
    pub shm: Option<u32>,
    /// Advertised `xdg_wm_base` version, or absent.
    pub wm_base: Option<u32>,
    /// (width, height, serial) of the configure sent after the initial
    /// commit. Zero sizes leave the choice to the client.
    pub initial_configure: (i32, i32, u32),
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            compositor: Some(4),
            shm: Some(1),
            wm_base: Some(1),
            initial_configure: (0, 0, 1),
        }
    }
}

/// Instructions tests hand to the server thread mid-session.
#[derive(Debug, Clone, Copy)]
pub enum ServerCmd {
    Configure { width: i32, height: i32, serial: u32 },
    Close,
    Ping { serial: u32 },
}

struct ServerState {
    log: RequestLog,
    initial_configure: (i32, i32, u32),
    sent_initial: bool,
    wm_base: Option<xdg_wm_base::XdgWmBase>,
    xdg_surface: Option<xdg_surface::XdgSurface>,
    toplevel: Option<xdg_toplevel::XdgToplevel>,
}

impl ServerState {
    fn record(&self, entry: Recorded) {
        self.log.lock().unwrap().push(entry);
    }

    fn apply(&mut self, cmd: ServerCmd) {
        match cmd {
            ServerCmd::Configure { width, height, serial } => {
                if let (Some(toplevel), Some(xdg_surface)) = (&self.toplevel, &self.xdg_surface) {
                    toplevel.configure(width, height, Vec::new());
                    xdg_surface.configure(serial);
                }
            }
            ServerCmd::Close => {
                if let Some(toplevel) = &self.toplevel {
                    toplevel.close();
                }
            }
            ServerCmd::Ping { serial } => {
                if let Some(wm_base) = &self.wm_base {
                    wm_base.ping(serial);
                }
            }
        }
    }
}

struct TestClientData;
impl ClientData for TestClientData {}

/// A display server on a helper thread, wired to one session.
pub struct TestServer {
    log: RequestLog,
    cmds: Sender<ServerCmd>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    /// Starts the server and returns the client end of its socket.
    pub fn spawn(config: ServerConfig) -> (TestServer, UnixStream) {
        let display = Display::<ServerState>::new().unwrap();
        let mut handle = display.handle();
        if let Some(version) = config.compositor {
            handle.create_global::<ServerState, wl_compositor::WlCompositor, _>(version, ());
        }
        if let Some(version) = config.shm {
            handle.create_global::<ServerState, wl_shm::WlShm, _>(version, ());
        }
        if let Some(version) = config.wm_base {
            handle.create_global::<ServerState, xdg_wm_base::XdgWmBase, _>(version, ());
        }

        let (client_stream, server_stream) = UnixStream::pair().unwrap();
        handle.insert_client(server_stream, Arc::new(TestClientData)).unwrap();

        let log: RequestLog = Arc::new(Mutex::new(Vec::new()));
        let (cmds, cmd_rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let state = ServerState {
            log: log.clone(),
            initial_configure: config.initial_configure,
            sent_initial: false,
            wm_base: None,
            xdg_surface: None,
            toplevel: None,
        };
        let thread = thread::spawn({
            let stop = stop.clone();
            move || serve(display, state, cmd_rx, stop)
        });

        (TestServer { log, cmds, stop, thread: Some(thread) }, client_stream)
    }

    /// Queues an instruction for the server thread.
    pub fn send(&self, cmd: ServerCmd) {
        self.cmds.send(cmd).unwrap();
    }

    /// Snapshot of everything recorded so far.
    pub fn records(&self) -> Vec<Recorded> {
        self.log.lock().unwrap().clone()
    }

    /// Blocks until `pred` holds on the log, panicking after a few seconds.
    pub fn wait_for(&self, what: &str, pred: impl Fn(&[Recorded]) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let records = self.records();
            if pred(&records) {
                return;
            }
            if Instant::now() > deadline {
                panic!("timed out waiting for {what}; server saw {records:#?}");
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn serve(
    mut display: Display<ServerState>,
    mut state: ServerState,
    cmds: Receiver<ServerCmd>,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Acquire) {
        while let Ok(cmd) = cmds.try_recv() {
            state.apply(cmd);
        }
        if display.dispatch_clients(&mut state).is_err() {
            break;
        }
        if display.flush_clients().is_err() {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

/// Index of the first record matching `pred`, panicking when absent.
pub fn index_of(records: &[Recorded], what: &str, pred: impl Fn(&Recorded) -> bool) -> usize {
    records
        .iter()
        .position(|r| pred(r))
        .unwrap_or_else(|| panic!("no {what} in {records:#?}"))
}

impl GlobalDispatch<wl_compositor::WlCompositor, ()> for ServerState {
    fn bind(
        _state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<wl_compositor::WlCompositor>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

impl GlobalDispatch<wl_shm::WlShm, ()> for ServerState {
    fn bind(
        _state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<wl_shm::WlShm>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        let shm = data_init.init(resource, ());
        shm.format(wl_shm::Format::Argb8888);
        shm.format(wl_shm::Format::Xrgb8888);
    }
}

impl GlobalDispatch<xdg_wm_base::XdgWmBase, ()> for ServerState {
    fn bind(
        state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<xdg_wm_base::XdgWmBase>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        state.wm_base = Some(data_init.init(resource, ()));
    }
}

impl Dispatch<wl_compositor::WlCompositor, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &wl_compositor::WlCompositor,
        request: wl_compositor::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            wl_compositor::Request::CreateSurface { id } => {
                data_init.init(id, ());
                state.record(Recorded::CreateSurface);
            }
            wl_compositor::Request::CreateRegion { id } => {
                data_init.init(id, ());
            }
            _ => {}
        }
    }
}

impl Dispatch<wl_region::WlRegion, ()> for ServerState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &wl_region::WlRegion,
        _request: wl_region::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
    }
}

impl Dispatch<wl_surface::WlSurface, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &wl_surface::WlSurface,
        request: wl_surface::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            wl_surface::Request::Attach { buffer, x: _, y: _ } => {
                state.record(Recorded::Attach(buffer.map(|b| b.id().protocol_id())));
            }
            wl_surface::Request::Damage { x, y, width, height } => {
                state.record(Recorded::Damage { x, y, width, height });
            }
            wl_surface::Request::Commit => {
                state.record(Recorded::Commit);
                if !state.sent_initial {
                    if let (Some(toplevel), Some(xdg_surface)) =
                        (&state.toplevel, &state.xdg_surface)
                    {
                        let (width, height, serial) = state.initial_configure;
                        toplevel.configure(width, height, Vec::new());
                        xdg_surface.configure(serial);
                        state.sent_initial = true;
                    }
                }
            }
            wl_surface::Request::Destroy => {
                state.record(Recorded::DestroySurface);
            }
            _ => {}
        }
    }
}

struct PoolData {
    map: Option<Mmap>,
}

impl Dispatch<wl_shm::WlShm, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &wl_shm::WlShm,
        request: wl_shm::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        if let wl_shm::Request::CreatePool { id, fd, size } = request {
            let file = File::from(fd);
            let map = unsafe { Mmap::map(&file) }.ok();
            state.record(Recorded::CreatePool { size });
            data_init.init(id, PoolData { map });
        }
    }
}

impl Dispatch<wl_shm_pool::WlShmPool, PoolData> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &wl_shm_pool::WlShmPool,
        request: wl_shm_pool::Request,
        data: &PoolData,
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            wl_shm_pool::Request::CreateBuffer { id, offset, width, height, stride, format: _ } => {
                let len = stride as usize * height as usize;
                let start = offset as usize;
                let uniform = data
                    .map
                    .as_ref()
                    .and_then(|map| map.get(start..start + len))
                    .and_then(uniform_color);
                let buffer = data_init.init(id, ());
                state.record(Recorded::CreateBuffer {
                    id: buffer.id().protocol_id(),
                    width,
                    height,
                    stride,
                    len,
                    uniform,
                });
            }
            wl_shm_pool::Request::Destroy => {}
            _ => {}
        }
    }
}

impl Dispatch<wl_buffer::WlBuffer, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &wl_buffer::WlBuffer,
        request: wl_buffer::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        if let wl_buffer::Request::Destroy = request {
            state.record(Recorded::DestroyBuffer(resource.id().protocol_id()));
        }
    }
}

impl Dispatch<xdg_wm_base::XdgWmBase, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &xdg_wm_base::XdgWmBase,
        request: xdg_wm_base::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            xdg_wm_base::Request::GetXdgSurface { id, surface: _ } => {
                state.xdg_surface = Some(data_init.init(id, ()));
                state.record(Recorded::GetXdgSurface);
            }
            xdg_wm_base::Request::Pong { serial } => {
                state.record(Recorded::Pong(serial));
            }
            xdg_wm_base::Request::Destroy => {
                state.record(Recorded::DestroyWmBase);
            }
            _ => {}
        }
    }
}

impl Dispatch<xdg_surface::XdgSurface, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &xdg_surface::XdgSurface,
        request: xdg_surface::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            xdg_surface::Request::GetToplevel { id } => {
                state.toplevel = Some(data_init.init(id, ()));
                state.record(Recorded::GetToplevel);
            }
            xdg_surface::Request::AckConfigure { serial } => {
                state.record(Recorded::AckConfigure(serial));
            }
            xdg_surface::Request::Destroy => {
                state.record(Recorded::DestroyXdgSurface);
            }
            _ => {}
        }
    }
}

impl Dispatch<xdg_toplevel::XdgToplevel, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &xdg_toplevel::XdgToplevel,
        request: xdg_toplevel::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            xdg_toplevel::Request::SetTitle { title } => state.record(Recorded::SetTitle(title)),
            xdg_toplevel::Request::SetAppId { app_id } => state.record(Recorded::SetAppId(app_id)),
            xdg_toplevel::Request::Destroy => state.record(Recorded::DestroyToplevel),
            _ => {}
        }
    }
}

fn uniform_color(bytes: &[u8]) -> Option<u32> {
    let mut pixels = bytes.chunks_exact(4);
    let first = pixels.next()?;
    if pixels.all(|px| px == first) {
        Some(u32::from_ne_bytes(first.try_into().ok()?))
    } else {
        None
    }
}

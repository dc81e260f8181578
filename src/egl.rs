//! EGL frame backend.
//!
//! Wraps the session's surface in a `wl_egl_window`, brings up a dynamic
//! EGL 1.4 display on the same connection, and presents frames as a GLES2
//! clear followed by a buffer swap. Only built with the `egl` cargo
//! feature, which also switches the connection to the system libwayland
//! backend EGL requires.

use std::ffi::c_void;
use std::fmt;

use glow::HasContext;
use khronos_egl as egl;
use thiserror::Error;
use tracing::{debug, info};
use wayland_client::protocol::wl_surface::WlSurface;
use wayland_client::{Connection, Proxy};
use wayland_egl::WlEglSurface;

use crate::Color;

type EglInstance = egl::DynamicInstance<egl::EGL1_4>;

/// Failure bringing up or driving the EGL window.
#[derive(Debug, Error)]
pub enum GlError {
    /// libEGL could not be loaded.
    #[error("cannot load libEGL: {0}")]
    Load(String),
    /// EGL has no display for this wayland connection.
    #[error("no EGL display available")]
    NoDisplay,
    /// No EGL config matches the window requirements.
    #[error("no usable EGL config")]
    NoConfig,
    /// An EGL call failed.
    #[error("{call} failed: {source}")]
    Egl {
        /// The EGL entry point that failed.
        call: &'static str,
        /// The error EGL reported.
        source: egl::Error,
    },
    /// The `wl_egl_window` could not be created.
    #[error(transparent)]
    Window(#[from] wayland_egl::Error),
}

/// An EGL window surface with a GLES2 context, bound to one `wl_surface`.
///
/// Must be dropped before the `wl_surface` it wraps is destroyed.
pub struct GlWindow {
    egl: EglInstance,
    display: egl::Display,
    context: egl::Context,
    surface: egl::Surface,
    gl: glow::Context,
    window: WlEglSurface,
    size: (i32, i32),
}

impl GlWindow {
    /// Brings up EGL on `conn` and wraps `surface` in a drawable window.
    pub fn new(
        conn: &Connection,
        surface: &WlSurface,
        width: i32,
        height: i32,
    ) -> Result<Self, GlError> {
        let egl = unsafe { EglInstance::load_required() }
            .map_err(|err| GlError::Load(err.to_string()))?;

        let display_ptr = conn.backend().display_ptr() as *mut c_void;
        let display = unsafe { egl.get_display(display_ptr) }.ok_or(GlError::NoDisplay)?;
        let (major, minor) = egl
            .initialize(display)
            .map_err(|source| GlError::Egl { call: "eglInitialize", source })?;
        debug!("EGL {major}.{minor} initialized");

        let config_attribs = [
            egl::RED_SIZE,
            8,
            egl::GREEN_SIZE,
            8,
            egl::BLUE_SIZE,
            8,
            egl::RENDERABLE_TYPE,
            egl::OPENGL_ES2_BIT,
            egl::SURFACE_TYPE,
            egl::WINDOW_BIT,
            egl::NONE,
        ];
        let config = egl
            .choose_first_config(display, &config_attribs)
            .map_err(|source| GlError::Egl { call: "eglChooseConfig", source })?
            .ok_or(GlError::NoConfig)?;

        let context_attribs = [egl::CONTEXT_CLIENT_VERSION, 2, egl::NONE];
        let context = egl
            .create_context(display, config, None, &context_attribs)
            .map_err(|source| GlError::Egl { call: "eglCreateContext", source })?;

        let window = WlEglSurface::new(surface.id(), width, height)?;
        let egl_surface = unsafe {
            egl.create_window_surface(
                display,
                config,
                window.ptr() as egl::NativeWindowType,
                None,
            )
        }
        .map_err(|source| GlError::Egl { call: "eglCreateWindowSurface", source })?;

        egl.make_current(display, Some(egl_surface), Some(egl_surface), Some(context))
            .map_err(|source| GlError::Egl { call: "eglMakeCurrent", source })?;

        let gl = unsafe {
            glow::Context::from_loader_function(|name| {
                egl.get_proc_address(name)
                    .map_or(std::ptr::null(), |f| f as *const c_void)
            })
        };
        info!("GLES2 context up on a {width}x{height} egl window");

        Ok(GlWindow {
            egl,
            display,
            context,
            surface: egl_surface,
            gl,
            window,
            size: (width, height),
        })
    }

    /// Resizes the underlying `wl_egl_window`. A no-op for the current size.
    pub fn resize(&mut self, width: i32, height: i32) {
        if (width, height) != self.size && width > 0 && height > 0 {
            self.window.resize(width, height, 0, 0);
            self.size = (width, height);
            debug!("egl window resized to {width}x{height}");
        }
    }

    /// Clears the frame to `color` and presents it.
    pub fn draw(&self, color: Color) -> Result<(), GlError> {
        self.egl
            .make_current(self.display, Some(self.surface), Some(self.surface), Some(self.context))
            .map_err(|source| GlError::Egl { call: "eglMakeCurrent", source })?;
        let (width, height) = self.size;
        let [r, g, b, a] = color.to_f32_rgba();
        unsafe {
            self.gl.viewport(0, 0, width, height);
            self.gl.clear_color(r, g, b, a);
            self.gl.clear(glow::COLOR_BUFFER_BIT);
        }
        self.egl
            .swap_buffers(self.display, self.surface)
            .map_err(|source| GlError::Egl { call: "eglSwapBuffers", source })
    }
}

impl Drop for GlWindow {
    fn drop(&mut self) {
        // release the EGL objects before the wl_egl_window field goes
        let _ = self.egl.make_current(self.display, None, None, None);
        let _ = self.egl.destroy_surface(self.display, self.surface);
        let _ = self.egl.destroy_context(self.display, self.context);
    }
}

impl fmt::Debug for GlWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlWindow").field("size", &self.size).finish_non_exhaustive()
    }
}

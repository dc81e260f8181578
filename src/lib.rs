#![warn(missing_docs, missing_debug_implementations)]

//! Minimal Wayland clients built around one reusable session type.
//!
//! [`Session`] walks the whole lifecycle of a toplevel window: connect to
//! the compositor, bind the globals a window needs, create the surface and
//! xdg-shell objects, negotiate the first configure, then block on the
//! event loop until the compositor asks the window to close. Frames are
//! solid-color fills, drawn through shared memory by default or through an
//! EGL window surface with the `egl` cargo feature.
//!
//! # Example
//!
//! ```no_run
//! use wayland_smoke::{Session, SessionConfig};
//!
//! # fn main() -> Result<(), wayland_smoke::SessionError> {
//! let (mut session, mut queue) = Session::connect(SessionConfig::default())?;
//! session.open_window(&mut queue)?;
//! session.run(&mut queue)?;
//! session.shutdown()?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[cfg(feature = "egl")]
pub mod egl;
pub mod session;
pub mod shm;

pub use session::{Backend, Phase, RedrawError, Session, SessionConfig, SessionError};

/// A solid ARGB8888 color, 8 bits per channel with alpha in the top byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color(pub u32);

impl Color {
    /// Opaque blue, the default fill.
    pub const BLUE: Color = Color(0xFF00_00FF);

    /// Channel values scaled to `0.0..=1.0` in RGBA order, for GL clears.
    pub fn to_f32_rgba(self) -> [f32; 4] {
        let channel = |shift: u32| ((self.0 >> shift) & 0xFF) as f32 / 255.0;
        [channel(16), channel(8), channel(0), channel(24)]
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:08X}", self.0)
    }
}

/// Error parsing a hexadecimal color.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid color {0:?}, expected [#|0x]AARRGGBB or [#|0x]RRGGBB")]
pub struct ParseColorError(String);

impl FromStr for Color {
    type Err = ParseColorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.strip_prefix('#').or_else(|| s.strip_prefix("0x")).unwrap_or(s);
        let value = match hex.len() {
            8 => u32::from_str_radix(hex, 16).ok(),
            // no alpha given, take the color as opaque
            6 => u32::from_str_radix(hex, 16).ok().map(|rgb| 0xFF00_0000 | rgb),
            _ => None,
        };
        value.map(Color).ok_or_else(|| ParseColorError(s.to_owned()))
    }
}

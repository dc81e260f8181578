//! Shared-memory frame buffers.
//!
//! One call builds one buffer: an anonymous temporary file sized to the
//! frame, mapped just long enough to write the pixels, registered as a
//! `wl_shm` pool the buffer is carved from. The mapping, the file handle
//! and the client-side pool are all released before the buffer is
//! returned; the compositor keeps the pool alive as long as the buffer
//! needs it.

use std::io;
use std::os::unix::io::AsFd;

use memmap2::MmapMut;
use thiserror::Error;
use tracing::trace;
use wayland_client::protocol::wl_buffer::WlBuffer;
use wayland_client::protocol::wl_shm::{self, WlShm};
use wayland_client::protocol::wl_shm_pool::WlShmPool;
use wayland_client::{Dispatch, QueueHandle};

use crate::Color;

/// Bytes per ARGB8888 pixel.
const BYTES_PER_PIXEL: u32 = 4;

/// Failure while building a shared-memory buffer.
///
/// These abort a single redraw, never the session.
#[derive(Debug, Error)]
pub enum BufferError {
    /// The dimensions are empty or exceed what a pool can hold.
    #[error("{width}x{height} is not a usable buffer size")]
    BadSize {
        /// Requested width in pixels.
        width: u32,
        /// Requested height in pixels.
        height: u32,
    },
    /// The anonymous backing file could not be created.
    #[error("cannot create the shm backing file")]
    Create(#[source] io::Error),
    /// The backing file could not be grown to the buffer size.
    #[error("cannot size the shm backing file to {0} bytes")]
    Resize(u64, #[source] io::Error),
    /// The backing file could not be mapped.
    #[error("cannot map the shm backing file")]
    Map(#[source] io::Error),
}

/// Pool length and row stride of a `width` by `height` ARGB8888 frame,
/// if they fit the protocol's signed 32-bit sizes.
fn buffer_layout(width: u32, height: u32) -> Option<(i32, i32)> {
    if width == 0 || height == 0 {
        return None;
    }
    let len = u64::from(width) * u64::from(height) * u64::from(BYTES_PER_PIXEL);
    let pool_len = i32::try_from(len).ok()?;
    // pool_len fits in i32 and height >= 1, so the stride does too
    Some((pool_len, (width * BYTES_PER_PIXEL) as i32))
}

/// Creates a `width` by `height` buffer filled with `color`.
///
/// The backing file is unlinked from the start and both it and its
/// mapping are dropped on every path out of this function.
pub fn solid_buffer<D>(
    shm: &WlShm,
    qh: &QueueHandle<D>,
    width: u32,
    height: u32,
    color: Color,
) -> Result<WlBuffer, BufferError>
where
    D: Dispatch<WlShmPool, ()> + Dispatch<WlBuffer, ()> + 'static,
{
    let (pool_len, stride) =
        buffer_layout(width, height).ok_or(BufferError::BadSize { width, height })?;

    let file = tempfile::tempfile().map_err(BufferError::Create)?;
    file.set_len(pool_len as u64)
        .map_err(|err| BufferError::Resize(pool_len as u64, err))?;
    {
        let mut map = unsafe { MmapMut::map_mut(&file) }.map_err(BufferError::Map)?;
        for pixel in map.chunks_exact_mut(BYTES_PER_PIXEL as usize) {
            pixel.copy_from_slice(&color.0.to_ne_bytes());
        }
    }

    let pool = shm.create_pool(file.as_fd(), pool_len, qh, ());
    let buffer = pool.create_buffer(
        0,
        width as i32,
        height as i32,
        stride,
        wl_shm::Format::Argb8888,
        qh,
        (),
    );
    pool.destroy();
    trace!("shm buffer {width}x{height}, {pool_len} bytes");
    Ok(buffer)
}

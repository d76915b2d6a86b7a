//! Destination image shared between the decode pipeline and the presenter.
//!
//! The renderer stage writes into the back buffer and swaps it to the front;
//! the presenter reads the front buffer only when the generation moved. Each
//! buffer sits behind its own lock, so a reader never observes a half-written
//! frame and the writer never waits on an upload for longer than the swap.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::ImageError;

struct ImageInner {
    width: u32,
    height: u32,
    front: Mutex<Vec<u8>>,
    back: Mutex<Vec<u8>>,
    generation: AtomicU64,
    bound: AtomicBool,
    released: AtomicBool,
}

/// Opaque, cloneable handle to an RGBA8 destination image.
#[derive(Clone)]
pub struct SharedImage {
    inner: Arc<ImageInner>,
}

impl SharedImage {
    pub fn new(width: u32, height: u32) -> Self {
        let len = width as usize * height as usize * 4;
        Self {
            inner: Arc::new(ImageInner {
                width,
                height,
                front: Mutex::new(vec![0; len]),
                back: Mutex::new(vec![0; len]),
                generation: AtomicU64::new(0),
                bound: AtomicBool::new(false),
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn width(&self) -> u32 {
        self.inner.width
    }

    pub fn height(&self) -> u32 {
        self.inner.height
    }

    pub fn bytes_per_row(&self) -> u32 {
        self.inner.width * 4
    }

    /// Number of frames published so far.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Claim the image as the output buffer of one writer.
    pub fn bind(&self) -> Result<(), ImageError> {
        if self.inner.released.load(Ordering::Acquire) {
            return Err(ImageError::Released);
        }
        self.inner
            .bound
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| ImageError::AlreadyBound)
    }

    pub fn unbind(&self) {
        self.inner.bound.store(false, Ordering::Release);
    }

    pub fn is_bound(&self) -> bool {
        self.inner.bound.load(Ordering::Acquire)
    }

    /// Fill the back buffer and publish it as the new front buffer.
    pub fn write_frame(&self, fill: impl FnOnce(&mut [u8])) -> Result<u64, ImageError> {
        if self.inner.released.load(Ordering::Acquire) {
            return Err(ImageError::Released);
        }
        let mut back = self.inner.back.lock();
        fill(&mut back);
        {
            let mut front = self.inner.front.lock();
            std::mem::swap(&mut *front, &mut *back);
        }
        Ok(self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Hand the front buffer to `read` if a frame newer than `seen` exists.
    /// Returns the generation that was read.
    pub fn read_if_newer(&self, seen: u64, read: impl FnOnce(&[u8])) -> Option<u64> {
        let current = self.generation();
        if current == seen || self.inner.released.load(Ordering::Acquire) {
            return None;
        }
        let front = self.inner.front.lock();
        read(&front);
        Some(current)
    }

    /// Invalidate the image. Fails while a writer still has it bound.
    pub fn release(&self) -> Result<(), ImageError> {
        if self.is_bound() {
            return Err(ImageError::StillBound);
        }
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return Err(ImageError::Released);
        }
        self.inner.front.lock().clear();
        self.inner.back.lock().clear();
        Ok(())
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for SharedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedImage")
            .field("width", &self.inner.width)
            .field("height", &self.inner.height)
            .field("generation", &self.generation())
            .field("bound", &self.is_bound())
            .field("released", &self.is_released())
            .finish()
    }
}

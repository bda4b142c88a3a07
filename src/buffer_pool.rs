use std::collections::VecDeque;
use std::sync::Mutex;

pub const BYTES_PER_PIXEL: usize = 4;

/// A BGRA 32-bit frame buffer. Pixel format is fixed for the whole pipeline;
/// only dimensions vary.
#[derive(Debug, Clone)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl PixelBuffer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0u8; width as usize * height as usize * BYTES_PER_PIXEL],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn row_bytes(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Reusable buffer pool for one fixed frame size.
///
/// Two instances exist per session: one at native surface size for renders,
/// one at the downscaled size feeding the encoder. Requesting a different
/// size invalidates and recreates the pool. Exhaustion falls back to a plain
/// allocation so the capture path never stalls on the pool.
#[derive(Debug)]
pub struct PixelBufferPool {
    inner: Mutex<PoolInner>,
    capacity: usize,
}

#[derive(Debug)]
struct PoolInner {
    width: u32,
    height: u32,
    free: VecDeque<PixelBuffer>,
}

impl PixelBufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                width: 0,
                height: 0,
                free: VecDeque::with_capacity(capacity),
            }),
            capacity,
        }
    }

    /// Takes a zeroed-or-reused buffer of exactly `width` x `height`. A size
    /// change drops every pooled buffer first.
    pub fn acquire(&self, width: u32, height: u32) -> PixelBuffer {
        let mut inner = self.inner.lock().expect("pixel pool mutex poisoned");
        if inner.width != width || inner.height != height {
            inner.free.clear();
            inner.width = width;
            inner.height = height;
        }
        inner
            .free
            .pop_front()
            .unwrap_or_else(|| PixelBuffer::new(width, height))
    }

    /// Returns a buffer for reuse. Buffers are zeroed before pooling so a
    /// recycled frame can never leak pixels into a later session, and
    /// wrong-sized or surplus buffers are simply dropped.
    pub fn recycle(&self, mut buffer: PixelBuffer) {
        let mut inner = self.inner.lock().expect("pixel pool mutex poisoned");
        if buffer.width != inner.width || buffer.height != inner.height {
            return;
        }
        if inner.free.len() < self.capacity {
            buffer.data.fill(0);
            inner.free.push_back(buffer);
        }
    }

    pub fn stats(&self) -> (usize, usize) {
        let inner = self.inner.lock().expect("pixel pool mutex poisoned");
        (inner.free.len(), self.capacity)
    }
}

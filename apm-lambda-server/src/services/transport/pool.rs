use std::io::{self, Write};

use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use parking_lot::Mutex;

/// Maximum number of idle buffers kept by a [`BufferPool`].
const MAX_IDLE_BUFFERS: usize = 4;

/// A pool of reusable buffers for compressing request bodies.
///
/// Buffers keep their capacity between uses. A compressed body is handed out as [`Bytes`] and
/// returns to the pool through [`recycle`](Self::recycle) once the request no longer holds it.
/// Checkout and checkin are safe from concurrent senders.
#[derive(Debug, Default)]
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    fn checkout(&self) -> Vec<u8> {
        self.buffers.lock().pop().unwrap_or_default()
    }

    fn checkin(&self, mut buffer: Vec<u8>) {
        buffer.clear();

        let mut buffers = self.buffers.lock();
        if buffers.len() < MAX_IDLE_BUFFERS {
            buffers.push(buffer);
        }
    }

    /// Compresses `data` with gzip at best speed into a pooled buffer.
    pub fn gzip(&self, data: &[u8]) -> io::Result<Bytes> {
        let mut encoder = GzEncoder::new(self.checkout(), Compression::fast());
        encoder.write_all(data)?;
        Ok(Bytes::from(encoder.finish()?))
    }

    /// Returns a buffer obtained from [`gzip`](Self::gzip) to the pool.
    ///
    /// Buffers that are still shared are dropped.
    pub fn recycle(&self, body: Bytes) {
        if let Ok(buffer) = body.try_into_mut() {
            self.checkin(buffer.into());
        }
    }

    /// Returns the number of idle buffers.
    pub fn idle(&self) -> usize {
        self.buffers.lock().len()
    }
}

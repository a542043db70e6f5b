//! Frame sink that records everything it is given.

use std::sync::{Arc, Mutex};

use ductx_core::error::{Error, Result};
use ductx_core::transport::FrameSink;

#[derive(Debug, Default)]
struct Captured {
    frames: Vec<Vec<u8>>,
    closed: bool,
    fail_sends: bool,
}

/// A [`FrameSink`] that stores every frame in memory.
///
/// Clones share the same storage, so a test can keep one clone while the
/// other is boxed into the code under test.
#[derive(Debug, Clone, Default)]
pub struct CaptureSink {
    inner: Arc<Mutex<Captured>>,
}

impl CaptureSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies of all frames sent so far.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.inner.lock().map(|c| c.frames.clone()).unwrap_or_default()
    }

    /// Number of frames sent so far.
    pub fn frame_count(&self) -> usize {
        self.inner.lock().map(|c| c.frames.len()).unwrap_or(0)
    }

    /// Whether [`FrameSink::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().map(|c| c.closed).unwrap_or(true)
    }

    /// Make subsequent sends fail with an I/O error.
    pub fn set_failing(&self, fail: bool) {
        if let Ok(mut c) = self.inner.lock() {
            c.fail_sends = fail;
        }
    }
}

impl FrameSink for CaptureSink {
    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        let mut c = self
            .inner
            .lock()
            .map_err(|_| Error::Transport("capture sink poisoned".into()))?;
        if c.closed {
            return Err(Error::NotConnected);
        }
        if c.fail_sends {
            return Err(Error::Io(std::io::Error::other("injected send failure")));
        }
        c.frames.push(frame.to_vec());
        Ok(())
    }

    fn close(&mut self) {
        if let Ok(mut c) = self.inner.lock() {
            c.closed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_frames_through_clones() {
        let sink = CaptureSink::new();
        let mut boxed: Box<dyn FrameSink> = Box::new(sink.clone());
        boxed.send_frame(&[1, 2, 3]).unwrap();
        boxed.send_frame(&[4]).unwrap();
        assert_eq!(sink.frames(), vec![vec![1, 2, 3], vec![4]]);
        assert_eq!(sink.frame_count(), 2);
    }

    #[test]
    fn closed_sink_rejects() {
        let mut sink = CaptureSink::new();
        sink.close();
        assert!(sink.is_closed());
        assert!(matches!(sink.send_frame(&[0]), Err(Error::NotConnected)));
    }

    #[test]
    fn injected_failure() {
        let mut sink = CaptureSink::new();
        sink.set_failing(true);
        assert!(matches!(sink.send_frame(&[0]), Err(Error::Io(_))));
        assert_eq!(sink.frame_count(), 0);
    }
}

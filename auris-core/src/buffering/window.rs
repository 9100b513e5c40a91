//! Sliding sample buffer feeding the classifier.
//!
//! Samples are appended as they arrive from the capture side. Once the
//! buffer grows past twice the inference window, the oldest excess samples
//! are dropped from the front, so retention is bounded at 2× the window
//! regardless of stream length. Inference always reads the most recent
//! window-length tail.

/// Append-only sample buffer with bounded front-trim retention.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    samples: Vec<f32>,
    /// Exact sample count handed to the classifier per inference.
    window_len: usize,
}

impl SlidingWindow {
    /// Create an empty buffer for the given inference window length.
    pub fn new(window_len: usize) -> Self {
        Self {
            samples: Vec::with_capacity(window_len * 2),
            window_len,
        }
    }

    /// Append a chunk, then trim from the front so at most `2 * window_len`
    /// samples remain.
    pub fn extend(&mut self, chunk: &[f32]) {
        self.samples.extend_from_slice(chunk);
        let cap = self.window_len * 2;
        if self.samples.len() > cap {
            let drop = self.samples.len() - cap;
            self.samples.drain(..drop);
        }
    }

    /// Whether enough samples have accumulated for one inference window.
    pub fn is_primed(&self) -> bool {
        self.samples.len() >= self.window_len
    }

    /// The most recent window-length slice, or `None` before priming.
    pub fn latest(&self) -> Option<&[f32]> {
        if !self.is_primed() {
            return None;
        }
        Some(&self.samples[self.samples.len() - self.window_len..])
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn window_len(&self) -> usize {
        self.window_len
    }

    /// Drop all buffered samples (e.g. between sessions).
    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_primed_until_window_filled() {
        let mut buf = SlidingWindow::new(100);
        buf.extend(&vec![0.1; 99]);
        assert!(!buf.is_primed());
        assert!(buf.latest().is_none());

        buf.extend(&[0.1]);
        assert!(buf.is_primed());
        assert_eq!(buf.latest().unwrap().len(), 100);
    }

    #[test]
    fn retention_never_exceeds_twice_window() {
        let mut buf = SlidingWindow::new(100);
        for _ in 0..50 {
            buf.extend(&vec![0.0; 37]);
            assert!(buf.len() <= 200, "len={} after append", buf.len());
        }
    }

    #[test]
    fn oversized_append_keeps_most_recent_samples() {
        let mut buf = SlidingWindow::new(4);
        let chunk: Vec<f32> = (0..20).map(|i| i as f32).collect();
        buf.extend(&chunk);
        assert_eq!(buf.len(), 8);
        // Tail window is the newest 4 samples, in arrival order.
        assert_eq!(buf.latest().unwrap(), &[16.0, 17.0, 18.0, 19.0]);
    }

    #[test]
    fn latest_tracks_newest_tail_across_appends() {
        let mut buf = SlidingWindow::new(3);
        buf.extend(&[1.0, 2.0, 3.0]);
        assert_eq!(buf.latest().unwrap(), &[1.0, 2.0, 3.0]);
        buf.extend(&[4.0]);
        assert_eq!(buf.latest().unwrap(), &[2.0, 3.0, 4.0]);
    }

    #[test]
    fn clear_resets_priming() {
        let mut buf = SlidingWindow::new(10);
        buf.extend(&vec![0.5; 20]);
        assert!(buf.is_primed());
        buf.clear();
        assert!(buf.is_empty());
        assert!(!buf.is_primed());
    }
}

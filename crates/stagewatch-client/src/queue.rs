use std::collections::VecDeque;
use tracing::warn;

pub const QUEUE_WARN_STEP: usize = 1000;

/// Encoded frames waiting for an open socket. Unbounded; growth is only logged.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    frames: VecDeque<String>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: String) {
        self.frames.push_back(frame);
        if self.frames.len() % QUEUE_WARN_STEP == 0 {
            warn!("outbound_queue_growing: len={}", self.frames.len());
        }
    }

    /// Puts back a frame that failed mid-flush so it goes out first next time.
    pub fn requeue_front(&mut self, frame: String) {
        self.frames.push_front(frame);
    }

    pub fn pop(&mut self) -> Option<String> {
        self.frames.pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl Extend<String> for OutboundQueue {
    fn extend<I: IntoIterator<Item = String>>(&mut self, iter: I) {
        for frame in iter {
            self.push(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_leave_in_submission_order() {
        let mut queue = OutboundQueue::new();
        queue.extend(["a", "b", "c"].map(String::from));
        assert_eq!(queue.pop().as_deref(), Some("a"));

        queue.requeue_front("a".to_string());
        let drained: Vec<String> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(drained, vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn queue_has_no_bound() {
        let mut queue = OutboundQueue::new();
        for index in 0..2500 {
            queue.push(index.to_string());
        }
        assert_eq!(queue.len(), 2500);
        assert_eq!(queue.pop().as_deref(), Some("0"));
    }
}

//! Bounded FIFO of frames waiting for a working channel

use crate::config::{BufferConfig, OverflowPolicy};
use std::collections::VecDeque;

/// Result of offering a frame to the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Frame queued; `evicted` older frames were dropped to make room
    Queued { evicted: usize },
    /// Frame discarded
    Rejected,
}

impl PushOutcome {
    /// Number of frames lost by this push
    pub fn dropped(&self) -> usize {
        match self {
            PushOutcome::Queued { evicted } => *evicted,
            PushOutcome::Rejected => 1,
        }
    }
}

#[derive(Debug)]
pub struct OutboundBuffer {
    frames: VecDeque<Vec<u8>>,
    bytes: usize,
    max_frames: usize,
    max_bytes: usize,
    policy: OverflowPolicy,
}

impl OutboundBuffer {
    pub fn new(config: &BufferConfig) -> Self {
        Self {
            frames: VecDeque::new(),
            bytes: 0,
            max_frames: config.max_frames,
            max_bytes: config.max_bytes,
            policy: config.overflow,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    fn fits(&self, len: usize) -> bool {
        self.frames.len() < self.max_frames && self.bytes + len <= self.max_bytes
    }

    /// Append at the tail, applying the overflow policy
    pub fn push_back(&mut self, frame: Vec<u8>) -> PushOutcome {
        // Larger than the whole buffer: no amount of eviction helps
        if frame.len() > self.max_bytes {
            return PushOutcome::Rejected;
        }

        let mut evicted = 0;
        match self.policy {
            OverflowPolicy::RejectNew => {
                if !self.fits(frame.len()) {
                    return PushOutcome::Rejected;
                }
            }
            OverflowPolicy::DropOldest => {
                while !self.fits(frame.len()) {
                    match self.frames.pop_front() {
                        Some(old) => {
                            self.bytes -= old.len();
                            evicted += 1;
                        }
                        None => break,
                    }
                }
            }
        }

        self.bytes += frame.len();
        self.frames.push_back(frame);
        PushOutcome::Queued { evicted }
    }

    pub fn pop_front(&mut self) -> Option<Vec<u8>> {
        let frame = self.frames.pop_front()?;
        self.bytes -= frame.len();
        Some(frame)
    }

    /// Put a frame that failed to send back at the head
    ///
    /// Only frames just taken by [`pop_front`](Self::pop_front) come back here,
    /// so bounds are not re-applied.
    pub fn requeue(&mut self, frame: Vec<u8>) {
        self.bytes += frame.len();
        self.frames.push_front(frame);
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(max_frames: usize, max_bytes: usize, overflow: OverflowPolicy) -> OutboundBuffer {
        OutboundBuffer::new(&BufferConfig {
            max_frames,
            max_bytes,
            overflow,
        })
    }

    #[test]
    fn test_fifo_with_requeue() {
        let mut buf = buffer(8, 1024, OverflowPolicy::DropOldest);
        buf.push_back(vec![1]);
        buf.push_back(vec![2]);
        buf.push_back(vec![3]);

        let head = buf.pop_front().unwrap();
        assert_eq!(head, vec![1]);
        buf.requeue(head);
        buf.push_back(vec![4]);

        let drained: Vec<u8> = std::iter::from_fn(|| buf.pop_front()).map(|f| f[0]).collect();
        assert_eq!(drained, vec![1, 2, 3, 4]);
        assert_eq!(buf.bytes(), 0);
    }

    #[test]
    fn test_drop_oldest_on_frame_limit() {
        let mut buf = buffer(2, 1024, OverflowPolicy::DropOldest);
        assert_eq!(buf.push_back(vec![1]), PushOutcome::Queued { evicted: 0 });
        assert_eq!(buf.push_back(vec![2]), PushOutcome::Queued { evicted: 0 });
        assert_eq!(buf.push_back(vec![3]), PushOutcome::Queued { evicted: 1 });

        assert_eq!(buf.pop_front(), Some(vec![2]));
        assert_eq!(buf.pop_front(), Some(vec![3]));
    }

    #[test]
    fn test_drop_oldest_on_byte_limit() {
        let mut buf = buffer(16, 10, OverflowPolicy::DropOldest);
        buf.push_back(vec![0; 4]);
        buf.push_back(vec![0; 4]);

        let outcome = buf.push_back(vec![0; 8]);
        assert_eq!(outcome, PushOutcome::Queued { evicted: 2 });
        assert_eq!(outcome.dropped(), 2);
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.bytes(), 8);
    }

    #[test]
    fn test_reject_new_keeps_contents() {
        let mut buf = buffer(2, 1024, OverflowPolicy::RejectNew);
        buf.push_back(vec![1]);
        buf.push_back(vec![2]);

        let outcome = buf.push_back(vec![3]);
        assert_eq!(outcome, PushOutcome::Rejected);
        assert_eq!(outcome.dropped(), 1);
        assert_eq!(buf.pop_front(), Some(vec![1]));
        assert_eq!(buf.pop_front(), Some(vec![2]));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_frame_rejected_without_eviction() {
        let mut buf = buffer(16, 10, OverflowPolicy::DropOldest);
        buf.push_back(vec![0; 5]);

        assert_eq!(buf.push_back(vec![0; 11]), PushOutcome::Rejected);
        assert_eq!(buf.len(), 1);
    }
}

//! In-flight request records.

use std::collections::VecDeque;
use std::time::Instant;

/// Request kind; `Post` is a memcached `set` or an HTTP `POST`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Get,
    Post,
}

/// One outstanding request, from enqueue until its response is framed.
#[derive(Debug, Clone)]
pub struct Operation {
    /// Per-connection sequence number, monotonic across resets.
    pub seq: u64,
    pub kind: OpKind,
    pub key: String,
    /// Payload length for writes.
    pub value_len: Option<usize>,
    pub start_time: Instant,
    /// Whether latency is reported for this operation.
    pub sampled: bool,
    /// Warm-up write issued by the loader.
    pub loader: bool,
}

/// FIFO of outstanding operations.
///
/// Responses arrive in request order, so the front is always the operation
/// the next complete response belongs to.
#[derive(Debug, Default)]
pub struct OpQueue {
    ops: VecDeque<Operation>,
    next_seq: u64,
}

impl OpQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a new operation and return its sequence number.
    pub fn push(
        &mut self,
        kind: OpKind,
        key: String,
        value_len: Option<usize>,
        start_time: Instant,
        sampled: bool,
        loader: bool,
    ) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.ops.push_back(Operation {
            seq,
            kind,
            key,
            value_len,
            start_time,
            sampled,
            loader,
        });
        seq
    }

    pub fn front(&self) -> Option<&Operation> {
        self.ops.front()
    }

    pub fn pop(&mut self) -> Option<Operation> {
        self.ops.pop_front()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of measured (non-loader) operations outstanding.
    pub fn measured(&self) -> usize {
        self.ops.iter().filter(|op| !op.loader).count()
    }

    /// Discard every outstanding operation, returning how many were dropped.
    /// Sequence numbers keep counting so stale completions cannot alias.
    pub fn clear(&mut self) -> usize {
        let n = self.ops.len();
        self.ops.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_and_sequence() {
        let mut queue = OpQueue::new();
        let now = Instant::now();
        assert_eq!(queue.push(OpKind::Get, "a".into(), None, now, true, false), 0);
        assert_eq!(queue.push(OpKind::Post, "b".into(), Some(3), now, false, true), 1);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.measured(), 1);

        let first = queue.pop().unwrap();
        assert_eq!(first.key, "a");
        assert_eq!(first.kind, OpKind::Get);
        assert_eq!(queue.front().map(|op| op.seq), Some(1));
    }

    #[test]
    fn test_clear_keeps_sequence() {
        let mut queue = OpQueue::new();
        let now = Instant::now();
        for _ in 0..3 {
            queue.push(OpKind::Get, "k".into(), None, now, true, false);
        }
        assert_eq!(queue.clear(), 3);
        assert!(queue.is_empty());
        assert!(queue.pop().is_none());
        assert_eq!(queue.push(OpKind::Get, "k".into(), None, now, true, false), 3);
    }
}

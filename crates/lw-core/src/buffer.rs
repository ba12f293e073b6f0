//! Holding queue for structured events that arrive while a worker is paused.

use std::collections::VecDeque;

use crate::protocol::StructuredEvent;

/// FIFO of events collected while paused.
///
/// Owned by exactly one supervisor actor. On resume the events are drained in
/// arrival order; on worker exit they are discarded, never replayed.
#[derive(Debug, Default)]
pub struct EventBuffer {
    queue: VecDeque<StructuredEvent>,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: StructuredEvent) {
        self.queue.push_back(event);
    }

    /// Take every buffered event in arrival order, leaving the buffer empty.
    pub fn drain(&mut self) -> Vec<StructuredEvent> {
        self.queue.drain(..).collect()
    }

    /// Discard everything. Returns how many events were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ParsedLine, classify_line};

    fn event(kind: &str, ts: i64) -> StructuredEvent {
        match classify_line(&format!(r#"{{"type":"{kind}","timestamp":{ts}}}"#)) {
            ParsedLine::Event(e) => e,
            ParsedLine::Raw(r) => panic!("not an event: {r}"),
        }
    }

    #[test]
    fn drain_preserves_arrival_order() {
        let mut buf = EventBuffer::new();
        for (i, k) in ["a", "b", "c"].iter().enumerate() {
            buf.push(event(k, i as i64));
        }
        let kinds: Vec<_> = buf
            .drain()
            .iter()
            .map(|e| e.kind().unwrap().to_string())
            .collect();
        assert_eq!(kinds, vec!["a", "b", "c"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn clear_reports_dropped_count() {
        let mut buf = EventBuffer::new();
        buf.push(event("a", 1));
        buf.push(event("b", 2));
        assert_eq!(buf.clear(), 2);
        assert_eq!(buf.len(), 0);
        assert!(buf.drain().is_empty());
    }
}

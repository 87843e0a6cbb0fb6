//! The reactor-exclusive FIFO of arrived, settled messages.

use std::collections::VecDeque;

use crate::amqp::Message;

/// FIFO of messages that have arrived and been settled but not yet handed
/// to a caller.
///
/// Owned entirely by the reactor task (see spec §5): no synchronization is
/// needed because only one task ever touches it.
#[derive(Debug, Default)]
pub struct PrefetchBuffer {
    messages: VecDeque<Message>,
}

impl PrefetchBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a newly arrived message onto the back of the buffer.
    pub fn push(&mut self, message: Message) {
        self.messages.push_back(message);
    }

    /// Number of messages currently buffered.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// `true` if no messages are buffered.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Drains up to `max` messages from the front of the buffer, preserving
    /// arrival order. Per spec §4.2, the caller (the matcher) only invokes
    /// this when the buffer is non-empty, so the returned `Vec` is never
    /// empty when `max > 0`.
    pub fn drain_up_to(&mut self, max: usize) -> Vec<Message> {
        let take = max.min(self.messages.len());
        self.messages.drain(..take).collect()
    }

    /// Discards every buffered message. Used on link error (spec §4.4,
    /// §9 Open Question: prefetched messages are discarded, not flushed to
    /// pending receives, on any error including close-initiated ones).
    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(body: &str) -> Message {
        Message {
            body: body.as_bytes().to_vec(),
            application_properties: Default::default(),
        }
    }

    #[test]
    fn drain_preserves_arrival_order_and_caps_at_max() {
        let mut buffer = PrefetchBuffer::new();
        buffer.push(msg("a"));
        buffer.push(msg("b"));
        buffer.push(msg("c"));

        let batch = buffer.drain_up_to(2);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].body, b"a");
        assert_eq!(batch[1].body, b"b");
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn drain_up_to_more_than_available_takes_all() {
        let mut buffer = PrefetchBuffer::new();
        buffer.push(msg("a"));
        let batch = buffer.drain_up_to(10);
        assert_eq!(batch.len(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn clear_discards_everything() {
        let mut buffer = PrefetchBuffer::new();
        buffer.push(msg("a"));
        buffer.push(msg("b"));
        buffer.clear();
        assert!(buffer.is_empty());
    }
}

//! Outbound byte buffering with per-buffer partial consumption.

use std::collections::VecDeque;

/// One sequential piece of data held in a [`ByteQueue`].
struct Element {
    /// The actual bytes of this queue element.
    data: Vec<u8>,
    /// How many bytes have already been consumed from this element.
    consumed: usize,
}

/// A FIFO of byte buffers that can be consumed a few bytes at a time.
///
/// Buffers go in whole; they come out in arbitrary slices, which is what a
/// socket writer needs when the kernel accepts only part of a buffer.
/// [`peek`](Self::peek) returns upcoming bytes without removing them,
/// [`discard`](Self::discard) removes without returning, and
/// [`dequeue`](Self::dequeue) does both. The queue itself is not
/// synchronized; callers that share one keep it behind their own lock.
#[derive(Default)]
pub struct ByteQueue {
    elements: VecDeque<Element>,
    total_bytes: usize,
}

impl ByteQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a buffer to the back of the queue.
    pub fn enqueue(&mut self, data: impl Into<Vec<u8>>) {
        let data = data.into();
        self.total_bytes += data.len();
        self.elements.push_back(Element { data, consumed: 0 });
    }

    /// Remove and return up to `num_bytes` from the front of the queue.
    ///
    /// Fewer bytes are returned if the queue holds fewer.
    pub fn dequeue(&mut self, num_bytes: usize) -> Vec<u8> {
        self.consume(num_bytes, true, true)
    }

    /// Return up to `num_bytes` from the front without removing them.
    ///
    /// The bytes are exactly what [`dequeue`](Self::dequeue) would return.
    pub fn peek(&mut self, num_bytes: usize) -> Vec<u8> {
        self.consume(num_bytes, true, false)
    }

    /// Remove up to `num_bytes` from the front without returning them.
    pub fn discard(&mut self, num_bytes: usize) {
        let _ = self.consume(num_bytes, false, true);
    }

    /// The number of buffers currently queued.
    pub fn buffers_queued(&self) -> usize {
        self.elements.len()
    }

    /// The total number of unconsumed bytes across all queued buffers.
    pub fn bytes_queued(&self) -> usize {
        self.total_bytes
    }

    /// The one routine behind peek, dequeue, and discard.
    ///
    /// Walks elements from the front, honoring each element's `consumed`
    /// offset. When a whole untouched element satisfies the remaining
    /// request and the output is still empty, the element's buffer is moved
    /// out without copying.
    fn consume(&mut self, num_bytes: usize, return_data: bool, remove_data: bool) -> Vec<u8> {
        let mut buffer = Vec::new();
        let mut remaining = num_bytes.min(self.total_bytes);
        let mut index = 0;
        while remaining > 0 {
            let element = &mut self.elements[index];
            if element.consumed == 0 && element.data.len() == remaining && buffer.is_empty() {
                if return_data && !remove_data {
                    buffer = element.data.clone();
                } else if remove_data {
                    if let Some(element) = self.elements.remove(index) {
                        if return_data {
                            buffer = element.data;
                        }
                        self.total_bytes -= remaining;
                    }
                }
                break;
            }
            let bytes_to_consume = remaining.min(element.data.len() - element.consumed);
            if return_data {
                buffer.extend_from_slice(
                    &element.data[element.consumed..element.consumed + bytes_to_consume],
                );
            }
            remaining -= bytes_to_consume;
            if remove_data {
                element.consumed += bytes_to_consume;
                self.total_bytes -= bytes_to_consume;
                if element.consumed >= element.data.len() {
                    let _ = self.elements.remove(index);
                }
            } else if element.consumed + bytes_to_consume >= element.data.len() {
                index += 1;
            }
        }
        buffer
    }
}

impl std::fmt::Debug for ByteQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteQueue")
            .field("buffers_queued", &self.buffers_queued())
            .field("bytes_queued", &self.bytes_queued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_then_dequeue_everything() {
        let mut queue = ByteQueue::new();
        queue.enqueue(vec![1, 2, 3]);
        queue.enqueue(vec![4, 5]);
        assert_eq!(queue.buffers_queued(), 2);
        assert_eq!(queue.bytes_queued(), 5);

        assert_eq!(queue.dequeue(5), vec![1, 2, 3, 4, 5]);
        assert_eq!(queue.buffers_queued(), 0);
        assert_eq!(queue.bytes_queued(), 0);
    }

    #[test]
    fn dequeue_spans_element_boundaries() {
        let mut queue = ByteQueue::new();
        queue.enqueue(vec![1, 2, 3]);
        queue.enqueue(vec![4, 5, 6]);

        assert_eq!(queue.dequeue(4), vec![1, 2, 3, 4]);
        assert_eq!(queue.buffers_queued(), 1);
        assert_eq!(queue.bytes_queued(), 2);
        assert_eq!(queue.dequeue(2), vec![5, 6]);
    }

    #[test]
    fn partial_consumption_tracks_offsets() {
        let mut queue = ByteQueue::new();
        queue.enqueue(vec![10, 20, 30, 40]);

        assert_eq!(queue.dequeue(1), vec![10]);
        assert_eq!(queue.buffers_queued(), 1);
        assert_eq!(queue.bytes_queued(), 3);
        assert_eq!(queue.dequeue(2), vec![20, 30]);
        assert_eq!(queue.dequeue(1), vec![40]);
        assert_eq!(queue.buffers_queued(), 0);
    }

    #[test]
    fn peek_does_not_remove() {
        let mut queue = ByteQueue::new();
        queue.enqueue(vec![1, 2]);
        queue.enqueue(vec![3, 4]);

        assert_eq!(queue.peek(3), vec![1, 2, 3]);
        assert_eq!(queue.bytes_queued(), 4);
        assert_eq!(queue.peek(3), vec![1, 2, 3]);
    }

    #[test]
    fn peek_then_discard_matches_dequeue() {
        let make = || {
            let mut queue = ByteQueue::new();
            queue.enqueue(vec![1, 2, 3]);
            queue.enqueue(vec![4, 5, 6, 7]);
            queue.enqueue(vec![8]);
            queue
        };

        let mut dequeued = make();
        let mut peeked = make();
        for request in [0, 2, 3, 5] {
            let expected = dequeued.dequeue(request);
            let observed = peeked.peek(request);
            peeked.discard(request);
            assert_eq!(observed, expected, "request of {request} bytes");
            assert_eq!(peeked.bytes_queued(), dequeued.bytes_queued());
        }
    }

    #[test]
    fn discard_removes_without_returning() {
        let mut queue = ByteQueue::new();
        queue.enqueue(vec![1, 2, 3, 4]);

        queue.discard(3);
        assert_eq!(queue.bytes_queued(), 1);
        assert_eq!(queue.dequeue(1), vec![4]);
    }

    #[test]
    fn zero_byte_request_returns_empty() {
        let mut queue = ByteQueue::new();
        queue.enqueue(vec![1]);
        assert!(queue.dequeue(0).is_empty());
        assert!(queue.peek(0).is_empty());
        assert_eq!(queue.bytes_queued(), 1);
    }

    #[test]
    fn oversized_request_returns_everything() {
        let mut queue = ByteQueue::new();
        queue.enqueue(vec![1, 2]);
        queue.enqueue(vec![3]);
        assert_eq!(queue.dequeue(100), vec![1, 2, 3]);
        assert_eq!(queue.bytes_queued(), 0);
        assert!(queue.dequeue(100).is_empty());
    }

    #[test]
    fn whole_buffer_dequeue_after_partial_front() {
        let mut queue = ByteQueue::new();
        queue.enqueue(vec![1, 2]);
        queue.enqueue(vec![3, 4, 5]);

        // Consume the first element partially so the second starts clean.
        assert_eq!(queue.dequeue(2), vec![1, 2]);
        // The remaining element is untouched and exactly matches the
        // request, which takes the whole-buffer path.
        assert_eq!(queue.dequeue(3), vec![3, 4, 5]);
        assert_eq!(queue.buffers_queued(), 0);
    }
}

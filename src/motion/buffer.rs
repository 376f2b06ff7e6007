// src/motion/buffer.rs - Fixed-capacity ring of pending targets

use super::AxisTarget;

/// Capacity of the planning buffer. The segmenter needs a window of three
/// (previous, current, upcoming) to decide about the middle entry; the
/// fourth slot takes the incoming append before the next pop.
pub const PLANNING_BUFFER_CAPACITY: usize = 4;

/// Bounded ring of pending [`AxisTarget`]s with a read cursor at the front.
///
/// All operations are O(1); exceeding the capacity or peeking past the end
/// is a programming error, not a runtime condition.
#[derive(Debug)]
pub struct PlanningBuffer {
    slots: [AxisTarget; PLANNING_BUFFER_CAPACITY],
    head: usize,
    len: usize,
}

impl PlanningBuffer {
    pub fn new() -> Self {
        PlanningBuffer {
            slots: [AxisTarget::zeroed(); PLANNING_BUFFER_CAPACITY],
            head: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reserve the next slot and return it, zeroed.
    pub fn append(&mut self) -> &mut AxisTarget {
        assert!(
            self.len < PLANNING_BUFFER_CAPACITY,
            "planning buffer overflow"
        );
        let index = (self.head + self.len) % PLANNING_BUFFER_CAPACITY;
        self.len += 1;
        self.slots[index] = AxisTarget::zeroed();
        &mut self.slots[index]
    }

    /// The most recently appended entry (the "previous position").
    pub fn back(&mut self) -> &mut AxisTarget {
        assert!(self.len > 0, "planning buffer is empty");
        let index = (self.head + self.len - 1) % PLANNING_BUFFER_CAPACITY;
        &mut self.slots[index]
    }

    /// Entry `i` counted from the oldest.
    pub fn peek(&self, i: usize) -> &AxisTarget {
        assert!(i < self.len, "peek past end of planning buffer");
        &self.slots[(self.head + i) % PLANNING_BUFFER_CAPACITY]
    }

    pub fn peek_mut(&mut self, i: usize) -> &mut AxisTarget {
        assert!(i < self.len, "peek past end of planning buffer");
        &mut self.slots[(self.head + i) % PLANNING_BUFFER_CAPACITY]
    }

    /// Advance the read cursor, dropping the oldest entry.
    pub fn pop_front(&mut self) {
        assert!(self.len > 0, "pop from empty planning buffer");
        self.head = (self.head + 1) % PLANNING_BUFFER_CAPACITY;
        self.len -= 1;
    }
}

impl Default for PlanningBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_peek_preserve_order() {
        let mut buffer = PlanningBuffer::new();
        for speed in [1.0, 2.0, 3.0] {
            buffer.append().speed = speed;
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.peek(0).speed, 1.0);
        assert_eq!(buffer.peek(1).speed, 2.0);
        assert_eq!(buffer.peek(2).speed, 3.0);
        assert_eq!(buffer.back().speed, 3.0);
    }

    #[test]
    fn pop_front_advances_cursor() {
        let mut buffer = PlanningBuffer::new();
        for speed in [1.0, 2.0, 3.0] {
            buffer.append().speed = speed;
        }
        buffer.pop_front();
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.peek(0).speed, 2.0);
        assert_eq!(buffer.back().speed, 3.0);
    }

    #[test]
    fn ring_wraps_around() {
        let mut buffer = PlanningBuffer::new();
        for speed in [1.0, 2.0, 3.0, 4.0] {
            buffer.append().speed = speed;
        }
        // Free two slots, then refill past the physical end of the array.
        buffer.pop_front();
        buffer.pop_front();
        buffer.append().speed = 5.0;
        buffer.append().speed = 6.0;
        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.peek(0).speed, 3.0);
        assert_eq!(buffer.peek(3).speed, 6.0);
    }

    #[test]
    fn appended_slot_is_zeroed() {
        let mut buffer = PlanningBuffer::new();
        buffer.append().speed = 9.0;
        buffer.pop_front();
        assert_eq!(buffer.append().speed, 0.0);
    }

    #[test]
    #[should_panic(expected = "planning buffer overflow")]
    fn overflow_is_a_programming_error() {
        let mut buffer = PlanningBuffer::new();
        for _ in 0..5 {
            buffer.append();
        }
    }
}

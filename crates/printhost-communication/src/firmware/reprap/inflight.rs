//! In-flight line accounting
//!
//! Records every framed line that was transmitted but not yet acknowledged,
//! with the number of bytes it occupies in the device receive buffer.

use std::collections::VecDeque;

/// A transmitted, unacknowledged line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightEntry {
    /// Framed line exactly as transmitted, without the newline
    pub line: String,
    /// Bytes the line occupies in the device buffer, newline included
    pub length: usize,
}

/// Ordered record of unacknowledged lines with a running byte total
///
/// The total always equals the sum of the recorded lengths. Callers check
/// [`has_room`](Self::has_room) before [`push`](Self::push) to keep the
/// total within capacity.
#[derive(Debug, Clone)]
pub struct InFlightBuffer {
    entries: VecDeque<InFlightEntry>,
    total: usize,
    capacity: usize,
}

impl InFlightBuffer {
    /// Create an empty buffer for a device buffer of `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            total: 0,
            capacity,
        }
    }

    /// Bytes a framed line occupies once transmitted
    pub fn wire_length(line: &str) -> usize {
        line.len() + 1
    }

    /// Device buffer capacity in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently in flight
    pub fn total_bytes(&self) -> usize {
        self.total
    }

    /// Number of lines in flight
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when every transmitted line has been acknowledged
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a framed line fits next to what is already in flight
    pub fn has_room(&self, line: &str) -> bool {
        self.total + Self::wire_length(line) <= self.capacity
    }

    /// Whether a framed line could ever fit, even with nothing in flight
    pub fn fits_at_all(&self, line: &str) -> bool {
        Self::wire_length(line) <= self.capacity
    }

    /// Record a transmitted line; returns its wire length
    pub fn push(&mut self, line: String) -> usize {
        let length = Self::wire_length(&line);
        self.total += length;
        self.entries.push_back(InFlightEntry { line, length });
        length
    }

    /// Remove the oldest entry, as acknowledged by the device
    pub fn pop_oldest(&mut self) -> Option<InFlightEntry> {
        let entry = self.entries.pop_front()?;
        self.total -= entry.length;
        Some(entry)
    }

    /// Remove the newest entry if it is exactly `line`
    ///
    /// Used to release a reservation whose transmission failed.
    pub fn release_newest(&mut self, line: &str) -> Option<InFlightEntry> {
        if self.entries.back().map(|e| e.line.as_str()) != Some(line) {
            return None;
        }
        let entry = self.entries.pop_back()?;
        self.total -= entry.length;
        Some(entry)
    }

    /// Forget everything in flight
    pub fn clear(&mut self) {
        self.entries.clear();
        self.total = 0;
    }

    /// Iterate over entries, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &InFlightEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_push_and_pop_fifo() {
        let mut buffer = InFlightBuffer::new(128);
        assert_eq!(buffer.push("N1 G28 *18".to_string()), 11);
        buffer.push("N2 G1 X1 *42".to_string());
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.total_bytes(), 11 + 13);

        let first = buffer.pop_oldest().unwrap();
        assert_eq!(first.line, "N1 G28 *18");
        assert_eq!(buffer.total_bytes(), 13);
        buffer.pop_oldest();
        assert!(buffer.is_empty());
        assert_eq!(buffer.pop_oldest(), None);
        assert_eq!(buffer.total_bytes(), 0);
    }

    #[test]
    fn test_room_accounts_for_newline() {
        let mut buffer = InFlightBuffer::new(20);
        let line = "N1 G1 X10 *1".to_string(); // 12 bytes + newline
        assert!(buffer.has_room(&line));
        buffer.push(line);
        assert_eq!(buffer.total_bytes(), 13);
        assert!(!buffer.has_room("N2 G4 *3"));
        assert!(buffer.has_room("N2 *1"));
    }

    #[test]
    fn test_line_that_never_fits() {
        let buffer = InFlightBuffer::new(8);
        assert!(!buffer.fits_at_all("N1 G1 X1 *5"));
        assert!(buffer.fits_at_all("N1 *5"));
    }

    #[test]
    fn test_release_newest_only_matches_last() {
        let mut buffer = InFlightBuffer::new(128);
        buffer.push("A".to_string());
        buffer.push("B".to_string());
        assert_eq!(buffer.release_newest("A"), None);
        assert_eq!(buffer.release_newest("B").map(|e| e.length), Some(2));
        assert_eq!(buffer.total_bytes(), 2);
    }

    proptest! {
        #[test]
        fn prop_total_matches_entries(ops in prop::collection::vec(prop::option::of("[A-Z0-9 ]{1,20}"), 0..64)) {
            let mut buffer = InFlightBuffer::new(128);
            for op in ops {
                match op {
                    Some(line) if buffer.has_room(&line) => { buffer.push(line); }
                    Some(_) => {}
                    None => { buffer.pop_oldest(); }
                }
                let sum: usize = buffer.iter().map(|e| e.length).sum();
                prop_assert_eq!(buffer.total_bytes(), sum);
                prop_assert!(buffer.total_bytes() <= buffer.capacity());
            }
        }
    }
}

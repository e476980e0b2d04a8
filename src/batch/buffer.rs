//! Fixed-capacity batch buffer.

use crate::connection::ConnId;
use std::collections::TryReserveError;

/// Lifecycle of a batch generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    /// Available for reuse.
    Empty,
    /// Being populated by the client-read handler.
    Filling,
    /// Owned by the accelerator.
    Submitted,
    /// Accelerator signaled completion; not yet written back.
    Ready,
    /// Results being written to their connections.
    Forwarding,
}

impl BatchState {
    fn can_become(self, next: BatchState) -> bool {
        use BatchState::*;
        matches!(
            (self, next),
            (Empty, Filling)
                | (Filling, Submitted)
                | (Empty, Submitted)
                | (Submitted, Ready)
                | (Submitted, Empty)
                | (Ready, Forwarding)
                | (Forwarding, Empty)
        )
    }
}

/// One work item: a slice of the arena owned by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchItem {
    pub conn: ConnId,
    offset: usize,
    len: usize,
}

impl BatchItem {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A contiguous byte arena plus its item table.
///
/// Capacity is fixed when the buffer is allocated; pushes beyond it are
/// refused instead of growing the allocation.
#[derive(Debug)]
pub struct BatchBuffer {
    state: BatchState,
    items: Vec<BatchItem>,
    data: Vec<u8>,
    max_items: usize,
    max_bytes: usize,
}

impl BatchBuffer {
    /// Allocate a buffer holding up to `max_items` items and `max_bytes` bytes.
    pub fn allocate(max_items: usize, max_bytes: usize) -> Result<Self, TryReserveError> {
        let mut items = Vec::new();
        items.try_reserve_exact(max_items)?;
        let mut data = Vec::new();
        data.try_reserve_exact(max_bytes)?;
        Ok(Self {
            state: BatchState::Empty,
            items,
            data,
            max_items,
            max_bytes,
        })
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    /// Move to `next`. Illegal transitions are programming errors.
    pub(crate) fn transition(&mut self, next: BatchState) {
        debug_assert!(
            self.state.can_become(next),
            "illegal batch transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Bytes still available in the arena.
    pub fn remaining_bytes(&self) -> usize {
        self.max_bytes - self.data.len()
    }

    /// True when no further item can be pushed.
    pub fn is_full(&self) -> bool {
        self.items.len() >= self.max_items || self.remaining_bytes() == 0
    }

    pub fn max_items(&self) -> usize {
        self.max_items
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Append an item. Returns false, leaving the buffer unchanged, when it
    /// does not fit.
    pub fn push(&mut self, conn: ConnId, payload: &[u8]) -> bool {
        if self.items.len() >= self.max_items || payload.len() > self.remaining_bytes() {
            return false;
        }
        let offset = self.data.len();
        self.data.extend_from_slice(payload);
        self.items.push(BatchItem {
            conn,
            offset,
            len: payload.len(),
        });
        true
    }

    /// Payload bytes of an item.
    pub fn payload(&self, item: &BatchItem) -> &[u8] {
        &self.data[item.offset..item.offset + item.len]
    }

    /// Iterate items with their payloads in submission order.
    pub fn iter(&self) -> impl Iterator<Item = (ConnId, &[u8])> {
        self.items.iter().map(|item| (item.conn, self.payload(item)))
    }

    /// Drop all items, keeping the allocation.
    pub fn clear(&mut self) {
        self.items.clear();
        self.data.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(slot: usize) -> ConnId {
        ConnId::with_generation(slot, 0)
    }

    #[test]
    fn test_push_until_item_limit() {
        let mut buf = BatchBuffer::allocate(2, 64).unwrap();
        assert!(buf.push(id(0), b"a"));
        assert!(buf.push(id(1), b"bb"));
        assert!(buf.is_full());
        assert!(!buf.push(id(2), b"c"));
        assert_eq!(buf.len(), 2);

        let items: Vec<_> = buf.iter().collect();
        assert_eq!(items, vec![(id(0), &b"a"[..]), (id(1), &b"bb"[..])]);
    }

    #[test]
    fn test_push_until_byte_limit() {
        let mut buf = BatchBuffer::allocate(8, 4).unwrap();
        assert!(buf.push(id(0), b"abc"));
        assert!(!buf.push(id(0), b"de"));
        assert_eq!(buf.remaining_bytes(), 1);
        assert!(buf.push(id(0), b"d"));
        assert!(buf.is_full());
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let mut buf = BatchBuffer::allocate(4, 16).unwrap();
        buf.push(id(0), b"hello");
        let capacity = buf.data.capacity();
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.remaining_bytes(), 16);
        assert_eq!(buf.data.capacity(), capacity);
    }

    #[test]
    fn test_allocation_failure_is_reported() {
        assert!(BatchBuffer::allocate(1, usize::MAX).is_err());
    }

    #[test]
    fn test_legal_transitions() {
        use BatchState::*;
        assert!(Empty.can_become(Filling));
        assert!(Filling.can_become(Submitted));
        assert!(Submitted.can_become(Ready));
        assert!(Ready.can_become(Forwarding));
        assert!(Forwarding.can_become(Empty));
        assert!(!Empty.can_become(Forwarding));
        assert!(!Filling.can_become(Ready));
        assert!(!Forwarding.can_become(Submitted));
    }
}

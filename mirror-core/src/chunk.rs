//! Chunk multiplexing: per-connection slot allocation and chunk classification.

/// Default upload chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024; // 64 KiB

/// Concurrent downloads per connection. Kept below 256 so a one-byte slot never wraps onto a live one.
pub const MAX_SLOTS_PER_CONNECTION: usize = 128;

/// Hands out slot indices for one connection. Round-robin, so a slot that was just freed
/// is not reused until the others have been cycled through (late chunks from a cancelled
/// transfer then find no handler instead of corrupting a new one).
#[derive(Debug, Clone)]
pub struct SlotAllocator {
    in_use: [bool; MAX_SLOTS_PER_CONNECTION],
    next: usize,
    used: usize,
}

impl SlotAllocator {
    pub fn new() -> Self {
        Self {
            in_use: [false; MAX_SLOTS_PER_CONNECTION],
            next: 0,
            used: 0,
        }
    }

    /// Reserve a free slot, or None if all are taken.
    pub fn allocate(&mut self) -> Option<u8> {
        if self.used == MAX_SLOTS_PER_CONNECTION {
            return None;
        }
        for offset in 0..MAX_SLOTS_PER_CONNECTION {
            let idx = (self.next + offset) % MAX_SLOTS_PER_CONNECTION;
            if !self.in_use[idx] {
                self.in_use[idx] = true;
                self.used += 1;
                self.next = (idx + 1) % MAX_SLOTS_PER_CONNECTION;
                return Some(idx as u8);
            }
        }
        None
    }

    /// Return a slot. Releasing a free slot is a no-op.
    pub fn release(&mut self, slot: u8) {
        let idx = slot as usize;
        if idx < MAX_SLOTS_PER_CONNECTION && self.in_use[idx] {
            self.in_use[idx] = false;
            self.used -= 1;
        }
    }

    pub fn in_use(&self) -> usize {
        self.used
    }
}

impl Default for SlotAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// What a received `FileChunk` means for its transfer.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkEvent<'a> {
    Data(&'a [u8]),
    End,
}

/// Classify chunk data (slot byte already stripped): empty means end of transfer.
pub fn classify(data: &[u8]) -> ChunkEvent<'_> {
    if data.is_empty() {
        ChunkEvent::End
    } else {
        ChunkEvent::Data(data)
    }
}

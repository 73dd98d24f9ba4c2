use crate::{PatchError, Result};

/// log2 of the bank size of the target image (8 KiB banks).
pub const BANK_BITS: u32 = 13;

/// Largest bank size accepted from configuration (16 MiB).
pub const MAX_BANK_BITS: u32 = 24;

pub fn bank_of(addr: u32, bank_bits: u32) -> u32 {
    addr >> bank_bits
}

/// A single-bank span of free image space with a write cursor.
///
/// `start <= pos <= end` always holds and `pos` only moves forward.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Chunk {
    start: u32,
    end: u32,
    pos: u32,
    bank: u32,
}

impl Chunk {
    pub fn new(start: u32, end: u32, bank_bits: u32) -> Result<Self> {
        if start >= end {
            return Err(PatchError::EmptyRegion { start, end });
        }
        let bank = bank_of(start, bank_bits);
        if bank_of(end - 1, bank_bits) != bank {
            return Err(PatchError::Span {
                start,
                end,
                bank_size: 1 << bank_bits,
            });
        }
        Ok(Chunk {
            start,
            end,
            pos: start,
            bank,
        })
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn pos(&self) -> u32 {
        self.pos
    }

    pub fn bank(&self) -> u32 {
        self.bank
    }

    pub fn free(&self) -> u32 {
        self.end - self.pos
    }

    /// Looks for `data` inside the part of this chunk that has already
    /// been written. The unwritten tail never matches.
    pub fn find(&self, data: &[u8], image: &[u8]) -> Option<u32> {
        let written = &image[self.start as usize..self.pos as usize];
        if data.is_empty() {
            return Some(self.start);
        }
        written
            .windows(data.len())
            .position(|w| w == data)
            .map(|i| self.start + i as u32)
    }

    /// Claims `len` bytes at the cursor and returns their address.
    pub(crate) fn take(&mut self, len: u32) -> u32 {
        debug_assert!(len <= self.free());
        let addr = self.pos;
        self.pos += len;
        addr
    }
}

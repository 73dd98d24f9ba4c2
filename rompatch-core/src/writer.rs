use std::collections::BTreeMap;
use std::fmt;

use log::{debug, info, warn};
use thiserror::Error;

use crate::chunk::{bank_of, Chunk, BANK_BITS, MAX_BANK_BITS};
use crate::{PatchError, Result};

/// A write that found no room in any chunk of its bank range.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("could not find {len} free bytes in banks {start_page:#x}..={end_page:#x} to write {name}")]
pub struct OutOfSpaceError {
    pub start_page: u32,
    pub end_page: u32,
    pub len: usize,
    pub name: String,
}

/// Runs once its write has been placed (or rejected), after the rest of the
/// round it belonged to.
pub type Continuation =
    Box<dyn FnOnce(&mut Writer, std::result::Result<u32, OutOfSpaceError>) -> Result<()>>;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct WriteId(usize);

/// Final outcome of one write and the commit round that produced it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Settled {
    pub round: usize,
    pub result: std::result::Result<u32, OutOfSpaceError>,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CommitStats {
    pub rounds: usize,
    pub placed: usize,
    pub deduplicated: usize,
    pub rejected: usize,
    pub bytes_written: usize,
}

struct WriteRequest {
    id: WriteId,
    data: Vec<u8>,
    start_page: u32,
    end_page: u32,
    name: String,
    then: Option<Continuation>,
}

impl WriteRequest {
    fn span(&self) -> u32 {
        self.end_page - self.start_page
    }
}

/// Owns the target image and places queued byte sequences into its
/// declared free space.
///
/// Writes are lazy: `write` only queues a request and `commit` places
/// everything in rounds, most constrained and largest first. A
/// continuation may queue more writes; those land in the following round.
pub struct Writer {
    image: Vec<u8>,
    bank_bits: u32,
    chunks: Vec<Chunk>,
    free: BTreeMap<u32, u32>,
    pending: Vec<WriteRequest>,
    outcomes: Vec<Option<Settled>>,
    round: usize,
}

impl fmt::Debug for Writer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writer")
            .field("image_len", &self.image.len())
            .field("bank_bits", &self.bank_bits)
            .field("chunks", &self.chunks)
            .field("pending", &self.pending.len())
            .field("round", &self.round)
            .finish()
    }
}

impl Writer {
    pub fn new(image: Vec<u8>) -> Self {
        Self::build(image, BANK_BITS)
    }

    /// Uses banks of `1 << bank_bits` bytes; `bank_bits` must lie in
    /// `1..=MAX_BANK_BITS`.
    pub fn with_bank_bits(image: Vec<u8>, bank_bits: u32) -> Result<Self> {
        if !(1..=MAX_BANK_BITS).contains(&bank_bits) {
            return Err(PatchError::Config(format!(
                "bank_bits must be between 1 and {}, got {}",
                MAX_BANK_BITS, bank_bits
            )));
        }
        Ok(Self::build(image, bank_bits))
    }

    fn build(image: Vec<u8>, bank_bits: u32) -> Self {
        Writer {
            image,
            bank_bits,
            chunks: Vec::new(),
            free: BTreeMap::new(),
            pending: Vec::new(),
            outcomes: Vec::new(),
            round: 0,
        }
    }

    pub fn bank(&self, addr: u32) -> u32 {
        bank_of(addr, self.bank_bits)
    }

    /// Declares `[start, end)` as free, split into one chunk per bank.
    pub fn alloc(&mut self, start: u32, end: u32) -> Result<()> {
        if start >= end {
            return Err(PatchError::EmptyRegion { start, end });
        }
        if end as usize > self.image.len() {
            return Err(PatchError::OutOfBounds {
                start,
                end,
                len: self.image.len(),
            });
        }
        let mut start = start;
        while self.bank(end - 1) > self.bank(start) {
            let boundary = (self.bank(start) + 1) << self.bank_bits;
            self.add_chunk(Chunk::new(start, boundary, self.bank_bits)?);
            start = boundary;
        }
        self.add_chunk(Chunk::new(start, end, self.bank_bits)?);
        Ok(())
    }

    fn add_chunk(&mut self, chunk: Chunk) {
        debug!(
            "free chunk ${:05x}..${:05x} in bank {:#x} ({} bytes)",
            chunk.start(),
            chunk.end(),
            chunk.bank(),
            chunk.free()
        );
        *self.free.entry(chunk.bank()).or_insert(0) += chunk.free();
        self.chunks.push(chunk);
    }

    /// Queues `data` for placement in the banks covered by `[start, end)`.
    ///
    /// The range must not be empty. Release builds clamp an empty range to
    /// the single bank holding `start`.
    pub fn write(
        &mut self,
        data: impl Into<Vec<u8>>,
        start: u32,
        end: u32,
        name: impl Into<String>,
    ) -> WriteId {
        self.enqueue(data.into(), start, end, name.into(), None)
    }

    /// Like [`Writer::write`], running `then` with the outcome once the
    /// round that services the request has finished placing.
    pub fn write_then<F>(
        &mut self,
        data: impl Into<Vec<u8>>,
        start: u32,
        end: u32,
        name: impl Into<String>,
        then: F,
    ) -> WriteId
    where
        F: FnOnce(&mut Writer, std::result::Result<u32, OutOfSpaceError>) -> Result<()> + 'static,
    {
        self.enqueue(data.into(), start, end, name.into(), Some(Box::new(then)))
    }

    fn enqueue(
        &mut self,
        data: Vec<u8>,
        start: u32,
        end: u32,
        name: String,
        then: Option<Continuation>,
    ) -> WriteId {
        debug_assert!(
            start < end,
            "{}: empty write range ${:05x}..${:05x}",
            name,
            start,
            end
        );
        let start_page = self.bank(start);
        let end_page = self.bank(end.saturating_sub(1)).max(start_page);
        let id = WriteId(self.outcomes.len());
        self.outcomes.push(None);
        self.pending.push(WriteRequest {
            id,
            data,
            start_page,
            end_page,
            name,
            then,
        });
        id
    }

    /// Drains the queue round by round until no continuation adds more.
    ///
    /// A continuation error stops neither the rest of its round nor the
    /// writes queued by other continuations; the first one is returned
    /// once the queue is empty.
    pub fn commit(&mut self) -> Result<CommitStats> {
        let mut stats = CommitStats::default();
        let mut first_err = None;
        while !self.pending.is_empty() {
            self.round += 1;
            stats.rounds += 1;

            let mut batch = std::mem::take(&mut self.pending);
            batch.sort_by(|a, b| {
                a.span()
                    .cmp(&b.span())
                    .then_with(|| b.data.len().cmp(&a.data.len()))
            });
            debug!("round {}: {} writes", self.round, batch.len());

            let mut settled = Vec::with_capacity(batch.len());
            for request in batch {
                let result = self.place(&request, &mut stats);
                self.outcomes[request.id.0] = Some(Settled {
                    round: self.round,
                    result: result.clone(),
                });
                if let Some(then) = request.then {
                    settled.push((then, result));
                }
            }

            for (then, result) in settled {
                if let Err(err) = then(self, result) {
                    first_err.get_or_insert(err);
                }
            }
        }

        info!(
            "commit: {} rounds, {} placed, {} deduplicated, {} rejected, {} bytes",
            stats.rounds, stats.placed, stats.deduplicated, stats.rejected, stats.bytes_written
        );
        match first_err {
            Some(err) => Err(err),
            None => Ok(stats),
        }
    }

    fn in_range<'a>(&'a self, request: &'a WriteRequest) -> impl Iterator<Item = usize> + 'a {
        self.chunks
            .iter()
            .enumerate()
            .filter(move |(_, c)| c.bank() >= request.start_page && c.bank() <= request.end_page)
            .map(|(i, _)| i)
    }

    fn place(
        &mut self,
        request: &WriteRequest,
        stats: &mut CommitStats,
    ) -> std::result::Result<u32, OutOfSpaceError> {
        for i in self.in_range(request) {
            if let Some(addr) = self.chunks[i].find(&request.data, &self.image) {
                debug!("{}: reusing ${:05x}", request.name, addr);
                stats.deduplicated += 1;
                return Ok(addr);
            }
        }

        let len = request.data.len();
        let fit = self
            .in_range(request)
            .find(|&i| self.chunks[i].free() as usize >= len);
        if let Some(i) = fit {
            let chunk = &mut self.chunks[i];
            let addr = chunk.take(len as u32);
            let bank = chunk.bank();
            self.image[addr as usize..addr as usize + len].copy_from_slice(&request.data);
            if let Some(free) = self.free.get_mut(&bank) {
                *free -= len as u32;
            }
            debug!("{}: wrote {} bytes at ${:05x}", request.name, len, addr);
            stats.placed += 1;
            stats.bytes_written += len;
            return Ok(addr);
        }

        warn!(
            "{}: write failed, {} bytes: {}",
            request.name,
            len,
            hex_bytes(&request.data)
        );
        stats.rejected += 1;
        Err(OutOfSpaceError {
            start_page: request.start_page,
            end_page: request.end_page,
            len,
            name: request.name.clone(),
        })
    }

    pub fn outcome(&self, id: WriteId) -> Option<&Settled> {
        self.outcomes.get(id.0).and_then(|o| o.as_ref())
    }

    /// Number of rounds started so far.
    pub fn round(&self) -> usize {
        self.round
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn free_in_bank(&self, bank: u32) -> u32 {
        self.free.get(&bank).copied().unwrap_or(0)
    }

    pub fn free_by_bank(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.free.iter().map(|(&bank, &free)| (bank, free))
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn into_image(self) -> Vec<u8> {
        self.image
    }

    /// Overwrites bytes at a fixed address, e.g. a pointer table entry.
    pub fn patch(&mut self, at: u32, bytes: &[u8]) -> Result<()> {
        let start = at as usize;
        let end = start + bytes.len();
        if end > self.image.len() {
            return Err(PatchError::OutOfBounds {
                start: at,
                end: end as u32,
                len: self.image.len(),
            });
        }
        self.image[start..end].copy_from_slice(bytes);
        Ok(())
    }

    pub fn patch_u16_le(&mut self, at: u32, value: u16) -> Result<()> {
        self.patch(at, &value.to_le_bytes())
    }

    pub fn patch_u16_be(&mut self, at: u32, value: u16) -> Result<()> {
        self.patch(at, &value.to_be_bytes())
    }
}

fn hex_bytes(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

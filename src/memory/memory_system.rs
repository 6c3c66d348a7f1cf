#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use std::fmt::Display;

use crate::common::{Address, Cycle, PipelineStage, Word, LINE_LEN};
use crate::memory::memory_line::MemLine;

use anyhow::{anyhow, Result};
use log::{error, info};

/// Outcome of a single poll of a memory operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemResponse<T> {
    Wait,
    Complete(T),
}

impl<T> MemResponse<T> {
    pub fn is_wait(&self) -> bool {
        matches!(self, MemResponse::Wait)
    }

    /// Returns the completed value, if any
    pub fn complete(self) -> Option<T> {
        match self {
            MemResponse::Wait => None,
            MemResponse::Complete(val) => Some(val),
        }
    }
}

/// Identity of an outstanding request. A request is continued only by
/// polling again with the same identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId {
    pub issuer: PipelineStage,
    pub address: Address,
}

impl RequestId {
    pub fn new(issuer: PipelineStage, address: Address) -> Self {
        Self { issuer, address }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub id: RequestId,
    pub remaining: Cycle,
}

/// Common operations shared by main memory and the cache in front of it.
/// Each call is one poll: a `Wait` must be retried with the same issuer and
/// address until it completes.
pub trait MemoryInterface {
    fn read(&mut self, issuer: PipelineStage, address: Address) -> MemResponse<Word>;

    fn write(&mut self, issuer: PipelineStage, address: Address, value: Word) -> MemResponse<()>;

    fn get_line(&mut self, issuer: PipelineStage, address: Address) -> MemResponse<MemLine>;

    /// Writes as many of `words` as fit between `address` and the end of its
    /// line, completing with the number of words written
    fn write_line_partial(
        &mut self,
        issuer: PipelineStage,
        address: Address,
        words: &[Word],
    ) -> MemResponse<usize>;

    /// Store path used by the pipeline, allowed to differ from `write` in
    /// its allocation policy
    fn store(&mut self, issuer: PipelineStage, address: Address, value: Word) -> MemResponse<()> {
        self.write(issuer, address, value)
    }
}

/// Polls `access` until it completes, giving up after `limit` polls
pub fn complete_blocking<T>(
    limit: usize,
    mut access: impl FnMut() -> MemResponse<T>,
) -> Result<T> {
    for _ in 0..limit {
        if let MemResponse::Complete(val) = access() {
            return Ok(val);
        }
    }
    Err(anyhow!("Memory request did not complete after {limit} polls"))
}

#[derive(Debug, Clone)]
pub struct Memory {
    contents: Vec<MemLine>,
    delay: Cycle,
    pending: Option<PendingRequest>,
}

impl Display for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let conts = self
            .contents
            .iter()
            .filter(|line| line.words().iter().any(|&word| word != 0))
            .fold(String::new(), |accum, line| accum + &format!("{line}\n"));
        write!(
            f,
            "Delay: {}\nCurrent Request: {:?}\n\nContents (non-zero lines):\n{}",
            self.delay, self.pending, conts
        )?;

        Ok(())
    }
}

impl Memory {
    /// Creates a new `Memory` with `n_lines` zeroed lines, where every request
    /// completes on the `delay + 1`th poll
    pub fn new(n_lines: usize, delay: Cycle) -> Result<Self> {
        if n_lines == 0 {
            return Err(anyhow!("Main memory needs at least one line"));
        }
        info!("Creating main memory with {n_lines} lines and a delay of {delay} cycles");

        let contents = (0..n_lines)
            .map(|line| MemLine::new(Some(line * LINE_LEN)))
            .collect();

        Ok(Self {
            contents,
            delay,
            pending: None,
        })
    }

    /// Checks whether the request `id` has to keep waiting, arming the tracker
    /// if nothing is outstanding. Any other identity waits until the armed
    /// request completes.
    fn needs_to_wait(&mut self, id: RequestId) -> bool {
        let delay = self.delay;
        let pending = self.pending.get_or_insert_with(|| {
            info!("Memory: arming request {id:?}, {delay} cycles");
            PendingRequest {
                id,
                remaining: delay,
            }
        });

        if pending.id != id {
            info!("Memory: {id:?} waiting on {:?}", pending.id);
            return true;
        }
        if pending.remaining == 0 {
            info!("Memory: request {id:?} completed");
            self.pending = None;
            return false;
        }
        pending.remaining -= 1;

        true
    }

    /// Returns the number of addressable words
    pub fn capacity(&self) -> usize {
        self.contents.len() * LINE_LEN
    }

    /// Returns the number of lines in main memory
    pub fn num_lines(&self) -> usize {
        self.contents.len()
    }

    pub fn delay(&self) -> Cycle {
        self.delay
    }

    /// Returns the currently armed request, if any
    pub fn pending(&self) -> Option<PendingRequest> {
        self.pending
    }

    /// Drops the armed request if `issuer` owns it
    pub fn release(&mut self, issuer: PipelineStage) {
        if self.pending.is_some_and(|req| req.id.issuer == issuer) {
            info!("Memory: {issuer} abandoned request {:?}", self.pending);
            self.pending = None;
        }
    }

    /// Drops the armed request if `id.issuer` owns it under another address.
    /// Each issuer has at most one access in flight, so a request it no
    /// longer polls has been abandoned.
    pub fn release_stale(&mut self, id: RequestId) {
        if self
            .pending
            .is_some_and(|req| req.id.issuer == id.issuer && req.id != id)
        {
            info!("Memory: {} abandoned request {:?}", id.issuer, self.pending);
            self.pending = None;
        }
    }

    /// Drops any armed request
    pub fn clear_pending(&mut self) {
        self.pending = None;
    }

    /// Maps any address onto the memory, wrapping past the end
    pub fn wrap(&self, address: Address) -> Address {
        address % self.capacity()
    }

    /// Returns the address of the first word of the line holding `address`
    pub fn line_start(&self, address: Address) -> Address {
        let address = self.wrap(address);
        address - address % LINE_LEN
    }

    fn address_index(&self, address: Address) -> usize {
        self.wrap(address) / LINE_LEN
    }

    /// Writes a full line through the wait-state tracker
    pub fn write_line(
        &mut self,
        issuer: PipelineStage,
        address: Address,
        data: &[Word; LINE_LEN],
    ) -> MemResponse<()> {
        if self.needs_to_wait(RequestId::new(issuer, address)) {
            return MemResponse::Wait;
        }
        self.force_store_line(address, data);

        MemResponse::Complete(())
    }

    // for testing/ debugging
    pub fn force_store(&mut self, address: Address, data: Word) {
        let address = self.wrap(address);
        let idx = self.address_index(address);
        if let Err(e) = self.contents[idx].write(address, data) {
            error!("force_store: write to {address} with {data} failed -- error {e}");
        }
    }

    /// Overwrites the line holding `address` without going through the
    /// wait-state tracker
    pub fn force_store_line(&mut self, address: Address, data: &[Word; LINE_LEN]) {
        let start = self.line_start(address);
        let idx = self.address_index(address);
        self.contents[idx] = MemLine::from_words(start, *data);
    }

    /// Debug read of a single word, bypassing the wait-state tracker
    pub fn peek(&self, address: Address) -> Word {
        let address = self.wrap(address);
        self.contents[self.address_index(address)]
            .get_contents(address)
            .unwrap_or_default()
    }

    /// Debug read of the line holding `address`
    pub fn peek_line(&self, address: Address) -> MemLine {
        self.contents[self.address_index(address)]
    }

    /// Lines overlapping the word range `from..to`
    pub fn lines_in_range(&self, from: Address, to: Address) -> impl Iterator<Item = &MemLine> {
        let first = from / LINE_LEN;
        let last = to.div_ceil(LINE_LEN).min(self.contents.len());
        self.contents
            .get(first.min(last)..last)
            .unwrap_or_default()
            .iter()
    }
}

impl MemoryInterface for Memory {
    fn read(&mut self, issuer: PipelineStage, address: Address) -> MemResponse<Word> {
        if self.needs_to_wait(RequestId::new(issuer, address)) {
            return MemResponse::Wait;
        }
        MemResponse::Complete(self.peek(address))
    }

    fn write(&mut self, issuer: PipelineStage, address: Address, value: Word) -> MemResponse<()> {
        if self.needs_to_wait(RequestId::new(issuer, address)) {
            return MemResponse::Wait;
        }
        self.force_store(address, value);

        MemResponse::Complete(())
    }

    fn get_line(&mut self, issuer: PipelineStage, address: Address) -> MemResponse<MemLine> {
        if self.needs_to_wait(RequestId::new(issuer, address)) {
            return MemResponse::Wait;
        }
        MemResponse::Complete(self.peek_line(address))
    }

    fn write_line_partial(
        &mut self,
        issuer: PipelineStage,
        address: Address,
        words: &[Word],
    ) -> MemResponse<usize> {
        if self.needs_to_wait(RequestId::new(issuer, address)) {
            return MemResponse::Wait;
        }
        let address = self.wrap(address);
        let idx = self.address_index(address);
        match self.contents[idx].write_partial(address, words) {
            Ok(count) => MemResponse::Complete(count),
            Err(e) => {
                error!("write_line_partial: write to {address} failed -- error {e}");
                MemResponse::Complete(0)
            }
        }
    }
}

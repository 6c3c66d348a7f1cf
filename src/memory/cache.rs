#![warn(clippy::all, clippy::pedantic)]

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::ops::Range;

use crate::common::{Address, PipelineStage, Word, LINE_LEN};
use crate::memory::memory_line::MemLine;
use crate::memory::memory_system::{Memory, MemoryInterface, MemResponse, RequestId};

use anyhow::{anyhow, Result};
use log::{error, info, warn};

pub const NUM_SETS: usize = 4;
/// Consecutive addresses mapping to the same set
const SET_STRIDE: usize = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheLine {
    pub line: MemLine,
    pub valid: bool,
    pub dirty: bool,
    /// Recency rank within the set, 0 is most recent. `None` until first use.
    pub lru: Option<usize>,
}

impl CacheLine {
    /// The line-aligned main memory address held by this line
    pub fn tag(&self) -> Option<Address> {
        self.line.start_address()
    }
}

impl Display for CacheLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lru = self
            .lru
            .map_or_else(|| String::from("-"), |rank| rank.to_string());
        write!(
            f,
            "V:{} D:{} LRU:{lru:>2} {}",
            u8::from(self.valid),
            u8::from(self.dirty),
            self.line
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub writebacks: usize,
}

/// Write-back, `NUM_SETS`-way interleaved set-associative cache in front of
/// main memory
#[derive(Debug, Clone)]
pub struct Cache {
    lines: Vec<CacheLine>,
    ways: usize,
    next: Memory,
    write_allocate: bool,
    /// Victim way held by an issuer across the polls of a miss
    reservations: HashMap<PipelineStage, (Address, usize)>,
    stats: CacheStats,
}

impl Display for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Sets: {NUM_SETS}, Ways: {}, Write allocate: {}",
            self.ways, self.write_allocate
        )?;
        writeln!(
            f,
            "Hits: {}, Misses: {}, Writebacks: {}",
            self.stats.hits, self.stats.misses, self.stats.writebacks
        )?;
        for (idx, line) in self.lines.iter().enumerate() {
            writeln!(
                f,
                "[set {} way {}] {line}",
                idx / self.ways,
                idx % self.ways
            )?;
        }

        Ok(())
    }
}

impl Cache {
    /// Creates a cache of `n_lines` lines spread over `NUM_SETS` sets,
    /// backed by `next`
    pub fn new(n_lines: usize, next: Memory) -> Result<Self> {
        if n_lines == 0 || n_lines % NUM_SETS != 0 {
            return Err(anyhow!(
                "Cache line count must be a non-zero multiple of {NUM_SETS}, got {n_lines}"
            ));
        }
        let ways = n_lines / NUM_SETS;
        info!("Creating cache with {NUM_SETS} sets of {ways} ways");

        Ok(Self {
            lines: vec![CacheLine::default(); n_lines],
            ways,
            next,
            write_allocate: false,
            reservations: HashMap::new(),
            stats: CacheStats::default(),
        })
    }

    pub fn with_write_allocate(mut self, write_allocate: bool) -> Self {
        self.write_allocate = write_allocate;
        self
    }

    pub fn write_allocate(&self) -> bool {
        self.write_allocate
    }

    /// Set an address maps to
    pub fn set_index(address: Address) -> usize {
        (address / SET_STRIDE) % NUM_SETS
    }

    fn set_range(&self, address: Address) -> Range<usize> {
        let set = Self::set_index(address);
        set * self.ways..(set + 1) * self.ways
    }

    /// Way holding `tag`, valid or not
    fn find(&self, tag: Address) -> Option<usize> {
        self.set_range(tag)
            .find(|&idx| self.lines[idx].tag() == Some(tag))
    }

    /// Way holding a valid copy of `tag`
    fn lookup(&self, tag: Address) -> Option<usize> {
        let idx = self.find(tag)?;
        if self.lines[idx].valid {
            Some(idx)
        } else {
            info!("Cache: invalid bit encountered for tag 0x{tag:08X}");
            None
        }
    }

    /// Makes `idx` the most recently used way of its set
    fn touch(&mut self, idx: usize) {
        let old = self.lines[idx].lru;
        let set_start = idx - idx % self.ways;
        for other in set_start..set_start + self.ways {
            if other == idx {
                continue;
            }
            if let Some(rank) = self.lines[other].lru.as_mut() {
                if old.map_or(true, |old| *rank < old) {
                    *rank += 1;
                }
            }
        }
        self.lines[idx].lru = Some(0);
    }

    /// Picks the way `tag` will be installed into: a way already carrying the
    /// tag, else the first unused way, else the least recently used one. Ways
    /// reserved by other issuers are skipped while any other choice remains.
    fn choose_victim(&mut self, issuer: PipelineStage, tag: Address) -> usize {
        if let Some(&(reserved_tag, idx)) = self.reservations.get(&issuer) {
            if reserved_tag == tag {
                return idx;
            }
        }

        let taken: HashSet<usize> = self
            .reservations
            .iter()
            .filter(|(other, _)| **other != issuer)
            .map(|(_, &(_, idx))| idx)
            .collect();
        let range = self.set_range(tag);
        let victim = self
            .find(tag)
            .or_else(|| {
                range
                    .clone()
                    .find(|idx| !self.lines[*idx].valid && !taken.contains(idx))
            })
            .or_else(|| {
                range
                    .clone()
                    .filter(|idx| !taken.contains(idx))
                    .max_by_key(|&idx| self.lines[idx].lru)
            })
            .unwrap_or_else(|| {
                range
                    .clone()
                    .max_by_key(|&idx| self.lines[idx].lru)
                    .unwrap_or(range.start)
            });

        info!("Cache: {issuer} reserved way {victim} for tag 0x{tag:08X}");
        self.reservations.insert(issuer, (tag, victim));
        victim
    }

    /// Releases whatever `issuer` held for an access that just completed
    fn finish(&mut self, issuer: PipelineStage) {
        self.reservations.remove(&issuer);
        self.next.release(issuer);
    }

    /// Writes a dirty way back to main memory, one poll at a time
    fn writeback_if_dirty(&mut self, issuer: PipelineStage, idx: usize) -> MemResponse<()> {
        let victim = self.lines[idx];
        let (true, Some(tag)) = (victim.dirty, victim.tag()) else {
            return MemResponse::Complete(());
        };
        let id = RequestId::new(issuer, tag);
        self.next.release_stale(id);
        match self.next.write_line(issuer, tag, victim.line.words()) {
            MemResponse::Wait => MemResponse::Wait,
            MemResponse::Complete(()) => {
                info!("Cache: wrote back dirty line 0x{tag:08X}");
                self.lines[idx].dirty = false;
                self.stats.writebacks += 1;
                MemResponse::Complete(())
            }
        }
    }

    /// Brings the line `tag` in from main memory, writing back the victim first
    fn fill(&mut self, issuer: PipelineStage, tag: Address) -> MemResponse<usize> {
        let idx = self.choose_victim(issuer, tag);
        if self.writeback_if_dirty(issuer, idx).is_wait() {
            return MemResponse::Wait;
        }

        let id = RequestId::new(issuer, tag);
        self.next.release_stale(id);
        let MemResponse::Complete(line) = self.next.get_line(issuer, tag) else {
            return MemResponse::Wait;
        };
        info!("Cache: {issuer} filled way {idx} with line 0x{tag:08X}");
        self.lines[idx] = CacheLine {
            line,
            valid: true,
            dirty: false,
            lru: self.lines[idx].lru,
        };
        self.touch(idx);
        self.stats.misses += 1;
        self.finish(issuer);

        MemResponse::Complete(idx)
    }

    /// Finds or brings in the line holding `address`
    fn resolve(&mut self, issuer: PipelineStage, tag: Address) -> MemResponse<usize> {
        if let Some(idx) = self.lookup(tag) {
            self.stats.hits += 1;
            self.touch(idx);
            self.finish(issuer);
            MemResponse::Complete(idx)
        } else {
            self.fill(issuer, tag)
        }
    }

    /// Updates words of a present line, writing back its previous contents
    /// first if it was dirty
    fn write_hit(
        &mut self,
        issuer: PipelineStage,
        idx: usize,
        address: Address,
        words: &[Word],
    ) -> MemResponse<usize> {
        if self.writeback_if_dirty(issuer, idx).is_wait() {
            return MemResponse::Wait;
        }
        let count = match self.lines[idx].line.write_partial(address, words) {
            Ok(count) => count,
            Err(e) => {
                error!("Cache: write to {address} failed -- error {e}");
                0
            }
        };
        self.lines[idx].dirty = true;
        self.touch(idx);
        self.finish(issuer);

        MemResponse::Complete(count)
    }

    /// Installs `data` as the line holding `address`, whether or not the tag
    /// was already present. The way's previous contents are written back
    /// first when dirty.
    pub fn direct_write(
        &mut self,
        issuer: PipelineStage,
        address: Address,
        data: &[Word; LINE_LEN],
        dirty: bool,
    ) -> MemResponse<()> {
        let tag = self.next.line_start(address);
        let idx = match self.find(tag) {
            Some(idx) => idx,
            None => self.choose_victim(issuer, tag),
        };
        if self.writeback_if_dirty(issuer, idx).is_wait() {
            return MemResponse::Wait;
        }

        self.lines[idx] = CacheLine {
            line: MemLine::from_words(tag, *data),
            valid: true,
            dirty,
            lru: self.lines[idx].lru,
        };
        self.touch(idx);
        self.finish(issuer);

        MemResponse::Complete(())
    }

    /// Drops the line holding `address`, writing it back first if dirty. The
    /// tag is kept so a later fill reuses the way.
    pub fn invalidate(&mut self, address: Address) {
        let tag = self.next.line_start(address);
        let Some(idx) = self.find(tag) else {
            return;
        };
        if self.lines[idx].dirty {
            self.next.force_store_line(tag, self.lines[idx].line.words());
            self.stats.writebacks += 1;
        }

        let removed = self.lines[idx].lru.take();
        for other in self.set_range(tag) {
            if let (Some(rank), Some(removed)) = (self.lines[other].lru.as_mut(), removed) {
                if *rank > removed {
                    *rank -= 1;
                }
            }
        }
        self.lines[idx].valid = false;
        self.lines[idx].dirty = false;
        info!("Cache: invalidated line 0x{tag:08X}");
    }

    /// Writes every dirty line back to main memory
    pub fn flush(&mut self) {
        for line in &mut self.lines {
            if let (true, Some(tag)) = (line.dirty, line.tag()) {
                self.next.force_store_line(tag, line.line.words());
                line.dirty = false;
                self.stats.writebacks += 1;
            }
        }
    }

    /// Debug read of a cached word, leaving recency untouched
    pub fn peek(&self, address: Address) -> Option<Word> {
        let address = self.next.wrap(address);
        let tag = self.next.line_start(address);
        let idx = self.find(tag).filter(|&idx| self.lines[idx].valid)?;
        self.lines[idx].line.get_contents(address)
    }

    /// Debug read of the line at `index`, counting ways of set 0 first
    pub fn line_info(&self, index: usize) -> Option<&CacheLine> {
        self.lines.get(index)
    }

    pub fn lines(&self) -> &[CacheLine] {
        &self.lines
    }

    pub fn num_lines(&self) -> usize {
        self.lines.len()
    }

    pub fn ways(&self) -> usize {
        self.ways
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn main_memory(&self) -> &Memory {
        &self.next
    }

    pub fn main_memory_mut(&mut self) -> &mut Memory {
        &mut self.next
    }

    /// Forgets every in-progress access
    pub fn clear_pending(&mut self) {
        if !self.reservations.is_empty() {
            warn!("Cache: dropping reservations {:?}", self.reservations);
        }
        self.reservations.clear();
        self.next.clear_pending();
    }
}

impl MemoryInterface for Cache {
    fn read(&mut self, issuer: PipelineStage, address: Address) -> MemResponse<Word> {
        let address = self.next.wrap(address);
        let tag = self.next.line_start(address);
        match self.resolve(issuer, tag) {
            MemResponse::Wait => MemResponse::Wait,
            MemResponse::Complete(idx) => MemResponse::Complete(
                self.lines[idx]
                    .line
                    .get_contents(address)
                    .unwrap_or_default(),
            ),
        }
    }

    fn write(&mut self, issuer: PipelineStage, address: Address, value: Word) -> MemResponse<()> {
        let address = self.next.wrap(address);
        let tag = self.next.line_start(address);
        let Some(idx) = self.lookup(tag) else {
            self.next.release_stale(RequestId::new(issuer, address));
            return self.next.write(issuer, address, value);
        };
        let response = self.write_hit(issuer, idx, address, &[value]);
        if !response.is_wait() {
            self.stats.hits += 1;
        }
        match response {
            MemResponse::Wait => MemResponse::Wait,
            MemResponse::Complete(_) => MemResponse::Complete(()),
        }
    }

    fn get_line(&mut self, issuer: PipelineStage, address: Address) -> MemResponse<MemLine> {
        let tag = self.next.line_start(address);
        match self.resolve(issuer, tag) {
            MemResponse::Wait => MemResponse::Wait,
            MemResponse::Complete(idx) => MemResponse::Complete(self.lines[idx].line),
        }
    }

    fn write_line_partial(
        &mut self,
        issuer: PipelineStage,
        address: Address,
        words: &[Word],
    ) -> MemResponse<usize> {
        let address = self.next.wrap(address);
        let tag = self.next.line_start(address);
        let Some(idx) = self.lookup(tag) else {
            self.next.release_stale(RequestId::new(issuer, address));
            return self.next.write_line_partial(issuer, address, words);
        };
        let response = self.write_hit(issuer, idx, address, words);
        if !response.is_wait() {
            self.stats.hits += 1;
        }
        response
    }

    /// Without write-allocate a store is a plain write. With it, a missing
    /// line is brought in first and the store then lands in the cache.
    fn store(&mut self, issuer: PipelineStage, address: Address, value: Word) -> MemResponse<()> {
        if !self.write_allocate {
            return self.write(issuer, address, value);
        }
        let address = self.next.wrap(address);
        let tag = self.next.line_start(address);
        let idx = match self.lookup(tag) {
            Some(idx) => idx,
            None => match self.fill(issuer, tag) {
                MemResponse::Wait => return MemResponse::Wait,
                MemResponse::Complete(idx) => idx,
            },
        };
        match self.write_hit(issuer, idx, address, &[value]) {
            MemResponse::Wait => MemResponse::Wait,
            MemResponse::Complete(_) => MemResponse::Complete(()),
        }
    }
}

#![warn(clippy::all, clippy::pedantic)]

use std::fmt::Display;

use crate::common::{Address, Word, LINE_LEN};

use anyhow::{anyhow, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemLine {
    start_addr: Option<Address>,
    data: [Word; LINE_LEN],
}

impl MemLine {
    /// Constructs a new zeroed `MemLine`. Optionally specify the address
    /// of the first word in the line with `start_addr`
    pub fn new(start_addr: Option<Address>) -> Self {
        Self {
            start_addr,
            data: [0; LINE_LEN],
        }
    }

    /// Constructs a line starting at `start_addr` holding `data`
    pub fn from_words(start_addr: Address, data: [Word; LINE_LEN]) -> Self {
        Self {
            start_addr: Some(start_addr),
            data,
        }
    }

    /// Returns the address of the first word in the line
    pub fn start_address(&self) -> Option<Address> {
        self.start_addr
    }

    /// Returns the words held by the line
    pub fn words(&self) -> &[Word; LINE_LEN] {
        &self.data
    }

    /// Returns the contents stored at `address`
    pub fn get_contents(&self, address: Address) -> Option<Word> {
        let start_addr = self.start_addr?;
        if self.contains_address(address) {
            Some(self.data[address - start_addr])
        } else {
            None
        }
    }

    /// Indicates whether the given `address` is contained within the memory
    /// line
    pub fn contains_address(&self, address: Address) -> bool {
        let Some(start_addr) = self.start_addr else {
            return false;
        };
        (start_addr..start_addr + LINE_LEN).contains(&address)
    }

    /// Writes a single word at `address`
    pub fn write(&mut self, address: Address, data: Word) -> Result<()> {
        self.write_partial(address, &[data]).map(|_| ())
    }

    /// Writes as many of `data` as fit between `address` and the end of the
    /// line, returning how many words were written
    pub fn write_partial(&mut self, address: Address, data: &[Word]) -> Result<usize> {
        let Some(start_addr) = self.start_addr.filter(|_| self.contains_address(address)) else {
            return Err(anyhow!("Address {address} not contained within line"));
        };
        let offset = address - start_addr;
        let count = data.len().min(LINE_LEN - offset);
        self.data[offset..offset + count].copy_from_slice(&data[..count]);

        Ok(count)
    }
}

impl Display for MemLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let words = self
            .data
            .iter()
            .fold(String::new(), |accum, word| accum + &format!(" {word:>11}"));

        if let Some(addr) = self.start_addr {
            write!(f, "<0x{addr:08X}>:{words}")?;
        } else {
            write!(f, "<<No Entry>>:{words}")?; // Extra '<' and '>' to align with addresses
        }

        Ok(())
    }
}

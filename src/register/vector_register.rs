use std::fmt::Display;

use log::{info, warn};

use crate::common::Word;

pub const VEC_REG_COUNT: usize = 16;
pub const VEC_LEN: usize = 16;

/// A vector slot, `None` until something is written to it
pub type VectorSlot = Option<Word>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorRegisterSet {
    vectors: Vec<Vec<VectorSlot>>,
}

impl Default for VectorRegisterSet {
    fn default() -> Self {
        Self::new(VEC_REG_COUNT, VEC_LEN)
    }
}

impl VectorRegisterSet {
    /// Creates `count` empty vector registers of `capacity` slots each
    pub fn new(count: usize, capacity: usize) -> Self {
        Self {
            vectors: vec![vec![None; capacity]; count],
        }
    }

    pub fn count(&self) -> usize {
        self.vectors.len()
    }

    /// Slots per register
    pub fn capacity(&self) -> usize {
        self.vectors.first().map_or(0, Vec::len)
    }

    /// The slots of register `num`, empty if it doesn't exist
    pub fn get(&self, num: usize) -> &[VectorSlot] {
        self.vectors.get(num).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn get_slot(&self, num: usize, slot: usize) -> VectorSlot {
        self.get(num).get(slot).copied().flatten()
    }

    /// Number of slots in use, counted up to the first empty one
    pub fn len(&self, num: usize) -> usize {
        let vector = self.get(num);
        vector
            .iter()
            .position(Option::is_none)
            .unwrap_or(vector.len())
    }

    pub fn is_empty(&self, num: usize) -> bool {
        self.len(num) == 0
    }

    /// Overwrites the leading slots of register `num` with `values`. Values
    /// past the register's capacity are dropped.
    pub fn set(&mut self, num: usize, values: &[VectorSlot]) {
        let Some(vector) = self.vectors.get_mut(num) else {
            warn!("Attempted to write to vector register {num}, treating write as NOOP");
            return;
        };
        if values.len() > vector.len() {
            warn!(
                "Vector write of {} slots truncated to {}",
                values.len(),
                vector.len()
            );
        }
        let count = values.len().min(vector.len());
        vector[..count].copy_from_slice(&values[..count]);
        info!("Wrote {count} slots to vector register {num}");
    }

    /// Places `value` in the first empty slot of register `num`. Returns
    /// false and leaves the register unchanged when it is full.
    pub fn append(&mut self, num: usize, value: Word) -> bool {
        let Some(slot) = self
            .vectors
            .get_mut(num)
            .and_then(|vector| vector.iter_mut().find(|slot| slot.is_none()))
        else {
            warn!("Vector size limit reached on V{num}, dropping {value}");
            return false;
        };
        *slot = Some(value);
        info!("Appended {value} to vector register {num}");
        true
    }

    pub fn clear(&mut self) {
        for vector in &mut self.vectors {
            vector.fill(None);
        }
    }
}

impl Display for VectorRegisterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, vector) in self.vectors.iter().enumerate() {
            let slots = vector
                .iter()
                .map(|slot| slot.map_or_else(|| String::from("_"), |val| val.to_string()))
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(f, "V{i:02}: [{slots}]")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use rand::random;

    #[test]
    fn append_fills_low_to_high() {
        let mut vectors = VectorRegisterSet::new(2, 4);
        for i in 0..4 {
            assert_eq!(i, vectors.len(1));
            assert!(vectors.append(1, i32::try_from(i).unwrap() * 10));
        }
        assert_eq!(&[Some(0), Some(10), Some(20), Some(30)], vectors.get(1));
        assert!(vectors.is_empty(0));
    }

    #[test]
    fn append_past_capacity_is_dropped() {
        let capacity = random::<usize>() % 16 + 1;
        let mut vectors = VectorRegisterSet::new(1, capacity);
        for _ in 0..capacity {
            assert!(vectors.append(0, random()));
        }
        let before = vectors.clone();
        assert!(!vectors.append(0, 1));
        assert_eq!(before, vectors);
        assert_eq!(capacity, vectors.len(0));
    }

    #[test]
    fn set_truncates_to_capacity() {
        let mut vectors = VectorRegisterSet::new(1, 2);
        vectors.set(0, &[Some(1), Some(2), Some(3)]);
        assert_eq!(&[Some(1), Some(2)], vectors.get(0));
        assert_eq!(None, vectors.get_slot(0, 2));
        assert_eq!(None, vectors.get_slot(5, 0));
    }
}

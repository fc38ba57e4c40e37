//! Field bitset
//!
//! Fixed-size bit vector over the fields of one record type. Used to mark
//! dirty fields on update and to select which fields the codec writes.

use std::fmt;
use std::sync::Arc;

use crate::error::{PersistError, Result};

use super::field::{FieldSchema, WORD_BITS};

/// Bit vector with one bit per schema field
#[derive(Clone)]
pub struct FieldBitSet {
    words: Vec<u64>,
    schema: Arc<FieldSchema>,
}

impl FieldBitSet {
    /// All bits clear
    pub fn new(schema: Arc<FieldSchema>) -> Self {
        Self {
            words: vec![0; schema.word_count()],
            schema,
        }
    }

    /// All bits set
    pub fn all(schema: Arc<FieldSchema>) -> Self {
        let mut bits = Self::new(schema);
        bits.set_all();
        bits
    }

    /// Bitset with the named fields set
    pub fn with_fields(schema: Arc<FieldSchema>, fields: &[&str]) -> Result<Self> {
        let mut bits = Self::new(schema);
        for field in fields {
            bits.set(field)?;
        }
        Ok(bits)
    }

    /// Rebuild from raw words, rejecting bits beyond the field count
    pub fn from_words(schema: Arc<FieldSchema>, words: &[u64]) -> Result<Self> {
        if words.len() != schema.word_count() {
            return Err(PersistError::Codec(format!(
                "bitset has {} words, schema expects {}",
                words.len(),
                schema.word_count()
            )));
        }
        if let Some(last) = words.last() {
            if last & !schema.tail_mask() != 0 {
                return Err(PersistError::Codec(format!(
                    "bitset sets bits beyond field count {}",
                    schema.field_count()
                )));
            }
        }
        Ok(Self {
            words: words.to_vec(),
            schema,
        })
    }

    pub fn schema(&self) -> &Arc<FieldSchema> {
        &self.schema
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Set a field's bit
    pub fn set(&mut self, field: &str) -> Result<&mut Self> {
        let idx = self.index_of(field)?;
        self.set_index(idx);
        Ok(self)
    }

    /// Clear a field's bit
    pub fn clear(&mut self, field: &str) -> Result<&mut Self> {
        let idx = self.index_of(field)?;
        self.clear_index(idx);
        Ok(self)
    }

    /// Whether a field's bit is set (unknown fields are never set)
    pub fn get(&self, field: &str) -> bool {
        match self.schema.index_of(field) {
            Some(idx) => self.get_index(idx),
            None => false,
        }
    }

    pub fn set_index(&mut self, idx: usize) {
        if idx < self.schema.field_count() {
            self.words[idx / WORD_BITS] |= 1u64 << (idx % WORD_BITS);
        }
    }

    pub fn clear_index(&mut self, idx: usize) {
        if idx < self.schema.field_count() {
            self.words[idx / WORD_BITS] &= !(1u64 << (idx % WORD_BITS));
        }
    }

    pub fn get_index(&self, idx: usize) -> bool {
        idx < self.schema.field_count() && self.words[idx / WORD_BITS] & (1u64 << (idx % WORD_BITS)) != 0
    }

    /// Bitwise OR with another bitset of the same schema
    pub fn merge(&mut self, other: &FieldBitSet) -> &mut Self {
        debug_assert_eq!(self.words.len(), other.words.len());
        for (word, theirs) in self.words.iter_mut().zip(&other.words) {
            *word |= theirs;
        }
        self
    }

    pub fn clear_all(&mut self) -> &mut Self {
        self.words.iter_mut().for_each(|w| *w = 0);
        self
    }

    pub fn set_all(&mut self) -> &mut Self {
        self.words.iter_mut().for_each(|w| *w = u64::MAX);
        let mask = self.schema.tail_mask();
        if let Some(last) = self.words.last_mut() {
            *last &= mask;
        }
        self
    }

    /// Whether every field bit is set
    pub fn is_set_all(&self) -> bool {
        let last = self.words.len().saturating_sub(1);
        self.words.iter().enumerate().all(|(i, &w)| {
            let want = if i == last {
                self.schema.tail_mask()
            } else {
                u64::MAX
            };
            w == want
        })
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Number of set bits
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Whether every bit set here is also set in `other`
    pub fn is_subset_of(&self, other: &FieldBitSet) -> bool {
        self.words
            .iter()
            .zip(&other.words)
            .all(|(mine, theirs)| mine & !theirs == 0)
    }

    /// Sorted names of the set fields
    pub fn fields(&self) -> Vec<&'static str> {
        // Schema order is already lexicographic
        (0..self.schema.field_count())
            .filter(|&i| self.get_index(i))
            .map(|i| self.schema.name(i))
            .collect()
    }

    fn index_of(&self, field: &str) -> Result<usize> {
        self.schema
            .index_of(field)
            .ok_or_else(|| PersistError::UnknownField(field.to_string()))
    }
}

impl PartialEq for FieldBitSet {
    fn eq(&self, other: &Self) -> bool {
        self.words == other.words
    }
}

impl Eq for FieldBitSet {}

impl fmt::Debug for FieldBitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.fields()).finish()
    }
}

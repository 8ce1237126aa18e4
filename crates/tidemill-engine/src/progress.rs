//! Stream progress tracking
//!
//! [`StreamProgress`] maps each source of a query to the offset of its last
//! committed data. Updates are strictly monotone; the canonical source order
//! (declaration order in the query) fixes the slot layout of the
//! [`CompositeOffset`] it emits. The struct itself is not synchronized; the
//! execution loop owns it behind a single lock.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use tidemill_core::{CompositeOffset, Offset};

use crate::error::{Error, Result};

/// Monotone map from source index to its committed offset.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamProgress {
    arity: usize,
    offsets: BTreeMap<usize, Offset>,
}

impl StreamProgress {
    /// An empty progress map for a query with `arity` sources.
    pub fn new(arity: usize) -> Self {
        Self {
            arity,
            offsets: BTreeMap::new(),
        }
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Adopt the positions of a previously committed composite offset.
    pub fn seed(&mut self, committed: &CompositeOffset) -> Result<()> {
        if committed.arity() != self.arity {
            return Err(Error::InvalidSinkOffset(format!(
                "expected {} slots, sink reported {}",
                self.arity,
                committed.arity()
            )));
        }
        for (i, slot) in committed.slots().iter().enumerate() {
            if let Some(offset) = slot {
                self.offsets.insert(i, offset.clone());
            }
        }
        Ok(())
    }

    /// Advance one source. The new offset must be strictly greater than the
    /// current one; anything else is rejected.
    pub fn update(&mut self, source: usize, offset: Offset) -> Result<()> {
        if source >= self.arity {
            return Err(Error::UnknownSource(source));
        }
        if let Some(current) = self.offsets.get(&source) {
            if offset.compare(current)? != Ordering::Greater {
                return Err(Error::NonMonotonicUpdate {
                    source_index: source,
                    current: current.to_string(),
                    attempted: offset.to_string(),
                });
            }
        }
        self.offsets.insert(source, offset);
        Ok(())
    }

    pub fn get(&self, source: usize) -> Option<&Offset> {
        self.offsets.get(&source)
    }

    /// Fold another progress map into this one, keeping the greater offset
    /// per source. Fails when the two maps track offsets of different kinds.
    pub fn merge(&mut self, other: &StreamProgress) -> Result<()> {
        if other.arity != self.arity {
            return Err(Error::InvalidSinkOffset(format!(
                "cannot merge progress of arity {} into arity {}",
                other.arity, self.arity
            )));
        }
        for (source, offset) in &other.offsets {
            match self.offsets.get(source) {
                Some(current) if offset.compare(current)? != Ordering::Greater => {}
                _ => {
                    self.offsets.insert(*source, offset.clone());
                }
            }
        }
        Ok(())
    }

    /// The whole query's progress as a composite offset in canonical source
    /// order, with empty slots for sources that have not produced yet.
    pub fn to_composite(&self) -> CompositeOffset {
        CompositeOffset::new(
            (0..self.arity)
                .map(|i| self.offsets.get(&i).cloned())
                .collect(),
        )
    }
}

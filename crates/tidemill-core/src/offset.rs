//! Progress markers for streaming sources
//!
//! An [`Offset`] is an opaque, totally-ordered marker describing how far a
//! single source has progressed. A [`CompositeOffset`] bundles the per-source
//! offsets of a whole query into one value, with an empty slot for every
//! source that has not produced data yet.
//!
//! Offsets are immutable once created. Comparison is only defined between
//! offsets of the same kind; comparing a plain offset against a composite one
//! is an error, not an ordering.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A per-source progress marker.
///
/// Advancing a source always produces a strictly greater offset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Offset {
    /// A monotonically increasing counter, the common case for replayable
    /// sources.
    Long(i64),
    /// The combined progress of several sources (see [`CompositeOffset`]).
    Composite(CompositeOffset),
}

impl Offset {
    /// Compare two offsets of the same kind.
    ///
    /// Fails with [`Error::IncomparableOffsets`] when the kinds differ, and
    /// with [`Error::UnorderedOffsets`] when two composite offsets advance in
    /// different directions.
    pub fn compare(&self, other: &Offset) -> Result<Ordering> {
        match (self, other) {
            (Offset::Long(a), Offset::Long(b)) => Ok(a.cmp(b)),
            (Offset::Composite(a), Offset::Composite(b)) => a.compare(b),
            (a, b) => Err(Error::IncomparableOffsets(a.to_string(), b.to_string())),
        }
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Offset::Long(v) => write!(f, "{v}"),
            Offset::Composite(c) => write!(f, "{c}"),
        }
    }
}

/// The progress of a whole query: one optional [`Offset`] per source, in the
/// query's canonical source order.
///
/// Comparison is strict vector order: `a > b` iff every component of `a` is
/// `>=` the matching component of `b` and at least one is `>`. Vectors that
/// advance in different directions are not ordered and comparing them fails.
/// An empty slot is less than any concrete offset for that slot; two empty
/// slots are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompositeOffset {
    slots: Vec<Option<Offset>>,
}

impl CompositeOffset {
    pub fn new(slots: Vec<Option<Offset>>) -> Self {
        Self { slots }
    }

    /// Build a composite where every slot is filled.
    pub fn filled(offsets: Vec<Offset>) -> Self {
        Self {
            slots: offsets.into_iter().map(Some).collect(),
        }
    }

    /// Build a composite of `arity` empty slots.
    pub fn empty(arity: usize) -> Self {
        Self {
            slots: vec![None; arity],
        }
    }

    pub fn arity(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, index: usize) -> Option<&Offset> {
        self.slots.get(index).and_then(|s| s.as_ref())
    }

    pub fn slots(&self) -> &[Option<Offset>] {
        &self.slots
    }

    /// Strict vector comparison against another composite of the same arity.
    pub fn compare(&self, other: &CompositeOffset) -> Result<Ordering> {
        if self.slots.len() != other.slots.len() {
            return Err(Error::ArityMismatch(self.slots.len(), other.slots.len()));
        }

        let mut saw_less = false;
        let mut saw_greater = false;
        for (a, b) in self.slots.iter().zip(&other.slots) {
            let ord = match (a, b) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(a), Some(b)) => a.compare(b)?,
            };
            match ord {
                Ordering::Less => saw_less = true,
                Ordering::Greater => saw_greater = true,
                Ordering::Equal => {}
            }
        }

        match (saw_less, saw_greater) {
            (false, false) => Ok(Ordering::Equal),
            (true, false) => Ok(Ordering::Less),
            (false, true) => Ok(Ordering::Greater),
            (true, true) => Err(Error::UnorderedOffsets(
                self.to_string(),
                other.to_string(),
            )),
        }
    }
}

impl fmt::Display for CompositeOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, slot) in self.slots.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match slot {
                Some(o) => write!(f, "{o}")?,
                None => write!(f, "-")?,
            }
        }
        write!(f, "]")
    }
}

//! Global transaction identifiers and executed-set arithmetic.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Numeric component of a global transaction identifier.
///
/// Gno zero never identifies a transaction; it is the snapshot version of a
/// transaction that observed no certified writes.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Gno(u64);

impl Gno {
    pub const ZERO: Gno = Gno(0);
    pub const ONE: Gno = Gno(1);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Gno {
        Gno(self.0.checked_add(1).expect("gno overflow computing next"))
    }

    pub fn prev(self) -> Option<Gno> {
        self.0.checked_sub(1).map(Gno)
    }
}

impl fmt::Debug for Gno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gno({})", self.0)
    }
}

impl fmt::Display for Gno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Gno> for u64 {
    fn from(value: Gno) -> u64 {
        value.0
    }
}

/// Global transaction identifier: cluster sid plus gno.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Gid {
    pub sid: Uuid,
    pub gno: Gno,
}

impl Gid {
    pub fn new(sid: Uuid, gno: Gno) -> Self {
        Self { sid, gno }
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.sid, self.gno)
    }
}

#[derive(Debug, Error)]
pub enum GnoSetDecodeError {
    #[error("encoded gno set truncated: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },
    #[error("encoded gno set interval invalid: start {start} > end {end}")]
    InvalidInterval { start: u64, end: u64 },
}

/// Set of gnos under one cluster sid, kept as coalesced closed intervals.
///
/// This is the executed-transaction set exchanged between members and the
/// stable set driving certification garbage collection. The wire encoding is
/// little-endian: sid, interval count, then (start, end) pairs.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GnoSet {
    sid: Uuid,
    intervals: BTreeMap<u64, u64>,
}

impl GnoSet {
    pub fn new(sid: Uuid) -> Self {
        Self {
            sid,
            intervals: BTreeMap::new(),
        }
    }

    pub fn sid(&self) -> Uuid {
        self.sid
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn contains(&self, gno: Gno) -> bool {
        let value = gno.get();
        self.intervals
            .range(..=value)
            .next_back()
            .is_some_and(|(_, end)| *end >= value)
    }

    pub fn add(&mut self, gno: Gno) {
        self.add_range(gno, gno);
    }

    /// Adds the closed interval `[start, end]`, coalescing neighbors.
    pub fn add_range(&mut self, start: Gno, end: Gno) {
        let (mut start, mut end) = (start.get(), end.get());
        if start == 0 || start > end {
            return;
        }

        // Absorb every existing interval that overlaps or touches [start, end].
        let mut absorbed = Vec::new();
        for (&s, &e) in self.intervals.range(..=end.saturating_add(1)) {
            if e.saturating_add(1) >= start {
                absorbed.push(s);
                start = start.min(s);
                end = end.max(e);
            }
        }
        for s in absorbed {
            self.intervals.remove(&s);
        }
        self.intervals.insert(start, end);
    }

    pub fn merge(&mut self, other: &GnoSet) {
        for (&start, &end) in &other.intervals {
            self.add_range(Gno::new(start), Gno::new(end));
        }
    }

    pub fn intersection(&self, other: &GnoSet) -> GnoSet {
        let mut result = GnoSet::new(self.sid);
        for (&start, &end) in &self.intervals {
            for (&os, &oe) in other.intervals.range(..=end) {
                if oe < start {
                    continue;
                }
                result.add_range(Gno::new(start.max(os)), Gno::new(end.min(oe)));
            }
        }
        result
    }

    /// Highest gno in the set, or zero when empty.
    pub fn high_water(&self) -> Gno {
        self.intervals
            .values()
            .next_back()
            .copied()
            .map(Gno::new)
            .unwrap_or(Gno::ZERO)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(20 + self.intervals.len() * 16);
        out.extend_from_slice(self.sid.as_bytes());
        out.extend_from_slice(&(self.intervals.len() as u32).to_le_bytes());
        for (&start, &end) in &self.intervals {
            out.extend_from_slice(&start.to_le_bytes());
            out.extend_from_slice(&end.to_le_bytes());
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<GnoSet, GnoSetDecodeError> {
        let need = 20;
        if data.len() < need {
            return Err(GnoSetDecodeError::Truncated {
                need,
                got: data.len(),
            });
        }
        let sid = Uuid::from_slice(&data[..16]).expect("sixteen bytes parse as a uuid");
        let count = u32::from_le_bytes(data[16..20].try_into().expect("length checked")) as usize;

        let need = 20 + count * 16;
        if data.len() < need {
            return Err(GnoSetDecodeError::Truncated {
                need,
                got: data.len(),
            });
        }

        let mut set = GnoSet::new(sid);
        for i in 0..count {
            let at = 20 + i * 16;
            let start = u64::from_le_bytes(data[at..at + 8].try_into().expect("length checked"));
            let end =
                u64::from_le_bytes(data[at + 8..at + 16].try_into().expect("length checked"));
            if start > end {
                return Err(GnoSetDecodeError::InvalidInterval { start, end });
            }
            set.add_range(Gno::new(start), Gno::new(end));
        }
        Ok(set)
    }
}

impl fmt::Debug for GnoSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for GnoSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sid)?;
        for (start, end) in &self.intervals {
            if start == end {
                write!(f, ":{start}")?;
            } else {
                write!(f, ":{start}-{end}")?;
            }
        }
        Ok(())
    }
}

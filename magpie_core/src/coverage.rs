use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Mutex, PoisonError};

/// Stable identity of a corpus entry: the MD5 digest of its payload bytes.
///
/// Ids double as on-disk payload file names (lowercase hex), so external
/// tools can address entries without any side table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId([u8; 16]);

impl EntryId {
    pub fn of(payload: &[u8]) -> Self {
        EntryId(md5::compute(payload).0)
    }

    pub fn to_hex(&self) -> String {
        format!("{self}")
    }

    /// Parses the 32-char lowercase/uppercase hex form. Returns `None` for
    /// anything that is not exactly one digest worth of hex digits.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = s.as_bytes();
        if bytes.len() != 32 {
            return None;
        }
        let mut out = [0u8; 16];
        for (i, pair) in bytes.chunks_exact(2).enumerate() {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            out[i] = (hi as u8) << 4 | lo as u8;
        }
        Some(EntryId(out))
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryId({self})")
    }
}

impl Serialize for EntryId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for EntryId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        EntryId::from_hex(&text)
            .ok_or_else(|| D::Error::custom(format!("malformed entry id '{text}'")))
    }
}

/// The set of abstract coverage units one execution touched.
///
/// Unit ids are opaque u64s supplied by the target side (edge hashes, block
/// ids, whatever the instrumentation emits). Signatures compare by set
/// difference; ordering inside is only there to keep serialization stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageSignature(BTreeSet<u64>);

impl CoverageSignature {
    pub fn new() -> Self {
        CoverageSignature(BTreeSet::new())
    }

    pub fn from_units<T: IntoIterator<Item = u64>>(units: T) -> Self {
        CoverageSignature(units.into_iter().collect())
    }

    pub fn insert(&mut self, unit: u64) {
        self.0.insert(unit);
    }

    pub fn contains(&self, unit: u64) -> bool {
        self.0.contains(&unit)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.0.iter().copied()
    }

    /// True when every unit of `self` also appears in `other`.
    pub fn is_subset(&self, other: &CoverageSignature) -> bool {
        self.0.is_subset(&other.0)
    }

    /// Units present in `self` but absent from `other`.
    pub fn difference(&self, other: &CoverageSignature) -> CoverageSignature {
        CoverageSignature(self.0.difference(&other.0).copied().collect())
    }

    pub fn union_with(&mut self, other: &CoverageSignature) {
        self.0.extend(other.0.iter().copied());
    }
}

impl FromIterator<u64> for CoverageSignature {
    fn from_iter<T: IntoIterator<Item = u64>>(iter: T) -> Self {
        CoverageSignature(iter.into_iter().collect())
    }
}

/// Verdict of [`CoverageTracker::evaluate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Novelty {
    pub is_novel: bool,
    /// The units this signature contributed that the global map had never
    /// seen. Empty iff `is_novel` is false.
    pub new_units: CoverageSignature,
}

/// Session-global map of every coverage unit observed so far.
///
/// The tracker is an explicit service handed to whoever needs novelty
/// decisions; it is never global state. The map only grows, and the
/// check-and-union in [`evaluate`](Self::evaluate) is one critical section,
/// so two workers submitting the same signature concurrently cannot both be
/// told it is novel.
#[derive(Debug, Default)]
pub struct CoverageTracker {
    seen: Mutex<BTreeSet<u64>>,
}

impl CoverageTracker {
    pub fn new() -> Self {
        CoverageTracker {
            seen: Mutex::new(BTreeSet::new()),
        }
    }

    /// Compares `signature` against the global map and absorbs any new
    /// units into it, atomically.
    pub fn evaluate(&self, signature: &CoverageSignature) -> Novelty {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        let new_units: CoverageSignature = signature
            .iter()
            .filter(|unit| !seen.contains(unit))
            .collect();
        if !new_units.is_empty() {
            seen.extend(new_units.iter());
            log::debug!(
                "coverage: {} new unit(s), global map now {}",
                new_units.len(),
                seen.len()
            );
        }
        Novelty {
            is_novel: !new_units.is_empty(),
            new_units,
        }
    }

    /// Number of distinct units the map holds.
    pub fn unit_count(&self) -> usize {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

use crate::coverage::{CoverageSignature, EntryId};
use crate::input::Input;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Filename of the JSON metadata index inside a corpus directory.
pub const INDEX_FILENAME: &str = "corpus_index.json";

/// Energy never decays below this, so every retained entry keeps a nonzero
/// selection probability.
pub const MIN_ENERGY: f64 = 1e-6;
/// Reward cap, so one prolific entry cannot drown out the rest of the queue.
pub const MAX_ENERGY: f64 = 1e4;

/// Energy assigned to a freshly stored entry.
pub const INITIAL_ENERGY: f64 = 1.0;

const WRITE_ATTEMPTS: u32 = 3;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Defines errors that can arise during corpus operations.
///
/// These cover I/O problems when interacting with the file system (for
/// on-disk corpora) as well as logical errors like requesting an entry id
/// the store has never issued.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// The requested entry id was not found in the corpus. For ids the
    /// harness produced itself this is an invariant violation, not a
    /// recoverable condition.
    #[error("Entry {0} not found in corpus or index")]
    EntryNotFound(EntryId),

    /// An operation could not be performed because the corpus is empty
    /// (e.g., attempting to select an entry for mutation).
    #[error("Corpus is empty, cannot select an entry")]
    CorpusIsEmpty,

    /// An I/O error while interacting with the underlying storage, after
    /// the bounded retries were exhausted.
    #[error("Corpus I/O error: {0}")]
    Io(String),

    /// An error while serializing the metadata index.
    #[error("Corpus serialization error: {0}")]
    Serialization(String),

    /// An error while deserializing the metadata index.
    #[error("Corpus deserialization error: {0}")]
    Deserialization(String),
}

impl From<std::io::Error> for CorpusError {
    fn from(err: std::io::Error) -> Self {
        CorpusError::Io(err.to_string())
    }
}
impl From<serde_json::Error> for CorpusError {
    fn from(err: serde_json::Error) -> Self {
        CorpusError::Deserialization(format!("JSON operation error: {}", err))
    }
}

/// Where a corpus entry came from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Provenance {
    /// Loaded from a configured initial seed file.
    Seed { path: String },
    /// Dropped into the store directory by an external tool and adopted.
    External { path: String },
    /// Derived by the mutator from an existing entry.
    Mutated { parent: EntryId },
}

/// Metadata carried by every corpus entry and serialized into the on-disk
/// index.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EntryMetadata {
    /// Coverage units the payload touched when it earned its place.
    pub signature: CoverageSignature,
    /// Payload size in bytes.
    pub size: usize,
    /// Monotonic discovery order, stable across reloads. Lower is earlier.
    pub sequence: u64,
    /// Wall-clock discovery time, milliseconds since the Unix epoch.
    pub discovered_at_ms: u64,
    /// Scheduling weight. Mutated in memory by reward/decay; written out
    /// whenever the index is next rewritten by a `put`.
    pub energy: f64,
    pub provenance: Provenance,
}

impl EntryMetadata {
    fn new(
        signature: CoverageSignature,
        size: usize,
        sequence: u64,
        provenance: Provenance,
    ) -> Self {
        EntryMetadata {
            signature,
            size,
            sequence,
            discovered_at_ms: unix_time_ms(),
            energy: INITIAL_ENERGY,
            provenance,
        }
    }
}

pub(crate) fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Defines the common interface for the input store.
///
/// A `Corpus` owns the retained fuzz payloads and their metadata. Entries
/// are identified by the content hash of their payload, so storing the same
/// bytes twice is a no-op that returns the existing id. Implementations must
/// be `Send + Sync`; the campaign shares one store across workers behind a
/// mutex.
///
/// # Type Parameters
/// * `I`: The payload type, which must implement the [`Input`] trait.
pub trait Corpus<I: Input>: Send + Sync {
    /// Stores a payload together with the coverage signature it produced.
    ///
    /// # Arguments
    /// * `input`: The payload. The corpus takes ownership.
    /// * `signature`: The coverage units observed when this payload ran.
    /// * `provenance`: Where the payload came from.
    ///
    /// # Returns
    /// The entry's content-hash id. If an entry with the same payload bytes
    /// already exists, its id is returned and nothing is modified.
    fn put(
        &mut self,
        input: I,
        signature: CoverageSignature,
        provenance: Provenance,
    ) -> Result<EntryId, CorpusError>;

    /// Retrieves the payload for `id`.
    ///
    /// # Returns
    /// The payload, or [`CorpusError::EntryNotFound`] if the id was never
    /// issued by this store.
    fn get(&mut self, id: &EntryId) -> Result<I, CorpusError>;

    /// Retrieves the metadata for `id`.
    fn metadata(&self, id: &EntryId) -> Result<&EntryMetadata, CorpusError>;

    /// All entry ids in discovery order (earliest first).
    fn list(&self) -> &[EntryId];

    /// Returns the number of entries currently stored.
    fn len(&self) -> usize;

    /// Returns `true` if the corpus contains no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Selects a uniformly random entry and returns its id and payload.
    /// Used for splice-partner selection. Returns `None` when empty.
    fn random_payload(&mut self, rng: &mut dyn RngCore) -> Option<(EntryId, I)>;

    /// Multiplies the entry's energy by `factor` (> 1 for a reward), capped
    /// at [`MAX_ENERGY`]. Returns the new energy.
    fn reward_energy(&mut self, id: &EntryId, factor: f64) -> Result<f64, CorpusError>;

    /// Multiplies the entry's energy by `factor` (< 1 for decay), floored
    /// at [`MIN_ENERGY`]. Returns the new energy.
    fn decay_energy(&mut self, id: &EntryId, factor: f64) -> Result<f64, CorpusError>;

    /// Scans the backing directory for payload files that did not come from
    /// this store (external tools may drop seeds there) and returns each
    /// such file once per session, so the campaign can dry-run it through
    /// the executor. In-memory corpora have no backing directory and return
    /// an empty list.
    fn take_external(&mut self) -> Result<Vec<(PathBuf, I)>, CorpusError>;
}

/// Reads initial seed payloads from a list of files and/or directories.
///
/// Directories are scanned one level deep. Hidden files and a stray corpus
/// index are skipped. The payloads are returned raw; the campaign dry-runs
/// them through the executor so each enters the store with a real coverage
/// signature.
pub fn collect_seed_files(seed_paths: &[PathBuf]) -> Result<Vec<(PathBuf, Vec<u8>)>, CorpusError> {
    let mut seeds = Vec::new();
    for path_buf in seed_paths {
        let path = path_buf.as_path();
        if path.is_file() {
            let data = fs::read(path).map_err(|e| {
                CorpusError::Io(format!("Failed to read seed file {:?}: {}", path, e))
            })?;
            seeds.push((path.to_path_buf(), data));
        } else if path.is_dir() {
            for entry_result in fs::read_dir(path).map_err(|e| {
                CorpusError::Io(format!("Failed to read seed directory {:?}: {}", path, e))
            })? {
                let entry = entry_result.map_err(|e| {
                    CorpusError::Io(format!("Error reading entry in {:?}: {}", path, e))
                })?;
                let file_path = entry.path();
                if !file_path.is_file() {
                    continue;
                }
                if let Some(name) = file_path.file_name().and_then(|n| n.to_str()) {
                    if name == INDEX_FILENAME || name.starts_with('.') {
                        continue;
                    }
                }
                let data = fs::read(&file_path).map_err(|e| {
                    CorpusError::Io(format!("Failed to read seed file {:?}: {}", file_path, e))
                })?;
                seeds.push((file_path, data));
            }
        } else {
            log::warn!("seed path {:?} does not exist, skipping", path);
        }
    }
    Ok(seeds)
}

/// Runs a fallible write a bounded number of times before giving up.
/// Transient I/O failures (NFS hiccups, AV scanners) get retried; a
/// persistent failure is surfaced so the campaign can halt rather than
/// silently lose corpus entries.
fn with_write_retries<T>(
    what: &str,
    mut op: impl FnMut() -> Result<T, CorpusError>,
) -> Result<T, CorpusError> {
    let mut last_err = CorpusError::Io(format!("{}: no write attempt made", what));
    for attempt in 1..=WRITE_ATTEMPTS {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) => {
                log::warn!(
                    "corpus write '{}' failed (attempt {}/{}): {}",
                    what,
                    attempt,
                    WRITE_ATTEMPTS,
                    e
                );
                last_err = e;
                if attempt < WRITE_ATTEMPTS {
                    std::thread::sleep(WRITE_RETRY_DELAY);
                }
            }
        }
    }
    Err(last_err)
}

/// An in-memory implementation of the `Corpus` trait.
///
/// Stores all payloads and metadata in maps. Fast, but nothing survives the
/// process. Used by tests and by ephemeral campaigns where persistence is
/// not wanted.
#[derive(Debug, Default)]
pub struct InMemoryCorpus<I: Input> {
    entries: HashMap<EntryId, (I, EntryMetadata)>,
    order: Vec<EntryId>,
    next_sequence: u64,
}

impl<I: Input> InMemoryCorpus<I> {
    /// Creates a new, empty `InMemoryCorpus`.
    pub fn new() -> Self {
        InMemoryCorpus {
            entries: HashMap::new(),
            order: Vec::new(),
            next_sequence: 0,
        }
    }
}

impl<I: Input + From<Vec<u8>>> Corpus<I> for InMemoryCorpus<I> {
    fn put(
        &mut self,
        input: I,
        signature: CoverageSignature,
        provenance: Provenance,
    ) -> Result<EntryId, CorpusError> {
        let id = EntryId::of(input.as_bytes());
        if self.entries.contains_key(&id) {
            log::debug!("corpus: duplicate payload for {}, ignoring", id);
            return Ok(id);
        }
        let metadata = EntryMetadata::new(signature, input.len(), self.next_sequence, provenance);
        self.next_sequence += 1;
        self.entries.insert(id, (input, metadata));
        self.order.push(id);
        Ok(id)
    }

    fn get(&mut self, id: &EntryId) -> Result<I, CorpusError> {
        self.entries
            .get(id)
            .map(|(input, _)| input.clone())
            .ok_or(CorpusError::EntryNotFound(*id))
    }

    fn metadata(&self, id: &EntryId) -> Result<&EntryMetadata, CorpusError> {
        self.entries
            .get(id)
            .map(|(_, meta)| meta)
            .ok_or(CorpusError::EntryNotFound(*id))
    }

    fn list(&self) -> &[EntryId] {
        &self.order
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn random_payload(&mut self, rng: &mut dyn RngCore) -> Option<(EntryId, I)> {
        if self.order.is_empty() {
            return None;
        }
        let index = rng.next_u64() as usize % self.order.len();
        let id = self.order[index];
        self.entries.get(&id).map(|(input, _)| (id, input.clone()))
    }

    fn reward_energy(&mut self, id: &EntryId, factor: f64) -> Result<f64, CorpusError> {
        let (_, meta) = self
            .entries
            .get_mut(id)
            .ok_or(CorpusError::EntryNotFound(*id))?;
        meta.energy = (meta.energy * factor).min(MAX_ENERGY);
        Ok(meta.energy)
    }

    fn decay_energy(&mut self, id: &EntryId, factor: f64) -> Result<f64, CorpusError> {
        let (_, meta) = self
            .entries
            .get_mut(id)
            .ok_or(CorpusError::EntryNotFound(*id))?;
        meta.energy = (meta.energy * factor).max(MIN_ENERGY);
        Ok(meta.energy)
    }

    fn take_external(&mut self) -> Result<Vec<(PathBuf, I)>, CorpusError> {
        Ok(Vec::new())
    }
}

/// One record of the on-disk JSON index.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct IndexRecord {
    id: EntryId,
    meta: EntryMetadata,
}

/// An on-disk implementation of the `Corpus` trait.
///
/// Each payload is one opaque file named by its content hash (lowercase
/// MD5 hex, no extension), so external tools can read, hash, and drop
/// payloads without any side channel. Metadata lives in a pretty-printed
/// JSON index next to the payloads. All writes are atomic: data goes to a
/// temp file in the same directory and is renamed into place, so a crash
/// or stop signal can never leave a partial entry behind.
pub struct OnDiskCorpus<I: Input + From<Vec<u8>>> {
    corpus_dir: PathBuf,
    index_path: PathBuf,
    entries: HashMap<EntryId, EntryMetadata>,
    /// Discovery order (by `sequence`).
    order: Vec<EntryId>,
    next_sequence: u64,
    /// Directory entries already examined by the external-file scan this
    /// session, so each stray file is dry-run at most once.
    seen_external: HashSet<OsString>,
    /// The most recently loaded payload, so repeated selection of a hot
    /// entry does not hit the disk every time.
    last_accessed: Option<(EntryId, I)>,
}

impl<I: Input + From<Vec<u8>>> OnDiskCorpus<I> {
    /// Creates a new `OnDiskCorpus` or loads an existing one from
    /// `corpus_dir`.
    ///
    /// The directory is created if missing. If a `corpus_index.json` exists
    /// inside, the corpus state is loaded from it; otherwise an empty index
    /// is written so the directory is recognizable as a corpus from the
    /// start.
    pub fn new(corpus_dir: PathBuf) -> Result<Self, CorpusError> {
        if !corpus_dir.exists() {
            fs::create_dir_all(&corpus_dir).map_err(|e| {
                CorpusError::Io(format!(
                    "Failed to create corpus directory at {:?}: {}",
                    corpus_dir, e
                ))
            })?;
        } else if !corpus_dir.is_dir() {
            return Err(CorpusError::Io(format!(
                "Corpus path {:?} exists but is not a directory",
                corpus_dir
            )));
        }

        let index_path = corpus_dir.join(INDEX_FILENAME);
        let mut corpus = OnDiskCorpus {
            corpus_dir,
            index_path,
            entries: HashMap::new(),
            order: Vec::new(),
            next_sequence: 0,
            seen_external: HashSet::new(),
            last_accessed: None,
        };

        corpus.load_index()?;
        if !corpus.index_path.exists() {
            corpus.save_index()?;
        }
        log::info!(
            "corpus: opened {:?} with {} entries",
            corpus.corpus_dir,
            corpus.order.len()
        );
        Ok(corpus)
    }

    fn payload_path(&self, id: &EntryId) -> PathBuf {
        self.corpus_dir.join(id.to_hex())
    }

    /// Writes `bytes` to `path` atomically: temp file in the same
    /// directory, then rename.
    fn write_file_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), CorpusError> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.corpus_dir).map_err(|e| {
            CorpusError::Io(format!(
                "Failed to create temp file in {:?}: {}",
                self.corpus_dir, e
            ))
        })?;
        tmp.write_all(bytes)
            .map_err(|e| CorpusError::Io(format!("Failed to write temp file: {}", e)))?;
        tmp.persist(path).map_err(|e| {
            CorpusError::Io(format!("Failed to persist temp file to {:?}: {}", path, e))
        })?;
        Ok(())
    }

    /// Persists the in-memory index to `corpus_index.json`, atomically.
    fn save_index(&self) -> Result<(), CorpusError> {
        let records: Vec<IndexRecord> = self
            .order
            .iter()
            .filter_map(|id| {
                self.entries.get(id).map(|meta| IndexRecord {
                    id: *id,
                    meta: meta.clone(),
                })
            })
            .collect();
        let json = serde_json::to_vec_pretty(&records).map_err(|e| {
            CorpusError::Serialization(format!(
                "Failed to serialize corpus index for {:?}: {}",
                self.index_path, e
            ))
        })?;
        with_write_retries("index", || self.write_file_atomic(&self.index_path, &json))
    }

    /// Loads the index from disk. A missing or empty index file means an
    /// empty corpus. Records are ordered by their discovery sequence, so a
    /// hand-edited index still reloads deterministically.
    fn load_index(&mut self) -> Result<(), CorpusError> {
        self.entries.clear();
        self.order.clear();
        self.next_sequence = 0;

        if !(self.index_path.exists() && self.index_path.is_file()) {
            return Ok(());
        }
        let file = File::open(&self.index_path).map_err(|e| {
            CorpusError::Io(format!(
                "Failed to open index file {:?}: {}",
                self.index_path, e
            ))
        })?;
        if file.metadata()?.len() == 0 {
            return Ok(());
        }
        let reader = BufReader::new(file);
        let mut records: Vec<IndexRecord> = serde_json::from_reader(reader).map_err(|e| {
            CorpusError::Deserialization(format!(
                "Failed to parse JSON from index file {:?}: {}. The file might be corrupted.",
                self.index_path, e
            ))
        })?;
        records.sort_by_key(|r| r.meta.sequence);
        for record in records {
            self.next_sequence = self.next_sequence.max(record.meta.sequence + 1);
            self.order.push(record.id);
            self.entries.insert(record.id, record.meta);
        }
        Ok(())
    }

    fn load_payload(&self, id: &EntryId) -> Result<I, CorpusError> {
        let path = self.payload_path(id);
        let bytes = fs::read(&path)
            .map_err(|e| CorpusError::Io(format!("Failed to read payload {:?}: {}", path, e)))?;
        Ok(I::from(bytes))
    }
}

impl<I: Input + From<Vec<u8>>> Corpus<I> for OnDiskCorpus<I> {
    fn put(
        &mut self,
        input: I,
        signature: CoverageSignature,
        provenance: Provenance,
    ) -> Result<EntryId, CorpusError> {
        let id = EntryId::of(input.as_bytes());
        if self.entries.contains_key(&id) {
            log::debug!("corpus: duplicate payload for {}, ignoring", id);
            return Ok(id);
        }

        let payload_path = self.payload_path(&id);
        with_write_retries("payload", || {
            self.write_file_atomic(&payload_path, input.as_bytes())
        })?;

        let absorbed_external = match &provenance {
            Provenance::External { path } => Some(PathBuf::from(path)),
            _ => None,
        };

        let metadata = EntryMetadata::new(signature, input.len(), self.next_sequence, provenance);
        self.next_sequence += 1;
        self.order.push(id);
        self.entries.insert(id, metadata);
        self.save_index()?;

        // An adopted external file now exists under its canonical hash
        // name; drop the stray original (only ever inside our own dir).
        if let Some(original) = absorbed_external {
            if original.parent() == Some(self.corpus_dir.as_path()) && original != payload_path {
                if let Err(e) = fs::remove_file(&original) {
                    log::warn!(
                        "corpus: could not remove absorbed external file {:?}: {}",
                        original,
                        e
                    );
                }
            }
        }

        self.last_accessed = Some((id, input));
        Ok(id)
    }

    fn get(&mut self, id: &EntryId) -> Result<I, CorpusError> {
        if let Some((cached_id, input)) = &self.last_accessed {
            if cached_id == id {
                return Ok(input.clone());
            }
        }
        if !self.entries.contains_key(id) {
            return Err(CorpusError::EntryNotFound(*id));
        }
        let input = self.load_payload(id)?;
        self.last_accessed = Some((*id, input.clone()));
        Ok(input)
    }

    fn metadata(&self, id: &EntryId) -> Result<&EntryMetadata, CorpusError> {
        self.entries.get(id).ok_or(CorpusError::EntryNotFound(*id))
    }

    fn list(&self) -> &[EntryId] {
        &self.order
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn random_payload(&mut self, rng: &mut dyn RngCore) -> Option<(EntryId, I)> {
        if self.order.is_empty() {
            return None;
        }
        let index = rng.next_u64() as usize % self.order.len();
        let id = self.order[index];
        match self.get(&id) {
            Ok(input) => Some((id, input)),
            Err(e) => {
                log::error!("corpus: failed to load payload for {}: {}", id, e);
                None
            }
        }
    }

    fn reward_energy(&mut self, id: &EntryId, factor: f64) -> Result<f64, CorpusError> {
        let meta = self
            .entries
            .get_mut(id)
            .ok_or(CorpusError::EntryNotFound(*id))?;
        meta.energy = (meta.energy * factor).min(MAX_ENERGY);
        Ok(meta.energy)
    }

    fn decay_energy(&mut self, id: &EntryId, factor: f64) -> Result<f64, CorpusError> {
        let meta = self
            .entries
            .get_mut(id)
            .ok_or(CorpusError::EntryNotFound(*id))?;
        meta.energy = (meta.energy * factor).max(MIN_ENERGY);
        Ok(meta.energy)
    }

    fn take_external(&mut self) -> Result<Vec<(PathBuf, I)>, CorpusError> {
        let mut found = Vec::new();
        for entry_result in fs::read_dir(&self.corpus_dir).map_err(|e| {
            CorpusError::Io(format!(
                "Failed to scan corpus directory {:?}: {}",
                self.corpus_dir, e
            ))
        })? {
            let entry = entry_result.map_err(|e| {
                CorpusError::Io(format!("Error scanning {:?}: {}", self.corpus_dir, e))
            })?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name() else {
                continue;
            };
            let name_str = name.to_string_lossy();
            if name_str == INDEX_FILENAME || name_str.starts_with('.') {
                continue;
            }
            if self.seen_external.contains(name) {
                continue;
            }
            // Our own payload files are hash-named and indexed.
            if let Some(id) = EntryId::from_hex(&name_str) {
                if self.entries.contains_key(&id) {
                    self.seen_external.insert(name.to_os_string());
                    continue;
                }
            }
            self.seen_external.insert(name.to_os_string());
            match fs::read(&path) {
                Ok(bytes) => {
                    log::info!("corpus: found external file {:?} ({} bytes)", path, bytes.len());
                    found.push((path.clone(), I::from(bytes)));
                }
                Err(e) => log::warn!("corpus: skipping unreadable external file {:?}: {}", path, e),
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use tempfile::tempdir;

    fn sig(units: &[u64]) -> CoverageSignature {
        CoverageSignature::from_units(units.iter().copied())
    }

    fn seed_provenance() -> Provenance {
        Provenance::Seed {
            path: "test".to_string(),
        }
    }

    #[cfg(test)]
    mod in_memory_corpus_tests {
        use super::*;

        #[test]
        fn put_get_len_is_empty() {
            let mut corpus: InMemoryCorpus<Vec<u8>> = InMemoryCorpus::new();
            assert!(corpus.is_empty());
            assert_eq!(corpus.len(), 0);

            let payload1: Vec<u8> = vec![1, 2, 3];
            let id1 = corpus
                .put(payload1.clone(), sig(&[1]), seed_provenance())
                .unwrap();
            assert_eq!(id1, EntryId::of(&[1, 2, 3]));
            assert!(!corpus.is_empty());
            assert_eq!(corpus.len(), 1);

            let payload2: Vec<u8> = vec![4, 5];
            let id2 = corpus
                .put(payload2.clone(), sig(&[2]), seed_provenance())
                .unwrap();
            assert_ne!(id1, id2);
            assert_eq!(corpus.len(), 2);

            assert_eq!(corpus.get(&id1).unwrap(), payload1);
            assert_eq!(corpus.get(&id2).unwrap(), payload2);
            assert_eq!(corpus.list(), &[id1, id2]);

            let missing = EntryId::of(b"never stored");
            assert!(matches!(
                corpus.get(&missing),
                Err(CorpusError::EntryNotFound(_))
            ));
        }

        #[test]
        fn put_same_payload_twice_is_a_noop() {
            let mut corpus: InMemoryCorpus<Vec<u8>> = InMemoryCorpus::new();
            let id1 = corpus
                .put(vec![9, 9, 9], sig(&[1, 2]), seed_provenance())
                .unwrap();
            let before = corpus.metadata(&id1).unwrap().clone();

            let id2 = corpus
                .put(
                    vec![9, 9, 9],
                    sig(&[3, 4]),
                    Provenance::Mutated { parent: id1 },
                )
                .unwrap();
            assert_eq!(id1, id2);
            assert_eq!(corpus.len(), 1);

            // The original entry is untouched.
            let after = corpus.metadata(&id1).unwrap();
            assert_eq!(after.signature, before.signature);
            assert_eq!(after.sequence, before.sequence);
            assert_eq!(after.provenance, before.provenance);
        }

        #[test]
        fn metadata_records_discovery_order_and_provenance() {
            let mut corpus: InMemoryCorpus<Vec<u8>> = InMemoryCorpus::new();
            let id1 = corpus.put(vec![1], sig(&[1]), seed_provenance()).unwrap();
            let id2 = corpus
                .put(vec![2], sig(&[2]), Provenance::Mutated { parent: id1 })
                .unwrap();

            let meta1 = corpus.metadata(&id1).unwrap();
            let meta2 = corpus.metadata(&id2).unwrap();
            assert_eq!(meta1.sequence, 0);
            assert_eq!(meta2.sequence, 1);
            assert_eq!(meta1.size, 1);
            assert_eq!(meta1.energy, INITIAL_ENERGY);
            assert!(meta1.discovered_at_ms > 0);
            assert_eq!(meta2.provenance, Provenance::Mutated { parent: id1 });
        }

        #[test]
        fn random_payload_reaches_every_entry() {
            let mut corpus: InMemoryCorpus<Vec<u8>> = InMemoryCorpus::new();
            let mut rng = ChaCha8Rng::from_seed([42; 32]);
            assert!(corpus.random_payload(&mut rng).is_none());

            let ids = [
                corpus.put(vec![b'A'], sig(&[1]), seed_provenance()).unwrap(),
                corpus.put(vec![b'B'], sig(&[2]), seed_provenance()).unwrap(),
                corpus.put(vec![b'C'], sig(&[3]), seed_provenance()).unwrap(),
            ];

            let mut selected: HashMap<EntryId, u32> = HashMap::new();
            for _ in 0..100 {
                let (id, payload) = corpus
                    .random_payload(&mut rng)
                    .expect("random_payload failed on non-empty corpus");
                assert!(!payload.is_empty());
                *selected.entry(id).or_insert(0) += 1;
            }
            for id in ids {
                assert!(selected.get(&id).copied().unwrap_or(0) > 0, "{id} never selected");
            }
        }

        #[test]
        fn energy_reward_and_decay_are_clamped() {
            let mut corpus: InMemoryCorpus<Vec<u8>> = InMemoryCorpus::new();
            let id = corpus.put(vec![7], sig(&[1]), seed_provenance()).unwrap();

            let rewarded = corpus.reward_energy(&id, 2.0).unwrap();
            assert_eq!(rewarded, INITIAL_ENERGY * 2.0);

            for _ in 0..200 {
                corpus.reward_energy(&id, 10.0).unwrap();
            }
            assert_eq!(corpus.metadata(&id).unwrap().energy, MAX_ENERGY);

            for _ in 0..200 {
                corpus.decay_energy(&id, 0.5).unwrap();
            }
            let floor = corpus.metadata(&id).unwrap().energy;
            assert_eq!(floor, MIN_ENERGY);
            assert!(floor > 0.0);

            let missing = EntryId::of(b"missing");
            assert!(corpus.reward_energy(&missing, 2.0).is_err());
        }
    }

    #[cfg(test)]
    mod on_disk_corpus_tests {
        use super::*;

        #[test]
        fn new_creates_directory_and_empty_index() -> Result<(), CorpusError> {
            let base_dir = tempdir().unwrap();
            let corpus_path = base_dir.path().join("new_disk_corpus");
            assert!(!corpus_path.exists());
            let corpus: OnDiskCorpus<Vec<u8>> = OnDiskCorpus::new(corpus_path.clone())?;
            assert!(corpus_path.exists() && corpus_path.is_dir());
            assert_eq!(corpus.len(), 0);
            assert!(corpus.index_path.exists());

            let reopened: OnDiskCorpus<Vec<u8>> = OnDiskCorpus::new(corpus_path)?;
            assert_eq!(reopened.len(), 0);
            base_dir.close().unwrap();
            Ok(())
        }

        #[test]
        fn put_names_payload_file_by_content_hash() -> Result<(), CorpusError> {
            let dir = tempdir().unwrap();
            let mut corpus: OnDiskCorpus<Vec<u8>> = OnDiskCorpus::new(dir.path().to_path_buf())?;
            let payload = b"hello fuzzer".to_vec();
            let id = corpus.put(payload.clone(), sig(&[1, 2]), seed_provenance())?;

            let expected = dir.path().join(id.to_hex());
            assert!(expected.exists());
            assert_eq!(fs::read(&expected).unwrap(), payload);
            dir.close().unwrap();
            Ok(())
        }

        #[test]
        fn entries_and_metadata_survive_reload() -> Result<(), CorpusError> {
            let dir = tempdir().unwrap();
            let corpus_path = dir.path().to_path_buf();
            let payload: Vec<u8> = vec![1, 2, 3];
            let id;
            {
                let mut corpus: OnDiskCorpus<Vec<u8>> = OnDiskCorpus::new(corpus_path.clone())?;
                id = corpus.put(payload.clone(), sig(&[10, 20]), seed_provenance())?;
                corpus.put(vec![4], sig(&[30]), Provenance::Mutated { parent: id })?;
                assert_eq!(corpus.len(), 2);
            }
            {
                let mut reloaded: OnDiskCorpus<Vec<u8>> = OnDiskCorpus::new(corpus_path)?;
                assert_eq!(reloaded.len(), 2);
                assert_eq!(reloaded.get(&id)?, payload);

                let meta = reloaded.metadata(&id)?;
                assert_eq!(meta.signature, sig(&[10, 20]));
                assert_eq!(meta.sequence, 0);
                assert_eq!(meta.size, 3);

                // Discovery order is preserved.
                assert_eq!(reloaded.list()[0], id);

                // The duplicate of an already-stored payload dedups after
                // reload too.
                let again = reloaded.put(payload.clone(), sig(&[99]), seed_provenance())?;
                assert_eq!(again, id);
                assert_eq!(reloaded.len(), 2);
            }
            dir.close().unwrap();
            Ok(())
        }

        #[test]
        fn get_serves_repeated_reads_from_cache() -> Result<(), CorpusError> {
            let dir = tempdir().unwrap();
            let mut corpus: OnDiskCorpus<Vec<u8>> = OnDiskCorpus::new(dir.path().to_path_buf())?;
            let id1 = corpus.put(vec![1], sig(&[1]), seed_provenance())?;
            let id2 = corpus.put(vec![2, 2], sig(&[2]), seed_provenance())?;

            assert_eq!(corpus.get(&id1)?, vec![1]);
            assert!(matches!(&corpus.last_accessed, Some((id, _)) if id == &id1));

            // Deleting the backing file proves the second read is cached.
            fs::remove_file(dir.path().join(id1.to_hex())).unwrap();
            assert_eq!(corpus.get(&id1)?, vec![1]);

            assert_eq!(corpus.get(&id2)?, vec![2, 2]);
            assert!(matches!(&corpus.last_accessed, Some((id, _)) if id == &id2));
            Ok(())
        }

        #[test]
        fn empty_payloads_are_storable() -> Result<(), CorpusError> {
            let dir = tempdir().unwrap();
            let mut corpus: OnDiskCorpus<Vec<u8>> = OnDiskCorpus::new(dir.path().to_path_buf())?;
            let id = corpus.put(Vec::new(), sig(&[5]), seed_provenance())?;
            assert_eq!(id.to_hex(), "d41d8cd98f00b204e9800998ecf8427e");
            let reloaded: Vec<u8> = corpus.load_payload(&id)?;
            assert!(reloaded.is_empty());
            Ok(())
        }

        #[test]
        fn rejects_file_path_as_corpus_dir() {
            let dir = tempdir().unwrap();
            let file_path = dir.path().join("file.txt");
            File::create(&file_path).unwrap();
            let result = OnDiskCorpus::<Vec<u8>>::new(file_path);
            assert!(result.is_err());
            if let Err(CorpusError::Io(msg)) = result {
                assert!(msg.contains("not a directory"));
            }
            dir.close().unwrap();
        }

        #[test]
        fn take_external_finds_stray_files_once() -> Result<(), CorpusError> {
            let dir = tempdir().unwrap();
            let mut corpus: OnDiskCorpus<Vec<u8>> = OnDiskCorpus::new(dir.path().to_path_buf())?;
            corpus.put(vec![1], sig(&[1]), seed_provenance())?;

            // Index, dotfiles and own payload files are ignored; the stray
            // seed is picked up exactly once.
            fs::write(dir.path().join("dropped_seed"), [8, 9]).unwrap();
            fs::write(dir.path().join(".hidden"), [0]).unwrap();

            let found = corpus.take_external()?;
            assert_eq!(found.len(), 1);
            let (path, payload) = &found[0];
            assert_eq!(path.file_name().unwrap(), "dropped_seed");
            assert_eq!(payload, &vec![8, 9]);

            assert!(corpus.take_external()?.is_empty());
            Ok(())
        }

        #[test]
        fn adopting_an_external_file_absorbs_it_under_its_hash() -> Result<(), CorpusError> {
            let dir = tempdir().unwrap();
            let mut corpus: OnDiskCorpus<Vec<u8>> = OnDiskCorpus::new(dir.path().to_path_buf())?;
            let stray = dir.path().join("from_outside");
            fs::write(&stray, b"external payload").unwrap();

            let found = corpus.take_external()?;
            assert_eq!(found.len(), 1);
            let (path, payload) = found.into_iter().next().unwrap();

            let id = corpus.put(
                payload,
                sig(&[77]),
                Provenance::External {
                    path: path.display().to_string(),
                },
            )?;
            assert!(dir.path().join(id.to_hex()).exists());
            assert!(!stray.exists(), "stray file should be absorbed");
            assert_eq!(corpus.get(&id)?, b"external payload".to_vec());
            Ok(())
        }

        #[test]
        fn hash_named_external_file_is_adoptable() -> Result<(), CorpusError> {
            let dir = tempdir().unwrap();
            let mut corpus: OnDiskCorpus<Vec<u8>> = OnDiskCorpus::new(dir.path().to_path_buf())?;

            // External tool that already names files canonically.
            let payload = b"canonical drop".to_vec();
            let id = EntryId::of(&payload);
            fs::write(dir.path().join(id.to_hex()), &payload).unwrap();

            let found = corpus.take_external()?;
            assert_eq!(found.len(), 1);
            let (path, bytes) = found.into_iter().next().unwrap();
            let adopted = corpus.put(
                bytes,
                sig(&[3]),
                Provenance::External {
                    path: path.display().to_string(),
                },
            )?;
            assert_eq!(adopted, id);
            assert!(dir.path().join(id.to_hex()).exists());
            assert_eq!(corpus.get(&id)?, payload);
            Ok(())
        }
    }

    #[cfg(test)]
    mod seed_collection_tests {
        use super::*;

        #[test]
        fn collects_files_and_directory_entries() -> Result<(), CorpusError> {
            let temp_dir = tempdir().unwrap();
            let seed1 = temp_dir.path().join("s1.bin");
            let seed2 = temp_dir.path().join("s2.txt");
            fs::write(&seed1, [1, 2]).unwrap();
            fs::write(&seed2, [3, 4, 5]).unwrap();
            let seed_dir = temp_dir.path().join("s_dir");
            fs::create_dir(&seed_dir).unwrap();
            fs::write(seed_dir.join("s3.dat"), [6]).unwrap();

            let seeds = collect_seed_files(&[seed1.clone(), seed_dir, seed2])?;
            assert_eq!(seeds.len(), 3);
            assert!(seeds.iter().any(|(p, d)| p == &seed1 && d == &vec![1, 2]));
            temp_dir.close().unwrap();
            Ok(())
        }

        #[test]
        fn skips_index_and_hidden_files_in_directories() -> Result<(), CorpusError> {
            let temp_dir = tempdir().unwrap();
            let seed_dir = temp_dir.path().join("seeds");
            fs::create_dir(&seed_dir).unwrap();
            fs::write(seed_dir.join("good_seed"), [1]).unwrap();
            fs::write(seed_dir.join(INDEX_FILENAME), "{}").unwrap();
            fs::write(seed_dir.join(".hidden"), "data").unwrap();

            let seeds = collect_seed_files(&[seed_dir])?;
            assert_eq!(seeds.len(), 1);
            assert_eq!(seeds[0].1, vec![1]);
            temp_dir.close().unwrap();
            Ok(())
        }

        #[test]
        fn missing_seed_path_is_skipped_not_fatal() -> Result<(), CorpusError> {
            let seeds = collect_seed_files(&[PathBuf::from("/definitely/not/here")])?;
            assert!(seeds.is_empty());
            Ok(())
        }
    }
}

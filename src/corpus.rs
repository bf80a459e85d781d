/// Content-addressed sequence corpus with a single-writer on-disk store
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Sender};
use rand::rngs::StdRng;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::sequence::CallSequence;

#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("cannot prepare corpus directory {0}: {1}")]
    Directory(String, std::io::Error),
}

/// Why a sequence was kept: coverage-adding mutation seed, or minimized
/// failure witness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceClass {
    Seed,
    Witness,
}

struct CorpusInner {
    entries: HashMap<[u8; 32], SequenceClass>,
    sequences: HashMap<[u8; 32], CallSequence>,
    /// non-quarantined seeds eligible for `draw_seed`
    active: Vec<[u8; 32]>,
}

/// Sequences are indexed by the keccak digest of their canonical encoding,
/// so duplicates collapse. Disk writes go through one writer thread; files
/// are temp-written then renamed so a crash never leaves a torn entry.
pub struct Corpus {
    inner: RwLock<CorpusInner>,
    writer: Mutex<Option<Sender<(String, Vec<u8>)>>>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Corpus {
    /// In-memory corpus (no persistence), used when no directory is
    /// configured and by tests.
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(CorpusInner {
                entries: HashMap::new(),
                sequences: HashMap::new(),
                active: vec![],
            }),
            writer: Mutex::new(None),
            writer_handle: Mutex::new(None),
        }
    }

    /// Open a persistent corpus: reload every stored sequence as an active
    /// seed, then start the writer task.
    pub fn open(directory: PathBuf) -> Result<Self, CorpusError> {
        fs::create_dir_all(&directory)
            .map_err(|e| CorpusError::Directory(directory.display().to_string(), e))?;
        let corpus = Self::in_memory();
        let mut loaded = 0usize;
        let pattern = format!("{}/*", directory.display());
        if let Ok(paths) = glob::glob(&pattern) {
            for path in paths.flatten() {
                if path.extension().map(|e| e == "tmp").unwrap_or(false) {
                    continue;
                }
                let Ok(data) = fs::read(&path) else { continue };
                match CallSequence::from_bytes(&data) {
                    Ok(sequence) => {
                        corpus.insert(sequence, SequenceClass::Seed);
                        loaded += 1;
                    }
                    Err(e) => warn!("skipping corrupt corpus file {}: {}", path.display(), e),
                }
            }
        }
        debug!("reloaded {} corpus sequences from disk", loaded);

        let (tx, rx) = unbounded::<(String, Vec<u8>)>();
        let dir = directory.clone();
        let handle = std::thread::Builder::new()
            .name("corpus-writer".into())
            .spawn(move || {
                while let Ok((name, data)) = rx.recv() {
                    let tmp = dir.join(format!("{}.tmp", name));
                    let path = dir.join(&name);
                    if path.exists() {
                        continue;
                    }
                    if let Err(e) = fs::write(&tmp, &data).and_then(|_| fs::rename(&tmp, &path)) {
                        warn!("corpus write for {} failed: {}", name, e);
                    }
                }
            })
            .map_err(|e| CorpusError::Directory(directory.display().to_string(), e))?;

        *corpus.writer.lock().expect("corpus writer lock poisoned") = Some(tx);
        *corpus
            .writer_handle
            .lock()
            .expect("corpus writer lock poisoned") = Some(handle);
        Ok(corpus)
    }

    fn insert(&self, sequence: CallSequence, class: SequenceClass) -> Option<[u8; 32]> {
        let Ok(digest) = sequence.digest() else {
            return None;
        };
        let mut inner = self.inner.write().expect("corpus lock poisoned");
        if inner.entries.contains_key(&digest) {
            return None;
        }
        inner.entries.insert(digest, class);
        inner.sequences.insert(digest, sequence);
        if class == SequenceClass::Seed {
            inner.active.push(digest);
        }
        Some(digest)
    }

    /// Hand an accepted sequence to the corpus. Duplicates (by canonical
    /// encoding) collapse; new entries are queued for the disk writer.
    pub fn submit(&self, sequence: CallSequence, class: SequenceClass) -> bool {
        let encoded = match sequence.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("dropping unencodable sequence: {}", e);
                return false;
            }
        };
        let Some(digest) = self.insert(sequence, class) else {
            return false;
        };
        if let Some(writer) = self.writer.lock().expect("corpus writer lock poisoned").as_ref() {
            let _ = writer.send((hex::encode(digest), encoded));
        }
        true
    }

    /// Uniform draw over the active set; `None` when it is empty (the
    /// caller then generates a short random sequence).
    pub fn draw_seed(&self, rng: &mut StdRng) -> Option<CallSequence> {
        let inner = self.inner.read().expect("corpus lock poisoned");
        if inner.active.is_empty() {
            return None;
        }
        let digest = inner.active[rng.gen_range(0..inner.active.len())];
        inner.sequences.get(&digest).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.inner.read().expect("corpus lock poisoned").active.len()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("corpus lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, digest: &[u8; 32]) -> bool {
        self.inner
            .read()
            .expect("corpus lock poisoned")
            .entries
            .contains_key(digest)
    }

    pub fn witnesses(&self) -> Vec<CallSequence> {
        let inner = self.inner.read().expect("corpus lock poisoned");
        inner
            .entries
            .iter()
            .filter(|(_, class)| **class == SequenceClass::Witness)
            .filter_map(|(digest, _)| inner.sequences.get(digest).cloned())
            .collect()
    }

    /// Stop the writer and wait for queued writes to land. Idempotent.
    pub fn close(&self) {
        // dropping the only sender lets the writer drain its queue and exit
        drop(self.writer.lock().expect("corpus writer lock poisoned").take());
        let handle = self
            .writer_handle
            .lock()
            .expect("corpus writer lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::Call;
    use crate::types::fixed_address;
    use rand::SeedableRng;

    fn sequence(tag: u8) -> CallSequence {
        CallSequence::new(vec![Call::to_contract(
            0,
            fixed_address("00000000000000000000000000000000000000bb"),
            vec![tag, 1, 2, 3],
        )])
    }

    #[test]
    fn test_dedup() {
        let corpus = Corpus::in_memory();
        assert!(corpus.submit(sequence(1), SequenceClass::Seed));
        assert!(!corpus.submit(sequence(1), SequenceClass::Seed));
        assert!(corpus.submit(sequence(2), SequenceClass::Seed));
        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus.active_count(), 2);
    }

    #[test]
    fn test_draw_from_empty_is_none() {
        let corpus = Corpus::in_memory();
        let mut rng = StdRng::seed_from_u64(1);
        assert!(corpus.draw_seed(&mut rng).is_none());
    }

    #[test]
    fn test_witnesses_are_not_drawn() {
        let corpus = Corpus::in_memory();
        corpus.submit(sequence(9), SequenceClass::Witness);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(corpus.draw_seed(&mut rng).is_none());
        assert_eq!(corpus.witnesses().len(), 1);
        assert_eq!(corpus.len(), 1);
    }

    #[test]
    fn test_disk_roundtrip() {
        let dir = std::env::temp_dir().join(format!("hydrafuzz-corpus-{}", std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        {
            let corpus = Corpus::open(dir.clone()).unwrap();
            assert!(corpus.submit(sequence(7), SequenceClass::Seed));
            corpus.close();
        }
        // file is named by content hash and holds the canonical encoding
        let expected = sequence(7).digest_hex().unwrap();
        let path = dir.join(&expected);
        assert!(path.exists());
        let stored = CallSequence::from_bytes(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(stored, sequence(7));

        let reloaded = Corpus::open(dir.clone()).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.active_count(), 1);
        reloaded.close();
        std::fs::remove_dir_all(&dir).ok();
    }
}

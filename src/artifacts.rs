//! Transient reply audio, retrievable once by an opaque id.
//!
//! Files live in a temporary directory owned by the store and disappear with
//! it. Nothing is indexed beyond what is on disk.

use crate::audio::frame::NormalizedAudio;
use crate::audio::wav::write_wav_file;
use crate::defaults;
use crate::error::{Result, TalkbackError};
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tempfile::TempDir;
use uuid::Uuid;

/// Opaque handle to a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactId(String);

impl ArtifactId {
    /// Parses an id received from outside, rejecting anything that is not a
    /// plain uuid-like token.
    pub fn parse(id: &str) -> Result<Self> {
        let valid = !id.is_empty()
            && id.len() <= 64
            && id.chars().all(|c| c.is_ascii_hexdigit() || c == '-');
        if valid {
            Ok(Self(id.to_ascii_lowercase()))
        } else {
            Err(TalkbackError::InvalidArtifactId { id: id.to_string() })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store for reply audio.
///
/// Keeps at most `capacity` artifacts; storing past that evicts the oldest
/// one that has not been taken.
pub struct ArtifactStore {
    dir: TempDir,
    capacity: usize,
    order: Mutex<VecDeque<ArtifactId>>,
}

impl ArtifactStore {
    pub fn new() -> Result<Self> {
        Self::with_capacity(defaults::ARTIFACT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("talkback-").tempdir()?;
        tracing::debug!(dir = %dir.path().display(), capacity, "artifact directory created");
        Ok(Self {
            dir,
            capacity: capacity.max(1),
            order: Mutex::new(VecDeque::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Artifacts stored and not yet taken or evicted.
    pub fn len(&self) -> usize {
        self.order().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn order(&self) -> MutexGuard<'_, VecDeque<ArtifactId>> {
        self.order.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn path_for(&self, id: &ArtifactId) -> PathBuf {
        self.dir.path().join(format!("{}.wav", id.as_str()))
    }

    /// Writes `audio` as a 16-bit WAV and returns its id.
    pub fn store(&self, audio: &NormalizedAudio) -> Result<ArtifactId> {
        let id = ArtifactId(Uuid::new_v4().to_string());
        write_wav_file(&self.path_for(&id), audio)?;
        tracing::debug!(id = %id, samples = audio.len(), "stored artifact");

        let evicted: Vec<ArtifactId> = {
            let mut order = self.order();
            order.push_back(id.clone());
            let excess = order.len().saturating_sub(self.capacity);
            order.drain(..excess).collect()
        };
        for old in evicted {
            match std::fs::remove_file(self.path_for(&old)) {
                Ok(()) => tracing::debug!(id = %old, "evicted artifact"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(id = %old, error = %e, "failed to evict artifact"),
            }
        }
        Ok(id)
    }

    /// Returns the WAV bytes for `id` and deletes the artifact.
    ///
    /// The file is renamed before it is read, so concurrent takes of the same
    /// id see it at most once.
    pub fn take(&self, id: &ArtifactId) -> Result<Vec<u8>> {
        let claimed = self
            .dir
            .path()
            .join(format!("{}.{}.claimed", id.as_str(), Uuid::new_v4()));
        std::fs::rename(self.path_for(id), &claimed).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => TalkbackError::ArtifactNotFound {
                id: id.to_string(),
            },
            _ => TalkbackError::Io(e),
        })?;
        self.order().retain(|kept| kept != id);

        let bytes = std::fs::read(&claimed);
        if let Err(e) = std::fs::remove_file(&claimed) {
            tracing::warn!(id = %id, error = %e, "failed to remove taken artifact");
        }
        Ok(bytes?)
    }

    /// [`take`](Self::take) for an id given as a string.
    pub fn take_str(&self, id: &str) -> Result<Vec<u8>> {
        self.take(&ArtifactId::parse(id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wav::decode_wav;

    fn tone() -> NormalizedAudio {
        let samples = (0..1600).map(|i| (i as f32 * 0.05).sin() * 0.5).collect();
        NormalizedAudio::new(samples, 16000)
    }

    #[test]
    fn test_store_then_take_once() {
        let store = ArtifactStore::new().unwrap();
        let id = store.store(&tone()).unwrap();

        let bytes = store.take(&id).unwrap();
        let pcm = decode_wav(&bytes).unwrap();
        assert_eq!(pcm.sample_rate, 16000);
        assert_eq!(pcm.frame_count(), 1600);

        assert!(matches!(
            store.take(&id),
            Err(TalkbackError::ArtifactNotFound { .. })
        ));
    }

    #[test]
    fn test_ids_are_unique() {
        let store = ArtifactStore::new().unwrap();
        let a = store.store(&tone()).unwrap();
        let b = store.store(&tone()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_rejects_path_like_ids() {
        let store = ArtifactStore::new().unwrap();
        for bad in ["../etc/passwd", "", "abc/def", "a.wav", "zz"] {
            assert!(
                matches!(
                    store.take_str(bad),
                    Err(TalkbackError::InvalidArtifactId { .. })
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_take_by_string_id() {
        let store = ArtifactStore::new().unwrap();
        let id = store.store(&tone()).unwrap();
        let upper = id.as_str().to_ascii_uppercase();
        assert!(store.take_str(&upper).is_ok());
    }

    #[test]
    fn test_oldest_artifacts_are_evicted_past_capacity() {
        let store = ArtifactStore::with_capacity(3).unwrap();
        let ids: Vec<ArtifactId> = (0..10).map(|_| store.store(&tone()).unwrap()).collect();

        assert_eq!(store.len(), 3);
        assert_eq!(std::fs::read_dir(store.dir()).unwrap().count(), 3);
        assert!(matches!(
            store.take(&ids[0]),
            Err(TalkbackError::ArtifactNotFound { .. })
        ));
        assert!(store.take(&ids[9]).is_ok());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_concurrent_takes_yield_one_copy() {
        let store = std::sync::Arc::new(ArtifactStore::new().unwrap());
        let id = store.store(&tone()).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = std::sync::Arc::clone(&store);
                let id = id.clone();
                std::thread::spawn(move || store.take(&id).is_ok())
            })
            .collect();
        let taken = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(taken, 1);
        assert_eq!(std::fs::read_dir(store.dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_directory_removed_on_drop() {
        let store = ArtifactStore::new().unwrap();
        store.store(&tone()).unwrap();
        let dir = store.dir().to_path_buf();
        drop(store);
        assert!(!dir.exists());
    }
}

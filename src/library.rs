// SPDX-License-Identifier: MIT OR Apache-2.0

//! Named storage for steering vectors.
//!
//! [`VectorLibrary`] is the collaborator a host uses to keep vectors between
//! sessions. Names are unique: saving a vector under an existing name
//! replaces the stored entry in place. Two implementations ship with the
//! crate: [`InMemoryLibrary`] and [`JsonFileLibrary`], which keeps a JSON
//! array on disk and rewrites it after every mutation.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::debug;

use crate::error::{MIError, Result};
use crate::interp::steering::SteeringVector;

/// Storage for [`SteeringVector`]s keyed by unique name.
pub trait VectorLibrary: Send + Sync {
    /// Store `vector`, replacing any entry with the same name.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be written.
    fn save(&self, vector: SteeringVector) -> Result<()>;

    /// All stored vectors, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read.
    fn list(&self) -> Result<Vec<SteeringVector>>;

    /// Look up a vector by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read.
    fn get_by_name(&self, name: &str) -> Result<Option<SteeringVector>>;

    /// Remove the vector with the given ID. Returns whether one was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be written.
    fn delete(&self, id: &str) -> Result<bool>;
}

/// Insert or replace by name; returns `true` when an entry was replaced.
fn upsert(entries: &mut Vec<SteeringVector>, vector: SteeringVector) -> bool {
    match entries.iter_mut().find(|v| v.name == vector.name) {
        Some(slot) => {
            *slot = vector;
            true
        }
        None => {
            entries.push(vector);
            false
        }
    }
}

/// Remove by ID; returns `true` when an entry was removed.
fn remove(entries: &mut Vec<SteeringVector>, id: &str) -> bool {
    let before = entries.len();
    entries.retain(|v| v.id != id);
    entries.len() != before
}

/// Error for a lock poisoned by a panicking writer.
fn poisoned() -> MIError {
    MIError::Steering("vector library lock poisoned".into())
}

// ---------------------------------------------------------------------------
// InMemoryLibrary
// ---------------------------------------------------------------------------

/// A library that lives only as long as the process.
#[derive(Debug, Default)]
pub struct InMemoryLibrary {
    /// Stored vectors, insertion order.
    entries: RwLock<Vec<SteeringVector>>,
}

impl InMemoryLibrary {
    /// Create an empty library.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl VectorLibrary for InMemoryLibrary {
    fn save(&self, vector: SteeringVector) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        upsert(&mut entries, vector);
        Ok(())
    }

    fn list(&self) -> Result<Vec<SteeringVector>> {
        Ok(self.entries.read().map_err(|_| poisoned())?.clone())
    }

    fn get_by_name(&self, name: &str) -> Result<Option<SteeringVector>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.iter().find(|v| v.name == name).cloned())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        Ok(remove(&mut entries, id))
    }
}

// ---------------------------------------------------------------------------
// JsonFileLibrary
// ---------------------------------------------------------------------------

/// A library persisted as a JSON array of vectors.
///
/// The file is read once by [`open`](Self::open) and rewritten in full after
/// each `save` or successful `delete`. Vector values are stored as base64
/// strings, so reloading is bit exact.
#[derive(Debug)]
pub struct JsonFileLibrary {
    /// Backing file.
    path: PathBuf,
    /// In-memory mirror of the file contents.
    entries: RwLock<Vec<SteeringVector>>,
}

impl JsonFileLibrary {
    /// Open the library at `path`, starting empty if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Io`] if an existing file cannot be read, or
    /// [`MIError::Json`] if it is not a JSON array of vectors.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries: Vec<SteeringVector> = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            serde_json::from_str(&text)?
        } else {
            Vec::new()
        };
        debug!(path = %path.display(), count = entries.len(), "opened vector library");
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the backing file from `entries`.
    fn persist(&self, entries: &[SteeringVector]) -> Result<()> {
        let json = serde_json::to_string_pretty(entries)?;
        std::fs::write(&self.path, json)?;
        debug!(path = %self.path.display(), count = entries.len(), "wrote vector library");
        Ok(())
    }
}

impl VectorLibrary for JsonFileLibrary {
    fn save(&self, vector: SteeringVector) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        upsert(&mut entries, vector);
        self.persist(&entries)
    }

    fn list(&self) -> Result<Vec<SteeringVector>> {
        Ok(self.entries.read().map_err(|_| poisoned())?.clone())
    }

    fn get_by_name(&self, name: &str) -> Result<Option<SteeringVector>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.iter().find(|v| v.name == name).cloned())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        if !remove(&mut entries, id) {
            return Ok(false);
        }
        self.persist(&entries)?;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "circuit-lens-library-{tag}-{}.json",
            std::process::id()
        ))
    }

    #[test]
    fn saving_same_name_replaces() {
        let lib = InMemoryLibrary::new();
        lib.save(SteeringVector::new("formal", vec![1.0])).unwrap();
        lib.save(SteeringVector::new("casual", vec![2.0])).unwrap();
        lib.save(SteeringVector::new("formal", vec![3.0])).unwrap();

        let all = lib.list().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "formal");
        assert_eq!(all[0].values, vec![3.0]);
        assert_eq!(lib.get_by_name("casual").unwrap().unwrap().values, vec![2.0]);
        assert!(lib.get_by_name("missing").unwrap().is_none());
    }

    #[test]
    fn delete_by_id() {
        let lib = InMemoryLibrary::new();
        let v = SteeringVector::new("x", vec![0.5]);
        let id = v.id.clone();
        lib.save(v).unwrap();
        assert!(!lib.delete("nope").unwrap());
        assert!(lib.delete(&id).unwrap());
        assert!(lib.list().unwrap().is_empty());
    }

    #[test]
    fn json_file_round_trips_bit_exact() {
        let path = temp_path("roundtrip");
        let _ = std::fs::remove_file(&path);

        let values = vec![0.1, -0.0, f32::MIN_POSITIVE, 1e30];
        let v = SteeringVector::new("precise", values.clone());
        {
            let lib = JsonFileLibrary::open(&path).unwrap();
            assert!(lib.list().unwrap().is_empty());
            lib.save(v.clone()).unwrap();
        }

        let reopened = JsonFileLibrary::open(&path).unwrap();
        let loaded = reopened.get_by_name("precise").unwrap().unwrap();
        assert_eq!(loaded, v);
        let bits = |v: &[f32]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&loaded.values), bits(&values));

        assert!(reopened.delete(&v.id).unwrap());
        assert!(JsonFileLibrary::open(&path).unwrap().list().unwrap().is_empty());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn json_file_rejects_garbage() {
        let path = temp_path("garbage");
        std::fs::write(&path, "{\"not\": \"an array\"}").unwrap();
        assert!(matches!(JsonFileLibrary::open(&path), Err(MIError::Json(_))));
        std::fs::remove_file(&path).unwrap();
    }
}

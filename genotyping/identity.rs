// ========================================================================================
//
//                                 Task Identity
//
// ========================================================================================
//
// A task key is the memoization handle shared with the workflow engine: identical
// inputs must always hash to the identical key, across processes and re-runs. The
// inputs are serialized to canonical JSON (struct fields in declaration order,
// sequences in their given order) and hashed with BLAKE2s-256 behind a
// length-prefixed domain tag.

use blake2::{Blake2s256, Digest};
use serde::{Serialize, Serializer};
use std::fmt;
use std::fmt::Write as FmtWrite;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey([u8; 32]);

impl TaskKey {
    /// Derives a key from a tag and any serializable description of the inputs.
    pub fn derive<T: Serialize + ?Sized>(tag: &str, inputs: &T) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_vec(inputs)?;
        let mut hasher = tagged_hasher(tag);
        hasher.update((payload.len() as u64).to_le_bytes());
        hasher.update(&payload);
        Ok(Self(hasher.finalize().into()))
    }

    /// Derives the key of a whole job array from its ordered chunk keys.
    pub fn combine(tag: &str, keys: &[TaskKey]) -> Self {
        let mut hasher = tagged_hasher(tag);
        hasher.update((keys.len() as u64).to_le_bytes());
        for key in keys {
            hasher.update(key.0);
        }
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for byte in self.0 {
            // Writing to a String cannot fail.
            let _ = write!(out, "{byte:02x}");
        }
        out
    }
}

fn tagged_hasher(tag: &str) -> Blake2s256 {
    let mut hasher = Blake2s256::new();
    hasher.update((tag.len() as u64).to_le_bytes());
    hasher.update(tag.as_bytes());
    hasher
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskKey({})", self.to_hex())
    }
}

impl Serialize for TaskKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

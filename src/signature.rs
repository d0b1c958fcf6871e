//! Task signatures
//!
//! Uses BLAKE3 over everything that decides what a task would produce:
//! - the task function (argument vector, or callback name)
//! - sorted inputs with their contents
//! - sorted output paths
//! - sorted scanned dependencies with their contents
//! - the configuration snapshot the generator attached to the task

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use blake3::Hasher;

use crate::project::{Task, TaskFunction};

const DOMAIN: &[u8] = b"bob-signature-v1";

/// Fingerprint of a task
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature([u8; 32]);

impl Signature {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from_bytes(self.0).to_hex().to_string()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", &self.to_hex()[..16])
    }
}

impl FromStr for Signature {
    type Err = blake3::HexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        blake3::Hash::from_hex(s).map(|h| Signature(*h.as_bytes()))
    }
}

/// Compute the signature of `task` against the current file system
pub fn compute(task: &Task) -> Signature {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN);

    match &task.function {
        TaskFunction::Command { argv, .. } => {
            field(&mut hasher, b"command");
            for arg in argv {
                field(&mut hasher, arg.as_bytes());
            }
        }
        TaskFunction::Callback(_) => {
            field(&mut hasher, b"callback");
            field(&mut hasher, task.name.as_bytes());
        }
    }

    field(&mut hasher, b"inputs");
    for path in sorted(task.inputs.iter()) {
        file_field(&mut hasher, path);
    }

    field(&mut hasher, b"outputs");
    for path in sorted(task.outputs.iter()) {
        field(&mut hasher, path.to_string_lossy().as_bytes());
    }

    field(&mut hasher, b"dependencies");
    for path in task.dependencies() {
        file_field(&mut hasher, path);
    }

    field(&mut hasher, b"config");
    for (key, value) in task.config.iter() {
        field(&mut hasher, key.as_bytes());
        let parts = value.fingerprint_parts();
        hasher.update(&(parts.len() as u64).to_le_bytes());
        for part in parts {
            field(&mut hasher, part.as_bytes());
        }
    }

    Signature(*hasher.finalize().as_bytes())
}

/// Content hash of a file, `None` if it cannot be read
pub fn hash_file(path: &Path) -> Option<blake3::Hash> {
    std::fs::read(path).ok().map(|bytes| blake3::hash(&bytes))
}

/// Hex digest over the paths and contents of `paths`, in the given order
pub fn digest_files<'a>(paths: impl IntoIterator<Item = &'a PathBuf>) -> String {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN);
    for path in paths {
        file_field(&mut hasher, path);
    }
    hasher.finalize().to_hex().to_string()
}

fn sorted<'a>(paths: impl Iterator<Item = &'a PathBuf>) -> Vec<&'a PathBuf> {
    let mut paths: Vec<_> = paths.collect();
    paths.sort();
    paths
}

/// Length-prefixed so adjacent fields cannot run together
fn field(hasher: &mut Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn file_field(hasher: &mut Hasher, path: &Path) {
    field(hasher, path.to_string_lossy().as_bytes());
    match hash_file(path) {
        Some(hash) => field(hasher, hash.as_bytes()),
        None => field(hasher, b"<missing>"),
    }
}

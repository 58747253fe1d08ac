use std::path::Path;

/// A stable document identifier derived from the source path.
///
/// The id is the leading 64 bits of the blake3 hash of the canonical path,
/// so it stays the same across builds and platforms.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentId {
    pub numeric: u64,
}

impl DocumentId {
    /// Identify a document by its path. The path is canonicalized when it
    /// exists so that `./a.md` and `/abs/a.md` name the same document.
    pub fn from_path(path: &Path) -> Self {
        let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let hash = blake3::hash(resolved.to_string_lossy().as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&hash.as_bytes()[..8]);
        Self {
            numeric: u64::from_be_bytes(prefix),
        }
    }

    /// Full 16-digit hex form used as the storage key.
    pub fn as_key(&self) -> String {
        format!("{:016x}", self.numeric)
    }

    /// Short prefix for human display.
    pub fn short(&self, len: usize) -> String {
        let mut key = self.as_key();
        key.truncate(len.clamp(6, 16));
        key
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.short(6))
    }
}

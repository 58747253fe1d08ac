use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use crate::{
    document::{ChangeEvent, DocumentInfo},
    walker::DiscoveredFile,
};

/// Change events that bring the index in line with a directory listing.
///
/// `known` may hold documents from anywhere; only those under `root` are
/// considered. Files are compared by absolute path and modification
/// second. Events come out as creations, modifications, then removals,
/// each sorted by path.
pub fn plan_directory(
    root: &Path,
    discovered: &[DiscoveredFile],
    known: &[DocumentInfo],
) -> Vec<ChangeEvent> {
    let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());

    let mut indexed: HashMap<PathBuf, i64> = known
        .iter()
        .map(|info| (PathBuf::from(&info.path), info.modified.timestamp()))
        .filter(|(path, _)| path.starts_with(&root))
        .collect();

    let mut created = Vec::new();
    let mut modified = Vec::new();
    for file in discovered {
        match indexed.remove(&file.absolute_path) {
            None => created.push(ChangeEvent::Created(file.absolute_path.clone())),
            Some(stored) if stored != file.mtime as i64 => {
                modified.push(ChangeEvent::Modified(file.absolute_path.clone()))
            }
            Some(_) => {}
        }
    }

    let mut removed: Vec<ChangeEvent> =
        indexed.into_keys().map(ChangeEvent::Removed).collect();

    created.sort_by(|a, b| a.path().cmp(b.path()));
    modified.sort_by(|a, b| a.path().cmp(b.path()));
    removed.sort_by(|a, b| a.path().cmp(b.path()));

    tracing::debug!(
        root = %root.display(),
        created = created.len(),
        modified = modified.len(),
        removed = removed.len(),
        "planned directory sync"
    );

    created.into_iter().chain(modified).chain(removed).collect()
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::document::FileType;

    fn discovered(root: &Path, name: &str, mtime: u64) -> DiscoveredFile {
        DiscoveredFile {
            relative_path: PathBuf::from(name),
            absolute_path: root.join(name),
            file_type: FileType::Txt,
            mtime,
        }
    }

    fn known(root: &Path, name: &str, mtime: i64) -> DocumentInfo {
        let at = Utc.timestamp_opt(mtime, 0).unwrap();
        DocumentInfo {
            id: name.to_string(),
            path: root.join(name).to_string_lossy().to_string(),
            title: name.to_string(),
            file_type: FileType::Txt,
            page_count: 1,
            first_page: 0,
            size: 0,
            created: at,
            modified: at,
            indexed_at: at,
            metadata: Default::default(),
            content_hash: String::new(),
            topic_path: None,
        }
    }

    #[test]
    fn diff_new_changed_deleted() {
        let root = PathBuf::from("/nonexistent/notes");
        let files = vec![
            discovered(&root, "new.txt", 100),
            discovered(&root, "same.txt", 100),
            discovered(&root, "changed.txt", 200),
        ];
        let stored = vec![
            known(&root, "same.txt", 100),
            known(&root, "changed.txt", 100),
            known(&root, "gone.txt", 100),
            known(Path::new("/elsewhere"), "other.txt", 100),
        ];

        let events = plan_directory(&root, &files, &stored);
        assert_eq!(
            events,
            vec![
                ChangeEvent::Created(root.join("new.txt")),
                ChangeEvent::Modified(root.join("changed.txt")),
                ChangeEvent::Removed(root.join("gone.txt")),
            ]
        );
    }

    #[test]
    fn in_sync_directory_plans_nothing() {
        let root = PathBuf::from("/nonexistent/notes");
        let files = vec![discovered(&root, "a.txt", 5)];
        let stored = vec![known(&root, "a.txt", 5)];
        assert!(plan_directory(&root, &files, &stored).is_empty());
    }
}

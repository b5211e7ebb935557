use std::collections::{BTreeMap, HashMap, HashSet};

use crate::{
    cache::{FailureReason, FileRecord, FileStatus},
    extract::ExtractError,
    walker::DiscoveredFile,
};

/// Result of comparing discovered files against the manifest's records.
#[derive(Debug, Default)]
pub struct FileDiff {
    /// Files with no record.
    pub added: Vec<DiscoveredFile>,
    /// Files whose size or mtime changed, or that can now be retried.
    pub modified: Vec<DiscoveredFile>,
    /// Keys of records whose file is gone.
    pub removed: Vec<String>,
    /// Keys of records that are still current.
    pub unchanged: Vec<String>,
}

impl FileDiff {
    /// Whether a pass over this diff would change anything.
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// Files that need extraction, added ones first.
    pub fn pending(&self) -> impl Iterator<Item = &DiscoveredFile> {
        self.added.iter().chain(&self.modified)
    }
}

/// Partition `discovered` against `records` by (size, mtime).
///
/// Content is not hashed: an edit that keeps both the size and the
/// modification time is not detected. A record that failed for lack of a
/// password is treated as modified once `passwords` has an entry for it.
pub fn diff(
    discovered: &[DiscoveredFile],
    records: &BTreeMap<String, FileRecord>,
    passwords: &HashMap<String, String>,
) -> FileDiff {
    let mut result = FileDiff::default();
    let mut seen = HashSet::new();

    for file in discovered {
        let key = file.key();
        match records.get(&key) {
            None => result.added.push(file.clone()),
            Some(record)
                if record.size != file.size
                    || record.mtime != file.mtime
                    || retry_with_password(record, passwords) =>
            {
                result.modified.push(file.clone());
            }
            Some(_) => result.unchanged.push(key.clone()),
        }
        seen.insert(key);
    }

    result.removed = records
        .keys()
        .filter(|key| !seen.contains(*key))
        .cloned()
        .collect();

    result
}

fn retry_with_password(
    record: &FileRecord,
    passwords: &HashMap<String, String>,
) -> bool {
    matches!(
        &record.status,
        FileStatus::Failed {
            reason: FailureReason::Extract(
                ExtractError::NeedsPassword | ExtractError::Encrypted
            )
        }
    ) && passwords.contains_key(&record.path)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use proptest::prelude::*;

    use super::*;

    fn make_file(name: &str, size: u64, mtime: u64) -> DiscoveredFile {
        DiscoveredFile {
            relative_path: PathBuf::from(name),
            absolute_path: PathBuf::from(format!("/abs/{name}")),
            size,
            mtime,
        }
    }

    fn record(name: &str, size: u64, mtime: u64) -> FileRecord {
        FileRecord {
            path: name.to_string(),
            size,
            mtime,
            status: FileStatus::Indexed,
            chunk_ids: vec![format!("{name}#0")],
        }
    }

    fn records(list: &[FileRecord]) -> BTreeMap<String, FileRecord> {
        list.iter().map(|r| (r.path.clone(), r.clone())).collect()
    }

    #[test]
    fn all_new_files() {
        let files = vec![make_file("a.md", 1, 100), make_file("b.md", 1, 200)];
        let diff = diff(&files, &BTreeMap::new(), &HashMap::new());

        assert_eq!(diff.added.len(), 2);
        assert!(diff.modified.is_empty());
        assert!(diff.removed.is_empty());
        assert!(!diff.is_noop());
    }

    #[test]
    fn unchanged_files_are_noop() {
        let diff = diff(
            &[make_file("a.md", 1, 100)],
            &records(&[record("a.md", 1, 100)]),
            &HashMap::new(),
        );
        assert_eq!(diff.unchanged, vec!["a.md"]);
        assert!(diff.is_noop());
    }

    #[test]
    fn size_or_mtime_change_is_modified() {
        let known = records(&[record("a.md", 1, 100), record("b.md", 1, 100)]);
        let diff = diff(
            &[make_file("a.md", 1, 200), make_file("b.md", 2, 100)],
            &known,
            &HashMap::new(),
        );
        assert_eq!(diff.modified.len(), 2);
        assert!(diff.unchanged.is_empty());
    }

    #[test]
    fn deleted_file_detected() {
        let diff = diff(
            &[],
            &records(&[record("a.md", 1, 100)]),
            &HashMap::new(),
        );
        assert_eq!(diff.removed, vec!["a.md"]);
    }

    #[test]
    fn locked_file_retried_once_password_known() {
        let mut locked = record("secret.pdf", 5, 100);
        locked.status = FileStatus::Failed {
            reason: FailureReason::Extract(ExtractError::NeedsPassword),
        };
        locked.chunk_ids.clear();
        let known = records(&[locked]);
        let files = [make_file("secret.pdf", 5, 100)];

        assert!(diff(&files, &known, &HashMap::new()).is_noop());

        let passwords =
            HashMap::from([("secret.pdf".to_string(), "pw".to_string())]);
        assert_eq!(diff(&files, &known, &passwords).modified.len(), 1);
    }

    #[test]
    fn pending_lists_added_before_modified() {
        let known = records(&[record("a.md", 1, 100)]);
        let diff = diff(
            &[make_file("a.md", 1, 101), make_file("z.md", 1, 1)],
            &known,
            &HashMap::new(),
        );
        let keys: Vec<_> = diff.pending().map(DiscoveredFile::key).collect();
        assert_eq!(keys, vec!["z.md", "a.md"]);
    }

    proptest! {
        #[test]
        fn diff_partitions_every_file(
            on_disk in prop::collection::btree_map("[a-f]", (0u64..3, 0u64..3), 0..6),
            known in prop::collection::btree_map("[a-f]", (0u64..3, 0u64..3), 0..6),
        ) {
            let files: Vec<_> = on_disk
                .iter()
                .map(|(name, (size, mtime))| make_file(name, *size, *mtime))
                .collect();
            let recs: BTreeMap<_, _> = known
                .iter()
                .map(|(name, (size, mtime))| (name.clone(), record(name, *size, *mtime)))
                .collect();

            let d = diff(&files, &recs, &HashMap::new());
            prop_assert_eq!(
                d.added.len() + d.modified.len() + d.unchanged.len(),
                files.len()
            );
            for key in &d.removed {
                prop_assert!(!on_disk.contains_key(key));
                prop_assert!(known.contains_key(key));
            }
            for file in &d.added {
                prop_assert!(!known.contains_key(&file.key()));
            }
            for key in &d.unchanged {
                prop_assert_eq!(on_disk.get(key), known.get(key));
            }
        }
    }
}

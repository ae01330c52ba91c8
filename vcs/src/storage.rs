//! The revision store: every file path keeps its full revision
//! history for the life of the process.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;

#[derive(Debug, PartialEq, Eq)]
pub enum Entry {
    /// An immediate child directory, rendered as `name/ DIR`.
    Dir(String),
    /// An immediate child file with its latest revision.
    File(String, usize),
}

impl Entry {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Entry::Dir(name) | Entry::File(name, _) => name,
        }
    }
}

#[derive(Default)]
pub struct Storage {
    files: RwLock<HashMap<String, Vec<Bytes>>>,
}

impl Storage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a revision and returns its 1-based number. Re-uploading
    /// the latest content verbatim returns the existing revision
    /// without creating a new one.
    pub fn put(&self, path: &str, content: Bytes) -> usize {
        let mut files = self.files.write();
        let revisions = files.entry(path.to_string()).or_default();

        if revisions.last() != Some(&content) {
            revisions.push(content);
        }

        revisions.len()
    }

    /// A specific revision, or the latest when `revision` is `None`.
    #[must_use]
    pub fn get(&self, path: &str, revision: Option<usize>) -> Result<Bytes, GetError> {
        let files = self.files.read();
        let revisions = files.get(path).ok_or(GetError::NoSuchFile)?;

        let revision = revision.unwrap_or(revisions.len());
        if revision == 0 || revision > revisions.len() {
            return Err(GetError::NoSuchRevision);
        }

        Ok(revisions[revision - 1].clone())
    }

    /// Immediate children of `dir`, sorted: subdirectories first as
    /// `Dir`, then files with their true latest revision.
    #[must_use]
    pub fn list(&self, dir: &str) -> Vec<Entry> {
        let prefix = if dir.ends_with('/') {
            dir.to_string()
        } else {
            format!("{dir}/")
        };

        let files = self.files.read();

        let mut entries = vec![];
        for (path, revisions) in files.iter() {
            let Some(name) = path.strip_prefix(&prefix) else {
                continue;
            };

            let entry = match name.split_once('/') {
                Some((child, _)) => Entry::Dir(format!("{child}/")),
                None => Entry::File(name.to_string(), revisions.len()),
            };

            if !entries.contains(&entry) {
                entries.push(entry);
            }
        }

        entries.sort_by(|a, b| a.name().cmp(b.name()));
        entries
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GetError {
    #[error("no such file")]
    NoSuchFile,

    #[error("no such revision")]
    NoSuchRevision,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revisions() {
        let storage = Storage::new();

        assert_eq!(1, storage.put("/a.txt", Bytes::from_static(b"one")));
        assert_eq!(2, storage.put("/a.txt", Bytes::from_static(b"two")));

        assert_eq!(Ok(Bytes::from_static(b"two")), storage.get("/a.txt", None));
        assert_eq!(
            Ok(Bytes::from_static(b"one")),
            storage.get("/a.txt", Some(1))
        );
        assert_eq!(Err(GetError::NoSuchRevision), storage.get("/a.txt", Some(3)));
        assert_eq!(Err(GetError::NoSuchFile), storage.get("/b.txt", None));
    }

    #[test]
    fn test_identical_content_does_not_advance_revision() {
        let storage = Storage::new();

        assert_eq!(1, storage.put("/a.txt", Bytes::from_static(b"same")));
        assert_eq!(1, storage.put("/a.txt", Bytes::from_static(b"same")));
        assert_eq!(2, storage.put("/a.txt", Bytes::from_static(b"changed")));

        // An old revision's content showing up again is still new.
        assert_eq!(3, storage.put("/a.txt", Bytes::from_static(b"same")));
    }

    #[test]
    fn test_list() {
        let storage = Storage::new();
        storage.put("/dir/a.txt", Bytes::from_static(b"1"));
        storage.put("/dir/a.txt", Bytes::from_static(b"2"));
        storage.put("/dir/sub/b.txt", Bytes::from_static(b"1"));
        storage.put("/dir/sub/c.txt", Bytes::from_static(b"1"));
        storage.put("/other.txt", Bytes::from_static(b"1"));

        assert_eq!(
            vec![
                Entry::File("a.txt".to_string(), 2),
                Entry::Dir("sub/".to_string()),
            ],
            storage.list("/dir")
        );

        assert_eq!(
            vec![
                Entry::Dir("dir/".to_string()),
                Entry::File("other.txt".to_string(), 1),
            ],
            storage.list("/")
        );

        assert!(storage.list("/empty").is_empty());
    }
}

// src/fs/mock.rs

use super::FileSystem;
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone)]
pub enum MockEntry {
    File(Vec<u8>),
    Dir(Vec<String>), // List of child names
}

/// In-memory filesystem shared between clones.
///
/// Also records how many times `append_sync` was called per path, so tests
/// can assert that a record hit "disk" before an RPC was issued.
#[derive(Debug, Clone, Default)]
pub struct MockFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, MockEntry>>>,
    syncs: Arc<Mutex<HashMap<PathBuf, usize>>>,
}

impl MockFileSystem {
    pub fn new() -> Self {
        let mut files = HashMap::new();
        // Ensure root exists
        files.insert(PathBuf::from("."), MockEntry::Dir(Vec::new()));

        Self {
            files: Arc::new(Mutex::new(files)),
            syncs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<PathBuf, MockEntry>> {
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_file(&self, path: impl AsRef<Path>, content: impl Into<Vec<u8>>) {
        let path = path.as_ref().to_path_buf();
        let mut files = self.entries();
        files.insert(path.clone(), MockEntry::File(content.into()));
        Self::link_into_parent(&mut files, &path);
    }

    /// Contents of a file as UTF-8 (lossy), or `None` if absent.
    pub fn contents(&self, path: impl AsRef<Path>) -> Option<String> {
        match self.entries().get(path.as_ref()) {
            Some(MockEntry::File(bytes)) => Some(String::from_utf8_lossy(bytes).into_owned()),
            _ => None,
        }
    }

    /// Number of `append_sync` calls made against `path`.
    pub fn sync_count(&self, path: impl AsRef<Path>) -> usize {
        let syncs = self.syncs.lock().unwrap_or_else(|e| e.into_inner());
        syncs.get(path.as_ref()).copied().unwrap_or(0)
    }

    fn parent_of(path: &Path) -> Option<PathBuf> {
        path.parent().map(|p| {
            if p.as_os_str().is_empty() {
                PathBuf::from(".")
            } else {
                p.to_path_buf()
            }
        })
    }

    fn link_into_parent(files: &mut HashMap<PathBuf, MockEntry>, path: &Path) {
        let Some(parent) = Self::parent_of(path) else {
            return;
        };
        if parent == path {
            return;
        }
        if !files.contains_key(&parent) {
            files.insert(parent.clone(), MockEntry::Dir(Vec::new()));
            Self::link_into_parent(files, &parent);
        }
        if let Some(MockEntry::Dir(children)) = files.get_mut(&parent) {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if !children.iter().any(|c| c == name) {
                    children.push(name.to_string());
                }
            }
        }
    }
}

impl FileSystem for MockFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String> {
        let files = self.entries();
        match files.get(path) {
            Some(MockEntry::File(content)) => {
                String::from_utf8(content.clone()).map_err(|e| anyhow!("Invalid UTF-8: {}", e))
            }
            Some(MockEntry::Dir(_)) => Err(anyhow!("Is a directory: {:?}", path)),
            None => Err(anyhow!("File not found: {:?}", path)),
        }
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        self.add_file(path, contents);
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.entries().contains_key(path)
    }

    fn is_file(&self, path: &Path) -> bool {
        matches!(self.entries().get(path), Some(MockEntry::File(_)))
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        let mut files = self.entries();
        match files.remove(path) {
            Some(MockEntry::File(_)) => {
                if let Some(parent) = Self::parent_of(path) {
                    if let (Some(MockEntry::Dir(children)), Some(name)) = (
                        files.get_mut(&parent),
                        path.file_name().and_then(|n| n.to_str()),
                    ) {
                        children.retain(|c| c != name);
                    }
                }
                Ok(())
            }
            Some(entry) => {
                files.insert(path.to_path_buf(), entry);
                Err(anyhow!("Is a directory: {:?}", path))
            }
            None => Err(anyhow!("File not found: {:?}", path)),
        }
    }

    fn append_sync(&self, path: &Path, contents: &[u8]) -> Result<()> {
        {
            let mut files = self.entries();
            match files.get_mut(path) {
                Some(MockEntry::File(existing)) => existing.extend_from_slice(contents),
                Some(MockEntry::Dir(_)) => return Err(anyhow!("Is a directory: {:?}", path)),
                None => {
                    files.insert(path.to_path_buf(), MockEntry::File(contents.to_vec()));
                    Self::link_into_parent(&mut files, path);
                }
            }
        }
        let mut syncs = self.syncs.lock().unwrap_or_else(|e| e.into_inner());
        *syncs.entry(path.to_path_buf()).or_insert(0) += 1;
        Ok(())
    }

    fn len(&self, path: &Path) -> Result<u64> {
        match self.entries().get(path) {
            Some(MockEntry::File(content)) => Ok(content.len() as u64),
            Some(MockEntry::Dir(_)) => Err(anyhow!("Is a directory: {:?}", path)),
            None => Err(anyhow!("File not found: {:?}", path)),
        }
    }

    fn read_from(&self, path: &Path, offset: u64) -> Result<Vec<u8>> {
        match self.entries().get(path) {
            Some(MockEntry::File(content)) => {
                let start = usize::try_from(offset).unwrap_or(usize::MAX).min(content.len());
                Ok(content[start..].to_vec())
            }
            Some(MockEntry::Dir(_)) => Err(anyhow!("Is a directory: {:?}", path)),
            None => Err(anyhow!("File not found: {:?}", path)),
        }
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        match self.entries().get(path) {
            Some(MockEntry::Dir(children)) => {
                Ok(children.iter().map(|name| path.join(name)).collect())
            }
            _ => Err(anyhow!("Not a directory or not found: {:?}", path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_sync_creates_and_extends() {
        let fs = MockFileSystem::new();
        let p = Path::new("logs/run.log");
        fs.append_sync(p, b"one\n").unwrap();
        fs.append_sync(p, b"two\n").unwrap();
        assert_eq!(fs.contents(p).as_deref(), Some("one\ntwo\n"));
        assert_eq!(fs.sync_count(p), 2);
        assert_eq!(fs.read_from(p, 4).unwrap(), b"two\n");
        assert_eq!(fs.read_dir(Path::new("logs")).unwrap(), vec![PathBuf::from("logs/run.log")]);
    }

    #[test]
    fn remove_file_unlinks_from_parent() {
        let fs = MockFileSystem::new();
        fs.add_file("a.lock", "123");
        assert!(fs.exists(Path::new("a.lock")));
        fs.remove_file(Path::new("a.lock")).unwrap();
        assert!(!fs.exists(Path::new("a.lock")));
        assert!(fs.read_dir(Path::new(".")).unwrap().is_empty());
    }

    #[test]
    fn read_from_past_end_is_empty() {
        let fs = MockFileSystem::new();
        fs.add_file("x", "abc");
        assert!(fs.read_from(Path::new("x"), 10).unwrap().is_empty());
    }
}

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// File access for patch application. Paths are relative, `/`-separated.
pub trait WorkTree {
    fn read(&self, path: &str) -> io::Result<Option<Vec<u8>>>;
    fn write(&mut self, path: &str, contents: &[u8]) -> io::Result<()>;
    fn remove(&mut self, path: &str) -> io::Result<()>;
    fn set_mode(&mut self, _path: &str, _mode: u32) -> io::Result<()> {
        Ok(())
    }
}

/// A working tree on disk.
pub struct DirTree {
    root: PathBuf,
}

impl DirTree {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

impl WorkTree for DirTree {
    fn read(&self, path: &str) -> io::Result<Option<Vec<u8>>> {
        let full = self.resolve(path);
        if !full.is_file() {
            return Ok(None);
        }
        fs::read(full).map(Some)
    }

    fn write(&mut self, path: &str, contents: &[u8]) -> io::Result<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(full, contents)
    }

    fn remove(&mut self, path: &str) -> io::Result<()> {
        let full = self.resolve(path);
        match fs::remove_file(&full) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        }
        // Drop directories the removal left empty, like git does.
        let mut dir = full.parent();
        while let Some(d) = dir {
            if d == self.root || fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
        Ok(())
    }

    #[cfg(unix)]
    fn set_mode(&mut self, path: &str, mode: u32) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let full = self.resolve(path);
        let perms = if mode & 0o111 != 0 { 0o755 } else { 0o644 };
        fs::set_permissions(full, fs::Permissions::from_mode(perms))
    }
}

/// In-memory tree, used by tests and dry runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemTree {
    pub files: BTreeMap<String, Vec<u8>>,
    pub modes: BTreeMap<String, u32>,
}

impl MemTree {
    pub fn with_file(mut self, path: &str, contents: &str) -> Self {
        self.files
            .insert(path.to_string(), contents.as_bytes().to_vec());
        self
    }

    pub fn text(&self, path: &str) -> Option<String> {
        self.files
            .get(path)
            .map(|b| String::from_utf8_lossy(b).to_string())
    }
}

impl WorkTree for MemTree {
    fn read(&self, path: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.files.get(path).cloned())
    }

    fn write(&mut self, path: &str, contents: &[u8]) -> io::Result<()> {
        self.files.insert(path.to_string(), contents.to_vec());
        Ok(())
    }

    fn remove(&mut self, path: &str) -> io::Result<()> {
        self.files.remove(path);
        self.modes.remove(path);
        Ok(())
    }

    fn set_mode(&mut self, path: &str, mode: u32) -> io::Result<()> {
        self.modes.insert(path.to_string(), mode);
        Ok(())
    }
}

/// Pending changes layered over a tree. Nothing reaches the underlying tree
/// until `commit`.
pub(crate) struct StagedTree<'a> {
    base: &'a dyn WorkTree,
    changes: BTreeMap<String, Option<String>>,
    modes: BTreeMap<String, u32>,
    order: Vec<String>,
}

impl<'a> StagedTree<'a> {
    pub(crate) fn new(base: &'a dyn WorkTree) -> Self {
        Self {
            base,
            changes: BTreeMap::new(),
            modes: BTreeMap::new(),
            order: Vec::new(),
        }
    }

    /// Current text of `path`; `Err` carries a description when the file is
    /// not valid UTF-8.
    pub(crate) fn read_text(&self, path: &str) -> io::Result<Option<String>> {
        if let Some(staged) = self.changes.get(path) {
            return Ok(staged.clone());
        }
        match self.base.read(path)? {
            None => Ok(None),
            Some(bytes) => String::from_utf8(bytes).map(Some).map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{} is not valid UTF-8", path),
                )
            }),
        }
    }

    pub(crate) fn exists(&self, path: &str) -> io::Result<bool> {
        if let Some(staged) = self.changes.get(path) {
            return Ok(staged.is_some());
        }
        Ok(self.base.read(path)?.is_some())
    }

    pub(crate) fn stage_write(&mut self, path: &str, text: String) {
        self.touch(path);
        self.changes.insert(path.to_string(), Some(text));
    }

    pub(crate) fn stage_remove(&mut self, path: &str) {
        self.touch(path);
        self.changes.insert(path.to_string(), None);
    }

    pub(crate) fn stage_mode(&mut self, path: &str, mode: u32) {
        self.modes.insert(path.to_string(), mode);
    }

    fn touch(&mut self, path: &str) {
        if !self.order.iter().any(|p| p == path) {
            self.order.push(path.to_string());
        }
    }

    pub(crate) fn into_changes(self) -> StagedChanges {
        StagedChanges {
            changes: self.changes,
            modes: self.modes,
            order: self.order,
        }
    }
}

pub(crate) struct StagedChanges {
    changes: BTreeMap<String, Option<String>>,
    modes: BTreeMap<String, u32>,
    order: Vec<String>,
}

impl StagedChanges {
    /// Removals first so a rename onto a path freed in the same patch works.
    pub(crate) fn commit(self, tree: &mut dyn WorkTree) -> io::Result<()> {
        for path in &self.order {
            if let Some(None) = self.changes.get(path) {
                tree.remove(path)?;
            }
        }
        for path in &self.order {
            if let Some(Some(text)) = self.changes.get(path) {
                tree.write(path, text.as_bytes())?;
            }
        }
        for (path, mode) in &self.modes {
            if !matches!(self.changes.get(path), Some(None)) {
                tree.set_mode(path, *mode)?;
            }
        }
        Ok(())
    }
}

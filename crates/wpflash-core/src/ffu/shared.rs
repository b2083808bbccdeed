//! Scoped shared access to the backing image file.
//!
//! An FFU image can be consulted many times over a servicing session
//! (partition probes, GPT reads, the flash loop itself). Instead of
//! keeping a descriptor open for the image's whole lifetime, callers
//! open a scope around each burst of reads; the descriptor is opened on
//! the first scope and closed when the last one drops. Scopes nest.

use std::cell::RefCell;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct SharedFile {
    path: PathBuf,
    state: RefCell<State>,
}

#[derive(Debug, Default)]
struct State {
    file: Option<File>,
    scopes: usize,
}

impl SharedFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: RefCell::new(State::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a read scope. The underlying file opens lazily on the
    /// first active scope.
    pub fn open_scope(&self) -> std::io::Result<FileScope<'_>> {
        let mut state = self.state.borrow_mut();
        if state.scopes == 0 {
            state.file = Some(File::open(&self.path)?);
        }
        state.scopes += 1;
        Ok(FileScope { shared: self })
    }
}

/// RAII handle keeping the shared descriptor open.
pub struct FileScope<'a> {
    shared: &'a SharedFile,
}

impl FileScope<'_> {
    /// Read exactly `buf.len()` bytes at `offset`.
    pub fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        let mut state = self.shared.state.borrow_mut();
        let file = state
            .file
            .as_mut()
            .expect("scope alive implies file open");
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }
}

impl Drop for FileScope<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.state.borrow_mut();
        state.scopes -= 1;
        if state.scopes == 0 {
            state.file = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_scopes_nest_and_close() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let shared = SharedFile::new(tmp.path());

        {
            let outer = shared.open_scope().unwrap();
            let inner = shared.open_scope().unwrap();
            let mut buf = [0u8; 2];
            inner.read_exact_at(2, &mut buf).unwrap();
            assert_eq!(buf, [3, 4]);
            drop(inner);
            // Outer scope keeps the descriptor alive.
            outer.read_exact_at(6, &mut buf).unwrap();
            assert_eq!(buf, [7, 8]);
        }
        assert_eq!(shared.state.borrow().scopes, 0);
        assert!(shared.state.borrow().file.is_none());
    }
}

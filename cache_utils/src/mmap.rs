use core::ffi::c_void;
use core::num::NonZeroUsize;
use core::ptr::NonNull;
use core::slice::from_raw_parts;
use nix::sys::mman;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("cannot open {path}")]
    Open { path: PathBuf, source: io::Error },
    #[error("cannot stat {path}")]
    Metadata { path: PathBuf, source: io::Error },
    #[error("{path} is empty, nothing to map")]
    Empty { path: PathBuf },
    #[error("{path} is too large to map ({len} bytes)")]
    TooLarge { path: PathBuf, len: u64 },
    #[error("cannot mmap {path}")]
    Map { path: PathBuf, source: nix::Error },
}

/// Read-only, shared mapping of a whole file.
///
/// MAP_SHARED (and not MAP_PRIVATE) so that the pages are the page cache frames
/// any other process mapping the same file also uses. The file stays open for
/// the lifetime of the mapping, both are released together on drop.
#[derive(Debug)]
pub struct MMappedFile {
    pointer: NonNull<c_void>,
    size: NonZeroUsize,
    path: PathBuf,
    _file: File,
}

// Empty files are refused by open, there is no empty mapping.
#[allow(clippy::len_without_is_empty)]
impl MMappedFile {
    pub fn open(path: impl AsRef<Path>) -> Result<MMappedFile, MappingError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| MappingError::Open {
            path: path.clone(),
            source,
        })?;
        let len = file
            .metadata()
            .map_err(|source| MappingError::Metadata {
                path: path.clone(),
                source,
            })?
            .len();
        let size = usize::try_from(len).map_err(|_| MappingError::TooLarge {
            path: path.clone(),
            len,
        })?;
        let size = NonZeroUsize::new(size).ok_or_else(|| MappingError::Empty { path: path.clone() })?;

        // The mapping only ever gets read through raw pointers, the victim may
        // rewrite the file under us without breaking any aliasing assumption.
        let pointer = unsafe {
            mman::mmap(
                None,
                size,
                mman::ProtFlags::PROT_READ,
                mman::MapFlags::MAP_SHARED,
                &file,
                0,
            )
        }
        .map_err(|source| MappingError::Map {
            path: path.clone(),
            source,
        })?;

        tracing::info!(path = %path.display(), len = size.get(), base = ?pointer, "mapped target");
        Ok(MMappedFile {
            pointer,
            size,
            path,
            _file: file,
        })
    }

    pub fn base(&self) -> *const u8 {
        self.pointer.as_ptr() as *const u8
    }

    pub fn len(&self) -> usize {
        self.size.get()
    }

    pub fn contains(&self, p: *const u8) -> bool {
        let base = self.base() as usize;
        let p = p as usize;
        base <= p && p - base < self.len()
    }

    pub fn slice(&self) -> &[u8] {
        unsafe { from_raw_parts(self.base(), self.len()) }
    }
}

impl Drop for MMappedFile {
    fn drop(&mut self) {
        match unsafe { mman::munmap(self.pointer, self.size.get()) } {
            Ok(()) => tracing::debug!(path = %self.path.display(), "unmapped target"),
            Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "munmap failed"),
        }
    }
}

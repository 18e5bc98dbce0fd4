//! Disk-backed payload storage.
//!
//! Raw nights can hold hundreds of exposures of tens of megabytes each. With
//! disk backing enabled, pixel payloads live in a scratch directory and only
//! headers stay resident. Every spilled payload is owned by a [`ScratchFile`]
//! handle that deletes its file when the last reference drops; the
//! [`ScratchArena`] tracks all live handles so the whole directory can be
//! purged at once when a [`ScratchSession`] ends (normal exit, error or panic).

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ndarray::Array2;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::consts::SCRATCH_EXTENSION;
use crate::error::{DrpError, Result};

static ACTIVE_ARENA: RwLock<Option<Arc<ScratchArena>>> = RwLock::new(None);

/// Registry of the scratch files created under one directory.
#[derive(Debug)]
pub struct ScratchArena {
    dir: PathBuf,
    live: Mutex<HashSet<PathBuf>>,
}

impl ScratchArena {
    pub fn new(dir: &Path) -> Result<Arc<Self>> {
        fs::create_dir_all(dir)?;
        Ok(Arc::new(Self {
            dir: dir.to_path_buf(),
            live: Mutex::new(HashSet::new()),
        }))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `data` to a freshly named scratch file and return its handle.
    pub fn acquire(self: &Arc<Self>, data: &Array2<f32>) -> Result<ScratchFile> {
        let path = self
            .dir
            .join(format!("{}.{}", Uuid::new_v4(), SCRATCH_EXTENSION));
        write_payload(&path, data)?;
        self.lock_live().insert(path.clone());
        Ok(ScratchFile {
            path,
            arena: Arc::clone(self),
        })
    }

    /// Number of scratch files currently owned by live handles.
    pub fn live_count(&self) -> usize {
        self.lock_live().len()
    }

    /// Remove every registered scratch file and any stray scratch file left
    /// in the directory (e.g. by a previous crashed run). Returns the number
    /// of files deleted.
    pub fn purge(&self) -> usize {
        let mut removed = 0;
        let registered: Vec<PathBuf> = self.lock_live().drain().collect();
        for path in registered {
            if fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        match purge_scratch_dir(&self.dir) {
            Ok(n) => removed += n,
            Err(e) => warn!(dir = %self.dir.display(), error = %e, "Could not scan scratch directory"),
        }
        debug!(removed, dir = %self.dir.display(), "Purged scratch files");
        removed
    }

    fn release(&self, path: &Path) {
        self.lock_live().remove(path);
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Failed to remove scratch file");
            }
        }
    }

    fn lock_live(&self) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Owning handle of one spilled payload. The file is removed on drop.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
    arena: Arc<ScratchArena>,
}

impl ScratchFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Array2<f32>> {
        read_payload(&self.path)
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        self.arena.release(&self.path);
    }
}

/// Scope of process-wide disk backing. Dropping it disables disk backing and
/// purges the arena.
#[must_use = "disk backing ends when the session is dropped"]
pub struct ScratchSession {
    arena: Arc<ScratchArena>,
}

impl ScratchSession {
    pub fn arena(&self) -> &Arc<ScratchArena> {
        &self.arena
    }
}

impl Drop for ScratchSession {
    fn drop(&mut self) {
        {
            let mut active = ACTIVE_ARENA.write().unwrap_or_else(|e| e.into_inner());
            if active
                .as_ref()
                .is_some_and(|a| Arc::ptr_eq(a, &self.arena))
            {
                *active = None;
            }
        }
        let removed = self.arena.purge();
        info!(removed, "Scratch cache cleaned");
    }
}

/// Enable disk-backed payloads for every image created from now on.
pub fn enable_disk_backing(dir: &Path) -> Result<ScratchSession> {
    let arena = ScratchArena::new(dir)?;
    let mut active = ACTIVE_ARENA.write().unwrap_or_else(|e| e.into_inner());
    if active.is_some() {
        return Err(DrpError::Config(
            "disk backing is already enabled for this process".into(),
        ));
    }
    *active = Some(Arc::clone(&arena));
    info!(dir = %dir.display(), "Using disk-backed image payloads");
    Ok(ScratchSession { arena })
}

pub fn active_arena() -> Option<Arc<ScratchArena>> {
    ACTIVE_ARENA
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
}

/// Purge the active arena, if any. Safe to call at any shutdown point.
pub fn purge_scratch() -> usize {
    active_arena().map(|a| a.purge()).unwrap_or(0)
}

/// Delete every scratch file in `dir`, whether or not a live arena owns it.
pub fn purge_scratch_dir(dir: &Path) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_scratch = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == SCRATCH_EXTENSION);
        if is_scratch && path.is_file() && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

fn write_payload(path: &Path, data: &Array2<f32>) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    let (h, w) = data.dim();
    writer.write_u64::<LittleEndian>(h as u64)?;
    writer.write_u64::<LittleEndian>(w as u64)?;
    for &v in data.iter() {
        writer.write_f32::<LittleEndian>(v)?;
    }
    writer.flush()?;
    Ok(())
}

fn read_payload(path: &Path) -> Result<Array2<f32>> {
    let mut reader = BufReader::new(File::open(path)?);
    let h = reader.read_u64::<LittleEndian>()? as usize;
    let w = reader.read_u64::<LittleEndian>()? as usize;
    let mut values = vec![0.0f32; h * w];
    reader.read_f32_into::<LittleEndian>(&mut values)?;
    Array2::from_shape_vec((h, w), values)
        .map_err(|e| DrpError::Fits(format!("corrupt scratch payload {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_drop_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let arena = ScratchArena::new(dir.path()).unwrap();
        let data = Array2::from_elem((3, 4), 1.5f32);
        let handle = arena.acquire(&data).unwrap();
        let path = handle.path().to_path_buf();
        assert!(path.exists());
        assert_eq!(handle.load().unwrap(), data);
        assert_eq!(arena.live_count(), 1);
        drop(handle);
        assert!(!path.exists());
        assert_eq!(arena.live_count(), 0);
    }

    #[test]
    fn purge_removes_registered_and_stray_files() {
        let dir = tempfile::tempdir().unwrap();
        let arena = ScratchArena::new(dir.path()).unwrap();
        let data = Array2::<f32>::zeros((2, 2));
        let a = arena.acquire(&data).unwrap();
        let b = arena.acquire(&data).unwrap();
        std::fs::write(dir.path().join("leftover.scratch"), b"junk").unwrap();
        std::fs::write(dir.path().join("keep.txt"), b"not scratch").unwrap();

        assert_eq!(arena.purge(), 3);
        assert!(!a.path().exists());
        assert!(!b.path().exists());
        assert!(dir.path().join("keep.txt").exists());
        // Dropping handles after a purge is harmless.
        drop(a);
        drop(b);
    }
}

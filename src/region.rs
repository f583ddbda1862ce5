//! Fixed-capacity byte region shared by all clients of a session.
//!
//! The region is the only truly shared mutable state in the system.
//! Reads take a shared lock and never block each other; a write holds
//! the exclusive lock for the whole range so no reader can observe a
//! half-applied update. File-backed regions keep the full image in
//! memory and write through to the backing file while still holding
//! the write lock, so file order matches memory order.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

/// Default region capacity: one megabyte, the size of a full cart image.
pub const DEFAULT_CAPACITY: usize = 1024 * 1024;

/// Region errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionError {
    /// Requested range falls outside `[0, capacity)`.
    OutOfRange {
        offset: i64,
        size: i64,
        capacity: usize,
    },
    /// Backing file I/O failed. Fatal to the request, not the region.
    Io(String),
}

impl std::fmt::Display for RegionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfRange {
                offset,
                size,
                capacity,
            } => write!(
                f,
                "range [{offset}, {offset}+{size}) outside region of {capacity} bytes"
            ),
            Self::Io(e) => write!(f, "region backing store error: {e}"),
        }
    }
}

impl std::error::Error for RegionError {}

impl From<std::io::Error> for RegionError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// A fixed-capacity, byte-addressable memory image.
pub struct MemoryRegion {
    capacity: usize,
    bytes: RwLock<Vec<u8>>,
    /// Write-through backing file, when persistence is enabled.
    file: Option<Arc<Mutex<File>>>,
}

impl MemoryRegion {
    /// Create a zero-filled in-memory region.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            bytes: RwLock::new(vec![0u8; capacity]),
            file: None,
        }
    }

    /// Open a file-backed region.
    ///
    /// A missing file is created zero-filled at exactly `capacity` bytes;
    /// an existing file is loaded as the initial image. Returns the region
    /// and whether the backing file was freshly created.
    pub fn open(path: &Path, capacity: usize) -> Result<(Self, bool), RegionError> {
        let created = !path.exists();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let mut image = vec![0u8; capacity];
        if created {
            file.write_all(&image)?;
            file.flush()?;
        } else {
            file.seek(SeekFrom::Start(0))?;
            let mut loaded = Vec::with_capacity(capacity);
            file.read_to_end(&mut loaded)?;
            loaded.resize(capacity, 0);
            image.copy_from_slice(&loaded[..capacity]);
        }

        Ok((
            Self {
                capacity,
                bytes: RwLock::new(image),
                file: Some(Arc::new(Mutex::new(file))),
            },
            created,
        ))
    }

    /// Region capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether this region writes through to a backing file.
    pub fn is_persistent(&self) -> bool {
        self.file.is_some()
    }

    /// Read an exact copy of `[offset, offset+size)`.
    pub async fn read(&self, offset: i64, size: i64) -> Result<Vec<u8>, RegionError> {
        let (start, len) = self.check_range(offset, size)?;
        let bytes = self.bytes.read().await;
        Ok(bytes[start..start + len].to_vec())
    }

    /// Write `data` at `offset`, atomically with respect to other
    /// reads and writes of the same range.
    ///
    /// Does not notify watchers; publishing the change event is the
    /// service boundary's job, immediately after a successful write.
    pub async fn write(&self, offset: i64, data: &[u8]) -> Result<(), RegionError> {
        let (start, len) = self.check_range(offset, data.len() as i64)?;

        let mut bytes = self.bytes.write().await;
        bytes[start..start + len].copy_from_slice(data);

        // Write through while still holding the lock so concurrent
        // writers hit the file in the same order as the image. The
        // file I/O itself runs on the blocking pool, off the async
        // worker threads.
        if let Some(ref file) = self.file {
            let file = file.clone();
            let buf = data.to_vec();
            tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                let mut f = file.lock().expect("backing file poisoned");
                f.seek(SeekFrom::Start(start as u64))?;
                f.write_all(&buf)?;
                f.flush()
            })
            .await
            .map_err(|e| RegionError::Io(e.to_string()))??;
        }

        Ok(())
    }

    /// Validate `[offset, offset+size)` against the capacity.
    /// Out-of-range requests are rejected, never clamped.
    fn check_range(&self, offset: i64, size: i64) -> Result<(usize, usize), RegionError> {
        let out_of_range = || RegionError::OutOfRange {
            offset,
            size,
            capacity: self.capacity,
        };

        if offset < 0 || size < 0 {
            return Err(out_of_range());
        }
        let end = offset.checked_add(size).ok_or_else(out_of_range)?;
        if end > self.capacity as i64 {
            return Err(out_of_range());
        }
        Ok((offset as usize, size as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_region_starts_zero_filled() {
        let region = MemoryRegion::new(1024);
        let bytes = region.read(0, 1024).await.unwrap();
        assert_eq!(bytes, vec![0u8; 1024]);
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let region = MemoryRegion::new(1024);
        region.write(100, &[1, 2, 3, 4]).await.unwrap();

        assert_eq!(region.read(100, 4).await.unwrap(), vec![1, 2, 3, 4]);

        // Everything outside the written range is still zero.
        let all = region.read(0, 1024).await.unwrap();
        assert!(all[..100].iter().all(|&b| b == 0));
        assert!(all[104..].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_out_of_range_rejected() {
        let region = MemoryRegion::new(1024);

        assert!(matches!(
            region.read(-1, 4).await,
            Err(RegionError::OutOfRange { .. })
        ));
        assert!(matches!(
            region.read(0, -1).await,
            Err(RegionError::OutOfRange { .. })
        ));
        assert!(matches!(
            region.read(1024, 1).await,
            Err(RegionError::OutOfRange { .. })
        ));
        // 1020 + 8 > 1024
        assert!(matches!(
            region.write(1020, &[0u8; 8]).await,
            Err(RegionError::OutOfRange { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_write_does_not_mutate() {
        let region = MemoryRegion::new(1024);
        region.write(1016, &[9; 8]).await.unwrap();

        assert!(region.write(1020, &[7; 8]).await.is_err());
        assert_eq!(region.read(1016, 8).await.unwrap(), vec![9; 8]);
    }

    #[tokio::test]
    async fn test_boundary_ranges() {
        let region = MemoryRegion::new(1024);
        // Zero-size at the very end is within bounds.
        assert_eq!(region.read(1024, 0).await.unwrap(), Vec::<u8>::new());
        region.write(1016, &[5; 8]).await.unwrap();
        assert_eq!(region.read(1016, 8).await.unwrap(), vec![5; 8]);
    }

    #[tokio::test]
    async fn test_concurrent_disjoint_writes() {
        let region = Arc::new(MemoryRegion::new(1024));

        let r1 = region.clone();
        let r2 = region.clone();
        let a = tokio::spawn(async move { r1.write(0, &[1; 64]).await });
        let b = tokio::spawn(async move { r2.write(512, &[2; 64]).await });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(region.read(0, 64).await.unwrap(), vec![1; 64]);
        assert_eq!(region.read(512, 64).await.unwrap(), vec![2; 64]);
        // An untouched third range is still zero.
        assert_eq!(region.read(256, 64).await.unwrap(), vec![0; 64]);
    }

    #[tokio::test]
    async fn test_file_backed_create_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alpha.mem");

        {
            let (region, created) = MemoryRegion::open(&path, 1024).unwrap();
            assert!(created);
            assert!(region.is_persistent());
            region.write(10, &[42; 4]).await.unwrap();
        }

        // Reopen: prior contents survive, creation flag is off.
        let (region, created) = MemoryRegion::open(&path, 1024).unwrap();
        assert!(!created);
        assert_eq!(region.read(10, 4).await.unwrap(), vec![42; 4]);
        assert_eq!(region.read(0, 10).await.unwrap(), vec![0; 10]);
    }

    #[tokio::test]
    async fn test_file_backed_concurrent_writes_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gamma.mem");
        let (region, _) = MemoryRegion::open(&path, 1024).unwrap();
        let region = Arc::new(region);

        let r1 = region.clone();
        let r2 = region.clone();
        let a = tokio::spawn(async move { r1.write(0, &[1; 64]).await });
        let b = tokio::spawn(async move { r2.write(512, &[2; 64]).await });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        // Both writes reached the backing file.
        drop(region);
        let (reloaded, created) = MemoryRegion::open(&path, 1024).unwrap();
        assert!(!created);
        assert_eq!(reloaded.read(0, 64).await.unwrap(), vec![1; 64]);
        assert_eq!(reloaded.read(512, 64).await.unwrap(), vec![2; 64]);
    }

    #[tokio::test]
    async fn test_file_backed_zero_filled_at_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beta.mem");

        let (_region, created) = MemoryRegion::open(&path, 2048).unwrap();
        assert!(created);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 2048);
    }
}

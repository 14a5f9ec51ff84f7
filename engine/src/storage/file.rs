use super::{check_transfer, DurableStorage};
use crate::errors::{EngineError, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Fixed-size file acting as the NVM arena on the reference platform.
#[derive(Debug)]
pub struct FileStorage {
    file: File,
    path: PathBuf,
    capacity: u32,
    max_transfer: u32,
}

impl FileStorage {
    /// Create the backing file, or extend an existing one, to `capacity` bytes.
    pub fn init(path: &Path, capacity: u32, max_transfer: u32) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() < capacity as u64 {
            file.set_len(capacity as u64)?;
        }

        info!(path = %path.display(), capacity, "NVM file ready");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            capacity,
            max_transfer,
        })
    }

    /// Open an existing backing file; its size must cover `capacity`.
    pub fn open(path: &Path, capacity: u32, max_transfer: u32) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < capacity as u64 {
            return Err(EngineError::Storage(format!(
                "{} holds {} bytes, expected at least {}",
                path.display(),
                len,
                capacity
            )));
        }

        debug!(path = %path.display(), len, "Opened NVM file");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            capacity,
            max_transfer,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush written data to the device.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

impl DurableStorage for FileStorage {
    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn max_transfer(&self) -> u32 {
        self.max_transfer
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<()> {
        check_transfer(self.capacity, self.max_transfer, offset, buf.len())?;
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        check_transfer(self.capacity, self.max_transfer, offset, data.len())?;
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn erase(&mut self) -> Result<()> {
        let zeros = vec![0u8; self.max_transfer as usize];
        let mut offset = 0u32;
        while offset < self.capacity {
            let len = (self.capacity - offset).min(self.max_transfer) as usize;
            self.write(offset, &zeros[..len])?;
            offset += len as u32;
        }
        self.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_creates_sized_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nvm.bin");
        let storage = FileStorage::init(&path, 8192, 1024).unwrap();
        assert_eq!(storage.capacity(), 8192);
        assert_eq!(storage.path(), path.as_path());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8192);
    }

    #[test]
    fn test_contents_persist_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nvm.bin");
        {
            let mut storage = FileStorage::init(&path, 4096, 1024).unwrap();
            storage.write_u16(300, 0xBEEF).unwrap();
            storage.sync().unwrap();
        }
        let mut storage = FileStorage::open(&path, 4096, 1024).unwrap();
        assert_eq!(storage.read_u16(300).unwrap(), 0xBEEF);
    }

    #[test]
    fn test_open_rejects_short_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nvm.bin");
        std::fs::write(&path, [0u8; 100]).unwrap();
        let err = FileStorage::open(&path, 4096, 1024).unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));
    }

    #[test]
    fn test_open_missing_file_is_io_error() {
        let temp_dir = TempDir::new().unwrap();
        let err = FileStorage::open(&temp_dir.path().join("absent.bin"), 4096, 1024).unwrap_err();
        assert!(matches!(err, EngineError::Io(_)));
    }

    #[test]
    fn test_erase_clears_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nvm.bin");
        let mut storage = FileStorage::init(&path, 3000, 1024).unwrap();
        storage.write(2990, &[0xFFu8; 10]).unwrap();
        storage.erase().unwrap();
        assert_eq!(storage.read_vec(2990, 10).unwrap(), vec![0u8; 10]);
    }
}

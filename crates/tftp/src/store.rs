//! Blob store
//!
//! A bounded filesystem interface rooted at two directories: files served
//! to clients come from the read root, files received from clients land in
//! the write root. Open-for-read knows the blob size up front; open-for-write
//! truncates; both hand out strictly sequential handles.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Join a root directory and a client-requested filename, inserting a path
/// separator only when the root does not already end with one. The
/// requested name is spliced verbatim; no traversal sanitization is
/// performed.
fn splice_path(root: &Path, name: &str) -> PathBuf {
    let mut joined = root.as_os_str().to_os_string();
    if !joined.as_encoded_bytes().ends_with(b"/") {
        joined.push("/");
    }
    joined.push(name);
    PathBuf::from(joined)
}

/// Filesystem access for all sessions of one server instance.
#[derive(Debug, Clone)]
pub struct BlobStore {
    read_root: PathBuf,
    write_root: PathBuf,
}

impl BlobStore {
    pub fn new(read_root: impl Into<PathBuf>, write_root: impl Into<PathBuf>) -> Self {
        Self {
            read_root: read_root.into(),
            write_root: write_root.into(),
        }
    }

    /// Full path a read request for `name` resolves to.
    pub fn read_path(&self, name: &str) -> PathBuf {
        splice_path(&self.read_root, name)
    }

    /// Full path a write request for `name` resolves to.
    pub fn write_path(&self, name: &str) -> PathBuf {
        splice_path(&self.write_root, name)
    }

    /// Open `name` under the read root. The blob size is known once open.
    pub async fn open_read(&self, name: &str) -> io::Result<BlobReader> {
        let path = self.read_path(name);
        let file = File::open(&path).await?;
        let size = file.metadata().await?.len();

        Ok(BlobReader { file, size })
    }

    /// Open `name` under the write root, truncating any existing file.
    pub async fn open_write(&self, name: &str) -> io::Result<BlobWriter> {
        let path = self.write_path(name);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;

        Ok(BlobWriter { file })
    }
}

/// Sequential reader over one blob.
pub struct BlobReader {
    file: File,
    size: u64,
}

impl BlobReader {
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Fill `buf` from the current position, short only at end-of-file.
    /// Returns the number of bytes read.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

/// Sequential writer over one blob.
pub struct BlobWriter {
    file: File,
}

impl BlobWriter {
    pub async fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data).await?;
        self.file.flush().await
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn splice_inserts_separator_only_when_missing() {
        assert_eq!(splice_path(Path::new("/srv/tftp"), "boot.img"), PathBuf::from("/srv/tftp/boot.img"));
        assert_eq!(splice_path(Path::new("/srv/tftp/"), "boot.img"), PathBuf::from("/srv/tftp/boot.img"));
        // Requested names pass through verbatim, subdirectories included.
        assert_eq!(
            splice_path(Path::new("/srv/tftp"), "bios/pxelinux.0"),
            PathBuf::from("/srv/tftp/bios/pxelinux.0")
        );
    }

    #[tokio::test]
    async fn open_read_knows_size() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("blob.bin"), vec![7u8; 600]).unwrap();

        let store = BlobStore::new(dir.path(), dir.path());
        let mut reader = store.open_read("blob.bin").await.unwrap();
        assert_eq!(reader.size(), 600);

        let mut chunk = vec![0u8; 512];
        assert_eq!(reader.read_chunk(&mut chunk).await.unwrap(), 512);
        let mut rest = vec![0u8; 88];
        assert_eq!(reader.read_chunk(&mut rest).await.unwrap(), 88);
    }

    #[tokio::test]
    async fn open_read_missing_file_fails() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path(), dir.path());
        assert!(store.open_read("no-such-file").await.is_err());
    }

    #[tokio::test]
    async fn open_write_truncates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.bin");
        std::fs::write(&path, b"previous contents, quite long").unwrap();

        let store = BlobStore::new(dir.path(), dir.path());
        let mut writer = store.open_write("out.bin").await.unwrap();
        writer.append(b"new").await.unwrap();
        drop(writer);

        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }
}

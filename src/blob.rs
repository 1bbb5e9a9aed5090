use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use ulid::Ulid;

/// A file picked by staff: class flyer or payment receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl Attachment {
    /// Lower-case alphanumeric extension, `bin` when there is none.
    pub fn extension(&self) -> String {
        let ext: String = self
            .file_name
            .rsplit_once('.')
            .map(|(_, e)| e)
            .unwrap_or_default()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(8)
            .collect::<String>()
            .to_ascii_lowercase();
        if ext.is_empty() { "bin".into() } else { ext }
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store the attachment and return the reference kept on bookings.
    async fn put(&self, attachment: &Attachment) -> io::Result<String>;
}

/// Blobs as files in one directory, named `<ulid>.<ext>`.
pub struct FsBlobStore {
    dir: PathBuf,
}

impl FsBlobStore {
    pub fn new(dir: PathBuf) -> io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, attachment: &Attachment) -> io::Result<String> {
        let name = format!("{}.{}", Ulid::new(), attachment.extension());
        tokio::fs::write(self.dir.join(&name), &attachment.bytes).await?;
        Ok(name)
    }
}

//! Zip extraction via a temporary spool file

use crate::sanitize::{check_link_target, join_checked};
use async_trait::async_trait;
use pget_download::{ByteStream, ConsumeError, Consumer};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Extracts a zip archive into the destination directory.
///
/// Zip needs random access (the central directory is at the end), so the
/// stream is first materialized to an unlinked temporary file; the
/// buffer pool already bounds how fast that spool can grow.
#[derive(Debug, Clone, Default)]
pub struct ZipExtractor {
    overwrite: bool,
}

impl ZipExtractor {
    /// Create an extractor; `overwrite` replaces existing files
    pub fn new(overwrite: bool) -> Self {
        Self { overwrite }
    }
}

#[async_trait]
impl Consumer for ZipExtractor {
    async fn consume(
        &self,
        mut reader: ByteStream,
        dest: &Path,
        _expected_size: u64,
        _content_type: Option<&str>,
    ) -> Result<(), ConsumeError> {
        let spool = tempfile::tempfile()?;
        let mut spool = tokio::fs::File::from_std(spool);
        tokio::io::copy(&mut reader, &mut spool).await?;
        spool.flush().await?;
        let spool = spool.into_std().await;

        let dest = dest.to_path_buf();
        let overwrite = self.overwrite;
        tokio::task::spawn_blocking(move || extract_zip(spool, &dest, overwrite))
            .await
            .map_err(|err| ConsumeError::Archive {
                reason: format!("extraction task failed: {err}"),
            })?
    }

    fn enable_overwrite(&mut self) {
        self.overwrite = true;
    }
}

struct PendingLink {
    location: PathBuf,
    target: PathBuf,
}

const S_IFMT: u32 = 0o170_000;
const S_IFLNK: u32 = 0o120_000;

fn extract_zip(mut spool: std::fs::File, dest: &Path, overwrite: bool) -> Result<(), ConsumeError> {
    spool.seek(SeekFrom::Start(0))?;
    std::fs::create_dir_all(dest)?;
    let mut archive = zip::ZipArchive::new(spool).map_err(zip_error)?;
    let mut links: Vec<PendingLink> = Vec::new();

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(zip_error)?;
        if entry.name().is_empty() {
            return Err(ConsumeError::EmptyEntryName);
        }
        let raw_path = PathBuf::from(entry.name());
        let target = join_checked(dest, &raw_path)?;
        let mode = entry.unix_mode().unwrap_or(0o644);

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }

        if mode & S_IFMT == S_IFLNK {
            let mut link_target = String::new();
            entry.read_to_string(&mut link_target)?;
            links.push(PendingLink {
                location: target,
                target: PathBuf::from(link_target),
            });
            continue;
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_regular(&mut entry, &target, mode, overwrite)?;
    }

    for link in links {
        if let Some(parent) = link.location.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if overwrite && link.location.symlink_metadata().is_ok() {
            std::fs::remove_file(&link.location)?;
        }
        check_link_target(dest, &link.location, &link.target)?;
        debug!(link = %link.location.display(), target = %link.target.display(), "symlink");
        #[cfg(unix)]
        std::os::unix::fs::symlink(&link.target, &link.location)?;
        #[cfg(not(unix))]
        return Err(ConsumeError::UnsupportedEntry {
            name: link.location.display().to_string(),
            kind: "symlink".to_string(),
        });
    }

    Ok(())
}

fn write_regular(
    entry: &mut impl Read,
    target: &Path,
    mode: u32,
    overwrite: bool,
) -> Result<(), ConsumeError> {
    let mut open = std::fs::OpenOptions::new();
    open.write(true);
    if overwrite {
        open.create(true).truncate(true);
    } else {
        open.create_new(true);
    }
    let mut file = open.open(target).map_err(|err| {
        if err.kind() == std::io::ErrorKind::AlreadyExists {
            ConsumeError::DestinationExists {
                path: target.to_path_buf(),
            }
        } else {
            ConsumeError::Io(err)
        }
    })?;
    std::io::copy(entry, &mut file)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let stripped = mode & 0o777;
        std::fs::set_permissions(target, std::fs::Permissions::from_mode(stripped))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}

fn zip_error(err: zip::result::ZipError) -> ConsumeError {
    ConsumeError::Archive {
        reason: err.to_string(),
    }
}

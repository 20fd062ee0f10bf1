//! Streaming tar extraction

use crate::sanitize::{check_link_target, join_checked};
use async_trait::async_trait;
use pget_download::{ByteStream, ConsumeError, Consumer};
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::EntryType;
use tokio_util::io::SyncIoBridge;
use tracing::debug;

/// Extracts a tar stream into the destination directory as it downloads.
///
/// Directories and regular files are created as their headers arrive;
/// symlinks and hard links are deferred until every regular file exists,
/// since archives routinely reference files appearing later.
#[derive(Debug, Clone, Default)]
pub struct TarExtractor {
    overwrite: bool,
}

impl TarExtractor {
    /// Create an extractor; `overwrite` replaces existing files
    pub fn new(overwrite: bool) -> Self {
        Self { overwrite }
    }
}

#[async_trait]
impl Consumer for TarExtractor {
    async fn consume(
        &self,
        reader: ByteStream,
        dest: &Path,
        _expected_size: u64,
        _content_type: Option<&str>,
    ) -> Result<(), ConsumeError> {
        let dest = dest.to_path_buf();
        let overwrite = self.overwrite;
        // The tar walker is synchronous; bridge the async stream onto a
        // blocking thread and let backpressure flow through the bridge.
        let bridge = SyncIoBridge::new(reader);
        tokio::task::spawn_blocking(move || extract_tar(bridge, &dest, overwrite))
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
    /// Where the link itself is created
    location: PathBuf,
    /// What it points at, as recorded in the archive
    target: PathBuf,
    hard: bool,
}

fn extract_tar(reader: impl Read, dest: &Path, overwrite: bool) -> Result<(), ConsumeError> {
    std::fs::create_dir_all(dest)?;
    let mut archive = tar::Archive::new(reader);
    let mut links: Vec<PendingLink> = Vec::new();

    for entry in archive.entries().map_err(tar_error)? {
        let mut entry = entry.map_err(tar_error)?;
        let raw_path = entry.path().map_err(tar_error)?.into_owned();
        if raw_path.as_os_str().is_empty() {
            return Err(ConsumeError::EmptyEntryName);
        }
        let target = join_checked(dest, &raw_path)?;
        let kind = entry.header().entry_type();
        let mode = entry.header().mode().unwrap_or(0o644);

        match kind {
            EntryType::Directory => {
                std::fs::create_dir_all(&target)?;
            }
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                write_regular(&mut entry, &target, mode, overwrite)?;
            }
            EntryType::Symlink | EntryType::Link => {
                let link_name = entry
                    .link_name()
                    .map_err(tar_error)?
                    .ok_or(ConsumeError::EmptyEntryName)?
                    .into_owned();
                links.push(PendingLink {
                    location: target,
                    target: link_name,
                    hard: kind == EntryType::Link,
                });
            }
            // Extended header metadata is consumed by the tar walker
            // itself; anything else is refused.
            EntryType::XGlobalHeader | EntryType::XHeader | EntryType::GNULongName
            | EntryType::GNULongLink => {}
            other => {
                return Err(ConsumeError::UnsupportedEntry {
                    name: raw_path.display().to_string(),
                    kind: format!("{other:?}"),
                });
            }
        }
    }

    create_links(dest, links, overwrite)
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
        // Strip setuid/setgid/sticky: archives from untrusted servers do
        // not get to install privileged binaries.
        let stripped = mode & 0o777;
        std::fs::set_permissions(target, std::fs::Permissions::from_mode(stripped))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}

/// Second pass: links are created only after every regular file exists
fn create_links(dest: &Path, links: Vec<PendingLink>, overwrite: bool) -> Result<(), ConsumeError> {
    for link in links {
        if let Some(parent) = link.location.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if overwrite && link.location.symlink_metadata().is_ok() {
            std::fs::remove_file(&link.location)?;
        }
        if link.hard {
            let source = join_checked(dest, &link.target)?;
            debug!(link = %link.location.display(), source = %source.display(), "hard link");
            std::fs::hard_link(&source, &link.location)?;
        } else {
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
    }
    Ok(())
}

fn tar_error(err: std::io::Error) -> ConsumeError {
    ConsumeError::Archive {
        reason: err.to_string(),
    }
}

//! Path containment rules shared by the archive extractors

use pget_download::ConsumeError;
use std::path::{Component, Path, PathBuf};

/// Resolve an archive entry path under `base`, rejecting anything that
/// would land outside it (absolute paths, `..` escapes, drive prefixes).
pub(crate) fn join_checked(base: &Path, entry: &Path) -> Result<PathBuf, ConsumeError> {
    let mut resolved = base.to_path_buf();
    for component in entry.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() || !resolved.starts_with(base) {
                    return Err(escape(entry));
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(escape(entry)),
        }
    }
    if resolved.starts_with(base) {
        Ok(resolved)
    } else {
        Err(escape(entry))
    }
}

/// Check that a link target, resolved relative to the link's location,
/// stays inside `base`. Absolute targets are always rejected.
pub(crate) fn check_link_target(
    base: &Path,
    link_location: &Path,
    target: &Path,
) -> Result<(), ConsumeError> {
    if target.is_absolute() {
        return Err(escape(target));
    }
    let origin = link_location.parent().unwrap_or(base);
    let mut resolved = origin.to_path_buf();
    for component in target.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() || !resolved.starts_with(base) {
                    return Err(escape(target));
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(escape(target)),
        }
    }
    if resolved.starts_with(base) {
        Ok(())
    } else {
        Err(escape(target))
    }
}

fn escape(path: &Path) -> ConsumeError {
    ConsumeError::PathEscapes {
        entry: path.display().to_string(),
    }
}

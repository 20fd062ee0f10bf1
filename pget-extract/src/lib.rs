//! Archive extraction consumers for pget
//!
//! [`TarExtractor`] walks a tar stream as it downloads; [`ZipExtractor`]
//! spools the stream to a temporary file first because the zip central
//! directory lives at the end. Both enforce the same rules: no entry or
//! link target may escape the destination, setuid/setgid/sticky bits are
//! stripped, and unsupported entry kinds are rejected.

#![warn(missing_docs)]

mod sanitize;
mod tar;
mod zip;

pub use tar::TarExtractor;
pub use zip::ZipExtractor;

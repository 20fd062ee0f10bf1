//! Multi-file manifest parsing
//!
//! A manifest is newline-delimited `URL DEST` pairs. Entries are grouped
//! by `scheme://host` so a getter can reason about per-host load.

use crate::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tracing::warn;
use url::Url;

/// One download: where from and where to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Source URL
    pub url: String,
    /// Destination path
    pub dest: PathBuf,
}

/// Parsed manifest, grouped by `scheme://host`
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    groups: BTreeMap<String, Vec<ManifestEntry>>,
    total: usize,
}

impl Manifest {
    /// Parse manifest text.
    ///
    /// Blank lines are ignored. A repeated `(url, dest)` pair is skipped
    /// with a warning; the same destination with a different URL is an
    /// error.
    pub fn parse(text: &str) -> Result<Self> {
        let mut groups: BTreeMap<String, Vec<ManifestEntry>> = BTreeMap::new();
        let mut seen: HashMap<PathBuf, String> = HashMap::new();
        let mut total = 0;

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(url), Some(dest), None) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(Error::InvalidManifestLine {
                    line: idx + 1,
                    content: raw.to_string(),
                });
            };

            let parsed = Url::parse(url).map_err(|_| Error::invalid_url(url))?;
            let host = parsed
                .host_str()
                .ok_or_else(|| Error::invalid_url(url))?;
            let dest = PathBuf::from(dest);

            match seen.get(&dest) {
                Some(previous) if previous == url => {
                    warn!(url, dest = %dest.display(), "skipping duplicate manifest entry");
                    continue;
                }
                Some(previous) => {
                    return Err(Error::DuplicateDestination {
                        dest,
                        url: url.to_string(),
                        previous: previous.clone(),
                    });
                }
                None => {
                    seen.insert(dest.clone(), url.to_string());
                }
            }

            let group = format!("{}://{}", parsed.scheme(), host);
            groups.entry(group).or_default().push(ManifestEntry {
                url: url.to_string(),
                dest,
            });
            total += 1;
        }

        Ok(Self { groups, total })
    }

    /// Entries grouped by `scheme://host`
    pub fn groups(&self) -> &BTreeMap<String, Vec<ManifestEntry>> {
        &self.groups
    }

    /// All entries in group order
    pub fn entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.groups.values().flatten()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.total
    }

    /// Whether the manifest holds no entries
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

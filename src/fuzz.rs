//! Fuzz hook: forcing select branches during a recording run
//!
//! A preference file maps select-statement call sites to an ordered list of
//! branch indices. When the instrumented program reaches a multi-way channel
//! choice with more than one ready branch, the hook forces the first
//! preferred branch whose backing channel is actually ready instead of
//! leaving the pick to the runtime. Successive recording runs, indexed
//! 0, 1, 2, …, are steered through different interleavings this way without
//! touching the program's source.

use crate::error::FuzzError;
use crate::types::SourceLocation;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

/// Branch preference table for one recording run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FuzzPreferences {
    table: HashMap<SourceLocation, Vec<usize>>,
}

impl FuzzPreferences {
    /// Create an empty table (no overrides; the runtime picks freely)
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load a preference file
    ///
    /// A missing file is not an error: recording proceeds with no override.
    /// A present but malformed file is, because it means the fuzz campaign
    /// driver and the recorder disagree about the format.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FuzzError> {
        let path = path.as_ref();
        let body = match fs::read_to_string(path) {
            Ok(body) => body,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no fuzz preference file; recording unmodified");
                return Ok(Self::empty());
            }
            Err(source) => {
                return Err(FuzzError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        Self::parse(&body)
    }

    /// Parse the `file:line;idx,idx,...` preference format
    pub fn parse(body: &str) -> Result<Self, FuzzError> {
        let mut table = HashMap::new();
        for line in body.lines() {
            if line.is_empty() {
                continue;
            }
            let (location, indices) =
                line.split_once(';')
                    .ok_or_else(|| FuzzError::MalformedPreference {
                        line: line.to_string(),
                        reason: "missing ';' separator".to_string(),
                    })?;
            let location: SourceLocation =
                location.parse().map_err(|_| FuzzError::MalformedPreference {
                    line: line.to_string(),
                    reason: "bad source location".to_string(),
                })?;
            let indices: Vec<usize> = indices
                .split(',')
                .map(|token| {
                    token.parse().map_err(|_| FuzzError::MalformedPreference {
                        line: line.to_string(),
                        reason: format!("bad branch index '{}'", token),
                    })
                })
                .collect::<Result<_, _>>()?;
            if indices.is_empty() {
                return Err(FuzzError::MalformedPreference {
                    line: line.to_string(),
                    reason: "no branch indices".to_string(),
                });
            }
            table.insert(location, indices);
        }
        Ok(Self { table })
    }

    /// The preferred branch order for a select site, if overridden
    pub fn preferred(&self, location: &SourceLocation) -> Option<&[usize]> {
        self.table.get(location).map(Vec::as_slice)
    }

    /// Pick the branch to force at a select site
    ///
    /// Returns the first preferred index whose backing channel is ready.
    /// Returns `None` when the site has no override, or none of its
    /// preferred branches is ready; the runtime then chooses as usual.
    pub fn choose(&self, location: &SourceLocation, ready: &[bool]) -> Option<usize> {
        self.preferred(location)?
            .iter()
            .copied()
            .find(|&index| ready.get(index).copied().unwrap_or(false))
    }

    /// Add or replace an override
    pub fn insert(&mut self, location: SourceLocation, indices: Vec<usize>) {
        self.table.insert(location, indices);
    }

    /// Number of overridden select sites
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether the table has no overrides
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Write the table in the preference file format
    ///
    /// Entries are sorted so the same table always produces the same file.
    pub fn store(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let mut entries: Vec<(&SourceLocation, &Vec<usize>)> = self.table.iter().collect();
        entries.sort_by_key(|(location, _)| (location.file.clone(), location.line));

        let mut body = String::new();
        for (location, indices) in entries {
            let joined = indices
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(",");
            body.push_str(&format!("{};{}\n", location, joined));
        }
        fs::write(path, body)
    }

    /// Derive a preference table for recording run `run_index`
    ///
    /// Each select site (given with its case count) gets a permutation of
    /// its branch indices drawn from a ChaCha8 generator seeded with the
    /// run index, so run N always explores the same interleaving and
    /// different runs explore different ones.
    pub fn generate(run_index: u64, selects: &[(SourceLocation, usize)]) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(run_index);
        let mut table = HashMap::new();
        for (location, cases) in selects {
            let mut indices: Vec<usize> = (0..*cases).collect();
            indices.shuffle(&mut rng);
            table.insert(location.clone(), indices);
        }
        Self { table }
    }
}

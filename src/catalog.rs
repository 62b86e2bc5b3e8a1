//! Snapshot catalog parsed from a `btrfs subvolume list -uqt` listing.
//!
//! The listing is a whitespace-separated table with a header and a separator
//! line, followed by one row per subvolume:
//!
//! ```text
//! ID      gen     top level       parent_uuid     uuid    path
//! --      ---     ---------       -----------     ----    ----
//! 256     1042    5               -               3f1c... home
//! 301     1040    5               3f1c...         9a02... home_2014-08-25T10:00:00
//! ```

use std::collections::HashSet;
use std::fmt;

use uuid::Uuid;

use crate::error::{Error, Result};

/// Number of columns in a listing row.
const FIELD_COUNT: usize = 6;

/// Placeholder the listing tool prints for a subvolume without a parent.
const NO_PARENT: &str = "-";

/// One subvolume or snapshot row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub id: u64,
    pub generation: u64,
    pub top_level: u64,
    pub parent_uuid: Option<Uuid>,
    pub uuid: Uuid,
    pub path: String,
}

impl SnapshotRecord {
    /// Parse a single listing row into a record.
    pub fn parse_line(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split([' ', '\t']).filter(|f| !f.is_empty()).collect();
        if fields.len() != FIELD_COUNT {
            return Err(Error::parse(
                line,
                format!("expected {} fields, got {}", FIELD_COUNT, fields.len()),
            ));
        }

        let number = |idx: usize, name: &str| -> Result<u64> {
            fields[idx]
                .parse()
                .map_err(|_| Error::parse(line, format!("invalid {}: {}", name, fields[idx])))
        };
        let uuid = |idx: usize, name: &str| -> Result<Uuid> {
            Uuid::parse_str(fields[idx])
                .map_err(|e| Error::parse(line, format!("invalid {}: {}", name, e)))
        };

        let parent_uuid = if fields[3] == NO_PARENT {
            None
        } else {
            Some(uuid(3, "parent_uuid")?)
        };

        Ok(Self {
            id: number(0, "id")?,
            generation: number(1, "generation")?,
            top_level: number(2, "top_level")?,
            parent_uuid,
            uuid: uuid(4, "uuid")?,
            path: fields[5].to_string(),
        })
    }
}

impl fmt::Display for SnapshotRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parent = match &self.parent_uuid {
            Some(p) => p.hyphenated().to_string(),
            None => NO_PARENT.to_string(),
        };
        write!(
            f,
            "{}\t{}\t{}\t{}\t{}\t{}",
            self.id, self.generation, self.top_level, parent, self.uuid, self.path
        )
    }
}

/// Read-only collection of snapshot records in listing order.
#[derive(Debug, Clone, Default)]
pub struct SnapshotCatalog {
    records: Vec<SnapshotRecord>,
}

impl SnapshotCatalog {
    /// Build a catalog from data rows only (no header).
    pub fn from_lines<I, S>(lines: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut records = Vec::new();
        for line in lines {
            let line = line.as_ref().trim();
            if line.is_empty() {
                continue;
            }
            records.push(SnapshotRecord::parse_line(line)?);
        }
        Ok(Self { records })
    }

    /// Build a catalog from raw listing output. The first two lines are the
    /// header and separator and are always skipped.
    pub fn load_from(listing: &str) -> Result<Self> {
        Self::from_lines(listing.lines().skip(2))
    }

    pub fn records(&self) -> &[SnapshotRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// First record whose path equals `path`.
    pub fn find_by_path(&self, path: &str) -> Option<&SnapshotRecord> {
        self.records.iter().find(|r| r.path == path)
    }

    /// Snapshots taken of the subvolume at `path`, i.e. every record whose
    /// parent UUID is that subvolume's UUID. An empty result means no snapshot
    /// of it has been recorded yet.
    pub fn find_snapshots_of_path(&self, path: &str) -> Result<Vec<&SnapshotRecord>> {
        let subvol = self
            .find_by_path(path)
            .ok_or_else(|| Error::path_not_found(path))?;

        Ok(self
            .records
            .iter()
            .filter(|r| r.parent_uuid == Some(subvol.uuid))
            .collect())
    }

    /// The candidate with the highest generation. Equal generations are
    /// broken by the larger UUID so the choice is stable across listing order.
    pub fn find_latest(&self, candidates: &HashSet<Uuid>) -> Option<&SnapshotRecord> {
        self.records
            .iter()
            .filter(|r| candidates.contains(&r.uuid))
            .max_by_key(|r| (r.generation, r.uuid))
    }
}

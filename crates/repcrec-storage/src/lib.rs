//! Durable committed state for one site.
//!
//! Layout: each site owns a directory `site_<id>/` under the database data
//! path; each hosted variable is one file `x<i>` holding its latest committed
//! value as decimal text. Installs go through a write-temp-then-rename
//! sequence so each variable's file is replaced atomically. A leftover
//! `x<i>.tmp` on open means the rename never happened and the base file is
//! still authoritative, so the temp is discarded.
//!
//! The full value set is mirrored in memory; reads never touch disk after
//! open.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use repcrec_error::{RepcrecError, Result};
use repcrec_types::{SiteId, VariableId};

/// Durable key/value store backing one site.
#[derive(Debug)]
pub struct SiteStore {
    site: SiteId,
    dir: PathBuf,
    values: BTreeMap<VariableId, i64>,
}

impl SiteStore {
    /// Open (or create) the store for `site` under `data_path`.
    ///
    /// Variables in `defaults` that have no file yet are initialized to their
    /// default value; existing files win over defaults, so reopening a
    /// directory recovers the last committed state.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory or a value file cannot be
    /// created or read, and [`RepcrecError::CorruptValue`] if a value file
    /// holds anything but a decimal integer.
    pub fn open(data_path: &Path, site: SiteId, defaults: &BTreeMap<VariableId, i64>) -> Result<Self> {
        let dir = data_path.join(format!("site_{site}"));
        fs::create_dir_all(&dir)?;

        let mut values = BTreeMap::new();
        for (&variable, &default) in defaults {
            let path = value_path(&dir, variable);
            let tmp = tmp_path(&dir, variable);
            if tmp.exists() {
                // Interrupted install; the base file is still authoritative.
                warn!(site = %site, %variable, "discarding leftover temp file");
                fs::remove_file(&tmp)?;
            }

            let value = if path.exists() {
                parse_value_file(&path)?
            } else {
                write_value_file(&path, default)?;
                default
            };
            values.insert(variable, value);
        }

        debug!(site = %site, variables = values.len(), "site store opened");
        Ok(Self { site, dir, values })
    }

    /// The site this store belongs to.
    #[must_use]
    pub fn site(&self) -> SiteId {
        self.site
    }

    /// Whether this store hosts `variable`.
    #[must_use]
    pub fn hosts(&self, variable: VariableId) -> bool {
        self.values.contains_key(&variable)
    }

    /// The committed value of `variable`, or `None` if not hosted here.
    #[must_use]
    pub fn read(&self, variable: VariableId) -> Option<i64> {
        self.values.get(&variable).copied()
    }

    /// All committed values in variable order.
    #[must_use]
    pub fn values(&self) -> &BTreeMap<VariableId, i64> {
        &self.values
    }

    /// Install a batch of committed writes, one atomic file replace per
    /// variable.
    ///
    /// # Errors
    ///
    /// Returns an I/O error on write failure. The in-memory mirror is updated
    /// per variable only after its file replace succeeds.
    ///
    /// # Panics
    ///
    /// Installing a variable this store does not host is a programmer error.
    pub fn install(&mut self, writes: &[(VariableId, i64)]) -> Result<()> {
        for &(variable, value) in writes {
            assert!(
                self.values.contains_key(&variable),
                "install of {variable} at site {} which does not host it",
                self.site
            );

            let path = value_path(&self.dir, variable);
            let tmp = tmp_path(&self.dir, variable);
            write_value_file(&tmp, value)?;
            fs::rename(&tmp, &path)?;
            self.values.insert(variable, value);
            debug!(site = %self.site, %variable, value, "installed committed value");
        }
        Ok(())
    }
}

fn value_path(dir: &Path, variable: VariableId) -> PathBuf {
    dir.join(variable.to_string())
}

fn tmp_path(dir: &Path, variable: VariableId) -> PathBuf {
    dir.join(format!("{variable}.tmp"))
}

fn write_value_file(path: &Path, value: i64) -> Result<i64> {
    let mut file = fs::File::create(path)?;
    writeln!(file, "{value}")?;
    file.sync_all()?;
    Ok(value)
}

fn parse_value_file(path: &Path) -> Result<i64> {
    let text = fs::read_to_string(path)?;
    text.trim()
        .parse::<i64>()
        .map_err(|err| RepcrecError::CorruptValue {
            path: path.to_path_buf(),
            detail: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(n: u32) -> SiteId {
        SiteId::new(n).unwrap()
    }

    fn var(n: u32) -> VariableId {
        VariableId::new(n).unwrap()
    }

    fn defaults(indices: &[u32]) -> BTreeMap<VariableId, i64> {
        indices
            .iter()
            .map(|&i| (var(i), var(i).default_value()))
            .collect()
    }

    #[test]
    fn open_installs_defaults() {
        let root = tempfile::tempdir().unwrap();
        let store = SiteStore::open(root.path(), site(1), &defaults(&[2, 4, 11])).unwrap();

        assert_eq!(store.read(var(2)), Some(20));
        assert_eq!(store.read(var(11)), Some(110));
        assert_eq!(store.read(var(3)), None);
        assert!(root.path().join("site_1").join("x4").exists());
    }

    #[test]
    fn install_persists_across_reopen() {
        let root = tempfile::tempdir().unwrap();
        let d = defaults(&[2, 4]);
        {
            let mut store = SiteStore::open(root.path(), site(3), &d).unwrap();
            store.install(&[(var(2), 77), (var(4), -5)]).unwrap();
        }
        let store = SiteStore::open(root.path(), site(3), &d).unwrap();
        assert_eq!(store.read(var(2)), Some(77));
        assert_eq!(store.read(var(4)), Some(-5));
    }

    #[test]
    fn leftover_temp_file_is_discarded() {
        let root = tempfile::tempdir().unwrap();
        let d = defaults(&[6]);
        {
            let mut store = SiteStore::open(root.path(), site(2), &d).unwrap();
            store.install(&[(var(6), 99)]).unwrap();
        }
        // Simulate a crash between temp write and rename.
        fs::write(root.path().join("site_2").join("x6.tmp"), "12345\n").unwrap();

        let store = SiteStore::open(root.path(), site(2), &d).unwrap();
        assert_eq!(store.read(var(6)), Some(99));
        assert!(!root.path().join("site_2").join("x6.tmp").exists());
    }

    #[test]
    fn corrupt_value_file_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let d = defaults(&[8]);
        SiteStore::open(root.path(), site(4), &d).unwrap();
        fs::write(root.path().join("site_4").join("x8"), "not a number\n").unwrap();

        let err = SiteStore::open(root.path(), site(4), &d).unwrap_err();
        assert!(matches!(err, RepcrecError::CorruptValue { .. }));
    }

    #[test]
    #[should_panic(expected = "does not host")]
    fn install_of_unhosted_variable_panics() {
        let root = tempfile::tempdir().unwrap();
        let mut store = SiteStore::open(root.path(), site(1), &defaults(&[2])).unwrap();
        let _ = store.install(&[(var(3), 1)]);
    }
}

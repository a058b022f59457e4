//! Snapshot persistence and the cache-consistency protocol
//!
//! Each flavor's product table serializes independently to
//! `<flavor>.<ext>`, where the extension embeds the persistence format
//! version so incompatible formats never collide on disk. Writes are guarded
//! by an advisory lock and an optimistic mtime check made under that lock:
//! if the file on disk is newer than the mtime we recorded when we last read
//! or wrote it, another process updated it and the save for that flavor is
//! skipped. User-scoped
//! tag assignments persist to separate `<flavor>_<tag>.<ext>` overlay files
//! so per-user state never touches the shared snapshot.

use crate::db::Database;
use crate::error::{UpstackError, UpstackResult};
use crate::family::ProductFamily;
use crate::lock::{current_user, FileLock};
use crate::stack::ProductStack;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Version of the snapshot format written by this implementation
pub const PERSIST_VERSION: &str = "1.0.0";

/// File extension for per-flavor product snapshots
pub fn persist_file_ext() -> String {
    format!("cacheDB{}", PERSIST_VERSION.replace('.', "_"))
}

/// File extension for per-(flavor, tag) user tag overlays
pub fn user_tag_file_ext() -> String {
    format!("cacheTag{}", PERSIST_VERSION.replace('.', "_"))
}

/// Snapshot file name for a flavor
pub fn persist_filename(flavor: &str) -> String {
    format!("{flavor}.{}", persist_file_ext())
}

/// Overlay file name for a (flavor, tag) pair
pub fn user_tag_filename(flavor: &str, tag: &str) -> String {
    format!("{flavor}_{tag}.{}", user_tag_file_ext())
}

/// Flavors with a snapshot file in a directory, recognized by the exact
/// `<flavor>.<ext>` pattern: the flavor must start with a word character and
/// contain no whitespace
pub fn find_cached_flavors(dir: &Path) -> UpstackResult<Vec<String>> {
    let suffix = format!(".{}", persist_file_ext());
    let entries = fs::read_dir(dir)
        .map_err(|e| UpstackError::io(format!("reading cache directory {}", dir.display()), e))?;

    let mut flavors = vec![];
    for entry in entries {
        let entry = entry.map_err(|e| UpstackError::io("reading cache entry", e))?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        let Some(flavor) = name.strip_suffix(&suffix) else {
            continue;
        };
        if is_flavor_name(flavor) {
            flavors.push(flavor.to_string());
        }
    }
    flavors.sort();
    Ok(flavors)
}

fn is_flavor_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_alphanumeric() || c == '_' => {}
        _ => return false,
    }
    !s.chars().any(char::is_whitespace)
}

impl ProductStack {
    /// Snapshot directory: explicit override, else the configured persist
    /// directory, else the database directory
    fn resolve_persist_dir(&self, dir: Option<&Path>) -> PathBuf {
        dir.map(Path::to_path_buf)
            .or_else(|| self.config().persist_dir.clone())
            .unwrap_or_else(|| self.config().db_path.clone())
    }

    /// Path a flavor's snapshot persists to
    pub fn persist_path(&self, flavor: &str, dir: Option<&Path>) -> PathBuf {
        self.resolve_persist_dir(dir).join(persist_filename(flavor))
    }

    /// Persist the given flavors (default: every dirty flavor). Flavors
    /// whose snapshot file changed on disk since we last read or wrote it
    /// are skipped and reported together in a `CacheOutOfSync` error after
    /// all requested flavors have been attempted; the others stay saved.
    pub fn save(&mut self, flavors: Option<&[String]>, dir: Option<&Path>) -> UpstackResult<()> {
        let targets: Vec<String> = match flavors {
            Some(flavors) => flavors.to_vec(),
            None => {
                if self.dirty.is_empty() {
                    return Ok(());
                }
                // dirty flavors may not be in the lookup yet (a requested
                // flavor with no products); they still persist, as empty
                self.dirty.iter().cloned().collect()
            }
        };

        let mut out_of_sync = vec![];
        for flavor in &targets {
            let path = self.persist_path(flavor, dir);
            // the staleness check and the write share one lock acquisition;
            // a writer that finishes while we wait on the lock must be seen
            let _lock = FileLock::acquire(&path, &current_user(), self.config().lock_timeout)?;
            if self.is_out_of_sync(&path) {
                warn!("Snapshot {} changed on disk, skipping save", path.display());
                out_of_sync.push(path);
                continue;
            }

            self.write_snapshot(flavor, &path)?;
            // saving to an override directory does not settle the flavor's
            // dirty state against its configured location
            if dir.is_none() {
                self.clear_dirty(flavor);
            }
        }

        if !out_of_sync.is_empty() {
            return Err(UpstackError::CacheOutOfSync { files: out_of_sync });
        }
        Ok(())
    }

    fn is_out_of_sync(&self, path: &Path) -> bool {
        let Some(recorded) = self.recorded_modtime(path) else {
            return false;
        };
        match fs::metadata(path).and_then(|m| m.modified()) {
            Ok(on_disk) => on_disk > recorded,
            // a vanished file is not newer than what we loaded
            Err(_) => false,
        }
    }

    /// Serialize one flavor's product table to a file, unconditionally. An
    /// unknown flavor is registered empty first, so empty flavors cache like
    /// any other.
    pub fn persist(&mut self, flavor: &str, path: &Path) -> UpstackResult<()> {
        let _lock = FileLock::acquire(path, &current_user(), self.config().lock_timeout)?;
        self.write_snapshot(flavor, path)
    }

    /// Write one flavor's snapshot; the caller holds the file lock
    fn write_snapshot(&mut self, flavor: &str, path: &Path) -> UpstackResult<()> {
        let snapshot: BTreeMap<String, ProductFamily> = self
            .families_entry(flavor)
            .iter()
            .map(|(name, family)| (name.clone(), family.global_snapshot()))
            .collect();

        let content = serde_json::to_string_pretty(&snapshot)?;
        fs::write(path, content)
            .map_err(|e| UpstackError::io(format!("writing snapshot {}", path.display()), e))?;

        let mtime = fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(|e| UpstackError::io(format!("stat {}", path.display()), e))?;
        self.record_modtime(path.to_path_buf(), mtime);

        debug!("Persisted {flavor} to {}", path.display());
        Ok(())
    }

    /// Replace in-memory product data with the snapshots on disk. With no
    /// explicit flavors, every flavor with a snapshot file in the directory
    /// is loaded. Each flavor's family mapping is replaced wholesale.
    pub fn reload(&mut self, flavors: Option<&[String]>, dir: Option<&Path>) -> UpstackResult<()> {
        let dir = self.resolve_persist_dir(dir);
        if !dir.is_dir() {
            return Err(UpstackError::CacheDirNotFound(dir));
        }

        let targets: Vec<String> = match flavors {
            Some(flavors) => flavors.to_vec(),
            None => find_cached_flavors(&dir)?,
        };

        for flavor in &targets {
            let path = dir.join(persist_filename(flavor));

            let content = {
                let _lock =
                    FileLock::acquire(&path, &current_user(), self.config().lock_timeout)?;
                let mtime = fs::metadata(&path)
                    .and_then(|m| m.modified())
                    .map_err(|e| UpstackError::io(format!("stat {}", path.display()), e))?;
                self.record_modtime(path.clone(), mtime);
                fs::read_to_string(&path).map_err(|e| {
                    UpstackError::io(format!("reading snapshot {}", path.display()), e)
                })?
            };

            let families: BTreeMap<String, ProductFamily> = serde_json::from_str(&content)?;
            self.replace_families(flavor, families);
            debug!("Reloaded {flavor} from {}", path.display());
        }
        Ok(())
    }

    /// Whether a flavor's snapshot exists and is at least as new as the last
    /// database change.
    ///
    /// The database freshness signal is database-wide: a change to any
    /// flavor's declarations makes every flavor's snapshot test stale. Kept
    /// as inherited behavior; per-flavor tracking would need the database to
    /// attribute changes to flavors.
    pub fn cache_is_up_to_date(&self, flavor: &str) -> UpstackResult<bool> {
        let path = self.persist_path(flavor, None);
        if !path.exists() {
            return Ok(false);
        }

        let mtime = fs::metadata(&path)
            .and_then(|m| m.modified())
            .map_err(|e| UpstackError::io(format!("stat {}", path.display()), e))?;
        let db = Database::open(&self.config().db_path)?;
        Ok(!db.is_newer_than(mtime)?)
    }

    /// Remove snapshot files for the given flavors (default: every known
    /// flavor). Missing files are ignored.
    pub fn clear_cache(
        &mut self,
        flavors: Option<&[String]>,
        dir: Option<&Path>,
    ) -> UpstackResult<()> {
        let targets: Vec<String> = match flavors {
            Some(flavors) => flavors.to_vec(),
            None => self.flavors(),
        };

        for flavor in &targets {
            let path = self.persist_path(flavor, dir);
            if path.exists() {
                fs::remove_file(&path).map_err(|e| {
                    UpstackError::io(format!("removing snapshot {}", path.display()), e)
                })?;
                info!("Cleared cache for {flavor}");
            }
        }
        Ok(())
    }

    /// Persist the overlay files for one user tag across the given flavors.
    /// Skipped entirely when no user tag directory is configured.
    pub(crate) fn save_user_tag(&mut self, tag: &str, flavors: &[String]) -> UpstackResult<()> {
        let Some(dir) = self.config().user_tag_dir.clone() else {
            return Ok(());
        };

        for flavor in flavors {
            let Some(assignments) = self.user_tag_map(flavor, tag) else {
                continue;
            };
            let path = dir.join(user_tag_filename(flavor, tag));
            let _lock = FileLock::acquire(&path, &current_user(), self.config().lock_timeout)?;
            let content = serde_json::to_string_pretty(assignments)?;
            fs::write(&path, content).map_err(|e| {
                UpstackError::io(format!("writing user tag file {}", path.display()), e)
            })?;
            debug!("Persisted user tag {tag} for {flavor}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StackConfig;
    use crate::product::Product;
    use std::fs::{FileTimes, OpenOptions};
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn stack_in(dir: &TempDir, autosave: bool) -> ProductStack {
        ProductStack::new(StackConfig::new(dir.path()).autosave(autosave)).unwrap()
    }

    #[test]
    fn file_naming_embeds_format_version() {
        assert_eq!(persist_file_ext(), "cacheDB1_0_0");
        assert_eq!(persist_filename("Linux64"), "Linux64.cacheDB1_0_0");
        assert_eq!(
            user_tag_filename("Linux64", "user.beta"),
            "Linux64_user.beta.cacheTag1_0_0"
        );
    }

    #[test]
    fn find_cached_flavors_matches_exact_pattern() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("Linux64.cacheDB1_0_0"), "{}").unwrap();
        fs::write(dir.path().join("Darwin64.cacheDB1_0_0"), "{}").unwrap();
        // wrong format version, not a word start, stray whitespace: all skipped
        fs::write(dir.path().join("Old.cacheDB0_9_0"), "{}").unwrap();
        fs::write(dir.path().join(".hidden.cacheDB1_0_0"), "{}").unwrap();
        fs::write(dir.path().join("bad flavor.cacheDB1_0_0"), "{}").unwrap();

        assert_eq!(
            find_cached_flavors(dir.path()).unwrap(),
            vec!["Darwin64", "Linux64"]
        );
    }

    #[test]
    fn save_then_reload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut stack = stack_in(&dir, false);
        stack.add_product(Product::new("astro", "1.0", "Linux64")).unwrap();
        stack.add_product(Product::new("astro", "1.1", "Linux64")).unwrap();
        stack.assign_tag("current", "astro", "1.1", None).unwrap();
        stack.save(None, None).unwrap();
        assert!(!stack.save_needed(None));

        let mut fresh = stack_in(&dir, false);
        fresh.reload(None, None).unwrap();
        assert_eq!(fresh.flavors(), vec!["Linux64"]);
        assert_eq!(fresh.versions("astro", Some("Linux64")), vec!["1.0", "1.1"]);
        assert_eq!(
            fresh
                .tagged_product("astro", "Linux64", "current")
                .unwrap()
                .version,
            "1.1"
        );
    }

    #[test]
    fn save_default_skips_clean_stack() {
        let dir = TempDir::new().unwrap();
        let mut stack = stack_in(&dir, false);
        stack.save(None, None).unwrap();
        assert!(find_cached_flavors(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn empty_flavor_caches_like_any_other() {
        let dir = TempDir::new().unwrap();
        let mut stack = stack_in(&dir, false);
        stack.add_flavor("Generic");
        stack.save(Some(&["Generic".to_string()]), None).unwrap();

        let mut fresh = stack_in(&dir, false);
        fresh.reload(None, None).unwrap();
        assert_eq!(fresh.flavors(), vec!["Generic"]);
        assert!(fresh.product_names(Some("Generic")).is_empty());
    }

    #[test]
    fn externally_touched_snapshot_aborts_save() {
        let dir = TempDir::new().unwrap();
        let mut stack = stack_in(&dir, false);
        stack.add_product(Product::new("astro", "1.0", "Linux64")).unwrap();
        stack.save(None, None).unwrap();

        // simulate another process updating the file after our write
        let path = stack.persist_path("Linux64", None);
        let before = fs::read_to_string(&path).unwrap();
        let file = OpenOptions::new().append(true).open(&path).unwrap();
        file.set_times(
            FileTimes::new().set_modified(SystemTime::now() + Duration::from_secs(10)),
        )
        .unwrap();

        stack.add_product(Product::new("astro", "1.1", "Linux64")).unwrap();
        let err = stack.save(None, None).unwrap_err();
        match err {
            UpstackError::CacheOutOfSync { files } => assert_eq!(files, vec![path.clone()]),
            other => panic!("expected CacheOutOfSync, got {other}"),
        }
        // the on-disk content was not overwritten
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn out_of_sync_save_is_partial() {
        let dir = TempDir::new().unwrap();
        let mut stack = stack_in(&dir, false);
        stack.add_product(Product::new("astro", "1.0", "Linux64")).unwrap();
        stack.add_product(Product::new("astro", "1.0", "Darwin64")).unwrap();
        stack.save(None, None).unwrap();

        let linux_path = stack.persist_path("Linux64", None);
        let file = OpenOptions::new().append(true).open(&linux_path).unwrap();
        file.set_times(
            FileTimes::new().set_modified(SystemTime::now() + Duration::from_secs(10)),
        )
        .unwrap();

        stack.add_product(Product::new("astro", "1.1", "Linux64")).unwrap();
        stack.add_product(Product::new("astro", "1.1", "Darwin64")).unwrap();
        assert!(stack.save(None, None).is_err());

        // the untouched flavor saved and settled; the stale one stays dirty
        assert!(!stack.save_needed(Some(&["Darwin64".to_string()])));
        assert!(stack.save_needed(Some(&["Linux64".to_string()])));

        let mut fresh = stack_in(&dir, false);
        fresh.reload(Some(&["Darwin64".to_string()]), None).unwrap();
        assert_eq!(fresh.versions("astro", Some("Darwin64")), vec!["1.0", "1.1"]);
    }

    #[test]
    fn update_landing_during_lock_wait_is_not_overwritten() {
        let dir = TempDir::new().unwrap();
        let mut stack = stack_in(&dir, false);
        stack.add_product(Product::new("astro", "1.0", "Linux64")).unwrap();
        stack.save(None, None).unwrap();

        // another writer holds the lock and finishes its update while the
        // save below is already waiting on that lock
        let path = stack.persist_path("Linux64", None);
        let their_path = path.clone();
        let writer = std::thread::spawn(move || {
            let _lock = FileLock::acquire(&their_path, "other", Duration::from_secs(1)).unwrap();
            std::thread::sleep(Duration::from_millis(100));
            fs::write(&their_path, "{}").unwrap();
            let file = OpenOptions::new().append(true).open(&their_path).unwrap();
            file.set_times(
                FileTimes::new().set_modified(SystemTime::now() + Duration::from_secs(10)),
            )
            .unwrap();
        });
        std::thread::sleep(Duration::from_millis(20));

        stack.add_product(Product::new("astro", "1.1", "Linux64")).unwrap();
        let err = stack.save(None, None).unwrap_err();
        writer.join().unwrap();

        assert!(matches!(err, UpstackError::CacheOutOfSync { .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
        assert!(stack.save_needed(Some(&["Linux64".to_string()])));
    }

    #[test]
    fn save_to_override_dir_keeps_flavor_dirty() {
        let dir = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let mut stack = stack_in(&dir, false);
        stack.add_product(Product::new("astro", "1.0", "Linux64")).unwrap();

        stack
            .save(Some(&["Linux64".to_string()]), Some(other.path()))
            .unwrap();
        assert!(other.path().join("Linux64.cacheDB1_0_0").exists());
        assert!(stack.save_needed(Some(&["Linux64".to_string()])));
    }

    #[test]
    fn user_tags_never_reach_the_global_snapshot() {
        let dir = TempDir::new().unwrap();
        let tag_dir = TempDir::new().unwrap();
        let mut stack = ProductStack::new(
            StackConfig::new(dir.path())
                .user_tag_dir(tag_dir.path())
                .autosave(true),
        )
        .unwrap();

        stack.add_product(Product::new("astro", "1.0", "Linux64")).unwrap();
        stack.assign_tag("beta", "astro", "1.0", None).unwrap();
        stack.assign_tag("user.beta", "astro", "1.0", None).unwrap();

        let snapshot =
            fs::read_to_string(stack.persist_path("Linux64", None)).unwrap();
        assert!(snapshot.contains("\"beta\""));
        assert!(!snapshot.contains("user.beta"));

        let overlay = fs::read_to_string(
            tag_dir.path().join(user_tag_filename("Linux64", "user.beta")),
        )
        .unwrap();
        let parsed: BTreeMap<String, String> = serde_json::from_str(&overlay).unwrap();
        assert_eq!(parsed.get("astro").map(String::as_str), Some("1.0"));
        assert!(!overlay.contains("\"beta\":"));
    }

    #[test]
    fn unassign_user_tag_rewrites_overlay() {
        let dir = TempDir::new().unwrap();
        let tag_dir = TempDir::new().unwrap();
        let mut stack = ProductStack::new(
            StackConfig::new(dir.path())
                .user_tag_dir(tag_dir.path())
                .autosave(true),
        )
        .unwrap();

        stack.add_product(Product::new("astro", "1.0", "Linux64")).unwrap();
        stack.assign_tag("user.beta", "astro", "1.0", None).unwrap();
        assert!(stack.unassign_tag("user.beta", "astro", None).unwrap());

        let overlay = fs::read_to_string(
            tag_dir.path().join(user_tag_filename("Linux64", "user.beta")),
        )
        .unwrap();
        let parsed: BTreeMap<String, String> = serde_json::from_str(&overlay).unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn cache_freshness_tracks_database_changes() {
        let dir = TempDir::new().unwrap();
        let db = crate::db::Database::open(dir.path()).unwrap();
        db.declare(&Product::new("astro", "1.0", "Linux64")).unwrap();

        let mut stack = stack_in(&dir, false);
        assert!(!stack.cache_is_up_to_date("Linux64").unwrap());

        stack.refresh_from_database().unwrap();
        stack.save(None, None).unwrap();
        assert!(stack.cache_is_up_to_date("Linux64").unwrap());

        // any database change stales the snapshot, for every flavor
        std::thread::sleep(Duration::from_millis(20));
        db.declare(&Product::new("astro", "1.1", "Darwin64")).unwrap();
        assert!(!stack.cache_is_up_to_date("Linux64").unwrap());
    }

    #[test]
    fn from_cache_falls_back_then_finds_fresh() {
        let dir = TempDir::new().unwrap();
        let db = crate::db::Database::open(dir.path()).unwrap();
        db.declare(&Product::new("astro", "1.0", "Linux64")).unwrap();

        let flavors = vec!["Linux64".to_string()];

        // no cache file: falls back to the database and writes one
        let stack = ProductStack::from_cache(
            StackConfig::new(dir.path()).autosave(false),
            &flavors,
            true,
        )
        .unwrap();
        assert_eq!(stack.versions("astro", Some("Linux64")), vec!["1.0"]);
        let snapshot_path = stack.persist_path("Linux64", None);
        assert!(snapshot_path.exists());
        let first_mtime = fs::metadata(&snapshot_path).unwrap().modified().unwrap();

        // second load finds the cache fresh and does not rebuild
        let again = ProductStack::from_cache(
            StackConfig::new(dir.path()).autosave(false),
            &flavors,
            true,
        )
        .unwrap();
        assert_eq!(again.versions("astro", Some("Linux64")), vec!["1.0"]);
        assert!(!again.save_needed(None));
        let second_mtime = fs::metadata(&snapshot_path).unwrap().modified().unwrap();
        assert_eq!(first_mtime, second_mtime);
    }

    #[test]
    fn from_cache_requires_flavors() {
        let dir = TempDir::new().unwrap();
        let err = ProductStack::from_cache(
            StackConfig::new(dir.path()).autosave(false),
            &[],
            true,
        )
        .unwrap_err();
        assert!(matches!(err, UpstackError::NoFlavorsRequested));
    }

    #[test]
    fn clear_cache_removes_snapshots() {
        let dir = TempDir::new().unwrap();
        let mut stack = stack_in(&dir, false);
        stack.add_product(Product::new("astro", "1.0", "Linux64")).unwrap();
        stack.save(None, None).unwrap();
        assert!(stack.persist_path("Linux64", None).exists());

        stack.clear_cache(None, None).unwrap();
        assert!(!stack.persist_path("Linux64", None).exists());
        // clearing again is harmless
        stack.clear_cache(None, None).unwrap();
    }
}

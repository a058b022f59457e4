//! The product stack: an in-memory index of every flavor, product, version,
//! and tag assignment known for one product database
//!
//! The stack is populated either by a full scan of the authoritative
//! database (`refresh_from_database`) or from per-flavor snapshot files
//! (`reload`), and is mutated in place for the life of the owning process.
//! With autosave enabled, every mutation persists the affected flavors
//! immediately. Read-only queries return empty results or `None` for unknown
//! names; the fully-specified lookups and mutations surface errors instead.

pub mod persist;

use crate::config::StackConfig;
use crate::db::Database;
use crate::error::{UpstackError, UpstackResult};
use crate::family::{is_user_tag, ProductFamily, VersionInfo};
use crate::product::Product;
use crate::table::Table;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info};

/// Hierarchical product export: flavor -> name -> version -> Product
pub type ProductExport = BTreeMap<String, BTreeMap<String, BTreeMap<String, Product>>>;

/// In-memory index over one product database, with snapshot persistence
#[derive(Debug)]
pub struct ProductStack {
    config: StackConfig,

    /// flavor -> product name -> family. A flavor key may exist with an
    /// empty map: an explicitly registered empty flavor.
    lookup: BTreeMap<String, BTreeMap<String, ProductFamily>>,

    /// User tag overlay: flavor -> tag -> product name -> version. Mirrors
    /// the user-scoped assignments held inside the families, persisted
    /// separately so per-user tags never touch the shared snapshot files.
    usertags: BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>,

    /// Flavors whose in-memory state has diverged from their last-persisted
    /// snapshot
    dirty: BTreeSet<String>,

    /// Snapshot-file mtimes recorded when this process last read or wrote
    /// each file; a newer on-disk mtime means another process got there
    /// first and the save must not overwrite it
    modtimes: HashMap<PathBuf, SystemTime>,
}

impl ProductStack {
    /// Create an empty stack over a validated configuration
    pub fn new(config: StackConfig) -> UpstackResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            lookup: BTreeMap::new(),
            usertags: BTreeMap::new(),
            dirty: BTreeSet::new(),
            modtimes: HashMap::new(),
        })
    }

    /// Build a stack by scanning the authoritative database, ignoring any
    /// snapshot files
    pub fn from_database(config: StackConfig) -> UpstackResult<Self> {
        let mut stack = Self::new(config)?;
        stack.refresh_from_database()?;
        Ok(stack)
    }

    /// Build a stack from snapshot files for the requested flavors. If any
    /// requested flavor's snapshot is missing or stale, the whole stack is
    /// rebuilt from the database instead; `update_cache` controls whether
    /// the rebuilt state is then written back out.
    pub fn from_cache(
        config: StackConfig,
        flavors: &[String],
        update_cache: bool,
    ) -> UpstackResult<Self> {
        if flavors.is_empty() {
            return Err(UpstackError::NoFlavorsRequested);
        }

        let mut stack = Self::new(config)?;

        let mut all_fresh = true;
        for flavor in flavors {
            if !stack.cache_is_up_to_date(flavor)? {
                info!("Cache missing or out of date for {flavor}, rebuilding from database");
                all_fresh = false;
                break;
            }
        }

        if all_fresh {
            stack.reload(Some(flavors), None)?;
        } else {
            stack.refresh_from_database()?;
            stack.mark_dirty(flavors.iter().cloned());
            if update_cache {
                stack.save(None, None)?;
            }
        }
        Ok(stack)
    }

    /// Path of the product database this stack indexes
    pub fn db_path(&self) -> &Path {
        &self.config.db_path
    }

    pub(crate) fn config(&self) -> &StackConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// All flavor keys, including explicitly registered empty flavors
    pub fn flavors(&self) -> Vec<String> {
        self.lookup.keys().cloned().collect()
    }

    /// Unique, sorted product names; unscoped form unions across flavors
    pub fn product_names(&self, flavor: Option<&str>) -> Vec<String> {
        match flavor {
            Some(flavor) => self
                .lookup
                .get(flavor)
                .map(|families| families.keys().cloned().collect())
                .unwrap_or_default(),
            None => {
                let mut names: BTreeSet<String> = BTreeSet::new();
                for families in self.lookup.values() {
                    names.extend(families.keys().cloned());
                }
                names.into_iter().collect()
            }
        }
    }

    /// Unique, sorted versions of a product; unknown product or flavor
    /// yields an empty result
    pub fn versions(&self, name: &str, flavor: Option<&str>) -> Vec<String> {
        match flavor {
            Some(flavor) => self
                .lookup
                .get(flavor)
                .and_then(|families| families.get(name))
                .map(ProductFamily::versions)
                .unwrap_or_default(),
            None => {
                let mut versions: BTreeSet<String> = BTreeSet::new();
                for families in self.lookup.values() {
                    if let Some(family) = families.get(name) {
                        versions.extend(family.versions());
                    }
                }
                versions.into_iter().collect()
            }
        }
    }

    /// Whether a matching product exists; omitted flavor searches every
    /// flavor, omitted version means any version
    pub fn has_product(&self, name: &str, flavor: Option<&str>, version: Option<&str>) -> bool {
        match flavor {
            Some(flavor) => self
                .lookup
                .get(flavor)
                .and_then(|families| families.get(name))
                .is_some_and(|family| version.is_none_or(|v| family.has_version(v))),
            None => self
                .lookup
                .keys()
                .any(|f| self.has_product(name, Some(f), version)),
        }
    }

    /// Fully-specified lookup; a miss is an error
    pub fn product(&self, name: &str, version: &str, flavor: &str) -> UpstackResult<Product> {
        self.lookup
            .get(flavor)
            .and_then(|families| families.get(name))
            .and_then(|family| family.product(version, &self.config.db_path, flavor))
            .ok_or_else(|| UpstackError::product_not_found(name, version, flavor))
    }

    /// The product currently carrying a tag for (name, flavor), or None if
    /// untagged
    pub fn tagged_product(&self, name: &str, flavor: &str, tag: &str) -> Option<Product> {
        self.lookup
            .get(flavor)?
            .get(name)?
            .tagged_product(tag, &self.config.db_path, flavor)
    }

    /// Unique, sorted tags assigned on this stack; unknown flavor yields an
    /// empty result
    pub fn tags(&self, flavor: Option<&str>) -> Vec<String> {
        let mut tags: BTreeSet<String> = BTreeSet::new();
        match flavor {
            Some(flavor) => {
                if let Some(families) = self.lookup.get(flavor) {
                    for family in families.values() {
                        tags.extend(family.tags());
                    }
                }
            }
            None => {
                for families in self.lookup.values() {
                    for family in families.values() {
                        tags.extend(family.tags());
                    }
                }
            }
        }
        tags.into_iter().collect()
    }

    /// Whether any (or the given) flavors have unsaved updates
    pub fn save_needed(&self, flavors: Option<&[String]>) -> bool {
        match flavors {
            None => !self.dirty.is_empty(),
            Some(flavors) => flavors.iter().any(|f| self.dirty.contains(f)),
        }
    }

    /// Export every product as a flavor -> name -> version -> Product
    /// structure, suitable for `import_products`
    pub fn export(&self) -> ProductExport {
        let mut out = ProductExport::new();
        for (flavor, families) in &self.lookup {
            let mut by_name = BTreeMap::new();
            for (name, family) in families {
                by_name.insert(name.clone(), family.export(&self.config.db_path, flavor));
            }
            out.insert(flavor.clone(), by_name);
        }
        out
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Register a flavor without products, so an empty flavor can be cached
    /// and enumerated like any other
    pub fn add_flavor(&mut self, flavor: &str) {
        self.lookup.entry(flavor.to_string()).or_default();
    }

    /// Register a product, overwriting any existing entry for the same
    /// (flavor, name, version). Tags carried on the record are re-applied.
    pub fn add_product(&mut self, product: Product) -> UpstackResult<()> {
        if !product.is_fully_specified() {
            return Err(UpstackError::UnderSpecifiedProduct {
                name: product.name,
                version: product.version,
                flavor: product.flavor,
            });
        }

        let flavor = product.flavor.clone();
        let family = self
            .lookup
            .entry(flavor.clone())
            .or_default()
            .entry(product.name.clone())
            .or_insert_with(|| ProductFamily::new(&product.name));

        family.add_version(
            product.version.clone(),
            VersionInfo {
                install_dir: product.install_dir,
                table_file: product.table_file,
                table: product.table,
            },
        );
        for tag in &product.tags {
            family.assign_tag(tag.clone(), &product.version)?;
            if is_user_tag(tag) {
                Self::set_user_tag(
                    &mut self.usertags,
                    &flavor,
                    tag,
                    &product.name,
                    &product.version,
                );
            }
        }

        debug!("Added {} {} ({})", product.name, product.version, flavor);
        self.mark_dirty([flavor.clone()]);
        if self.config.autosave {
            self.save(Some(&[flavor]), None)?;
        }
        Ok(())
    }

    /// Unregister one version of a product; returns false if it was not
    /// registered. Removing a family's last version drops the family.
    pub fn remove_product(
        &mut self,
        name: &str,
        flavor: &str,
        version: &str,
    ) -> UpstackResult<bool> {
        let Some(families) = self.lookup.get_mut(flavor) else {
            return Ok(false);
        };
        let Some(family) = families.get_mut(name) else {
            return Ok(false);
        };

        if !family.remove_version(version) {
            return Ok(false);
        }
        if family.is_empty() {
            families.remove(name);
        }

        debug!("Removed {name} {version} ({flavor})");
        self.mark_dirty([flavor.to_string()]);
        if self.config.autosave {
            self.save(Some(&[flavor.to_string()]), None)?;
        }
        Ok(true)
    }

    /// Bulk-merge an exported product structure into the stack, saving once
    /// at the end when anything changed
    pub fn import_products(&mut self, products: &ProductExport) -> UpstackResult<()> {
        let mut touched = vec![];
        for (flavor, by_name) in products {
            let families = self.lookup.entry(flavor.clone()).or_default();
            for (name, versions) in by_name {
                families
                    .entry(name.clone())
                    .or_insert_with(|| ProductFamily::new(name))
                    .import(versions);
                touched.push(flavor.clone());
            }
        }

        if touched.is_empty() {
            return Ok(());
        }
        self.mark_dirty(touched);
        if self.config.autosave {
            self.save(None, None)?;
        }
        Ok(())
    }

    /// Assign a tag to a version of a product within the given flavors
    /// (default: all known flavors). Fails with `ProductNotFound` if no
    /// target flavor holds that version of the product. User-scoped tags are
    /// additionally mirrored into the user tag overlay, and persistence is
    /// routed to the per-(flavor, tag) user file instead of the shared
    /// snapshot.
    pub fn assign_tag(
        &mut self,
        tag: &str,
        product: &str,
        version: &str,
        flavors: Option<&[String]>,
    ) -> UpstackResult<()> {
        let targets: Vec<String> = match flavors {
            Some(flavors) => flavors.to_vec(),
            None => self.flavors(),
        };

        let mut assigned = vec![];
        for flavor in &targets {
            let Some(family) = self
                .lookup
                .get_mut(flavor)
                .and_then(|families| families.get_mut(product))
            else {
                continue;
            };
            if !family.has_version(version) {
                continue;
            }
            family.assign_tag(tag.to_string(), version)?;
            if is_user_tag(tag) {
                Self::set_user_tag(&mut self.usertags, flavor, tag, product, version);
            }
            assigned.push(flavor.clone());
        }

        if assigned.is_empty() {
            return Err(UpstackError::ProductNotFound {
                name: product.to_string(),
                version: Some(version.to_string()),
                flavor: Some(targets.join(", ")),
            });
        }

        debug!("Assigned tag {tag} -> {product} {version} in {assigned:?}");
        self.mark_dirty(assigned.iter().cloned());
        if self.config.autosave {
            if is_user_tag(tag) {
                self.save_user_tag(tag, &assigned)?;
            } else {
                self.save(Some(&assigned), None)?;
            }
        }
        Ok(())
    }

    /// Remove a tag from a product within the given flavors (default: all
    /// known flavors); returns false if the tag was not assigned anywhere
    pub fn unassign_tag(
        &mut self,
        tag: &str,
        product: &str,
        flavors: Option<&[String]>,
    ) -> UpstackResult<bool> {
        let targets: Vec<String> = match flavors {
            Some(flavors) => flavors.to_vec(),
            None => self.flavors(),
        };

        let mut removed = vec![];
        for flavor in &targets {
            let Some(family) = self
                .lookup
                .get_mut(flavor)
                .and_then(|families| families.get_mut(product))
            else {
                continue;
            };
            if family.unassign_tag(tag) {
                if is_user_tag(tag) {
                    Self::unset_user_tag(&mut self.usertags, flavor, tag, product);
                }
                removed.push(flavor.clone());
            }
        }

        if removed.is_empty() {
            return Ok(false);
        }

        debug!("Unassigned tag {tag} from {product} in {removed:?}");
        self.mark_dirty(removed.iter().cloned());
        if self.config.autosave {
            if is_user_tag(tag) {
                self.save_user_tag(tag, &removed)?;
            } else {
                self.save(Some(&removed), None)?;
            }
        }
        Ok(true)
    }

    /// Cache a parsed table for a declared version, parsing it from the
    /// version's table file when one is not supplied
    pub fn load_table_for(
        &mut self,
        name: &str,
        version: &str,
        flavor: &str,
        table: Option<Table>,
    ) -> UpstackResult<Table> {
        let table = match table {
            Some(table) => table,
            None => {
                let product = self.product(name, version, flavor)?;
                let path = product.table_file.ok_or_else(|| {
                    UpstackError::io(
                        format!("{name} {version} ({flavor}) has no table file"),
                        std::io::Error::from(std::io::ErrorKind::NotFound),
                    )
                })?;
                Table::from_file(&path)?
            }
        };

        let loaded = self
            .lookup
            .get_mut(flavor)
            .and_then(|families| families.get_mut(name))
            .is_some_and(|family| family.load_table_for(version, table.clone()));
        if !loaded {
            return Err(UpstackError::product_not_found(name, version, flavor));
        }
        self.mark_dirty([flavor.to_string()]);
        Ok(table)
    }

    /// Discard all product information and rebuild it from the database
    pub fn refresh_from_database(&mut self) -> UpstackResult<()> {
        let db = Database::open(&self.config.db_path)?;

        self.lookup.clear();
        for name in db.product_names()? {
            for product in db.products(&name)? {
                self.add_product(product)?;
            }
        }
        info!(
            "Rebuilt stack from {}: {} flavors",
            self.config.db_path.display(),
            self.lookup.len()
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    pub(crate) fn mark_dirty(&mut self, flavors: impl IntoIterator<Item = String>) {
        self.dirty.extend(flavors);
    }

    pub(crate) fn clear_dirty(&mut self, flavor: &str) {
        self.dirty.remove(flavor);
    }

    pub(crate) fn families_entry(&mut self, flavor: &str) -> &BTreeMap<String, ProductFamily> {
        self.lookup.entry(flavor.to_string()).or_default()
    }

    pub(crate) fn replace_families(
        &mut self,
        flavor: &str,
        families: BTreeMap<String, ProductFamily>,
    ) {
        self.lookup.insert(flavor.to_string(), families);
    }

    pub(crate) fn record_modtime(&mut self, path: PathBuf, mtime: SystemTime) {
        self.modtimes.insert(path, mtime);
    }

    pub(crate) fn recorded_modtime(&self, path: &Path) -> Option<SystemTime> {
        self.modtimes.get(path).copied()
    }

    pub(crate) fn user_tag_map(&self, flavor: &str, tag: &str) -> Option<&BTreeMap<String, String>> {
        self.usertags.get(flavor)?.get(tag)
    }

    fn set_user_tag(
        usertags: &mut BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>,
        flavor: &str,
        tag: &str,
        product: &str,
        version: &str,
    ) {
        usertags
            .entry(flavor.to_string())
            .or_default()
            .entry(tag.to_string())
            .or_default()
            .insert(product.to_string(), version.to_string());
    }

    fn unset_user_tag(
        usertags: &mut BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>,
        flavor: &str,
        tag: &str,
        product: &str,
    ) {
        if let Some(tags) = usertags.get_mut(flavor) {
            if let Some(products) = tags.get_mut(tag) {
                products.remove(product);
            }
        }
    }
}

//! Local cache of package snapshots keyed by canonical name.
//!
//! The facade consults the staleness window before deciding whether a
//! `get_package` can be answered locally or must force a remote
//! refresh. Snapshots are replaced wholesale; nothing here mutates a
//! `Package` in place.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::model::{CanonicalName, Package};

const DEFAULT_TTL: Duration = Duration::from_secs(15 * 60);

struct Entry {
    package: Package,
    fetched_at: Instant,
}

pub struct PackageCache {
    ttl: Duration,
    entries: Mutex<HashMap<CanonicalName, Entry>>,
}

impl PackageCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, name: &CanonicalName) -> Option<Package> {
        self.entries
            .lock()
            .expect("package cache poisoned")
            .get(name)
            .map(|e| e.package.clone())
    }

    /// True when we hold no snapshot, or the one we hold has aged out.
    pub fn is_stale(&self, name: &CanonicalName) -> bool {
        self.entries
            .lock()
            .expect("package cache poisoned")
            .get(name)
            .is_none_or(|e| e.fetched_at.elapsed() > self.ttl)
    }

    pub fn store(&self, package: Package) {
        self.entries.lock().expect("package cache poisoned").insert(
            package.canonical_name.clone(),
            Entry {
                package,
                fetched_at: Instant::now(),
            },
        );
    }

    pub fn store_all(&self, packages: &[Package]) {
        for p in packages {
            self.store(p.clone());
        }
    }

    pub fn invalidate(&self, name: &CanonicalName) {
        self.entries
            .lock()
            .expect("package cache poisoned")
            .remove(name);
    }

    pub fn clear(&self) {
        self.entries.lock().expect("package cache poisoned").clear();
    }
}

impl Default for PackageCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

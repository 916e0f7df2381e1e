//! The public client facade.
//!
//! `PackageClient` composes the remote proxy with the install planner:
//! proxy calls fetch data and execute changes, planner logic decides
//! what an install actually means. Planning failures (conflicts,
//! upgrade proposals) are returned as structured errors the caller can
//! act on; they are never downgraded to best-effort success.

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::broadcast;

use crate::cache::PackageCache;
use crate::error::{Error, Result};
use crate::events::{EventSink, ProgressEvent};
use crate::model::{CanonicalName, Feed, Package, Policy, ScheduledTask};
use crate::planner::{self, PlatformFilter};
use crate::platform::{HostPlatform, Platform};
use crate::proxy::{DaemonProxy, InstallOptions, PackageQuery, RemoteTasks};
use crate::session::{Session, SessionConfig};

pub struct PackageClient {
    session: Arc<Session>,
    remote: Arc<dyn RemoteTasks>,
    cache: PackageCache,
    events: EventSink,
    platform: Arc<dyn Platform>,
}

impl PackageClient {
    /// A client against the real daemon. The session connects lazily
    /// on the first call.
    pub fn new(config: SessionConfig) -> Self {
        let session = Session::new(config);
        let events = EventSink::default();
        let remote = Arc::new(DaemonProxy::new(session.clone(), events.clone()));
        Self {
            session,
            remote,
            cache: PackageCache::default(),
            events,
            platform: Arc::new(HostPlatform),
        }
    }

    /// A client over an explicit remote surface and platform; this is
    /// how tests run the facade without a daemon.
    pub fn with_remote(remote: Arc<dyn RemoteTasks>, platform: Arc<dyn Platform>) -> Self {
        Self {
            session: Session::new(SessionConfig::default()),
            remote,
            cache: PackageCache::default(),
            events: EventSink::default(),
            platform,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Download/install progress notifications. Dropping the receiver
    /// is fine; emission never blocks on subscribers.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    pub async fn elevate(&self) -> Result<()> {
        self.session.elevate().await
    }

    // ------------------------------------------------------------------
    // Installation
    // ------------------------------------------------------------------

    /// Installs one package. Fails with `PackageHasPotentialUpgrades`
    /// when newer compatible versions exist and `auto_upgrade` was not
    /// requested; re-issue with `auto_upgrade` or `force` to proceed.
    pub async fn install(
        &self,
        name: &CanonicalName,
        options: InstallOptions,
    ) -> Result<Vec<Package>> {
        let installed = self.remote.install_package(name, options).await?;
        self.cache.store_all(&installed);
        Ok(installed)
    }

    /// Dry run: what an install of `name` would actually bring in.
    pub async fn what_would_be_installed(
        &self,
        name: &CanonicalName,
        auto_upgrade: Option<bool>,
    ) -> Result<Vec<Package>> {
        let options = InstallOptions {
            auto_upgrade,
            ..InstallOptions::pretend()
        };
        self.remote.install_package(name, options).await
    }

    /// Full install planning: resolve architecture conflicts among the
    /// candidates, then compute the dependency closure via concurrent
    /// dry runs. The returned set is what a commit would install.
    pub async fn plan_install(
        &self,
        candidates: Vec<Package>,
        filter: PlatformFilter,
        auto_upgrade: Option<bool>,
        download: Option<bool>,
    ) -> Result<Vec<Package>> {
        let resolved =
            planner::filter_conflicts_for_install(candidates, filter, self.platform.is_64bit())?;
        planner::identify_packages_to_install(self.remote.as_ref(), &resolved, auto_upgrade, download)
            .await
    }

    /// Newest version `start` can be transparently upgraded to, walking
    /// binding policies across every known version of the package.
    pub async fn newest_compatible_upgrade(&self, start: &Package) -> Result<Package> {
        let candidates = self
            .get_all_versions_of_package(&start.canonical_name)
            .await?;
        Ok(planner::newest_compatible_package_in(start, &candidates))
    }

    // ------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------

    pub async fn remove_package(&self, name: &CanonicalName, force: bool) -> Result<()> {
        self.remote.remove_package(name, force).await?;
        self.cache.invalidate(name);
        self.events.emit(ProgressEvent::RemoveCompleted {
            canonical_name: name.clone(),
        });
        Ok(())
    }

    /// Batch removal without an explicit ordering; see
    /// [`planner::remove_packages`] for the retry discipline.
    pub async fn remove_packages(&self, names: &[CanonicalName], force: bool) -> Result<usize> {
        let removed = planner::remove_packages(self.remote.as_ref(), names, force).await?;
        for name in names {
            self.cache.invalidate(name);
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn find_packages(&self, query: &PackageQuery) -> Result<Vec<Package>> {
        let packages = self.remote.find_packages(query).await?;
        self.cache.store_all(&packages);
        Ok(packages)
    }

    /// One package by fully-qualified name, served from the local cache
    /// unless the snapshot is stale or a refresh is forced.
    pub async fn get_package(
        &self,
        name: &CanonicalName,
        force_refresh: bool,
    ) -> Result<Package> {
        if !name.is_canonical() {
            return Err(Error::InvalidCanonicalName(name.to_string()));
        }
        if !force_refresh && !self.cache.is_stale(name) {
            if let Some(package) = self.cache.get(name) {
                return Ok(package);
            }
        }
        let found = self
            .find_packages(&PackageQuery::named(name.as_str()))
            .await?;
        found
            .into_iter()
            .find(|p| &p.canonical_name == name)
            .ok_or_else(|| Error::UnknownPackage(name.to_string()))
    }

    /// Batch fetch, always refreshed. Per-name failures are aggregated.
    pub async fn get_packages(&self, names: &[CanonicalName]) -> Result<Vec<Package>> {
        let results = join_all(names.iter().map(|n| self.get_package(n, true))).await;
        let mut packages = Vec::new();
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(p) => packages.push(p),
                Err(e) => failures.push(e),
            }
        }
        if !failures.is_empty() {
            return Err(Error::Aggregate(failures));
        }
        Ok(packages)
    }

    /// Identifies the package(s) contained in a local file.
    pub async fn get_package_from_file(&self, path: &str) -> Result<Package> {
        let recognized = self.remote.recognize_file(path).await?;
        recognized
            .into_iter()
            .next()
            .ok_or_else(|| Error::UnknownPackage(format!("file: {path}")))
    }

    pub async fn get_active_version(&self, name: &CanonicalName) -> Result<Vec<Package>> {
        let query = PackageQuery {
            name: Some(name.as_str().to_string()),
            active: Some(true),
            ..PackageQuery::default()
        };
        self.find_packages(&query).await
    }

    pub async fn get_all_versions_of_package(&self, name: &CanonicalName) -> Result<Vec<Package>> {
        self.find_packages(&PackageQuery::named(name.other_versions_query()))
            .await
    }

    pub async fn get_installed_packages(&self, name: &CanonicalName) -> Result<Vec<Package>> {
        let query = PackageQuery {
            name: Some(name.other_versions_query()),
            installed: Some(true),
            ..PackageQuery::default()
        };
        self.find_packages(&query).await
    }

    // ------------------------------------------------------------------
    // Feeds
    // ------------------------------------------------------------------

    pub async fn add_system_feed(&self, location: &str) -> Result<Option<String>> {
        let feeds = self.remote.add_feed(location, false).await?;
        Ok(feeds.into_iter().next().map(|f| f.location))
    }

    pub async fn add_session_feed(&self, location: &str) -> Result<Option<String>> {
        let feeds = self.remote.add_feed(location, true).await?;
        Ok(feeds.into_iter().next().map(|f| f.location))
    }

    pub async fn remove_system_feed(&self, location: &str) -> Result<()> {
        self.remote.remove_feed(location, false).await
    }

    pub async fn remove_session_feed(&self, location: &str) -> Result<()> {
        self.remote.remove_feed(location, true).await
    }

    pub async fn suppress_feed(&self, location: &str) -> Result<()> {
        self.remote.suppress_feed(location).await
    }

    pub async fn feeds(&self) -> Result<Vec<Feed>> {
        self.remote.list_feeds().await
    }

    pub async fn set_feed_stale(&self, location: &str) -> Result<()> {
        self.remote.set_feed_stale(location).await
    }

    /// Marks every known feed for a rescan.
    pub async fn set_all_feeds_stale(&self) -> Result<()> {
        for feed in self.remote.list_feeds().await? {
            self.remote.set_feed_stale(&feed.location).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Policies
    // ------------------------------------------------------------------

    pub async fn get_policy(&self, name: &str) -> Result<Option<Policy>> {
        Ok(self.remote.get_policy(name).await?.into_iter().next())
    }

    pub async fn policies(&self) -> Result<Vec<Policy>> {
        self.remote.get_policy("*").await
    }

    pub async fn add_to_policy(&self, policy: &str, account: &str) -> Result<()> {
        self.remote.add_to_policy(policy, account).await
    }

    pub async fn remove_from_policy(&self, policy: &str, account: &str) -> Result<()> {
        self.remote.remove_from_policy(policy, account).await
    }

    // ------------------------------------------------------------------
    // Scheduled tasks, telemetry, configuration
    // ------------------------------------------------------------------

    pub async fn get_scheduled_task(&self, name: &str) -> Result<Option<ScheduledTask>> {
        Ok(self
            .remote
            .get_scheduled_tasks(name)
            .await?
            .into_iter()
            .next())
    }

    pub async fn scheduled_tasks(&self) -> Result<Vec<ScheduledTask>> {
        self.remote.get_scheduled_tasks("*").await
    }

    pub async fn add_scheduled_task(&self, task: &ScheduledTask) -> Result<()> {
        self.remote.add_scheduled_task(task).await
    }

    pub async fn remove_scheduled_task(&self, name: &str) -> Result<()> {
        self.remote.remove_scheduled_task(name).await
    }

    pub async fn get_telemetry(&self) -> Result<bool> {
        self.remote.get_telemetry().await
    }

    pub async fn set_telemetry(&self, opt_in: bool) -> Result<()> {
        self.remote.set_telemetry(opt_in).await
    }

    pub async fn get_configuration_value(&self, section: &str, key: &str) -> Result<String> {
        self.remote.get_configuration_value(section, key).await
    }

    pub async fn set_configuration_value(
        &self,
        section: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        self.remote
            .set_configuration_value(section, key, value)
            .await
    }
}

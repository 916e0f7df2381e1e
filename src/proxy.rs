//! The remote-operations surface.
//!
//! [`RemoteTasks`] lists every operation the daemon exposes, one typed
//! method per wire operation; [`DaemonProxy`] is the transport-backed
//! implementation. Each call ensures the session is connected, frames
//! its arguments as key/value fields, performs the multiplexed
//! dispatch, and folds response fragments into a [`ServiceResponse`]
//! until the terminal fragment arrives. Progress fragments are emitted
//! to the event sink along the way without ever blocking the call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::events::{EventSink, ProgressEvent};
use crate::model::{
    BindingPolicy, CanonicalName, Feed, FeedState, Package, Policy, ScheduledTask, Version,
};
use crate::session::message::Message;
use crate::session::{CallEnd, FragmentOutcome, Session};

/// How often a call is re-issued across daemon restarts before we give
/// up. Bounded by design; the original retried without limit.
const RESTART_RETRIES: u32 = 3;
const RESTART_BACKOFF: Duration = Duration::from_millis(500);

/// Query parameters for `find-packages`.
#[derive(Debug, Clone, Default)]
pub struct PackageQuery {
    /// Package name, partial canonical name, or glob; absent means all.
    pub name: Option<String>,
    pub installed: Option<bool>,
    pub active: Option<bool>,
    /// Restrict the search to one feed.
    pub location: Option<String>,
}

impl PackageQuery {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }
}

/// Flags for an install call.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstallOptions {
    pub auto_upgrade: Option<bool>,
    pub force: Option<bool>,
    pub download: Option<bool>,
    /// Dry run: the daemon resolves dependencies and reports what it
    /// would install, without changing anything.
    pub pretend: bool,
}

impl InstallOptions {
    pub fn pretend() -> Self {
        Self {
            pretend: true,
            ..Self::default()
        }
    }
}

/// Everything the daemon can do for us, one method per operation.
///
/// This is the seam the facade and planner depend on; tests substitute
/// their own implementation to run without a daemon.
#[async_trait]
pub trait RemoteTasks: Send + Sync {
    async fn find_packages(&self, query: &PackageQuery) -> Result<Vec<Package>>;
    async fn install_package(
        &self,
        name: &CanonicalName,
        options: InstallOptions,
    ) -> Result<Vec<Package>>;
    async fn remove_package(&self, name: &CanonicalName, force: bool) -> Result<()>;
    async fn recognize_file(&self, path: &str) -> Result<Vec<Package>>;

    async fn add_feed(&self, location: &str, session_only: bool) -> Result<Vec<Feed>>;
    async fn remove_feed(&self, location: &str, session_only: bool) -> Result<()>;
    async fn suppress_feed(&self, location: &str) -> Result<()>;
    async fn set_feed_stale(&self, location: &str) -> Result<()>;
    async fn list_feeds(&self) -> Result<Vec<Feed>>;

    async fn get_policy(&self, name: &str) -> Result<Vec<Policy>>;
    async fn add_to_policy(&self, policy: &str, account: &str) -> Result<()>;
    async fn remove_from_policy(&self, policy: &str, account: &str) -> Result<()>;

    async fn get_scheduled_tasks(&self, name: &str) -> Result<Vec<ScheduledTask>>;
    async fn add_scheduled_task(&self, task: &ScheduledTask) -> Result<()>;
    async fn remove_scheduled_task(&self, name: &str) -> Result<()>;

    async fn get_telemetry(&self) -> Result<bool>;
    async fn set_telemetry(&self, opt_in: bool) -> Result<()>;
    async fn get_configuration_value(&self, section: &str, key: &str) -> Result<String>;
    async fn set_configuration_value(&self, section: &str, key: &str, value: &str) -> Result<()>;
}

/// Accumulated state of one logical call's response fragments.
#[derive(Debug, Default)]
pub struct ServiceResponse {
    pub packages: Vec<Package>,
    pub feeds: Vec<Feed>,
    pub policies: Vec<Policy>,
    pub tasks: Vec<ScheduledTask>,
    pub value: Option<String>,
    potential_upgrades: Option<(Package, Vec<Package>)>,
    unknown_package: Option<String>,
    failure: Option<String>,
}

impl ServiceResponse {
    /// Folds one response fragment in. Progress fragments go straight
    /// to the event sink; data fragments accumulate; `done` terminates
    /// the call; `restarting` aborts it for re-issue.
    pub fn absorb(&mut self, frame: Message, events: &EventSink) -> Result<FragmentOutcome> {
        match frame.op() {
            "done" => return Ok(FragmentOutcome::Done),
            "restarting" => return Ok(FragmentOutcome::Restarting),
            "package" => self.packages.push(decode_package(&frame)?),
            "feed" => self.feeds.push(decode_feed(&frame)?),
            "policy" => self.policies.push(decode_policy(&frame)),
            "scheduled-task" => self.tasks.push(decode_task(&frame)?),
            "value" => self.value = Some(frame.get("value").unwrap_or_default().to_string()),
            "failed" => {
                self.failure = Some(frame.get("message").unwrap_or("unspecified").to_string());
            }
            "unknown-package" => {
                self.unknown_package = Some(frame.get("name").unwrap_or_default().to_string());
            }
            "potential-upgrades" => {
                let package = decode_bare_package(required(&frame, "package")?)?;
                let upgrades = frame
                    .get_all("upgrade")
                    .map(decode_bare_package)
                    .collect::<Result<Vec<_>>>()?;
                self.potential_upgrades = Some((package, upgrades));
            }
            "download-progress" => {
                events.emit(ProgressEvent::DownloadProgress {
                    canonical_name: required(&frame, "canonical")?.parse()?,
                    percent: frame.get("percent").and_then(|p| p.parse().ok()).unwrap_or(0),
                });
            }
            "download-completed" => {
                events.emit(ProgressEvent::DownloadCompleted {
                    canonical_name: required(&frame, "canonical")?.parse()?,
                });
            }
            "install-progress" => {
                let canonical_name: CanonicalName = required(&frame, "canonical")?.parse()?;
                let percent = frame.get("percent").and_then(|p| p.parse().ok()).unwrap_or(0);
                let overall_percent = frame.get("overall").and_then(|p| p.parse().ok()).unwrap_or(0);
                if overall_percent >= 100 {
                    events.emit(ProgressEvent::InstallCompleted {
                        canonical_name: canonical_name.clone(),
                    });
                }
                events.emit(ProgressEvent::InstallProgress {
                    canonical_name,
                    percent,
                    overall_percent,
                });
            }
            other => tracing::trace!(op = other, "ignoring unrecognized fragment"),
        }
        Ok(FragmentOutcome::Continue)
    }

    /// Converts the accumulated state into the call's outcome, mapping
    /// failure fragments to their typed errors.
    pub fn into_result(self) -> Result<ServiceResponse> {
        if let Some(message) = self.failure {
            return Err(Error::Remote(message));
        }
        if let Some(name) = self.unknown_package {
            return Err(Error::UnknownPackage(name));
        }
        if let Some((package, upgrades)) = self.potential_upgrades {
            return Err(Error::PackageHasPotentialUpgrades {
                package: Box::new(package),
                upgrades,
            });
        }
        Ok(self)
    }
}

fn required<'m>(frame: &'m Message, key: &str) -> Result<&'m str> {
    frame
        .get(key)
        .ok_or_else(|| Error::Protocol(format!("{} frame missing '{key}'", frame.op())))
}

fn decode_package(frame: &Message) -> Result<Package> {
    let canonical_name: CanonicalName = required(frame, "canonical")?.parse()?;
    let version = canonical_name.version().unwrap_or(Version::ZERO);
    let minimum = match frame.get("policy-min") {
        Some(v) => v.parse()?,
        None => version,
    };
    let maximum = match frame.get("policy-max") {
        Some(v) => v.parse()?,
        None => version,
    };
    Ok(Package {
        canonical_name,
        binding_policy: BindingPolicy::new(minimum, maximum),
        installed: frame.get_bool("installed").unwrap_or(false),
        active: frame.get_bool("active").unwrap_or(false),
    })
}

/// A package referenced only by canonical name, with no policy fields
/// of its own (upgrade candidates in a `potential-upgrades` frame).
fn decode_bare_package(canonical: &str) -> Result<Package> {
    let canonical_name: CanonicalName = canonical.parse()?;
    let version = canonical_name.version().unwrap_or(Version::ZERO);
    Ok(Package {
        canonical_name,
        binding_policy: BindingPolicy::only(version),
        installed: false,
        active: false,
    })
}

fn decode_feed(frame: &Message) -> Result<Feed> {
    let state = match frame.get("state").unwrap_or("active") {
        "active" => FeedState::Active,
        "passive" => FeedState::Passive,
        "ignored" => FeedState::Ignored,
        other => return Err(Error::Protocol(format!("unknown feed state: {other}"))),
    };
    let last_scanned = frame
        .get("last-scanned")
        .map(|v| {
            DateTime::parse_from_rfc3339(v)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| Error::Protocol(format!("bad last-scanned timestamp: {e}")))
        })
        .transpose()?;
    Ok(Feed {
        location: required(frame, "location")?.to_string(),
        state,
        last_scanned,
    })
}

fn decode_policy(frame: &Message) -> Policy {
    Policy {
        name: frame.get("name").unwrap_or_default().to_string(),
        description: frame.get("description").unwrap_or_default().to_string(),
        members: frame.get_all("member").map(str::to_string).collect(),
    }
}

fn decode_task(frame: &Message) -> Result<ScheduledTask> {
    let day_of_week = frame
        .get("day-of-week")
        .map(|v| {
            v.parse()
                .map_err(|_| Error::Protocol(format!("bad day-of-week: {v}")))
        })
        .transpose()?;
    Ok(ScheduledTask {
        name: required(frame, "name")?.to_string(),
        executable: frame.get("executable").unwrap_or_default().to_string(),
        command_line: frame.get("command-line").unwrap_or_default().to_string(),
        hour: frame.get("hour").and_then(|v| v.parse().ok()).unwrap_or(0),
        minutes: frame.get("minutes").and_then(|v| v.parse().ok()).unwrap_or(0),
        day_of_week,
        interval_minutes: frame
            .get("interval")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
    })
}

/// Transport-backed [`RemoteTasks`] implementation.
pub struct DaemonProxy {
    session: Arc<Session>,
    events: EventSink,
    restart_retries: u32,
    restart_backoff: Duration,
}

impl DaemonProxy {
    pub fn new(session: Arc<Session>, events: EventSink) -> Self {
        Self {
            session,
            events,
            restart_retries: RESTART_RETRIES,
            restart_backoff: RESTART_BACKOFF,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Performs one logical call, re-issuing it wholesale (bounded)
    /// when the daemon restarts mid-call. Callers therefore get
    /// at-least-once semantics across a restart boundary.
    async fn invoke(&self, request: Message) -> Result<ServiceResponse> {
        let mut attempt = 0;
        loop {
            if self.session.is_restarting() {
                tokio::time::sleep(self.restart_backoff).await;
            }
            self.session.connect().await?;

            let mut response = ServiceResponse::default();
            let end = self
                .session
                .perform_call(request.clone(), |frame| {
                    response.absorb(frame, &self.events)
                })
                .await?;

            match end {
                CallEnd::Completed => return response.into_result(),
                CallEnd::Restarting => {
                    attempt += 1;
                    if attempt > self.restart_retries {
                        return Err(Error::ServiceUnavailable(format!(
                            "daemon still restarting after {attempt} attempts"
                        )));
                    }
                    tracing::warn!(attempt, op = request.op(), "daemon restarting, re-issuing");
                    self.session.disconnect().await;
                    tokio::time::sleep(self.restart_backoff * attempt).await;
                }
            }
        }
    }

    /// Fire a call whose only interesting outcome is success/failure.
    async fn invoke_unit(&self, request: Message) -> Result<()> {
        self.invoke(request).await.map(|_| ())
    }

    fn require_canonical(name: &CanonicalName) -> Result<()> {
        if name.is_canonical() {
            Ok(())
        } else {
            Err(Error::InvalidCanonicalName(name.to_string()))
        }
    }
}

#[async_trait]
impl RemoteTasks for DaemonProxy {
    async fn find_packages(&self, query: &PackageQuery) -> Result<Vec<Package>> {
        let mut request = Message::new("find-packages");
        if let Some(name) = &query.name {
            request = request.add("query", name);
        }
        request = request.add_opt_bool("installed", query.installed);
        request = request.add_opt_bool("active", query.active);
        if let Some(location) = &query.location {
            request = request.add("location", location);
        }
        Ok(self.invoke(request).await?.packages)
    }

    async fn install_package(
        &self,
        name: &CanonicalName,
        options: InstallOptions,
    ) -> Result<Vec<Package>> {
        Self::require_canonical(name)?;
        let request = Message::new("install")
            .add("canonical", name)
            .add_opt_bool("auto-upgrade", options.auto_upgrade)
            .add_opt_bool("force", options.force)
            .add_opt_bool("download", options.download)
            .add("pretend", options.pretend);
        Ok(self.invoke(request).await?.packages)
    }

    async fn remove_package(&self, name: &CanonicalName, force: bool) -> Result<()> {
        Self::require_canonical(name)?;
        self.invoke_unit(
            Message::new("remove")
                .add("canonical", name)
                .add("force", force),
        )
        .await
    }

    async fn recognize_file(&self, path: &str) -> Result<Vec<Package>> {
        Ok(self
            .invoke(Message::new("recognize-file").add("path", path))
            .await?
            .packages)
    }

    async fn add_feed(&self, location: &str, session_only: bool) -> Result<Vec<Feed>> {
        Ok(self
            .invoke(
                Message::new("add-feed")
                    .add("location", location)
                    .add("session", session_only),
            )
            .await?
            .feeds)
    }

    async fn remove_feed(&self, location: &str, session_only: bool) -> Result<()> {
        self.invoke_unit(
            Message::new("remove-feed")
                .add("location", location)
                .add("session", session_only),
        )
        .await
    }

    async fn suppress_feed(&self, location: &str) -> Result<()> {
        self.invoke_unit(Message::new("suppress-feed").add("location", location))
            .await
    }

    async fn set_feed_stale(&self, location: &str) -> Result<()> {
        self.invoke_unit(Message::new("set-feed-stale").add("location", location))
            .await
    }

    async fn list_feeds(&self) -> Result<Vec<Feed>> {
        Ok(self.invoke(Message::new("list-feeds")).await?.feeds)
    }

    async fn get_policy(&self, name: &str) -> Result<Vec<Policy>> {
        Ok(self
            .invoke(Message::new("get-policy").add("name", name))
            .await?
            .policies)
    }

    async fn add_to_policy(&self, policy: &str, account: &str) -> Result<()> {
        self.invoke_unit(
            Message::new("add-to-policy")
                .add("policy", policy)
                .add("account", account),
        )
        .await
    }

    async fn remove_from_policy(&self, policy: &str, account: &str) -> Result<()> {
        self.invoke_unit(
            Message::new("remove-from-policy")
                .add("policy", policy)
                .add("account", account),
        )
        .await
    }

    async fn get_scheduled_tasks(&self, name: &str) -> Result<Vec<ScheduledTask>> {
        Ok(self
            .invoke(Message::new("get-scheduled-tasks").add("name", name))
            .await?
            .tasks)
    }

    async fn add_scheduled_task(&self, task: &ScheduledTask) -> Result<()> {
        let mut request = Message::new("add-scheduled-task")
            .add("name", &task.name)
            .add("executable", &task.executable)
            .add("command-line", &task.command_line)
            .add("hour", task.hour)
            .add("minutes", task.minutes)
            .add("interval", task.interval_minutes);
        if let Some(day) = task.day_of_week {
            request = request.add("day-of-week", day);
        }
        self.invoke_unit(request).await
    }

    async fn remove_scheduled_task(&self, name: &str) -> Result<()> {
        self.invoke_unit(Message::new("remove-scheduled-task").add("name", name))
            .await
    }

    async fn get_telemetry(&self) -> Result<bool> {
        let response = self.invoke(Message::new("get-telemetry")).await?;
        Ok(response.value.as_deref() == Some("true"))
    }

    async fn set_telemetry(&self, opt_in: bool) -> Result<()> {
        self.invoke_unit(Message::new("set-telemetry").add("opt-in", opt_in))
            .await
    }

    async fn get_configuration_value(&self, section: &str, key: &str) -> Result<String> {
        let response = self
            .invoke(
                Message::new("get-config")
                    .add("section", section)
                    .add("key", key),
            )
            .await?;
        Ok(response.value.unwrap_or_default())
    }

    async fn set_configuration_value(&self, section: &str, key: &str, value: &str) -> Result<()> {
        self.invoke_unit(
            Message::new("set-config")
                .add("section", section)
                .add("key", key)
                .add("value", value),
        )
        .await
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn absorb_all(frames: Vec<Message>) -> (Result<ServiceResponse>, EventSink) {
        let events = EventSink::new(16);
        let mut response = ServiceResponse::default();
        for frame in frames {
            match response.absorb(frame, &events) {
                Ok(FragmentOutcome::Done) => break,
                Ok(_) => {}
                Err(e) => return (Err(e), events),
            }
        }
        (response.into_result(), events)
    }

    #[test]
    fn test_package_fragments_accumulate() {
        let (result, _) = absorb_all(vec![
            Message::new("package")
                .add("canonical", "zlib-1.2.8.0-x64-820d50196d4e8857")
                .add("policy-min", "1.0.0.0")
                .add("policy-max", "1.2.8.0")
                .add("installed", "true"),
            Message::new("package").add("canonical", "zlib-1.0.0.0-x86-820d50196d4e8857"),
            Message::new("done"),
        ]);
        let response = result.unwrap();
        assert_eq!(response.packages.len(), 2);
        assert!(response.packages[0].installed);
        assert_eq!(
            response.packages[0].binding_policy,
            BindingPolicy::new("1.0.0.0".parse().unwrap(), "1.2.8.0".parse().unwrap())
        );
        // no explicit policy collapses to the package's own version
        assert_eq!(
            response.packages[1].binding_policy,
            BindingPolicy::only("1.0.0.0".parse().unwrap())
        );
    }

    #[test]
    fn test_failed_fragment_becomes_remote_error() {
        let (result, _) = absorb_all(vec![
            Message::new("failed").add("message", "package is in use"),
            Message::new("done"),
        ]);
        assert!(matches!(result, Err(Error::Remote(m)) if m == "package is in use"));
    }

    #[test]
    fn test_potential_upgrades_become_typed_error() {
        let (result, _) = absorb_all(vec![
            Message::new("potential-upgrades")
                .add("package", "zlib-1.0.0.0-x64-820d50196d4e8857")
                .add("upgrade", "zlib-1.1.0.0-x64-820d50196d4e8857")
                .add("upgrade", "zlib-1.2.0.0-x64-820d50196d4e8857"),
            Message::new("done"),
        ]);
        match result {
            Err(Error::PackageHasPotentialUpgrades { package, upgrades }) => {
                assert_eq!(package.name(), "zlib");
                assert_eq!(upgrades.len(), 2);
            }
            other => panic!("expected upgrade error, got {other:?}"),
        }
    }

    #[test]
    fn test_progress_fragments_emit_events_and_continue() {
        let events = EventSink::new(16);
        let mut rx = events.subscribe();
        let mut response = ServiceResponse::default();
        let frames = vec![
            Message::new("install-progress")
                .add("canonical", "zlib-1.2.8.0-x64-820d50196d4e8857")
                .add("percent", "40")
                .add("overall", "40"),
            Message::new("package").add("canonical", "zlib-1.2.8.0-x64-820d50196d4e8857"),
            Message::new("done"),
        ];
        for frame in frames {
            response.absorb(frame, &events).unwrap();
        }
        // the progress fragment did not terminate accumulation
        assert_eq!(response.into_result().unwrap().packages.len(), 1);
        assert!(matches!(
            rx.try_recv().unwrap(),
            ProgressEvent::InstallProgress { percent: 40, .. }
        ));
    }

    #[test]
    fn test_unrecognized_fragment_is_ignored() {
        let (result, _) = absorb_all(vec![
            Message::new("a-new-fragment-kind").add("x", "y"),
            Message::new("done"),
        ]);
        assert!(result.is_ok());
    }

    #[test]
    fn test_feed_and_policy_decoding() {
        let (result, _) = absorb_all(vec![
            Message::new("feed")
                .add("location", "https://feeds.example/stable")
                .add("state", "passive")
                .add("last-scanned", "2026-08-01T10:00:00Z"),
            Message::new("policy")
                .add("name", "install")
                .add("description", "who may install")
                .add("member", "wheel")
                .add("member", "admin"),
            Message::new("done"),
        ]);
        let response = result.unwrap();
        assert_eq!(response.feeds[0].state, FeedState::Passive);
        assert!(response.feeds[0].last_scanned.is_some());
        assert_eq!(response.policies[0].members, vec!["wheel", "admin"]);
    }
}

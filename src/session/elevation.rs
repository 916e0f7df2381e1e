//! Privilege elevation: relaunching the privileged helper against a
//! per-process channel and switching the session over to it.
//!
//! Elevation is mutually exclusive with connection establishment: the
//! gate is held exclusively for the whole handoff, so no new connect
//! can slip in against the old channel while the switch is in flight.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::session::Session;

/// How long a freshly launched helper gets to prove it did not die on
/// arrival before we commit to the new channel.
const HELPER_SETTLE: Duration = Duration::from_millis(100);

/// Elevated channel path: the base path tagged with a hash of our pid,
/// so concurrent elevated clients on one machine get distinct channels.
pub fn elevated_socket_path(base: &Path) -> PathBuf {
    let digest = Sha256::digest(std::process::id().to_string().as_bytes());
    let tag: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    let mut path = base.as_os_str().to_owned();
    path.push(format!(".{tag}"));
    PathBuf::from(path)
}

impl Session {
    /// Switches this session to an elevated channel. No-op when already
    /// elevated. Launches the configured helper with the derived
    /// channel path as its argument, drops the old connection, swaps
    /// the channel name, then reconnects against the new one.
    pub async fn elevate(self: &Arc<Self>) -> Result<()> {
        let gate = self.elevation_gate.write().await;

        if self.with_state(|s| s.elevated).await {
            tracing::debug!("already elevated");
            return Ok(());
        }

        let path = elevated_socket_path(&self.config.socket_path);
        let helper = &self.config.elevation_helper;
        tracing::debug!(
            helper = %helper.display(),
            channel = %path.display(),
            "launching elevation helper"
        );

        let mut child = match tokio::process::Command::new(helper).arg(&path).spawn() {
            Ok(child) => child,
            Err(e) => {
                self.with_state(|s| s.clear_elevated()).await;
                return Err(Error::ServiceUnavailable(format!(
                    "failed to launch elevation helper {}: {e}",
                    helper.display()
                )));
            }
        };

        // A helper that exits immediately never opened the channel.
        tokio::time::sleep(HELPER_SETTLE).await;
        if let Ok(Some(status)) = child.try_wait() {
            self.with_state(|s| s.clear_elevated()).await;
            return Err(Error::ServiceUnavailable(format!(
                "elevation helper exited early: {status}"
            )));
        }

        self.disconnect().await;
        self.with_state(|s| s.switch_channel(path)).await;

        // Reconnect happens outside the gate, like any other connect.
        drop(gate);
        self.connect().await
    }
}

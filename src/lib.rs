//! Client runtime for the pax package manager.
//!
//! The work of installing and removing packages happens in a separate
//! privileged daemon; this crate is everything on the near side of that
//! boundary. It keeps one persistent Unix-socket session open to the
//! daemon, multiplexes any number of concurrent logical calls over it
//! by correlation id, survives daemon restarts and privilege-elevation
//! handoffs, and plans installs (architecture-conflict resolution,
//! binding-policy upgrade chains, dependency closure via dry runs)
//! before anything is committed.
//!
//! Typical use goes through [`client::PackageClient`]:
//!
//! ```ignore
//! let client = PackageClient::new(SessionConfig::default());
//! let name: CanonicalName = "zlib-1.2.8.0-x64-820d50196d4e8857".parse()?;
//! let plan = client.what_would_be_installed(&name, None).await?;
//! ```

pub mod cache;
pub mod client;
pub mod error;
pub mod events;
pub mod model;
pub mod planner;
pub mod platform;
pub mod proxy;
pub mod session;

pub use client::PackageClient;
pub use error::{Error, Result};
pub use model::{Architecture, BindingPolicy, CanonicalName, Package, Version};
pub use proxy::{InstallOptions, PackageQuery, RemoteTasks};
pub use session::{Session, SessionConfig};

//! Value types shared across the client runtime.
//!
//! Everything in here is a snapshot: the daemon owns the truth about
//! packages, feeds and policies, and the client only ever replaces its
//! copies wholesale. Nothing in this module talks to the daemon.

mod name;
mod package;
mod records;

pub use name::{Architecture, CanonicalName, Version};
pub use package::{BindingPolicy, Package};
pub use records::{Feed, FeedState, Policy, ScheduledTask};

//! Host platform probe.
//!
//! The only question planning ever asks about the host is whether it is
//! 64-bit; it is a trait so tests can pin the answer instead of
//! inheriting the build machine's.

pub trait Platform: Send + Sync {
    fn is_64bit(&self) -> bool;
}

/// The machine this process runs on.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostPlatform;

impl Platform for HostPlatform {
    fn is_64bit(&self) -> bool {
        cfg!(target_pointer_width = "64")
    }
}

/// Fixed answer, for tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedPlatform(pub bool);

impl Platform for FixedPlatform {
    fn is_64bit(&self) -> bool {
        self.0
    }
}

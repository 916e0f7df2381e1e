//! Package identity: canonical names, versions and architectures.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Four-part package version, totally ordered.
///
/// Parses from one to four dot-separated numeric parts; missing parts
/// are zero, so `"1.2"` compares equal to `"1.2.0.0"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
    pub revision: u32,
}

impl Version {
    pub const ZERO: Version = Version::new(0, 0, 0, 0);

    pub const fn new(major: u32, minor: u32, build: u32, revision: u32) -> Self {
        Self {
            major,
            minor,
            build,
            revision,
        }
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = [0u32; 4];
        let mut count = 0;
        for part in s.split('.') {
            if count == 4 {
                return Err(Error::InvalidCanonicalName(format!(
                    "version has more than four parts: {s}"
                )));
            }
            parts[count] = part.parse().map_err(|_| {
                Error::InvalidCanonicalName(format!("non-numeric version part in {s}"))
            })?;
            count += 1;
        }
        if count == 0 || s.is_empty() {
            return Err(Error::InvalidCanonicalName("empty version".into()));
        }
        Ok(Version::new(parts[0], parts[1], parts[2], parts[3]))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.revision
        )
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.to_string()
    }
}

impl TryFrom<String> for Version {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Processor architecture a package is built for.
///
/// `Unknown` is a parse fallback for values a newer daemon might send;
/// it is carried through untouched but is never an auto-resolution
/// target during conflict planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    X86,
    X64,
    Any,
    Unknown,
}

impl Architecture {
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::X86 => "x86",
            Architecture::X64 => "x64",
            Architecture::Any => "any",
            Architecture::Unknown => "unknown",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "x86" => Some(Architecture::X86),
            "x64" => Some(Architecture::X64),
            "any" => Some(Architecture::Any),
            _ => None,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Architecture::parse(s)
            .ok_or_else(|| Error::InvalidCanonicalName(format!("unknown architecture: {s}")))
    }
}

/// Fully- or partially-qualified package identifier.
///
/// The serialized form is `name-version-architecture-keytoken`, e.g.
/// `zlib-1.2.8.0-x64-820d50196d4e8857`. Partial names (just a name, or
/// a name plus version) are valid for queries, but every mutating
/// remote operation requires [`CanonicalName::is_canonical`] and is
/// rejected locally otherwise, before any round trip to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct CanonicalName {
    raw: String,
    name: String,
    version: Option<Version>,
    architecture: Option<Architecture>,
    key_token: Option<String>,
}

fn is_key_token(s: &str) -> bool {
    s.len() == 16 && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

fn looks_like_version(s: &str) -> bool {
    !s.is_empty() && s.split('.').all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
}

impl CanonicalName {
    /// Parses a name string, accepting partial forms.
    ///
    /// Segments are matched from the right: a 16-hex-digit key token,
    /// then an architecture keyword, then a dotted numeric version.
    /// Whatever remains on the left is the package name, which may
    /// itself contain dashes.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::InvalidCanonicalName("empty package name".into()));
        }

        let mut segments: Vec<&str> = raw.split('-').collect();

        let key_token = if segments.len() > 1 && is_key_token(segments[segments.len() - 1]) {
            Some(segments.pop().unwrap().to_string())
        } else {
            None
        };
        let architecture = if segments.len() > 1 {
            let parsed = Architecture::parse(segments[segments.len() - 1]);
            if parsed.is_some() {
                segments.pop();
            }
            parsed
        } else {
            None
        };
        let version = if segments.len() > 1 && looks_like_version(segments[segments.len() - 1]) {
            Some(segments.pop().unwrap().parse()?)
        } else {
            None
        };

        let name = segments.join("-");
        if name.is_empty() {
            return Err(Error::InvalidCanonicalName(format!(
                "no package name in {raw}"
            )));
        }

        Ok(Self {
            raw: raw.to_string(),
            name,
            version,
            architecture,
            key_token,
        })
    }

    /// Builds a fully-qualified name from its parts.
    pub fn canonical(
        name: impl Into<String>,
        version: Version,
        architecture: Architecture,
        key_token: impl Into<String>,
    ) -> Result<Self, Error> {
        let name = name.into();
        let key_token = key_token.into();
        if !is_key_token(&key_token) {
            return Err(Error::InvalidCanonicalName(format!(
                "bad key token: {key_token}"
            )));
        }
        let raw = format!("{name}-{version}-{architecture}-{key_token}");
        Ok(Self {
            raw,
            name,
            version: Some(version),
            architecture: Some(architecture),
            key_token: Some(key_token),
        })
    }

    /// True when every part is present: mutating remote operations
    /// require this and fail locally without it.
    pub fn is_canonical(&self) -> bool {
        self.version.is_some()
            && self.key_token.is_some()
            && matches!(
                self.architecture,
                Some(Architecture::X86 | Architecture::X64 | Architecture::Any)
            )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> Option<Version> {
        self.version
    }

    pub fn architecture(&self) -> Option<Architecture> {
        self.architecture
    }

    pub fn key_token(&self) -> Option<&str> {
        self.key_token.as_deref()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Partial name matching any other version of this package:
    /// name + architecture + key token, version left open.
    pub fn other_versions_query(&self) -> String {
        match (&self.architecture, &self.key_token) {
            (Some(arch), Some(key)) => format!("{}-{arch}-{key}", self.name),
            _ => self.name.clone(),
        }
    }
}

impl PartialEq for CanonicalName {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for CanonicalName {}

impl std::hash::Hash for CanonicalName {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl fmt::Display for CanonicalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for CanonicalName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CanonicalName::parse(s)
    }
}

impl From<CanonicalName> for String {
    fn from(n: CanonicalName) -> Self {
        n.raw
    }
}

impl TryFrom<String> for CanonicalName {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        CanonicalName::parse(&s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_ordering() {
        let a: Version = "1.2.0.0".parse().unwrap();
        let b: Version = "1.10".parse().unwrap();
        assert!(a < b);
        assert_eq!(a, "1.2".parse().unwrap());
    }

    #[test]
    fn test_version_rejects_garbage() {
        assert!("1.2.x".parse::<Version>().is_err());
        assert!("1.2.3.4.5".parse::<Version>().is_err());
        assert!("".parse::<Version>().is_err());
    }

    #[test]
    fn test_full_canonical_name() {
        let n = CanonicalName::parse("zlib-1.2.8.0-x64-820d50196d4e8857").unwrap();
        assert!(n.is_canonical());
        assert_eq!(n.name(), "zlib");
        assert_eq!(n.version(), Some(Version::new(1, 2, 8, 0)));
        assert_eq!(n.architecture(), Some(Architecture::X64));
        assert_eq!(n.key_token(), Some("820d50196d4e8857"));
    }

    #[test]
    fn test_dashed_name_survives() {
        let n = CanonicalName::parse("lib-foo-bar-2.0-any-820d50196d4e8857").unwrap();
        assert!(n.is_canonical());
        assert_eq!(n.name(), "lib-foo-bar");
    }

    #[test]
    fn test_partial_name_is_not_canonical() {
        let n = CanonicalName::parse("zlib").unwrap();
        assert!(!n.is_canonical());
        assert_eq!(n.name(), "zlib");

        let n = CanonicalName::parse("zlib-1.2.8.0").unwrap();
        assert!(!n.is_canonical());
        assert_eq!(n.version(), Some(Version::new(1, 2, 8, 0)));
    }

    #[test]
    fn test_roundtrip_display() {
        let raw = "zlib-1.2.8.0-x86-820d50196d4e8857";
        let n = CanonicalName::parse(raw).unwrap();
        assert_eq!(n.to_string(), raw);
    }
}

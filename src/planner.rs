//! Install planning: conflict resolution among candidate packages and
//! compatibility-binding upgrade chains.
//!
//! The conflict logic is pure; anything that needs the daemon (dry-run
//! dependency resolution, batch removal) takes the remote surface as an
//! explicit parameter so tests can substitute their own.

use std::collections::HashSet;

use futures_util::future::join_all;

use crate::error::{Error, Result};
use crate::model::{Architecture, CanonicalName, Package};
use crate::proxy::{InstallOptions, RemoteTasks};

/// Which architectures the caller explicitly asked for. With no flag
/// set, no filtering intent is expressed and conflict resolution may
/// pick an architecture automatically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlatformFilter {
    pub x86: bool,
    pub x64: bool,
    pub any: bool,
}

impl PlatformFilter {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.x86 || self.x64 || self.any
    }

    fn accepts(&self, arch: Architecture) -> bool {
        match arch {
            Architecture::X86 => self.x86,
            Architecture::X64 => self.x64,
            Architecture::Any => self.any,
            Architecture::Unknown => false,
        }
    }
}

/// Keeps only packages matching an active filter; with no filtering
/// intent the input passes through unchanged.
pub fn filter_packages_for_platforms(
    packages: Vec<Package>,
    filter: PlatformFilter,
) -> Vec<Package> {
    if !filter.is_active() {
        return packages;
    }
    packages
        .into_iter()
        .filter(|p| filter.accepts(p.architecture()))
        .collect()
}

fn dedup(packages: Vec<Package>) -> Vec<Package> {
    let mut seen = HashSet::new();
    packages
        .into_iter()
        .filter(|p| seen.insert(p.canonical_name.clone()))
        .collect()
}

/// Partitions packages into families: same name and signing key, and,
/// when filtering is active, same architecture too.
fn families(packages: &[Package], filtering: bool) -> Vec<Vec<Package>> {
    let mut keys: Vec<(String, String, Option<Architecture>)> = Vec::new();
    let mut groups: Vec<Vec<Package>> = Vec::new();
    for p in packages {
        let key = (
            p.name().to_string(),
            p.key_token().to_string(),
            filtering.then(|| p.architecture()),
        );
        match keys.iter().position(|k| *k == key) {
            Some(i) => groups[i].push(p.clone()),
            None => {
                keys.push(key);
                groups.push(vec![p.clone()]);
            }
        }
    }
    groups
}

/// Ensures the set of packages to install has one unambiguous candidate
/// per logical package. Applies the platform filter first, so callers
/// need not.
///
/// With an active filter, any family still holding more than one member
/// is an unconditional conflict (architecture is already pinned, so
/// nothing is left to auto-resolve). Without one, each conflicted
/// family is auto-resolved: a lone x64 member wins on a 64-bit host,
/// else a lone x86 member wins, else the family is irreconcilable.
/// Every irreconcilable family is reported in one failure so the caller
/// can present the whole choice at once.
pub fn filter_conflicts_for_install(
    packages: Vec<Package>,
    filter: PlatformFilter,
    host_is_64bit: bool,
) -> Result<Vec<Package>> {
    let filtering = filter.is_active();
    let packages = dedup(filter_packages_for_platforms(packages, filter));
    let families = families(&packages, filtering);

    if families.iter().all(|f| f.len() == 1) {
        return Ok(packages);
    }

    let (conflicted, mut resolved): (Vec<_>, Vec<_>) =
        families.into_iter().partition(|f| f.len() > 1);
    let mut resolved: Vec<Package> = resolved.drain(..).flatten().collect();

    if filtering {
        return Err(Error::ConflictedPackages(conflicted));
    }

    let mut irreconcilable = Vec::new();
    for family in conflicted {
        if host_is_64bit {
            let x64: Vec<_> = family
                .iter()
                .filter(|p| p.architecture() == Architecture::X64)
                .cloned()
                .collect();
            if x64.len() == 1 {
                resolved.extend(x64);
                continue;
            }
            if x64.len() > 1 {
                // several builds of one architecture; nothing to pick
                irreconcilable.push(family);
                continue;
            }
        }
        let x86: Vec<_> = family
            .iter()
            .filter(|p| p.architecture() == Architecture::X86)
            .cloned()
            .collect();
        if x86.len() == 1 {
            resolved.extend(x86);
            continue;
        }
        irreconcilable.push(family);
    }

    if !irreconcilable.is_empty() {
        return Err(Error::ConflictedPackages(irreconcilable));
    }
    Ok(resolved)
}

/// Walks binding-policy chains from `start` to the newest compatible
/// successor among `candidates`: repeatedly pick a newer candidate
/// whose declared range covers the current result. Terminates because
/// every step strictly increases the version; with no compatible
/// successor, `start` comes back unchanged.
pub fn newest_compatible_package_in(start: &Package, candidates: &[Package]) -> Package {
    let mut ordered: Vec<&Package> = candidates.iter().collect();
    ordered.sort_by_key(|p| p.version());

    let mut result = start.clone();
    loop {
        match ordered.iter().find(|p| {
            p.binding_policy.covers(result.version()) && p.version() > result.version()
        }) {
            Some(next) => result = (*next).clone(),
            None => return result,
        }
    }
}

/// Computes the full set of packages an install of `packages` would
/// bring in, by running the daemon's dependency resolution as a
/// concurrent dry run per package and unioning the results.
///
/// Failure policy: every dry-run failure is collected and reported as
/// one aggregate, matching batch-removal semantics.
pub async fn identify_packages_to_install(
    remote: &dyn RemoteTasks,
    packages: &[Package],
    auto_upgrade: Option<bool>,
    download: Option<bool>,
) -> Result<Vec<Package>> {
    let options = InstallOptions {
        auto_upgrade,
        download,
        pretend: true,
        force: None,
    };
    let results = join_all(
        packages
            .iter()
            .map(|p| remote.install_package(&p.canonical_name, options)),
    )
    .await;

    let mut all = Vec::new();
    let mut failures = Vec::new();
    for result in results {
        match result {
            Ok(pkgs) => all.extend(pkgs),
            Err(e) => failures.push(e),
        }
    }
    if !failures.is_empty() {
        return Err(Error::Aggregate(failures));
    }
    Ok(dedup(all))
}

/// Removes a batch of packages without computing a removal order:
/// keep re-trying the whole pending set as long as each pass removes
/// at least one package. A pass that removes nothing means the rest
/// cannot go in any order, and its failures are reported together.
/// Worst case O(n²) remote calls, by design.
pub async fn remove_packages(
    remote: &dyn RemoteTasks,
    names: &[CanonicalName],
    force: bool,
) -> Result<usize> {
    let mut pending: Vec<CanonicalName> = names.to_vec();
    let mut removed = 0;

    while !pending.is_empty() {
        let before = pending.len();
        let mut failures = Vec::new();
        let mut still_pending = Vec::new();

        for name in pending {
            match remote.remove_package(&name, force).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    failures.push(e);
                    still_pending.push(name);
                }
            }
        }

        pending = still_pending;
        if pending.len() == before {
            return Err(Error::Aggregate(failures));
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BindingPolicy, Version};
    use crate::proxy::fakes::FakeRemote;

    const KEY: &str = "820d50196d4e8857";
    const OTHER_KEY: &str = "111122223333aaaa";

    fn pkg(name: &str, version: &str, arch: &str, key: &str) -> Package {
        let canonical_name: CanonicalName =
            format!("{name}-{version}-{arch}-{key}").parse().unwrap();
        let v = canonical_name.version().unwrap();
        Package {
            canonical_name,
            binding_policy: BindingPolicy::only(v),
            installed: false,
            active: false,
        }
    }

    fn pkg_with_policy(name: &str, version: &str, min: &str, max: &str) -> Package {
        let mut p = pkg(name, version, "x64", KEY);
        p.binding_policy =
            BindingPolicy::new(min.parse().unwrap(), max.parse().unwrap());
        p
    }

    #[test]
    fn test_no_filter_flags_passes_everything_through() {
        let input = vec![pkg("a", "1.0", "x86", KEY), pkg("b", "1.0", "x64", KEY)];
        let out = filter_packages_for_platforms(input.clone(), PlatformFilter::none());
        assert_eq!(out, input);
    }

    #[test]
    fn test_active_filter_keeps_only_matching_architectures() {
        let input = vec![
            pkg("a", "1.0", "x86", KEY),
            pkg("a", "1.0", "x64", KEY),
            pkg("a", "1.0", "any", KEY),
        ];
        let filter = PlatformFilter {
            x86: true,
            ..PlatformFilter::none()
        };
        let out = filter_packages_for_platforms(input, filter);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].architecture(), Architecture::X86);
    }

    #[test]
    fn test_x86_x64_pair_resolves_to_x64_on_64bit_host() {
        let input = vec![
            pkg("widget", "1.0", "x86", KEY),
            pkg("widget", "1.0", "x64", KEY),
        ];
        let out = filter_conflicts_for_install(input, PlatformFilter::none(), true).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].architecture(), Architecture::X64);
    }

    #[test]
    fn test_x86_x64_pair_resolves_to_x86_on_32bit_host() {
        let input = vec![
            pkg("widget", "1.0", "x86", KEY),
            pkg("widget", "1.0", "x64", KEY),
        ];
        let out = filter_conflicts_for_install(input, PlatformFilter::none(), false).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].architecture(), Architecture::X86);
    }

    #[test]
    fn test_explicit_filter_sidesteps_the_conflict() {
        let input = vec![
            pkg("widget", "1.0", "x86", KEY),
            pkg("widget", "1.0", "x64", KEY),
        ];
        let filter = PlatformFilter {
            x86: true,
            ..PlatformFilter::none()
        };
        let out = filter_conflicts_for_install(input, filter, true).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].architecture(), Architecture::X86);
    }

    #[test]
    fn test_two_versions_same_arch_is_irreconcilable() {
        let input = vec![
            pkg("widget", "1.0", "x64", KEY),
            pkg("widget", "2.0", "x64", KEY),
        ];
        match filter_conflicts_for_install(input, PlatformFilter::none(), true) {
            Err(Error::ConflictedPackages(fams)) => {
                assert_eq!(fams.len(), 1);
                assert_eq!(fams[0].len(), 2);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn test_pinned_filter_makes_duplicates_an_unconditional_conflict() {
        let input = vec![
            pkg("widget", "1.0", "x64", KEY),
            pkg("widget", "2.0", "x64", KEY),
        ];
        let filter = PlatformFilter {
            x64: true,
            ..PlatformFilter::none()
        };
        assert!(matches!(
            filter_conflicts_for_install(input, filter, true),
            Err(Error::ConflictedPackages(_))
        ));
    }

    #[test]
    fn test_all_irreconcilable_families_reported_together() {
        let input = vec![
            pkg("widget", "1.0", "x64", KEY),
            pkg("widget", "2.0", "x64", KEY),
            pkg("gadget", "1.0", "any", KEY),
            pkg("gadget", "2.0", "any", KEY),
            pkg("fine", "1.0", "x64", KEY),
        ];
        match filter_conflicts_for_install(input, PlatformFilter::none(), true) {
            Err(Error::ConflictedPackages(fams)) => assert_eq!(fams.len(), 2),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn test_differing_keys_are_different_families() {
        let input = vec![
            pkg("widget", "1.0", "x64", KEY),
            pkg("widget", "1.0", "x64", OTHER_KEY),
        ];
        let out = filter_conflicts_for_install(input, PlatformFilter::none(), true).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_resolution_is_idempotent_on_its_own_output() {
        let input = vec![
            pkg("widget", "1.0", "x86", KEY),
            pkg("widget", "1.0", "x64", KEY),
            pkg("other", "3.0", "any", KEY),
        ];
        let once = filter_conflicts_for_install(input, PlatformFilter::none(), true).unwrap();
        let twice =
            filter_conflicts_for_install(once.clone(), PlatformFilter::none(), true).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_duplicates_are_collapsed_not_conflicted() {
        let input = vec![
            pkg("widget", "1.0", "x64", KEY),
            pkg("widget", "1.0", "x64", KEY),
        ];
        let out = filter_conflicts_for_install(input, PlatformFilter::none(), true).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_binding_chain_walks_to_fixed_point() {
        let start = pkg_with_policy("lib", "1.0", "1.0", "1.0");
        let candidates = vec![
            pkg_with_policy("lib", "1.5", "1.0", "1.4"),
            pkg_with_policy("lib", "2.0", "1.5", "1.9"),
            // reachable only through 1.5 then 2.0
            pkg_with_policy("lib", "3.0", "2.0", "2.9"),
        ];
        let result = newest_compatible_package_in(&start, &candidates);
        assert_eq!(result.version(), "3.0".parse::<Version>().unwrap());
    }

    #[test]
    fn test_binding_chain_with_no_cover_returns_start() {
        let start = pkg_with_policy("lib", "1.0", "1.0", "1.0");
        let candidates = vec![pkg_with_policy("lib", "2.0", "1.5", "1.9")];
        let result = newest_compatible_package_in(&start, &candidates);
        assert_eq!(result, start);
    }

    #[test]
    fn test_binding_chain_never_goes_backwards() {
        let start = pkg_with_policy("lib", "2.0", "1.0", "3.0");
        let candidates = vec![pkg_with_policy("lib", "1.5", "1.0", "3.0")];
        let result = newest_compatible_package_in(&start, &candidates);
        assert!(result.version() >= start.version());
        assert_eq!(result, start);
    }

    fn cn(name: &str) -> CanonicalName {
        format!("{name}-1.0-x64-{KEY}").parse().unwrap()
    }

    #[tokio::test]
    async fn test_identify_unions_and_dedups_dry_runs() {
        let mut remote = FakeRemote::new();
        let shared = pkg("zlib", "1.2", "x64", KEY);
        remote.deps.insert(
            "a".into(),
            vec![pkg("a", "1.0", "x64", KEY), shared.clone()],
        );
        remote.deps.insert(
            "b".into(),
            vec![pkg("b", "1.0", "x64", KEY), shared.clone()],
        );

        let requested = vec![pkg("a", "1.0", "x64", KEY), pkg("b", "1.0", "x64", KEY)];
        let out = identify_packages_to_install(&remote, &requested, None, None)
            .await
            .unwrap();
        // a, b, and zlib exactly once
        assert_eq!(out.len(), 3);
    }

    #[tokio::test]
    async fn test_identify_aggregates_all_dry_run_failures() {
        let mut remote = FakeRemote::new();
        remote.fail_pretend_for = vec!["a".into(), "b".into()];
        remote.deps.insert("c".into(), vec![pkg("c", "1.0", "x64", KEY)]);

        let requested = vec![
            pkg("a", "1.0", "x64", KEY),
            pkg("b", "1.0", "x64", KEY),
            pkg("c", "1.0", "x64", KEY),
        ];
        match identify_packages_to_install(&remote, &requested, None, None).await {
            Err(Error::Aggregate(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected aggregate failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_remove_interdependent_pair_takes_two_passes() {
        let mut remote = FakeRemote::new();
        // a cannot go while b is present
        remote.blockers.insert("a".into(), "b".into());
        *remote.present.lock().unwrap() = vec!["a".into(), "b".into()];

        let removed = remove_packages(&remote, &[cn("a"), cn("b")], false)
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(remote.present.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_deadlock_stalls_once_then_aggregates() {
        let mut remote = FakeRemote::new();
        // a and b each require the other to go first
        remote.blockers.insert("a".into(), "b".into());
        remote.blockers.insert("b".into(), "a".into());
        *remote.present.lock().unwrap() = vec!["a".into(), "b".into()];

        match remove_packages(&remote, &[cn("a"), cn("b")], false).await {
            Err(Error::Aggregate(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected aggregate failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_remove_empty_set_is_a_noop() {
        let remote = FakeRemote::new();
        assert_eq!(remove_packages(&remote, &[], false).await.unwrap(), 0);
    }
}

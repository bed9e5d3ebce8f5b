//! The status-provider contract.
//!
//! Concrete providers (a hosted build service, a self-hosted review server)
//! are external collaborators: they know how to poll their own API and how
//! to name their own remotes, but the core only ever sees the fixed
//! three-state summary below. No provider is implemented here.

use crate::git::Branch;

/// A CI/review result, collapsed to the three states the renderer cares
/// about. Providers are expected to fold anything finer-grained (queued,
/// canceled, flaky-retry) into one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// The latest run succeeded.
    Green,
    /// A run is in progress or queued.
    Yellow,
    /// The latest run failed.
    Red,
}

/// A source of CI status for branches, keyed by remote name (a branch may
/// be built by more than one remote, e.g. a fork and its upstream).
///
/// Implementations should never propagate their own I/O or protocol errors
/// to the caller: a provider that cannot be reached reports no status for
/// the affected branches rather than failing the read.
pub trait StatusProvider: Send + Sync {
    /// Returns this provider's status for `branch`, one entry per remote
    /// that builds it. A remote absent from the map has no known status.
    fn status(&self, branch: &Branch) -> std::collections::HashMap<String, Status>;
}

/// Combines the statuses reported by several providers for the same
/// branch. Later providers take precedence for a given remote name.
pub fn merge_statuses(
    branch: &Branch,
    providers: &[&dyn StatusProvider],
) -> std::collections::HashMap<String, Status> {
    let mut merged = std::collections::HashMap::new();
    for provider in providers {
        merged.extend(provider.status(branch));
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::Branch;
    use crate::process::VcsRunner;
    use std::collections::HashMap;

    struct FixedProvider(HashMap<String, Status>);

    impl StatusProvider for FixedProvider {
        fn status(&self, _branch: &Branch) -> HashMap<String, Status> {
            self.0.clone()
        }
    }

    #[test]
    fn later_provider_overrides_earlier_for_same_remote() {
        let ctx = crate::git::Context::new(VcsRunner::new("true", std::env::temp_dir()), std::env::temp_dir());
        let branch = Branch::intern(&ctx, "main").unwrap();

        let mut first = HashMap::new();
        first.insert("origin".to_string(), Status::Red);
        let mut second = HashMap::new();
        second.insert("origin".to_string(), Status::Green);
        second.insert("fork".to_string(), Status::Yellow);

        let a = FixedProvider(first);
        let b = FixedProvider(second);
        let merged = merge_statuses(&branch, &[&a, &b]);

        assert_eq!(merged.get("origin"), Some(&Status::Green));
        assert_eq!(merged.get("fork"), Some(&Status::Yellow));
    }
}

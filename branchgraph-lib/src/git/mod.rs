//! Branch/commit model: reactive projections of a single repository,
//! derived from the process runner's output and kept current by the
//! filesystem-watch triggers each cell arms.

mod branch;
mod merge;

pub use branch::{Branch, Commit, MergeParent};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::kernel::{Cell, CellError, PathWatcher, Trigger};
use crate::process::VcsRunner;

/// `HEAD` is reserved: it denotes a detached checkout, never a ref under
/// `refs/heads`, so it can never be interned as a [`Branch`].
#[derive(Debug, thiserror::Error)]
#[error("HEAD is not a valid branch name")]
pub struct InvalidBranchName;

/// Services shared by every branch interned against the same repository:
/// the process runner, the control directory (used both to run commands
/// and as the root for path watchers), and the name-interning registry.
pub struct Context {
    pub(crate) runner: VcsRunner,
    pub(crate) git_dir: PathBuf,
    pub(crate) registry: Mutex<HashMap<String, Branch>>,
}

impl Context {
    /// Creates a context rooted at `git_dir`, invoking commands through
    /// `runner`.
    pub fn new(runner: VcsRunner, git_dir: PathBuf) -> Arc<Context> {
        Arc::new(Context {
            runner,
            git_dir,
            registry: Mutex::new(HashMap::new()),
        })
    }
}

pub(crate) fn rev_parse(ctx: &Arc<Context>, args: &[&str]) -> eyre::Result<String> {
    let mut full = vec!["rev-parse"];
    full.extend(args);
    Ok(ctx.runner.run(&full)?)
}

pub(crate) fn list_all_branches(ctx: &Arc<Context>) -> eyre::Result<Vec<Branch>> {
    let lines = ctx.runner.run_lines(&["rev-parse", "--abbrev-ref", "--branches"])?;
    Ok(lines
        .iter()
        .filter_map(|name| Branch::intern(ctx, name).ok())
        .collect())
}

fn list_remote_tracking_branches(ctx: &Arc<Context>) -> eyre::Result<Vec<Branch>> {
    let locals: std::collections::HashSet<String> =
        list_all_branches(ctx)?.iter().map(|b| b.name().to_string()).collect();
    let lines = ctx.runner.run_lines(&["rev-parse", "--abbrev-ref", "--remotes"])?;
    Ok(lines
        .iter()
        .filter(|name| {
            let short = name.split_once('/').map(|(_, rest)| rest).unwrap_or(name);
            locals.contains(short)
        })
        .filter_map(|name| Branch::intern(ctx, name).ok())
        .collect())
}

/// Module-level reactive cells keyed by a single repository: which branch
/// is checked out, the set of local branches, and the set of
/// remote-tracking branches that shadow a local branch of the same name.
pub struct Repository {
    ctx: Arc<Context>,
    head: Cell<Option<Branch>>,
    all: Cell<Vec<Branch>>,
    remotes: Cell<Vec<Branch>>,
}

impl Repository {
    /// Opens a repository rooted at `git_dir`, using `runner` to invoke the
    /// version-control binary.
    pub fn new(runner: VcsRunner, git_dir: PathBuf) -> Repository {
        let ctx = Context::new(runner, git_dir.clone());

        let head = {
            let ctx = Arc::clone(&ctx);
            let trigger = PathWatcher::new(git_dir.clone()).with_pattern("HEAD");
            Cell::with_trigger(
                move || {
                    Ok(match rev_parse(&ctx, &["--abbrev-ref", "HEAD"]) {
                        Ok(name) => Branch::intern(&ctx, &name).ok(),
                        Err(_) => None,
                    })
                },
                Some(Arc::new(trigger) as Arc<dyn Trigger>),
            )
        };

        let all = {
            let ctx = Arc::clone(&ctx);
            let trigger = PathWatcher::new(git_dir.clone()).with_pattern("refs/heads/*");
            Cell::with_trigger(
                move || list_all_branches(&ctx),
                Some(Arc::new(trigger) as Arc<dyn Trigger>),
            )
        };

        let remotes = {
            let ctx = Arc::clone(&ctx);
            let trigger = PathWatcher::new(git_dir.clone()).with_pattern("refs/remotes/*");
            Cell::with_trigger(
                move || list_remote_tracking_branches(&ctx),
                Some(Arc::new(trigger) as Arc<dyn Trigger>),
            )
        };

        Repository {
            ctx,
            head,
            all,
            remotes,
        }
    }

    /// The repository's control directory.
    pub fn git_dir(&self) -> &std::path::Path {
        &self.ctx.git_dir
    }

    /// The currently checked-out branch, or `None` if `HEAD` is detached.
    pub fn head(&self) -> Result<Option<Branch>, CellError> {
        self.head.read()
    }

    /// The set of local branch handles.
    pub fn all_branches(&self) -> Result<Vec<Branch>, CellError> {
        self.all.read()
    }

    /// The set of remote-tracking branch handles whose last path component
    /// matches some local branch name.
    pub fn remote_branches(&self) -> Result<Vec<Branch>, CellError> {
        self.remotes.read()
    }

    /// Every branch relevant to the graph: all local branches, plus any
    /// remote branch that is the upstream of a local branch of a
    /// *different* name (a rename-tracking remote that wouldn't otherwise
    /// show up).
    pub fn relevant_branches(&self) -> Result<Vec<Branch>, CellError> {
        let locals = self.all_branches()?;
        let mut relevant: Vec<Branch> = locals.clone();
        let local_names: std::collections::HashSet<&str> =
            locals.iter().map(|b| b.name()).collect();
        for branch in &locals {
            if let Some(upstream) = branch.upstream()? {
                if !local_names.contains(upstream.name()) {
                    let suffix = upstream.name().split_once('/').map(|(_, rest)| rest).unwrap_or(upstream.name());
                    if suffix != branch.name() && !relevant.contains(&upstream) {
                        relevant.push(upstream);
                    }
                }
            }
        }
        Ok(relevant)
    }

    /// Compares each local branch's tip against its matching
    /// remote-tracking branch (if any); `true` iff every match is in sync.
    /// Branches with no matching remote are omitted from the map.
    pub fn remote_sync_state(&self) -> Result<HashMap<String, bool>, CellError> {
        let remotes = self.remote_branches()?;
        let mut by_local_name: HashMap<&str, Vec<&Branch>> = HashMap::new();
        for remote in &remotes {
            let short = remote.name().split_once('/').map(|(_, rest)| rest).unwrap_or(remote.name());
            by_local_name.entry(short).or_default().push(remote);
        }

        let mut result = HashMap::new();
        for local in self.all_branches()? {
            let Some(matches) = by_local_name.get(local.name()) else {
                continue;
            };
            let local_tip = local.all_commits()?.first().map(|c| c.hash.clone());
            let in_sync = matches.iter().all(|remote| {
                remote
                    .all_commits()
                    .ok()
                    .and_then(|commits| commits.first().map(|c| c.hash.clone()))
                    == local_tip
            });
            result.insert(local.name().to_string(), in_sync);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_branch_name_rejects_head() {
        let ctx = Context::new(VcsRunner::new("true", std::env::temp_dir()), std::env::temp_dir());
        assert!(Branch::intern(&ctx, "HEAD").is_err());
    }
}

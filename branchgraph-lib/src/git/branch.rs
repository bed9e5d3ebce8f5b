use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::kernel::{Cell, PathWatcher, Trigger};
use crate::layout::BranchNode;

use super::merge::merged_branches;
use super::{rev_parse, Context};

/// One commit as reported by `all_commits`: a hash, its subject line, and
/// the hashes of any parents beyond the first (i.e. merge parents). Once a
/// branch's `commits` decorates a merge commit, matched merge parents are
/// replaced with the branches they name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    /// The commit's full hash.
    pub hash: String,
    /// The commit's subject line (first line of the message).
    pub subject: String,
    /// Parents beyond the first, decorated where their subject names a
    /// branch that was merged.
    pub merges: Vec<MergeParent>,
}

/// A non-first parent of a merge commit: either an unresolved hash (for
/// octopus merges or merges whose subject didn't name a branch) or the
/// branch that was merged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeParent {
    /// A parent hash that could not be attributed to a named branch.
    Hash(String),
    /// The branch named in the merge subject.
    Branch(Branch),
}

#[derive(Clone, Debug)]
struct RefLine {
    hash: String,
}

/// A name-interned handle to a local or remote-tracking branch. All handles
/// for the same name (within one [`Context`]) are the same underlying
/// object, so reading `a.all_commits()` and `b.all_commits()` for `a.name()
/// == b.name()` returns the same memoized [`Cell`].
#[derive(Clone)]
pub struct Branch(Arc<BranchInner>);

struct BranchInner {
    name: String,
    full_name: Cell<String>,
    ref_log: Cell<Vec<RefLine>>,
    all_commits: Cell<Vec<Commit>>,
    upstream: Cell<Option<Branch>>,
    upstream_commit: Cell<Option<Commit>>,
    commits: Cell<Vec<Commit>>,
    parents: Cell<Vec<Branch>>,
    children: Cell<Vec<Branch>>,
    modtime: Cell<i64>,
    unmerged: Cell<usize>,
}

impl fmt::Debug for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Branch({:?})", self.0.name)
    }
}

impl PartialEq for Branch {
    fn eq(&self, other: &Self) -> bool {
        self.0.name == other.0.name
    }
}
impl Eq for Branch {}

impl Hash for Branch {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.name.hash(state);
    }
}

impl Branch {
    /// The branch's short name, as git reports it (e.g. `main`,
    /// `origin/main`).
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Interns a branch handle for `name` within `ctx`. `HEAD` is never a
    /// valid branch name (it denotes a detached checkout, not a ref under
    /// `refs/heads`).
    pub fn intern(ctx: &Arc<Context>, name: &str) -> Result<Branch, super::InvalidBranchName> {
        if name == "HEAD" {
            return Err(super::InvalidBranchName);
        }
        {
            let registry = ctx.registry.lock().unwrap();
            if let Some(existing) = registry.get(name) {
                return Ok(existing.clone());
            }
        }
        let branch = Branch::new(ctx, name.to_string());
        let mut registry = ctx.registry.lock().unwrap();
        Ok(registry.entry(name.to_string()).or_insert(branch).clone())
    }

    fn new(ctx: &Arc<Context>, name: String) -> Branch {
        let git_dir = ctx.git_dir.clone();

        let full_name = {
            let ctx = Arc::clone(ctx);
            let name = name.clone();
            Cell::new(move || rev_parse(&ctx, &["--symbolic-full-name", &name]))
        };

        let ref_log = {
            let ctx = Arc::clone(ctx);
            let name = name.clone();
            let full_name_for_watch = full_name.clone();
            let trigger = PathWatcher::new(git_dir.clone()).with_dynamic_pattern(move || {
                format!("logs/{}", full_name_for_watch.read().unwrap_or_default())
            });
            Cell::with_trigger(
                move || read_ref_log(&ctx, &name),
                Some(Arc::new(trigger) as Arc<dyn Trigger>),
            )
        };

        let all_commits = {
            let ctx = Arc::clone(ctx);
            let name = name.clone();
            let full_name_for_watch = full_name.clone();
            let trigger = PathWatcher::new(git_dir.clone())
                .with_dynamic_pattern(move || full_name_for_watch.read().unwrap_or_default());
            Cell::with_trigger(
                move || read_all_commits(&ctx, &name),
                Some(Arc::new(trigger) as Arc<dyn Trigger>),
            )
        };

        let upstream = {
            let ctx = Arc::clone(ctx);
            let name = name.clone();
            let trigger = PathWatcher::new(git_dir.clone()).with_pattern("config");
            Cell::with_trigger(
                move || read_upstream(&ctx, &name),
                Some(Arc::new(trigger) as Arc<dyn Trigger>),
            )
        };

        let upstream_commit = {
            let all_commits = all_commits.clone();
            let upstream = upstream.clone();
            let ref_log = ref_log.clone();
            Cell::new(move || compute_upstream_commit(&all_commits, &upstream, &ref_log))
        };

        let commits = {
            let ctx = Arc::clone(ctx);
            let all_commits = all_commits.clone();
            let upstream_commit = upstream_commit.clone();
            Cell::new(move || compute_commits(&ctx, &all_commits, &upstream_commit))
        };

        let parents = {
            let upstream = upstream.clone();
            let commits = commits.clone();
            Cell::new(move || compute_parents(&upstream, &commits))
        };

        let children = {
            let ctx = Arc::clone(ctx);
            let name = name.clone();
            Cell::new(move || compute_children(&ctx, &name))
        };

        let modtime = {
            let ctx = Arc::clone(ctx);
            let name = name.clone();
            let trigger = PathWatcher::new(git_dir.clone())
                .with_pattern(format!("refs/heads/{name}"));
            Cell::with_trigger(
                move || read_modtime(&ctx, &name),
                Some(Arc::new(trigger) as Arc<dyn Trigger>),
            )
        };

        let unmerged = {
            let ctx = Arc::clone(ctx);
            let name = name.clone();
            let all_commits = all_commits.clone();
            let upstream = upstream.clone();
            let upstream_commit = upstream_commit.clone();
            let parents = parents.clone();
            let trigger = PathWatcher::new(git_dir.clone())
                .with_pattern(format!("refs/heads/{name}"));
            Cell::with_trigger(
                move || compute_unmerged(&ctx, &all_commits, &upstream, &upstream_commit, &parents),
                Some(Arc::new(trigger) as Arc<dyn Trigger>),
            )
        };

        Branch(Arc::new(BranchInner {
            name,
            full_name,
            ref_log,
            all_commits,
            upstream,
            upstream_commit,
            commits,
            parents,
            children,
            modtime,
            unmerged,
        }))
    }

    /// `git rev-parse --symbolic-full-name <name>`, memoized.
    pub fn full_name(&self) -> Result<String, crate::kernel::CellError> {
        self.0.full_name.read()
    }

    /// The ordered sequence of first-parent commits reachable from this
    /// branch's tip, newest first.
    pub fn all_commits(&self) -> Result<Vec<Commit>, crate::kernel::CellError> {
        self.0.all_commits.read()
    }

    /// This branch's configured upstream, or `None` if none is set.
    pub fn upstream(&self) -> Result<Option<Branch>, crate::kernel::CellError> {
        self.0.upstream.read()
    }

    /// The most recent commit this branch shares with its upstream,
    /// tolerant of upstream rebases via reflog history.
    pub fn upstream_commit(&self) -> Result<Option<Commit>, crate::kernel::CellError> {
        self.0.upstream_commit.read()
    }

    /// The prefix of `all_commits` up to (excluding) `upstream_commit`,
    /// with merge commits decorated by branch name where recoverable.
    pub fn commits(&self) -> Result<Vec<Commit>, crate::kernel::CellError> {
        self.0.commits.read()
    }

    /// `upstream` plus every branch named in a merge commit in `commits`.
    pub fn parents(&self) -> Result<Vec<Branch>, crate::kernel::CellError> {
        self.0.parents.read()
    }

    /// Every branch whose `parents` includes this one.
    pub fn children(&self) -> Result<Vec<Branch>, crate::kernel::CellError> {
        self.0.children.read()
    }

    /// Timestamp (unix seconds) of the latest real commit, ignoring the
    /// sentinel value `1`.
    pub fn modtime(&self) -> Result<i64, crate::kernel::CellError> {
        self.0.modtime.read()
    }

    /// Count of commits reachable from `parents` but not from this branch.
    pub fn unmerged(&self) -> Result<usize, crate::kernel::CellError> {
        self.0.unmerged.read()
    }
}

/// Adapts [`Branch`] to the layout engine's generic node trait. Reads that
/// fail are treated as empty edge sets / epoch zero rather than panicking:
/// the renderer is expected to have already surfaced the underlying error.
impl BranchNode for Branch {
    fn parents(&self) -> Vec<Self> {
        self.parents().unwrap_or_default()
    }

    fn children(&self) -> Vec<Self> {
        self.children().unwrap_or_default()
    }

    fn modtime(&self) -> i64 {
        self.modtime().unwrap_or(0)
    }
}

fn read_ref_log(ctx: &Arc<Context>, name: &str) -> eyre::Result<Vec<RefLine>> {
    static REFLOG_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"@\{(\d+) .*\} (\w+)").expect("reflog pattern is valid")
    });

    let lines = match ctx
        .runner
        .run_lines(&["log", "-g", &format!("{name}@{{now}}"), "--date=raw", "--format=%gd %H"])
    {
        Ok(lines) => lines,
        // A missing reflog (or any other tool failure) is treated as an
        // empty reflog rather than propagated.
        Err(_) => return Ok(Vec::new()),
    };

    Ok(lines
        .iter()
        .filter_map(|line| {
            let captures = REFLOG_RE.captures(line)?;
            Some(RefLine {
                hash: captures.get(2)?.as_str().to_string(),
            })
        })
        .collect())
}

fn read_all_commits(ctx: &Arc<Context>, name: &str) -> eyre::Result<Vec<Commit>> {
    let lines = ctx
        .runner
        .run_lines(&["log", "--first-parent", "--format=%H:%P:%s", name, "--"])?;
    Ok(lines
        .iter()
        .filter_map(|line| {
            let (hash, rest) = line.split_once(':')?;
            let (parents, subject) = rest.split_once(':')?;
            let merges = parents
                .split(' ')
                .filter(|p| !p.is_empty())
                .skip(1)
                .map(|hash| MergeParent::Hash(hash.to_string()))
                .collect();
            Some(Commit {
                hash: hash.to_string(),
                subject: subject.trim().to_string(),
                merges,
            })
        })
        .collect())
}

fn read_upstream(ctx: &Arc<Context>, name: &str) -> eyre::Result<Option<Branch>> {
    match rev_parse(ctx, &["--abbrev-ref", &format!("{name}@{{upstream}}")]) {
        Ok(upstream_name) => Ok(Branch::intern(ctx, &upstream_name).ok()),
        // No upstream configured (or any other rev-parse failure): treated
        // as absent, matching `getUpstreamBranch`'s catch-all.
        Err(_) => Ok(None),
    }
}

fn compute_upstream_commit(
    all_commits: &Cell<Vec<Commit>>,
    upstream: &Cell<Option<Branch>>,
    ref_log: &Cell<Vec<RefLine>>,
) -> eyre::Result<Option<Commit>> {
    let Some(upstream) = upstream.read().map_err(|e| eyre::eyre!(e))? else {
        return Ok(None);
    };
    let commits = all_commits.read().map_err(|e| eyre::eyre!(e))?;
    let commit_hashes: HashSet<&str> = commits.iter().map(|c| c.hash.as_str()).collect();

    let upstream_ref_log = upstream.0.ref_log.read().map_err(|e| eyre::eyre!(e))?;
    let first_upstream_reference = upstream_ref_log
        .iter()
        .find(|entry| commit_hashes.contains(entry.hash.as_str()))
        .map(|entry| entry.hash.clone());

    let upstream_commits = upstream.all_commits().map_err(|e| eyre::eyre!(e))?;
    let upstream_hashes: HashSet<&str> = upstream_commits.iter().map(|c| c.hash.as_str()).collect();

    Ok(commits
        .into_iter()
        .find(|c| {
            upstream_hashes.contains(c.hash.as_str())
                || first_upstream_reference.as_deref() == Some(c.hash.as_str())
        }))
}

fn compute_commits(
    ctx: &Arc<Context>,
    all_commits: &Cell<Vec<Commit>>,
    upstream_commit: &Cell<Option<Commit>>,
) -> eyre::Result<Vec<Commit>> {
    let commits = all_commits.read().map_err(|e| eyre::eyre!(e))?;
    let boundary = upstream_commit.read().map_err(|e| eyre::eyre!(e))?;

    let mut result = Vec::new();
    for commit in commits {
        if Some(&commit) == boundary.as_ref() {
            break;
        }
        let names = merged_branches(&commit.subject);
        if names.is_empty() {
            result.push(commit);
        } else {
            let merges = names
                .into_iter()
                .filter_map(|name| Branch::intern(ctx, &name).ok())
                .map(MergeParent::Branch)
                .collect();
            result.push(Commit { merges, ..commit });
        }
    }
    Ok(result)
}

fn compute_parents(upstream: &Cell<Option<Branch>>, commits: &Cell<Vec<Commit>>) -> eyre::Result<Vec<Branch>> {
    let Some(upstream) = upstream.read().map_err(|e| eyre::eyre!(e))? else {
        return Ok(Vec::new());
    };
    let commits = commits.read().map_err(|e| eyre::eyre!(e))?;
    let mut parents: Vec<Branch> = commits
        .iter()
        .flat_map(|c| &c.merges)
        .filter_map(|merge| match merge {
            MergeParent::Branch(b) => Some(b.clone()),
            MergeParent::Hash(_) => None,
        })
        .collect();
    parents.push(upstream);
    Ok(parents)
}

fn compute_children(ctx: &Arc<Context>, name: &str) -> eyre::Result<Vec<Branch>> {
    let all = super::list_all_branches(ctx)?;
    let mut children = Vec::new();
    for candidate in all {
        let candidate_parents = candidate.parents().map_err(|e| eyre::eyre!(e))?;
        if candidate_parents.iter().any(|p| p.name() == name) {
            children.push(candidate);
        }
    }
    Ok(children)
}

fn read_modtime(ctx: &Arc<Context>, name: &str) -> eyre::Result<i64> {
    let lines = ctx
        .runner
        .run_lines(&["log", "-n5", "--format=%at", name, "--"])?;
    for line in lines {
        if let Ok(timestamp) = line.trim().parse::<i64>() {
            if timestamp != 1 {
                return Ok(timestamp);
            }
        }
    }
    Ok(0)
}

fn compute_unmerged(
    ctx: &Arc<Context>,
    all_commits: &Cell<Vec<Commit>>,
    upstream: &Cell<Option<Branch>>,
    upstream_commit: &Cell<Option<Commit>>,
    parents: &Cell<Vec<Branch>>,
) -> eyre::Result<usize> {
    if upstream.read().map_err(|e| eyre::eyre!(e))?.is_none() {
        return Ok(0);
    }
    let commits = all_commits.read().map_err(|e| eyre::eyre!(e))?;
    let parents = parents.read().map_err(|e| eyre::eyre!(e))?;
    let boundary = upstream_commit.read().map_err(|e| eyre::eyre!(e))?;

    let mut own_hashes: HashSet<String> = commits.iter().map(|c| c.hash.clone()).collect();

    if parents.len() > 1 {
        for commit in &commits {
            if Some(commit) == boundary.as_ref() {
                break;
            }
            for merge in &commit.merges {
                if let MergeParent::Hash(rev) = merge {
                    if let Ok(first_parent_log) =
                        ctx.runner.run_lines(&["log", "--first-parent", "--format=%H", rev])
                    {
                        own_hashes.extend(first_parent_log);
                    }
                }
            }
        }
    }

    let mut accumulated: HashSet<String> = HashSet::new();
    for parent in &parents {
        let parent_commits = parent.all_commits().map_err(|e| eyre::eyre!(e))?;
        for commit in parent_commits {
            if own_hashes.contains(&commit.hash) {
                break;
            }
            accumulated.insert(commit.hash);
        }
    }
    Ok(accumulated.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::VcsRunner;

    fn fixture_context() -> Arc<Context> {
        Context::new(VcsRunner::new("true", std::env::temp_dir()), std::env::temp_dir())
    }

    #[test]
    fn branch_equality_is_by_name() {
        let ctx = fixture_context();
        let a = Branch::intern(&ctx, "main").unwrap();
        let b = Branch::intern(&ctx, "main").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn head_is_rejected_as_a_branch_name() {
        let ctx = fixture_context();
        assert!(Branch::intern(&ctx, "HEAD").is_err());
    }

    #[test]
    fn interning_is_idempotent() {
        let ctx = fixture_context();
        let a = Branch::intern(&ctx, "feature").unwrap();
        let b = Branch::intern(&ctx, "feature").unwrap();
        assert!(Arc::ptr_eq(&a.0, &b.0));
    }

    #[test]
    fn merge_subject_decorates_known_branches() {
        let ctx = fixture_context();
        let all_commits = Cell::new(|| {
            Ok(vec![Commit {
                hash: "abc".to_string(),
                subject: "Merge branch 'feature' into main".to_string(),
                merges: vec![MergeParent::Hash("def".to_string())],
            }])
        });
        let upstream_commit: Cell<Option<Commit>> = Cell::new(|| Ok(None));
        let commits = compute_commits(&ctx, &all_commits, &upstream_commit).unwrap();
        assert_eq!(commits.len(), 1);
        match &commits[0].merges[..] {
            [MergeParent::Branch(b)] => assert_eq!(b.name(), "feature"),
            other => panic!("expected a single decorated branch, got {other:?}"),
        }
    }
}

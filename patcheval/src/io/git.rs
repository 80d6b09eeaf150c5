//! Git adapter: ref resolution, range walking and commit loading.
//!
//! All repository access goes through `git` subprocesses bounded by a timeout,
//! keeping the engine free of libgit bindings.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::core::types::Commit;
use crate::io::process::{CommandOutput, run_bounded};

/// Patches beyond this size are cut; the model context is far smaller anyway.
const OUTPUT_LIMIT_BYTES: usize = 64 * 1024 * 1024;

/// Ordered, replayable supply of commits to classify.
pub trait CommitSource {
    /// Commit ids, oldest first.
    fn commit_ids(&self) -> Result<Vec<String>>;
    /// Load message, patch and parent count for one id.
    fn load(&self, id: &str) -> Result<Commit>;
}

/// Failure to turn user input into a commit id.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Neither a direct lookup nor any ref name matched.
    #[error("'{0}' does not correspond to a valid commit, tag, or branch")]
    NotFound(String),
    /// Git itself failed while resolving.
    #[error("failed to resolve '{input}': {message}")]
    Lookup { input: String, message: String },
}

/// Resolved endpoints and the commits between them, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRange {
    /// Excluded lower bound (`None` when the range starts at a root commit).
    pub start: Option<String>,
    pub end: String,
    pub ids: Vec<String>,
}

/// Wrapper for executing git commands in a repository.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            workdir: workdir.into(),
            timeout,
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Resolve a commit id, tag, or branch name to a full commit id.
    ///
    /// Tries a direct lookup first, then any ref whose name ends with `input`
    /// or whose target equals it.
    #[instrument(skip(self))]
    pub fn resolve(&self, input: &str) -> Result<String, ResolveError> {
        let lookup_err = |err: anyhow::Error| ResolveError::Lookup {
            input: input.to_string(),
            message: format!("{err:#}"),
        };

        if let Some(id) = self.peel_to_commit(input).map_err(lookup_err)? {
            debug!(%id, "resolved directly");
            return Ok(id);
        }

        let refs = self
            .run_checked(&[
                "for-each-ref",
                "--format=%(refname)%00%(objectname)%00%(*objectname)",
            ])
            .map_err(lookup_err)?;
        for line in refs.lines() {
            let mut fields = line.split('\0');
            let (Some(name), Some(target)) = (fields.next(), fields.next()) else {
                continue;
            };
            let peeled = fields.next().filter(|peeled| !peeled.is_empty());
            if name.ends_with(input) || target == input {
                let candidate = peeled.unwrap_or(target);
                if let Some(id) = self.peel_to_commit(candidate).map_err(lookup_err)? {
                    debug!(refname = name, %id, "resolved via ref suffix");
                    return Ok(id);
                }
            }
        }
        Err(ResolveError::NotFound(input.to_string()))
    }

    /// Commits reachable from `end` but not from `start`, oldest first.
    ///
    /// When both endpoints resolve to the same commit, the range is that
    /// single commit (its first parent becomes the excluded bound).
    #[instrument(skip(self))]
    pub fn walk(&self, start: &str, end: &str) -> Result<CommitRange> {
        let start = if start == end {
            self.first_parent(start)?
        } else {
            Some(start.to_string())
        };

        let mut args = vec!["rev-list", "--reverse", "--topo-order", end];
        let hidden = start.as_ref().map(|id| format!("^{id}"));
        if let Some(hidden) = hidden.as_deref() {
            args.push(hidden);
        }
        let out = self.run_checked(&args)?;
        let ids: Vec<String> = out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        debug!(count = ids.len(), "range walked");
        Ok(CommitRange {
            start,
            end: end.to_string(),
            ids,
        })
    }

    /// Load a commit's metadata and its patch against the first parent.
    #[instrument(skip(self))]
    pub fn load_commit(&self, id: &str) -> Result<Commit> {
        let header = self.run_checked(&["log", "-1", "--format=%P%x00%B", id])?;
        let (parents, message) = header
            .split_once('\0')
            .ok_or_else(|| anyhow!("unexpected git log output for {id}"))?;
        let parent_count = parents.split_whitespace().count();
        let message = message.trim_end_matches('\n').to_string();
        let message_short = message.lines().next().unwrap_or_default().trim_end().to_string();

        let patch = self.run_checked(&[
            "diff-tree",
            "-p",
            "--no-commit-id",
            "--no-color",
            "--no-ext-diff",
            "--root",
            "-m",
            "--first-parent",
            id,
        ])?;

        Ok(Commit {
            id: id.to_string(),
            message_short,
            message,
            patch,
            parent_count,
        })
    }

    fn first_parent(&self, id: &str) -> Result<Option<String>> {
        self.peel_to_commit(&format!("{id}^1"))
    }

    /// `Ok(None)` when git reports the object does not exist.
    fn peel_to_commit(&self, rev: &str) -> Result<Option<String>> {
        let spec = format!("{rev}^{{commit}}");
        let output = self.run(&["rev-parse", "--verify", "--quiet", &spec])?;
        if output.timed_out {
            return Err(anyhow!("git rev-parse {spec} timed out"));
        }
        if !output.status.success() {
            // --quiet: exit 1 without stderr means "no such object".
            let stderr = output.stderr_lossy();
            if stderr.trim().is_empty() {
                return Ok(None);
            }
            return Err(anyhow!("git rev-parse {spec} failed: {}", stderr.trim()));
        }
        let id = output.stdout_lossy().trim().to_string();
        Ok((!id.is_empty()).then_some(id))
    }

    fn run_checked(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args)?;
        if output.timed_out {
            return Err(anyhow!(
                "git {} timed out after {:?}",
                args.join(" "),
                self.timeout
            ));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                output.stderr_lossy().trim()
            ));
        }
        Ok(output.stdout_lossy())
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        run_bounded(cmd, self.timeout, OUTPUT_LIMIT_BYTES)
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// [`CommitSource`] over a walked git range.
#[derive(Debug, Clone)]
pub struct GitCommitSource {
    git: Git,
    range: CommitRange,
}

impl GitCommitSource {
    pub fn new(git: Git, range: CommitRange) -> Self {
        Self { git, range }
    }

    pub fn range(&self) -> &CommitRange {
        &self.range
    }
}

impl CommitSource for GitCommitSource {
    fn commit_ids(&self) -> Result<Vec<String>> {
        Ok(self.range.ids.clone())
    }

    fn load(&self, id: &str) -> Result<Commit> {
        self.git.load_commit(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn resolves_direct_id_and_branch_suffix() {
        let repo = TestRepo::new().expect("repo");
        let first = repo.commit_file("a.txt", "one\n", "add a").expect("commit");
        repo.tag("v0.1").expect("tag");
        let git = repo.git();

        assert_eq!(git.resolve(&first).expect("direct"), first);
        assert_eq!(git.resolve("v0.1").expect("tag"), first);
        assert_eq!(git.resolve("tags/v0.1").expect("suffix"), first);
    }

    #[test]
    fn unknown_ref_is_not_found() {
        let repo = TestRepo::new().expect("repo");
        repo.commit_file("a.txt", "one\n", "add a").expect("commit");
        let err = repo.git().resolve("no-such-ref").unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(_)), "{err}");
    }

    #[test]
    fn lookup_outside_a_repository_is_a_resolution_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let git = Git::new(temp.path().join("missing"), Duration::from_secs(10));
        let err = git.resolve("HEAD").unwrap_err();
        assert!(matches!(err, ResolveError::Lookup { .. }), "{err}");
    }

    #[test]
    fn walk_between_tags_is_oldest_first() {
        let repo = TestRepo::new().expect("repo");
        let base = repo.commit_file("a.txt", "one\n", "base").expect("c0");
        let c1 = repo.commit_file("a.txt", "two\n", "second").expect("c1");
        let c2 = repo.commit_file("b.txt", "three\n", "third").expect("c2");
        let range = repo.git().walk(&base, &c2).expect("walk");
        assert_eq!(range.ids, vec![c1, c2]);
        assert_eq!(range.start.as_deref(), Some(base.as_str()));
    }

    #[test]
    fn walk_same_endpoint_yields_single_commit() {
        let repo = TestRepo::new().expect("repo");
        repo.commit_file("a.txt", "one\n", "base").expect("c0");
        let c1 = repo.commit_file("a.txt", "two\n", "second").expect("c1");
        let range = repo.git().walk(&c1, &c1).expect("walk");
        assert_eq!(range.ids, vec![c1]);
    }

    #[test]
    fn walk_same_root_endpoint_yields_root() {
        let repo = TestRepo::new().expect("repo");
        let root = repo.commit_file("a.txt", "one\n", "root").expect("c0");
        let range = repo.git().walk(&root, &root).expect("walk");
        assert_eq!(range.start, None);
        assert_eq!(range.ids, vec![root]);
    }

    #[test]
    fn load_commit_reads_message_and_patch() {
        let repo = TestRepo::new().expect("repo");
        repo.commit_file("a.txt", "one\n", "base").expect("c0");
        let id = repo
            .commit_file("a.txt", "two\n", "fix: correct a\n\nLonger body.")
            .expect("c1");
        let commit = repo.git().load_commit(&id).expect("load");
        assert_eq!(commit.message_short, "fix: correct a");
        assert!(commit.message.contains("Longer body."));
        assert!(commit.patch.contains("-one"));
        assert!(commit.patch.contains("+two"));
        assert_eq!(commit.parent_count, 1);
        assert!(!commit.is_merge());
    }
}

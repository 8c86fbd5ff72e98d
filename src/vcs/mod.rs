//! Version-control backend. [`Vcs`] is the seam the sync engine talks to;
//! [`GitCli`] implements it by shelling out to `git`.

use std::borrow::Cow;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, IoResultExt, Result};
use crate::files;

/// Which side of a conflicted merge to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Ours,
    Theirs,
}

/// One version of a conflicted path held in the index during a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Base,
    Ours,
    Theirs,
}

impl Stage {
    fn number(self) -> u8 {
        match self {
            Stage::Base => 1,
            Stage::Ours => 2,
            Stage::Theirs => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    UpToDate,
    Merged,
    /// The merge stopped; paths are repository-relative.
    Conflicts(Vec<PathBuf>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remote {
    pub name: String,
    pub url: String,
}

/// Author and committer used for every commit the tool makes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

pub trait Vcs {
    fn is_repository(&self) -> bool;
    fn init(&self, branch: &str) -> Result<()>;
    fn is_dirty(&self) -> Result<bool>;
    fn current_branch(&self) -> Result<Option<String>>;
    /// `None` before the first commit.
    fn head(&self) -> Result<Option<String>>;
    fn has_ref(&self, refname: &str) -> Result<bool>;
    /// Commits ahead of and behind `upstream`. Without an upstream, ahead
    /// counts commits that are on no remote and behind is zero.
    fn ahead_behind(&self, upstream: Option<&str>) -> Result<(usize, usize)>;
    fn stage_all(&self) -> Result<()>;
    /// Commit the index. Returns `false` when there was nothing to commit.
    fn commit(&self, message: &str) -> Result<bool>;
    fn fetch(&self, remote: &str) -> Result<()>;
    fn merge(&self, upstream: &str) -> Result<MergeOutcome>;
    fn resolve_conflict(&self, path: &Path, side: Side) -> Result<()>;
    /// Content of one merge stage of a conflicted path; `None` when that side
    /// has no version (added on one side, or deleted).
    fn conflict_version(&self, path: &Path, stage: Stage) -> Result<Option<Vec<u8>>>;
    /// Resolve a conflicted path with merged content.
    fn resolve_with(&self, path: &Path, content: &[u8]) -> Result<()>;
    fn abort_merge(&self) -> Result<()>;
    fn conclude_merge(&self) -> Result<()>;
    fn push(&self, remote: &str, branch: &str) -> Result<()>;
    /// Paths that differ between two commits; every path of `to` when `from`
    /// is `None`.
    fn changed_paths(&self, from: Option<&str>, to: &str) -> Result<Vec<PathBuf>>;
    fn remotes(&self) -> Result<Vec<Remote>>;
    fn add_remote(&self, name: &str, url: &str) -> Result<()>;
    fn remove_remote(&self, name: &str) -> Result<()>;
}

/// Captured result of one git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

impl GitOutput {
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

pub struct GitCli {
    root: PathBuf,
    identity: Identity,
    timeout: Duration,
    retries: u32,
}

impl GitCli {
    pub fn new(root: impl Into<PathBuf>, identity: Identity) -> Self {
        GitCli {
            root: root.into(),
            identity,
            timeout: Duration::from_secs(120),
            retries: 1,
        }
    }

    /// Timeout for one network attempt and the number of extra attempts.
    pub fn with_network(mut self, timeout: Duration, retries: u32) -> Self {
        self.timeout = timeout;
        self.retries = retries;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether a `git` executable is on `PATH`.
    pub fn available() -> bool {
        which::which("git").is_ok()
    }

    /// Clone `url` into `dest` and return a backend for the new checkout.
    pub fn clone_from(
        url: &str,
        dest: &Path,
        identity: Identity,
        timeout: Duration,
        retries: u32,
    ) -> Result<GitCli> {
        let parent = dest
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).at(parent)?;

        let launcher = GitCli::new(parent, identity.clone()).with_network(timeout, retries);
        let dest_arg = dest.to_string_lossy();
        launcher.run_network("clone", &["clone", "--quiet", url, &dest_arg])?;

        tracing::info!("Cloned {url} into {}", dest.display());
        Ok(GitCli::new(dest, identity).with_network(timeout, retries))
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("git");
        cmd.args(["-c", "core.quotepath=false"])
            .args(args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_AUTHOR_NAME", &self.identity.name)
            .env("GIT_AUTHOR_EMAIL", &self.identity.email)
            .env("GIT_COMMITTER_NAME", &self.identity.name)
            .env("GIT_COMMITTER_EMAIL", &self.identity.email)
            .env("LC_ALL", "C");
        cmd
    }

    fn log_invocation(&self, args: &[&str]) {
        if tracing::enabled!(tracing::Level::DEBUG) {
            let line = args
                .iter()
                .map(|a| shell_escape::escape(Cow::Borrowed(*a)))
                .collect::<Vec<_>>()
                .join(" ");
            tracing::debug!("git {line} (in {})", self.root.display());
        }
    }

    fn run(&self, args: &[&str]) -> Result<GitOutput> {
        self.log_invocation(args);
        let output = self.command(args).output().map_err(|e| Error::Vcs {
            operation: args.first().copied().unwrap_or("git").to_string(),
            message: format!("could not run git: {e}"),
        })?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: output.stdout,
            stderr: output.stderr,
            timed_out: false,
        })
    }

    /// Run and require success; returns trimmed stdout.
    fn run_ok(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args)?;
        if output.success {
            Ok(output.stdout_str())
        } else {
            Err(Error::Vcs {
                operation: args.first().copied().unwrap_or("git").to_string(),
                message: output.stderr_str(),
            })
        }
    }

    /// Run a network operation with the configured deadline, retrying
    /// failed attempts. A remote that refuses the update is not retried.
    fn run_network(&self, operation: &str, args: &[&str]) -> Result<GitOutput> {
        let mut last_error = String::new();

        for attempt in 0..=self.retries {
            if attempt > 0 {
                tracing::warn!("git {operation} failed ({last_error}), retrying ({attempt}/{})", self.retries);
            }
            let output = self.run_with_deadline(args)?;
            if output.success {
                return Ok(output);
            }
            if output.timed_out {
                last_error = format!("timed out after {}s", self.timeout.as_secs());
                continue;
            }
            last_error = output.stderr_str();
            if is_rejection(&last_error) {
                return Err(Error::Rejected {
                    operation: operation.to_string(),
                    message: last_error,
                });
            }
        }

        Err(Error::NetworkFailure {
            operation: operation.to_string(),
            message: last_error,
        })
    }

    /// Output goes to temp files so a chatty child can never block on a full
    /// pipe while it is being polled.
    fn run_with_deadline(&self, args: &[&str]) -> Result<GitOutput> {
        self.log_invocation(args);
        let mut stdout = tempfile::tempfile().at(&self.root)?;
        let mut stderr = tempfile::tempfile().at(&self.root)?;

        let mut child = self
            .command(args)
            .stdout(Stdio::from(stdout.try_clone().at(&self.root)?))
            .stderr(Stdio::from(stderr.try_clone().at(&self.root)?))
            .spawn()
            .map_err(|e| Error::Vcs {
                operation: args.first().copied().unwrap_or("git").to_string(),
                message: format!("could not run git: {e}"),
            })?;

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    break None;
                }
                Ok(None) => thread::sleep(Duration::from_millis(50)),
                Err(e) => return Err(Error::io(&self.root, e)),
            }
        };

        Ok(GitOutput {
            success: status.map(|s| s.success()).unwrap_or(false),
            stdout: read_back(&mut stdout, &self.root)?,
            stderr: read_back(&mut stderr, &self.root)?,
            timed_out: status.is_none(),
        })
    }

    fn count(&self, args: &[&str]) -> Result<usize> {
        let out = self.run_ok(args)?;
        out.trim().parse().map_err(|_| Error::Vcs {
            operation: "rev-list".to_string(),
            message: format!("unexpected output '{out}'"),
        })
    }

    fn conflicted_paths(&self) -> Result<Vec<PathBuf>> {
        let out = self.run(&["diff", "--name-only", "-z", "--diff-filter=U"])?;
        Ok(split_nul(&out.stdout))
    }
}

fn read_back(file: &mut File, at: &Path) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    file.seek(SeekFrom::Start(0)).at(at)?;
    file.read_to_end(&mut buf).at(at)?;
    Ok(buf)
}

/// Push refusals that another attempt cannot fix.
fn is_rejection(stderr: &str) -> bool {
    ["[rejected]", "non-fast-forward", "fetch first", "[remote rejected]"]
        .iter()
        .any(|marker| stderr.contains(marker))
}

fn split_nul(bytes: &[u8]) -> Vec<PathBuf> {
    bytes
        .split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| PathBuf::from(String::from_utf8_lossy(s).into_owned()))
        .collect()
}

impl Vcs for GitCli {
    fn is_repository(&self) -> bool {
        self.root.join(".git").exists()
    }

    fn init(&self, branch: &str) -> Result<()> {
        if self.is_repository() {
            return Ok(());
        }
        self.run_ok(&["init", "--quiet"])?;
        let head = format!("refs/heads/{branch}");
        self.run_ok(&["symbolic-ref", "HEAD", &head])?;
        Ok(())
    }

    fn is_dirty(&self) -> Result<bool> {
        Ok(!self.run_ok(&["status", "--porcelain"])?.is_empty())
    }

    fn current_branch(&self) -> Result<Option<String>> {
        let out = self.run(&["symbolic-ref", "--short", "-q", "HEAD"])?;
        Ok(out.success.then(|| out.stdout_str()))
    }

    fn head(&self) -> Result<Option<String>> {
        let out = self.run(&["rev-parse", "-q", "--verify", "HEAD"])?;
        Ok(out.success.then(|| out.stdout_str()))
    }

    fn has_ref(&self, refname: &str) -> Result<bool> {
        Ok(self.run(&["rev-parse", "-q", "--verify", refname])?.success)
    }

    fn ahead_behind(&self, upstream: Option<&str>) -> Result<(usize, usize)> {
        let has_head = self.head()?.is_some();
        match (has_head, upstream) {
            (false, Some(upstream)) => Ok((0, self.count(&["rev-list", "--count", upstream])?)),
            (false, None) => Ok((0, 0)),
            (true, Some(upstream)) => {
                let range = format!("HEAD...{upstream}");
                let out = self.run_ok(&["rev-list", "--left-right", "--count", &range])?;
                let mut parts = out.split_whitespace().map(str::parse::<usize>);
                match (parts.next(), parts.next()) {
                    (Some(Ok(ahead)), Some(Ok(behind))) => Ok((ahead, behind)),
                    _ => Err(Error::Vcs {
                        operation: "rev-list".to_string(),
                        message: format!("unexpected output '{out}'"),
                    }),
                }
            }
            (true, None) => Ok((
                self.count(&["rev-list", "--count", "HEAD", "--not", "--remotes"])?,
                0,
            )),
        }
    }

    fn stage_all(&self) -> Result<()> {
        self.run_ok(&["add", "--all"]).map(|_| ())
    }

    fn commit(&self, message: &str) -> Result<bool> {
        if !self.is_dirty()? {
            return Ok(false);
        }
        self.run_ok(&["commit", "--quiet", "-m", message])?;
        Ok(true)
    }

    fn fetch(&self, remote: &str) -> Result<()> {
        self.run_network("fetch", &["fetch", "--quiet", "--prune", remote])
            .map(|_| ())
    }

    fn merge(&self, upstream: &str) -> Result<MergeOutcome> {
        let before = self.head()?;
        let out = self.run(&[
            "merge",
            "--no-edit",
            "--allow-unrelated-histories",
            upstream,
        ])?;

        if out.success {
            return Ok(if self.head()? == before {
                MergeOutcome::UpToDate
            } else {
                MergeOutcome::Merged
            });
        }

        let conflicts = self.conflicted_paths()?;
        if conflicts.is_empty() {
            return Err(Error::Vcs {
                operation: "merge".to_string(),
                message: out.stderr_str(),
            });
        }
        Ok(MergeOutcome::Conflicts(conflicts))
    }

    fn resolve_conflict(&self, path: &Path, side: Side) -> Result<()> {
        let path_arg = path.to_string_lossy();
        let stages = self.run_ok(&["ls-files", "-u", "--", &path_arg])?;

        // Stage 2 is our version, stage 3 theirs; a missing stage means that
        // side deleted the file.
        let wanted = match side {
            Side::Ours => "2",
            Side::Theirs => "3",
        };
        let present = stages.lines().any(|line| {
            line.split('\t')
                .next()
                .and_then(|meta| meta.split_whitespace().nth(2))
                == Some(wanted)
        });

        if present {
            let flag = match side {
                Side::Ours => "--ours",
                Side::Theirs => "--theirs",
            };
            self.run_ok(&["checkout", flag, "--", &path_arg])?;
            self.run_ok(&["add", "--", &path_arg])?;
        } else {
            self.run_ok(&["rm", "--quiet", "--", &path_arg])?;
        }
        Ok(())
    }

    fn conflict_version(&self, path: &Path, stage: Stage) -> Result<Option<Vec<u8>>> {
        let spec = format!(":{}:{}", stage.number(), path.to_string_lossy());
        let out = self.run(&["show", &spec])?;
        Ok(out.success.then_some(out.stdout))
    }

    fn resolve_with(&self, path: &Path, content: &[u8]) -> Result<()> {
        files::write_atomic(&self.root.join(path), content)?;
        self.run_ok(&["add", "--", &path.to_string_lossy()])?;
        Ok(())
    }

    fn abort_merge(&self) -> Result<()> {
        self.run_ok(&["merge", "--abort"]).map(|_| ())
    }

    fn conclude_merge(&self) -> Result<()> {
        self.run_ok(&["commit", "--quiet", "--no-edit"]).map(|_| ())
    }

    fn push(&self, remote: &str, branch: &str) -> Result<()> {
        let refspec = format!("HEAD:refs/heads/{branch}");
        self.run_network("push", &["push", "--quiet", "--set-upstream", remote, &refspec])
            .map(|_| ())
    }

    fn changed_paths(&self, from: Option<&str>, to: &str) -> Result<Vec<PathBuf>> {
        let out = match from {
            Some(from) => self.run(&["diff", "--name-only", "-z", from, to])?,
            None => self.run(&["ls-tree", "-r", "-z", "--name-only", to])?,
        };
        if !out.success {
            return Err(Error::Vcs {
                operation: "diff".to_string(),
                message: out.stderr_str(),
            });
        }
        Ok(split_nul(&out.stdout))
    }

    fn remotes(&self) -> Result<Vec<Remote>> {
        let out = self.run_ok(&["remote", "-v"])?;
        let mut remotes: Vec<Remote> = Vec::new();
        for line in out.lines() {
            let mut parts = line.split_whitespace();
            let (Some(name), Some(url)) = (parts.next(), parts.next()) else {
                continue;
            };
            if !remotes.iter().any(|r| r.name == name) {
                remotes.push(Remote {
                    name: name.to_string(),
                    url: url.to_string(),
                });
            }
        }
        Ok(remotes)
    }

    fn add_remote(&self, name: &str, url: &str) -> Result<()> {
        self.run_ok(&["remote", "add", name, url]).map(|_| ())
    }

    fn remove_remote(&self, name: &str) -> Result<()> {
        if !self.remotes()?.iter().any(|r| r.name == name) {
            return Err(Error::NoRemote {
                remote: name.to_string(),
            });
        }
        self.run_ok(&["remote", "remove", name]).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn identity() -> Identity {
        Identity {
            name: "superdots-test".to_string(),
            email: "test@localhost".to_string(),
        }
    }

    #[test]
    fn test_split_nul() {
        let paths = split_nul(b"linux/bashrc\0common/my file\0");
        assert_eq!(
            paths,
            vec![PathBuf::from("linux/bashrc"), PathBuf::from("common/my file")]
        );
        assert!(split_nul(b"").is_empty());
    }

    #[test]
    fn test_init_commit_and_remotes() {
        if !GitCli::available() {
            return;
        }
        let temp = TempDir::new().unwrap();
        let git = GitCli::new(temp.path(), identity());
        assert!(!git.is_repository());

        git.init("main").unwrap();
        assert!(git.is_repository());
        assert_eq!(git.head().unwrap(), None);
        assert_eq!(git.current_branch().unwrap().as_deref(), Some("main"));
        assert!(!git.commit("nothing").unwrap());

        fs::write(temp.path().join("a"), "a").unwrap();
        assert!(git.is_dirty().unwrap());
        git.stage_all().unwrap();
        assert!(git.commit("first").unwrap());
        let head = git.head().unwrap().unwrap();
        assert_eq!(
            git.changed_paths(None, &head).unwrap(),
            vec![PathBuf::from("a")]
        );
        assert_eq!(git.ahead_behind(None).unwrap(), (1, 0));

        git.add_remote("origin", "/nonexistent/remote.git").unwrap();
        assert_eq!(git.remotes().unwrap()[0].name, "origin");
        git.remove_remote("origin").unwrap();
        assert!(matches!(
            git.remove_remote("origin"),
            Err(Error::NoRemote { .. })
        ));
    }

    #[test]
    fn test_is_rejection() {
        assert!(is_rejection(
            "! [rejected]        HEAD -> main (fetch first)\nerror: failed to push some refs"
        ));
        assert!(is_rejection("! [rejected] HEAD -> main (non-fast-forward)"));
        assert!(!is_rejection("fatal: could not read from remote repository"));
    }

    #[test]
    fn test_push_behind_remote_is_rejected() {
        if !GitCli::available() {
            return;
        }
        let temp = TempDir::new().unwrap();
        let bare = temp.path().join("remote.git");
        let status = Command::new("git")
            .args(["init", "--quiet", "--bare"])
            .arg(&bare)
            .status()
            .unwrap();
        assert!(status.success());
        let url = bare.to_string_lossy().to_string();

        let mut clones = Vec::new();
        for (dir, file) in [("one", "a"), ("two", "b")] {
            let root = temp.path().join(dir);
            fs::create_dir_all(&root).unwrap();
            let git = GitCli::new(&root, identity()).with_network(Duration::from_secs(30), 2);
            git.init("main").unwrap();
            git.add_remote("origin", &url).unwrap();
            fs::write(root.join(file), file).unwrap();
            git.stage_all().unwrap();
            assert!(git.commit(file).unwrap());
            clones.push(git);
        }

        clones[0].push("origin", "main").unwrap();
        let err = clones[1].push("origin", "main").unwrap_err();
        assert!(matches!(err, Error::Rejected { ref operation, .. } if operation == "push"));
    }

    #[test]
    fn test_fetch_failure_is_network_error() {
        if !GitCli::available() {
            return;
        }
        let temp = TempDir::new().unwrap();
        let git = GitCli::new(temp.path(), identity()).with_network(Duration::from_secs(10), 1);
        git.init("main").unwrap();
        git.add_remote("origin", &temp.path().join("missing.git").to_string_lossy())
            .unwrap();

        let err = git.fetch("origin").unwrap_err();
        assert!(matches!(err, Error::NetworkFailure { ref operation, .. } if operation == "fetch"));
    }
}

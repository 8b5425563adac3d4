use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("git {args} failed: {stderr}")]
    CommandFailed { args: String, stderr: String },
    #[error("failed to run git: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    UpdateAvailable { target_ref: String },
    NoUpdate,
}

/// Thin wrapper over the `git` binary for one work tree. Never mutates the
/// tree except through `sync_to`.
#[derive(Clone)]
pub struct GitRepo {
    dir: PathBuf,
    remote: String,
    branch: String,
}

impl GitRepo {
    pub fn new(dir: impl Into<PathBuf>, remote: &str, branch: &str) -> Self {
        Self {
            dir: dir.into(),
            remote: remote.to_string(),
            branch: branch.to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn run(&self, args: &[&str]) -> Result<String, GitError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.dir)
            .output()
            .await?;

        if !output.status.success() {
            return Err(GitError::CommandFailed {
                args: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub async fn current_commit(&self) -> Result<String, GitError> {
        self.run(&["rev-parse", "HEAD"]).await
    }

    pub async fn remote_commit(&self) -> Result<String, GitError> {
        let spec = format!("{}/{}", self.remote, self.branch);
        self.run(&["rev-parse", &spec]).await
    }

    pub async fn fetch(&self) -> Result<(), GitError> {
        self.run(&["fetch", "--quiet", &self.remote, &self.branch])
            .await?;
        Ok(())
    }

    /// Hard-reset the work tree to `target_ref`. Used both for applying an
    /// update before the restart signal and for the watchdog rollback.
    pub async fn sync_to(&self, target_ref: &str) -> Result<(), GitError> {
        self.run(&["reset", "--hard", target_ref]).await?;
        Ok(())
    }
}

/// Interval-gated poller: compares local HEAD to the remote tracking ref.
/// Transient failures (network, missing remote) are logged and reported as
/// NoUpdate for that cycle — they never feed a restart decision.
pub struct GitPoller {
    repo: GitRepo,
    interval: Duration,
    last_poll: Option<tokio::time::Instant>,
}

impl GitPoller {
    pub fn new(repo: GitRepo, interval: Duration) -> Self {
        Self {
            repo,
            interval,
            last_poll: None,
        }
    }

    pub fn repo(&self) -> &GitRepo {
        &self.repo
    }

    fn due(&self) -> bool {
        match self.last_poll {
            None => true,
            Some(last) => last.elapsed() >= self.interval,
        }
    }

    /// Called every supervisor tick; only actually hits the remote once per
    /// interval.
    pub async fn poll_due(&mut self) -> PollOutcome {
        if !self.due() {
            return PollOutcome::NoUpdate;
        }
        self.last_poll = Some(tokio::time::Instant::now());
        self.poll().await
    }

    pub async fn poll(&self) -> PollOutcome {
        match self.check().await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "git poll failed, treating as no update");
                PollOutcome::NoUpdate
            }
        }
    }

    async fn check(&self) -> Result<PollOutcome, GitError> {
        self.repo.fetch().await?;
        let local = self.repo.current_commit().await?;
        let remote = self.repo.remote_commit().await?;
        if local == remote {
            debug!(commit = %local, "up to date");
            Ok(PollOutcome::NoUpdate)
        } else {
            Ok(PollOutcome::UpdateAvailable { target_ref: remote })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn git(dir: &Path, args: &[&str]) {
        let status = StdCommand::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_AUTHOR_NAME", "test")
            .env("GIT_AUTHOR_EMAIL", "test@test")
            .env("GIT_COMMITTER_NAME", "test")
            .env("GIT_COMMITTER_EMAIL", "test@test")
            .status()
            .expect("git not available");
        assert!(status.success(), "git {args:?} failed");
    }

    /// Upstream repo plus a clone tracking it.
    fn setup() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let upstream = dir.path().join("upstream");
        let clone = dir.path().join("clone");
        std::fs::create_dir_all(&upstream).unwrap();

        git(&upstream, &["init", "--quiet", "-b", "main"]);
        std::fs::write(upstream.join("file.txt"), "one\n").unwrap();
        git(&upstream, &["add", "."]);
        git(&upstream, &["commit", "--quiet", "-m", "one"]);
        git(
            dir.path(),
            &["clone", "--quiet", upstream.to_str().unwrap(), "clone"],
        );

        (dir, upstream, clone)
    }

    #[tokio::test]
    async fn test_no_update_when_in_sync() {
        let (_dir, _upstream, clone) = setup();
        let repo = GitRepo::new(&clone, "origin", "main");
        let poller = GitPoller::new(repo, Duration::from_secs(60));
        assert_eq!(poller.poll().await, PollOutcome::NoUpdate);
    }

    #[tokio::test]
    async fn test_update_available_after_upstream_commit() {
        let (_dir, upstream, clone) = setup();
        std::fs::write(upstream.join("file.txt"), "two\n").unwrap();
        git(&upstream, &["add", "."]);
        git(&upstream, &["commit", "--quiet", "-m", "two"]);

        let repo = GitRepo::new(&clone, "origin", "main");
        let poller = GitPoller::new(repo.clone(), Duration::from_secs(60));
        match poller.poll().await {
            PollOutcome::UpdateAvailable { target_ref } => {
                // Syncing to the reported ref catches us up
                repo.sync_to(&target_ref).await.unwrap();
                assert_eq!(repo.current_commit().await.unwrap(), target_ref);
            }
            PollOutcome::NoUpdate => panic!("expected an update"),
        }
    }

    #[tokio::test]
    async fn test_poll_failure_is_no_update() {
        let dir = tempfile::tempdir().unwrap();
        // Not a git repository at all
        let repo = GitRepo::new(dir.path(), "origin", "main");
        let poller = GitPoller::new(repo, Duration::from_secs(60));
        assert_eq!(poller.poll().await, PollOutcome::NoUpdate);
    }

    #[tokio::test]
    async fn test_poll_due_respects_interval() {
        let (_dir, _upstream, clone) = setup();
        let repo = GitRepo::new(&clone, "origin", "main");
        let mut poller = GitPoller::new(repo, Duration::from_secs(3600));

        // First call polls; second is inside the interval and short-circuits
        assert_eq!(poller.poll_due().await, PollOutcome::NoUpdate);
        assert!(poller.last_poll.is_some());
        let first = poller.last_poll.unwrap();
        assert_eq!(poller.poll_due().await, PollOutcome::NoUpdate);
        assert_eq!(poller.last_poll.unwrap(), first);
    }
}

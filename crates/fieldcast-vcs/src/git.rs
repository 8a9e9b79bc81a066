use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

/// Captured result of one git invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Seam for running git. The real implementation shells out; tests script
/// outputs without touching a repository.
pub trait GitRunner {
    fn run(
        &self,
        repo_root: &Path,
        args: &[&str],
        timeout: Option<Duration>,
    ) -> Result<CommandOutput>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemGitRunner;

fn base_git_command() -> Command {
    let mut command = Command::new("git");
    command
        .arg("-c")
        .arg("core.autocrlf=false")
        .arg("-c")
        .arg("core.eol=lf");
    command
}

impl GitRunner for SystemGitRunner {
    fn run(
        &self,
        repo_root: &Path,
        args: &[&str],
        timeout: Option<Duration>,
    ) -> Result<CommandOutput> {
        match timeout {
            None => {
                let output = base_git_command()
                    .args(args)
                    .current_dir(repo_root)
                    .output()
                    .with_context(|| format!("failed launching git {}", args.join(" ")))?;
                Ok(CommandOutput {
                    success: output.status.success(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
            Some(limit) => run_with_timeout(repo_root, args, limit),
        }
    }
}

/// Spawn git with piped output and kill it if it outlives the deadline.
/// Output pipes are drained from threads so a chatty child cannot deadlock
/// against a full pipe buffer.
fn run_with_timeout(repo_root: &Path, args: &[&str], limit: Duration) -> Result<CommandOutput> {
    let mut child = base_git_command()
        .args(args)
        .current_dir(repo_root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed launching git {}", args.join(" ")))?;

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let stdout_reader = std::thread::spawn(move || drain_pipe(stdout_pipe));
    let stderr_reader = std::thread::spawn(move || drain_pipe(stderr_pipe));

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child
            .try_wait()
            .with_context(|| format!("failed waiting for git {}", args.join(" ")))?
        {
            break Some(status);
        }
        if started.elapsed() >= limit {
            let _ = child.kill();
            let _ = child.wait();
            break None;
        }
        std::thread::sleep(Duration::from_millis(50));
    };

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();

    match status {
        Some(status) => Ok(CommandOutput {
            success: status.success(),
            stdout,
            stderr,
        }),
        None => Err(anyhow!(
            "git {} timed out after {}s",
            args.join(" "),
            limit.as_secs()
        )),
    }
}

fn drain_pipe(pipe: Option<impl Read>) -> String {
    let mut buffer = String::new();
    if let Some(mut pipe) = pipe {
        let mut bytes = Vec::new();
        let _ = pipe.read_to_end(&mut bytes);
        buffer = String::from_utf8_lossy(&bytes).into_owned();
    }
    buffer
}

/// A stash created by the engine, identified both by its commit id (stable
/// even after the stash list shifts) and the reflog name used for apply/pop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StashHandle {
    pub commit: String,
    pub label: String,
}

/// Narrow typed surface over the git CLI. Every mutation and query the engine
/// needs goes through here; nothing else in the workspace spawns git.
pub struct GitCli {
    repo_root: PathBuf,
    runner: Box<dyn GitRunner>,
}

impl GitCli {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self::with_runner(repo_root, Box::new(SystemGitRunner))
    }

    pub fn with_runner(repo_root: impl Into<PathBuf>, runner: Box<dyn GitRunner>) -> Self {
        Self {
            repo_root: repo_root.into(),
            runner,
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    fn run(&self, args: &[&str], timeout: Option<Duration>) -> Result<CommandOutput> {
        self.runner.run(&self.repo_root, args, timeout)
    }

    /// Run and require success, returning trimmed stdout.
    fn run_ok(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args, None)?;
        if !output.success {
            anyhow::bail!("git {} failed: {}", args.join(" "), output.stderr.trim());
        }
        Ok(output.stdout.trim().to_string())
    }

    pub fn git_dir(&self) -> Result<PathBuf> {
        let raw = self.run_ok(&["rev-parse", "--absolute-git-dir"])?;
        Ok(PathBuf::from(raw))
    }

    pub fn rev_parse(&self, refname: &str) -> Result<String> {
        let spec = format!("{refname}^{{commit}}");
        self.run_ok(&["rev-parse", "--verify", "--quiet", &spec])
            .with_context(|| format!("'{refname}' does not resolve to a commit"))
    }

    pub fn try_rev_parse(&self, refname: &str) -> Result<Option<String>> {
        let spec = format!("{refname}^{{commit}}");
        let output = self.run(&["rev-parse", "--verify", "--quiet", &spec], None)?;
        if !output.success {
            return Ok(None);
        }
        Ok(Some(output.stdout.trim().to_string()))
    }

    pub fn head_commit(&self) -> Result<String> {
        self.rev_parse("HEAD")
    }

    /// Current branch name, or the detached-HEAD commit id.
    pub fn current_ref(&self) -> Result<String> {
        let output = self.run(&["symbolic-ref", "--quiet", "--short", "HEAD"], None)?;
        if output.success {
            return Ok(output.stdout.trim().to_string());
        }
        self.head_commit()
    }

    pub fn describe(&self) -> Result<String> {
        let output = self.run(&["describe", "--tags", "--always"], None)?;
        if output.success {
            return Ok(output.stdout.trim().to_string());
        }
        self.head_commit()
    }

    pub fn status_porcelain(&self) -> Result<Vec<String>> {
        let raw = self.run_ok(&["status", "--porcelain"])?;
        Ok(raw.lines().map(|line| line.to_string()).collect())
    }

    pub fn fetch(&self, remote: &str, timeout: Duration) -> Result<()> {
        let output = self.run(&["fetch", "--prune", "--tags", remote], Some(timeout))?;
        if !output.success {
            anyhow::bail!("git fetch {} failed: {}", remote, output.stderr.trim());
        }
        Ok(())
    }

    pub fn checkout(&self, refname: &str) -> Result<()> {
        let output = self.run(&["checkout", refname], None)?;
        if !output.success {
            anyhow::bail!("git checkout {} failed: {}", refname, output.stderr.trim());
        }
        Ok(())
    }

    /// Discard all local modifications and untracked files, then move to
    /// `refname`. Only the hard-reset operator path calls this.
    pub fn reset_hard(&self, refname: &str) -> Result<()> {
        let output = self.run(&["reset", "--hard", refname], None)?;
        if !output.success {
            anyhow::bail!("git reset --hard {} failed: {}", refname, output.stderr.trim());
        }
        let output = self.run(&["clean", "-fd"], None)?;
        if !output.success {
            anyhow::bail!("git clean -fd failed: {}", output.stderr.trim());
        }
        Ok(())
    }

    pub fn tag_exists(&self, name: &str) -> Result<bool> {
        let raw = self.run_ok(&["tag", "--list", name])?;
        Ok(!raw.is_empty())
    }

    pub fn local_branch_exists(&self, name: &str) -> Result<bool> {
        let refname = format!("refs/heads/{name}");
        let output = self.run(&["show-ref", "--verify", "--quiet", &refname], None)?;
        Ok(output.success)
    }

    pub fn remote_branch_exists(&self, remote: &str, name: &str) -> Result<bool> {
        let refname = format!("refs/remotes/{remote}/{name}");
        let output = self.run(&["show-ref", "--verify", "--quiet", &refname], None)?;
        Ok(output.success)
    }

    pub fn tags_by_recency(&self) -> Result<Vec<String>> {
        let raw = self.run_ok(&["tag", "--list", "--sort=-creatordate"])?;
        Ok(raw.lines().map(|line| line.trim().to_string()).collect())
    }

    pub fn branches_by_recency(&self, remote: &str) -> Result<Vec<String>> {
        let heads = "refs/heads".to_string();
        let remotes = format!("refs/remotes/{remote}");
        let raw = self.run_ok(&[
            "for-each-ref",
            "--sort=-committerdate",
            "--format=%(refname:short)",
            &heads,
            &remotes,
        ])?;
        let mut branches = Vec::new();
        for line in raw.lines() {
            let name = line.trim();
            if name.is_empty() || name.ends_with("/HEAD") {
                continue;
            }
            let short = name
                .strip_prefix(&format!("{remote}/"))
                .unwrap_or(name)
                .to_string();
            if !branches.contains(&short) {
                branches.push(short);
            }
        }
        Ok(branches)
    }

    pub fn remote_head_branch(&self, remote: &str) -> Result<Option<String>> {
        let refname = format!("refs/remotes/{remote}/HEAD");
        let output = self.run(&["symbolic-ref", "--quiet", "--short", &refname], None)?;
        if !output.success {
            return Ok(None);
        }
        let name = output.stdout.trim();
        Ok(name
            .strip_prefix(&format!("{remote}/"))
            .map(|short| short.to_string()))
    }

    /// True when `path` differs between the two revisions.
    pub fn path_changed_between(&self, old: &str, new: &str, path: &Path) -> Result<bool> {
        let range = format!("{old}..{new}");
        let path_arg = path.to_string_lossy();
        let raw = self.run_ok(&["diff", "--name-only", &range, "--", path_arg.as_ref()])?;
        Ok(!raw.is_empty())
    }

    /// Stash all local edits including untracked files. Returns None when the
    /// workspace had nothing to stash.
    pub fn stash_push(&self, label: &str) -> Result<Option<StashHandle>> {
        let message = format!("-m{label}");
        let output = self.run(&["stash", "push", "--include-untracked", &message], None)?;
        if !output.success {
            anyhow::bail!("git stash push failed: {}", output.stderr.trim());
        }
        if output.stdout.contains("No local changes") {
            return Ok(None);
        }
        let commit = self
            .run_ok(&["rev-parse", "refs/stash"])
            .context("stash push succeeded but refs/stash does not resolve")?;
        Ok(Some(StashHandle {
            commit,
            label: label.to_string(),
        }))
    }

    /// Map a stash commit id back to its current reflog name (`stash@{N}`).
    /// Pop and drop require the reflog name; the position can shift, so it is
    /// resolved at use time rather than recorded at push time.
    fn stash_ref_for(&self, handle: &StashHandle) -> Result<Option<String>> {
        let raw = self.run_ok(&["stash", "list", "--format=%H %gd"])?;
        for line in raw.lines() {
            if let Some((commit, refname)) = line.trim().split_once(' ') {
                if commit == handle.commit {
                    return Ok(Some(refname.to_string()));
                }
            }
        }
        Ok(None)
    }

    pub fn stash_pop(&self, handle: &StashHandle) -> Result<()> {
        let refname = self
            .stash_ref_for(handle)?
            .ok_or_else(|| anyhow!("stash {} is no longer in the stash list", handle.commit))?;
        let output = self.run(&["stash", "pop", &refname], None)?;
        if !output.success {
            anyhow::bail!("git stash pop failed: {}", output.stderr.trim());
        }
        Ok(())
    }

    /// Apply without dropping; works from the raw commit even if the reflog
    /// entry is gone.
    pub fn stash_apply(&self, handle: &StashHandle) -> Result<()> {
        let output = self.run(&["stash", "apply", &handle.commit], None)?;
        if !output.success {
            anyhow::bail!("git stash apply failed: {}", output.stderr.trim());
        }
        Ok(())
    }

    pub fn stash_drop(&self, handle: &StashHandle) -> Result<()> {
        let Some(refname) = self.stash_ref_for(handle)? else {
            return Ok(());
        };
        let output = self.run(&["stash", "drop", &refname], None)?;
        if !output.success {
            anyhow::bail!("git stash drop failed: {}", output.stderr.trim());
        }
        Ok(())
    }
}

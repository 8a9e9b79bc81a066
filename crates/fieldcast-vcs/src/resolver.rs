use std::time::Duration;

use anyhow::{Context, Result};
use fieldcast_core::{failure, CancelToken, FailureCode};
use semver::Version;

use crate::git::GitCli;

pub const LATEST_STABLE_ALIAS: &str = "latest-stable";
pub const LATEST_DEV_ALIAS: &str = "latest-dev";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Tag,
    LocalBranch,
    RemoteBranch,
    Commit,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tag => "tag",
            Self::LocalBranch => "local-branch",
            Self::RemoteBranch => "remote-branch",
            Self::Commit => "commit",
        }
    }
}

/// A validated switch target. `refname` is the argument handed to checkout;
/// `resolved_commit` is the full commit id used for post-checkout
/// verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionTarget {
    pub raw_input: String,
    pub kind: TargetKind,
    pub refname: String,
    pub resolved_commit: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Candidates {
    pub tags: Vec<String>,
    pub branches: Vec<String>,
}

pub struct VersionResolver<'a> {
    git: &'a GitCli,
    remote: String,
    development_branch: String,
    stable_tag_prefix: String,
}

impl<'a> VersionResolver<'a> {
    pub fn new(
        git: &'a GitCli,
        remote: impl Into<String>,
        development_branch: impl Into<String>,
        stable_tag_prefix: impl Into<String>,
    ) -> Self {
        Self {
            git,
            remote: remote.into(),
            development_branch: development_branch.into(),
            stable_tag_prefix: stable_tag_prefix.into(),
        }
    }

    /// Fetch refs and tags from the remote with pruning, retrying a bounded
    /// number of times. Exhausting the retries yields a `network-error`
    /// failure; the caller decides whether cached refs are good enough and
    /// must warn the operator if it proceeds on them.
    pub fn fetch_remote(
        &self,
        timeout: Duration,
        retries: u32,
        retry_delay: Duration,
        cancel: &CancelToken,
    ) -> Result<()> {
        let attempts = retries.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            cancel.check("remote fetch")?;
            match self.git.fetch(&self.remote, timeout) {
                Ok(()) => return Ok(()),
                Err(err) => last_error = Some(err),
            }
            if attempt < attempts {
                std::thread::sleep(retry_delay);
            }
        }
        let detail = last_error
            .map(|err| format!("{err:#}"))
            .unwrap_or_else(|| "unknown fetch failure".to_string());
        Err(failure(
            FailureCode::NetworkError,
            format!(
                "fetch from '{}' failed after {} attempts: {}",
                self.remote, attempts, detail
            ),
        ))
    }

    /// Resolve operator input to a concrete target. Resolution order is
    /// fixed: alias, then tag, local branch, remote branch, raw commit id.
    /// A name matching both a tag and a branch resolves tag-first.
    pub fn resolve(&self, input: &str) -> Result<VersionTarget> {
        let input = input.trim();
        if input.is_empty() {
            return Err(failure(FailureCode::NotFound, "empty version target"));
        }

        if input == LATEST_STABLE_ALIAS {
            let tag = self.latest_stable_tag()?.ok_or_else(|| {
                failure(
                    FailureCode::NotFound,
                    format!(
                        "no stable release tags matching '{}<semver>' exist",
                        self.stable_tag_prefix
                    ),
                )
            })?;
            return self.resolve_tag(input, &tag);
        }
        if input == LATEST_DEV_ALIAS {
            let branch = self.development_branch.clone();
            return self.resolve_branch_like(input, &branch);
        }

        if self.git.tag_exists(input)? {
            return self.resolve_tag(input, input);
        }
        self.resolve_branch_like(input, input)
    }

    fn resolve_tag(&self, raw_input: &str, tag: &str) -> Result<VersionTarget> {
        let resolved_commit = self.git.rev_parse(tag)?;
        Ok(VersionTarget {
            raw_input: raw_input.to_string(),
            kind: TargetKind::Tag,
            refname: tag.to_string(),
            resolved_commit,
        })
    }

    fn resolve_branch_like(&self, raw_input: &str, name: &str) -> Result<VersionTarget> {
        if self.git.local_branch_exists(name)? {
            let resolved_commit = self.git.rev_parse(name)?;
            return Ok(VersionTarget {
                raw_input: raw_input.to_string(),
                kind: TargetKind::LocalBranch,
                refname: name.to_string(),
                resolved_commit,
            });
        }
        if self.git.remote_branch_exists(&self.remote, name)? {
            let remote_ref = format!("{}/{}", self.remote, name);
            let resolved_commit = self.git.rev_parse(&remote_ref)?;
            return Ok(VersionTarget {
                raw_input: raw_input.to_string(),
                kind: TargetKind::RemoteBranch,
                refname: remote_ref,
                resolved_commit,
            });
        }
        if looks_like_commit_id(name) {
            if let Some(resolved_commit) = self.git.try_rev_parse(name)? {
                return Ok(VersionTarget {
                    raw_input: raw_input.to_string(),
                    kind: TargetKind::Commit,
                    refname: resolved_commit.clone(),
                    resolved_commit,
                });
            }
        }
        Err(failure(
            FailureCode::NotFound,
            format!("'{name}' is not a known tag, branch, or commit"),
        ))
    }

    /// Tags and branches the operator can switch to, ordered by recency.
    pub fn list_candidates(&self) -> Result<Candidates> {
        Ok(Candidates {
            tags: self.git.tags_by_recency().context("failed listing tags")?,
            branches: self
                .git
                .branches_by_recency(&self.remote)
                .context("failed listing branches")?,
        })
    }

    /// Highest semver-ordered tag carrying the stable prefix. Tags whose
    /// bodies do not parse as semver are ignored rather than guessed at.
    pub fn latest_stable_tag(&self) -> Result<Option<String>> {
        let mut best: Option<(Version, String)> = None;
        for tag in self.git.tags_by_recency()? {
            let Some(body) = tag.strip_prefix(&self.stable_tag_prefix) else {
                continue;
            };
            let Ok(version) = Version::parse(body) else {
                continue;
            };
            if !version.pre.is_empty() {
                continue;
            }
            let better = match &best {
                Some((current, _)) => version > *current,
                None => true,
            };
            if better {
                best = Some((version, tag));
            }
        }
        Ok(best.map(|(_, tag)| tag))
    }
}

fn looks_like_commit_id(input: &str) -> bool {
    input.len() >= 4 && input.len() <= 40 && input.chars().all(|ch| ch.is_ascii_hexdigit())
}

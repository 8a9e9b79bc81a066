mod git;
mod resolver;
mod state;

pub use git::{CommandOutput, GitCli, GitRunner, StashHandle, SystemGitRunner};
pub use resolver::{
    Candidates, TargetKind, VersionResolver, VersionTarget, LATEST_DEV_ALIAS, LATEST_STABLE_ALIAS,
};
pub use state::RepoState;

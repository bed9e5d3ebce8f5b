use std::path::PathBuf;

use clap::Parser;

/// Live terminal visualization of a repository's branch topology.
#[derive(Parser)]
#[command(version, author = "Waleed Khan <me@waleedkhan.name>")]
pub struct Opts {
    /// Repository to visualize. Defaults to the current directory.
    pub path: Option<PathBuf>,

    /// Keep refreshing as the repository changes, instead of printing once
    /// and exiting.
    #[arg(short, long)]
    pub watch: bool,

    /// Only show local branches; skip remote-tracking sync state.
    #[arg(short, long)]
    pub local: bool,

    /// Path to the version-control binary to invoke.
    #[arg(long, default_value = "git")]
    pub git_executable: PathBuf,
}

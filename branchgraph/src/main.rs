//! Entry point: discovers the repository, builds the reactive branch model,
//! and either prints one frame or drives a continuous refresh loop.

mod cli;
mod render;

use clap::Parser;
use lib::git::Repository;
use lib::kernel::{self, Cell, CellError};
use lib::layout::{branch_order, layout};
use lib::process::{discover_git_dir, VcsRunner};

use cli::Opts;

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let _tracing_guard = install_tracing();

    let opts = Opts::parse();
    let start_dir = match &opts.path {
        Some(path) => path.clone(),
        None => std::env::current_dir()?,
    };

    let git_dir = discover_git_dir(&opts.git_executable, &start_dir)?;
    let runner = VcsRunner::new(opts.git_executable.clone(), start_dir.clone());
    let repository = Repository::new(runner, git_dir);

    let local_only = opts.local;
    let frame: Cell<String> = Cell::new(move || Ok(render_frame(&repository, local_only)));

    if opts.watch {
        let mut first = true;
        kernel::drive(
            &frame,
            |result| print_frame(result, &mut first),
            || false,
        );
        Ok(())
    } else {
        let mut first = true;
        print_frame(frame.read(), &mut first);
        Ok(())
    }
}

fn print_frame(result: Result<String, CellError>, first: &mut bool) {
    if !*first {
        print!("\x1B[2J\x1B[H");
    }
    *first = false;
    match result {
        Ok(text) => println!("{text}"),
        Err(error) => eprintln!("error: {error}"),
    }
}

fn render_frame(repository: &Repository, local_only: bool) -> String {
    let branches = match repository.relevant_branches() {
        Ok(branches) => branches,
        Err(error) => return format!("error listing branches: {error}"),
    };
    let head = repository.head().ok().flatten();
    let sync_state = if local_only {
        Default::default()
    } else {
        repository.remote_sync_state().unwrap_or_default()
    };

    let ordered = branch_order(branches);
    let rows = layout(&ordered);

    let mut out = String::new();
    for (branch, row) in ordered.iter().zip(rows.iter()) {
        let is_head = head.as_ref() == Some(branch);
        let in_sync = sync_state.get(branch.name()).copied();
        let unmerged = branch.unmerged().unwrap_or(0);
        let line = render::render_line(row, branch.name(), is_head, in_sync, &[], unmerged);
        out.push_str(&line);
        out.push('\n');
    }
    if out.ends_with('\n') {
        out.pop();
    }
    out
}

#[must_use]
fn install_tracing() -> impl Drop {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    struct Guard;
    impl Drop for Guard {
        fn drop(&mut self) {}
    }

    if let Ok(filter_layer) = EnvFilter::try_from_default_env() {
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt::layer().with_target(false))
            .init();
    }
    Guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_frame_on_an_empty_directory_reports_an_error_without_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let runner = VcsRunner::new("git", dir.path());
        let repository = Repository::new(runner, dir.path().to_path_buf());
        let frame = render_frame(&repository, false);
        assert!(frame.contains("error"));
    }

    #[test]
    fn drive_stops_immediately_when_should_stop_is_true() {
        let cell: Cell<i32> = Cell::new(|| Ok(1));
        let mut ticks = 0;
        kernel::drive(
            &cell,
            |_| ticks += 1,
            || true,
        );
        assert_eq!(ticks, 1);
    }
}

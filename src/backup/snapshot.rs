//! Package-list and disk-information snapshots added to a backup.

use crate::backup::context::AppContext;
use crate::backup::fs_util::remove_logged;
use crate::backup::options::OperationOptions;
use crate::backup::process::{CommandLine, ProcessRunner};
use crate::backup::result_error::result::Result;
use std::path::{Path, PathBuf};

/// Produces temporary files that are backed up along with the configured paths and
/// deleted afterwards.
pub trait SnapshotCollector: Send + Sync {
    fn collect_snapshots(
        &self,
        options: &OperationOptions,
        app: &AppContext,
        runner: &ProcessRunner,
    ) -> Result<Vec<PathBuf>>;
}

/// `(binary, arguments, file label)` of each package manager listing.
const PACKAGE_LISTERS: [(&str, &[&str], &str); 3] = [
    ("rpm", &["-qa"], "rpm - Package list"),
    ("pacman", &["-Qq"], "Pacman - Package list"),
    ("dpkg", &["-l"], "dpkg - Package list"),
];

/// Lists packages with every package manager found on `PATH` and dumps `fdisk -l`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemSnapshots;

impl SystemSnapshots {
    fn capture(
        app: &AppContext,
        runner: &ProcessRunner,
        program: &Path,
        args: &[&str],
        label: &str,
    ) -> Result<PathBuf> {
        let (file, path) = tempfile::Builder::new()
            .prefix(&format!("{label} - tmp"))
            .suffix(".txt")
            .tempfile_in(app.temp_dir())?
            .keep()
            .map_err(|e| e.error)?;

        let exit = match runner.run(&CommandLine::argv(program).args(args), Some(file)) {
            Ok(exit) => exit,
            Err(e) => {
                remove_logged(&path);
                return Err(e);
            }
        };
        if !exit.success() {
            tracing::warn!(
                "{:?} exited with status {:?} while writing {}",
                program,
                exit.code,
                label
            );
        }
        Ok(path)
    }

    fn capture_requested(
        options: &OperationOptions,
        app: &AppContext,
        runner: &ProcessRunner,
        files: &mut Vec<PathBuf>,
    ) -> Result<()> {
        if *options.package_lists() {
            for (binary, args, label) in PACKAGE_LISTERS {
                if let Some(program) = app.find_executable(binary) {
                    tracing::debug!("Writing the {} package list", binary);
                    files.push(Self::capture(app, runner, &program, args, label)?);
                }
            }
        }
        if *options.disk_info() {
            match app.find_executable("fdisk") {
                Some(fdisk) => files.push(Self::capture(
                    app,
                    runner,
                    &fdisk,
                    &["-l"],
                    "Disk Information",
                )?),
                None => tracing::warn!("fdisk was not found, no disk information is saved"),
            }
        }
        Ok(())
    }
}

impl SnapshotCollector for SystemSnapshots {
    /// Files written before a failing capture are deleted before the error is returned.
    fn collect_snapshots(
        &self,
        options: &OperationOptions,
        app: &AppContext,
        runner: &ProcessRunner,
    ) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        if let Err(e) = Self::capture_requested(options, app, runner, &mut files) {
            delete_snapshots(&files);
            return Err(e);
        }
        Ok(files)
    }
}

/// Best-effort removal of snapshot files once the engine ran.
pub fn delete_snapshots(files: &[PathBuf]) {
    files.iter().for_each(|file| {
        remove_logged(file);
    });
}

use crate::backup::compress::Compression;
use crate::backup::engine::{policy_args, record_tool_exit, skip_if_missing, BackupReport, EngineContext};
use crate::backup::process::CommandLine;
use crate::backup::progress::OperationStatus;
use crate::backup::result_error::result::Result;
use std::path::{Path, PathBuf};

fn tar_args(ctx: &EngineContext) -> Vec<String> {
    let mut args = policy_args(ctx.options, "--no-recursion");
    if *ctx.options.follow_links() {
        args.push("-h".to_string());
    }
    args
}

fn tar_command(tar: &Path, ctx: &EngineContext, mode: &[&str], archive: &Path) -> CommandLine {
    CommandLine::argv(tar)
        .args(mode)
        .arg("-f")
        .arg(archive)
        .args(tar_args(ctx))
}

/// Plain `.tar`: appended to once per path so each path is a progress step and a
/// cancellation checkpoint.
#[derive(Clone, Debug)]
pub struct TarEngine {
    tar: PathBuf,
}

impl TarEngine {
    pub fn new(tar: PathBuf) -> Self {
        Self { tar }
    }

    pub fn run(&self, ctx: &EngineContext, paths: &[PathBuf]) -> Result<BackupReport> {
        let archive = ctx.target.local_artifact_path();
        let mut report = BackupReport::default();
        ctx.progress.enter(OperationStatus::BackingUp, paths.len());

        for (i, path) in paths.iter().enumerate() {
            ctx.cancel.checkpoint()?;
            ctx.progress.advance(i + 1, path.to_string_lossy());
            if skip_if_missing(path, &mut report) {
                continue;
            }

            let command = tar_command(&self.tar, ctx, &["-r"], &archive)
                .arg(path)
                .with_nice(ctx.app.tools().nice().as_deref(), *ctx.options.nice());
            let exit = ctx.runner.run(&command, None)?;
            ctx.cancel.checkpoint()?;
            record_tool_exit("tar", path, exit, &mut report);
        }
        Ok(report)
    }
}

/// `.tar.gz` / `.tar.bz2`: compressed archives cannot be appended to, so every path goes
/// into a single invocation. Progress is one unit; cancellation is only checked around it.
#[derive(Clone, Debug)]
pub struct CompressedTarEngine {
    tar: PathBuf,
    compression: Compression,
}

impl CompressedTarEngine {
    pub fn new(tar: PathBuf, compression: Compression) -> Self {
        Self { tar, compression }
    }

    fn compression_flag(&self) -> &'static str {
        match self.compression {
            Compression::Gzip => "-z",
            Compression::Bzip2 => "-j",
            Compression::None => "",
        }
    }

    pub fn run(&self, ctx: &EngineContext, paths: &[PathBuf]) -> Result<BackupReport> {
        let archive = ctx.target.local_artifact_path();
        let mut report = BackupReport::default();
        ctx.progress.enter(OperationStatus::BackingUp, 1);

        let existing: Vec<&PathBuf> = paths
            .iter()
            .filter(|path| !skip_if_missing(path, &mut report))
            .collect();
        if existing.is_empty() {
            tracing::error!("None of the paths to back up exist, no archive was created");
            report.mark_general_failure();
            return Ok(report);
        }

        ctx.cancel.checkpoint()?;
        ctx.progress.advance(1, "");
        let mode: Vec<&str> = ["-c", self.compression_flag()]
            .into_iter()
            .filter(|flag| !flag.is_empty())
            .collect();
        let command = tar_command(&self.tar, ctx, &mode, &archive)
            .args(existing.iter())
            .with_nice(ctx.app.tools().nice().as_deref(), *ctx.options.nice());
        let exit = ctx.runner.run(&command, None)?;
        ctx.cancel.checkpoint()?;

        let batch = Path::new(ctx.target.artifact_name());
        record_tool_exit("tar", batch, exit, &mut report);
        Ok(report)
    }
}

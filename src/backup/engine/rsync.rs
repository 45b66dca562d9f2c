use crate::backup::engine::{policy_args, record_tool_exit, skip_if_missing, BackupReport, EngineContext};
use crate::backup::options::OperationOptions;
use crate::backup::process::CommandLine;
use crate::backup::progress::OperationStatus;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use std::path::PathBuf;

/// Local mirror through the `rsync` binary, one invocation per path. `-R` keeps each
/// source's full path below the artifact directory.
#[derive(Clone, Debug)]
pub struct RsyncEngine {
    rsync: PathBuf,
    incremental: bool,
}

fn rsync_args(options: &OperationOptions, incremental: bool) -> Vec<String> {
    let mut args: Vec<String> = ["-g", "-o", "-p", "-t", "-R"]
        .into_iter()
        .map(String::from)
        .collect();
    if incremental {
        args.push("-u".to_string());
        args.push("--del".to_string());
    }
    if *options.recursive() {
        args.push("-r".to_string());
    }
    args.push(if *options.follow_links() { "-L" } else { "-l" }.to_string());
    args.extend(policy_args(options, ""));
    args
}

impl RsyncEngine {
    pub fn new(rsync: PathBuf, incremental: bool) -> Self {
        Self { rsync, incremental }
    }

    pub fn run(&self, ctx: &EngineContext, paths: &[PathBuf]) -> Result<BackupReport> {
        let artifact = ctx.target.local_artifact_path();
        std::fs::create_dir_all(&artifact)
            .map_err(Error::from)
            .add_msg(format!("Creating mirror folder {:?} failed", artifact))?;
        let args = rsync_args(ctx.options, self.incremental);
        let mut report = BackupReport::default();
        ctx.progress.enter(OperationStatus::BackingUp, paths.len());

        for (i, path) in paths.iter().enumerate() {
            ctx.cancel.checkpoint()?;
            ctx.progress.advance(i + 1, path.to_string_lossy());
            if skip_if_missing(path, &mut report) {
                continue;
            }

            let command = CommandLine::argv(&self.rsync)
                .args(&args)
                .arg(path)
                .arg(&artifact)
                .with_nice(ctx.app.tools().nice().as_deref(), *ctx.options.nice());
            let exit = ctx.runner.run(&command, None)?;
            ctx.cancel.checkpoint()?;
            record_tool_exit("rsync", path, exit, &mut report);
        }
        Ok(report)
    }
}

use crate::backup::engine::{skip_if_missing, BackupReport, EngineContext};
use crate::backup::exclude::WalkPolicy;
use crate::backup::progress::OperationStatus;
use crate::backup::remote::connect_timeout;
use crate::backup::result_error::result::Result;
use std::path::{Path, PathBuf};

/// Mirror to a remote destination: each path is pushed over SFTP into
/// `<remote folder>/<artifact>/<parent folder of the source>`.
#[derive(Clone, Copy, Debug, Default)]
pub struct RemoteMirrorEngine;

fn remote_parent(artifact_root: &Path, path: &Path) -> PathBuf {
    crate::backup::fs_util::join_full_path(artifact_root, path.parent().unwrap_or(Path::new("/")))
}

impl RemoteMirrorEngine {
    pub fn run(&self, ctx: &EngineContext, paths: &[PathBuf]) -> Result<BackupReport> {
        let mut report = BackupReport::default();
        let (Some((server, _)), Some(artifact_root)) =
            (ctx.target.remote(), ctx.target.remote_artifact_path())
        else {
            report.mark_general_failure();
            return Ok(report);
        };
        let policy = WalkPolicy::from_options(ctx.options)?;
        ctx.progress.enter(OperationStatus::BackingUp, paths.len());

        let mut session = ctx.transport.connect(server, connect_timeout(server))?;
        for (i, path) in paths.iter().enumerate() {
            ctx.cancel.checkpoint()?;
            ctx.progress.advance(i + 1, path.to_string_lossy());
            if skip_if_missing(path, &mut report) {
                continue;
            }
            let remote_folder = remote_parent(&artifact_root, path);
            if let Err(e) = session.put(path, &remote_folder, &policy) {
                tracing::error!(
                    "Sending {:?} to {} failed:\n{}",
                    path,
                    server.host(),
                    indent::indent_all_with("  ", e.to_string())
                );
                report.mark_failed(path);
            }
        }
        Ok(report)
    }
}

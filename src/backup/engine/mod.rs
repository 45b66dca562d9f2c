//! Backup engines: turn a path list plus options into an artifact.
//!
//! Archive engines (`tar`, `tar.gz`, `tar.bz2`) write a single file, mirror engines
//! (`rsync`, the copy fallback, and the SFTP push) write a directory tree. The engine is
//! chosen once per run by [`Engine::select`].

pub mod copy;
pub mod native_tar;
pub mod remote_mirror;
pub mod rsync;
pub mod tar_command;

use crate::backup::cancel::CancellationToken;
use crate::backup::compress::Compression;
use crate::backup::context::AppContext;
use crate::backup::engine::copy::CopyFallbackEngine;
use crate::backup::engine::native_tar::NativeTarEngine;
use crate::backup::engine::remote_mirror::RemoteMirrorEngine;
use crate::backup::engine::rsync::RsyncEngine;
use crate::backup::engine::tar_command::{CompressedTarEngine, TarEngine};
use crate::backup::exclude::{ExcludeSet, WalkPolicy};
use crate::backup::options::{EngineKind, OperationOptions};
use crate::backup::process::{ExitClass, ProcessExit, ProcessRunner};
use crate::backup::progress::{OperationStatus, ProgressTracker};
use crate::backup::remote::{connect_timeout, RemoteTransport};
use crate::backup::result_error::result::Result;
use crate::backup::target::BackupTarget;
use getset::Getters;
use std::path::{Path, PathBuf};

/// Everything an engine needs for one run, borrowed from the controller.
pub struct EngineContext<'a> {
    pub options: &'a OperationOptions,
    pub target: &'a BackupTarget,
    pub app: &'a AppContext,
    pub runner: &'a ProcessRunner,
    pub progress: &'a ProgressTracker,
    pub cancel: &'a CancellationToken,
    pub transport: &'a dyn RemoteTransport,
}

/// Per-path outcome of an engine run. Any failed path makes the run unsuccessful; skipped
/// (missing) paths do not.
#[derive(Clone, Debug, Default, Getters)]
#[getset(get = "pub")]
pub struct BackupReport {
    failed: Vec<PathBuf>,
    skipped: Vec<PathBuf>,
    /// Set by failures that do not belong to a single path, e.g. an upload
    general_failure: bool,
}

impl BackupReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.general_failure
    }

    pub fn mark_failed<P: Into<PathBuf>>(&mut self, path: P) {
        self.failed.push(path.into());
    }

    pub fn mark_skipped<P: Into<PathBuf>>(&mut self, path: P) {
        self.skipped.push(path.into());
    }

    pub fn mark_general_failure(&mut self) {
        self.general_failure = true;
    }
}

/// Logs a vanished path and records it as skipped. Returns true when `path` is gone.
pub(crate) fn skip_if_missing(path: &Path, report: &mut BackupReport) -> bool {
    if std::fs::symlink_metadata(path).is_err() {
        tracing::warn!("{:?} does not exist anymore, skipping it", path);
        report.mark_skipped(path);
        true
    } else {
        false
    }
}

/// Applies the tar/rsync exit code policy to `exit`: 2 is logged as a warning, any
/// other non-zero code as an error that fails `path`.
pub(crate) fn record_tool_exit(tool: &str, path: &Path, exit: ProcessExit, report: &mut BackupReport) {
    match exit.classify() {
        ExitClass::Success => {}
        ExitClass::Warning => tracing::warn!(
            "{} reported a non-fatal problem while backing up {:?}:\n{}",
            tool,
            path,
            indent::indent_all_with("  ", exit.stderr)
        ),
        ExitClass::Failure => {
            tracing::error!(
                "{} failed while backing up {:?} with exit code {}:\n{}",
                tool,
                path,
                exit.code.map_or("<signal>".to_string(), |c| c.to_string()),
                indent::indent_all_with("  ", exit.stderr)
            );
            report.mark_failed(path);
        }
    }
}

/// The `--exclude`/recursion/hidden/sparse/symlink arguments shared by tar and rsync.
pub(crate) fn policy_args(options: &OperationOptions, no_recursion: &str) -> Vec<String> {
    let mut args = Vec::new();
    if !*options.recursive() && !no_recursion.is_empty() {
        args.push(no_recursion.to_string());
    }
    if !*options.include_hidden() {
        args.push("--exclude=.*".to_string());
    }
    if *options.sparse() {
        args.push("-S".to_string());
    }
    args.extend(
        options
            .excludes()
            .iter()
            .map(|pattern| format!("--exclude={}", pattern)),
    );
    args
}

#[derive(Clone, Debug)]
pub enum Engine {
    Tar(TarEngine),
    TarGz(CompressedTarEngine),
    TarBz2(CompressedTarEngine),
    NativeTar(NativeTarEngine),
    Rsync(RsyncEngine),
    CopyFallback(CopyFallbackEngine),
    RemoteMirror(RemoteMirrorEngine),
}

impl Engine {
    /// Picks the engine for `options`, falling back to in-process engines when the
    /// external tool is not available.
    pub fn select(options: &OperationOptions, app: &AppContext, incremental: bool) -> Self {
        let tools = app.tools();
        match (options.engine(), options.destination().is_remote()) {
            (EngineKind::Rsync, true) => Engine::RemoteMirror(RemoteMirrorEngine),
            (EngineKind::Rsync, false) => match tools.rsync() {
                Some(rsync) => Engine::Rsync(RsyncEngine::new(rsync.clone(), incremental)),
                None => Engine::CopyFallback(CopyFallbackEngine::new(incremental)),
            },
            (kind, _) => {
                let compression = Compression::for_engine(*kind).unwrap_or(Compression::None);
                match (tools.tar(), compression) {
                    (Some(tar), Compression::None) => Engine::Tar(TarEngine::new(tar.clone())),
                    (Some(tar), Compression::Gzip) => {
                        Engine::TarGz(CompressedTarEngine::new(tar.clone(), compression))
                    }
                    (Some(tar), Compression::Bzip2) => {
                        Engine::TarBz2(CompressedTarEngine::new(tar.clone(), compression))
                    }
                    (None, compression) => Engine::NativeTar(NativeTarEngine::new(compression)),
                }
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Engine::Tar(_) => "tar",
            Engine::TarGz(_) => "tar.gz",
            Engine::TarBz2(_) => "tar.bz2",
            Engine::NativeTar(_) => "built-in tar",
            Engine::Rsync(_) => "rsync",
            Engine::CopyFallback(_) => "copy",
            Engine::RemoteMirror(_) => "sftp mirror",
        }
    }

    pub fn is_archive(&self) -> bool {
        matches!(
            self,
            Engine::Tar(_) | Engine::TarGz(_) | Engine::TarBz2(_) | Engine::NativeTar(_)
        )
    }

    /// Produces the artifact for `paths`. Archives for remote targets are built in the
    /// staging folder, then uploaded and deleted locally.
    pub fn run(&self, ctx: &EngineContext, paths: &[PathBuf]) -> Result<BackupReport> {
        tracing::info!("Backing up {} path(s) with the {} engine", paths.len(), self.name());
        let mut report = match self {
            Engine::Tar(engine) => engine.run(ctx, paths)?,
            Engine::TarGz(engine) | Engine::TarBz2(engine) => engine.run(ctx, paths)?,
            Engine::NativeTar(engine) => engine.run(ctx, paths)?,
            Engine::Rsync(engine) => engine.run(ctx, paths)?,
            Engine::CopyFallback(engine) => engine.run(ctx, paths)?,
            Engine::RemoteMirror(engine) => engine.run(ctx, paths)?,
        };

        if self.is_archive() && ctx.target.is_remote() {
            ctx.cancel.checkpoint()?;
            send_archive_to_remote(ctx, &mut report)?;
        }
        Ok(report)
    }
}

/// Uploads the staged archive and deletes the local copy. An upload failure fails the
/// run but is not an internal error.
fn send_archive_to_remote(ctx: &EngineContext, report: &mut BackupReport) -> Result<()> {
    let Some((server, folder)) = ctx.target.remote() else {
        return Ok(());
    };
    let archive = ctx.target.local_artifact_path();
    ctx.progress.enter(OperationStatus::SendingToRemote, 1);
    ctx.progress.advance(1, ctx.target.artifact_name().as_str());

    if !archive.exists() {
        tracing::error!("No archive was produced at {:?}, nothing to send", archive);
        report.mark_general_failure();
        return Ok(());
    }

    let everything = WalkPolicy::new(true, true, false, ExcludeSet::empty());
    let upload = ctx
        .transport
        .connect(server, connect_timeout(server))
        .and_then(|mut session| session.put(&archive, folder, &everything));
    if let Err(e) = upload {
        if e.is_cancelled() {
            return Err(e);
        }
        tracing::error!("Sending {:?} to {} failed: {}", archive, server.host(), e);
        report.mark_general_failure();
    } else {
        tracing::info!("Sent {} to {}:{:?}", ctx.target.artifact_name(), server.host(), folder);
    }

    if let Err(e) = std::fs::remove_file(&archive) {
        tracing::warn!("Could not delete the local archive {:?}: {}", archive, e);
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::backup::process::registry::ProcessRegistry;
    use crate::backup::remote::testing::LocalDirTransport;
    use chrono::{Local, TimeZone};

    /// Owns everything an [`EngineContext`] borrows.
    pub struct Fixture {
        pub options: OperationOptions,
        pub target: BackupTarget,
        pub app: AppContext,
        pub runner: ProcessRunner,
        pub progress: ProgressTracker,
        pub cancel: CancellationToken,
        pub transport: LocalDirTransport,
    }

    impl Fixture {
        pub fn new(options: OperationOptions, app: AppContext, transport: LocalDirTransport) -> Self {
            let timestamp = Local.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
            let target = BackupTarget::resolve("Test", &timestamp, &options, &app);
            let cancel = CancellationToken::new();
            let runner = ProcessRunner::new(
                app.search_path().clone(),
                ProcessRegistry::new(),
                cancel.clone(),
            );
            Self {
                options,
                target,
                app,
                runner,
                progress: ProgressTracker::new(),
                cancel,
                transport,
            }
        }

        pub fn context(&self) -> EngineContext<'_> {
            EngineContext {
                options: &self.options,
                target: &self.target,
                app: &self.app,
                runner: &self.runner,
                progress: &self.progress,
                cancel: &self.cancel,
                transport: &self.transport,
            }
        }
    }

    /// A temp folder without a leading dot, so hidden-file excludes do not match it.
    pub fn temp_dir() -> tempfile::TempDir {
        tempfile::Builder::new()
            .prefix("pbackup-test")
            .tempdir()
            .unwrap()
    }

    /// Names of the members of the (possibly compressed) tar archive at `path`.
    pub fn archive_members(path: &Path) -> Vec<String> {
        let file = std::fs::File::open(path).unwrap();
        let reader = crate::backup::compress::Decompressor::detect(file).unwrap();
        let mut archive = tar::Archive::new(reader);
        let mut names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|entry| {
                entry
                    .unwrap()
                    .path()
                    .unwrap()
                    .to_string_lossy()
                    .trim_end_matches('/')
                    .to_string()
            })
            .collect();
        names.sort();
        names
    }
}

use crate::backup::commands::{run_user_command, CommandStage, CommandTokens};
use crate::backup::context::AppContext;
use crate::backup::engine::{Engine, EngineContext};
use crate::backup::fs_util::rmtree_best_effort;
use crate::backup::operation::{
    check_remote_server, prepare_destination_folder, OperationHandle, OperationResult,
    RemoteExpectation,
};
use crate::backup::options::OperationOptions;
use crate::backup::process::ProcessRunner;
use crate::backup::progress::OperationStatus;
use crate::backup::remote::sftp::SftpTransport;
use crate::backup::remote::{connect_timeout, RemoteTransport};
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use crate::backup::retention::{RetentionManager, RetentionPolicy};
use crate::backup::snapshot::{delete_snapshots, SnapshotCollector, SystemSnapshots};
use crate::backup::target::{BackupTarget, TargetLocation, ONE_TIME_LABEL, TIMESTAMP_FORMAT};
use crate::backup::validate::validate_set_name;
use chrono::{DateTime, Local};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use validator::{Validate, ValidationErrors};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackupKind {
    /// A named, configured set. `force` runs it even when disabled.
    Set { name: String, force: bool },
    OneTime,
}

impl BackupKind {
    pub fn set<S: Into<String>>(name: S, force: bool) -> Self {
        BackupKind::Set {
            name: name.into(),
            force,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            BackupKind::Set { name, .. } => name,
            BackupKind::OneTime => ONE_TIME_LABEL,
        }
    }

    pub fn is_set(&self) -> bool {
        matches!(self, BackupKind::Set { .. })
    }
}

/// One backup run of a set or of a one-time configuration.
pub struct BackupOperation {
    kind: BackupKind,
    options: OperationOptions,
    app: Arc<AppContext>,
    timestamp: DateTime<Local>,
    target: BackupTarget,
    engine: Engine,
    incremental: bool,
    transport: Arc<dyn RemoteTransport>,
    snapshots: Arc<dyn SnapshotCollector>,
    handle: OperationHandle,
}

impl BackupOperation {
    pub fn new(kind: BackupKind, options: OperationOptions, app: Arc<AppContext>) -> Result<Self> {
        Self::new_at(kind, options, app, Local::now())
    }

    /// Like [`BackupOperation::new`] with an explicit run timestamp, which names the artifact.
    pub fn new_at(
        kind: BackupKind,
        options: OperationOptions,
        app: Arc<AppContext>,
        timestamp: DateTime<Local>,
    ) -> Result<Self> {
        options.validate()?;
        if let BackupKind::Set { name, .. } = &kind {
            if let Err(e) = validate_set_name(name) {
                let mut errors = ValidationErrors::new();
                errors.add("set", e);
                return Err(errors.into());
            }
        }

        let target = BackupTarget::resolve(kind.label(), &timestamp, &options, &app);
        let incremental = kind.is_set() && options.incremental_applies();
        let engine = Engine::select(&options, &app, incremental);
        tracing::debug!(
            "Backup {} will produce {} with the {} engine",
            kind.label(),
            target.artifact_name(),
            engine.name()
        );

        Ok(Self {
            kind,
            options,
            app,
            timestamp,
            target,
            engine,
            incremental,
            transport: Arc::new(SftpTransport),
            snapshots: Arc::new(SystemSnapshots),
            handle: OperationHandle::new(),
        })
    }

    pub fn with_transport(mut self, transport: Arc<dyn RemoteTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_snapshot_collector(mut self, snapshots: Arc<dyn SnapshotCollector>) -> Self {
        self.snapshots = snapshots;
        self
    }

    pub fn handle(&self) -> OperationHandle {
        self.handle.clone()
    }

    pub fn target(&self) -> &BackupTarget {
        &self.target
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Runs the backup on a new thread.
    pub fn spawn(self) -> (OperationHandle, JoinHandle<OperationResult>) {
        let handle = self.handle();
        let worker = std::thread::spawn(move || self.start());
        (handle, worker)
    }

    /// Runs the backup on the calling thread and returns (and publishes) its result.
    pub fn start(&self) -> OperationResult {
        if let BackupKind::Set { name, force } = &self.kind {
            if !*self.options.enabled() && !force {
                tracing::info!("Set {} is disabled, skipping it", name);
                return self.handle.publish(OperationResult::Success);
            }
        }

        tracing::info!("Starting backup {}", self.kind.label());
        let runner = self.handle.runner(&self.app);
        let outcome = self.run_backup(&runner);
        let result = self.handle.resolve("backup", outcome);

        if self.engine.is_archive() {
            if let TargetLocation::Remote { .. } = self.target.location() {
                let staged = self.target.local_artifact_path();
                if std::fs::symlink_metadata(&staged).is_ok() {
                    tracing::debug!("Removing leftover staging archive {:?}", staged);
                    rmtree_best_effort(&staged, |path, e| {
                        tracing::warn!("Could not remove {:?}: {}", path, e)
                    });
                }
            }
        }

        if result != OperationResult::Cancelled {
            if let Some(command) = self.options.command_after() {
                self.run_after_command(&runner, command, result.is_success());
            }
        }

        tracing::info!("Finished backup {}: {}", self.kind.label(), result);
        self.handle.publish(result)
    }

    fn tokens(&self) -> Result<CommandTokens> {
        CommandTokens::for_backup(
            &self.target,
            &self.timestamp.format(TIMESTAMP_FORMAT).to_string(),
        )
    }

    fn run_after_command(&self, runner: &ProcessRunner, command: &str, successful: bool) {
        let ran = self.tokens().and_then(|tokens| {
            run_user_command(
                runner,
                self.handle.progress(),
                CommandStage::After,
                command,
                &tokens.with_successful(successful),
            )
        });
        if let Err(e) = ran {
            tracing::error!("The after command could not be run: {}", e);
        }
    }

    /// The body of a run. `Ok(false)` means a failure was already logged.
    fn run_backup(&self, runner: &ProcessRunner) -> Result<bool> {
        let progress = self.handle.progress();
        let cancel = self.handle.cancel_token();

        if let Some(command) = self.options.command_before() {
            run_user_command(runner, progress, CommandStage::Before, command, &self.tokens()?)?;
        }

        let paths: Vec<PathBuf> = self
            .options
            .paths()
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if paths.is_empty() {
            tracing::warn!("There are no paths to back up in {}", self.kind.label());
            return Ok(false);
        }
        cancel.checkpoint()?;

        if let Some((server, folder)) = self.target.remote() {
            if !check_remote_server(&*self.transport, server, folder, RemoteExpectation::Folder)? {
                return Ok(false);
            }
        }

        progress.enter(OperationStatus::CleaningOld, 0);
        let local_folder = match self.target.location() {
            TargetLocation::Local { folder } => folder,
            TargetLocation::Remote { staging_dir, .. } => staging_dir,
        };
        if !prepare_destination_folder(local_folder) {
            return Ok(false);
        }
        if !self.incremental {
            self.remove_same_named_artifact()?;
        }
        cancel.checkpoint()?;

        if self.kind.is_set() {
            let policy = if self.incremental {
                RetentionPolicy::Incremental
            } else {
                RetentionPolicy::KeepNewest(*self.options.old_to_keep())
            };
            let outcome = RetentionManager::open(&self.target, &*self.transport)
                .and_then(|mut retention| retention.rotate(policy, self.target.artifact_name()))
                .add_msg(format!("Rotating old backups of {} failed", self.kind.label()))?;
            if !outcome.deleted.is_empty() {
                tracing::info!("Removed {} old backup(s)", outcome.deleted.len());
            }
            if let Some(reused) = outcome.reused {
                tracing::debug!("Updating the previous backup {} in place", reused);
            }
        }
        cancel.checkpoint()?;

        let snapshot_files = match self
            .snapshots
            .collect_snapshots(&self.options, &self.app, runner)
        {
            Ok(files) => files,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                tracing::error!("Could not save the package list or disk information: {}", e);
                Vec::new()
            }
        };
        let all_paths: Vec<PathBuf> = paths.into_iter().chain(snapshot_files.iter().cloned()).collect();

        let ctx = EngineContext {
            options: &self.options,
            target: &self.target,
            app: &self.app,
            runner,
            progress,
            cancel,
            transport: &*self.transport,
        };
        let report = self.engine.run(&ctx, &all_paths);
        delete_snapshots(&snapshot_files);
        let report = report?;

        if !self.target.is_remote() {
            restrict_permissions(&self.target.local_artifact_path());
        }
        if !report.skipped().is_empty() {
            tracing::info!("{} path(s) were skipped", report.skipped().len());
        }
        Ok(report.is_success())
    }

    /// Deletes an artifact with the exact name of the one about to be written.
    fn remove_same_named_artifact(&self) -> Result<()> {
        let local = self.target.local_artifact_path();
        if std::fs::symlink_metadata(&local).is_ok() {
            tracing::debug!("Overwriting {:?}", local);
            rmtree_best_effort(&local, |path, e| {
                tracing::error!("Could not remove {:?}: {}", path, e)
            });
        }

        if let (Some((server, _)), Some(remote)) =
            (self.target.remote(), self.target.remote_artifact_path())
        {
            let removed = self
                .transport
                .connect(server, connect_timeout(server))
                .and_then(|mut session| session.remove(&remote));
            match removed {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => tracing::warn!("Could not remove the remote {:?}: {}", remote, e),
            }
        }
        Ok(())
    }
}

/// Owner-only access to the new artifact. Errors are ignored.
#[cfg(unix)]
fn restrict_permissions(artifact: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let mode = match std::fs::symlink_metadata(artifact) {
        Ok(metadata) if metadata.is_dir() => 0o700,
        Ok(metadata) if metadata.is_file() => 0o600,
        _ => return,
    };
    if let Err(e) = std::fs::set_permissions(artifact, std::fs::Permissions::from_mode(mode)) {
        tracing::debug!("Could not restrict permissions of {:?}: {}", artifact, e);
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_artifact: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::options::Destination;
    use crate::backup::options::EngineKind;

    fn options(engine: EngineKind, destination: &Path) -> OperationOptions {
        OperationOptions::builder()
            .engine(engine)
            .destination(Destination::local(destination))
            .paths(vec![PathBuf::from("/etc/hostname")])
            .incremental(true)
            .build()
    }

    fn app() -> Arc<AppContext> {
        Arc::new(AppContext::builder().temp_dir("/tmp").build())
    }

    #[test]
    fn test_backup_kind() {
        let set = BackupKind::set("Docs", false);
        assert_eq!(set.label(), "Docs");
        assert!(set.is_set());
        assert_eq!(BackupKind::OneTime.label(), "OneTime");
        assert!(!BackupKind::OneTime.is_set());
    }

    #[test]
    fn test_rejects_invalid_set_name() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let result = BackupOperation::new(
            BackupKind::set("a/b", false),
            options(EngineKind::Tar, temp_dir.path()),
            app(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_incremental_only_for_local_rsync_sets() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let rsync_set = BackupOperation::new(
            BackupKind::set("Docs", false),
            options(EngineKind::Rsync, temp_dir.path()),
            app(),
        )
        .unwrap();
        assert!(rsync_set.incremental);
        assert!(!rsync_set.engine().is_archive());

        let one_time = BackupOperation::new(
            BackupKind::OneTime,
            options(EngineKind::Rsync, temp_dir.path()),
            app(),
        )
        .unwrap();
        assert!(!one_time.incremental);
        assert!(one_time
            .target()
            .artifact_name()
            .starts_with("Backup-OneTime-"));

        let tar_set = BackupOperation::new(
            BackupKind::set("Docs", false),
            options(EngineKind::Tar, temp_dir.path()),
            app(),
        )
        .unwrap();
        assert!(!tar_set.incremental);
        assert!(tar_set.engine().is_archive());
    }
}

//! Backup and restore controllers.
//!
//! A controller runs on one worker thread and publishes its progress through an
//! [`OperationHandle`], which any other thread can poll or use to cancel the run.

pub mod backup;
pub mod restore;

use crate::backup::cancel::CancellationToken;
use crate::backup::context::AppContext;
use crate::backup::options::RemoteServer;
use crate::backup::process::registry::ProcessRegistry;
use crate::backup::process::ProcessRunner;
use crate::backup::progress::{OperationProgress, ProgressTracker};
use crate::backup::remote::connection::{missing_folder_message, ConnectionError};
use crate::backup::remote::{RemoteTransport, TEST_CONNECTION_TIMEOUT};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use derive_more::Display;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Terminal outcome of an operation.
#[derive(Clone, Debug, Display, PartialEq, Eq)]
pub enum OperationResult {
    /// Possibly with non-fatal warnings already logged
    #[display("success")]
    Success,
    /// Completed, but at least one failure was recorded
    #[display("failed")]
    Failed,
    #[display("internal error: {_0}")]
    InternalError(String),
    #[display("cancelled")]
    Cancelled,
}

impl OperationResult {
    pub fn is_success(&self) -> bool {
        matches!(self, OperationResult::Success)
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            OperationResult::Success => 0,
            OperationResult::Failed => 1,
            OperationResult::InternalError(_) => 2,
            OperationResult::Cancelled => 3,
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    progress: ProgressTracker,
    cancel: CancellationToken,
    registry: Arc<ProcessRegistry>,
    result: OnceLock<OperationResult>,
}

/// Thread-safe view of a running operation.
#[derive(Clone, Debug, Default)]
pub struct OperationHandle {
    shared: Arc<Shared>,
}

impl OperationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation and kills every live child process. Terminal.
    pub fn cancel_operation(&self) {
        tracing::info!("Cancelling the operation");
        self.shared.cancel.cancel();
        let killed = self.shared.registry.kill_all();
        if killed > 0 {
            tracing::debug!("Killed {} child process(es)", killed);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    pub fn get_progress(&self) -> OperationProgress {
        self.shared.progress.snapshot()
    }

    /// `None` until the operation completed.
    pub fn result(&self) -> Option<OperationResult> {
        self.shared.result.get().cloned()
    }

    /// Sleeps `poll_interval` at a time until a result is available.
    pub fn wait(&self, poll_interval: Duration) -> OperationResult {
        loop {
            if let Some(result) = self.result() {
                return result;
            }
            std::thread::sleep(poll_interval);
        }
    }

    pub fn live_processes(&self) -> usize {
        self.shared.registry.live_count()
    }

    pub(crate) fn progress(&self) -> &ProgressTracker {
        &self.shared.progress
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.shared.cancel
    }

    pub(crate) fn runner(&self, app: &AppContext) -> ProcessRunner {
        ProcessRunner::new(
            app.search_path().clone(),
            self.shared.registry.clone(),
            self.shared.cancel.clone(),
        )
    }

    /// Kills leftovers after an internal error without flagging a cancellation.
    pub(crate) fn kill_children(&self) {
        self.shared.registry.kill_all();
    }

    /// Converts the controller body's outcome into the terminal result.
    pub(crate) fn resolve(&self, what: &str, outcome: Result<bool>) -> OperationResult {
        match outcome {
            Ok(true) => OperationResult::Success,
            Ok(false) => OperationResult::Failed,
            Err(e) if e.is_cancelled() => OperationResult::Cancelled,
            Err(e) => {
                tracing::warn!("There was an error while performing the {}!", what);
                tracing::error!("{}", e);
                self.kill_children();
                OperationResult::InternalError(e.to_string())
            }
        }
    }

    pub(crate) fn publish(&self, result: OperationResult) -> OperationResult {
        if self.shared.result.set(result.clone()).is_err() {
            tracing::debug!("Operation result was already published");
        }
        result
    }
}

/// Creates the destination folder when missing. Returns false (after logging an ERROR)
/// when that is impossible; an unwritable folder is only a warning.
pub fn prepare_destination_folder(folder: &Path) -> bool {
    if !folder.exists() {
        tracing::debug!("Creating destination folder {:?}", folder);
        if let Err(e) = std::fs::create_dir_all(folder) {
            tracing::error!("The destination folder {:?} could not be created: {}", folder, e);
            return false;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(folder, std::fs::Permissions::from_mode(0o755));
        }
    } else if !folder.is_dir() {
        tracing::error!("The destination {:?} is not a folder", folder);
        return false;
    }

    match std::fs::metadata(folder) {
        Ok(metadata) if metadata.permissions().readonly() => {
            tracing::warn!("The destination folder {:?} may not be writable", folder);
        }
        _ => {}
    }
    true
}

/// What a remote path must be for a pre-flight check to pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteExpectation {
    Folder,
    Exists,
}

/// Connects with the short test timeout and checks `path`, logging a classified message
/// on failure. Only cancellation is returned as an error.
pub fn check_remote_server(
    transport: &dyn RemoteTransport,
    server: &RemoteServer,
    path: &Path,
    expectation: RemoteExpectation,
) -> Result<bool> {
    tracing::debug!("Attempting to connect to server {}...", server.host());
    let checked = match expectation {
        RemoteExpectation::Folder => transport.test_connection(server, path),
        RemoteExpectation::Exists => transport
            .connect(server, TEST_CONNECTION_TIMEOUT)
            .and_then(|mut session| session.exists(path)),
    };
    match checked {
        Ok(true) => {
            tracing::debug!("Attempt to connect succeeded.");
            Ok(true)
        }
        Ok(false) => {
            tracing::error!("{}", missing_folder_message(path));
            Ok(false)
        }
        Err(Error::Connection(e)) => {
            tracing::error!("{}", e.user_message());
            Ok(false)
        }
        Err(e) if e.is_cancelled() => Err(e),
        Err(e) => {
            tracing::error!(
                "{}",
                ConnectionError::Protocol(e.to_string()).user_message()
            );
            Ok(false)
        }
    }
}

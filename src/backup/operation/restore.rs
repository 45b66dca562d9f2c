use crate::backup::compress::Decompressor;
use crate::backup::context::AppContext;
use crate::backup::fs_util::copy_dir_contents;
use crate::backup::operation::{
    check_remote_server, prepare_destination_folder, OperationHandle, OperationResult,
    RemoteExpectation,
};
use crate::backup::options::{RestoreLocation, RestoreOptions, RestoreSourceKind};
use crate::backup::progress::OperationStatus;
use crate::backup::remote::sftp::SftpTransport;
use crate::backup::remote::{connect_timeout, RemoteTransport};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use std::ffi::OsStr;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tempfile::TempDir;
use validator::Validate;

type ArchiveReader = tar::Archive<Decompressor<BufReader<File>>>;

fn open_archive(path: &Path) -> Result<ArchiveReader> {
    Ok(tar::Archive::new(Decompressor::detect(File::open(path)?)?))
}

/// Restores an archive or a mirror folder into a local destination.
pub struct RestoreOperation {
    options: RestoreOptions,
    app: Arc<AppContext>,
    transport: Arc<dyn RemoteTransport>,
    handle: OperationHandle,
}

impl RestoreOperation {
    pub fn new(options: RestoreOptions, app: Arc<AppContext>) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            app,
            transport: Arc::new(SftpTransport),
            handle: OperationHandle::new(),
        })
    }

    pub fn with_transport(mut self, transport: Arc<dyn RemoteTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn handle(&self) -> OperationHandle {
        self.handle.clone()
    }

    pub fn spawn(self) -> (OperationHandle, JoinHandle<OperationResult>) {
        let handle = self.handle();
        let worker = std::thread::spawn(move || self.start());
        (handle, worker)
    }

    pub fn start(&self) -> OperationResult {
        tracing::info!("Starting restore to {:?}", self.options.destination());
        let outcome = self.run_restore();
        let result = self.handle.resolve("restore", outcome);
        tracing::info!("Finished restore: {}", result);
        self.handle.publish(result)
    }

    fn run_restore(&self) -> Result<bool> {
        let destination = self.options.destination();
        let kind = *self.options.kind();

        if let RestoreLocation::RemoteSsh { server, path } = self.options.source() {
            let expectation = match kind {
                RestoreSourceKind::Folder => RemoteExpectation::Folder,
                _ => RemoteExpectation::Exists,
            };
            if !check_remote_server(&*self.transport, server, path, expectation)? {
                return Ok(false);
            }
        }
        if !prepare_destination_folder(destination) {
            return Ok(false);
        }
        self.handle.cancel_token().checkpoint()?;

        // The staging folder lives until the restore is over
        let (source, _staging): (PathBuf, Option<TempDir>) = match self.options.source() {
            RestoreLocation::Local { path } => (path.clone(), None),
            RestoreLocation::RemoteSsh { .. } => match self.receive()? {
                Some((staging, local)) => (local, Some(staging)),
                None => return Ok(false),
            },
        };
        self.handle.cancel_token().checkpoint()?;

        let is_dir = match std::fs::metadata(&source) {
            Ok(metadata) => metadata.is_dir(),
            Err(e) => {
                tracing::error!("The restore source {:?} cannot be read: {}", source, e);
                return Ok(false);
            }
        };
        match (kind, is_dir) {
            (RestoreSourceKind::Set | RestoreSourceKind::Archive, false) => {
                self.extract_archive(&source, destination)
            }
            (RestoreSourceKind::Set | RestoreSourceKind::Folder, true) => {
                Ok(self.copy_folder(&source, destination))
            }
            (RestoreSourceKind::Archive, true) => {
                tracing::error!("{:?} is a folder, not an archive", source);
                Ok(false)
            }
            (RestoreSourceKind::Folder, false) => {
                tracing::error!("{:?} is not a folder", source);
                Ok(false)
            }
        }
    }

    /// Downloads the remote source into a private staging folder.
    fn receive(&self) -> Result<Option<(TempDir, PathBuf)>> {
        let RestoreLocation::RemoteSsh { server, path } = self.options.source() else {
            return Ok(None);
        };
        let progress = self.handle.progress();
        progress.enter(OperationStatus::ReceivingFromRemote, 1);
        progress.advance(1, path.to_string_lossy());

        let staging = tempfile::Builder::new()
            .prefix("pbackup-restore")
            .tempdir_in(self.app.temp_dir())
            .map_err(Error::from)
            .add_msg(format!("Creating a staging folder in {:?} failed", self.app.temp_dir()))?;
        let local = staging
            .path()
            .join(path.file_name().unwrap_or(OsStr::new("restore")));

        tracing::info!("Receiving {:?} from {}", path, server.host());
        let received = self
            .transport
            .connect(server, connect_timeout(server))
            .and_then(|mut session| session.get(path, &local));
        match received {
            Ok(()) => Ok(Some((staging, local))),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                tracing::error!("Receiving {:?} from {} failed: {}", path, server.host(), e);
                Ok(None)
            }
        }
    }

    fn extract_archive(&self, archive: &Path, destination: &Path) -> Result<bool> {
        let progress = self.handle.progress();
        let cancel = self.handle.cancel_token();

        let total = open_archive(archive)?
            .entries()
            .map_err(Error::from)
            .add_msg(format!("Reading archive {:?} failed", archive))?
            .count();
        progress.enter(OperationStatus::Restoring, total);
        tracing::info!("Extracting {} member(s) of {:?}", total, archive);

        let mut reader = open_archive(archive)?;
        reader.set_preserve_permissions(true);
        reader.set_overwrite(true);
        for (i, entry) in reader.entries()?.enumerate() {
            cancel.checkpoint()?;
            let mut entry = entry
                .map_err(Error::from)
                .add_msg(format!("Reading archive {:?} failed", archive))?;
            let name = entry.path()?.to_string_lossy().into_owned();
            progress.advance(i + 1, name.as_str());
            let unpacked = entry
                .unpack_in(destination)
                .map_err(Error::from)
                .add_msg(format!("Extracting {} failed", name))?;
            if !unpacked {
                tracing::warn!("Skipped {} which points outside {:?}", name, destination);
            }
        }
        Ok(true)
    }

    fn copy_folder(&self, source: &Path, destination: &Path) -> bool {
        let progress = self.handle.progress();
        progress.enter(OperationStatus::Restoring, 1);
        progress.advance(1, source.to_string_lossy());
        match copy_dir_contents(source, destination) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Restoring {:?} into {:?} failed:\n{}", source, destination, e);
                false
            }
        }
    }
}

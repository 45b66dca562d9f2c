//! A [`RemoteTransport`] backed by a local directory, recording what it was asked to do.

use crate::backup::exclude::WalkPolicy;
use crate::backup::options::RemoteServer;
use crate::backup::remote::connection::ConnectionError;
use crate::backup::remote::{put_tree, RemoteEntryKind, RemoteSession, RemoteTransport};
use crate::backup::result_error::result::Result;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportCall {
    Connect { host: String },
    Put { local: PathBuf, remote_folder: PathBuf },
    Get { remote: PathBuf, local: PathBuf },
    Remove { path: PathBuf },
    Symlink { target: PathBuf, link: PathBuf },
}

#[derive(Clone, Debug, Default)]
pub struct LocalDirTransport {
    root: PathBuf,
    calls: Arc<Mutex<Vec<TransportCall>>>,
    open_sessions: Arc<AtomicUsize>,
    connect_error: Option<ConnectionError>,
}

impl LocalDirTransport {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn failing(error: ConnectionError) -> Self {
        Self {
            connect_error: Some(error),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn puts(&self) -> Vec<TransportCall> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, TransportCall::Put { .. }))
            .collect()
    }

    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }
}

impl RemoteTransport for LocalDirTransport {
    fn connect(&self, server: &RemoteServer, _timeout: Duration) -> Result<Box<dyn RemoteSession>> {
        self.calls.lock().unwrap().push(TransportCall::Connect {
            host: server.host().clone(),
        });
        if let Some(error) = &self.connect_error {
            return Err(error.clone().into());
        }
        self.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LocalDirSession {
            root: self.root.clone(),
            calls: self.calls.clone(),
            open_sessions: self.open_sessions.clone(),
        }))
    }
}

pub struct LocalDirSession {
    root: PathBuf,
    calls: Arc<Mutex<Vec<TransportCall>>>,
    open_sessions: Arc<AtomicUsize>,
}

impl LocalDirSession {
    fn map(&self, remote: &Path) -> PathBuf {
        remote
            .components()
            .filter_map(|c| match c {
                Component::Normal(name) => Some(name),
                _ => None,
            })
            .fold(self.root.clone(), |path, name| path.join(name))
    }
}

fn kind(metadata: std::fs::Metadata) -> RemoteEntryKind {
    let file_type = metadata.file_type();
    if file_type.is_dir() {
        RemoteEntryKind::Dir
    } else if file_type.is_symlink() {
        RemoteEntryKind::Symlink
    } else {
        RemoteEntryKind::File
    }
}

impl RemoteSession for LocalDirSession {
    fn stat(&mut self, path: &Path) -> Result<Option<RemoteEntryKind>> {
        Ok(std::fs::metadata(self.map(path)).ok().map(kind))
    }

    fn lstat(&mut self, path: &Path) -> Result<Option<RemoteEntryKind>> {
        Ok(std::fs::symlink_metadata(self.map(path)).ok().map(kind))
    }

    fn list_dir(&mut self, path: &Path) -> Result<Vec<String>> {
        let mut names = std::fs::read_dir(self.map(path))?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<std::io::Result<Vec<_>>>()?;
        names.sort();
        Ok(names)
    }

    fn make_dir(&mut self, path: &Path) -> Result<()> {
        Ok(std::fs::create_dir(self.map(path))?)
    }

    fn remove_file(&mut self, path: &Path) -> Result<()> {
        Ok(std::fs::remove_file(self.map(path))?)
    }

    fn remove_dir(&mut self, path: &Path) -> Result<()> {
        Ok(std::fs::remove_dir(self.map(path))?)
    }

    fn upload_file(&mut self, local: &Path, remote: &Path) -> Result<()> {
        std::fs::copy(local, self.map(remote))?;
        Ok(())
    }

    fn download_file(&mut self, remote: &Path, local: &Path) -> Result<()> {
        std::fs::copy(self.map(remote), local)?;
        Ok(())
    }

    fn make_symlink(&mut self, target: &Path, link: &Path) -> Result<()> {
        self.calls.lock().unwrap().push(TransportCall::Symlink {
            target: target.to_path_buf(),
            link: link.to_path_buf(),
        });
        #[cfg(unix)]
        std::os::unix::fs::symlink(target, self.map(link))?;
        Ok(())
    }

    fn put(&mut self, local: &Path, remote_folder: &Path, policy: &WalkPolicy) -> Result<()> {
        self.calls.lock().unwrap().push(TransportCall::Put {
            local: local.to_path_buf(),
            remote_folder: remote_folder.to_path_buf(),
        });
        put_tree(self, local, remote_folder, policy)
    }

    fn get(&mut self, remote: &Path, local: &Path) -> Result<()> {
        self.calls.lock().unwrap().push(TransportCall::Get {
            remote: remote.to_path_buf(),
            local: local.to_path_buf(),
        });
        crate::backup::remote::get_tree(self, remote, local)
    }

    fn remove(&mut self, path: &Path) -> Result<()> {
        self.calls.lock().unwrap().push(TransportCall::Remove {
            path: path.to_path_buf(),
        });
        crate::backup::remote::remove_tree(self, path)
    }
}

impl Drop for LocalDirSession {
    fn drop(&mut self) {
        self.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

//! Remote destinations over SSH/SFTP.
//!
//! [`RemoteSession`] exposes the handful of SFTP primitives a backend must provide; the
//! recursive operations (`mkdir_p`, `put`, `get`, `remove`) are built on top of them so
//! every backend shares the same tree semantics.

pub mod connection;
pub mod sftp;
#[cfg(test)]
pub mod testing;

use crate::backup::exclude::WalkPolicy;
use crate::backup::options::RemoteServer;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::{convert_error_vec, Result};
use crate::backup::result_error::AddMsg;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Timeout of pre-flight checks and "test settings" actions.
pub const TEST_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteEntryKind {
    File,
    Dir,
    Symlink,
}

pub trait RemoteSession: Send {
    /// Follows symlinks. A path that cannot be stat'ed yields `None`.
    fn stat(&mut self, path: &Path) -> Result<Option<RemoteEntryKind>>;
    /// Does not follow symlinks.
    fn lstat(&mut self, path: &Path) -> Result<Option<RemoteEntryKind>>;
    /// Entry names, without `.` and `..`.
    fn list_dir(&mut self, path: &Path) -> Result<Vec<String>>;
    fn make_dir(&mut self, path: &Path) -> Result<()>;
    fn remove_file(&mut self, path: &Path) -> Result<()>;
    fn remove_dir(&mut self, path: &Path) -> Result<()>;
    fn upload_file(&mut self, local: &Path, remote: &Path) -> Result<()>;
    fn download_file(&mut self, remote: &Path, local: &Path) -> Result<()>;
    fn make_symlink(&mut self, target: &Path, link: &Path) -> Result<()>;

    fn exists(&mut self, path: &Path) -> Result<bool> {
        Ok(self.lstat(path)?.is_some())
    }

    fn is_folder(&mut self, path: &Path) -> Result<bool> {
        Ok(self.stat(path)? == Some(RemoteEntryKind::Dir))
    }

    /// Creates `path` and every missing parent.
    fn mkdir_p(&mut self, path: &Path) -> Result<()> {
        let mut current = PathBuf::new();
        for component in path.components() {
            current.push(component);
            if matches!(component, Component::RootDir | Component::Prefix(_)) {
                continue;
            }
            match self.stat(&current)? {
                Some(RemoteEntryKind::Dir) => {}
                Some(_) => {
                    return Err(Error::remote_transfer(format!(
                        "{:?} exists and is not a folder",
                        current
                    )))
                }
                None => self.make_dir(&current)?,
            }
        }
        Ok(())
    }

    /// Uploads `local` (file or folder) into `remote_folder`, creating it if missing.
    fn put(&mut self, local: &Path, remote_folder: &Path, policy: &WalkPolicy) -> Result<()> {
        put_tree(self, local, remote_folder, policy)
    }

    /// Downloads `remote` (file or folder) to the local path `local`.
    fn get(&mut self, remote: &Path, local: &Path) -> Result<()> {
        get_tree(self, remote, local)
    }

    /// Deletes a file, or a folder recursively. Missing paths are ignored.
    fn remove(&mut self, path: &Path) -> Result<()> {
        remove_tree(self, path)
    }
}

pub trait RemoteTransport: Send + Sync {
    fn connect(&self, server: &RemoteServer, timeout: Duration) -> Result<Box<dyn RemoteSession>>;

    /// Connects with a short timeout and checks that `path` is a reachable folder.
    ///
    /// The session is closed on every path out of this function.
    fn test_connection(&self, server: &RemoteServer, path: &Path) -> Result<bool> {
        let mut session = self.connect(server, TEST_CONNECTION_TIMEOUT)?;
        session.is_folder(path)
    }
}

pub fn connect_timeout(server: &RemoteServer) -> Duration {
    server.timeout().unwrap_or(DEFAULT_CONNECT_TIMEOUT)
}

fn remote_join(base: &Path, relative: &Path) -> PathBuf {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name),
            _ => None,
        })
        .fold(base.to_path_buf(), |path, name| path.join(name))
}

/// The shared implementation behind [`RemoteSession::put`].
pub fn put_tree<S: RemoteSession + ?Sized>(
    session: &mut S,
    local: &Path,
    remote_folder: &Path,
    policy: &WalkPolicy,
) -> Result<()> {
    session
        .mkdir_p(remote_folder)
        .add_msg(format!("Creating remote folder {:?} failed", remote_folder))?;

    let base = local.parent().unwrap_or(local);
    let errors: Vec<Error> = policy
        .walk(local)
        .filter_map(|entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => return Some(e),
            };
            let relative = entry.path().strip_prefix(base).unwrap_or(entry.path());
            let remote = remote_join(remote_folder, relative);
            let file_type = entry.file_type();
            let res = if file_type.is_dir() {
                match session.stat(&remote) {
                    Ok(Some(RemoteEntryKind::Dir)) => Ok(()),
                    Ok(_) => session.make_dir(&remote),
                    Err(e) => Err(e),
                }
            } else if file_type.is_symlink() {
                std::fs::read_link(entry.path())
                    .map_err(Error::from)
                    .and_then(|target| session.make_symlink(&target, &remote))
            } else {
                tracing::trace!("Uploading {:?} to {:?}", entry.path(), remote);
                session.upload_file(entry.path(), &remote)
            };
            res.add_msg(format!("Uploading {:?} failed", entry.path())).err()
        })
        .collect();

    convert_error_vec(errors)
}

/// The shared implementation behind [`RemoteSession::get`].
pub fn get_tree<S: RemoteSession + ?Sized>(session: &mut S, remote: &Path, local: &Path) -> Result<()> {
    match session.stat(remote)? {
        Some(RemoteEntryKind::Dir) => {
            std::fs::create_dir_all(local)?;
            let errors: Vec<Error> = session
                .list_dir(remote)?
                .into_iter()
                .filter_map(|name| get_tree(session, &remote.join(&name), &local.join(&name)).err())
                .collect();
            convert_error_vec(errors)
        }
        Some(_) => {
            tracing::trace!("Downloading {:?} to {:?}", remote, local);
            session.download_file(remote, local)
        }
        None => Err(Error::remote_transfer(format!(
            "Remote path {:?} does not exist",
            remote
        ))),
    }
}

/// The shared implementation behind [`RemoteSession::remove`].
pub fn remove_tree<S: RemoteSession + ?Sized>(session: &mut S, path: &Path) -> Result<()> {
    match session.lstat(path)? {
        Some(RemoteEntryKind::Dir) => {
            for name in session.list_dir(path)? {
                remove_tree(session, &path.join(name))?;
            }
            session.remove_dir(path)
        }
        Some(_) => session.remove_file(path),
        None => Ok(()),
    }
}

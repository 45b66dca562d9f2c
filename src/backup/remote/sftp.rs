use crate::backup::options::RemoteServer;
use crate::backup::remote::connection::ConnectionError;
use crate::backup::remote::{RemoteEntryKind, RemoteSession, RemoteTransport};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use itertools::Itertools;
use ssh2::{ErrorCode, FileStat, HashType, Session, Sftp};
use std::fs::File;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

// libssh2 session error codes
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED: i32 = -19;

/// The production transport, built on libssh2.
///
/// Unknown host keys are accepted on first use; the fingerprint is logged.
#[derive(Clone, Copy, Debug, Default)]
pub struct SftpTransport;

fn classify_ssh_error(error: ssh2::Error) -> ConnectionError {
    match error.code() {
        ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED)
        | ErrorCode::Session(LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED) => ConnectionError::Authentication,
        ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => ConnectionError::Timeout,
        _ => ConnectionError::Protocol(error.message().to_string()),
    }
}

fn classify_io_error(error: io::Error) -> ConnectionError {
    match error.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ConnectionError::Timeout,
        _ => ConnectionError::Protocol(error.to_string()),
    }
}

fn timeout_millis(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

impl RemoteTransport for SftpTransport {
    fn connect(&self, server: &RemoteServer, timeout: Duration) -> Result<Box<dyn RemoteSession>> {
        let host = server.host();
        let address = (host.as_str(), *server.port())
            .to_socket_addrs()
            .map_err(|e| ConnectionError::AddressResolution(format!("{host}: {e}")))?
            .next()
            .ok_or_else(|| ConnectionError::AddressResolution(host.clone()))?;

        tracing::debug!("Connecting to {} ({})", host, address);
        let tcp = TcpStream::connect_timeout(&address, timeout).map_err(classify_io_error)?;

        let mut session = Session::new().map_err(classify_ssh_error)?;
        session.set_tcp_stream(tcp);
        session.set_timeout(timeout_millis(timeout));
        session.set_compress(true);
        session.handshake().map_err(classify_ssh_error)?;

        if let Some(hash) = session.host_key_hash(HashType::Sha256) {
            tracing::info!(
                "Accepting host key of {} with SHA256 fingerprint {}",
                host,
                hash.iter().map(|b| format!("{b:02x}")).join(":")
            );
        }

        {
            let password = server.password().reveal()?;
            session
                .userauth_password(server.username(), password.as_str())
                .map_err(classify_ssh_error)?;
        }
        if !session.authenticated() {
            return Err(ConnectionError::Authentication.into());
        }

        // only connection establishment is bounded
        session.set_timeout(0);
        let sftp = session.sftp().map_err(classify_ssh_error)?;
        tracing::info!("Connected to {}@{}:{}", server.username(), host, server.port());

        Ok(Box::new(SftpSession { session, sftp }))
    }
}

pub struct SftpSession {
    session: Session,
    sftp: Sftp,
}

/// `Sftp::symlink(path, target)` creates `target` as a link pointing at `path`.
fn symlink_args<'a>(target: &'a Path, link: &'a Path) -> (&'a Path, &'a Path) {
    (target, link)
}

fn entry_kind(stat: FileStat) -> RemoteEntryKind {
    let file_type = stat.file_type();
    if file_type.is_dir() {
        RemoteEntryKind::Dir
    } else if file_type.is_symlink() {
        RemoteEntryKind::Symlink
    } else {
        RemoteEntryKind::File
    }
}

impl RemoteSession for SftpSession {
    fn stat(&mut self, path: &Path) -> Result<Option<RemoteEntryKind>> {
        Ok(self.sftp.stat(path).ok().map(entry_kind))
    }

    fn lstat(&mut self, path: &Path) -> Result<Option<RemoteEntryKind>> {
        Ok(self.sftp.lstat(path).ok().map(entry_kind))
    }

    fn list_dir(&mut self, path: &Path) -> Result<Vec<String>> {
        Ok(self
            .sftp
            .readdir(path)?
            .into_iter()
            .filter_map(|(entry, _)| {
                entry
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .filter(|name| name != "." && name != "..")
            .sorted()
            .collect())
    }

    fn make_dir(&mut self, path: &Path) -> Result<()> {
        Ok(self.sftp.mkdir(path, 0o755)?)
    }

    fn remove_file(&mut self, path: &Path) -> Result<()> {
        Ok(self.sftp.unlink(path)?)
    }

    fn remove_dir(&mut self, path: &Path) -> Result<()> {
        Ok(self.sftp.rmdir(path)?)
    }

    fn upload_file(&mut self, local: &Path, remote: &Path) -> Result<()> {
        let mut source = File::open(local)?;
        let mut sink = self
            .sftp
            .create(remote)
            .map_err(Error::from)
            .add_msg(format!("Creating remote file {:?} failed", remote))?;
        io::copy(&mut source, &mut sink)?;
        Ok(())
    }

    fn download_file(&mut self, remote: &Path, local: &Path) -> Result<()> {
        let mut source = self
            .sftp
            .open(remote)
            .map_err(Error::from)
            .add_msg(format!("Opening remote file {:?} failed", remote))?;
        let mut sink = File::create(local)?;
        io::copy(&mut source, &mut sink)?;
        Ok(())
    }

    fn make_symlink(&mut self, target: &Path, link: &Path) -> Result<()> {
        let (points_at, created_at) = symlink_args(target, link);
        Ok(self.sftp.symlink(points_at, created_at)?)
    }
}

impl Drop for SftpSession {
    fn drop(&mut self) {
        if let Err(e) = self.session.disconnect(None, "pbackup session closed", None) {
            tracing::debug!("Error while disconnecting: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_ssh_errors() {
        let auth = ssh2::Error::new(ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED), "denied");
        assert_eq!(classify_ssh_error(auth), ConnectionError::Authentication);

        let timeout = ssh2::Error::new(ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT), "slow");
        assert_eq!(classify_ssh_error(timeout), ConnectionError::Timeout);

        let other = ssh2::Error::new(ErrorCode::Session(-13), "banner exchange");
        assert_eq!(
            classify_ssh_error(other),
            ConnectionError::Protocol("banner exchange".into())
        );
    }

    #[test]
    fn test_classify_io_errors() {
        assert_eq!(
            classify_io_error(io::Error::new(io::ErrorKind::TimedOut, "t")),
            ConnectionError::Timeout
        );
        assert!(matches!(
            classify_io_error(io::Error::new(io::ErrorKind::ConnectionRefused, "r")),
            ConnectionError::Protocol(_)
        ));
    }

    #[test]
    fn test_unresolvable_host() {
        let server = RemoteServer::builder()
            .host("host.invalid")
            .username("u")
            .build();
        match SftpTransport.connect(&server, Duration::from_secs(1)) {
            Err(Error::Connection(ConnectionError::AddressResolution(_))) => {}
            Err(other) => panic!("Expected address resolution failure, got {other}"),
            Ok(_) => panic!("Expected address resolution failure"),
        }
    }

    #[test]
    fn test_symlink_created_at_link_path() {
        let (points_at, created_at) =
            symlink_args(Path::new("/etc/hosts"), Path::new("/srv/run/docs/link"));
        assert_eq!(points_at, Path::new("/etc/hosts"));
        assert_eq!(created_at, Path::new("/srv/run/docs/link"));
    }

    #[test]
    fn test_timeout_millis_saturates() {
        assert_eq!(timeout_millis(Duration::from_secs(30)), 30_000);
        assert_eq!(timeout_millis(Duration::from_secs(u64::MAX)), u32::MAX);
    }
}

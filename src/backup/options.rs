use crate::backup::exclude::ExcludePattern;
use crate::backup::file_ext::FileExtProvider;
use crate::backup::redacted::ObfuscatedPassword;
use crate::backup::validate::{validate_destination_dir, validate_remote_folder};
use bon::Builder;
use derive_more::Display;
use getset::Getters;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::path::{Path, PathBuf};
use std::result;
use std::time::Duration;
use validator::{Validate, ValidationError, ValidationErrors};

pub const DEFAULT_SSH_PORT: u16 = 22;

/// The backup mechanism of a run.
#[derive(Clone, Copy, Debug, Display, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EngineKind {
    #[serde(rename = "tar")]
    #[display("tar")]
    Tar,
    #[serde(rename = "tar.gz")]
    #[display("tar.gz")]
    TarGz,
    #[serde(rename = "tar.bz2")]
    #[display("tar.bz2")]
    TarBz2,
    #[serde(rename = "rsync")]
    #[display("rsync")]
    Rsync,
}

impl EngineKind {
    /// Archive engines produce a single file, mirror engines a directory.
    pub fn is_archive(&self) -> bool {
        !matches!(self, EngineKind::Rsync)
    }
}

impl FileExtProvider for EngineKind {
    fn file_ext(&self) -> Option<&'static str> {
        match self {
            EngineKind::Tar => Some("tar"),
            EngineKind::TarGz => Some("tar.gz"),
            EngineKind::TarBz2 => Some("tar.bz2"),
            EngineKind::Rsync => None,
        }
    }
}

/// Connection settings of an SSH/SFTP server.
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct RemoteServer {
    #[validate(length(min = 1))]
    #[builder(into)]
    host: String,
    #[serde(default = "default_port")]
    #[validate(range(min = 1))]
    #[builder(default = DEFAULT_SSH_PORT)]
    port: u16,
    #[validate(length(min = 1))]
    #[builder(into)]
    username: String,
    /// Base64 encoded, as stored on disk
    #[serde(default)]
    #[builder(default)]
    password: ObfuscatedPassword,
    /// Connection establishment timeout, defaults to two minutes
    #[serde(default, with = "humantime_serde")]
    timeout: Option<Duration>,
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

/// Where backup artifacts are written.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum Destination {
    Local { path: PathBuf },
    RemoteSsh { server: RemoteServer, folder: PathBuf },
}

impl Destination {
    pub fn local<P: Into<PathBuf>>(path: P) -> Self {
        Destination::Local { path: path.into() }
    }

    pub fn remote<P: Into<PathBuf>>(server: RemoteServer, folder: P) -> Self {
        Destination::RemoteSsh {
            server,
            folder: folder.into(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Destination::RemoteSsh { .. })
    }
}

impl Validate for Destination {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            Destination::Local { path } => {
                let mut errors = ValidationErrors::new();
                if let Err(e) = validate_destination_dir(path) {
                    errors.add("path", e);
                }
                if errors.is_empty() {
                    Ok(())
                } else {
                    Err(errors)
                }
            }
            Destination::RemoteSsh { server, folder } => {
                let mut errors = match server.validate() {
                    Ok(_) => ValidationErrors::new(),
                    Err(errors) => errors,
                };
                if let Err(e) = validate_remote_folder(folder) {
                    errors.add("folder", e);
                }
                if errors.is_empty() {
                    Ok(())
                } else {
                    Err(errors)
                }
            }
        }
    }
}

fn validate_destination(destination: &Destination) -> result::Result<(), ValidationError> {
    destination.validate().map_err(|e| {
        ValidationError::new("InvalidDestination").with_message(e.to_string().into())
    })
}

/// Validated options of a single backup run.
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct OperationOptions {
    engine: EngineKind,
    #[validate(custom(function = validate_destination))]
    destination: Destination,
    /// Files and folders to back up, duplicates are ignored
    #[serde(default)]
    #[builder(default, into)]
    paths: Vec<PathBuf>,
    #[serde(default = "default_true")]
    #[builder(default = true)]
    recursive: bool,
    #[serde(default)]
    #[builder(default)]
    include_hidden: bool,
    #[serde(default)]
    #[builder(default)]
    sparse: bool,
    #[serde(default)]
    #[builder(default)]
    follow_links: bool,
    #[serde(default)]
    #[builder(default, into)]
    excludes: Vec<ExcludePattern>,
    /// Negative values need elevated privileges
    #[serde(default)]
    #[validate(range(min = -20, max = 19))]
    #[builder(default)]
    nice: i32,
    /// Set backups only
    #[serde(default = "default_old_to_keep")]
    #[builder(default = 1)]
    old_to_keep: usize,
    /// Set backups with the rsync engine and a local destination only
    #[serde(default)]
    #[builder(default)]
    incremental: bool,
    #[builder(into)]
    command_before: Option<String>,
    #[builder(into)]
    command_after: Option<String>,
    /// Set backups only, bypassed by a forced run
    #[serde(default = "default_true")]
    #[builder(default = true)]
    enabled: bool,
    #[serde(default)]
    #[builder(default)]
    package_lists: bool,
    #[serde(default)]
    #[builder(default)]
    disk_info: bool,
}

fn default_true() -> bool {
    true
}

fn default_old_to_keep() -> usize {
    1
}

impl OperationOptions {
    pub fn remote(&self) -> Option<(&RemoteServer, &Path)> {
        match &self.destination {
            Destination::RemoteSsh { server, folder } => Some((server, folder.as_path())),
            Destination::Local { .. } => None,
        }
    }

    pub fn local_destination(&self) -> Option<&Path> {
        match &self.destination {
            Destination::Local { path } => Some(path.as_path()),
            Destination::RemoteSsh { .. } => None,
        }
    }

    /// True when a single rsync mirror is rolled forward instead of creating a new one.
    pub fn incremental_applies(&self) -> bool {
        self.incremental && self.engine == EngineKind::Rsync && !self.destination.is_remote()
    }
}

/// How the restore source is interpreted.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RestoreSourceKind {
    /// A backup produced by a set: file means archive, directory means mirror
    #[default]
    Set,
    Archive,
    Folder,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum RestoreLocation {
    Local { path: PathBuf },
    RemoteSsh { server: RemoteServer, path: PathBuf },
}

impl Validate for RestoreLocation {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            RestoreLocation::Local { .. } => Ok(()),
            RestoreLocation::RemoteSsh { server, .. } => server.validate(),
        }
    }
}

fn validate_restore_location(location: &RestoreLocation) -> result::Result<(), ValidationError> {
    location.validate().map_err(|e| {
        ValidationError::new("InvalidRestoreSource").with_message(e.to_string().into())
    })
}

/// Validated options of a restore run.
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct RestoreOptions {
    #[serde(default)]
    #[builder(default)]
    kind: RestoreSourceKind,
    #[validate(custom(function = validate_restore_location))]
    source: RestoreLocation,
    #[validate(custom(function = validate_destination_dir))]
    #[builder(into)]
    destination: PathBuf,
}

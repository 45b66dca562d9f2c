use crate::backup::context::AppContext;
use crate::backup::file_ext::FileExtProvider;
use crate::backup::options::{Destination, OperationOptions, RemoteServer};
use chrono::{DateTime, Local};
use getset::Getters;
use std::path::{Path, PathBuf};

pub const ONE_TIME_LABEL: &str = "OneTime";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M";

/// `Backup-<label>-`, the prefix shared by every artifact of a set.
pub fn artifact_prefix(label: &str) -> String {
    format!("Backup-{label}-")
}

pub fn artifact_name<E: FileExtProvider>(label: &str, timestamp: &DateTime<Local>, engine: &E) -> String {
    let mut name = format!(
        "{}{}",
        artifact_prefix(label),
        timestamp.format(TIMESTAMP_FORMAT)
    );
    if let Some(ext) = engine.file_ext() {
        name.push('.');
        name.push_str(ext);
    }
    name
}

#[derive(Clone, Debug)]
pub enum TargetLocation {
    Local {
        folder: PathBuf,
    },
    Remote {
        server: RemoteServer,
        folder: PathBuf,
        /// Where archives are built before upload
        staging_dir: PathBuf,
    },
}

/// The resolved destination of one backup run.
#[derive(Clone, Debug, Getters)]
#[getset(get = "pub")]
pub struct BackupTarget {
    label: String,
    artifact_name: String,
    location: TargetLocation,
}

impl BackupTarget {
    pub fn resolve(
        label: &str,
        timestamp: &DateTime<Local>,
        options: &OperationOptions,
        context: &AppContext,
    ) -> Self {
        let location = match options.destination() {
            Destination::Local { path } => TargetLocation::Local {
                folder: path.clone(),
            },
            Destination::RemoteSsh { server, folder } => TargetLocation::Remote {
                server: server.clone(),
                folder: folder.clone(),
                staging_dir: context.temp_dir().clone(),
            },
        };
        Self {
            label: label.to_string(),
            artifact_name: artifact_name(label, timestamp, options.engine()),
            location,
        }
    }

    pub fn prefix(&self) -> String {
        artifact_prefix(&self.label)
    }

    /// The local destination folder, or the remote folder for remote targets.
    pub fn folder(&self) -> &Path {
        match &self.location {
            TargetLocation::Local { folder } => folder,
            TargetLocation::Remote { folder, .. } => folder,
        }
    }

    /// Where the engine writes locally: the artifact itself, or its staging copy.
    pub fn local_artifact_path(&self) -> PathBuf {
        match &self.location {
            TargetLocation::Local { folder } => folder.join(&self.artifact_name),
            TargetLocation::Remote { staging_dir, .. } => staging_dir.join(&self.artifact_name),
        }
    }

    pub fn remote(&self) -> Option<(&RemoteServer, &Path)> {
        match &self.location {
            TargetLocation::Remote { server, folder, .. } => Some((server, folder.as_path())),
            TargetLocation::Local { .. } => None,
        }
    }

    pub fn remote_artifact_path(&self) -> Option<PathBuf> {
        self.remote()
            .map(|(_, folder)| folder.join(&self.artifact_name))
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.location, TargetLocation::Remote { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::options::EngineKind;
    use chrono::TimeZone;

    fn timestamp() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 42).unwrap()
    }

    #[test]
    fn test_artifact_names() {
        let ts = timestamp();
        assert_eq!(
            artifact_name("Docs", &ts, &EngineKind::Tar),
            "Backup-Docs-2024-03-09_07-05.tar"
        );
        assert_eq!(
            artifact_name("Docs", &ts, &EngineKind::TarGz),
            "Backup-Docs-2024-03-09_07-05.tar.gz"
        );
        assert_eq!(
            artifact_name(ONE_TIME_LABEL, &ts, &EngineKind::TarBz2),
            "Backup-OneTime-2024-03-09_07-05.tar.bz2"
        );
        assert_eq!(
            artifact_name("Docs", &ts, &EngineKind::Rsync),
            "Backup-Docs-2024-03-09_07-05"
        );
    }

    #[test]
    fn test_resolve_local_and_remote() {
        let context = AppContext::builder().temp_dir("/tmp/staging").build();
        let local = OperationOptions::builder()
            .engine(EngineKind::Tar)
            .destination(Destination::local("/backups"))
            .build();
        let target = BackupTarget::resolve("Docs", &timestamp(), &local, &context);
        assert!(!target.is_remote());
        assert_eq!(target.folder(), Path::new("/backups"));
        assert_eq!(
            target.local_artifact_path(),
            PathBuf::from("/backups/Backup-Docs-2024-03-09_07-05.tar")
        );
        assert_eq!(target.remote_artifact_path(), None);

        let server = RemoteServer::builder().host("h").username("u").build();
        let remote = OperationOptions::builder()
            .engine(EngineKind::TarGz)
            .destination(Destination::remote(server, "/srv"))
            .build();
        let target = BackupTarget::resolve("Docs", &timestamp(), &remote, &context);
        assert_eq!(target.folder(), Path::new("/srv"));
        assert_eq!(
            target.local_artifact_path(),
            PathBuf::from("/tmp/staging/Backup-Docs-2024-03-09_07-05.tar.gz")
        );
        assert_eq!(
            target.remote_artifact_path(),
            Some(PathBuf::from("/srv/Backup-Docs-2024-03-09_07-05.tar.gz"))
        );
        assert_eq!(target.prefix(), "Backup-Docs-");
    }
}

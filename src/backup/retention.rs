//! Listing and rotation of a set's previous backups.

use crate::backup::fs_util::{move_path, rmtree_best_effort};
use crate::backup::remote::{connect_timeout, RemoteSession, RemoteTransport};
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use crate::backup::target::{BackupTarget, TIMESTAMP_FORMAT};
use chrono::NaiveDateTime;
use itertools::Itertools;
use std::cmp::Reverse;
use std::path::PathBuf;

const ARCHIVE_SUFFIXES: [&str; 3] = [".tar", ".tar.gz", ".tar.bz2"];
const TIMESTAMP_LEN: usize = "yyyy-mm-dd_hh-mm".len();

/// True when `name` is `<prefix><timestamp>[.ext]`. A bare prefix match would also
/// claim backups of a set whose name extends this one (`Docs` vs `Docs-old`).
pub fn is_backup_of(name: &str, prefix: &str) -> bool {
    name.strip_prefix(prefix)
        .and_then(|rest| rest.get(..TIMESTAMP_LEN))
        .is_some_and(|timestamp| NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).is_ok())
}

pub fn is_archive_name(name: &str) -> bool {
    ARCHIVE_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Keep the `n` most recent backups
    KeepNewest(usize),
    /// Keep only the newest backup and reuse it as the base of the next mirror
    Incremental,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RotationOutcome {
    pub deleted: Vec<String>,
    /// Name of the backup moved to become the new artifact
    pub reused: Option<String>,
}

enum Store {
    Local(PathBuf),
    Remote {
        session: Box<dyn RemoteSession>,
        folder: PathBuf,
    },
}

/// Old backups of one set at one destination.
pub struct RetentionManager {
    store: Store,
    prefix: String,
}

impl RetentionManager {
    /// Opens the target's destination, connecting to it when remote.
    pub fn open(target: &BackupTarget, transport: &dyn RemoteTransport) -> Result<Self> {
        let store = match target.remote() {
            Some((server, folder)) => Store::Remote {
                session: transport.connect(server, connect_timeout(server))?,
                folder: folder.to_path_buf(),
            },
            None => Store::Local(target.folder().to_path_buf()),
        };
        Ok(Self {
            store,
            prefix: target.prefix(),
        })
    }

    /// Names of the set's backups, newest first.
    pub fn list_existing(&mut self) -> Result<Vec<String>> {
        let names: Vec<String> = match &mut self.store {
            Store::Local(folder) => {
                if !folder.is_dir() {
                    return Ok(Vec::new());
                }
                std::fs::read_dir(&*folder)?
                    .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
                    .collect::<std::io::Result<_>>()?
            }
            Store::Remote { session, folder } => session
                .list_dir(folder)
                .add_msg(format!("Listing remote folder {:?} failed", folder))?,
        };
        Ok(names
            .into_iter()
            .filter(|name| is_backup_of(name, &self.prefix))
            .sorted_by_key(|name| Reverse(name.clone()))
            .collect())
    }

    fn is_dir(&mut self, name: &str) -> bool {
        match &mut self.store {
            Store::Local(folder) => folder.join(name).is_dir(),
            Store::Remote { session, folder } => session.is_folder(&folder.join(name)).unwrap_or(false),
        }
    }

    /// Best-effort removal; failures of single entries are logged and skipped.
    fn delete(&mut self, name: &str) {
        match &mut self.store {
            Store::Local(folder) => {
                let path = folder.join(name);
                tracing::debug!("Removing old backup {:?}", path);
                rmtree_best_effort(&path, |failed, e| {
                    tracing::error!("Could not remove {:?}: {}", failed, e)
                });
            }
            Store::Remote { session, folder } => {
                let path = folder.join(name);
                tracing::debug!("Removing old remote backup {:?}", path);
                if let Err(e) = session.remove(&path) {
                    tracing::error!("Could not remove remote backup {:?}: {}", path, e);
                }
            }
        }
    }

    /// Applies `policy`. `new_artifact` is the name the run is about to produce; in
    /// incremental mode the surviving mirror is moved there so it is updated in place.
    pub fn rotate(&mut self, policy: RetentionPolicy, new_artifact: &str) -> Result<RotationOutcome> {
        let existing = self.list_existing()?;
        let mut outcome = RotationOutcome::default();

        match policy {
            RetentionPolicy::KeepNewest(keep) => {
                for name in existing.into_iter().skip(keep) {
                    self.delete(&name);
                    outcome.deleted.push(name);
                }
            }
            RetentionPolicy::Incremental => {
                let mut existing = existing.into_iter();
                let Some(newest) = existing.next() else {
                    return Ok(outcome);
                };
                for name in existing {
                    self.delete(&name);
                    outcome.deleted.push(name);
                }

                if !is_archive_name(&newest) && self.is_dir(&newest) {
                    if newest != new_artifact {
                        self.move_local(&newest, new_artifact)?;
                    }
                    outcome.reused = Some(newest);
                } else {
                    tracing::debug!("{} is not a mirror backup, removing it", newest);
                    self.delete(&newest);
                    outcome.deleted.push(newest);
                }
            }
        }
        Ok(outcome)
    }

    fn move_local(&mut self, from: &str, to: &str) -> Result<()> {
        match &mut self.store {
            Store::Local(folder) => {
                tracing::debug!("Moving {:?} to {:?}", folder.join(from), folder.join(to));
                move_path(folder.join(from), folder.join(to))
            }
            Store::Remote { .. } => Ok(()),
        }
    }
}

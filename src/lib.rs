//! # pbackup
//!
//! The backup/restore operation engine of a personal backup utility.
//!
//! ## Features
//!
//! - **Archive engines**: `tar`, `tar.gz` and `tar.bz2` through the system `tar`, with an
//!   in-process fallback when no binary is available
//! - **Mirror engines**: `rsync` (optionally incremental), a pure copy fallback, and a
//!   direct SFTP push for remote destinations
//! - **Remote destinations**: SSH/SFTP upload, listing, rotation and restore download
//! - **Retention**: keep the `n` most recent backups of a set, or roll a single
//!   incremental mirror forward
//! - **Cooperative cancellation**: every live child process is killed and the operation
//!   unwinds at the next checkpoint
//!
//! ## Quick Start
//!
//! ```no_run
//! use pbackup::backup::context::AppContext;
//! use pbackup::backup::operation::backup::{BackupKind, BackupOperation};
//! use pbackup::backup::options::OperationOptions;
//! use std::sync::Arc;
//!
//! let options: OperationOptions = serde_yml::from_reader(std::fs::File::open("set.yml")?)?;
//! let operation = BackupOperation::new(
//!     BackupKind::set("Documents", false),
//!     options,
//!     Arc::new(AppContext::from_env()),
//! )?;
//! let (handle, worker) = operation.spawn();
//! while handle.result().is_none() {
//!     println!("{:?}", handle.get_progress());
//!     std::thread::sleep(std::time::Duration::from_millis(100));
//! }
//! let _ = worker.join();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backup;

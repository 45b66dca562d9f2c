use clap::{Parser, Subcommand};
use pbackup::backup::context::AppContext;
use pbackup::backup::operation::backup::{BackupKind, BackupOperation};
use pbackup::backup::operation::restore::RestoreOperation;
use pbackup::backup::operation::{OperationHandle, OperationResult};
use pbackup::backup::options::{Destination, OperationOptions, RestoreOptions};
use pbackup::backup::remote::sftp::SftpTransport;
use pbackup::backup::remote::RemoteTransport;
use pbackup::backup::result_error::error::Error;
use pbackup::backup::result_error::result::Result;
use pbackup::backup::result_error::AddMsg;
use serde::de::DeserializeOwned;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use validator::Validate;

const PROGRESS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Runs a backup or a restore now
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up the paths of a set, or a one-time backup when no set is given
    Backup {
        /// YAML file holding the backup options
        #[arg(short, long)]
        options: PathBuf,
        /// Name of the set, omitted for a one-time backup
        #[arg(short, long)]
        set: Option<String>,
        /// Run the set even if it is disabled
        #[arg(short, long)]
        force: bool,
    },
    /// Restore an archive or a mirror folder
    Restore {
        /// YAML file holding the restore options
        #[arg(short, long)]
        options: PathBuf,
    },
    /// Check that the remote destination of a backup is reachable
    TestConnection {
        /// YAML file holding the backup options
        #[arg(short, long)]
        options: PathBuf,
    },
}

fn load<T: DeserializeOwned + Validate>(path: &Path) -> Result<T> {
    let file = File::open(path)
        .map_err(Error::from)
        .add_msg(format!("Open options file failed: {:?}", path))?;
    let options: T = serde_yml::from_reader(file)
        .map_err(Error::from)
        .add_msg(format!("Parse YAML options failed: {:?}", path))?;
    options
        .validate()
        .map_err(Error::from)
        .add_msg(format!("Options validation failed: {:?}", path))?;
    Ok(options)
}

/// Logs progress changes until the worker finished.
fn follow(handle: OperationHandle, worker: JoinHandle<OperationResult>) -> OperationResult {
    let mut last = handle.get_progress();
    while handle.result().is_none() && !worker.is_finished() {
        std::thread::sleep(PROGRESS_POLL_INTERVAL);
        let progress = handle.get_progress();
        if progress != last {
            debug!(
                "{} {}/{} {}",
                progress.status, progress.current, progress.total, progress.current_name
            );
            last = progress;
        }
    }
    match worker.join() {
        Ok(result) => result,
        Err(_) => OperationResult::InternalError("worker thread panicked".to_string()),
    }
}

fn run(command: Command, app: Arc<AppContext>) -> Result<OperationResult> {
    match command {
        Command::Backup {
            options,
            set,
            force,
        } => {
            let kind = match set {
                Some(name) => BackupKind::set(name, force),
                None => BackupKind::OneTime,
            };
            let operation = BackupOperation::new(kind, load(&options)?, app)?;
            let (handle, worker) = operation.spawn();
            Ok(follow(handle, worker))
        }
        Command::Restore { options } => {
            let operation = RestoreOperation::new(load::<RestoreOptions>(&options)?, app)?;
            let (handle, worker) = operation.spawn();
            Ok(follow(handle, worker))
        }
        Command::TestConnection { options } => {
            let options: OperationOptions = load(&options)?;
            let Destination::RemoteSsh { server, folder } = options.destination() else {
                error!("The destination is not a remote server");
                return Ok(OperationResult::Failed);
            };
            match SftpTransport.test_connection(server, folder) {
                Ok(true) => {
                    info!("Connected to {} and found {:?}", server.host(), folder);
                    Ok(OperationResult::Success)
                }
                Ok(false) => {
                    error!("Connected to {} but {:?} is not a folder", server.host(), folder);
                    Ok(OperationResult::Failed)
                }
                Err(Error::Connection(e)) => {
                    error!("{}", e.user_message());
                    Ok(OperationResult::Failed)
                }
                Err(e) => Err(e),
            }
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let app = Arc::new(AppContext::from_env());
    let result = match run(args.command, app) {
        Ok(result) => result,
        Err(e) => {
            error!("{e}");
            OperationResult::InternalError(e.to_string())
        }
    };
    exit(result.exit_code());
}

//! User commands run before and after a backup, with `[token]` substitution.

use crate::backup::process::{CommandLine, ProcessRunner};
use crate::backup::progress::{OperationStatus, ProgressTracker};
use crate::backup::result_error::result::Result;
use crate::backup::target::BackupTarget;
use derive_more::Display;
use zeroize::Zeroizing;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum CommandStage {
    #[display("before")]
    Before,
    #[display("after")]
    After,
}

/// Values of the `[token]` placeholders a user command may reference.
///
/// `\[token]` yields the literal `[token]`. Unknown tokens, and `[successful]` before the
/// result is known, are left untouched.
pub struct CommandTokens {
    values: Vec<(&'static str, Zeroizing<String>)>,
}

impl CommandTokens {
    pub fn for_backup(target: &BackupTarget, date: &str) -> Result<Self> {
        let (host, username, password, port) = match target.remote() {
            Some((server, _)) => (
                server.host().clone(),
                server.username().clone(),
                server.password().reveal()?,
                server.port().to_string(),
            ),
            None => Default::default(),
        };
        let values = vec![
            ("backup", target.artifact_name().clone()),
            ("set", target.label().clone()),
            ("date", date.to_string()),
            ("destination", target.folder().to_string_lossy().into_owned()),
            ("remote_host", host),
            ("remote_username", username),
            ("remote_port", port),
        ]
        .into_iter()
        .map(|(token, value)| (token, Zeroizing::new(value)))
        .chain(std::iter::once(("remote_password", password)))
        .collect();
        Ok(Self { values })
    }

    pub fn with_successful(mut self, successful: bool) -> Self {
        let value = if successful { "1" } else { "0" };
        self.values
            .push(("successful", Zeroizing::new(value.to_string())));
        self
    }

    fn value(&self, token: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(name, _)| *name == token)
            .map(|(_, value)| value.as_str())
    }

    pub fn substitute(&self, text: &str) -> Zeroizing<String> {
        let mut out = Zeroizing::new(String::with_capacity(text.len()));
        let mut rest = text;
        while let Some(pos) = rest.find('[') {
            let escaped = rest[..pos].ends_with('\\');
            let head = if escaped { &rest[..pos - 1] } else { &rest[..pos] };
            out.push_str(head);

            let after = &rest[pos + 1..];
            let token = after
                .find(']')
                .map(|end| &after[..end])
                .filter(|name| self.value(name).is_some());
            match (token, escaped) {
                (Some(name), true) => {
                    out.push('[');
                    out.push_str(name);
                    out.push(']');
                    rest = &after[name.len() + 1..];
                }
                (Some(name), false) => {
                    out.push_str(self.value(name).unwrap_or_default());
                    rest = &after[name.len() + 1..];
                }
                (None, escaped) => {
                    if escaped {
                        out.push('\\');
                    }
                    out.push('[');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

/// Runs a user command through the shell. A failing command is logged but never fails
/// the backup; only cancellation is propagated.
pub fn run_user_command(
    runner: &ProcessRunner,
    progress: &ProgressTracker,
    stage: CommandStage,
    command: &str,
    tokens: &CommandTokens,
) -> Result<()> {
    progress.enter(OperationStatus::ExecutingUserCommand, 1);
    progress.advance(1, "");
    tracing::info!("Executing the {} command", stage);

    let command = CommandLine::Shell(tokens.substitute(command).to_string());
    match runner.run(&command, None) {
        Ok(exit) if exit.success() => {
            tracing::debug!("The {} command completed", stage);
            Ok(())
        }
        Ok(exit) => {
            tracing::error!(
                "The {} command exited with status {}. Errors:\n{}",
                stage,
                exit.code.map_or("<signal>".to_string(), |c| c.to_string()),
                indent::indent_all_with("  ", exit.stderr)
            );
            Ok(())
        }
        Err(e) if e.is_cancelled() => Err(e),
        Err(e) => {
            tracing::error!("The {} command could not be started: {}", stage, e);
            Ok(())
        }
    }
}

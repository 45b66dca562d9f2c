use crate::backup::engine::{skip_if_missing, BackupReport, EngineContext};
use crate::backup::exclude::WalkPolicy;
use crate::backup::fs_util::mirror_path;
use crate::backup::progress::OperationStatus;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use std::path::PathBuf;

/// Local mirror without an rsync binary. Each source keeps its full path below the
/// artifact directory, as `rsync -R` would.
#[derive(Clone, Debug)]
pub struct CopyFallbackEngine {
    incremental: bool,
}

impl CopyFallbackEngine {
    pub fn new(incremental: bool) -> Self {
        Self { incremental }
    }

    pub fn run(&self, ctx: &EngineContext, paths: &[PathBuf]) -> Result<BackupReport> {
        let artifact = ctx.target.local_artifact_path();
        std::fs::create_dir_all(&artifact)
            .map_err(Error::from)
            .add_msg(format!("Creating mirror folder {:?} failed", artifact))?;
        let policy = WalkPolicy::from_options(ctx.options)?;
        let mut report = BackupReport::default();
        ctx.progress.enter(OperationStatus::BackingUp, paths.len());

        for (i, path) in paths.iter().enumerate() {
            ctx.cancel.checkpoint()?;
            ctx.progress.advance(i + 1, path.to_string_lossy());
            if skip_if_missing(path, &mut report) {
                continue;
            }
            if let Err(e) = mirror_path(path, &artifact, &policy, self.incremental) {
                tracing::error!(
                    "Copying {:?} failed:\n{}",
                    path,
                    indent::indent_all_with("  ", e.to_string())
                );
                report.mark_failed(path);
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::context::AppContext;
    use crate::backup::engine::test_support::{temp_dir, Fixture};
    use crate::backup::engine::Engine;
    use crate::backup::fs_util::join_full_path;
    use crate::backup::options::{Destination, EngineKind, OperationOptions};
    use crate::backup::remote::testing::LocalDirTransport;

    #[test]
    fn test_copy_fallback_mirrors_and_skips_hidden() {
        let src = temp_dir();
        let dest = temp_dir();
        let docs = src.path().join("docs");
        std::fs::create_dir_all(&docs).unwrap();
        std::fs::write(docs.join("a.txt"), "a").unwrap();
        std::fs::write(docs.join(".secret"), "s").unwrap();
        let single = src.path().join("single.txt");
        std::fs::write(&single, "1").unwrap();

        let options = OperationOptions::builder()
            .engine(EngineKind::Rsync)
            .destination(Destination::local(dest.path()))
            .build();
        let app = AppContext::builder().temp_dir(dest.path()).build();
        let fixture = Fixture::new(options, app, LocalDirTransport::default());
        let engine = Engine::select(&fixture.options, &fixture.app, false);
        assert!(matches!(engine, Engine::CopyFallback(_)));

        let report = engine
            .run(&fixture.context(), &[docs.clone(), single.clone()])
            .unwrap();
        assert!(report.is_success());

        let artifact = fixture.target.local_artifact_path();
        let mirrored = join_full_path(&artifact, &docs);
        assert_eq!(std::fs::read_to_string(mirrored.join("a.txt")).unwrap(), "a");
        assert!(!mirrored.join(".secret").exists());
        assert_eq!(
            std::fs::read_to_string(join_full_path(&artifact, &single)).unwrap(),
            "1"
        );
    }
}

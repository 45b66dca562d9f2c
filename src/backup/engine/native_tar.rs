use crate::backup::compress::Compression;
use crate::backup::engine::{skip_if_missing, BackupReport, EngineContext};
use crate::backup::exclude::WalkPolicy;
use crate::backup::finish::Finish;
use crate::backup::fs_util::join_full_path;
use crate::backup::progress::OperationStatus;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use std::fs::File;
use std::io::{BufWriter, IntoInnerError, Write};
use std::path::{Path, PathBuf};

/// Writes the archive in-process when no `tar` binary is available.
///
/// One writer stays open for the whole run, so every variant gets per-path progress and
/// cancellation checkpoints. Member names are the source paths without the root.
#[derive(Clone, Debug)]
pub struct NativeTarEngine {
    compression: Compression,
}

impl NativeTarEngine {
    pub fn new(compression: Compression) -> Self {
        Self { compression }
    }

    pub fn run(&self, ctx: &EngineContext, paths: &[PathBuf]) -> Result<BackupReport> {
        let archive = ctx.target.local_artifact_path();
        let policy = WalkPolicy::from_options(ctx.options)?;
        let mut report = BackupReport::default();
        ctx.progress.enter(OperationStatus::BackingUp, paths.len());

        let file = File::create(&archive)
            .map_err(Error::from)
            .add_msg(format!("Creating archive {:?} failed", archive))?;
        let mut builder = tar::Builder::new(self.compression.build_compressor(BufWriter::new(file)));
        builder.follow_symlinks(*ctx.options.follow_links());
        builder.sparse(*ctx.options.sparse());

        for (i, path) in paths.iter().enumerate() {
            ctx.cancel.checkpoint()?;
            ctx.progress.advance(i + 1, path.to_string_lossy());
            if skip_if_missing(path, &mut report) {
                continue;
            }
            if let Err(e) = append_path(&mut builder, path, &policy) {
                tracing::error!("Archiving {:?} failed:\n{}", path, indent::indent_all_with("  ", e.to_string()));
                report.mark_failed(path);
            }
        }

        builder
            .into_inner()?
            .finish()?
            .into_inner()
            .map_err(IntoInnerError::into_error)?
            .sync_all()?;
        Ok(report)
    }
}

fn member_name(path: &Path) -> PathBuf {
    join_full_path(PathBuf::new(), path)
}

fn append_path<W: Write>(builder: &mut tar::Builder<W>, root: &Path, policy: &WalkPolicy) -> Result<()> {
    let errors: Vec<Error> = policy
        .walk(root)
        .filter_map(|entry| {
            let res = entry.and_then(|entry| {
                let name = member_name(entry.path());
                if name.as_os_str().is_empty() {
                    return Ok(());
                }
                tracing::trace!("Adding {:?} as {:?}", entry.path(), name);
                builder
                    .append_path_with_name(entry.path(), &name)
                    .map_err(Error::from)
                    .add_msg(format!("Adding {:?} failed", entry.path()))
            });
            res.err()
        })
        .collect();
    crate::backup::result_error::result::convert_error_vec(errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::context::AppContext;
    use crate::backup::engine::test_support::{archive_members, temp_dir, Fixture};
    use crate::backup::engine::Engine;
    use crate::backup::exclude::ExcludePattern;
    use crate::backup::options::{Destination, EngineKind, OperationOptions};
    use crate::backup::remote::testing::LocalDirTransport;

    fn fixture(engine: EngineKind, dest: &Path, include_hidden: bool) -> Fixture {
        let app = AppContext::builder().temp_dir(dest).build();
        let options = OperationOptions::builder()
            .engine(engine)
            .destination(Destination::local(dest))
            .include_hidden(include_hidden)
            .excludes(vec![ExcludePattern::new("*.tmp").unwrap()])
            .build();
        Fixture::new(options, app, LocalDirTransport::default())
    }

    fn member(path: &Path) -> String {
        member_name(path).to_string_lossy().into_owned()
    }

    #[test]
    fn test_member_name_strips_root() {
        assert_eq!(member_name(Path::new("/home/a/f")), PathBuf::from("home/a/f"));
    }

    #[test]
    fn test_native_archives_for_every_compression() {
        for engine_kind in [EngineKind::Tar, EngineKind::TarGz, EngineKind::TarBz2] {
            let src = temp_dir();
            let dest = temp_dir();
            let docs = src.path().join("docs");
            std::fs::create_dir_all(docs.join("sub")).unwrap();
            std::fs::write(docs.join("a.txt"), "a").unwrap();
            std::fs::write(docs.join("sub/b.txt"), "b").unwrap();
            std::fs::write(docs.join("skip.tmp"), "s").unwrap();
            std::fs::write(docs.join(".hidden"), "h").unwrap();

            let fixture = fixture(engine_kind, dest.path(), false);
            let engine = Engine::select(&fixture.options, &fixture.app, false);
            assert!(matches!(engine, Engine::NativeTar(_)));
            let report = engine.run(&fixture.context(), &[docs.clone()]).unwrap();
            assert!(report.is_success());

            let members = archive_members(&fixture.target.local_artifact_path());
            assert_eq!(
                members,
                vec![
                    member(&docs),
                    member(&docs.join("a.txt")),
                    member(&docs.join("sub")),
                    member(&docs.join("sub/b.txt")),
                ],
                "engine {engine_kind}"
            );
        }
    }

    #[test]
    fn test_native_includes_hidden_when_asked() {
        let src = temp_dir();
        let dest = temp_dir();
        let hidden = src.path().join(".config");
        std::fs::write(&hidden, "c").unwrap();

        let fixture = fixture(EngineKind::Tar, dest.path(), true);
        let engine = Engine::select(&fixture.options, &fixture.app, false);
        engine.run(&fixture.context(), &[src.path().to_path_buf()]).unwrap();
        let members = archive_members(&fixture.target.local_artifact_path());
        assert!(members.contains(&member(&hidden)));
    }

    #[test]
    fn test_native_cancelled_before_first_path() {
        let src = temp_dir();
        let dest = temp_dir();
        std::fs::write(src.path().join("a"), "a").unwrap();

        let fixture = fixture(EngineKind::TarGz, dest.path(), false);
        fixture.cancel.cancel();
        let engine = Engine::select(&fixture.options, &fixture.app, false);
        let result = engine.run(&fixture.context(), &[src.path().join("a")]);
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}

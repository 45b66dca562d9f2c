//! Local filesystem helpers: best-effort tree removal, moves and the mirror copy used
//! when no rsync binary is available.

use crate::backup::exclude::WalkPolicy;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::{convert_error_vec, Result};
use crate::backup::result_error::AddMsg;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Joins an absolute `path` below `base`, keeping every component: `/d` + `/home/a`
/// gives `/d/home/a`.
pub fn join_full_path<P1: AsRef<Path>, P2: AsRef<Path>>(base: P1, path: P2) -> PathBuf {
    path.as_ref()
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name),
            _ => None,
        })
        .fold(base.as_ref().to_path_buf(), |joined, name| joined.join(name))
}

/// Deletes `path` (file, symlink or tree), calling `on_error` for every entry that could
/// not be removed and carrying on with the rest. Returns the number of failures.
pub fn rmtree_best_effort<P, F>(path: P, mut on_error: F) -> usize
where
    P: AsRef<Path>,
    F: FnMut(&Path, &io::Error),
{
    let path = path.as_ref();
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return 0,
        Err(e) => {
            on_error(path, &e);
            return 1;
        }
    };
    if !metadata.is_dir() {
        return match fs::remove_file(path) {
            Ok(_) => 0,
            Err(e) => {
                on_error(path, &e);
                1
            }
        };
    }

    let mut failures = 0;
    for entry in WalkDir::new(path).contents_first(true) {
        let res = match entry {
            Ok(entry) if entry.file_type().is_dir() => {
                fs::remove_dir(entry.path()).map_err(|e| (entry.path().to_path_buf(), e))
            }
            Ok(entry) => fs::remove_file(entry.path()).map_err(|e| (entry.path().to_path_buf(), e)),
            Err(e) => {
                let failed = e.path().unwrap_or(path).to_path_buf();
                Err((failed, io::Error::other(e.to_string())))
            }
        };
        if let Err((failed, e)) = res {
            failures += 1;
            on_error(&failed, &e);
        }
    }
    failures
}

/// [`rmtree_best_effort`] logging each failure as a warning.
pub fn remove_logged<P: AsRef<Path>>(path: P) -> usize {
    rmtree_best_effort(path, |failed, e| {
        tracing::warn!("Could not delete {:?}: {}", failed, e)
    })
}

/// Renames `from` to `to`, copying and deleting when a rename is not possible.
pub fn move_path<P1: AsRef<Path>, P2: AsRef<Path>>(from: P1, to: P2) -> Result<()> {
    let (from, to) = (from.as_ref(), to.as_ref());
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    tracing::debug!("Rename {:?} -> {:?} failed, copying instead", from, to);
    if fs::symlink_metadata(from)?.is_dir() {
        copy_dir_contents(from, to)?;
    } else {
        fs::copy(from, to)?;
    }
    remove_logged(from);
    Ok(())
}

fn copy_file_preserving(src: &Path, dst: &Path) -> io::Result<()> {
    if fs::symlink_metadata(dst).is_ok_and(|m| m.file_type().is_symlink()) {
        fs::remove_file(dst)?;
    }
    fs::copy(src, dst)?;
    let modified = fs::metadata(src)?.modified()?;
    fs::File::options().write(true).open(dst)?.set_modified(modified)
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    let target = fs::read_link(src)?;
    if fs::symlink_metadata(dst).is_ok() {
        fs::remove_file(dst)?;
    }
    std::os::unix::fs::symlink(target, dst)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    fs::copy(src, dst).map(|_| ())
}

/// True when `dst` is missing, older than `src`, or of a different size.
fn needs_update(src: &fs::Metadata, dst: &Path) -> bool {
    match fs::metadata(dst) {
        Ok(dst) => {
            let newer = match (src.modified(), dst.modified()) {
                (Ok(src), Ok(dst)) => src > dst,
                _ => true,
            };
            newer || src.len() != dst.len()
        }
        Err(_) => true,
    }
}

/// Copies the directory `src` onto `dst`, overwriting existing files.
pub fn copy_dir_contents<P1: AsRef<Path>, P2: AsRef<Path>>(src: P1, dst: P2) -> Result<()> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    fs::create_dir_all(dst)?;
    let errors: Vec<Error> = WalkDir::new(src)
        .min_depth(1)
        .into_iter()
        .filter_map(|entry| {
            let res = entry.map_err(Error::from).and_then(|entry| {
                let target = dst.join(entry.path().strip_prefix(src)?);
                let file_type = entry.file_type();
                if file_type.is_dir() {
                    fs::create_dir_all(&target)?;
                } else if file_type.is_symlink() {
                    copy_symlink(entry.path(), &target)?;
                } else {
                    copy_file_preserving(entry.path(), &target)?;
                }
                Ok(())
            });
            res.err()
        })
        .collect();
    convert_error_vec(errors)
}

/// Mirrors `source` into `dest_root`, keeping its full absolute path below it.
///
/// With `incremental`, files are only copied when missing, older or resized on the
/// destination side, and entries of the mirrored subtree that no longer exist in the
/// source are deleted.
pub fn mirror_path<P1: AsRef<Path>, P2: AsRef<Path>>(
    source: P1,
    dest_root: P2,
    policy: &WalkPolicy,
    incremental: bool,
) -> Result<()> {
    let source = source.as_ref();
    let dest_root = dest_root.as_ref();

    let errors: Vec<Error> = policy
        .walk(source)
        .filter_map(|entry| {
            let res = entry.and_then(|entry| {
                let target = join_full_path(dest_root, entry.path());
                let file_type = entry.file_type();
                if file_type.is_dir() {
                    fs::create_dir_all(&target)?;
                    return Ok(());
                }
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                if file_type.is_symlink() {
                    copy_symlink(entry.path(), &target)?;
                } else if !incremental || needs_update(&entry.metadata()?, &target) {
                    tracing::trace!("Copying {:?} to {:?}", entry.path(), target);
                    copy_file_preserving(entry.path(), &target)?;
                }
                Ok(())
            });
            res.add_msg(format!("Copying {:?} failed", source)).err()
        })
        .collect();

    if incremental {
        delete_vanished(source, &join_full_path(dest_root, source));
    }
    convert_error_vec(errors)
}

/// Removes entries of `mirror` whose counterpart below `source` is gone.
fn delete_vanished(source: &Path, mirror: &Path) {
    if !mirror.is_dir() {
        return;
    }
    let mut walker = WalkDir::new(mirror).min_depth(1).into_iter();
    while let Some(entry) = walker.next() {
        let Ok(entry) = entry else { continue };
        let Ok(relative) = entry.path().strip_prefix(mirror) else {
            continue;
        };
        if fs::symlink_metadata(source.join(relative)).is_err() {
            tracing::debug!("Deleting {:?}, gone from the source", entry.path());
            if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
            remove_logged(entry.path());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::exclude::{ExcludePattern, ExcludeSet};
    use tempfile::TempDir;

    fn everything() -> WalkPolicy {
        WalkPolicy::new(true, true, false, ExcludeSet::empty())
    }

    #[test]
    fn test_join_full_path() {
        assert_eq!(
            join_full_path("/dest", "/home/alice/docs"),
            PathBuf::from("/dest/home/alice/docs")
        );
        assert_eq!(join_full_path("/dest", "/"), PathBuf::from("/dest"));
    }

    #[test]
    fn test_rmtree_best_effort() {
        let temp_dir = TempDir::new().unwrap();
        let tree = temp_dir.path().join("tree");
        fs::create_dir_all(tree.join("a/b")).unwrap();
        fs::write(tree.join("a/b/file"), "x").unwrap();
        fs::write(tree.join("top"), "y").unwrap();

        let mut failed = Vec::new();
        assert_eq!(rmtree_best_effort(&tree, |p, _| failed.push(p.to_path_buf())), 0);
        assert!(failed.is_empty());
        assert!(!tree.exists());

        // missing paths are fine
        assert_eq!(rmtree_best_effort(&tree, |_, _| panic!("no errors expected")), 0);

        let file = temp_dir.path().join("file");
        fs::write(&file, "z").unwrap();
        assert_eq!(remove_logged(&file), 0);
        assert!(!file.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_rmtree_does_not_follow_symlinks() {
        let temp_dir = TempDir::new().unwrap();
        let outside = temp_dir.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("precious"), "keep").unwrap();
        let tree = temp_dir.path().join("tree");
        fs::create_dir_all(&tree).unwrap();
        std::os::unix::fs::symlink(&outside, tree.join("link")).unwrap();

        assert_eq!(remove_logged(&tree), 0);
        assert!(outside.join("precious").exists());
    }

    #[test]
    fn test_move_path() {
        let temp_dir = TempDir::new().unwrap();
        let from = temp_dir.path().join("from");
        fs::create_dir_all(from.join("inner")).unwrap();
        fs::write(from.join("inner/f"), "1").unwrap();
        let to = temp_dir.path().join("to");

        move_path(&from, &to).unwrap();
        assert!(!from.exists());
        assert_eq!(fs::read_to_string(to.join("inner/f")).unwrap(), "1");
    }

    #[test]
    fn test_mirror_path_keeps_full_path_and_excludes() {
        let src = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let docs = src.path().join("docs");
        fs::create_dir_all(&docs).unwrap();
        fs::write(docs.join("a.txt"), "a").unwrap();
        fs::write(docs.join("b.tmp"), "b").unwrap();

        let policy = WalkPolicy::new(
            true,
            true,
            false,
            ExcludeSet::new(&[ExcludePattern::new("*.tmp").unwrap()]).unwrap(),
        );
        mirror_path(&docs, dest.path(), &policy, false).unwrap();

        let mirrored = join_full_path(dest.path(), &docs);
        assert_eq!(fs::read_to_string(mirrored.join("a.txt")).unwrap(), "a");
        assert!(!mirrored.join("b.tmp").exists());
    }

    #[test]
    fn test_incremental_mirror_updates_and_deletes() {
        let src = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let docs = src.path().join("docs");
        fs::create_dir_all(docs.join("old_dir")).unwrap();
        fs::write(docs.join("keep.txt"), "v1").unwrap();
        fs::write(docs.join("gone.txt"), "bye").unwrap();
        fs::write(docs.join("old_dir/inner"), "bye").unwrap();
        mirror_path(&docs, dest.path(), &everything(), true).unwrap();

        fs::write(docs.join("keep.txt"), "version two").unwrap();
        fs::remove_file(docs.join("gone.txt")).unwrap();
        fs::remove_dir_all(docs.join("old_dir")).unwrap();
        mirror_path(&docs, dest.path(), &everything(), true).unwrap();

        let mirrored = join_full_path(dest.path(), &docs);
        assert_eq!(
            fs::read_to_string(mirrored.join("keep.txt")).unwrap(),
            "version two"
        );
        assert!(!mirrored.join("gone.txt").exists());
        assert!(!mirrored.join("old_dir").exists());
    }

    #[test]
    fn test_copy_dir_contents_overwrites() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("d")).unwrap();
        fs::write(src.path().join("d/f"), "new").unwrap();
        fs::create_dir_all(dst.path().join("d")).unwrap();
        fs::write(dst.path().join("d/f"), "old").unwrap();

        copy_dir_contents(src.path(), dst.path()).unwrap();
        assert_eq!(fs::read_to_string(dst.path().join("d/f")).unwrap(), "new");
    }
}

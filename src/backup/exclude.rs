//! Exclude globs and the filtered directory walk shared by the in-process engines.

use crate::backup::function_path;
use crate::backup::options::OperationOptions;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddFunctionName;
use derive_more::{Display, From};
use dyn_iter::{DynIter, IntoDynIterator};
use function_name::named;
use getset::{CopyGetters, Getters};
use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt::Formatter;
use std::path::{Component, Path, PathBuf};
use std::result;
use walkdir::{DirEntry, WalkDir};

/// A single exclude pattern, e.g. `*.tmp`, `cache/**` or `/home/alice/.cache`.
///
/// Displays as the pattern text, which is what gets handed to tar/rsync as
/// `--exclude=<pattern>`.
#[derive(Clone, Debug, From, Display, Serialize, PartialEq, Eq, Getters)]
#[serde(transparent)]
#[getset(get = "pub")]
pub struct ExcludePattern {
    glob: Glob,
}

impl ExcludePattern {
    pub fn new<S: AsRef<str>>(pattern: S) -> Result<Self> {
        Ok(GlobBuilder::new(pattern.as_ref())
            .literal_separator(true)
            .build()?
            .into())
    }

    fn is_absolute(&self) -> bool {
        self.glob.glob().starts_with('/')
    }
}

struct ExcludePatternVisitor;

impl Visitor<'_> for ExcludePatternVisitor {
    type Value = ExcludePattern;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("an exclude glob pattern")
    }

    fn visit_str<E>(self, v: &str) -> result::Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        GlobBuilder::new(v)
            .literal_separator(true)
            .build()
            .map(ExcludePattern::from)
            .map_err(serde::de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for ExcludePattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> result::Result<Self, D::Error> {
        deserializer.deserialize_str(ExcludePatternVisitor)
    }
}

/// Compiled exclude patterns with tar-like matching.
///
/// Absolute patterns match the whole path. Relative patterns match any trailing run of
/// path components, so `*.tmp` excludes `/a/b/c.tmp` and `b/*.tmp` excludes it too.
#[derive(Clone, Debug)]
pub struct ExcludeSet {
    absolute: GlobSet,
    relative: GlobSet,
}

impl ExcludeSet {
    pub fn new(patterns: &[ExcludePattern]) -> Result<Self> {
        let mut absolute = GlobSetBuilder::new();
        let mut relative = GlobSetBuilder::new();
        patterns.iter().for_each(|pattern| {
            if pattern.is_absolute() {
                absolute.add(pattern.glob.clone());
            } else {
                relative.add(pattern.glob.clone());
            }
        });
        Ok(Self {
            absolute: absolute.build()?,
            relative: relative.build()?,
        })
    }

    pub fn empty() -> Self {
        Self {
            absolute: GlobSet::empty(),
            relative: GlobSet::empty(),
        }
    }

    pub fn is_excluded<P: AsRef<Path>>(&self, path: P) -> bool {
        let path = path.as_ref();
        if !self.absolute.is_empty() && self.absolute.is_match(path) {
            return true;
        }
        if self.relative.is_empty() {
            return false;
        }

        let components: Vec<&std::ffi::OsStr> = path
            .components()
            .filter_map(|c| match c {
                Component::Normal(name) => Some(name),
                _ => None,
            })
            .collect();
        (0..components.len()).any(|start| {
            let suffix: PathBuf = components[start..].iter().collect();
            self.relative.is_match(&suffix)
        })
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}

/// Recursion, hidden-file, symlink and exclude policy of a directory walk.
#[derive(Clone, Debug, CopyGetters)]
pub struct WalkPolicy {
    #[getset(get_copy = "pub")]
    recursive: bool,
    #[getset(get_copy = "pub")]
    include_hidden: bool,
    #[getset(get_copy = "pub")]
    follow_links: bool,
    excludes: ExcludeSet,
}

impl WalkPolicy {
    pub fn new(
        recursive: bool,
        include_hidden: bool,
        follow_links: bool,
        excludes: ExcludeSet,
    ) -> Self {
        Self {
            recursive,
            include_hidden,
            follow_links,
            excludes,
        }
    }

    pub fn from_options(options: &OperationOptions) -> Result<Self> {
        Ok(Self::new(
            *options.recursive(),
            *options.include_hidden(),
            *options.follow_links(),
            ExcludeSet::new(options.excludes())?,
        ))
    }

    pub fn excludes(&self) -> &ExcludeSet {
        &self.excludes
    }

    /// Walks `root`, yielding `root` itself first unless it is excluded.
    ///
    /// Excluded directories are not descended into. Hidden entries below `root` are
    /// skipped unless hidden files are included; `root` is always taken because it was
    /// listed explicitly.
    #[named]
    pub fn walk<P: AsRef<Path>>(&self, root: P) -> DynIter<'static, Result<DirEntry>> {
        let excludes = self.excludes.clone();
        let include_hidden = self.include_hidden;
        let max_depth = if self.recursive { usize::MAX } else { 0 };

        WalkDir::new(root.as_ref())
            .follow_links(self.follow_links)
            .max_depth(max_depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| {
                if excludes.is_excluded(entry.path()) {
                    tracing::trace!("Skipping {:?}, matched an exclude pattern", entry.path());
                    return false;
                }
                if entry.depth() > 0 && !include_hidden && is_hidden(entry) {
                    tracing::trace!("Skipping hidden {:?}", entry.path());
                    return false;
                }
                true
            })
            .map(move |res| res.map_err(Error::from).add_fn_name(function_path!()))
            .into_dyn_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn patterns(patterns: &[&str]) -> Vec<ExcludePattern> {
        patterns
            .iter()
            .map(|p| ExcludePattern::new(p).unwrap())
            .collect()
    }

    fn create_tree(dir: &Path) {
        std::fs::create_dir_all(dir.join("sub/deeper")).unwrap();
        std::fs::create_dir_all(dir.join(".git")).unwrap();
        std::fs::write(dir.join("keep.txt"), "k").unwrap();
        std::fs::write(dir.join("drop.tmp"), "d").unwrap();
        std::fs::write(dir.join(".hidden"), "h").unwrap();
        std::fs::write(dir.join(".git/config"), "c").unwrap();
        std::fs::write(dir.join("sub/a.txt"), "a").unwrap();
        std::fs::write(dir.join("sub/deeper/b.tmp"), "b").unwrap();
    }

    fn relative_names(policy: &WalkPolicy, root: &Path) -> Vec<String> {
        policy
            .walk(root)
            .map(|entry| entry.unwrap())
            .filter(|entry| entry.depth() > 0)
            .map(|entry| {
                entry
                    .path()
                    .strip_prefix(root)
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect()
    }

    #[test]
    fn test_pattern_deserialization() {
        let pattern: ExcludePattern = serde_json::from_str("\"*.tmp\"").unwrap();
        assert_eq!(pattern.to_string(), "*.tmp");
        assert!(serde_json::from_str::<ExcludePattern>("\"[unclosed\"").is_err());
    }

    #[test]
    fn test_relative_pattern_matches_any_suffix() {
        let set = ExcludeSet::new(&patterns(&["*.tmp", "cache"])).unwrap();
        assert!(set.is_excluded("/home/alice/x.tmp"));
        assert!(set.is_excluded("/home/alice/deep/down/y.tmp"));
        assert!(set.is_excluded("/home/alice/cache"));
        assert!(!set.is_excluded("/home/alice/x.txt"));
        assert!(!set.is_excluded("/home/alice/cache2"));
    }

    #[test]
    fn test_absolute_pattern_matches_full_path() {
        let set = ExcludeSet::new(&patterns(&["/home/*/secret"])).unwrap();
        assert!(set.is_excluded("/home/alice/secret"));
        assert!(!set.is_excluded("/srv/home/alice/secret"));
        assert!(!set.is_excluded("/home/alice/deep/secret"));
    }

    #[test]
    fn test_empty_set_excludes_nothing() {
        assert!(!ExcludeSet::empty().is_excluded("/anything"));
    }

    #[test]
    fn test_walk_applies_excludes_and_hidden_policy() {
        let temp_dir = TempDir::new().unwrap();
        create_tree(temp_dir.path());

        let policy = WalkPolicy::new(
            true,
            false,
            false,
            ExcludeSet::new(&patterns(&["*.tmp"])).unwrap(),
        );
        let names = relative_names(&policy, temp_dir.path());
        assert_eq!(names, vec!["keep.txt", "sub", "sub/a.txt", "sub/deeper"]);
    }

    #[test]
    fn test_walk_with_hidden_files() {
        let temp_dir = TempDir::new().unwrap();
        create_tree(temp_dir.path());

        let policy = WalkPolicy::new(true, true, false, ExcludeSet::empty());
        let names = relative_names(&policy, temp_dir.path());
        assert!(names.contains(&".hidden".to_string()));
        assert!(names.contains(&".git/config".to_string()));
        assert!(names.contains(&"sub/deeper/b.tmp".to_string()));
    }

    #[test]
    fn test_walk_non_recursive_yields_root_only() {
        let temp_dir = TempDir::new().unwrap();
        create_tree(temp_dir.path());

        let policy = WalkPolicy::new(false, true, false, ExcludeSet::empty());
        let entries: Vec<_> = policy.walk(temp_dir.path()).collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].as_ref().unwrap().path(), temp_dir.path());
    }

    #[test]
    fn test_walk_excluded_root_yields_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("skip.tmp");
        std::fs::write(&file, "x").unwrap();

        let policy = WalkPolicy::new(true, false, false, ExcludeSet::new(&patterns(&["*.tmp"])).unwrap());
        assert_eq!(policy.walk(&file).count(), 0);
    }
}

//! Model discovery.
//!
//! Scans a directory for `.gguf` artifacts and folds split models
//! (`<prefix>-00001-of-00003.gguf`, ...) into one loadable entry each.

mod exclude;

pub use exclude::ExcludeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::{Result, SupervisorError};

pub const MODEL_EXTENSION: &str = "gguf";

static SHARD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(.+)-(\d{5})-of-(\d{5})\.(?i:gguf)$").expect("shard pattern is a valid regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelEntry {
    pub index: usize,
    pub display: String,
    pub primary_path: PathBuf,
    pub base_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard_pattern: Option<String>,
    pub shard_count: usize,
    pub size_bytes: u64,
}

impl ModelEntry {
    pub fn file_name(&self) -> String {
        self.primary_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn is_sharded(&self) -> bool {
        self.shard_pattern.is_some()
    }

    /// All files belonging to this entry, rebuilt from the shard pattern.
    pub fn shard_paths(&self) -> Vec<PathBuf> {
        let Some(pattern) = &self.shard_pattern else {
            return vec![self.primary_path.clone()];
        };

        let mut paths: Vec<PathBuf> = match glob::glob(pattern) {
            Ok(found) => found.filter_map(|p| p.ok()).collect(),
            Err(e) => {
                tracing::warn!("Invalid shard pattern {}: {}", pattern, e);
                Vec::new()
            }
        };
        paths.sort();
        paths
    }
}

/// Base name used for per-model argument lookup.
///
/// Split models resolve to their shared prefix, everything else to the file
/// name minus the `.gguf` extension.
pub fn base_name(file_name: &str) -> String {
    if let Some(caps) = SHARD_RE.captures(file_name) {
        return caps[1].to_string();
    }

    let suffix = format!(".{}", MODEL_EXTENSION);
    if file_name.len() > suffix.len() && file_name.to_lowercase().ends_with(&suffix) {
        return file_name[..file_name.len() - suffix.len()].to_string();
    }
    file_name.to_string()
}

fn is_model_file(file_name: &str) -> bool {
    file_name.to_lowercase().ends_with(&format!(".{}", MODEL_EXTENSION))
}

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub recursive: bool,
    pub exclude: ExcludeSet,
}

impl ScanOptions {
    pub fn from_config(config: &Config) -> Result<Self> {
        let exclude = ExcludeSet::new(&config.exclude_patterns)
            .map_err(|e| SupervisorError::Config(format!("invalid exclude pattern: {}", e)))?;
        Ok(Self {
            recursive: config.recursive_scan,
            exclude,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum GroupKey {
    Shards { dir: PathBuf, prefix: String },
    Single(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Catalog {
    root: PathBuf,
    entries: Vec<ModelEntry>,
}

impl Catalog {
    /// Scans `dir` and requires at least one model.
    pub fn load(dir: &Path, options: &ScanOptions) -> Result<Self> {
        let catalog = Self::scan(dir, options)?;
        if catalog.is_empty() {
            return Err(SupervisorError::CatalogEmpty(dir.to_path_buf()));
        }
        Ok(catalog)
    }

    pub fn scan(dir: &Path, options: &ScanOptions) -> Result<Self> {
        let io_err = |source| SupervisorError::CatalogIo {
            path: dir.to_path_buf(),
            source,
        };

        let root = fs::canonicalize(dir).map_err(io_err)?;
        fs::read_dir(&root).map_err(io_err)?;

        let max_depth = if options.recursive { usize::MAX } else { 1 };
        let mut groups: BTreeMap<GroupKey, Vec<(PathBuf, u64)>> = BTreeMap::new();

        for entry in WalkDir::new(&root).max_depth(max_depth).sort_by_file_name() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!("Skipping unreadable path during scan: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_model_file(&name) {
                continue;
            }

            let path = entry.path().to_path_buf();
            let relative = path.strip_prefix(&root).unwrap_or(&path);
            if options.exclude.is_excluded(relative) {
                tracing::debug!("Excluded model file: {}", relative.display());
                continue;
            }

            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let key = match SHARD_RE.captures(&name) {
                Some(caps) => GroupKey::Shards {
                    dir: path.parent().map(Path::to_path_buf).unwrap_or_default(),
                    prefix: caps[1].to_string(),
                },
                None => GroupKey::Single(path.clone()),
            };
            groups.entry(key).or_default().push((path, size));
        }

        let mut entries: Vec<ModelEntry> = groups.into_iter().map(build_entry).collect();
        entries.sort_by(|a, b| {
            a.display
                .cmp(&b.display)
                .then_with(|| a.primary_path.cmp(&b.primary_path))
        });
        for (index, entry) in entries.iter_mut().enumerate() {
            entry.index = index;
            tracing::debug!("Found model: {} (baseName: {})", entry.display, entry.base_name);
        }

        tracing::info!("Catalog scan of {} found {} models", root.display(), entries.len());
        Ok(Self { root, entries })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entries(&self) -> &[ModelEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&ModelEntry> {
        self.entries.get(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First entry whose display name or primary file name mentions `name`.
    pub fn find_by_name(&self, name: &str) -> Option<&ModelEntry> {
        self.entries
            .iter()
            .find(|e| e.display == name || e.display.contains(name) || e.file_name().contains(name))
    }
}

fn build_entry((key, parts): (GroupKey, Vec<(PathBuf, u64)>)) -> ModelEntry {
    let size_bytes = parts.iter().map(|(_, size)| size).sum::<u64>();
    let primary = parts
        .iter()
        .map(|(path, _)| path)
        .min()
        .cloned()
        .unwrap_or_default();
    let file_name = primary
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    match key {
        GroupKey::Shards { dir, prefix } => {
            let shard_pattern = SHARD_RE.captures(&file_name).map(|caps| {
                let ext = file_name.rsplit('.').next().unwrap_or(MODEL_EXTENSION);
                format!(
                    "{}{}{}-?????-of-{}.{}",
                    glob::Pattern::escape(&dir.to_string_lossy()),
                    MAIN_SEPARATOR,
                    glob::Pattern::escape(&prefix),
                    &caps[3],
                    ext
                )
            });
            ModelEntry {
                index: 0,
                display: format!("{} ({} shards)", prefix, parts.len()),
                primary_path: primary,
                base_name: prefix,
                shard_pattern,
                shard_count: parts.len(),
                size_bytes,
            }
        }
        GroupKey::Single(_) => ModelEntry {
            index: 0,
            display: file_name.clone(),
            base_name: base_name(&file_name),
            primary_path: primary,
            shard_pattern: None,
            shard_count: 1,
            size_bytes,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, rel: &str) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, b"GGUF").unwrap();
    }

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("qwen3-8b-Q4_K_M.gguf"), "qwen3-8b-Q4_K_M");
        assert_eq!(base_name("Big.GGUF"), "Big");
        assert_eq!(base_name("glm-4.5-00002-of-00003.gguf"), "glm-4.5");
        assert_eq!(base_name("notes.txt"), "notes.txt");
    }

    #[test]
    fn test_shards_collapse_into_one_entry() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a-00002-of-00002.gguf");
        touch(dir.path(), "a-00001-of-00002.gguf");
        touch(dir.path(), "b.gguf");

        let catalog = Catalog::scan(dir.path(), &ScanOptions::default()).unwrap();
        assert_eq!(catalog.len(), 2);

        let a = &catalog.entries()[0];
        assert_eq!(a.display, "a (2 shards)");
        assert_eq!(a.base_name, "a");
        assert_eq!(a.shard_count, 2);
        assert_eq!(a.size_bytes, 8);
        assert!(a.primary_path.ends_with("a-00001-of-00002.gguf"));
        assert_eq!(a.shard_paths().len(), 2);

        let b = &catalog.entries()[1];
        assert_eq!(b.display, "b.gguf");
        assert_eq!(b.base_name, "b");
        assert!(!b.is_sharded());
        assert_eq!(b.index, 1);
    }

    #[test]
    fn test_non_recursive_ignores_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "top.gguf");
        touch(dir.path(), "nested/deep.gguf");

        let flat = ScanOptions {
            recursive: false,
            ..ScanOptions::default()
        };
        assert_eq!(Catalog::scan(dir.path(), &flat).unwrap().len(), 1);

        let deep = ScanOptions {
            recursive: true,
            ..ScanOptions::default()
        };
        assert_eq!(Catalog::scan(dir.path(), &deep).unwrap().len(), 2);
    }

    #[test]
    fn test_missing_directory_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Catalog::scan(&dir.path().join("nope"), &ScanOptions::default()).unwrap_err();
        assert!(matches!(err, SupervisorError::CatalogIo { .. }));
    }

    #[test]
    fn test_load_rejects_empty() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "readme.md");
        let err = Catalog::load(dir.path(), &ScanOptions::default()).unwrap_err();
        assert!(matches!(err, SupervisorError::CatalogEmpty(_)));
    }
}

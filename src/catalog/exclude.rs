use glob::{MatchOptions, Pattern, PatternError};
use std::path::Path;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Gitignore-like exclusion list.
///
/// A pattern containing `/` matches the path relative to the model directory,
/// anything else matches the bare file name at any depth.
#[derive(Debug, Clone, Default)]
pub struct ExcludeSet {
    patterns: Vec<(Pattern, bool)>,
}

impl ExcludeSet {
    pub fn new<I, S>(patterns: I) -> Result<Self, PatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut compiled = Vec::new();
        for raw in patterns {
            let raw = raw.as_ref().trim();
            if raw.is_empty() {
                continue;
            }
            let anchored = raw.contains('/');
            compiled.push((Pattern::new(raw.trim_start_matches('/'))?, anchored));
        }
        Ok(Self { patterns: compiled })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn is_excluded(&self, relative: &Path) -> bool {
        let rel = relative.to_string_lossy().replace('\\', "/");
        let name = relative
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        self.patterns.iter().any(|(pattern, anchored)| {
            if *anchored {
                pattern.matches_with(&rel, MATCH_OPTIONS)
            } else {
                pattern.matches_with(&name, MATCH_OPTIONS)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_patterns_match_any_depth() {
        let set = ExcludeSet::new(["mmproj-*.gguf", "draft?.gguf"]).unwrap();
        assert!(set.is_excluded(Path::new("mmproj-f16.gguf")));
        assert!(set.is_excluded(Path::new("vision/mmproj-f16.gguf")));
        assert!(set.is_excluded(Path::new("draft1.gguf")));
        assert!(!set.is_excluded(Path::new("draft12.gguf")));
        assert!(!set.is_excluded(Path::new("qwen3-8b.gguf")));
    }

    #[test]
    fn test_path_patterns_respect_separators() {
        let set = ExcludeSet::new(["old/*.gguf", "archive/**/*.gguf"]).unwrap();
        assert!(set.is_excluded(Path::new("old/a.gguf")));
        assert!(!set.is_excluded(Path::new("old/nested/a.gguf")));
        assert!(set.is_excluded(Path::new("archive/2024/q4/a.gguf")));
        assert!(!set.is_excluded(Path::new("a.gguf")));
    }

    #[test]
    fn test_character_class() {
        let set = ExcludeSet::new(["*-Q[23]_K.gguf"]).unwrap();
        assert!(set.is_excluded(Path::new("llama-Q2_K.gguf")));
        assert!(!set.is_excluded(Path::new("llama-Q4_K.gguf")));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(ExcludeSet::new(["[unclosed"]).is_err());
    }
}

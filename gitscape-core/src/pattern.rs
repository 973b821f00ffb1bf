//! Inclusion/exclusion rules.
//!
//! A [`PatternRule`] is what a request (or the configured default ignore set)
//! carries; [`PatternRule::compile`] turns it into a [`CompiledPattern`] that
//! answers `matches(path)` for a workspace-relative, `/`-separated path.
//!
//! Glob semantics follow gitignore loosely: a glob without a `/` is tested
//! against every path component (so `node_modules` or `*.png` match at any
//! depth), a glob with a `/` is tested against the full path and each of its
//! ancestor directories (so `docs` style prefixes like `src/gen` prune the
//! whole subtree).

use std::fmt;

use globset::{GlobBuilder, GlobMatcher};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Named rule families shipped with the crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DefaultTag {
    /// Version-control metadata directories.
    VcsMetadata,
    /// Package manager and interpreter caches.
    DependencyCache,
    /// Compiler output and bundler artifacts.
    BuildArtifact,
    /// Operating-system junk files.
    SystemFile,
    /// Images, documents and other media that never digest usefully.
    BinaryMedia,
}

const VCS_DIRS: &[&str] = &[".git", ".svn", ".hg", ".bzr"];

const DEPENDENCY_DIRS: &[&str] = &[
    "node_modules",
    "bower_components",
    "__pycache__",
    ".venv",
    "venv",
    ".tox",
    ".mypy_cache",
    ".pytest_cache",
    ".gradle",
];

const BUILD_DIRS: &[&str] = &["target", "dist", "build", ".next", ".nuxt", "coverage"];

const BUILD_EXTENSIONS: &[&str] = &[
    "pyc", "pyo", "o", "obj", "a", "so", "dll", "dylib", "exe", "class", "jar", "war", "whl",
];

const SYSTEM_FILES: &[&str] = &[".DS_Store", "Thumbs.db", "desktop.ini"];

const MEDIA_EXTENSIONS: &[&str] = &[
    "jpeg", "jpg", "png", "gif", "bmp", "tiff", "tif", "webp", "heif", "heic", "avif", "svg",
    "psd", "raw", "eps", "pdf", "ico", "exr", "tga", "dds", "wdp", "dng", "ppm",
];

impl DefaultTag {
    pub const ALL: [DefaultTag; 5] = [
        DefaultTag::VcsMetadata,
        DefaultTag::DependencyCache,
        DefaultTag::BuildArtifact,
        DefaultTag::SystemFile,
        DefaultTag::BinaryMedia,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DefaultTag::VcsMetadata => "vcs",
            DefaultTag::DependencyCache => "dependencies",
            DefaultTag::BuildArtifact => "build",
            DefaultTag::SystemFile => "system",
            DefaultTag::BinaryMedia => "media",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        DefaultTag::ALL.into_iter().find(|t| t.as_str() == tag)
    }

    fn matches(&self, path: &str) -> bool {
        let mut components = path.split('/').filter(|c| !c.is_empty());
        let name = path.rsplit('/').next().unwrap_or(path);
        let extension = name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match self {
            DefaultTag::VcsMetadata => components.any(|c| VCS_DIRS.contains(&c)),
            DefaultTag::DependencyCache => components.any(|c| DEPENDENCY_DIRS.contains(&c)),
            DefaultTag::BuildArtifact => {
                components.any(|c| BUILD_DIRS.contains(&c))
                    || BUILD_EXTENSIONS.contains(&extension.as_str())
            }
            DefaultTag::SystemFile => {
                SYSTEM_FILES.contains(&name) || name.ends_with("Zone.Identifier")
            }
            DefaultTag::BinaryMedia => MEDIA_EXTENSIONS.contains(&extension.as_str()),
        }
    }
}

/// A single inclusion or exclusion rule as supplied by a request or config.
///
/// On the wire a rule is a plain string: `re:<regex>` is a regex,
/// `builtin:<tag>` a builtin family, anything else a glob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PatternRule {
    Glob(String),
    Regex(String),
    BuiltinDefault(DefaultTag),
}

impl PatternRule {
    pub fn parse(raw: &str) -> Self {
        if let Some(expr) = raw.strip_prefix("re:") {
            return PatternRule::Regex(expr.to_string());
        }
        if let Some(tag) = raw.strip_prefix("builtin:").and_then(DefaultTag::parse) {
            return PatternRule::BuiltinDefault(tag);
        }
        PatternRule::Glob(raw.trim().to_string())
    }

    /// The builtin default ignore set: one rule per [`DefaultTag`].
    pub fn defaults() -> Vec<PatternRule> {
        DefaultTag::ALL
            .into_iter()
            .map(PatternRule::BuiltinDefault)
            .collect()
    }

    pub fn compile(&self) -> Result<CompiledPattern, PatternError> {
        match self {
            PatternRule::Glob(raw) => {
                let trimmed = raw.trim().trim_start_matches('/').trim_end_matches('/');
                if trimmed.is_empty() {
                    return Err(PatternError::Empty);
                }
                let glob = GlobBuilder::new(trimmed)
                    .literal_separator(false)
                    .build()
                    .map_err(|e| PatternError::Glob {
                        pattern: raw.clone(),
                        reason: e.to_string(),
                    })?;
                Ok(CompiledPattern::Glob {
                    matcher: glob.compile_matcher(),
                    anchored: trimmed.contains('/'),
                })
            }
            PatternRule::Regex(raw) => {
                let regex = Regex::new(raw).map_err(|e| PatternError::Regex {
                    pattern: raw.clone(),
                    reason: e.to_string(),
                })?;
                Ok(CompiledPattern::Regex(regex))
            }
            PatternRule::BuiltinDefault(tag) => Ok(CompiledPattern::Builtin(*tag)),
        }
    }
}

impl From<String> for PatternRule {
    fn from(raw: String) -> Self {
        PatternRule::parse(&raw)
    }
}

impl From<&str> for PatternRule {
    fn from(raw: &str) -> Self {
        PatternRule::parse(raw)
    }
}

impl From<PatternRule> for String {
    fn from(rule: PatternRule) -> Self {
        rule.to_string()
    }
}

impl fmt::Display for PatternRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternRule::Glob(g) => write!(f, "{g}"),
            PatternRule::Regex(r) => write!(f, "re:{r}"),
            PatternRule::BuiltinDefault(tag) => write!(f, "builtin:{}", tag.as_str()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("empty pattern")]
    Empty,
    #[error("invalid glob {pattern:?}: {reason}")]
    Glob { pattern: String, reason: String },
    #[error("invalid regex {pattern:?}: {reason}")]
    Regex { pattern: String, reason: String },
}

/// A rule ready for matching.
#[derive(Clone, Debug)]
pub enum CompiledPattern {
    Glob { matcher: GlobMatcher, anchored: bool },
    Regex(Regex),
    Builtin(DefaultTag),
}

impl CompiledPattern {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            CompiledPattern::Glob { matcher, anchored } => {
                if *anchored {
                    ancestors(path).any(|prefix| matcher.is_match(prefix))
                } else {
                    path.split('/').any(|component| matcher.is_match(component))
                }
            }
            CompiledPattern::Regex(regex) => regex.is_match(path),
            CompiledPattern::Builtin(tag) => tag.matches(path),
        }
    }
}

/// `a/b/c` yields `a`, `a/b`, `a/b/c`.
fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/')
        .map(move |(idx, _)| &path[..idx])
        .chain(std::iter::once(path))
}

/// An ordered collection of compiled rules; matches when any rule does.
#[derive(Clone, Debug, Default)]
pub struct PatternSet {
    rules: Vec<CompiledPattern>,
}

impl PatternSet {
    pub fn compile(rules: &[PatternRule]) -> Result<Self, PatternError> {
        let rules = rules
            .iter()
            .map(PatternRule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn matches(&self, path: &str) -> bool {
        self.rules.iter().any(|rule| rule.matches(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(rule: &str, path: &str) -> bool {
        PatternRule::parse(rule).compile().unwrap().matches(path)
    }

    #[test]
    fn unanchored_glob_matches_at_any_depth() {
        assert!(matches("*.png", "logo.png"));
        assert!(matches("*.png", "assets/img/logo.png"));
        assert!(matches("node_modules", "web/node_modules/react/index.js"));
        assert!(!matches("*.png", "README.md"));
    }

    #[test]
    fn anchored_glob_matches_path_prefixes() {
        assert!(matches("src/gen", "src/gen/out.rs"));
        assert!(matches("/docs/", "docs/guide.md"));
        assert!(matches("src/**/*.rs", "src/a/b.rs"));
        assert!(!matches("src/gen", "lib/src/gen/out.rs"));
    }

    #[test]
    fn regex_rule_searches_full_path() {
        assert!(matches(r"re:^tests/.*\.snap$", "tests/a/b.snap"));
        assert!(!matches(r"re:^tests/", "src/tests/a.rs"));
    }

    #[test]
    fn builtin_families_cover_defaults() {
        assert!(matches("builtin:vcs", ".git/config"));
        assert!(matches("builtin:dependencies", "app/node_modules/x.js"));
        assert!(matches("builtin:build", "target/debug/app"));
        assert!(matches("builtin:build", "pkg/mod.pyc"));
        assert!(matches("builtin:system", "photos/.DS_Store"));
        assert!(matches("builtin:media", "docs/Logo.PNG"));
        assert!(!matches("builtin:media", "src/main.rs"));
    }

    #[test]
    fn wire_form_round_trips_through_display() {
        for raw in ["*.md", "re:^a$", "builtin:media"] {
            assert_eq!(PatternRule::parse(raw).to_string(), raw);
        }
        // Unknown builtin tags fall back to a literal glob.
        assert_eq!(
            PatternRule::parse("builtin:nope"),
            PatternRule::Glob("builtin:nope".into())
        );
    }

    #[test]
    fn invalid_rules_are_rejected() {
        assert!(PatternRule::parse("re:(").compile().is_err());
        assert!(PatternRule::parse("a[").compile().is_err());
        assert!(matches!(
            PatternRule::parse("  ").compile(),
            Err(PatternError::Empty)
        ));
    }
}

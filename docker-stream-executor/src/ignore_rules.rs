//! `.dockerignore` rule compilation and evaluation.
//!
//! Every pattern is anchored at the root of the build context. Patterns are
//! evaluated in file order and the last one that matches decides. Ancestor
//! directories are evaluated before the path itself: once a directory is
//! excluded, nothing below it can be brought back by a later `!` rule.
use std::path::{Component, Path};

use globset::GlobBuilder;
use ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::IgnoreError;

#[derive(Debug, Clone)]
pub struct IgnorePattern {
    line: usize,
    source: String,
    glob: String,
    negated: bool,
    directory_only: bool,
    matcher: Gitignore,
}

impl IgnorePattern {
    /// Parses a single rule. Returns `Ok(None)` for blank lines and comments.
    pub fn parse(line: usize, raw: &str) -> Result<Option<Self>, IgnoreError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return Ok(None);
        }

        let invalid = |reason: &str| IgnoreError::InvalidPattern {
            line,
            pattern: raw.to_string(),
            reason: reason.to_string(),
        };

        let (negated, expression) = match trimmed.strip_prefix('!') {
            Some(rest) => (true, rest.trim()),
            None => (false, trimmed),
        };

        if expression.is_empty() {
            return Err(invalid("pattern is empty"));
        }

        let directory_only = expression.ends_with('/');
        let glob = clean(expression);

        if glob == "." || glob == ".." {
            return Err(invalid("pattern refers to the context root"));
        }

        // gitignore accepts unclosed classes as literals, dockerignore does not
        GlobBuilder::new(&glob)
            .literal_separator(true)
            .build()
            .map_err(|err| invalid(&err.kind().to_string()))?;

        let mut builder = GitignoreBuilder::new("/");
        let anchored = if directory_only {
            format!("/{glob}/")
        } else {
            format!("/{glob}")
        };
        builder
            .add_line(None, &anchored)
            .map_err(|err| invalid(&err.to_string()))?;
        let matcher = builder.build().map_err(|err| invalid(&err.to_string()))?;

        Ok(Some(Self {
            line,
            source: raw.to_string(),
            glob,
            negated,
            directory_only,
            matcher,
        }))
    }

    pub fn line(&self) -> usize {
        self.line
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// The normalized glob, without the negation marker.
    pub fn glob(&self) -> &str {
        &self.glob
    }

    pub fn is_negated(&self) -> bool {
        self.negated
    }

    pub fn is_directory_only(&self) -> bool {
        self.directory_only
    }

    /// Whether the glob matches this exact path, regardless of negation.
    pub fn is_match(&self, relative_path: &str, is_dir: bool) -> bool {
        self.matcher.matched(relative_path, is_dir).is_ignore()
    }
}

/// An ordered set of compiled `.dockerignore` rules.
#[derive(Debug, Clone, Default)]
pub struct IgnoreMatcher {
    patterns: Vec<IgnorePattern>,
}

impl IgnoreMatcher {
    /// Compiles rules in source order, failing on the first malformed line.
    pub fn compile<I, S>(lines: I) -> Result<Self, IgnoreError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut patterns = Vec::new();
        for (index, line) in lines.into_iter().enumerate() {
            if let Some(pattern) = IgnorePattern::parse(index + 1, line.as_ref())? {
                patterns.push(pattern);
            }
        }

        tracing::debug!(patterns = patterns.len(), "compiled ignore rules");
        Ok(Self { patterns })
    }

    /// Reads and compiles an ignore file. A missing file yields an empty matcher.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, IgnoreError> {
        let path = path.as_ref();
        match fs_err::read_to_string(path) {
            Ok(content) => Self::compile(content.lines()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = ?path, "no ignore file present");
                Ok(Self::default())
            }
            Err(source) => Err(IgnoreError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn patterns(&self) -> &[IgnorePattern] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Returns a matcher with `pattern` appended after the existing rules.
    pub fn with_pattern(mut self, pattern: IgnorePattern) -> Self {
        self.patterns.push(pattern);
        self
    }

    /// Whether `relative_path` is excluded from the build context.
    pub fn matches(&self, relative_path: impl AsRef<Path>, is_dir: bool) -> bool {
        if self.patterns.is_empty() {
            return false;
        }

        let components = normalize_components(relative_path.as_ref());
        if components.is_empty() {
            return false;
        }

        for depth in 1..components.len() {
            if self.evaluate(&components[..depth].join("/"), true) {
                return true;
            }
        }

        self.evaluate(&components.join("/"), is_dir)
    }

    fn evaluate(&self, path: &str, is_dir: bool) -> bool {
        self.patterns.iter().fold(false, |excluded, pattern| {
            if pattern.is_match(path, is_dir) {
                !pattern.negated
            } else {
                excluded
            }
        })
    }
}

/// Lexically cleans a pattern: strips leading slashes and `./`, collapses
/// repeated separators and resolves `..` where it has something to pop.
fn clean(expression: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in expression.split('/') {
        match segment {
            "" | "." => {}
            ".." => match segments.last() {
                Some(last) if *last != ".." => {
                    segments.pop();
                }
                _ => segments.push(".."),
            },
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        ".".to_string()
    } else {
        segments.join("/")
    }
}

fn normalize_components(path: &Path) -> Vec<String> {
    let mut components: Vec<String> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => components.push(part.to_string_lossy().into_owned()),
            Component::ParentDir => {
                components.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    components
}

//! Static-analysis searches over the project tree.
//!
//! These are the deterministic tools the oracle can request while selecting
//! files. Each returns project-relative, forward-slash paths and never looks
//! inside ignored directories.

use crate::paths::{self, PathError};
use forge_core::config::STATE_DIR;
use forge_core::SearchRequest;
use glob::{MatchOptions, Pattern};
use regex::Regex;
use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

/// Extensions tried when an import or suggestion names a module without one.
pub const MODULE_EXTENSIONS: &[&str] = &["ts", "tsx", "js", "jsx"];

/// Node.js modules that never exist as project files.
const NODE_BUILTINS: &[&str] = &[
    "fs",
    "path",
    "child_process",
    "http",
    "https",
    "url",
    "util",
    "events",
    "stream",
    "crypto",
    "os",
    "buffer",
];

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("unknown search tool: {0}")]
    Unknown(String),
    #[error("{tool} requires a '{param}' parameter")]
    MissingParam {
        tool: &'static str,
        param: &'static str,
    },
    #[error("invalid value for {param}: {value}")]
    InvalidParam { param: &'static str, value: String },
    #[error("invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),
    #[error("invalid regex: {0}")]
    Regex(#[from] regex::Error),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, SearchError>;

/// A validated search request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchTool {
    FilesByName { pattern: String },
    FilesByContent { pattern: String },
    ImportedFiles { file: String },
    RelatedTests { file: String },
    ComponentUsage { component: String },
    ApiUsage { endpoint: String },
    StyleDependencies { component: String },
    FunctionDefinition { function_name: String },
    Dependencies { file: String },
    RecentlyModifiedFiles { days: u64 },
    RelatedClasses { file: String },
}

impl SearchTool {
    /// Validate a request. Names match case-insensitively.
    pub fn from_request(request: &SearchRequest) -> Result<Self> {
        let param = |tool: &'static str, key: &'static str| -> Result<String> {
            request
                .params
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(ToString::to_string)
                .ok_or(SearchError::MissingParam { tool, param: key })
        };

        let tool = match request.name.trim().to_lowercase().as_str() {
            "findfilesbyname" => Self::FilesByName {
                pattern: param("findFilesByName", "pattern")?,
            },
            "findfilesbycontent" => Self::FilesByContent {
                pattern: param("findFilesByContent", "pattern")?,
            },
            "findimportedfiles" => Self::ImportedFiles {
                file: param("findImportedFiles", "file")?,
            },
            "findrelatedtests" => Self::RelatedTests {
                file: param("findRelatedTests", "file")?,
            },
            "findcomponentusage" => Self::ComponentUsage {
                component: param("findComponentUsage", "component")?,
            },
            "findapiusage" => Self::ApiUsage {
                endpoint: param("findAPIUsage", "endpoint")?,
            },
            "findstyledependencies" => Self::StyleDependencies {
                component: param("findStyleDependencies", "component")?,
            },
            "findfunctiondefinition" => Self::FunctionDefinition {
                function_name: param("findFunctionDefinition", "functionName")?,
            },
            "finddependencies" => Self::Dependencies {
                file: param("findDependencies", "file")?,
            },
            "findrecentlymodifiedfiles" => {
                let days = param("findRecentlyModifiedFiles", "days")?;
                Self::RecentlyModifiedFiles {
                    days: days.parse().map_err(|_| SearchError::InvalidParam {
                        param: "days",
                        value: days.clone(),
                    })?,
                }
            }
            "findrelatedclasses" => Self::RelatedClasses {
                file: param("findRelatedClasses", "file")?,
            },
            _ => return Err(SearchError::Unknown(request.name.clone())),
        };
        Ok(tool)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::FilesByName { .. } => "findFilesByName",
            Self::FilesByContent { .. } => "findFilesByContent",
            Self::ImportedFiles { .. } => "findImportedFiles",
            Self::RelatedTests { .. } => "findRelatedTests",
            Self::ComponentUsage { .. } => "findComponentUsage",
            Self::ApiUsage { .. } => "findAPIUsage",
            Self::StyleDependencies { .. } => "findStyleDependencies",
            Self::FunctionDefinition { .. } => "findFunctionDefinition",
            Self::Dependencies { .. } => "findDependencies",
            Self::RecentlyModifiedFiles { .. } => "findRecentlyModifiedFiles",
            Self::RelatedClasses { .. } => "findRelatedClasses",
        }
    }
}

/// Regexes shared by the import-based searches.
#[derive(Debug)]
struct SourcePatterns {
    import_from: Regex,
    named_import: Regex,
    style_import: Regex,
    extends: Regex,
}

impl SourcePatterns {
    fn new() -> Result<Self> {
        Ok(Self {
            import_from: Regex::new(r#"import.*from\s+['"]([^'"]+)['"]"#)?,
            named_import: Regex::new(r#"import\s+\{?\s*(\w+)\s*\}?\s+from\s+['"]([^'"]+)['"]"#)?,
            style_import: Regex::new(r#"import\s+(?:.*from\s+)?['"]([^'"]+\.s?css)['"]"#)?,
            extends: Regex::new(r"class\s+\w+\s+extends\s+(\w+)")?,
        })
    }
}

/// Searches over one project tree.
#[derive(Debug)]
pub struct ProjectSearch {
    root: PathBuf,
    ignored_dirs: Vec<String>,
    patterns: SourcePatterns,
}

impl ProjectSearch {
    /// The state directory is always ignored on top of `ignored_dirs`.
    pub fn new(root: impl Into<PathBuf>, mut ignored_dirs: Vec<String>) -> Result<Self> {
        if !ignored_dirs.iter().any(|d| d == STATE_DIR) {
            ignored_dirs.push(STATE_DIR.to_string());
        }
        Ok(Self {
            root: root.into(),
            ignored_dirs,
            patterns: SourcePatterns::new()?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run a search, returning matching project-relative paths in discovery order.
    pub fn run(&self, tool: &SearchTool) -> Result<Vec<String>> {
        let found = match tool {
            SearchTool::FilesByName { pattern } => self.files_by_name(pattern)?,
            SearchTool::FilesByContent { pattern } => {
                self.files_matching(|text| text.contains(pattern.as_str()))
            }
            SearchTool::ImportedFiles { file } => self.imported_files(file)?,
            SearchTool::RelatedTests { file } => self.related_tests(file)?,
            SearchTool::ComponentUsage { component } => {
                let needle = format!("<{component}");
                self.files_matching(|text| text.contains(&needle))
            }
            SearchTool::ApiUsage { endpoint } => {
                let re = Regex::new(&format!(r"fetch\(.*{}.*\)", regex::escape(endpoint)))?;
                self.files_matching(|text| re.is_match(text))
            }
            SearchTool::StyleDependencies { component } => self.style_dependencies(component)?,
            SearchTool::FunctionDefinition { function_name } => {
                let name = regex::escape(function_name);
                let re = Regex::new(&format!(
                    r"function\s+{name}\s*\(|(?:const|let|var)\s+{name}\s*=\s*(?:async\s*)?\("
                ))?;
                self.files_matching(|text| re.is_match(text))
            }
            SearchTool::Dependencies { file } => self.dependencies(file)?,
            SearchTool::RecentlyModifiedFiles { days } => self.recently_modified(*days),
            SearchTool::RelatedClasses { file } => self.related_classes(file)?,
        };
        debug!(tool = tool.name(), found = found.len(), "search complete");
        Ok(found)
    }

    // --- Tree walking ---

    fn is_ignored(&self, name: &OsStr) -> bool {
        self.ignored_dirs.iter().any(|d| OsStr::new(d) == name)
    }

    fn walk(&self) -> impl Iterator<Item = DirEntry> + '_ {
        WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |e| {
                e.depth() == 0 || !e.file_type().is_dir() || !self.is_ignored(e.file_name())
            })
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_file())
    }

    /// All project files as relative names.
    fn files(&self) -> impl Iterator<Item = String> + '_ {
        self.walk()
            .filter_map(move |e| paths::relative_name(&self.root, e.path()))
    }

    fn files_matching(&self, predicate: impl Fn(&str) -> bool) -> Vec<String> {
        self.walk()
            .filter(|e| {
                std::fs::read_to_string(e.path())
                    .map(|text| predicate(&text))
                    .unwrap_or(false)
            })
            .filter_map(|e| paths::relative_name(&self.root, e.path()))
            .collect()
    }

    fn files_by_name(&self, pattern: &str) -> Result<Vec<String>> {
        let patterns = expand_braces(pattern)
            .iter()
            .map(|p| Pattern::new(p.trim_start_matches("./")))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        Ok(self
            .files()
            .filter(|name| patterns.iter().any(|p| p.matches_with(name, options)))
            .collect())
    }

    fn read_project_file(&self, file: &str) -> Result<(PathBuf, String)> {
        let relative = paths::normalize(&self.root, file)?;
        let path = self.root.join(&relative);
        let text = std::fs::read_to_string(&path).map_err(|source| SearchError::Read {
            path: file.to_string(),
            source,
        })?;
        Ok((relative, text))
    }

    /// Resolve an import specifier against the directory of `importer`.
    ///
    /// Bare specifiers (packages) are returned as written.
    fn resolve_specifier(&self, importer: &Path, specifier: &str) -> Option<String> {
        if !specifier.starts_with('.') {
            return Some(specifier.to_string());
        }
        let base = importer.parent().unwrap_or_else(|| Path::new(""));
        let joined = paths::display_name(&base.join(specifier));
        let relative = paths::normalize(&self.root, &joined).ok()?;
        let name = paths::display_name(&relative);
        Some(self.resolve_module(&name).unwrap_or(name))
    }

    // --- Searches ---

    fn imported_files(&self, file: &str) -> Result<Vec<String>> {
        let (relative, text) = self.read_project_file(file)?;
        Ok(dedupe(
            self.patterns
                .import_from
                .captures_iter(&text)
                .filter_map(|caps| self.resolve_specifier(&relative, &caps[1])),
        ))
    }

    fn related_tests(&self, file: &str) -> Result<Vec<String>> {
        let stem = Path::new(file)
            .file_stem()
            .and_then(OsStr::to_str)
            .ok_or_else(|| SearchError::InvalidParam {
                param: "file",
                value: file.to_string(),
            })?;
        let stem = Pattern::escape(stem);
        self.files_by_name(&format!("**/{{{stem}.test.*,{stem}.spec.*,{stem}_test.*}}"))
    }

    fn style_dependencies(&self, component: &str) -> Result<Vec<String>> {
        let component = Pattern::escape(component);
        let sources = self.files_by_name(&format!("**/{component}.{{ts,tsx,js,jsx}}"))?;
        let mut styles = Vec::new();
        for source in sources {
            let (relative, text) = self.read_project_file(&source)?;
            styles.extend(
                self.patterns
                    .style_import
                    .captures_iter(&text)
                    .filter_map(|caps| self.resolve_specifier(&relative, &caps[1]))
                    .filter(|name| !self.is_in_ignored_dir(name)),
            );
        }
        Ok(dedupe(styles))
    }

    fn dependencies(&self, file: &str) -> Result<Vec<String>> {
        let (_, text) = self.read_project_file(file)?;
        Ok(dedupe(
            self.patterns
                .import_from
                .captures_iter(&text)
                .map(|caps| caps[1].to_string())
                .filter(|spec| !self.is_in_ignored_dir(spec)),
        ))
    }

    fn recently_modified(&self, days: u64) -> Vec<String> {
        let window = Duration::from_secs(days.saturating_mul(SECONDS_PER_DAY));
        let now = SystemTime::now();
        self.walk()
            .filter(|e| {
                e.metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .is_some_and(|modified| {
                        now.duration_since(modified).unwrap_or(Duration::ZERO) <= window
                    })
            })
            .filter_map(|e| paths::relative_name(&self.root, e.path()))
            .collect()
    }

    fn related_classes(&self, file: &str) -> Result<Vec<String>> {
        let (relative, text) = self.read_project_file(file)?;
        let mut related: Vec<String> = self
            .patterns
            .named_import
            .captures_iter(&text)
            .filter(|caps| caps[2].starts_with('.'))
            .filter_map(|caps| self.resolve_specifier(&relative, &caps[2]))
            .map(|name| {
                if Path::new(&name).extension().is_some() {
                    name
                } else {
                    format!("{name}.ts")
                }
            })
            .collect();

        for caps in self.patterns.extends.captures_iter(&text) {
            let definition = Regex::new(&format!(r"class\s+{}\b", regex::escape(&caps[1])))?;
            related.extend(self.files_matching(|text| definition.is_match(text)));
        }

        Ok(dedupe(related))
    }

    fn is_in_ignored_dir(&self, name: &str) -> bool {
        name.split('/').any(|part| self.ignored_dirs.iter().any(|d| d == part))
    }

    // --- Resolution ---

    /// Resolve a module path to an existing file, trying extensions and `index` files.
    pub fn resolve_module(&self, name: &str) -> Option<String> {
        let relative = paths::normalize(&self.root, name).ok()?;
        let display = paths::display_name(&relative);
        if self.root.join(&relative).is_file() {
            return Some(display);
        }
        MODULE_EXTENSIONS
            .iter()
            .map(|ext| format!("{display}.{ext}"))
            .chain(MODULE_EXTENSIONS.iter().map(|ext| format!("{display}/index.{ext}")))
            .find(|candidate| self.root.join(candidate).is_file())
    }

    /// First file anywhere in the tree with the same base name as `name`.
    pub fn find_by_basename(&self, name: &str) -> Option<String> {
        let base = Path::new(name.trim()).file_name()?;
        self.walk()
            .find(|e| e.file_name() == base)
            .and_then(|e| paths::relative_name(&self.root, e.path()))
    }

    /// Resolve a file name to an existing project file.
    ///
    /// Tries the exact path, then module extensions, then a base-name search.
    /// Names escaping the root resolve to an error.
    pub fn locate(&self, name: &str) -> Result<Option<String>> {
        paths::normalize(&self.root, name)?;
        Ok(self
            .resolve_module(name)
            .or_else(|| self.find_by_basename(name)))
    }

    // --- Project structure ---

    /// Render the tree as `├──` / `└──` lines, directories first, alphabetical.
    ///
    /// Dot-directories and ignored directories are skipped.
    pub fn project_structure(&self) -> String {
        let mut out = String::new();
        let name = self
            .root
            .file_name()
            .map_or_else(|| self.root.display().to_string(), |n| n.to_string_lossy().into_owned());
        self.render_dir(&self.root, &name, "", true, &mut out);
        out
    }

    fn render_dir(&self, dir: &Path, name: &str, indent: &str, is_last: bool, out: &mut String) {
        out.push_str(&format!("{indent}{}{name}/\n", branch(is_last)));

        let mut dirs = Vec::new();
        let mut files = Vec::new();
        match std::fs::read_dir(dir) {
            Ok(entries) => {
                for entry in entries.filter_map(std::result::Result::ok) {
                    let Ok(file_type) = entry.file_type() else {
                        continue;
                    };
                    let entry_name = entry.file_name();
                    if file_type.is_dir() {
                        if !entry_name.to_string_lossy().starts_with('.')
                            && !self.is_ignored(&entry_name)
                        {
                            dirs.push(entry_name);
                        }
                    } else if file_type.is_file() {
                        files.push(entry_name);
                    }
                }
            }
            Err(err) => debug!(dir = %dir.display(), error = %err, "cannot list directory"),
        }
        dirs.sort();
        files.sort();

        let child_indent = format!("{indent}{}", if is_last { "    " } else { "│   " });
        for (i, sub) in dirs.iter().enumerate() {
            let last = i + 1 == dirs.len() && files.is_empty();
            self.render_dir(&dir.join(sub), &sub.to_string_lossy(), &child_indent, last, out);
        }
        for (i, file) in files.iter().enumerate() {
            let last = i + 1 == files.len();
            out.push_str(&format!(
                "{child_indent}{}{}\n",
                branch(last),
                file.to_string_lossy()
            ));
        }
    }
}

fn branch(is_last: bool) -> &'static str {
    if is_last {
        "└── "
    } else {
        "├── "
    }
}

/// Whether `name` refers to a Node.js built-in module rather than a file.
pub fn is_node_builtin(name: &str) -> bool {
    let name = name.trim();
    let bare = name.strip_prefix("node:").unwrap_or(name);
    let bare = Path::new(bare)
        .file_stem()
        .and_then(OsStr::to_str)
        .filter(|_| !bare.contains('/'))
        .unwrap_or(bare);
    NODE_BUILTINS.contains(&bare)
}

/// Expand `{a,b}` alternatives, which glob patterns do not support natively.
pub(crate) fn expand_braces(pattern: &str) -> Vec<String> {
    let Some(open) = pattern.find('{') else {
        return vec![pattern.to_string()];
    };
    let Some(len) = pattern[open..].find('}') else {
        return vec![pattern.to_string()];
    };
    let close = open + len;
    let (prefix, body, suffix) = (&pattern[..open], &pattern[open + 1..close], &pattern[close + 1..]);
    body.split(',')
        .flat_map(|alt| expand_braces(&format!("{prefix}{alt}{suffix}")))
        .collect()
}

fn dedupe(items: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

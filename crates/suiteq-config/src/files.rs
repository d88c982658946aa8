//! Turning command-line file arguments into the list of files to run.

use crate::{ConfigError, ConfigResult, FileSettings};
use regex::Regex;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

/// Compiled file selection rules.
#[derive(Debug, Clone)]
pub struct FileFilter {
    suffix: String,
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl FileFilter {
    pub fn new(settings: &FileSettings) -> ConfigResult<Self> {
        let compile = |patterns: &[String]| -> ConfigResult<Vec<Regex>> {
            patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|source| ConfigError::Pattern {
                        pattern: p.clone(),
                        source,
                    })
                })
                .collect()
        };
        Ok(Self {
            suffix: settings.suffix.clone(),
            include: compile(&settings.include)?,
            exclude: compile(&settings.exclude)?,
        })
    }

    /// Whether a file found under a directory argument should run.
    pub fn matches(&self, path: &str) -> bool {
        path.ends_with(&self.suffix)
            && (self.include.is_empty() || self.include.iter().any(|re| re.is_match(path)))
            && !self.exclude.iter().any(|re| re.is_match(path))
    }
}

/// Resolve file and directory arguments against `cwd`.
///
/// Directories are walked recursively and filtered; plain files are kept
/// as given. The result is in `./relative` form, deduplicated, in argument
/// order.
pub fn resolve_files(args: &[String], filter: &FileFilter, cwd: &Path) -> ConfigResult<Vec<String>> {
    let mut seen = HashSet::new();
    let mut files = Vec::new();

    for arg in args {
        let path = cwd.join(arg);
        let found = if path.is_dir() {
            let mut found = Vec::new();
            walk(&path, &mut found)?;
            let mut found: Vec<String> = found
                .iter()
                .map(|p| relative_path(p, cwd))
                .filter(|p| filter.matches(p))
                .collect();
            found.sort();
            found
        } else {
            vec![relative_path(&path, cwd)]
        };

        for file in found {
            if seen.insert(file.clone()) {
                files.push(file);
            }
        }
    }
    Ok(files)
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> ConfigResult<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            walk(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

/// `./`-prefixed path of `path` relative to `cwd`.
pub fn relative_path(path: &Path, cwd: &Path) -> String {
    let relative = path.strip_prefix(cwd).unwrap_or(path);
    let normal: PathBuf = relative
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();
    if normal.is_absolute() {
        normal.display().to_string()
    } else {
        format!("./{}", normal.display())
    }
}

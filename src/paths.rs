//! Search path resolution for command plugins.
//!
//! Search roots come from an environment variable followed by the
//! `commands` folder of the active pipeline configuration. Paths are
//! normalized lexically and always use `/` as separator. Nothing here
//! touches the filesystem except [`SearchPath::find`].

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// Join path fragments and normalize the result.
///
/// Expands a leading `~`, collapses `.` and `..` segments and rewrites
/// backslashes to forward slashes. A later absolute fragment discards
/// everything before it.
#[must_use]
pub fn normalize<S: AsRef<str>>(parts: &[S]) -> String {
    let mut joined = String::new();
    for part in parts {
        let part = part.as_ref().replace('\\', "/");
        if part.is_empty() {
            continue;
        }
        if joined.is_empty() || is_absolute(&part) {
            joined = part;
        } else {
            if !joined.ends_with('/') {
                joined.push('/');
            }
            joined.push_str(&part);
        }
    }

    let expanded = shellexpand::tilde(&joined).replace('\\', "/");
    collapse(&expanded)
}

fn is_absolute(path: &str) -> bool {
    path.starts_with('/') || has_drive(path)
}

fn has_drive(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn collapse(path: &str) -> String {
    let (prefix, rest) = if has_drive(path) {
        let (drive, rest) = path.split_at(2);
        if rest.starts_with('/') {
            (format!("{drive}/"), rest)
        } else {
            (drive.to_string(), rest)
        }
    } else if path.starts_with('/') {
        ("/".to_string(), path)
    } else {
        (String::new(), path)
    };
    let rooted = prefix.ends_with('/');

    let mut segments: Vec<&str> = Vec::new();
    for segment in rest.split('/') {
        match segment {
            "" | "." => {}
            ".." => match segments.last() {
                Some(&last) if last != ".." => {
                    segments.pop();
                }
                // `..` above the root stays at the root
                _ if rooted => {}
                _ => segments.push(".."),
            },
            other => segments.push(other),
        }
    }

    let body = segments.join("/");
    if prefix.is_empty() && body.is_empty() {
        ".".to_string()
    } else {
        format!("{prefix}{body}")
    }
}

/// Ordered list of plugin search roots.
///
/// Earlier roots load first. Duplicates are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPath {
    roots: Vec<String>,
}

impl SearchPath {
    /// Build the search path from the raw environment value and the
    /// pipeline configuration root.
    ///
    /// Environment entries keep their order; empty entries are skipped.
    /// `<config_location>/<commands_dir>` is always appended last.
    #[must_use]
    pub fn resolve(env_value: Option<&OsStr>, config_location: &Path, commands_dir: &str) -> Self {
        let mut roots: Vec<String> = env_value
            .map(|value| {
                std::env::split_paths(value)
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(|p| normalize(&[p.to_string_lossy()]))
                    .collect()
            })
            .unwrap_or_default();

        roots.push(normalize(&[
            config_location.to_string_lossy().as_ref(),
            commands_dir,
        ]));

        Self { roots }
    }

    /// Resolve using the named environment variable of this process.
    #[must_use]
    pub fn from_env(var: &str, config_location: &Path, commands_dir: &str) -> Self {
        let value = std::env::var_os(var);
        Self::resolve(value.as_deref(), config_location, commands_dir)
    }

    #[must_use]
    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Directories to scan for a root: the engine's own folder, then the shared one.
    #[must_use]
    pub fn candidate_dirs(&self, engine_name: &str, shared_dir: &str) -> Vec<PathBuf> {
        self.roots
            .iter()
            .flat_map(|root| {
                [
                    PathBuf::from(normalize(&[root.as_str(), engine_name])),
                    PathBuf::from(normalize(&[root.as_str(), shared_dir])),
                ]
            })
            .collect()
    }

    /// First `<root>/<relative>` that exists, in search order.
    #[must_use]
    pub fn find(&self, relative: &str) -> Option<PathBuf> {
        self.roots
            .iter()
            .map(|root| PathBuf::from(normalize(&[root.as_str(), relative])))
            .find(|candidate| candidate.exists())
    }
}

impl From<Vec<String>> for SearchPath {
    fn from(roots: Vec<String>) -> Self {
        Self { roots }
    }
}

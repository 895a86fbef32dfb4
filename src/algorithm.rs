//! Conventional layout of an algorithm plugin inside its cache directory.
//!
//! Bundles are either flat or wrap the plugin in one top-level folder, so
//! files are looked up at the root and one level deep.

use std::{
    fs,
    path::{Path, PathBuf},
};

pub const INPUT_SCHEMA: &str = "input.schema.json";
pub const OUTPUT_SCHEMA: &str = "output.schema.json";
pub const META_FILE: &str = "algo.meta.json";
pub const ENTRY_FILE: &str = "algo.py";

const MARKERS: [&str; 4] = [INPUT_SCHEMA, OUTPUT_SCHEMA, META_FILE, ENTRY_FILE];

/// Finds `filename` at `root` or in one of its immediate subdirectories.
pub fn find_file(root: &Path, filename: &str) -> Option<PathBuf> {
    let direct = root.join(filename);
    if direct.is_file() {
        return Some(direct);
    }
    subdirs(root)
        .into_iter()
        .map(|dir| dir.join(filename))
        .find(|path| path.is_file())
}

/// Directory holding the plugin files: `root` itself, or the first
/// subdirectory carrying one of the conventional files. Falls back to `root`.
pub fn plugin_root(root: &Path) -> PathBuf {
    if MARKERS.iter().any(|m| root.join(m).is_file()) {
        return root.to_path_buf();
    }
    subdirs(root)
        .into_iter()
        .find(|dir| MARKERS.iter().any(|m| dir.join(m).is_file()))
        .unwrap_or_else(|| root.to_path_buf())
}

// sorted, skipping hidden dirs such as the venv
fn subdirs(root: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
        .map(|e| e.path())
        .collect();
    dirs.sort();
    dirs
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_flat_layout() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(INPUT_SCHEMA), "{}").unwrap();
        assert_eq!(find_file(dir.path(), INPUT_SCHEMA), Some(dir.path().join(INPUT_SCHEMA)));
        assert_eq!(plugin_root(dir.path()), dir.path());
    }

    #[test]
    fn test_nested_layout() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("my_algo");
        fs::create_dir_all(&nested).unwrap();
        fs::create_dir_all(dir.path().join(".venv")).unwrap();
        fs::write(nested.join(META_FILE), "{}").unwrap();
        fs::write(nested.join(INPUT_SCHEMA), "{}").unwrap();
        assert_eq!(find_file(dir.path(), INPUT_SCHEMA), Some(nested.join(INPUT_SCHEMA)));
        assert_eq!(plugin_root(dir.path()), nested);
    }

    #[test]
    fn test_two_levels_deep_is_not_found() {
        let dir = tempdir().unwrap();
        let deep = dir.path().join("a/b");
        fs::create_dir_all(&deep).unwrap();
        fs::write(deep.join(INPUT_SCHEMA), "{}").unwrap();
        assert_eq!(find_file(dir.path(), INPUT_SCHEMA), None);
        assert_eq!(plugin_root(dir.path()), dir.path());
    }
}

//! Content-addressed artifact cache.
//!
//! Layout under the cache root:
//!
//! ```text
//! {root}/{category}/{name}        payload (directory for zip sources, file otherwise)
//! {root}/{category}/{name}.hash   hash sidecar, written last
//! {root}/.locks/                  per-key advisory lock files
//! ```
//!
//! An entry is valid only when both the payload and the sidecar exist, so a
//! crash part-way through an install leaves an entry that `lookup` ignores.

use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
};
use fs4::FileExt;
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use uuid::Uuid;
use xxhash_rust::xxh3::xxh3_64;

use crate::archive;
use crate::error::CacheError;

const LOCKS_DIR: &str = ".locks";
const HASH_SUFFIX: &str = "hash";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Algorithms,
    Models,
    Datasets,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Algorithms => "algorithms",
            Category::Models => "models",
            Category::Datasets => "datasets",
        }
    }

    pub fn parse(value: &str) -> Option<Category> {
        match value {
            "algorithms" => Some(Category::Algorithms),
            "models" => Some(Category::Models),
            "datasets" => Some(Category::Datasets),
            _ => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local store for algorithm bundles, models and datasets.
///
/// Installs and evictions of the same key are serialized through an
/// exclusive file lock, which also covers other worker processes sharing the
/// cache root. Lookups never lock.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    root: PathBuf,
}

impl ArtifactCache {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(root.join(LOCKS_DIR)).map_err(|e| CacheError::io(&root, e))?;
        Ok(Self { root: root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Payload location of an entry, whether or not it exists.
    pub fn entry_path(&self, category: Category, name: &str) -> Result<PathBuf, CacheError> {
        check_name(name)?;
        Ok(self.root.join(category.as_str()).join(name))
    }

    fn hash_path(&self, category: Category, name: &str) -> PathBuf {
        self.root
            .join(category.as_str())
            .join(format!("{name}.{HASH_SUFFIX}"))
    }

    /// Returns the cached payload if the entry is valid.
    ///
    /// Without an `expected_hash` any complete entry is accepted; with one,
    /// the stored hash must match it.
    pub fn lookup(
        &self,
        category: Category,
        name: &str,
        expected_hash: Option<&str>,
    ) -> Option<PathBuf> {
        let payload = self.entry_path(category, name).ok()?;
        if !payload.exists() {
            return None;
        }
        let stored = fs::read_to_string(self.hash_path(category, name)).ok()?;
        let stored = stored.trim();
        match expected_hash {
            Some(expected) if expected.trim() != stored => {
                debug!(
                    "Cache entry `{category}/{name}` has hash `{stored}`, expected `{}`.",
                    expected.trim()
                );
                None
            }
            _ => Some(payload),
        }
    }

    /// Installs `source` as the entry `(category, name)`.
    ///
    /// Zip sources are extracted into a directory, anything else is copied.
    /// The previous entry is removed first and the sidecar is written last;
    /// on failure the partial entry is erased.
    pub fn install(
        &self,
        category: Category,
        name: &str,
        source: &Path,
        expected_hash: Option<&str>,
    ) -> Result<PathBuf, CacheError> {
        let target = self.entry_path(category, name)?;
        let _lock = self.lock(category, name)?;
        self.install_locked(category, name, source, expected_hash, &target)
    }

    /// Like [`install`](Self::install), but keeps an entry that became valid
    /// while the caller was fetching, e.g. through another worker sharing the
    /// root. Returns the payload and whether `source` was installed.
    pub fn install_if_absent(
        &self,
        category: Category,
        name: &str,
        source: &Path,
        expected_hash: Option<&str>,
    ) -> Result<(PathBuf, bool), CacheError> {
        let target = self.entry_path(category, name)?;
        let _lock = self.lock(category, name)?;
        if let Some(path) = self.lookup(category, name, expected_hash) {
            debug!("`{category}/{name}` was installed concurrently, keeping it.");
            return Ok((path, false));
        }
        self.install_locked(category, name, source, expected_hash, &target)
            .map(|path| (path, true))
    }

    // caller holds the key lock
    fn install_locked(
        &self,
        category: Category,
        name: &str,
        source: &Path,
        expected_hash: Option<&str>,
        target: &Path,
    ) -> Result<PathBuf, CacheError> {
        self.evict_unlocked(category, name)?;
        let hash = match expected_hash {
            Some(hash) => hash.trim().to_string(),
            None => hash_file(source).map_err(|e| CacheError::io(source, e))?,
        };
        match self.write_entry(category, name, source, target, &hash) {
            Ok(()) => {
                info!("Installed `{category}/{name}` with hash `{hash}`.");
                Ok(target.to_path_buf())
            }

            Err(e) => {
                warn!("Install of `{category}/{name}` failed: {e}");
                if let Err(cleanup) = self.evict_unlocked(category, name) {
                    warn!("Failed to erase partial entry `{category}/{name}`: {cleanup}");
                }
                Err(e)
            }
        }
    }

    fn write_entry(
        &self,
        category: Category,
        name: &str,
        source: &Path,
        target: &Path,
        hash: &str,
    ) -> Result<(), CacheError> {
        let category_dir = self.root.join(category.as_str());
        fs::create_dir_all(&category_dir).map_err(|e| CacheError::io(&category_dir, e))?;
        // stage next to the target so the final rename stays on one filesystem
        let staging = category_dir.join(format!(".{name}.partial-{}", Uuid::new_v4().simple()));
        let staged = if archive::is_zip(source).map_err(|e| CacheError::io(source, e))? {
            archive::extract(source, &staging)
        } else {
            fs::copy(source, &staging)
                .map(|_| ())
                .map_err(|e| CacheError::io(source, e))
        };
        if let Err(e) = staged.and_then(|_| {
            fs::rename(&staging, target).map_err(|e| CacheError::io(target, e))
        }) {
            remove_path(&staging).ok();
            return Err(e);
        }
        let hash_path = self.hash_path(category, name);
        let hash_tmp = hash_path.with_extension(format!("{HASH_SUFFIX}.tmp"));
        fs::write(&hash_tmp, hash).map_err(|e| CacheError::io(&hash_tmp, e))?;
        fs::rename(&hash_tmp, &hash_path).map_err(|e| CacheError::io(&hash_path, e))
    }

    /// Removes the payload and its sidecar. Missing pieces are not an error.
    pub fn evict(&self, category: Category, name: &str) -> Result<(), CacheError> {
        check_name(name)?;
        let _lock = self.lock(category, name)?;
        self.evict_unlocked(category, name)
    }

    fn evict_unlocked(&self, category: Category, name: &str) -> Result<(), CacheError> {
        // sidecar first, so a half-removed entry is already invalid
        let hash_path = self.hash_path(category, name);
        remove_path(&hash_path).map_err(|e| CacheError::io(&hash_path, e))?;
        let payload = self.entry_path(category, name)?;
        remove_path(&payload).map_err(|e| CacheError::io(&payload, e))?;
        Ok(())
    }

    // exclusive lock held until the returned file is dropped
    fn lock(&self, category: Category, name: &str) -> Result<File, CacheError> {
        let key = format!("{category}/{name}");
        let path = self
            .root
            .join(LOCKS_DIR)
            .join(format!("{category}-{:016x}.lock", xxh3_64(name.as_bytes())));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| CacheError::Lock {
                key: key.clone(),
                source: source,
            })?;
        file.lock_exclusive()
            .map_err(|source| CacheError::Lock {
                key: key,
                source: source,
            })?;
        Ok(file)
    }
}

/// Hex-encoded SHA-256 of a file's content.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn check_name(name: &str) -> Result<(), CacheError> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
        // would alias the sidecar of another entry
        || name.ends_with(&format!(".{HASH_SUFFIX}"))
        || name.ends_with(&format!(".{HASH_SUFFIX}.tmp"));
    if bad {
        return Err(CacheError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn remove_path(path: &Path) -> io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests::write_zip;
    use std::sync::Arc;
    use std::thread;
    use tempfile::{tempdir, TempDir};

    fn setup() -> (TempDir, ArtifactCache) {
        let dir = tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path().join("data")).unwrap();
        (dir, cache)
    }

    fn source_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_install_lookup_roundtrip() {
        let (dir, cache) = setup();
        let src = source_file(&dir, "m.sav", "model-bytes");
        let path = cache
            .install(Category::Models, "m.sav", &src, Some("Hm"))
            .unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "model-bytes");
        assert_eq!(cache.lookup(Category::Models, "m.sav", Some("Hm")), Some(path.clone()));
        assert_eq!(cache.lookup(Category::Models, "m.sav", None), Some(path));
        assert_eq!(cache.lookup(Category::Models, "m.sav", Some("H0")), None);
    }

    #[test]
    fn test_missing_hash_is_computed() {
        let (dir, cache) = setup();
        let src = source_file(&dir, "d.csv", "a,b\n1,2\n");
        let path = cache.install(Category::Datasets, "d.csv", &src, None).unwrap();
        let expected = hash_file(&path).unwrap();
        assert_eq!(
            cache.lookup(Category::Datasets, "d.csv", Some(&expected)),
            Some(path)
        );
    }

    #[test]
    fn test_zip_source_becomes_directory() {
        let (dir, cache) = setup();
        let src = dir.path().join("bundle");
        write_zip(&src, &[("algo.py", "x"), ("input.schema.json", "{}")]);
        let path = cache
            .install(Category::Algorithms, "g_c", &src, Some("H1"))
            .unwrap();
        assert!(path.is_dir());
        assert!(path.join("algo.py").is_file());
    }

    #[test]
    fn test_entry_without_sidecar_is_invalid() {
        let (dir, cache) = setup();
        let src = source_file(&dir, "m.sav", "bytes");
        let path = cache.install(Category::Models, "m.sav", &src, None).unwrap();
        // simulate a crash between payload and sidecar
        fs::remove_file(cache.hash_path(Category::Models, "m.sav")).unwrap();
        assert!(path.exists());
        assert_eq!(cache.lookup(Category::Models, "m.sav", None), None);
    }

    #[test]
    fn test_reinstall_replaces_previous_payload() {
        let (dir, cache) = setup();
        let first = dir.path().join("v1");
        write_zip(&first, &[("old.py", "x")]);
        cache.install(Category::Algorithms, "g_c", &first, Some("H0")).unwrap();
        let second = dir.path().join("v2");
        write_zip(&second, &[("new.py", "y")]);
        let path = cache.install(Category::Algorithms, "g_c", &second, Some("H1")).unwrap();
        assert!(!path.join("old.py").exists());
        assert!(path.join("new.py").exists());
        assert_eq!(cache.lookup(Category::Algorithms, "g_c", Some("H0")), None);
    }

    #[test]
    fn test_corrupt_zip_leaves_nothing_behind() {
        let (dir, cache) = setup();
        let src = source_file(&dir, "broken", "PK\u{3}\u{4} truncated");
        let err = cache.install(Category::Algorithms, "g_c", &src, Some("H1"));
        assert!(matches!(err, Err(CacheError::CorruptArchive { .. })));
        assert_eq!(cache.lookup(Category::Algorithms, "g_c", None), None);
        let leftovers: Vec<_> = fs::read_dir(cache.root().join("algorithms"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_evict_is_idempotent() {
        let (dir, cache) = setup();
        let src = source_file(&dir, "d.csv", "x");
        cache.install(Category::Datasets, "d.csv", &src, None).unwrap();
        cache.evict(Category::Datasets, "d.csv").unwrap();
        cache.evict(Category::Datasets, "d.csv").unwrap();
        assert_eq!(cache.lookup(Category::Datasets, "d.csv", None), None);
        assert!(!cache.entry_path(Category::Datasets, "d.csv").unwrap().exists());
    }

    #[test]
    fn test_rejects_escaping_names() {
        let (dir, cache) = setup();
        let src = source_file(&dir, "x", "x");
        for name in ["../etc", "a/b", ".hidden", ""] {
            assert!(matches!(
                cache.install(Category::Models, name, &src, None),
                Err(CacheError::InvalidName(_))
            ));
        }
    }

    #[test]
    fn test_sidecar_names_are_rejected() {
        let (dir, cache) = setup();
        let src = source_file(&dir, "d.csv", "a,b\n");
        cache.install(Category::Datasets, "d.csv", &src, Some("Hd")).unwrap();
        let other = source_file(&dir, "other", "Hx");
        for name in ["d.csv.hash", "d.csv.hash.tmp"] {
            assert!(matches!(
                cache.install(Category::Datasets, name, &other, Some("Hx")),
                Err(CacheError::InvalidName(_))
            ));
        }
        assert!(cache.lookup(Category::Datasets, "d.csv", Some("Hd")).is_some());
        assert!(cache.entry_path(Category::Datasets, "hash").is_ok());
    }

    #[test]
    fn test_install_if_absent_keeps_a_valid_entry() {
        let (dir, cache) = setup();
        let first = dir.path().join("first");
        write_zip(&first, &[("algo.py", "first")]);
        let path = cache
            .install(Category::Algorithms, "g_c", &first, Some("H1"))
            .unwrap();
        fs::create_dir_all(path.join(".venv")).unwrap();

        let second = dir.path().join("second");
        write_zip(&second, &[("algo.py", "second")]);
        let (kept, installed) = cache
            .install_if_absent(Category::Algorithms, "g_c", &second, Some("H1"))
            .unwrap();
        assert!(!installed);
        assert_eq!(kept, path);
        assert_eq!(fs::read_to_string(path.join("algo.py")).unwrap(), "first");
        assert!(path.join(".venv").is_dir());

        let (replaced, installed) = cache
            .install_if_absent(Category::Algorithms, "g_c", &second, Some("H2"))
            .unwrap();
        assert!(installed);
        assert_eq!(fs::read_to_string(replaced.join("algo.py")).unwrap(), "second");
    }

    #[test]
    fn test_concurrent_installs_of_one_key_serialize() {
        let (dir, cache) = setup();
        let cache = Arc::new(cache);
        let mut handles = Vec::new();
        for i in 0..8 {
            let src = dir.path().join(format!("src{i}"));
            write_zip(&src, &[("algo.py", &format!("version {i}"))]);
            let cache = cache.clone();
            handles.push(thread::spawn(move || {
                cache
                    .install(Category::Algorithms, "g_c", &src, Some(&format!("H{i}")))
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        // whichever install won, payload and sidecar agree
        let stored = fs::read_to_string(cache.hash_path(Category::Algorithms, "g_c")).unwrap();
        let index: usize = stored.trim_start_matches('H').parse().unwrap();
        let path = cache.lookup(Category::Algorithms, "g_c", Some(&stored)).unwrap();
        assert_eq!(
            fs::read_to_string(path.join("algo.py")).unwrap(),
            format!("version {index}")
        );
    }

    #[test]
    fn test_category_parse() {
        assert_eq!(Category::parse("models"), Some(Category::Models));
        assert_eq!(Category::parse("nope"), None);
        assert_eq!(Category::Algorithms.to_string(), "algorithms");
    }
}

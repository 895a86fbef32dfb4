//! Zip helpers for algorithm bundles and result bundles.

use std::{
    fs::{self, File},
    io::{self, Read},
    path::Path,
};
use zip::ZipArchive;

use crate::error::CacheError;

/// Name of the result document every output bundle carries at its root.
pub const RESULTS_FILE: &str = "results.json";

// local file header, and the end-of-central-directory record of an empty archive
const ZIP_MAGIC: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];
const ZIP_EMPTY_MAGIC: [u8; 4] = [0x50, 0x4b, 0x05, 0x06];

/// Sniffs the first four bytes of `path` for a zip signature.
pub fn is_zip(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 4];
    let mut read = 0;
    while read < magic.len() {
        match file.read(&mut magic[read..])? {
            0 => return Ok(false),
            n => read += n,
        }
    }
    Ok(magic == ZIP_MAGIC || magic == ZIP_EMPTY_MAGIC)
}

/// Extracts `archive` into `target`, creating it.
///
/// Entry CRCs are checked while extracting; entries escaping `target` are
/// rejected by the zip reader.
pub fn extract(archive: &Path, target: &Path) -> Result<(), CacheError> {
    let file = File::open(archive).map_err(|e| CacheError::io(archive, e))?;
    let mut zip = ZipArchive::new(file).map_err(|e| CacheError::CorruptArchive {
        path: archive.to_path_buf(),
        message: e.to_string(),
    })?;
    fs::create_dir_all(target).map_err(|e| CacheError::io(target, e))?;
    zip.extract(target).map_err(|e| CacheError::CorruptArchive {
        path: archive.to_path_buf(),
        message: e.to_string(),
    })
}

/// Whether `bundle` is a readable zip with `results.json` at its root.
pub fn has_results(bundle: &Path) -> bool {
    let Ok(file) = File::open(bundle) else {
        return false;
    };
    match ZipArchive::new(file) {
        Ok(mut zip) => zip.by_name(RESULTS_FILE).is_ok(),
        Err(_) => false,
    }
}

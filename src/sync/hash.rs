//! Content hashing for change verification.
//!
//! BLAKE3 everywhere. Large files are hashed with the rayon-backed multicore
//! hasher; small ones stream through a fixed buffer.

use rayon::prelude::*;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

const PARALLEL_THRESHOLD: u64 = 1024 * 1024;

/// Hash a file's content, returning the hex digest.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();

    if size > PARALLEL_THRESHOLD {
        let mut data = Vec::with_capacity(size as usize);
        file.read_to_end(&mut data)?;
        let mut hasher = blake3::Hasher::new();
        hasher.update_rayon(&data);
        return Ok(hasher.finalize().to_hex().to_string());
    }

    let mut hasher = blake3::Hasher::new();
    let mut buffer = [0u8; 65536];
    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}

/// Hash many files in parallel. Results keep the input order.
pub fn hash_files(paths: &[PathBuf]) -> Vec<io::Result<String>> {
    paths.par_iter().map(|path| hash_file(path)).collect()
}

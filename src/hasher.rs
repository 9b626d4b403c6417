//! Content hashing: MD5, SHA-1 (lowercase hex) and Tiger Tree Hash (uppercase Base32).
//!
//! Stateless after construction — a [`Hasher`] is just a selected [`HashAlgorithm`]; every call
//! to [`Hasher::hash`] reads the file fresh. Callers that hit a recoverable I/O error keep
//! whatever hash was previously stored; this module never has to know about that policy.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use base32::Alphabet;
use md5::{Digest, Md5};
use sha1::Sha1;
use tiger::Tiger;

use crate::error::HashError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Tth,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Tth => "tth",
        }
    }
}

const READ_BUF_SIZE: usize = 64 * 1024;
const TTH_LEAF_SIZE: usize = 1024;
const TTH_LEAF_PREFIX: u8 = 0x00;
const TTH_NODE_PREFIX: u8 = 0x01;

pub struct Hasher {
    algorithm: HashAlgorithm,
}

impl Hasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Hasher { algorithm }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Hash the file at `path`. A read failure is reported as [`HashError::Io`]; the caller is
    /// expected to retain the previously stored hash rather than clear it.
    pub fn hash(&self, path: &Path) -> Result<String, HashError> {
        match self.algorithm {
            HashAlgorithm::Md5 => hash_with_digest::<Md5>(path).map(|d| hex::encode(d)),
            HashAlgorithm::Sha1 => hash_with_digest::<Sha1>(path).map(|d| hex::encode(d)),
            HashAlgorithm::Tth => hash_tth(path),
        }
    }
}

fn open(path: &Path) -> Result<BufReader<File>, HashError> {
    let file = File::open(path).map_err(|source| HashError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(BufReader::new(file))
}

fn hash_with_digest<D: Digest>(path: &Path) -> Result<Vec<u8>, HashError> {
    let mut reader = open(path)?;
    let mut hasher = D::new();
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).map_err(|source| HashError::Io {
            path: path.display().to_string(),
            source,
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_vec())
}

fn hash_tth(path: &Path) -> Result<String, HashError> {
    let mut reader = open(path)?;
    let mut leaves: Vec<[u8; 24]> = Vec::new();
    let mut buf = [0u8; TTH_LEAF_SIZE];
    loop {
        let n = read_full(&mut reader, &mut buf, path)?;
        if n == 0 {
            break;
        }
        leaves.push(tth_leaf_hash(&buf[..n]));
    }
    if leaves.is_empty() {
        leaves.push(tth_leaf_hash(&[]));
    }

    let mut level = leaves;
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        let mut it = level.into_iter();
        while let Some(left) = it.next() {
            match it.next() {
                Some(right) => next.push(tth_node_hash(&left, &right)),
                None => next.push(left),
            }
        }
        level = next;
    }
    let root = level.into_iter().next().expect("at least one leaf");
    Ok(base32::encode(Alphabet::Rfc4648 { padding: false }, &root))
}

fn read_full(reader: &mut impl Read, buf: &mut [u8], path: &Path) -> Result<usize, HashError> {
    let mut total = 0;
    while total < buf.len() {
        let n = reader.read(&mut buf[total..]).map_err(|source| HashError::Io {
            path: path.display().to_string(),
            source,
        })?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

fn tth_leaf_hash(block: &[u8]) -> [u8; 24] {
    let mut hasher = Tiger::new();
    hasher.update([TTH_LEAF_PREFIX]);
    hasher.update(block);
    let out = hasher.finalize();
    let mut buf = [0u8; 24];
    buf.copy_from_slice(&out);
    buf
}

fn tth_node_hash(left: &[u8; 24], right: &[u8; 24]) -> [u8; 24] {
    let mut hasher = Tiger::new();
    hasher.update([TTH_NODE_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    let out = hasher.finalize();
    let mut buf = [0u8; 24];
    buf.copy_from_slice(&out);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn md5_is_lowercase_hex() {
        let f = write_tmp(b"hello world");
        let digest = Hasher::new(HashAlgorithm::Md5).hash(f.path()).unwrap();
        assert_eq!(digest.len(), 32);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(digest, "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn sha1_is_lowercase_hex() {
        let f = write_tmp(b"hello world");
        let digest = Hasher::new(HashAlgorithm::Sha1).hash(f.path()).unwrap();
        assert_eq!(digest.len(), 40);
        assert!(digest.chars().all(|c| !c.is_ascii_uppercase()));
    }

    #[test]
    fn tth_is_uppercase_base32_39_chars() {
        let f = write_tmp(b"hello world");
        let digest = Hasher::new(HashAlgorithm::Tth).hash(f.path()).unwrap();
        assert_eq!(digest.len(), 39);
        assert!(digest.chars().all(|c| !c.is_ascii_lowercase()));
    }

    #[test]
    fn tth_deterministic() {
        let f = write_tmp(b"some repeated content for hashing purposes");
        let a = Hasher::new(HashAlgorithm::Tth).hash(f.path()).unwrap();
        let b = Hasher::new(HashAlgorithm::Tth).hash(f.path()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn tth_handles_multi_leaf_file() {
        let contents = vec![0x42u8; TTH_LEAF_SIZE * 3 + 17];
        let f = write_tmp(&contents);
        let digest = Hasher::new(HashAlgorithm::Tth).hash(f.path()).unwrap();
        assert_eq!(digest.len(), 39);
    }

    #[test]
    fn different_content_different_hash() {
        let a = write_tmp(b"content a");
        let b = write_tmp(b"content b");
        let ha = Hasher::new(HashAlgorithm::Sha1).hash(a.path()).unwrap();
        let hb = Hasher::new(HashAlgorithm::Sha1).hash(b.path()).unwrap();
        assert_ne!(ha, hb);
    }

    #[test]
    fn missing_file_is_recoverable_error() {
        let err = Hasher::new(HashAlgorithm::Md5).hash(Path::new("/nonexistent/does/not/exist")).unwrap_err();
        assert!(matches!(err, HashError::Io { .. }));
    }
}

//! Digest computation and encoding helpers shared by the spack crates.
//!
//! Everything content-addressed in the buildcache is keyed by SHA-256;
//! DAG hashes additionally use a lowercase base-32 rendering so they can
//! appear in file names and spec strings without case issues.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

pub use digest::{Digest, Output};
pub use md5::Md5;
pub use sha2::Sha256;

/// Computes the hash of everything consumed from `reader`.
pub fn hash_reader<D: Digest>(mut reader: impl Read) -> io::Result<Output<D>> {
    let mut hasher = D::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// Computes the hash of the file at `path`.
pub fn hash_file<D: Digest>(path: &Path) -> io::Result<Output<D>> {
    hash_reader::<D>(File::open(path)?)
}

/// Returns the SHA-256 of `data` as a lowercase hex string.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Returns the SHA-256 of the file at `path` as a lowercase hex string.
pub fn sha256_hex_file(path: &Path) -> io::Result<String> {
    Ok(hex::encode(hash_file::<Sha256>(path)?))
}

/// A writer adapter that hashes every byte written through it.
///
/// Used by the tarball engine to compute the digest of the uncompressed
/// archive and of the compressed blob in a single pass.
pub struct HashingWriter<W, D: Digest> {
    inner: W,
    hasher: D,
}

impl<W: Write, D: Digest> HashingWriter<W, D> {
    pub fn new(inner: W) -> Self {
        Self { inner, hasher: D::new() }
    }

    /// Consumes the adapter, returning the inner writer and the digest.
    pub fn finalize(self) -> (W, Output<D>) {
        (self.inner, self.hasher.finalize())
    }
}

impl<W: Write, D: Digest> Write for HashingWriter<W, D> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// RFC 4648 base-32 alphabet, lowercased. Spack renders DAG hashes in
/// this alphabet so they are safe in case-insensitive file systems.
const B32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// Encodes `data` as lowercase unpadded base-32.
pub fn encode_b32(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() * 8 + 4) / 5);
    let mut acc: u64 = 0;
    let mut bits = 0u32;
    for &byte in data {
        acc = (acc << 8) | u64::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(B32_ALPHABET[((acc >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(B32_ALPHABET[((acc << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

/// serde adapter serializing a digest output as a lowercase hex string.
pub mod serde_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn sha256_of_empty_input() {
        assert_eq!(
            hash_reader::<Sha256>(&b""[..]).unwrap().as_slice(),
            hex!("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
        );
    }

    #[test]
    fn b32_known_vectors() {
        // RFC 4648 test vectors, lowercased and unpadded.
        assert_eq!(encode_b32(b""), "");
        assert_eq!(encode_b32(b"f"), "my");
        assert_eq!(encode_b32(b"fo"), "mzxq");
        assert_eq!(encode_b32(b"foo"), "mzxw6");
        assert_eq!(encode_b32(b"foob"), "mzxw6yq");
        assert_eq!(encode_b32(b"fooba"), "mzxw6ytb");
        assert_eq!(encode_b32(b"foobar"), "mzxw6ytboi");
    }

    #[test]
    fn hashing_writer_matches_direct_hash() {
        let mut writer = HashingWriter::<_, Sha256>::new(Vec::new());
        writer.write_all(b"hello ").unwrap();
        writer.write_all(b"world").unwrap();
        let (inner, digest) = writer.finalize();
        assert_eq!(inner, b"hello world");
        assert_eq!(digest, Sha256::digest(b"hello world"));
    }
}

//! SHA-256 content hashes, used as artifact identifiers and checksums.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Read buffer size when hashing a stream (64KB)
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Content hash (256-bit)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn from_data(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Hash a buffer on the blocking pool so large images don't stall the
    /// async workers.
    pub async fn from_data_blocking(data: bytes::Bytes) -> Self {
        match tokio::task::spawn_blocking(move || Self::from_data(&data)).await {
            Ok(hash) => hash,
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        }
    }

    /// Hash everything a reader yields. Returns the hash and the byte count.
    pub async fn from_reader<R: AsyncRead + Unpin>(mut reader: R) -> std::io::Result<(Self, u64)> {
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_BUFFER_SIZE];
        let mut total = 0u64;

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            total += n as u64;
        }

        Ok((Self(hasher.finalize().into()), total))
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 64 || !hex.is_ascii() {
            return None;
        }
        let mut hash = [0u8; 32];
        for (i, pair) in hex.as_bytes().chunks(2).enumerate() {
            let s = std::str::from_utf8(pair).ok()?;
            hash[i] = u8::from_str_radix(s, 16).ok()?;
        }
        Some(Self(hash))
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Checksum string as recorded in artifact metadata
    pub fn to_checksum(&self) -> String {
        format!("sha256:{}", self.to_hex())
    }

    pub fn from_checksum(checksum: &str) -> Option<Self> {
        checksum.strip_prefix("sha256:").and_then(Self::from_hex)
    }
}

impl std::fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(&s.to_ascii_lowercase())
            .ok_or_else(|| format!("invalid artifact id '{}': expected 64 hex characters", s))
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        let hash = ContentHash::from_data(b"hello world");
        assert_eq!(
            hash.to_hex(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(ContentHash::from_hex(&hash.to_hex()), Some(hash));
    }

    #[test]
    fn test_rejects_malformed_hex() {
        assert!(ContentHash::from_hex("abc").is_none());
        assert!(ContentHash::from_hex(&"zz".repeat(32)).is_none());
        assert!("not-a-hash".parse::<ContentHash>().is_err());
    }

    #[test]
    fn test_checksum_format() {
        let hash = ContentHash::from_data(b"fw");
        let checksum = hash.to_checksum();
        assert!(checksum.starts_with("sha256:"));
        assert_eq!(ContentHash::from_checksum(&checksum), Some(hash));
        assert_eq!(ContentHash::from_checksum(&hash.to_hex()), None);
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        let hash = ContentHash::from_data(b"fw");
        let upper = hash.to_hex().to_uppercase();
        assert_eq!(upper.parse::<ContentHash>().unwrap(), hash);
    }

    #[tokio::test]
    async fn test_reader_matches_buffer_hash() {
        let data = vec![7u8; 200_000];
        let (hash, len) = ContentHash::from_reader(std::io::Cursor::new(data.clone()))
            .await
            .unwrap();
        assert_eq!(len, 200_000);
        assert_eq!(hash, ContentHash::from_data(&data));
        assert_eq!(ContentHash::from_data_blocking(data.into()).await, hash);
    }
}

//! A parser for layer digests, either a bare hex string or the
//! `sha256:<digest>` form used in image manifests.

use std::fmt::Display;

use anyhow::Result;

pub(crate) const SHA256_HEXLEN: usize = 64;

const SHA256_PREFIX: &str = "sha256:";

fn is_ascii_hex_lowercase(c: char) -> bool {
    c.is_ascii_digit() | matches!(c, 'a'..='f')
}

/// A validated SHA-256 layer digest, stored as 64 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LayerDigest(String);

impl LayerDigest {
    /// Parse a digest. The `sha256:` algorithm prefix is optional; any other
    /// algorithm is rejected.
    pub fn parse(s: &str) -> Result<Self> {
        let hex = match s.split_once(':') {
            Some(("sha256", digest)) => digest,
            Some((alg, _)) => anyhow::bail!("Unsupported digest algorithm: {alg}"),
            None => s,
        };
        if hex.len() != SHA256_HEXLEN {
            anyhow::bail!("Invalid sha256 (length={})", hex.len());
        }
        if let Some(c) = hex.chars().find(|&c| !is_ascii_hex_lowercase(c)) {
            anyhow::bail!("Invalid sha256 (non-hex {c:?})");
        }
        Ok(Self(hex.to_owned()))
    }

    /// Build a digest from raw hash output, as returned by [`crate::hashreader::HashingReader::finish`].
    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::parse(&hex::encode(bytes))
    }

    /// The hex digest without algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.0
    }

    /// The first two characters, used as a fan-out directory.
    pub(crate) fn prefix(&self) -> &str {
        &self.0[..2]
    }

    /// The digest in `sha256:<hex>` form.
    pub fn to_descriptor_digest(&self) -> String {
        format!("{SHA256_PREFIX}{}", self.0)
    }
}

impl Display for LayerDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for LayerDigest {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_parse() {
        let bare = LayerDigest::parse(EMPTY_SHA256).unwrap();
        let prefixed = LayerDigest::parse(&format!("sha256:{EMPTY_SHA256}")).unwrap();
        assert_eq!(bare, prefixed);
        assert_eq!(bare.hex(), EMPTY_SHA256);
        assert_eq!(bare.prefix(), "e3");
        assert_eq!(bare.to_descriptor_digest(), format!("sha256:{EMPTY_SHA256}"));
    }

    #[test]
    fn test_parse_invalid() {
        let failing = [
            "",
            "foo",
            "sha512:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
            "E3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855",
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b85",
            "../0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
        ];
        for case in failing {
            assert!(LayerDigest::parse(case).is_err(), "{case}");
        }
    }
}

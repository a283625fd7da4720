//! Subresource-integrity parsing and verification for tarballs.
//!
//! Registries publish `dist.integrity` (`sha512-<base64>`, possibly several
//! space-separated hashes) and the legacy `dist.shasum` (hex SHA-1). Both are
//! normalized into a single [`Integrity`] at the manifest boundary.

use super::error::PkgError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::fmt;
use std::str::FromStr;

/// Hash algorithms understood in integrity strings, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Algorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl Algorithm {
    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "sha1" => Some(Self::Sha1),
            "sha256" => Some(Self::Sha256),
            "sha384" => Some(Self::Sha384),
            "sha512" => Some(Self::Sha512),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }

    fn digest(self, bytes: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => Sha1::digest(bytes).to_vec(),
            Self::Sha256 => Sha256::digest(bytes).to_vec(),
            Self::Sha384 => Sha384::digest(bytes).to_vec(),
            Self::Sha512 => Sha512::digest(bytes).to_vec(),
        }
    }
}

/// An expected content hash for a downloaded artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Integrity {
    algorithm: Algorithm,
    digest: Vec<u8>,
}

impl Integrity {
    /// Parse an SRI string, keeping the strongest supported hash.
    ///
    /// # Errors
    /// Returns an error if no entry uses a supported algorithm with valid base64.
    pub fn parse_sri(input: &str) -> Result<Self, PkgError> {
        let mut best: Option<Self> = None;

        for token in input.split_whitespace() {
            let Some((prefix, rest)) = token.split_once('-') else {
                continue;
            };
            let Some(algorithm) = Algorithm::from_prefix(prefix) else {
                continue;
            };
            // SRI allows `?options` after the digest.
            let encoded = rest.split('?').next().unwrap_or(rest);
            let digest = STANDARD.decode(encoded).map_err(|e| {
                PkgError::spec_invalid(format!("Invalid base64 in integrity '{token}': {e}"))
            })?;

            if best.as_ref().map_or(true, |b| algorithm > b.algorithm) {
                best = Some(Self { algorithm, digest });
            }
        }

        best.ok_or_else(|| {
            PkgError::spec_invalid(format!("Unsupported integrity string '{input}'"))
        })
    }

    /// Build from a legacy hex SHA-1 `shasum`.
    ///
    /// # Errors
    /// Returns an error if the string is not 40 hex characters.
    pub fn from_shasum(hex: &str) -> Result<Self, PkgError> {
        if hex.len() != 40 || !hex.is_ascii() {
            return Err(PkgError::spec_invalid(format!("Invalid shasum '{hex}'")));
        }

        let digest = (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16))
            .collect::<Result<Vec<u8>, _>>()
            .map_err(|e| PkgError::spec_invalid(format!("Invalid shasum '{hex}': {e}")))?;

        Ok(Self {
            algorithm: Algorithm::Sha1,
            digest,
        })
    }

    /// Pick the integrity for a manifest `dist` block, preferring `integrity` over `shasum`.
    ///
    /// # Errors
    /// Returns an error if the present field cannot be parsed.
    pub fn from_dist(integrity: Option<&str>, shasum: Option<&str>) -> Result<Option<Self>, PkgError> {
        match (integrity, shasum) {
            (Some(sri), _) => Self::parse_sri(sri).map(Some),
            (None, Some(hex)) => Self::from_shasum(hex).map(Some),
            (None, None) => Ok(None),
        }
    }

    /// Compute the integrity of `bytes` with the given algorithm.
    #[must_use]
    pub fn compute(algorithm: Algorithm, bytes: &[u8]) -> Self {
        Self {
            algorithm,
            digest: algorithm.digest(bytes),
        }
    }

    #[must_use]
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Check `bytes` against this integrity.
    ///
    /// # Errors
    /// Returns `PKG_INTEGRITY_MISMATCH` naming `package` when the hashes differ.
    pub fn verify(&self, package: &str, bytes: &[u8]) -> Result<(), PkgError> {
        let actual = Self::compute(self.algorithm, bytes);
        if actual.digest == self.digest {
            Ok(())
        } else {
            Err(PkgError::integrity_mismatch(
                package,
                &self.to_string(),
                &actual.to_string(),
            ))
        }
    }
}

impl fmt::Display for Integrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.algorithm.as_str(), STANDARD.encode(&self.digest))
    }
}

impl FromStr for Integrity {
    type Err = PkgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_sri(s)
    }
}

impl Serialize for Integrity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Integrity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

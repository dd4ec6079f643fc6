//! Object identifiers and their on-disk path rendering
//!
//! Textual form:
//! ```text
//! <hex digest>[-<algorithm suffix>]
//! 0123456789abcdef0123456789abcdef01234567          (sha1)
//! 0123456789abcdef0123456789abcdef01234567-rmd160   (ripemd-160)
//! ```
//!
//! Path form splits off the first byte as the shard directory:
//! ```text
//! 01/23456789abcdef0123456789abcdef01234567
//! ```

use std::fmt;
use std::str::FromStr;

use nom::{
    bytes::complete::tag,
    character::complete::{alphanumeric1, hex_digit1},
    combinator::{all_consuming, opt},
    sequence::{preceded, tuple},
    IResult,
};

use crate::error::{Error, Result};

/// Longest digest of any supported algorithm
pub const MAX_DIGEST_SIZE: usize = 20;

/// Digest algorithm of an object id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Algorithm {
    /// MD5, 16 bytes
    Md5,
    /// SHA-1, 20 bytes
    #[default]
    Sha1,
    /// RIPEMD-160, 20 bytes
    Rmd160,
    /// SHAKE-128 truncated to 20 bytes
    Shake128,
}

impl Algorithm {
    /// Digest length in bytes
    pub fn digest_size(self) -> usize {
        match self {
            Algorithm::Md5 => 16,
            Algorithm::Sha1 | Algorithm::Rmd160 | Algorithm::Shake128 => 20,
        }
    }

    /// Suffix appended to the hex digest in textual and path form
    pub fn suffix(self) -> &'static str {
        match self {
            Algorithm::Md5 | Algorithm::Sha1 => "",
            Algorithm::Rmd160 => "-rmd160",
            Algorithm::Shake128 => "-shake128",
        }
    }

    fn from_suffix(suffix: Option<&str>, hex_len: usize) -> Option<Self> {
        match (suffix, hex_len) {
            (None, 32) => Some(Algorithm::Md5),
            (None, 40) => Some(Algorithm::Sha1),
            (Some("rmd160"), 40) => Some(Algorithm::Rmd160),
            (Some("shake128"), 40) => Some(Algorithm::Shake128),
            _ => None,
        }
    }
}

/// Content hash identifying a cache object
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId {
    algorithm: Algorithm,
    digest: [u8; MAX_DIGEST_SIZE],
}

impl ObjectId {
    /// Create an id from raw digest bytes.
    ///
    /// # Arguments
    /// * `algorithm` - Digest algorithm
    /// * `digest` - Raw digest, must match the algorithm's digest size
    pub fn new(algorithm: Algorithm, digest: &[u8]) -> Result<Self> {
        if digest.len() != algorithm.digest_size() {
            return Err(Error::InvalidId(format!(
                "{:?} digest must be {} bytes, got {}",
                algorithm,
                algorithm.digest_size(),
                digest.len()
            )));
        }
        let mut id = Self::zero(algorithm);
        id.digest[..digest.len()].copy_from_slice(digest);
        Ok(id)
    }

    /// All-zero digest of the given algorithm
    pub fn zero(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            digest: [0u8; MAX_DIGEST_SIZE],
        }
    }

    /// The distinguished null id, key of the canonical empty object
    pub fn null() -> Self {
        Self::zero(Algorithm::Sha1)
    }

    /// Whether this is the distinguished null id
    pub fn is_null(&self) -> bool {
        *self == Self::null()
    }

    /// Digest algorithm
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Raw digest bytes
    pub fn digest(&self) -> &[u8] {
        &self.digest[..self.algorithm.digest_size()]
    }

    /// Lower-case hex rendering of the digest, without suffix
    pub fn to_hex(&self) -> String {
        hex::encode(self.digest())
    }

    /// Relative object path: `<2-hex>/<rest-hex><suffix>`
    pub fn make_path(&self) -> String {
        let digits = self.to_hex();
        format!("{}/{}{}", &digits[..2], &digits[2..], self.algorithm.suffix())
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.to_hex(), self.algorithm.suffix())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self)
    }
}

fn parse_parts(input: &str) -> IResult<&str, (&str, Option<&str>)> {
    all_consuming(tuple((hex_digit1, opt(preceded(tag("-"), alphanumeric1)))))(input)
}

impl FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (_, (digits, suffix)) =
            parse_parts(s).map_err(|_| Error::InvalidId(s.to_string()))?;
        let algorithm = Algorithm::from_suffix(suffix, digits.len())
            .ok_or_else(|| Error::InvalidId(s.to_string()))?;

        let digest =
            hex::decode(digits).map_err(|e| Error::InvalidId(format!("{}: {}", s, e)))?;

        Self::new(algorithm, &digest)
    }
}

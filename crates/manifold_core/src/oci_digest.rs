use std::fmt;
use std::str::FromStr;

use digest::Digest;
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha512};

use crate::{Error, Result};

// https://github.com/opencontainers/image-spec/blob/main/descriptor.md#digests
//
// Held in decoded form so that the stored byte encoding and every lookup go through the same
// normalization regardless of the hex case a client sent.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OciDigest {
    algorithm: DigestAlgorithm,
    hash: Vec<u8>,
}

impl TryFrom<&str> for OciDigest {
    type Error = Error;
    fn try_from(s: &str) -> Result<Self> {
        let (algo, encoded) = match s.split_once(':') {
            Some((a, e)) if !a.is_empty() && !e.is_empty() => (a, e),
            _ => return Err(Error::InvalidDigest(s.to_string())),
        };
        let algorithm = DigestAlgorithm::try_from(algo)?;
        if encoded.len() != algorithm.hash_len() * 2 {
            return Err(Error::InvalidDigest(s.to_string()));
        }
        let hash = hex::decode(encoded).map_err(|_| Error::InvalidDigest(s.to_string()))?;

        Ok(Self { algorithm, hash })
    }
}

impl TryFrom<String> for OciDigest {
    type Error = Error;
    fn try_from(s: String) -> Result<Self> {
        s.as_str().try_into()
    }
}

impl FromStr for OciDigest {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        s.try_into()
    }
}

impl From<OciDigest> for String {
    fn from(d: OciDigest) -> String {
        d.to_string()
    }
}

impl From<&OciDigest> for String {
    fn from(d: &OciDigest) -> String {
        d.to_string()
    }
}

impl fmt::Display for OciDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, hex::encode(&self.hash))
    }
}

impl OciDigest {
    /// Digest the given content with sha256.
    pub fn from_content(bs: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        Digest::update(&mut hasher, bs);
        Self {
            algorithm: DigestAlgorithm::Sha256,
            hash: hasher.finalize().to_vec(),
        }
    }

    /// Digest the given content with a specific algorithm. Only the algorithms registered with
    /// the OCI image spec can be computed here.
    pub fn from_content_with(algorithm: DigestAlgorithm, bs: &[u8]) -> Result<Self> {
        let hash = match algorithm {
            DigestAlgorithm::Sha256 => Sha256::digest(bs).to_vec(),
            DigestAlgorithm::Sha512 => Sha512::digest(bs).to_vec(),
            a => return Err(Error::UnsupportedDigestAlgorithm(a.to_string())),
        };
        Ok(Self { algorithm, hash })
    }

    /// Storage encoding: one algorithm prefix byte followed by the raw hash.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.hash.len());
        out.push(self.algorithm.prefix());
        out.extend_from_slice(&self.hash);
        out
    }

    /// Inverse of [`OciDigest::to_bytes`].
    pub fn from_bytes(bs: &[u8]) -> Result<Self> {
        let (prefix, hash) = match bs.split_first() {
            Some(parts) => parts,
            None => return Err(Error::InvalidDigest(String::from("empty digest"))),
        };
        let algorithm = DigestAlgorithm::from_prefix(*prefix)?;
        if hash.is_empty() {
            return Err(Error::InvalidDigest(String::from("no checksum")));
        }
        if hash.len() != algorithm.hash_len() {
            return Err(Error::InvalidDigest(format!(
                "{algorithm} checksum of {} bytes",
                hash.len()
            )));
        }
        Ok(Self {
            algorithm,
            hash: hash.to_vec(),
        })
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Lowercase hex form of the hash, without the algorithm.
    pub fn encoded(&self) -> String {
        hex::encode(&self.hash)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    Sha256,
    Sha512,
    Sha1,
    Md5,
}

impl DigestAlgorithm {
    fn prefix(self) -> u8 {
        match self {
            DigestAlgorithm::Sha256 => 0x01,
            DigestAlgorithm::Sha512 => 0x02,
            DigestAlgorithm::Sha1 => 0x03,
            DigestAlgorithm::Md5 => 0x04,
        }
    }

    fn from_prefix(b: u8) -> Result<Self> {
        match b {
            0x01 => Ok(DigestAlgorithm::Sha256),
            0x02 => Ok(DigestAlgorithm::Sha512),
            0x03 => Ok(DigestAlgorithm::Sha1),
            0x04 => Ok(DigestAlgorithm::Md5),
            b => Err(Error::UnsupportedDigestAlgorithm(format!(
                "unknown algorithm prefix {b:#04x}"
            ))),
        }
    }

    /// Length of the raw hash in bytes.
    pub fn hash_len(self) -> usize {
        match self {
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha512 => 64,
            DigestAlgorithm::Sha1 => 20,
            DigestAlgorithm::Md5 => 16,
        }
    }
}

impl TryFrom<&str> for DigestAlgorithm {
    type Error = Error;

    fn try_from(a: &str) -> Result<Self> {
        match a {
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "sha512" => Ok(DigestAlgorithm::Sha512),
            "sha1" => Ok(DigestAlgorithm::Sha1),
            "md5" => Ok(DigestAlgorithm::Md5),
            s => Err(Error::UnsupportedDigestAlgorithm(String::from(s))),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha512 => "sha512",
            DigestAlgorithm::Sha1 => "sha1",
            DigestAlgorithm::Md5 => "md5",
        })
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;

    const SHA256_HELLO: &str =
        "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[rstest]
    #[case::sha256(SHA256_HELLO, Ok(SHA256_HELLO))]
    #[case::uppercase_normalized(
        "sha256:2CF24DBA5FB0A30E26E83B2AC5B9E29E1B161E5C1FA7425E73043362938B9824",
        Ok(SHA256_HELLO)
    )]
    #[case::md5(
        "md5:5d41402abc4b2a76b9719d911017c592",
        Ok("md5:5d41402abc4b2a76b9719d911017c592")
    )]
    #[case::unknown_algorithm("sha666:meow", Err("unsupported digest algorithm: sha666"))]
    #[case::no_separator("sha256meow", Err("invalid digest: sha256meow"))]
    #[case::empty_hash("sha256:", Err("invalid digest: sha256:"))]
    #[case::empty_algorithm(":meow", Err("invalid digest: :meow"))]
    #[case::short_hash("sha256:meow", Err("invalid digest: sha256:meow"))]
    #[case::not_hex(
        "sha256:zzf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824",
        Err("invalid digest: sha256:zzf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
    )]
    fn validate_try_from(#[case] input: &str, #[case] expected: std::result::Result<&str, &str>) {
        let actual: Result<OciDigest> = input.try_into();
        match (expected, actual) {
            (Ok(exp), Ok(act)) => {
                assert_eq!(exp, act.to_string());
            }
            (Ok(s), Err(e)) => {
                panic!("expected Ok( {s:?} ) got Err( {e:?} )");
            }
            (Err(exp), Err(act)) => {
                assert_eq!(exp, format!("{act}"));
            }
            (Err(e), Ok(s)) => {
                panic!("expected Err( {e:?} ) got Ok( {s:?} )");
            }
        }
    }

    #[rstest]
    #[case::sha256(SHA256_HELLO)]
    #[case::sha1("sha1:aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d")]
    fn storage_bytes_carry_algorithm_prefix(#[case] input: &str) {
        let d = OciDigest::try_from(input).unwrap();
        let bytes = d.to_bytes();
        assert_eq!(bytes[0], d.algorithm().prefix());
        assert_eq!(bytes.len(), 1 + d.algorithm().hash_len());
        assert_eq!(OciDigest::from_bytes(&bytes).unwrap(), d);
    }

    #[rstest]
    #[case::empty(&[], "invalid digest: empty digest")]
    #[case::no_checksum(&[0x01], "invalid digest: no checksum")]
    #[case::unknown_prefix(&[0x09, 0xaa], "unsupported digest algorithm: unknown algorithm prefix 0x09")]
    #[case::truncated(&[0x01, 0xaa, 0xbb], "invalid digest: sha256 checksum of 2 bytes")]
    fn from_bytes_rejects_malformed(#[case] input: &[u8], #[case] expected: &str) {
        let err = OciDigest::from_bytes(input).unwrap_err();
        assert_eq!(expected, err.to_string());
    }

    #[test]
    fn content_digest_matches_known_value() {
        assert_eq!(OciDigest::from_content(b"hello").to_string(), SHA256_HELLO);
        let via_algorithm =
            OciDigest::from_content_with(DigestAlgorithm::Sha256, b"hello").unwrap();
        assert_eq!(via_algorithm.to_string(), SHA256_HELLO);
        assert!(OciDigest::from_content_with(DigestAlgorithm::Md5, b"hello").is_err());
    }

    #[test]
    fn serde_uses_string_form() {
        let d = OciDigest::try_from(SHA256_HELLO).unwrap();
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"{SHA256_HELLO}\""));
        let back: OciDigest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }
}

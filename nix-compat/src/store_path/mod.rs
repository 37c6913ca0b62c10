use crate::nixbase32::{self, Nixbase32DecodeError};
use data_encoding::BASE64;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

pub const DIGEST_SIZE: usize = 20;
// Checked against nixbase32::encode_len in the tests.
pub const ENCODED_DIGEST_SIZE: usize = 32;

// The default store dir, without trailing slash.
pub const STORE_DIR: &str = "/nix/store";

/// The suffix all derivation store paths carry in their name.
pub const DRV_EXTENSION: &str = ".drv";

/// Errors that can occur when parsing a literal store path
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Dash is missing between hash and name")]
    MissingDash(),
    #[error("Hash encoding is invalid: {0}")]
    InvalidHashEncoding(Nixbase32DecodeError),
    #[error("Invalid length")]
    InvalidLength(),
    #[error(
        "Invalid name: \"{}\", character at position {} is invalid",
        std::str::from_utf8(.0).unwrap_or(&BASE64.encode(.0)),
        .1,
    )]
    InvalidName(Vec<u8>, usize),
    #[error("Path {0:?} is not inside the store dir {1:?}")]
    MissingStoreDir(PathBuf, PathBuf),
}

/// Represents a path in a store (a direct child of the store dir).
///
/// It consists of a digest (20 bytes), and a name, which is a string.
/// The name may only contain ASCII alphanumeric, or one of the following
/// characters: `-`, `_`, `.`, `+`, `?`, `=`.
/// Derivation paths are store paths too, their names end with `.drv`.
///
/// A [StorePath] never encodes a subpath "inside" the store path, and it
/// doesn't know which store dir it lives in.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StorePath {
    pub digest: [u8; DIGEST_SIZE],
    pub name: String,
}

impl PartialOrd for StorePath {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StorePath {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.digest
            .cmp(&other.digest)
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl FromStr for StorePath {
    type Err = Error;

    /// Construct a [StorePath] by passing the `$digest-$name` string
    /// that comes after the store dir.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bytes(s.as_bytes())
    }
}

impl StorePath {
    /// Construct a [StorePath] by passing the `$digest-$name` string
    /// that comes after the store dir.
    pub fn from_bytes(s: &[u8]) -> Result<StorePath, Error> {
        // at least the encoded digest, a dash and a single name character.
        if s.len() < ENCODED_DIGEST_SIZE + 2 {
            return Err(Error::InvalidLength());
        }

        let digest = nixbase32::decode(&s[..ENCODED_DIGEST_SIZE])
            .map_err(Error::InvalidHashEncoding)?;

        if s[ENCODED_DIGEST_SIZE] != b'-' {
            return Err(Error::MissingDash());
        }

        Ok(StorePath {
            name: validate_name(&s[ENCODED_DIGEST_SIZE + 1..])?,
            digest: digest.try_into().map_err(|_| Error::InvalidLength())?,
        })
    }

    /// Construct a [StorePath] from a name and digest.
    pub fn from_name_and_digest(name: &str, digest: &[u8]) -> Result<StorePath, Error> {
        Ok(Self {
            name: validate_name(name.as_bytes())?,
            digest: digest.try_into().map_err(|_| Error::InvalidLength())?,
        })
    }

    /// Decompose an absolute path below `store_dir` into a [StorePath] and
    /// the rest of the path inside it.
    pub fn from_absolute_path_full(
        store_dir: &Path,
        path: &Path,
    ) -> Result<(StorePath, PathBuf), Error> {
        let rest = path
            .strip_prefix(store_dir)
            .map_err(|_| Error::MissingStoreDir(path.to_owned(), store_dir.to_owned()))?;

        let mut components = rest.components();
        let first = components.next().ok_or(Error::InvalidLength())?;
        let store_path = StorePath::from_bytes(first.as_os_str().as_encoded_bytes())?;

        Ok((store_path, components.collect()))
    }

    /// Parses an absolute path that must be a direct child of `store_dir`.
    pub fn from_absolute_path(store_dir: &Path, path: &Path) -> Result<StorePath, Error> {
        match Self::from_absolute_path_full(store_dir, path)? {
            (store_path, rest) if rest.as_os_str().is_empty() => Ok(store_path),
            _ => Err(Error::InvalidLength()),
        }
    }

    /// Returns the absolute path of this [StorePath] inside `store_dir`.
    pub fn to_absolute_path(&self, store_dir: &Path) -> PathBuf {
        store_dir.join(self.to_string())
    }

    /// Whether this is the path of a derivation (its name ends with `.drv`).
    pub fn is_derivation(&self) -> bool {
        self.name.ends_with(DRV_EXTENSION)
    }
}

/// Checks a given &[u8] to match the restrictions for [StorePath::name], and
/// returns the name as string if successful.
pub(crate) fn validate_name(s: &[u8]) -> Result<String, Error> {
    if s.is_empty() {
        return Err(Error::InvalidLength());
    }

    for (i, c) in s.iter().enumerate() {
        let allowed = c.is_ascii_alphanumeric()
            || (*c == b'.' && i != 0) // can't start with a dot
            || matches!(c, b'-' | b'_' | b'+' | b'?' | b'=');

        if !allowed {
            return Err(Error::InvalidName(s.to_vec(), i));
        }
    }

    // only ASCII got through the loop above.
    Ok(s.iter().map(|c| *c as char).collect())
}

impl fmt::Display for StorePath {
    /// The string representation of a store path starts with a digest (20
    /// bytes), [crate::nixbase32]-encoded, followed by a `-`,
    /// and ends with the name.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", nixbase32::encode(&self.digest), self.name)
    }
}

impl Serialize for StorePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StorePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        StorePath::from_bytes(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use crate::nixbase32;
    use rstest::rstest;

    use super::{Error, StorePath, DIGEST_SIZE, ENCODED_DIGEST_SIZE, STORE_DIR};

    const EXAMPLE: &str = "00bgd045z0d4icpbc2yyz4gx48ak44la-net-tools-1.60_p20170221182432";

    #[test]
    fn encoded_digest_size() {
        assert_eq!(ENCODED_DIGEST_SIZE, nixbase32::encode_len(DIGEST_SIZE));
    }

    #[test]
    fn happy_path() {
        let store_path = StorePath::from_bytes(EXAMPLE.as_bytes()).expect("must parse");

        let expected_digest: [u8; DIGEST_SIZE] = [
            0x8a, 0x12, 0x32, 0x15, 0x22, 0xfd, 0x91, 0xef, 0xbd, 0x60, 0xeb, 0xb2, 0x48, 0x1a,
            0xf8, 0x85, 0x80, 0xf6, 0x16, 0x00,
        ];

        assert_eq!("net-tools-1.60_p20170221182432", store_path.name);
        assert_eq!(expected_digest, store_path.digest);
        assert_eq!(EXAMPLE, store_path.to_string());
        assert!(!store_path.is_derivation());
    }

    #[rstest]
    // rejected when `nix-store --add`'ing an empty `.gitignore` file.
    #[case::starts_with_dot(b"fli4bwscgna7lpm7v5xgnjxrxh0yc7ra-.gitignore")]
    #[case::invalid_hash_length(b"00bgd045z0d4icpbc2yy-net-tools-1.60_p20170221182432")]
    #[case::invalid_encoding_hash(b"00bgd045z0d4icpbc2yyz4gx48aku4la-net-tools-1.60_p20170221182432")]
    #[case::subpath(b"00bgd045z0d4icpbc2yyz4gx48ak44la-net-tools-1.60_p20170221182432/bin/arp")]
    #[case::no_dash(b"00bgd045z0d4icpbc2yyz4gx48ak44lanet-tools-1.60_p20170221182432")]
    fn invalid(#[case] s: &[u8]) {
        StorePath::from_bytes(s).expect_err("must fail");
    }

    #[test]
    fn derivation() {
        let drv = StorePath::from_bytes(b"00bgd045z0d4icpbc2yyz4gx48ak44la-hello-2.12.drv")
            .expect("must parse");
        assert!(drv.is_derivation());
    }

    #[rstest]
    #[case::bare("/nix/store/00bgd045z0d4icpbc2yyz4gx48ak44la-net-tools-1.60_p20170221182432", "")]
    #[case::trailing_slash("/nix/store/00bgd045z0d4icpbc2yyz4gx48ak44la-net-tools-1.60_p20170221182432/", "")]
    #[case::subpath("/nix/store/00bgd045z0d4icpbc2yyz4gx48ak44la-net-tools-1.60_p20170221182432/bin/arp", "bin/arp")]
    fn absolute_path_full(#[case] path: &str, #[case] rest: &str) {
        let (store_path, actual_rest) =
            StorePath::from_absolute_path_full(Path::new(STORE_DIR), Path::new(path))
                .expect("must parse");

        assert_eq!(EXAMPLE, store_path.to_string());
        assert_eq!(PathBuf::from(rest), actual_rest);
    }

    #[test]
    fn absolute_path_custom_store_dir() {
        let store_dir = Path::new("/tmp/some/store");
        let store_path = StorePath::from_bytes(EXAMPLE.as_bytes()).unwrap();

        let abs = store_path.to_absolute_path(store_dir);
        assert_eq!(Path::new("/tmp/some/store").join(EXAMPLE), abs);
        assert_eq!(
            store_path,
            StorePath::from_absolute_path(store_dir, &abs).expect("must parse")
        );

        // subpaths are not a direct child.
        assert_eq!(
            Error::InvalidLength(),
            StorePath::from_absolute_path(store_dir, &abs.join("bin")).expect_err("must fail")
        );
    }

    #[test]
    fn absolute_path_errors() {
        let store_dir = Path::new(STORE_DIR);
        assert_eq!(
            Error::InvalidLength(),
            StorePath::from_absolute_path_full(store_dir, Path::new("/nix/store/"))
                .expect_err("must fail")
        );
        assert_eq!(
            Error::InvalidLength(),
            StorePath::from_absolute_path_full(store_dir, Path::new("/nix/store/foo"))
                .expect_err("must fail")
        );
        assert!(matches!(
            StorePath::from_absolute_path_full(store_dir, Path::new(EXAMPLE)),
            Err(Error::MissingStoreDir(_, _))
        ));
    }

    #[test]
    fn serde_as_string() {
        let store_path = StorePath::from_bytes(EXAMPLE.as_bytes()).unwrap();
        let json = serde_json::to_string(&store_path).unwrap();

        assert_eq!(format!("\"{}\"", EXAMPLE), json);
        assert_eq!(store_path, serde_json::from_str::<StorePath>(&json).unwrap());
    }
}

//! Namespaced string ids like `hearth:water`.

use std::fmt;
use std::str::FromStr;

use crate::error::AssetError;

/// A validated `namespace:path` identifier. Ordering is lexicographic,
/// which is what gives indexed lookup tables their deterministic index
/// assignment.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ident(Box<str>);

impl Ident {
    pub fn new(s: impl Into<String>) -> Result<Self, AssetError> {
        let s = s.into();

        let valid = match s.split_once(':') {
            Some((namespace, path)) => {
                !namespace.is_empty() && !path.is_empty() && is_word(namespace) && is_word(path)
            }
            None => false,
        };

        if !valid {
            return Err(AssetError::InvalidIdent(s));
        }

        Ok(Self(s.into_boxed_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn namespace(&self) -> &str {
        self.0.split_once(':').map(|(ns, _)| ns).unwrap_or("")
    }

    pub fn path(&self) -> &str {
        self.0.split_once(':').map(|(_, path)| path).unwrap_or("")
    }
}

fn is_word(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '/' | '.'))
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ident({})", self.0)
    }
}

impl FromStr for Ident {
    type Err = AssetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

//! Requirement reference parsing.
//!
//! Requirements are written as `name/version` with an optional `@channel`
//! suffix, e.g. `zlib/1.2.11@stable`. The channel is informational routing
//! metadata; resolution matches on name and version.

use std::fmt;
use std::str::FromStr;

use semver::Version;
use serde::de::{self, Deserializer};
use serde::Deserialize;

use crate::error::{Error, Result};

/// A parsed `name/version[@channel]` requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipeReference {
    pub name: String,
    pub version: Version,
    pub channel: Option<String>,
}

impl RecipeReference {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
            channel: None,
        }
    }
}

impl FromStr for RecipeReference {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidReference {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let (base, channel) = match input.split_once('@') {
            Some((_, channel)) if channel.is_empty() => {
                return Err(invalid("empty channel after '@'"));
            }
            Some((base, channel)) => (base, Some(channel.to_string())),
            None => (input, None),
        };

        let (name, version) = base
            .split_once('/')
            .ok_or_else(|| invalid("expected 'name/version'"))?;

        if name.is_empty() {
            return Err(invalid("empty package name"));
        }
        if name
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(invalid("package name may only contain [A-Za-z0-9._-]"));
        }

        let version = Version::parse(version)
            .map_err(|e| invalid(&format!("bad version '{}': {}", version, e)))?;

        Ok(Self {
            name: name.to_string(),
            version,
            channel,
        })
    }
}

impl fmt::Display for RecipeReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)?;
        if let Some(channel) = &self.channel {
            write!(f, "@{}", channel)?;
        }
        Ok(())
    }
}

impl<'de> Deserialize<'de> for RecipeReference {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

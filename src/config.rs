use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use netlink_packet_conntrack::{AttributeKind, Family, FilterEntry, Table};
use serde::{Deserialize, Deserializer};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("read config {path:?} failed, {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parse config failed, {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid filter #{index}, {source}")]
    Filter {
        index: usize,
        source: netlink_packet_conntrack::Error,
    },
}

/// Defaults shared by every subcommand, flags given on the command line win.
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default, deserialize_with = "deserialize_from_str")]
    pub family: Family,

    #[serde(default, deserialize_with = "deserialize_from_str")]
    pub table: Table,

    /// Applied by `dump`, before any `--filter` flags.
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    #[serde(deserialize_with = "deserialize_from_str")]
    pub kind: AttributeKind,

    #[serde(deserialize_with = "deserialize_scalar")]
    pub value: String,

    #[serde(default, deserialize_with = "deserialize_optional_scalar")]
    pub mask: Option<String>,

    #[serde(default)]
    pub negate: bool,
}

impl FilterConfig {
    pub fn build(&self) -> Result<FilterEntry, netlink_packet_conntrack::Error> {
        let entry = FilterEntry::parse(self.kind, &self.value, self.mask.as_deref(), self.negate)?;
        entry.validate()?;

        Ok(entry)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path).map_err(|source| Error::Read {
            path: path.to_path_buf(),
            source,
        })?;

        content.parse()
    }

    /// Convert and validate every configured filter.
    pub fn filters(&self) -> Result<Vec<FilterEntry>, Error> {
        self.filters
            .iter()
            .enumerate()
            .map(|(index, filter)| filter.build().map_err(|source| Error::Filter { index, source }))
            .collect()
    }
}

impl FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = serde_yaml::from_str(s)?;

        // surface bad filters at load time rather than on first use
        config.filters()?;

        Ok(config)
    }
}

fn deserialize_from_str<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
}

/// Accept `6` as well as `"6"`, YAML users rarely quote numbers.
fn deserialize_scalar<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match serde_yaml::Value::deserialize(deserializer)? {
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expect a string or number, got {other:?}"
        ))),
    }
}

fn deserialize_optional_scalar<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    deserialize_scalar(deserializer).map(Some)
}

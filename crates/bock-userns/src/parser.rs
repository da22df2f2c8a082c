//! Parsing of the `--userns`, `--uidmap`/`--gidmap` and `--user` grammar.
//!
//! ```text
//! auto[:size=N][,uidmapping=C:H:S]*[,gidmapping=C:H:S]*
//! keep-id[:uid=U][,gid=G]
//! container:<name-or-id>
//! host | private
//! C:H:S[,C:H:S]*          (--uidmap / --gidmap values)
//! ```
//!
//! Scalar modifiers given more than once keep the last value; repeated
//! `uidmapping`/`gidmapping` modifiers accumulate in order.

use std::fmt;
use std::str::FromStr;

use bock_common::{BockError, BockResult};
use serde::{Deserialize, Serialize};

use crate::idmap::{IdMapEntry, parse_id};

/// Modifiers of `--userns=auto`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoOptions {
    /// Requested range length (`size=`).
    pub size: Option<u32>,
    /// Custom UID entries placed before the filler (`uidmapping=`).
    pub uid_mapping: Vec<IdMapEntry>,
    /// Custom GID entries placed before the filler (`gidmapping=`).
    pub gid_mapping: Vec<IdMapEntry>,
}

/// Modifiers of `--userns=keep-id`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepIdOptions {
    /// Container UID at which the invoking user appears (`uid=`).
    pub uid: Option<u32>,
    /// Container GID at which the invoking group appears (`gid=`).
    pub gid: Option<u32>,
}

/// Mapping assembled from the legacy per-map options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplicitMaps {
    /// `--uidmap` entries.
    pub uid_map: Vec<IdMapEntry>,
    /// `--gidmap` entries.
    pub gid_map: Vec<IdMapEntry>,
    /// `--subuidname` principal.
    pub sub_uid_name: Option<String>,
    /// `--subgidname` principal.
    pub sub_gid_name: Option<String>,
}

impl ExplicitMaps {
    /// Whether none of the legacy options were given.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.uid_map.is_empty()
            && self.gid_map.is_empty()
            && self.sub_uid_name.is_none()
            && self.sub_gid_name.is_none()
    }
}

/// What kind of user namespace a container asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum MappingRequest {
    /// A fresh range carved from the subordinate pool.
    Auto(AutoOptions),
    /// The invoking user keeps its identity inside the container.
    KeepId(KeepIdOptions),
    /// Join the user namespace of another container.
    Container {
        /// Name or ID of the target container.
        target: String,
    },
    /// Stay in the host user namespace.
    Host,
    /// A private namespace with the engine's default layout.
    Private,
    /// A private namespace built from `--uidmap`/`--gidmap`/`--sub*idname`.
    Explicit(ExplicitMaps),
}

impl MappingRequest {
    /// Short name of the mode, as written on the command line.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Auto(_) => "auto",
            Self::KeepId(_) => "keep-id",
            Self::Container { .. } => "container",
            Self::Host => "host",
            Self::Private => "private",
            Self::Explicit(_) => "explicit",
        }
    }
}

impl fmt::Display for MappingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Container { target } => write!(f, "container:{target}"),
            other => f.write_str(other.name()),
        }
    }
}

impl FromStr for MappingRequest {
    type Err = BockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_userns(s)
    }
}

/// Parse a `--userns` value.
///
/// # Errors
///
/// [`BockError::InvalidSyntax`] naming the offending token.
pub fn parse_userns(raw: &str) -> BockResult<MappingRequest> {
    let (mode, options) = match raw.split_once(':') {
        Some((mode, options)) => (mode, Some(options)),
        None => (raw, None),
    };

    match (mode, options) {
        ("" | "private", None) => Ok(MappingRequest::Private),
        ("host", None) => Ok(MappingRequest::Host),
        ("auto", options) => parse_auto(options.unwrap_or_default()).map(MappingRequest::Auto),
        ("keep-id", options) => {
            parse_keep_id(options.unwrap_or_default()).map(MappingRequest::KeepId)
        }
        ("container", Some(target)) if !target.is_empty() => Ok(MappingRequest::Container {
            target: target.to_string(),
        }),
        ("container", _) => Err(BockError::syntax(raw, "container mode needs a name or ID")),
        ("host" | "private", Some(_)) => {
            Err(BockError::syntax(raw, format!("{mode} takes no options")))
        }
        _ => Err(BockError::syntax(raw, "unknown user namespace mode")),
    }
}

/// Split `key=value,key=value` into pairs, rejecting empty or bare tokens.
fn options(raw: &str) -> impl Iterator<Item = BockResult<(&str, &str, &str)>> {
    raw.split(',')
        .filter(move |_| !raw.is_empty())
        .map(|token| match token.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((token, key, value)),
            _ => Err(BockError::syntax(token, "expected key=value")),
        })
}

fn parse_auto(raw: &str) -> BockResult<AutoOptions> {
    let mut opts = AutoOptions::default();

    for option in options(raw) {
        let (token, key, value) = option?;
        match key {
            "size" => {
                let size = parse_id(token, value)?;
                if size == 0 {
                    return Err(BockError::syntax(token, "size must be at least 1"));
                }
                opts.size = Some(size);
            }
            "uidmapping" => opts.uid_mapping.push(parse_triple(token, value)?),
            "gidmapping" => opts.gid_mapping.push(parse_triple(token, value)?),
            _ => return Err(BockError::syntax(token, "unknown option for auto")),
        }
    }

    Ok(opts)
}

fn parse_keep_id(raw: &str) -> BockResult<KeepIdOptions> {
    let mut opts = KeepIdOptions::default();

    for option in options(raw) {
        let (token, key, value) = option?;
        match key {
            "uid" => opts.uid = Some(parse_id(token, value)?),
            "gid" => opts.gid = Some(parse_id(token, value)?),
            _ => return Err(BockError::syntax(token, "unknown option for keep-id")),
        }
    }

    Ok(opts)
}

fn parse_triple(token: &str, value: &str) -> BockResult<IdMapEntry> {
    value.parse().map_err(|err| match err {
        BockError::InvalidSyntax { reason, .. } => BockError::syntax(token, reason),
        other => other,
    })
}

/// Parse repeated `--uidmap`/`--gidmap` values; each may hold several
/// comma-separated triples.
///
/// # Errors
///
/// [`BockError::InvalidSyntax`] for the first malformed triple.
pub fn parse_id_maps<S: AsRef<str>>(values: &[S]) -> BockResult<Vec<IdMapEntry>> {
    values
        .iter()
        .flat_map(|value| value.as_ref().split(','))
        .map(str::parse)
        .collect()
}

/// A parsed `--user=<uid>[:<gid>]` value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserSpec {
    /// Numeric UID, if the user part is numeric.
    pub uid: Option<u32>,
    /// Numeric GID, if a numeric group part was given.
    pub gid: Option<u32>,
}

impl UserSpec {
    /// Highest numeric ID referenced, if any.
    #[must_use]
    pub fn highest_id(&self) -> Option<u32> {
        self.uid.max(self.gid)
    }
}

impl FromStr for UserSpec {
    type Err = BockError;

    /// Names are accepted but only numeric parts are recorded.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (user, group) = match s.split_once(':') {
            Some((user, group)) => (user, Some(group)),
            None => (s, None),
        };
        if user.is_empty() || group.is_some_and(str::is_empty) {
            return Err(BockError::syntax(s, "expected <user>[:<group>]"));
        }

        let numeric = |part: &str| -> BockResult<Option<u32>> {
            if part.bytes().all(|b| b.is_ascii_digit()) {
                parse_id(s, part).map(Some)
            } else {
                Ok(None)
            }
        };

        Ok(Self {
            uid: numeric(user)?,
            gid: group.map(numeric).transpose()?.flatten(),
        })
    }
}

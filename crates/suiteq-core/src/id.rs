//! Build and worker identifiers.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;

/// Identifier shared by every worker and reporter taking part in one build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct BuildId(String);

impl BuildId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for BuildId {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        validate("build", s).map(Self::new)
    }
}

/// Identifier of one worker. Workers in the same build must use distinct ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random worker id, for workers started without one.
    pub fn generate() -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        Self(format!("worker-{}", &uuid[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for WorkerId {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        validate("worker", s).map(Self::new)
    }
}

// Ids become part of store keys, so they must not be empty or contain the
// key separator.
fn validate<'a>(kind: &str, s: &'a str) -> std::result::Result<&'a str, Error> {
    if s.is_empty() {
        return Err(Error::InvalidInput(format!("{kind} id must not be empty")));
    }
    if s.contains(':') || s.chars().any(char::is_whitespace) {
        return Err(Error::InvalidInput(format!(
            "{kind} id '{s}' must not contain ':' or whitespace"
        )));
    }
    Ok(s)
}

//! Version labels for approved manuals.
//!
//! Labels are `major.minor`. The first approval in a lineage is `1.0`;
//! each later approval bumps the minor component (`1.6` → `1.7`).
//! Ordering is numeric, so `1.10` sorts after `1.9`.

use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::error::ManualError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionLabel {
    pub major: u32,
    pub minor: u32,
}

impl VersionLabel {
    pub const INITIAL: VersionLabel = VersionLabel { major: 1, minor: 0 };

    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// The label that follows this one. A stored minor of `u32::MAX` has
    /// no successor and is reported as a storage fault.
    pub fn next(self) -> Result<Self, ManualError> {
        let minor = self.minor.checked_add(1).ok_or_else(|| {
            ManualError::Storage(anyhow!("version lineage exhausted at {}", self))
        })?;
        Ok(Self {
            major: self.major,
            minor,
        })
    }

    /// The label to assign given the latest recorded label, if any.
    pub fn following(previous: Option<VersionLabel>) -> Result<Self, ManualError> {
        previous.map_or(Ok(Self::INITIAL), VersionLabel::next)
    }
}

impl fmt::Display for VersionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for VersionLabel {
    type Err = ManualError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ManualError::validation(format!("invalid version label: '{}'", s));
        let (major, minor) = s.trim().split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

impl TryFrom<String> for VersionLabel {
    type Error = ManualError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VersionLabel> for String {
    fn from(label: VersionLabel) -> Self {
        label.to_string()
    }
}

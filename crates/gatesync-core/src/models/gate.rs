//! Gate kinds

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ParseEnumError;

/// Kind of gate a node is mounted at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateKind {
    /// Common entrance; exits are refused.
    #[serde(rename = "Common_IN")]
    CommonIn,
    /// Common exit; entries are refused.
    #[serde(rename = "Common_Out")]
    CommonOut,
    /// VIP holders only.
    #[serde(rename = "VIP")]
    Vip,
    /// Backstage holders only.
    Backstage,
}

impl GateKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CommonIn => "Common_IN",
            Self::CommonOut => "Common_Out",
            Self::Vip => "VIP",
            Self::Backstage => "Backstage",
        }
    }
}

impl fmt::Display for GateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GateKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "common_in" => Ok(Self::CommonIn),
            "common_out" => Ok(Self::CommonOut),
            "vip" => Ok(Self::Vip),
            "backstage" => Ok(Self::Backstage),
            _ => Err(ParseEnumError::new("gate kind", s)),
        }
    }
}

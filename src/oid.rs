use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when a dotted OID string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid OID `{input}`: {reason}")]
pub struct OidParseError {
    pub input: String,
    pub reason: String,
}

/// A numeric SNMP object identifier, e.g. `1.3.6.1.2.1.1.3.0`.
///
/// Parsing accepts a leading dot and the `iso.` prefix printed by some
/// tools (`iso.3.6.1...` is `1.3.6.1...`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Oid(Vec<u32>);

impl Oid {
    pub fn from_arcs(arcs: impl Into<Vec<u32>>) -> Self {
        Self(arcs.into())
    }

    pub fn arcs(&self) -> &[u32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> Option<u32> {
        self.0.last().copied()
    }

    /// Append a single arc, e.g. an ifIndex instance suffix.
    pub fn child(&self, arc: u32) -> Oid {
        let mut arcs = self.0.clone();
        arcs.push(arc);
        Oid(arcs)
    }

    pub fn join(&self, suffix: &[u32]) -> Oid {
        let mut arcs = self.0.clone();
        arcs.extend_from_slice(suffix);
        Oid(arcs)
    }

    pub fn starts_with(&self, prefix: &Oid) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Arcs following `prefix`, or `None` when `self` is not below it.
    pub fn suffix_after(&self, prefix: &Oid) -> Option<&[u32]> {
        if self.starts_with(prefix) {
            Some(&self.0[prefix.0.len()..])
        } else {
            None
        }
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for arc in &self.0 {
            if !first {
                f.write_str(".")?;
            }
            write!(f, "{arc}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for Oid {
    type Err = OidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason: &str| OidParseError {
            input: s.to_string(),
            reason: reason.to_string(),
        };
        let trimmed = s.trim().trim_start_matches('.');
        if trimmed.is_empty() {
            return Err(err("empty"));
        }
        let mut arcs = Vec::new();
        for (i, part) in trimmed.split('.').enumerate() {
            if i == 0 && part.eq_ignore_ascii_case("iso") {
                arcs.push(1);
                continue;
            }
            let arc = part
                .parse::<u32>()
                .map_err(|_| err(&format!("arc {} is not numeric: `{part}`", i + 1)))?;
            arcs.push(arc);
        }
        Ok(Oid(arcs))
    }
}

impl TryFrom<String> for Oid {
    type Error = OidParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Oid> for String {
    fn from(oid: Oid) -> Self {
        oid.to_string()
    }
}

/// Well-known MIB-II and ENTITY-MIB objects used by the poller.
pub mod known {
    use super::Oid;

    fn oid(arcs: &[u32]) -> Oid {
        Oid::from_arcs(arcs.to_vec())
    }

    pub fn sys_descr() -> Oid {
        oid(&[1, 3, 6, 1, 2, 1, 1, 1, 0])
    }

    pub fn sys_object_id() -> Oid {
        oid(&[1, 3, 6, 1, 2, 1, 1, 2, 0])
    }

    pub fn sys_uptime() -> Oid {
        oid(&[1, 3, 6, 1, 2, 1, 1, 3, 0])
    }

    pub fn sys_name() -> Oid {
        oid(&[1, 3, 6, 1, 2, 1, 1, 5, 0])
    }

    /// `IF-MIB::ifIndex`, the column whose instances name interfaces.
    pub fn if_index() -> Oid {
        oid(&[1, 3, 6, 1, 2, 1, 2, 2, 1, 1])
    }

    pub fn if_descr() -> Oid {
        oid(&[1, 3, 6, 1, 2, 1, 2, 2, 1, 2])
    }

    pub fn if_type() -> Oid {
        oid(&[1, 3, 6, 1, 2, 1, 2, 2, 1, 3])
    }

    pub fn if_speed() -> Oid {
        oid(&[1, 3, 6, 1, 2, 1, 2, 2, 1, 5])
    }

    pub fn if_admin_status() -> Oid {
        oid(&[1, 3, 6, 1, 2, 1, 2, 2, 1, 7])
    }

    pub fn if_oper_status() -> Oid {
        oid(&[1, 3, 6, 1, 2, 1, 2, 2, 1, 8])
    }

    pub fn if_name() -> Oid {
        oid(&[1, 3, 6, 1, 2, 1, 31, 1, 1, 1, 1])
    }

    pub fn if_high_speed() -> Oid {
        oid(&[1, 3, 6, 1, 2, 1, 31, 1, 1, 1, 15])
    }

    pub fn if_alias() -> Oid {
        oid(&[1, 3, 6, 1, 2, 1, 31, 1, 1, 1, 18])
    }

    pub fn ent_physical_name() -> Oid {
        oid(&[1, 3, 6, 1, 2, 1, 47, 1, 1, 1, 1, 7])
    }

    pub fn ent_physical_class() -> Oid {
        oid(&[1, 3, 6, 1, 2, 1, 47, 1, 1, 1, 1, 5])
    }

    pub fn ent_alias_mapping_identifier() -> Oid {
        oid(&[1, 3, 6, 1, 2, 1, 47, 1, 3, 2, 1, 2])
    }

    pub fn ent_phy_sensor_scale() -> Oid {
        oid(&[1, 3, 6, 1, 2, 1, 99, 1, 1, 1, 2])
    }

    pub fn ent_phy_sensor_precision() -> Oid {
        oid(&[1, 3, 6, 1, 2, 1, 99, 1, 1, 1, 3])
    }

    pub fn ent_phy_sensor_value() -> Oid {
        oid(&[1, 3, 6, 1, 2, 1, 99, 1, 1, 1, 4])
    }
}

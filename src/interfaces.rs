//! IF-MIB interface table, virtual-interface filtering, optical port
//! autodetection and the ifIndex to entPhysicalIndex map.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::oid::{known, Oid};
use crate::probe::{RawValue, VarBind};
use crate::types::Measured;
use crate::vendor::CompiledProfile;

/// IANA ifTypes that are never physical ports.
const VIRTUAL_IFTYPES: [i64; 6] = [24, 53, 131, 135, 136, 161];
/// IANA ifTypes that are fibre by definition.
const OPTICAL_IFTYPES: [i64; 7] = [32, 62, 69, 117, 127, 129, 180];
const ETHERNET_CSMACD: i64 = 6;
/// `PhysicalClass` value `port(10)`.
const ENT_CLASS_PORT: i64 = 10;

const OPTICAL_HINTS: [&str; 6] = ["sfp", "xfp", "qsfp", "fiber", "fibre", "optic"];
const COPPER_HINTS: [&str; 3] = ["copper", "utp", "rj45"];

fn virtual_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^(?:loopback|lo\d*$|inloopback|vlan|vl\d+|vlanif|bridge|br\d+|tunnel|tun\d+|ppp|mpls|virtual|cpu|null|stack|port-?channel|eth-trunk|bond|lag|ae\d+|po\d+)",
        )
        .expect("virtual interface regex")
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InterfaceRecord {
    pub if_index: u32,
    pub descr: Option<String>,
    pub name: Option<String>,
    pub alias: Option<String>,
    pub if_type: Option<i64>,
    pub speed_mbps: Option<u64>,
    pub admin_up: Option<bool>,
    pub oper_up: Option<bool>,
}

impl InterfaceRecord {
    /// ifName, falling back to ifDescr.
    pub fn label(&self) -> &str {
        self.name
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.descr.as_deref())
            .unwrap_or("")
    }

    pub fn is_virtual(&self, profile: Option<&CompiledProfile>) -> bool {
        if self.if_type.is_some_and(|t| VIRTUAL_IFTYPES.contains(&t)) {
            return true;
        }
        let re = virtual_name_re();
        let names = [self.name.as_deref(), self.descr.as_deref()];
        names.iter().flatten().any(|n| {
            let n = n.trim();
            re.is_match(n) || profile.is_some_and(|p| p.is_excluded(n))
        })
    }

    /// Fibre ifType, or an Ethernet port that looks pluggable.
    pub fn is_optical_candidate(&self) -> bool {
        match self.if_type {
            Some(t) if OPTICAL_IFTYPES.contains(&t) => true,
            Some(ETHERNET_CSMACD) | None => {
                let label = format!(
                    "{} {}",
                    self.name.as_deref().unwrap_or(""),
                    self.descr.as_deref().unwrap_or("")
                )
                .to_lowercase();
                if COPPER_HINTS.iter().any(|h| label.contains(h)) {
                    return false;
                }
                OPTICAL_HINTS.iter().any(|h| label.contains(h))
                    || self.speed_mbps.is_some_and(|s| s >= 1000)
            }
            Some(_) => false,
        }
    }
}

fn status_up(v: &RawValue) -> Option<bool> {
    match v.as_i64()? {
        1 => Some(true),
        2..=7 => Some(false),
        _ => None,
    }
}

fn text(v: &RawValue) -> Option<String> {
    match crate::normalize::text(v) {
        Measured::Value(s) => Some(s),
        Measured::Unknown => None,
    }
}

/// Merge IF-MIB column walks (keyed by column base OID) into records
/// ordered by ifIndex. Rows whose instance is not a single ifIndex arc are
/// ignored.
pub fn build_interfaces(walks: &[(Oid, Vec<VarBind>)]) -> Vec<InterfaceRecord> {
    let mut table: BTreeMap<u32, InterfaceRecord> = BTreeMap::new();
    let mut low_speed: HashMap<u32, u64> = HashMap::new();

    for (column, rows) in walks {
        for vb in rows {
            let Some(&[if_index]) = vb.oid.suffix_after(column) else {
                continue;
            };
            let rec = table.entry(if_index).or_insert_with(|| InterfaceRecord {
                if_index,
                ..Default::default()
            });
            let v = &vb.value;
            if *column == known::if_descr() {
                rec.descr = text(v);
            } else if *column == known::if_name() {
                rec.name = text(v);
            } else if *column == known::if_alias() {
                rec.alias = text(v);
            } else if *column == known::if_type() {
                rec.if_type = v.as_i64();
            } else if *column == known::if_admin_status() {
                rec.admin_up = status_up(v);
            } else if *column == known::if_oper_status() {
                rec.oper_up = status_up(v);
            } else if *column == known::if_high_speed() {
                rec.speed_mbps = v.as_i64().filter(|s| *s > 0).map(|s| s as u64);
            } else if *column == known::if_speed() {
                if let Some(bps) = v.as_i64().filter(|s| *s > 0) {
                    low_speed.insert(if_index, bps as u64 / 1_000_000);
                }
            }
        }
    }

    for (if_index, mbps) in low_speed {
        if let Some(rec) = table.get_mut(&if_index) {
            if rec.speed_mbps.is_none() {
                rec.speed_mbps = Some(mbps);
            }
        }
    }
    table.into_values().collect()
}

/// Physical, optical-looking interfaces in ifIndex order.
pub fn optical_candidates<'a>(
    interfaces: &'a [InterfaceRecord],
    profile: Option<&CompiledProfile>,
) -> Vec<&'a InterfaceRecord> {
    interfaces
        .iter()
        .filter(|i| !i.is_virtual(profile) && i.is_optical_candidate())
        .collect()
}

/// ifIndex to entPhysicalIndex from an `entAliasMappingIdentifier` walk.
/// Row instances are `{entPhysicalIndex}.{logicalIndex}` and values point at
/// `ifIndex.N`.
pub fn entity_map_from_alias(rows: &[VarBind]) -> HashMap<u32, u32> {
    let base = known::ent_alias_mapping_identifier();
    let if_index = known::if_index();
    let mut map = HashMap::new();
    for vb in rows {
        let Some(&[ent_index, ..]) = vb.oid.suffix_after(&base) else {
            continue;
        };
        if let RawValue::ObjectId(target) = &vb.value {
            if let Some(&[idx]) = target.suffix_after(&if_index) {
                map.entry(idx).or_insert(ent_index);
            }
        }
    }
    map
}

/// Fallback map: match `entPhysicalName` of `port(10)` entities against
/// interface names (equal, or one containing the other).
pub fn entity_map_by_name(
    interfaces: &[InterfaceRecord],
    names: &[VarBind],
    classes: &[VarBind],
) -> HashMap<u32, u32> {
    let class_base = known::ent_physical_class();
    let name_base = known::ent_physical_name();

    let ports: std::collections::HashSet<u32> = classes
        .iter()
        .filter(|vb| vb.value.as_i64() == Some(ENT_CLASS_PORT))
        .filter_map(|vb| match vb.oid.suffix_after(&class_base) {
            Some(&[idx]) => Some(idx),
            _ => None,
        })
        .collect();
    let entities: Vec<(u32, String)> = names
        .iter()
        .filter_map(|vb| match vb.oid.suffix_after(&name_base) {
            Some(&[idx]) if ports.contains(&idx) => Some((idx, text(&vb.value)?)),
            _ => None,
        })
        .collect();

    let mut map = HashMap::new();
    for rec in interfaces {
        let label = rec.label();
        if label.is_empty() {
            continue;
        }
        let exact = entities.iter().find(|(_, n)| n == label);
        let hit = exact.or_else(|| {
            entities
                .iter()
                .find(|(_, n)| n.contains(label) || label.contains(n.as_str()))
        });
        if let Some((idx, _)) = hit {
            map.insert(rec.if_index, *idx);
        }
    }
    map
}

/// Whether the interface label matches the profile's uplink pattern.
pub fn is_uplink(profile: Option<&CompiledProfile>, rec: &InterfaceRecord) -> bool {
    profile.is_some_and(|p| p.is_uplink(rec.label()))
}

//! Vendor profiles: how to recognise a vendor and where its optical
//! readings live.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::normalize::PowerEncoding;
use crate::oid::{Oid, OidParseError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Identity,
    Uptime,
    OpticalRx,
    OpticalTx,
    SfpVendor,
    SfpPartNumber,
    SfpSerial,
    Temperature,
    Voltage,
}

impl Capability {
    /// Per-port DDM capabilities, in read order.
    pub const OPTICAL: [Capability; 7] = [
        Capability::OpticalRx,
        Capability::OpticalTx,
        Capability::SfpVendor,
        Capability::SfpPartNumber,
        Capability::SfpSerial,
        Capability::Temperature,
        Capability::Voltage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Identity => "identity",
            Capability::Uptime => "uptime",
            Capability::OpticalRx => "optical_rx",
            Capability::OpticalTx => "optical_tx",
            Capability::SfpVendor => "sfp_vendor",
            Capability::SfpPartNumber => "sfp_part_number",
            Capability::SfpSerial => "sfp_serial",
            Capability::Temperature => "temperature",
            Capability::Voltage => "voltage",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an OID comes from. Written in YAML as either a dotted OID or
/// `MODULE::object`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OidSource {
    Static(Oid),
    MibDerived { module: String, object: String },
}

impl OidSource {
    pub fn mib(module: &str, object: &str) -> Self {
        OidSource::MibDerived {
            module: module.to_string(),
            object: object.to_string(),
        }
    }
}

impl TryFrom<String> for OidSource {
    type Error = OidParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.split_once("::") {
            Some((module, object)) if !module.is_empty() && !object.is_empty() => {
                Ok(OidSource::mib(module.trim(), object.trim()))
            }
            _ => Ok(OidSource::Static(value.parse()?)),
        }
    }
}

impl From<OidSource> for String {
    fn from(src: OidSource) -> Self {
        match src {
            OidSource::Static(oid) => oid.to_string(),
            OidSource::MibDerived { module, object } => format!("{module}::{object}"),
        }
    }
}

/// How the per-port instance suffix of a DDM column is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    #[default]
    IfIndex,
    EntPhysicalIndex,
}

/// Model-specific overrides of a vendor profile.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelOverride {
    #[serde(default)]
    pub capabilities: BTreeMap<Capability, Vec<OidSource>>,
    #[serde(default)]
    pub power_encoding: Option<PowerEncoding>,
    #[serde(default)]
    pub ddm_index: Option<IndexKind>,
    /// When set, the capability OIDs are complete instances that belong to
    /// this ifIndex (fixed uplink SFP slot).
    #[serde(default)]
    pub port: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorProfile {
    pub name: String,
    #[serde(default)]
    pub enterprise_prefixes: Vec<Oid>,
    #[serde(default)]
    pub descr_keywords: Vec<String>,
    /// Regexes over sysDescr; first capture group (or whole match) is the model.
    #[serde(default)]
    pub model_patterns: Vec<String>,
    #[serde(default)]
    pub capabilities: BTreeMap<Capability, Vec<OidSource>>,
    #[serde(default)]
    pub models: BTreeMap<String, ModelOverride>,
    #[serde(default)]
    pub ddm_index: IndexKind,
    #[serde(default = "default_encoding")]
    pub power_encoding: PowerEncoding,
    /// Raw values meaning "no transceiver", on top of the generic ones.
    #[serde(default)]
    pub sentinels: Vec<i64>,
    #[serde(default)]
    pub uplink_pattern: Option<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    /// Multiplier from the raw DDM temperature to degrees Celsius. When
    /// unset it follows the power encoding's family.
    #[serde(default)]
    pub temperature_scale: Option<f64>,
    /// Multiplier from the raw DDM supply voltage to volts.
    #[serde(default)]
    pub voltage_scale: Option<f64>,
}

fn default_encoding() -> PowerEncoding {
    PowerEncoding::Dbm
}

impl VendorProfile {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            enterprise_prefixes: Vec::new(),
            descr_keywords: Vec::new(),
            model_patterns: Vec::new(),
            capabilities: BTreeMap::new(),
            models: BTreeMap::new(),
            ddm_index: IndexKind::IfIndex,
            power_encoding: PowerEncoding::Dbm,
            sentinels: Vec::new(),
            uplink_pattern: None,
            exclude_patterns: Vec::new(),
            temperature_scale: None,
            voltage_scale: None,
        }
    }

    /// Model override for `model`: exact (case-insensitive) key first, then
    /// the longest key that prefixes the model, e.g. `MES2428` for `MES2428B`.
    pub fn model_override(&self, model: &str) -> Option<(&str, &ModelOverride)> {
        let wanted = model.to_ascii_uppercase();
        if let Some((k, v)) = self.models.iter().find(|(k, _)| k.to_ascii_uppercase() == wanted) {
            return Some((k.as_str(), v));
        }
        self.models
            .iter()
            .filter(|(k, _)| wanted.starts_with(&k.to_ascii_uppercase()))
            .max_by_key(|(k, _)| k.len())
            .map(|(k, v)| (k.as_str(), v))
    }
}

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("profile `{profile}`: invalid regex `{pattern}`: {source}")]
    Regex {
        profile: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("profile with an empty name")]
    EmptyName,
}

/// A profile with its patterns compiled.
#[derive(Debug, Clone)]
pub struct CompiledProfile {
    pub profile: VendorProfile,
    keywords: Vec<String>,
    models: Vec<Regex>,
    uplink: Option<Regex>,
    exclude: Vec<Regex>,
}

fn compile(profile: &str, pattern: &str) -> Result<Regex, ProfileError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|source| ProfileError::Regex {
            profile: profile.to_string(),
            pattern: pattern.to_string(),
            source,
        })
}

impl CompiledProfile {
    pub fn new(profile: VendorProfile) -> Result<Self, ProfileError> {
        if profile.name.trim().is_empty() {
            return Err(ProfileError::EmptyName);
        }
        let models = profile
            .model_patterns
            .iter()
            .map(|p| compile(&profile.name, p))
            .collect::<Result<Vec<_>, _>>()?;
        let exclude = profile
            .exclude_patterns
            .iter()
            .map(|p| compile(&profile.name, p))
            .collect::<Result<Vec<_>, _>>()?;
        let uplink = profile
            .uplink_pattern
            .as_deref()
            .map(|p| compile(&profile.name, p))
            .transpose()?;
        let keywords = profile
            .descr_keywords
            .iter()
            .map(|k| k.to_lowercase())
            .collect();
        Ok(Self {
            profile,
            keywords,
            models,
            uplink,
            exclude,
        })
    }

    pub fn name(&self) -> &str {
        &self.profile.name
    }

    pub fn extract_model(&self, sys_descr: &str) -> Option<String> {
        self.models.iter().find_map(|re| {
            let caps = re.captures(sys_descr)?;
            let m = caps.get(1).or_else(|| caps.get(0))?;
            let s = m.as_str().trim();
            (!s.is_empty()).then(|| s.to_string())
        })
    }

    pub fn is_uplink(&self, name: &str) -> bool {
        self.uplink.as_ref().is_some_and(|re| re.is_match(name))
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        self.exclude.iter().any(|re| re.is_match(name))
    }

    fn keyword_match(&self, descr_lower: &str) -> bool {
        self.keywords.iter().any(|k| descr_lower.contains(k.as_str()))
    }
}

/// Vendor and model recognised from system identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identified {
    pub vendor: String,
    pub model: Option<String>,
}

/// Flat vendor lookup table, shared read-only for a cycle.
#[derive(Debug, Clone)]
pub struct ProfileTable {
    profiles: Vec<CompiledProfile>,
}

#[derive(Debug, Deserialize)]
struct ProfileFile {
    profiles: Vec<VendorProfile>,
}

impl ProfileTable {
    pub fn new(profiles: Vec<VendorProfile>) -> Result<Self, ProfileError> {
        let profiles = profiles
            .into_iter()
            .map(CompiledProfile::new)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { profiles })
    }

    pub fn builtin() -> Self {
        let profiles = builtin_profiles()
            .into_iter()
            .filter_map(|p| match CompiledProfile::new(p) {
                Ok(c) => Some(c),
                Err(e) => {
                    tracing::error!(error = %e, "built-in profile rejected");
                    None
                }
            })
            .collect();
        Self { profiles }
    }

    /// Built-in profiles overlaid with the ones in a YAML file. A file
    /// profile replaces a built-in of the same name.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read profiles {}", path.display()))?;
        Self::builtin().merged_yaml(&text)
            .with_context(|| format!("invalid profiles file {}", path.display()))
    }

    pub fn merged_yaml(self, text: &str) -> Result<Self> {
        let file: ProfileFile = serde_yaml::from_str(text).context("failed to parse profiles YAML")?;
        let mut profiles = self.profiles;
        for p in file.profiles {
            let compiled = CompiledProfile::new(p)?;
            match profiles
                .iter_mut()
                .find(|c| c.name().eq_ignore_ascii_case(compiled.name()))
            {
                Some(slot) => *slot = compiled,
                None => profiles.push(compiled),
            }
        }
        Ok(Self { profiles })
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompiledProfile> {
        self.profiles.iter()
    }

    pub fn get(&self, vendor: &str) -> Option<&CompiledProfile> {
        self.profiles.iter().find(|p| p.name().eq_ignore_ascii_case(vendor))
    }

    /// Enterprise prefix (longest wins) first, then sysDescr keywords.
    pub fn identify(&self, sys_object_id: Option<&Oid>, sys_descr: Option<&str>) -> Option<Identified> {
        let by_prefix = sys_object_id.and_then(|oid| {
            self.profiles
                .iter()
                .filter_map(|p| {
                    p.profile
                        .enterprise_prefixes
                        .iter()
                        .filter(|prefix| oid.starts_with(prefix))
                        .map(|prefix| prefix.len())
                        .max()
                        .map(|len| (len, p))
                })
                .max_by_key(|(len, _)| *len)
                .map(|(_, p)| p)
        });
        let profile = by_prefix.or_else(|| {
            let lower = sys_descr?.to_lowercase();
            self.profiles.iter().find(|p| p.keyword_match(&lower))
        })?;
        let model = sys_descr.and_then(|d| profile.extract_model(d));
        Some(Identified {
            vendor: profile.name().to_string(),
            model,
        })
    }
}

fn enterprise(n: u32) -> Oid {
    Oid::from_arcs(vec![1, 3, 6, 1, 4, 1, n])
}

/// Static source from a dotted numeric literal.
fn oid(s: &str) -> OidSource {
    let arcs: Vec<u32> = s.split('.').filter_map(|a| a.parse().ok()).collect();
    OidSource::Static(Oid::from_arcs(arcs))
}

fn caps(entries: &[(Capability, Vec<OidSource>)]) -> BTreeMap<Capability, Vec<OidSource>> {
    entries.iter().cloned().collect()
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Fixed-slot override: tx, rx, vendor and optional part number instances.
fn fixed_port(port: u32, tx: &str, rx: &str, vendor: Option<&str>, part: Option<&str>) -> ModelOverride {
    let mut capabilities = BTreeMap::new();
    capabilities.insert(Capability::OpticalTx, vec![oid(tx)]);
    capabilities.insert(Capability::OpticalRx, vec![oid(rx)]);
    if let Some(v) = vendor {
        capabilities.insert(Capability::SfpVendor, vec![oid(v)]);
    }
    if let Some(p) = part {
        capabilities.insert(Capability::SfpPartNumber, vec![oid(p)]);
    }
    ModelOverride {
        capabilities,
        power_encoding: None,
        ddm_index: None,
        port: Some(port),
    }
}

fn eltex_port(port: u32) -> ModelOverride {
    let base = "1.3.6.1.4.1.35265.52.1.1.3";
    fixed_port(
        port,
        &format!("{base}.2.1.8.{port}.4.1"),
        &format!("{base}.2.1.8.{port}.5.1"),
        Some(&format!("{base}.1.1.5.{port}")),
        Some(&format!("{base}.1.1.10.{port}")),
    )
}

fn zyxel_mes_port(port: u32) -> ModelOverride {
    let base = "1.3.6.1.4.1.890.1.5.8.68.117";
    fixed_port(
        port,
        &format!("{base}.2.1.7.{port}.4"),
        &format!("{base}.2.1.7.{port}.5"),
        Some(&format!("{base}.1.1.3.{port}")),
        Some(&format!("{base}.1.1.4.{port}")),
    )
}

fn zyxel_gs_port(port: u32) -> ModelOverride {
    let base = "1.3.6.1.4.1.890.1.15.3.84.1";
    fixed_port(
        port,
        &format!("{base}.2.1.6.{port}.4"),
        &format!("{base}.2.1.6.{port}.5"),
        Some(&format!("{base}.1.1.2.{port}")),
        Some(&format!("{base}.1.1.3.{port}")),
    )
}

fn snr_port(port: u32) -> ModelOverride {
    let base = "1.3.6.1.4.1.40418.7.100.30.1.1";
    fixed_port(
        port,
        &format!("{base}.22.{port}"),
        &format!("{base}.17.{port}"),
        None,
        None,
    )
}

fn tplink_port(port: u32) -> ModelOverride {
    let base = "1.3.6.1.4.1.11863.6.96.1.7.1.1";
    fixed_port(port, &format!("{base}.5.{port}"), &format!("{base}.6.{port}"), None, None)
}

fn huawei_s3328_port() -> ModelOverride {
    let base = "1.3.6.1.4.1.2011.5.25.31.1.1.3.1";
    fixed_port(25, &format!("{base}.9.67240014"), &format!("{base}.8.67240014"), None, None)
}

fn microwatt(mut o: ModelOverride) -> ModelOverride {
    o.power_encoding = Some(PowerEncoding::MicroWatt);
    o
}

const COMMON_UPLINK: &str = r"^(te|xe|xg|tengig|tengigabitethernet|hundredgig|fortygig|25ge|40ge|100ge)";

fn builtin_profiles() -> Vec<VendorProfile> {
    use Capability::*;

    let mut cisco = VendorProfile::new("Cisco");
    cisco.enterprise_prefixes = vec![enterprise(9)];
    cisco.descr_keywords = strings(&["cisco"]);
    cisco.model_patterns = strings(&[r"\b(WS-C\d{4}[\w-]*)", r"\b(C\d{4}[\w-]*)", r"\b(N\dK-[\w-]+)"]);
    cisco.capabilities = caps(&[
        (OpticalRx, vec![oid("1.3.6.1.4.1.9.9.92.1.1.1.1.5")]),
        (OpticalTx, vec![oid("1.3.6.1.4.1.9.9.92.1.1.1.1.4")]),
        (Temperature, vec![oid("1.3.6.1.4.1.9.9.92.1.1.1.1.3")]),
        (Voltage, vec![oid("1.3.6.1.4.1.9.9.92.1.1.1.1.6")]),
    ]);
    cisco.ddm_index = IndexKind::EntPhysicalIndex;
    cisco.power_encoding = PowerEncoding::DeciDbm;
    cisco.uplink_pattern = Some(r"^(te|tengigabitethernet|fo|fortygig|hu|hundredgig|twe)".to_string());
    cisco.exclude_patterns = strings(&[r"^nu(ll)?\d", r"^stackport"]);

    let mut huawei = VendorProfile::new("Huawei");
    huawei.enterprise_prefixes = vec![enterprise(2011)];
    huawei.descr_keywords = strings(&["huawei", "quidway"]);
    huawei.model_patterns = strings(&[r"\b(S\d{4}[A-Z0-9-]*)", r"\b(CE\d{4,5}[A-Z0-9-]*)"]);
    huawei.capabilities = caps(&[
        (
            OpticalRx,
            vec![
                OidSource::mib("HUAWEI-ENTITY-EXTENT-MIB", "hwEntityOpticalRxPower"),
                oid("1.3.6.1.4.1.2011.5.25.31.1.1.3.1.8"),
            ],
        ),
        (
            OpticalTx,
            vec![
                OidSource::mib("HUAWEI-ENTITY-EXTENT-MIB", "hwEntityOpticalTxPower"),
                oid("1.3.6.1.4.1.2011.5.25.31.1.1.3.1.9"),
            ],
        ),
        (Temperature, vec![oid("1.3.6.1.4.1.2011.5.25.31.1.1.3.1.5")]),
        (Voltage, vec![oid("1.3.6.1.4.1.2011.5.25.31.1.1.3.1.6")]),
    ]);
    huawei.ddm_index = IndexKind::EntPhysicalIndex;
    huawei.power_encoding = PowerEncoding::MicroWatt;
    huawei.uplink_pattern = Some(r"^(xgigabitethernet|xge|40ge|100ge|25ge)".to_string());
    huawei.exclude_patterns = strings(&[r"^meth", r"^inloopback", r"^null"]);
    huawei.temperature_scale = Some(1.0);
    huawei.voltage_scale = Some(0.001);
    // S3328TP exposes its GE uplink transceiver under entity 67240014.
    for model in ["S3328TP-SI", "S3328TP-EI"] {
        huawei.models.insert(model.to_string(), microwatt(huawei_s3328_port()));
    }

    let mut h3c = VendorProfile::new("H3C");
    h3c.enterprise_prefixes = vec![enterprise(25506)];
    h3c.descr_keywords = strings(&["h3c", "comware"]);
    h3c.model_patterns = strings(&[r"\b(S\d{4}[A-Z0-9-]*)"]);
    h3c.capabilities = caps(&[
        (
            OpticalRx,
            vec![
                OidSource::mib("HH3C-TRANSCEIVER-INFO-MIB", "hh3cTransceiverCurRXPower"),
                oid("1.3.6.1.4.1.25506.8.35.18.4.3.1.2"),
            ],
        ),
        (
            OpticalTx,
            vec![
                OidSource::mib("HH3C-TRANSCEIVER-INFO-MIB", "hh3cTransceiverCurTXPower"),
                oid("1.3.6.1.4.1.25506.8.35.18.4.3.1.3"),
            ],
        ),
        (Temperature, vec![oid("1.3.6.1.4.1.25506.8.35.18.4.3.1.4")]),
    ]);
    h3c.power_encoding = PowerEncoding::CentiDbm;
    h3c.temperature_scale = Some(1.0);
    h3c.uplink_pattern = Some(COMMON_UPLINK.to_string());

    let mut eltex = VendorProfile::new("Eltex");
    eltex.enterprise_prefixes = vec![enterprise(35265)];
    eltex.descr_keywords = strings(&["eltex"]);
    eltex.model_patterns = strings(&[r"\b(MES\d{4}[A-Z0-9-]*)"]);
    eltex.power_encoding = PowerEncoding::MilliDbm;
    eltex.models.insert("MES2428".to_string(), eltex_port(28));
    eltex.models.insert("MES2408".to_string(), eltex_port(10));
    eltex.models.insert(
        "MES1124".to_string(),
        fixed_port(
            49,
            "1.3.6.1.4.1.89.90.1.2.1.3.49.8",
            "1.3.6.1.4.1.89.90.1.2.1.3.49.9",
            Some("1.3.6.1.4.1.35265.1.23.53.1.1.1.5"),
            None,
        ),
    );
    eltex.uplink_pattern = Some(COMMON_UPLINK.to_string());

    let mut zyxel = VendorProfile::new("Zyxel");
    zyxel.enterprise_prefixes = vec![enterprise(890)];
    zyxel.descr_keywords = strings(&["zyxel"]);
    zyxel.model_patterns = strings(&[r"\b((?:MES|GS|MGS|XGS)\d{4}[A-Z0-9-]*)"]);
    zyxel.power_encoding = PowerEncoding::CentiDbm;
    zyxel.models.insert("MES3500-24".to_string(), zyxel_mes_port(28));
    zyxel.models.insert("MES3500-10".to_string(), zyxel_mes_port(10));
    zyxel.models.insert(
        "MES3500-24S".to_string(),
        fixed_port(
            28,
            "1.3.6.1.4.1.890.1.15.3.84.1.2.1.6.28.4",
            "1.3.6.1.4.1.890.1.15.3.84.1.2.1.6.28.5",
            Some("1.3.6.1.4.1.890.1.15.3.84.1.1.1.2.28"),
            Some("1.3.6.1.4.1.890.1.15.3.84.1.1.1.4.28"),
        ),
    );
    zyxel.models.insert("GS3700-24".to_string(), zyxel_gs_port(28));
    zyxel.models.insert("MGS3520-28".to_string(), zyxel_gs_port(28));
    zyxel.uplink_pattern = Some(COMMON_UPLINK.to_string());

    let mut snr = VendorProfile::new("SNR");
    snr.enterprise_prefixes = vec![enterprise(40418)];
    snr.descr_keywords = strings(&["snr-"]);
    snr.model_patterns = strings(&[r"\b(SNR-S\d{4}[A-Z0-9-]*)"]);
    snr.power_encoding = PowerEncoding::Dbm;
    snr.models.insert("SNR-S2985G-24".to_string(), snr_port(28));
    snr.models.insert("SNR-S2985G-8".to_string(), snr_port(10));
    snr.models.insert("SNR-S2982G-24".to_string(), snr_port(28));

    let mut tplink = VendorProfile::new("TP-Link");
    tplink.enterprise_prefixes = vec![enterprise(11863)];
    tplink.descr_keywords = strings(&["tp-link", "jetstream"]);
    tplink.model_patterns = strings(&[r"\b(T\d{4}G-[A-Z0-9-]+)"]);
    tplink.models.insert("T2600G-28TS".to_string(), microwatt(tplink_port(49177)));
    tplink.uplink_pattern = Some(COMMON_UPLINK.to_string());

    let mut profiles = vec![cisco, huawei, h3c, eltex, zyxel, snr, tplink];

    // Recognised but without known optical tables.
    for (name, pen, keywords) in [
        ("Juniper", 2636, &["juniper", "junos"][..]),
        ("Nokia", 6527, &["nokia", "timos"][..]),
        ("D-Link", 171, &["d-link", "dgs-", "des-"][..]),
        ("HP", 11, &["hewlett", "procurve", "aruba"][..]),
        ("Foundry", 1991, &["foundry"][..]),
        ("Brocade", 1588, &["brocade"][..]),
    ] {
        let mut p = VendorProfile::new(name);
        p.enterprise_prefixes = vec![enterprise(pen)];
        p.descr_keywords = strings(keywords);
        profiles.push(p);
    }
    profiles
}

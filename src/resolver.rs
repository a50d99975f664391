//! OID resolution per (vendor, model, capability).
//!
//! Resolution is done up front: [`OidResolver::build_cache`] walks every
//! profile and model override once and produces a read-only
//! [`ResolutionCache`] that the scheduler shares with all device tasks for
//! the duration of a cycle.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::mib::MibRegistry;
use crate::normalize::PowerEncoding;
use crate::oid::{known, Oid};
use crate::vendor::{Capability, CompiledProfile, IndexKind, ModelOverride, OidSource, ProfileTable};

/// Everything a device task needs to read one vendor/model.
#[derive(Debug, Clone)]
pub struct ResolutionPlan {
    pub vendor: Option<String>,
    pub model_key: Option<String>,
    oids: BTreeMap<Capability, Vec<Oid>>,
    pub index: IndexKind,
    /// Set when the optical OIDs are full instances for one ifIndex.
    pub port: Option<u32>,
    pub encoding: PowerEncoding,
    /// Raw DDM temperature to degrees Celsius.
    pub temperature_scale: f64,
    /// Raw DDM supply voltage to volts.
    pub voltage_scale: f64,
    pub sentinels: Vec<i64>,
    pub profile: Option<Arc<CompiledProfile>>,
}

impl ResolutionPlan {
    fn base() -> Self {
        let mut oids = BTreeMap::new();
        oids.insert(
            Capability::Identity,
            vec![known::sys_descr(), known::sys_object_id(), known::sys_name()],
        );
        oids.insert(Capability::Uptime, vec![known::sys_uptime()]);
        Self {
            vendor: None,
            model_key: None,
            oids,
            index: IndexKind::IfIndex,
            port: None,
            encoding: PowerEncoding::Dbm,
            temperature_scale: 1.0,
            voltage_scale: 1.0,
            sentinels: Vec::new(),
            profile: None,
        }
    }

    pub fn oids(&self, cap: Capability) -> &[Oid] {
        self.oids.get(&cap).map(Vec::as_slice).unwrap_or(&[])
    }

    /// True when at least one DDM capability resolved.
    pub fn has_optics(&self) -> bool {
        Capability::OPTICAL.iter().any(|c| !self.oids(*c).is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct OidResolver {
    profiles: Arc<ProfileTable>,
    mibs: Arc<MibRegistry>,
}

impl OidResolver {
    pub fn new(profiles: Arc<ProfileTable>, mibs: Arc<MibRegistry>) -> Self {
        Self { profiles, mibs }
    }

    pub fn profiles(&self) -> &Arc<ProfileTable> {
        &self.profiles
    }

    /// One source to an OID, or `None` when a MIB object is not loaded.
    pub fn resolve_source(&self, src: &OidSource) -> Option<Oid> {
        match src {
            OidSource::Static(oid) => Some(oid.clone()),
            OidSource::MibDerived { module, object } => self.mibs.resolve(module, object),
        }
    }

    /// MIB-derived sources first, then static ones; duplicates dropped.
    fn resolve_all(&self, vendor: &str, cap: Capability, sources: &[OidSource]) -> Vec<Oid> {
        let derived = sources.iter().filter(|s| matches!(s, OidSource::MibDerived { .. }));
        let statics = sources.iter().filter(|s| matches!(s, OidSource::Static(_)));
        let mut out: Vec<Oid> = Vec::new();
        for src in derived.chain(statics) {
            match self.resolve_source(src) {
                Some(oid) if !out.contains(&oid) => out.push(oid),
                Some(_) => {}
                None => {
                    tracing::debug!(vendor, capability = %cap, source = %String::from(src.clone()), "MIB object not loaded");
                }
            }
        }
        out
    }

    fn plan_for(&self, profile: &CompiledProfile, model: Option<(&str, &ModelOverride)>) -> ResolutionPlan {
        let p = &profile.profile;
        let mut plan = ResolutionPlan::base();
        plan.vendor = Some(p.name.clone());
        plan.index = p.ddm_index;
        plan.encoding = p.power_encoding;
        plan.sentinels = p.sentinels.clone();
        plan.profile = Some(Arc::new(profile.clone()));

        let mut sources = p.capabilities.clone();
        if let Some((key, o)) = model {
            plan.model_key = Some(key.to_string());
            // A model override with its own table replaces the vendor's DDM columns.
            if !o.capabilities.is_empty() {
                for cap in Capability::OPTICAL {
                    sources.remove(&cap);
                }
            }
            sources.extend(o.capabilities.clone());
            plan.encoding = o.power_encoding.unwrap_or(plan.encoding);
            plan.index = o.ddm_index.unwrap_or(plan.index);
            plan.port = o.port;
        }
        plan.temperature_scale = p
            .temperature_scale
            .unwrap_or_else(|| temperature_factor(plan.encoding));
        plan.voltage_scale = p.voltage_scale.unwrap_or_else(|| voltage_factor(plan.encoding));
        for (cap, srcs) in &sources {
            let oids = self.resolve_all(&p.name, *cap, srcs);
            if oids.is_empty() {
                plan.oids.remove(cap);
            } else {
                plan.oids.insert(*cap, oids);
            }
        }
        plan
    }

    /// Precompute plans for every vendor default and model override.
    pub fn build_cache(&self) -> ResolutionCache {
        let mut plans = HashMap::new();
        for profile in self.profiles.iter() {
            let vendor = profile.name().to_lowercase();
            plans.insert((vendor.clone(), None), Arc::new(self.plan_for(profile, None)));
            for (key, o) in &profile.profile.models {
                let plan = self.plan_for(profile, Some((key.as_str(), o)));
                plans.insert((vendor.clone(), Some(key.to_uppercase())), Arc::new(plan));
            }
        }
        tracing::debug!(plans = plans.len(), "OID resolution cache built");
        ResolutionCache {
            plans,
            base: Arc::new(ResolutionPlan::base()),
        }
    }
}

/// Temperature multiplier for profiles that do not state one, guessed from
/// the power encoding's family.
fn temperature_factor(enc: PowerEncoding) -> f64 {
    match enc {
        PowerEncoding::CentiDbm | PowerEncoding::MilliDbm => 0.01,
        PowerEncoding::DeciDbm => 0.1,
        _ => 1.0,
    }
}

/// Voltage readings are millivolts except on decimal-text agents.
fn voltage_factor(enc: PowerEncoding) -> f64 {
    match enc {
        PowerEncoding::Dbm => 1.0,
        PowerEncoding::DeciDbm => 0.1,
        _ => 0.001,
    }
}

/// Read-only (vendor, model) to plan map, rebuilt once per cycle.
#[derive(Debug, Clone)]
pub struct ResolutionCache {
    plans: HashMap<(String, Option<String>), Arc<ResolutionPlan>>,
    base: Arc<ResolutionPlan>,
}

impl ResolutionCache {
    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    /// Most specific plan: model override, vendor default, then MIB-II only.
    pub fn plan(&self, vendor: Option<&str>, model: Option<&str>) -> Arc<ResolutionPlan> {
        let Some(vendor) = vendor else {
            return self.base.clone();
        };
        let vendor = vendor.to_lowercase();
        let Some(default) = self.plans.get(&(vendor.clone(), None)) else {
            return self.base.clone();
        };
        let Some(model) = model else {
            return default.clone();
        };
        let key = default
            .profile
            .as_ref()
            .and_then(|p| p.profile.model_override(model))
            .map(|(k, _)| k.to_uppercase());
        key.and_then(|k| self.plans.get(&(vendor, Some(k))))
            .unwrap_or(default)
            .clone()
    }

    /// Ordered candidate OIDs; empty when nothing resolves.
    pub fn resolve(&self, vendor: Option<&str>, model: Option<&str>, cap: Capability) -> Vec<Oid> {
        self.plan(vendor, model).oids(cap).to_vec()
    }
}

//! Minimal MIB module loader.
//!
//! Only object registrations are extracted (`OBJECT IDENTIFIER`,
//! `OBJECT-TYPE`, `MODULE-IDENTITY`, ... followed by `::= { parent n }`);
//! types, textual conventions and constraints are ignored. That is enough to
//! translate `MODULE::object` into a dotted OID without a full SMI compiler.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::oid::Oid;

/// Core object tree shipped with the crate: SNMPv2-SMI roots plus the
/// SNMPv2-MIB, IF-MIB, ENTITY-MIB and ENTITY-SENSOR-MIB objects the poller
/// reads.
const CORE_MIBS: &str = r#"
SNMPv2-SMI DEFINITIONS ::= BEGIN
org            OBJECT IDENTIFIER ::= { iso 3 }
dod            OBJECT IDENTIFIER ::= { org 6 }
internet       OBJECT IDENTIFIER ::= { dod 1 }
directory      OBJECT IDENTIFIER ::= { internet 1 }
mgmt           OBJECT IDENTIFIER ::= { internet 2 }
mib-2          OBJECT IDENTIFIER ::= { mgmt 1 }
transmission   OBJECT IDENTIFIER ::= { mib-2 10 }
experimental   OBJECT IDENTIFIER ::= { internet 3 }
private        OBJECT IDENTIFIER ::= { internet 4 }
enterprises    OBJECT IDENTIFIER ::= { private 1 }
security       OBJECT IDENTIFIER ::= { internet 5 }
snmpV2         OBJECT IDENTIFIER ::= { internet 6 }
END

SNMPv2-MIB DEFINITIONS ::= BEGIN
IMPORTS mib-2, OBJECT-TYPE FROM SNMPv2-SMI;
system         OBJECT IDENTIFIER ::= { mib-2 1 }
sysDescr       OBJECT-TYPE SYNTAX DisplayString MAX-ACCESS read-only STATUS current ::= { system 1 }
sysObjectID    OBJECT-TYPE SYNTAX OBJECT IDENTIFIER MAX-ACCESS read-only STATUS current ::= { system 2 }
sysUpTime      OBJECT-TYPE SYNTAX TimeTicks MAX-ACCESS read-only STATUS current ::= { system 3 }
sysContact     OBJECT-TYPE SYNTAX DisplayString MAX-ACCESS read-write STATUS current ::= { system 4 }
sysName        OBJECT-TYPE SYNTAX DisplayString MAX-ACCESS read-write STATUS current ::= { system 5 }
sysLocation    OBJECT-TYPE SYNTAX DisplayString MAX-ACCESS read-write STATUS current ::= { system 6 }
END

IF-MIB DEFINITIONS ::= BEGIN
IMPORTS MODULE-IDENTITY, OBJECT-TYPE, mib-2 FROM SNMPv2-SMI;
ifMIB MODULE-IDENTITY LAST-UPDATED "200006140000Z" ORGANIZATION "IETF" ::= { mib-2 31 }
ifMIBObjects   OBJECT IDENTIFIER ::= { ifMIB 1 }
interfaces     OBJECT IDENTIFIER ::= { mib-2 2 }
ifNumber       OBJECT-TYPE SYNTAX Integer32 MAX-ACCESS read-only STATUS current ::= { interfaces 1 }
ifTable        OBJECT-TYPE SYNTAX SEQUENCE OF IfEntry MAX-ACCESS not-accessible STATUS current ::= { interfaces 2 }
ifEntry        OBJECT-TYPE SYNTAX IfEntry MAX-ACCESS not-accessible STATUS current INDEX { ifIndex } ::= { ifTable 1 }
ifIndex        OBJECT-TYPE SYNTAX InterfaceIndex MAX-ACCESS read-only STATUS current ::= { ifEntry 1 }
ifDescr        OBJECT-TYPE SYNTAX DisplayString MAX-ACCESS read-only STATUS current ::= { ifEntry 2 }
ifType         OBJECT-TYPE SYNTAX IANAifType MAX-ACCESS read-only STATUS current ::= { ifEntry 3 }
ifMtu          OBJECT-TYPE SYNTAX Integer32 MAX-ACCESS read-only STATUS current ::= { ifEntry 4 }
ifSpeed        OBJECT-TYPE SYNTAX Gauge32 MAX-ACCESS read-only STATUS current ::= { ifEntry 5 }
ifPhysAddress  OBJECT-TYPE SYNTAX PhysAddress MAX-ACCESS read-only STATUS current ::= { ifEntry 6 }
ifAdminStatus  OBJECT-TYPE SYNTAX INTEGER { up(1), down(2), testing(3) } MAX-ACCESS read-write STATUS current ::= { ifEntry 7 }
ifOperStatus   OBJECT-TYPE SYNTAX INTEGER { up(1), down(2), testing(3), unknown(4), dormant(5), notPresent(6), lowerLayerDown(7) } MAX-ACCESS read-only STATUS current ::= { ifEntry 8 }
ifLastChange   OBJECT-TYPE SYNTAX TimeTicks MAX-ACCESS read-only STATUS current ::= { ifEntry 9 }
ifXTable       OBJECT-TYPE SYNTAX SEQUENCE OF IfXEntry MAX-ACCESS not-accessible STATUS current ::= { ifMIBObjects 1 }
ifXEntry       OBJECT-TYPE SYNTAX IfXEntry MAX-ACCESS not-accessible STATUS current AUGMENTS { ifEntry } ::= { ifXTable 1 }
ifName         OBJECT-TYPE SYNTAX DisplayString MAX-ACCESS read-only STATUS current ::= { ifXEntry 1 }
ifHighSpeed    OBJECT-TYPE SYNTAX Gauge32 MAX-ACCESS read-only STATUS current ::= { ifXEntry 15 }
ifAlias        OBJECT-TYPE SYNTAX DisplayString MAX-ACCESS read-write STATUS current ::= { ifXEntry 18 }
END

ENTITY-MIB DEFINITIONS ::= BEGIN
IMPORTS MODULE-IDENTITY, OBJECT-TYPE, mib-2 FROM SNMPv2-SMI;
entityMIB MODULE-IDENTITY LAST-UPDATED "200508100000Z" ORGANIZATION "IETF" ::= { mib-2 47 }
entityMIBObjects        OBJECT IDENTIFIER ::= { entityMIB 1 }
entityPhysical          OBJECT IDENTIFIER ::= { entityMIBObjects 1 }
entityMapping           OBJECT IDENTIFIER ::= { entityMIBObjects 3 }
entPhysicalTable        OBJECT-TYPE SYNTAX SEQUENCE OF EntPhysicalEntry MAX-ACCESS not-accessible STATUS current ::= { entityPhysical 1 }
entPhysicalEntry        OBJECT-TYPE SYNTAX EntPhysicalEntry MAX-ACCESS not-accessible STATUS current ::= { entPhysicalTable 1 }
entPhysicalIndex        OBJECT-TYPE SYNTAX PhysicalIndex MAX-ACCESS not-accessible STATUS current ::= { entPhysicalEntry 1 }
entPhysicalDescr        OBJECT-TYPE SYNTAX SnmpAdminString MAX-ACCESS read-only STATUS current ::= { entPhysicalEntry 2 }
entPhysicalClass        OBJECT-TYPE SYNTAX PhysicalClass MAX-ACCESS read-only STATUS current ::= { entPhysicalEntry 5 }
entPhysicalName         OBJECT-TYPE SYNTAX SnmpAdminString MAX-ACCESS read-only STATUS current ::= { entPhysicalEntry 7 }
entPhysicalSerialNum    OBJECT-TYPE SYNTAX SnmpAdminString MAX-ACCESS read-write STATUS current ::= { entPhysicalEntry 11 }
entPhysicalMfgName      OBJECT-TYPE SYNTAX SnmpAdminString MAX-ACCESS read-only STATUS current ::= { entPhysicalEntry 12 }
entPhysicalModelName    OBJECT-TYPE SYNTAX SnmpAdminString MAX-ACCESS read-only STATUS current ::= { entPhysicalEntry 13 }
entAliasMappingTable    OBJECT-TYPE SYNTAX SEQUENCE OF EntAliasMappingEntry MAX-ACCESS not-accessible STATUS current ::= { entityMapping 2 }
entAliasMappingEntry    OBJECT-TYPE SYNTAX EntAliasMappingEntry MAX-ACCESS not-accessible STATUS current ::= { entAliasMappingTable 1 }
entAliasMappingIdentifier OBJECT-TYPE SYNTAX RowPointer MAX-ACCESS read-only STATUS current ::= { entAliasMappingEntry 2 }
END

ENTITY-SENSOR-MIB DEFINITIONS ::= BEGIN
IMPORTS MODULE-IDENTITY, OBJECT-TYPE, mib-2 FROM SNMPv2-SMI;
entitySensorMIB MODULE-IDENTITY LAST-UPDATED "200212160000Z" ORGANIZATION "IETF" ::= { mib-2 99 }
entitySensorObjects     OBJECT IDENTIFIER ::= { entitySensorMIB 1 }
entPhySensorTable       OBJECT-TYPE SYNTAX SEQUENCE OF EntPhySensorEntry MAX-ACCESS not-accessible STATUS current ::= { entitySensorObjects 1 }
entPhySensorEntry       OBJECT-TYPE SYNTAX EntPhySensorEntry MAX-ACCESS not-accessible STATUS current ::= { entPhySensorTable 1 }
entPhySensorType        OBJECT-TYPE SYNTAX EntitySensorDataType MAX-ACCESS read-only STATUS current ::= { entPhySensorEntry 1 }
entPhySensorScale       OBJECT-TYPE SYNTAX EntitySensorDataScale MAX-ACCESS read-only STATUS current ::= { entPhySensorEntry 2 }
entPhySensorPrecision   OBJECT-TYPE SYNTAX EntitySensorPrecision MAX-ACCESS read-only STATUS current ::= { entPhySensorEntry 3 }
entPhySensorValue       OBJECT-TYPE SYNTAX EntitySensorValue MAX-ACCESS read-only STATUS current ::= { entPhySensorEntry 4 }
entPhySensorOperStatus  OBJECT-TYPE SYNTAX EntitySensorStatus MAX-ACCESS read-only STATUS current ::= { entPhySensorEntry 5 }
entPhySensorUnitsDisplay OBJECT-TYPE SYNTAX SnmpAdminString MAX-ACCESS read-only STATUS current ::= { entPhySensorEntry 6 }
END
"#;

/// Nesting limit when following parent references.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum MibError {
    #[error("failed to read MIB file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no `DEFINITIONS ::= BEGIN` header found")]
    NoModule,

    #[error("module {module}: malformed registration for `{name}`: {reason}")]
    Malformed {
        module: String,
        name: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Node {
    /// Symbolic parent, or `None` when `arcs` is already absolute.
    parent: Option<String>,
    arcs: Vec<u32>,
}

/// Symbol table built from parsed MIB modules.
#[derive(Debug, Clone, Default)]
pub struct MibRegistry {
    modules: HashMap<String, HashMap<String, Node>>,
    /// Symbol name to the module that first defined it.
    symbols: HashMap<String, String>,
}

fn module_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"([A-Za-z][A-Za-z0-9-]*)\s+DEFINITIONS\s*(?:[A-Z ]+\s+)?::=\s*BEGIN")
            .expect("module header regex")
    })
}

fn imports_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\bIMPORTS\b.*?;").expect("imports regex"))
}

fn definition_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\b([a-z][A-Za-z0-9-]*)\s+(OBJECT\s+IDENTIFIER|OBJECT-TYPE|MODULE-IDENTITY|OBJECT-IDENTITY|OBJECT-GROUP|NOTIFICATION-TYPE|NOTIFICATION-GROUP|MODULE-COMPLIANCE|AGENT-CAPABILITIES)\b",
        )
        .expect("definition regex")
    })
}

fn assignment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"::=\s*\{([^}]*)\}").expect("assignment regex"))
}

fn named_number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9-]*\((\d+)\)$").expect("named number regex"))
}

/// Remove `--` comments and the contents of quoted strings.
///
/// A comment runs to the end of the line or to the next `--`.
fn strip_comments_and_strings(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_string = false;
    let mut in_comment = false;
    while let Some(c) = chars.next() {
        if in_string {
            if c == '"' {
                in_string = false;
                out.push('"');
            } else if c == '\n' {
                out.push('\n');
            }
            continue;
        }
        if in_comment {
            if c == '\n' {
                in_comment = false;
                out.push('\n');
            } else if c == '-' && chars.peek() == Some(&'-') {
                chars.next();
                in_comment = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push('"');
            }
            '-' if chars.peek() == Some(&'-') => {
                chars.next();
                in_comment = true;
            }
            _ => out.push(c),
        }
    }
    out
}

fn parse_components(module: &str, name: &str, body: &str) -> Result<Node, MibError> {
    let malformed = |reason: String| MibError::Malformed {
        module: module.to_string(),
        name: name.to_string(),
        reason,
    };
    let mut tokens = body.split_whitespace();
    let first = tokens
        .next()
        .ok_or_else(|| malformed("empty OID value".to_string()))?;

    let mut parent = None;
    let mut arcs = Vec::new();
    if let Ok(n) = first.parse::<u32>() {
        arcs.push(n);
    } else if let Some(caps) = named_number_re().captures(first) {
        arcs.push(caps[1].parse().map_err(|_| malformed(format!("bad arc `{first}`")))?);
    } else {
        parent = Some(first.to_string());
    }

    for tok in tokens {
        let arc = if let Ok(n) = tok.parse::<u32>() {
            n
        } else if let Some(caps) = named_number_re().captures(tok) {
            caps[1]
                .parse()
                .map_err(|_| malformed(format!("bad arc `{tok}`")))?
        } else {
            return Err(malformed(format!("unexpected component `{tok}`")));
        };
        arcs.push(arc);
    }
    Ok(Node { parent, arcs })
}

fn root_arcs(name: &str) -> Option<Vec<u32>> {
    match name {
        "ccitt" => Some(vec![0]),
        "iso" => Some(vec![1]),
        "joint-iso-ccitt" => Some(vec![2]),
        _ => None,
    }
}

impl MibRegistry {
    /// Registry preloaded with the core modules.
    pub fn with_core() -> Self {
        let mut reg = Self::default();
        if let Err(e) = reg.load_str(CORE_MIBS) {
            tracing::error!(error = %e, "failed to parse embedded core MIBs");
        }
        reg
    }

    pub fn has_module(&self, module: &str) -> bool {
        self.modules.contains_key(module)
    }

    pub fn module_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.modules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Parse MIB text that may contain several modules. Returns the names of
    /// the modules registered.
    pub fn load_str(&mut self, text: &str) -> Result<Vec<String>, MibError> {
        let clean = strip_comments_and_strings(text);
        let headers: Vec<(String, usize, usize)> = module_header_re()
            .captures_iter(&clean)
            .filter_map(|caps| {
                let m = caps.get(0)?;
                Some((caps[1].to_string(), m.start(), m.end()))
            })
            .collect();
        if headers.is_empty() {
            return Err(MibError::NoModule);
        }

        let mut loaded = Vec::with_capacity(headers.len());
        for (i, (module, _, body_start)) in headers.iter().enumerate() {
            let body_end = headers
                .get(i + 1)
                .map(|(_, start, _)| *start)
                .unwrap_or(clean.len());
            let body = imports_re().replace(&clean[*body_start..body_end], " ");
            let nodes = self.parse_module_body(module, &body)?;
            for name in nodes.keys() {
                self.symbols
                    .entry(name.clone())
                    .or_insert_with(|| module.clone());
            }
            tracing::debug!(module = %module, objects = nodes.len(), "loaded MIB module");
            self.modules.insert(module.clone(), nodes);
            loaded.push(module.clone());
        }
        Ok(loaded)
    }

    fn parse_module_body(
        &self,
        module: &str,
        body: &str,
    ) -> Result<HashMap<String, Node>, MibError> {
        let defs: Vec<(String, usize)> = definition_re()
            .captures_iter(body)
            .filter_map(|caps| {
                let m = caps.get(0)?;
                Some((caps[1].to_string(), m.end()))
            })
            .collect();
        let starts: Vec<usize> = definition_re()
            .find_iter(body)
            .map(|m| m.start())
            .collect();

        let mut nodes = HashMap::new();
        for (i, (name, seg_start)) in defs.iter().enumerate() {
            let seg_end = starts.get(i + 1).copied().unwrap_or(body.len());
            let segment = &body[*seg_start..seg_end];
            let Some(caps) = assignment_re().captures(segment) else {
                // Macro usages without a value (e.g. inside SYNTAX) carry no OID.
                continue;
            };
            let node = parse_components(module, name, &caps[1])?;
            nodes.insert(name.clone(), node);
        }
        Ok(nodes)
    }

    /// Load every MIB file from a directory. Files that fail to parse are
    /// logged and skipped; returns the number of modules loaded.
    pub fn load_dir(&mut self, dir: impl AsRef<Path>) -> Result<usize, MibError> {
        let dir = dir.as_ref();
        let entries = fs::read_dir(dir).map_err(|source| MibError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        let mut count = 0usize;
        let mut paths: Vec<_> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        paths.sort();
        for path in paths {
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_ascii_lowercase);
            if !matches!(ext.as_deref(), None | Some("mib" | "my" | "txt")) {
                continue;
            }
            let text = match fs::read_to_string(&path) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable MIB file");
                    continue;
                }
            };
            match self.load_str(&text) {
                Ok(mods) => count += mods.len(),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping MIB file");
                }
            }
        }
        Ok(count)
    }

    fn lookup(&self, module: &str, name: &str) -> Option<&Node> {
        self.modules
            .get(module)
            .and_then(|m| m.get(name))
            .or_else(|| {
                let owner = self.symbols.get(name)?;
                self.modules.get(owner)?.get(name)
            })
    }

    fn resolve_node(&self, module: &str, name: &str, depth: usize) -> Option<Vec<u32>> {
        if depth > MAX_DEPTH {
            return None;
        }
        if let Some(arcs) = root_arcs(name) {
            return Some(arcs);
        }
        let node = self.lookup(module, name)?;
        let mut arcs = match &node.parent {
            Some(parent) => self.resolve_node(module, parent, depth + 1)?,
            None => Vec::new(),
        };
        arcs.extend_from_slice(&node.arcs);
        Some(arcs)
    }

    /// Translate `object` defined in `module` into a dotted OID.
    ///
    /// The module must be loaded; parents may live in any loaded module.
    pub fn resolve(&self, module: &str, object: &str) -> Option<Oid> {
        if !self.modules.get(module)?.contains_key(object) {
            return None;
        }
        self.resolve_node(module, object, 0).map(Oid::from_arcs)
    }

    /// Resolve a `MODULE::object` reference.
    pub fn resolve_ref(&self, reference: &str) -> Option<Oid> {
        let (module, object) = reference.split_once("::")?;
        self.resolve(module.trim(), object.trim())
    }
}

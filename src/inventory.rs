use std::collections::HashSet;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use anyhow::{Context, Result};
use ipnet::{IpNet, Ipv4Net};
use thiserror::Error;

use crate::types::DeviceRef;

/// Upper bound on hosts produced by one CIDR entry.
pub const MAX_CIDR_HOSTS: usize = 65_536;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InventoryError {
    #[error("line {line}: invalid address or network `{value}`")]
    Address { line: usize, value: String },

    #[error("line {line}: unknown key `{key}` (expected community, vendor or model)")]
    UnknownKey { line: usize, key: String },

    #[error("line {line}: empty value for `{key}`")]
    EmptyValue { line: usize, key: String },

    #[error("line {line}: {net} expands to more than {max} hosts")]
    TooLarge { line: usize, net: String, max: usize },

    #[error("line {line}: IPv6 networks cannot be expanded ({net})")]
    Ipv6Network { line: usize, net: String },
}

/// Parse inventory text into device references.
///
/// One entry per line; everything after `#` is ignored:
/// - `10.0.0.5`
/// - `10.0.0.5 core-sw-1 community=private vendor=Eltex model=MES2428`
/// - `10.0.1.0/29` (host addresses only, no network/broadcast)
///
/// Duplicate addresses are dropped, the first occurrence wins. Ids are
/// assigned from 1 in file order.
pub fn parse_inventory_str(s: &str) -> Result<Vec<DeviceRef>, InventoryError> {
    let mut out: Vec<DeviceRef> = Vec::new();
    let mut seen = HashSet::new();

    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
        if line.is_empty() {
            continue;
        }

        let mut tokens = line.split_whitespace();
        let Some(target) = tokens.next() else {
            continue;
        };
        let mut hostname = None;
        let mut community = None;
        let mut vendor = None;
        let mut model = None;
        for tok in tokens {
            match tok.split_once('=') {
                Some((key, value)) => {
                    if value.is_empty() {
                        return Err(InventoryError::EmptyValue {
                            line: line_no,
                            key: key.to_string(),
                        });
                    }
                    let slot = match key {
                        "community" => &mut community,
                        "vendor" => &mut vendor,
                        "model" => &mut model,
                        other => {
                            return Err(InventoryError::UnknownKey {
                                line: line_no,
                                key: other.to_string(),
                            })
                        }
                    };
                    *slot = Some(value.to_string());
                }
                None if hostname.is_none() => hostname = Some(tok.to_string()),
                None => {
                    return Err(InventoryError::UnknownKey {
                        line: line_no,
                        key: tok.to_string(),
                    })
                }
            }
        }

        for ip in expand_target(target, line_no)? {
            if !seen.insert(ip) {
                continue;
            }
            out.push(DeviceRef {
                id: out.len() as u64 + 1,
                ip,
                hostname: hostname.clone(),
                vendor: vendor.clone(),
                model: model.clone(),
                community: community.clone(),
            });
        }
    }

    Ok(out)
}

fn expand_target(target: &str, line: usize) -> Result<Vec<IpAddr>, InventoryError> {
    if target.contains('/') {
        let net: IpNet = target.parse().map_err(|_| InventoryError::Address {
            line,
            value: target.to_string(),
        })?;
        return match net {
            IpNet::V4(n4) => {
                let hosts = ipv4_host_count(n4);
                if hosts > MAX_CIDR_HOSTS {
                    return Err(InventoryError::TooLarge {
                        line,
                        net: net.to_string(),
                        max: MAX_CIDR_HOSTS,
                    });
                }
                Ok(expand_cidr_to_ips(net))
            }
            IpNet::V6(_) => Err(InventoryError::Ipv6Network {
                line,
                net: net.to_string(),
            }),
        };
    }
    let ip: IpAddr = target.parse().map_err(|_| InventoryError::Address {
        line,
        value: target.to_string(),
    })?;
    Ok(vec![ip])
}

fn ipv4_host_count(net: Ipv4Net) -> usize {
    let start = u64::from(u32::from(net.network()));
    let end = u64::from(u32::from(net.broadcast()));
    (end - start + 1) as usize
}

/// Expand a CIDR into host addresses.
///
/// For IPv4, excludes the network and broadcast addresses; /31 and /32
/// yield their addresses as-is. IPv6 returns an empty list.
pub fn expand_cidr_to_ips(cidr: IpNet) -> Vec<IpAddr> {
    match cidr {
        IpNet::V4(n4) => expand_ipv4net_hosts(n4).into_iter().map(IpAddr::V4).collect(),
        IpNet::V6(_) => Vec::new(),
    }
}

fn expand_ipv4net_hosts(net: Ipv4Net) -> Vec<Ipv4Addr> {
    let start = u32::from(net.network());
    let end = u32::from(net.broadcast());
    if net.prefix_len() >= 31 {
        return (start..=end).map(Ipv4Addr::from).collect();
    }
    (start + 1..end).map(Ipv4Addr::from).collect()
}

/// Load an inventory file.
pub fn load_inventory(path: impl AsRef<Path>) -> Result<Vec<DeviceRef>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read inventory file: {}", path.as_ref().display()))?;
    parse_inventory_str(&content)
        .with_context(|| format!("invalid inventory file: {}", path.as_ref().display()))
}

//! Linux network discovery from `/sys/class/net` and `/proc/net/route`.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use tunnelkeeper_core::{NetworkCandidate, NetworkHandle, Transport};

use crate::config::NetworkConfig;
use crate::network::NetworkProvider;

const TUNNEL_PREFIXES: &[&str] = &["tun", "tap", "wg", "utun", "ppp", "ipsec"];
const ETHERNET_PREFIXES: &[&str] = &["eth", "en"];
const CELLULAR_PREFIXES: &[&str] = &["ww", "rmnet"];

pub struct SysfsNetworkProvider {
    root: PathBuf,
    route_table: PathBuf,
}

impl SysfsNetworkProvider {
    pub fn new(root: impl Into<PathBuf>, route_table: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), route_table: route_table.into() }
    }

    pub fn from_config(config: &NetworkConfig) -> Self {
        Self::new(&config.sysfs_root, &config.route_table)
    }

    fn read_attr(dir: &Path, name: &str) -> Option<String> {
        fs::read_to_string(dir.join(name)).ok().map(|s| s.trim().to_string())
    }

    fn classify(dir: &Path, name: &str) -> Transport {
        if TUNNEL_PREFIXES.iter().any(|p| name.starts_with(p)) {
            Transport::Vpn
        } else if dir.join("wireless").exists() {
            Transport::Wifi
        } else if ETHERNET_PREFIXES.iter().any(|p| name.starts_with(p)) {
            Transport::Ethernet
        } else if CELLULAR_PREFIXES.iter().any(|p| name.starts_with(p)) {
            Transport::Cellular
        } else {
            Transport::Other
        }
    }

    /// Interfaces owning a default route (destination 00000000).
    fn default_route_interfaces(&self) -> HashSet<String> {
        let Ok(table) = fs::read_to_string(&self.route_table) else {
            return HashSet::new();
        };
        table
            .lines()
            .skip(1)
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let iface = fields.next()?;
                let destination = fields.next()?;
                (destination == "00000000").then(|| iface.to_string())
            })
            .collect()
    }
}

impl NetworkProvider for SysfsNetworkProvider {
    fn networks(&self) -> Vec<NetworkCandidate> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            debug!("Cannot read {:?}", self.root);
            return Vec::new();
        };
        let routed = self.default_route_interfaces();

        let mut networks: Vec<NetworkCandidate> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name == "lo" {
                    return None;
                }
                let dir = entry.path();
                let ifindex = Self::read_attr(&dir, "ifindex")?.parse::<u64>().ok()?;
                let operstate = Self::read_attr(&dir, "operstate").unwrap_or_default();
                let carrier = Self::read_attr(&dir, "carrier").unwrap_or_default();
                let transport = Self::classify(&dir, &name);

                Some(NetworkCandidate {
                    handle: NetworkHandle(ifindex),
                    has_internet: routed.contains(&name),
                    validated: operstate == "up" && carrier == "1",
                    is_expensive: transport == Transport::Cellular,
                    is_constrained: false,
                    interface_name: name,
                    transport,
                })
            })
            .collect();
        networks.sort_by_key(|n| n.handle.0);
        networks
    }
}

//! Out-of-band signal that a tunnel interface exists, used when the daemon
//! cannot be asked directly.

use std::fs;
use std::path::PathBuf;

const TUNNEL_PREFIXES: &[&str] = &["tun", "tap", "wg", "utun", "ppp", "ipsec"];

pub trait TunnelPresence: Send + Sync {
    fn tunnel_active(&self) -> bool;
}

/// Looks for a tunnel-class interface under `/sys/class/net` that is not
/// administratively down. TUN devices usually report `unknown`.
pub struct SysfsTunnelPresence {
    root: PathBuf,
    interface: Option<String>,
}

impl SysfsTunnelPresence {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), interface: None }
    }

    /// Only accept this exact interface name.
    pub fn with_interface(mut self, name: impl Into<String>) -> Self {
        self.interface = Some(name.into());
        self
    }

    fn matches(&self, name: &str) -> bool {
        match &self.interface {
            Some(wanted) => name == wanted,
            None => TUNNEL_PREFIXES.iter().any(|p| name.starts_with(p)),
        }
    }
}

impl Default for SysfsTunnelPresence {
    fn default() -> Self {
        Self::new("/sys/class/net")
    }
}

impl TunnelPresence for SysfsTunnelPresence {
    fn tunnel_active(&self) -> bool {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return false;
        };
        entries.flatten().any(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !self.matches(&name) {
                return false;
            }
            let operstate = fs::read_to_string(entry.path().join("operstate")).unwrap_or_default();
            !matches!(operstate.trim(), "down" | "notpresent" | "")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn iface(root: &Path, name: &str, operstate: &str) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("operstate"), format!("{}\n", operstate)).unwrap();
    }

    #[test]
    fn test_detects_tun_interface() {
        let tmp = tempfile::tempdir().unwrap();
        iface(tmp.path(), "eth0", "up");
        assert!(!SysfsTunnelPresence::new(tmp.path()).tunnel_active());

        iface(tmp.path(), "tun0", "unknown");
        assert!(SysfsTunnelPresence::new(tmp.path()).tunnel_active());
    }

    #[test]
    fn test_down_tunnel_does_not_count() {
        let tmp = tempfile::tempdir().unwrap();
        iface(tmp.path(), "wg0", "down");
        assert!(!SysfsTunnelPresence::new(tmp.path()).tunnel_active());
    }

    #[test]
    fn test_named_interface_filter() {
        let tmp = tempfile::tempdir().unwrap();
        iface(tmp.path(), "tun0", "up");
        let presence = SysfsTunnelPresence::new(tmp.path()).with_interface("tun1");
        assert!(!presence.tunnel_active());
    }

    #[test]
    fn test_missing_root() {
        assert!(!SysfsTunnelPresence::new("/nonexistent/net").tunnel_active());
    }
}

//! Hostname and SNI admission control.

use arc_swap::ArcSwap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::info;

/// One immutable allowlist generation. Reload replaces the whole snapshot,
/// so a query never observes a half-updated pair of sets.
struct Allowlist {
    hosts: HashSet<String>,
    snis: HashSet<String>,
    loaded_at: SystemTime,
}

impl Allowlist {
    fn build(
        hosts: impl IntoIterator<Item = String>,
        snis: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            hosts: hosts.into_iter().map(|h| h.to_ascii_lowercase()).collect(),
            snis: snis.into_iter().map(|s| s.to_ascii_lowercase()).collect(),
            loaded_at: SystemTime::now(),
        }
    }
}

/// Allowlist query interface shared by both front doors.
///
/// Matching is exact equality on lowercased names; no wildcards, no suffix
/// matching. Empty inputs are always denied. Queries are lock-free reads of
/// the current snapshot and may run concurrently with a reload.
pub struct AdmissionFilter {
    snapshot: ArcSwap<Allowlist>,
}

impl AdmissionFilter {
    pub fn new(
        hosts: impl IntoIterator<Item = String>,
        snis: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Allowlist::build(hosts, snis)),
        }
    }

    /// Returns true when the request's authority is allowed through the HTTP
    /// front door. A `:port` suffix on the host is ignored.
    pub fn allow_http(&self, host: &str) -> bool {
        let host = strip_port(host);
        if host.is_empty() {
            return false;
        }
        self.snapshot.load().hosts.contains(&host.to_ascii_lowercase())
    }

    /// Returns true when the server name is allowed through the TLS front
    /// door.
    pub fn allow_sni(&self, sni: &str) -> bool {
        if sni.is_empty() {
            return false;
        }
        self.snapshot.load().snis.contains(&sni.to_ascii_lowercase())
    }

    /// Atomically replaces both allowlists. Queries issued after this
    /// returns observe the new sets; in-flight queries observe the previous
    /// snapshot in full.
    pub fn reload(&self, hosts: Vec<String>, snis: Vec<String>) {
        let next = Allowlist::build(hosts, snis);
        info!(
            hosts = next.hosts.len(),
            snis = next.snis.len(),
            "Reloaded admission filter"
        );
        self.snapshot.store(Arc::new(next));
    }

    /// Timestamp of the most recent successful reload (or construction).
    pub fn last_reload(&self) -> SystemTime {
        self.snapshot.load().loaded_at
    }
}

/// Strips a trailing `:port` from an authority, when the suffix actually
/// parses as a port number.
pub(crate) fn strip_port(host: &str) -> &str {
    match host.rfind(':') {
        Some(idx) if host[idx + 1..].parse::<u16>().is_ok() => &host[..idx],
        _ => host,
    }
}

//! UID resolution from the kernel connection table.
//!
//! Linux-derived systems expose open sockets in `/proc/net/{tcp,tcp6,udp,
//! udp6}`. Addresses are printed as byte-reversed (little-endian) hex
//! words, ports as big-endian hex. The owning-UID column position varies
//! slightly across kernel versions, so a small set of candidate offsets
//! is tried in order.
//!
//! This scan is O(n) in open sockets and runs only on socket-cache misses.

use crate::resolver::{SocketTuple, Transport, Uid, UidResolver};
use crate::TrackError;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tracing::{trace, warn};

/// Candidate whitespace-field offsets for the UID column, in preference
/// order. 7 is the mainline layout; 6 and 8 cover kernels that drop or
/// split a neighboring column.
const UID_COLUMNS: [usize; 3] = [7, 6, 8];

/// [`UidResolver`] backed by the procfs connection tables.
pub struct ProcNetResolver {
    proc_root: PathBuf,
}

impl ProcNetResolver {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Use an alternate procfs root (tests, containers).
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: root.into(),
        }
    }

    fn read_table(&self, name: &str) -> Result<String, TrackError> {
        let path = self.proc_root.join("net").join(name);
        std::fs::read_to_string(&path)
            .map_err(|e| TrackError::ConnectionTable(format!("{}: {e}", path.display())))
    }
}

impl Default for ProcNetResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl UidResolver for ProcNetResolver {
    fn resolve(&self, tuple: &SocketTuple) -> Option<Uid> {
        let tables: &[&str] = match tuple.transport {
            Transport::Tcp => &["tcp", "tcp6"],
            Transport::Udp => &["udp", "udp6"],
        };

        for table in tables {
            let content = match self.read_table(table) {
                Ok(content) => content,
                Err(e) => {
                    // A missing table (no IPv6, restricted procfs) is not
                    // fatal; the remaining tables may still match.
                    trace!(table, error = %e, "connection table unavailable");
                    continue;
                }
            };
            if let Some(uid) = scan_table(&content, tuple) {
                return Some(uid);
            }
        }

        warn!(local = %tuple.local, "no owning UID found for socket");
        None
    }
}

/// Scan one table's text for the tuple and return the owning UID.
///
/// Matching is anchored on an exact local (ip, port) match; an
/// unspecified table address (wildcard bind) matches any ip. When the
/// caller supplies a remote side and the table row has one, it must
/// agree as well, which keeps reused local ports from aliasing.
fn scan_table(content: &str, tuple: &SocketTuple) -> Option<Uid> {
    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let (Some(local_field), Some(remote_field)) = (fields.get(1), fields.get(2)) else {
            continue;
        };
        let Some(local) = parse_proc_addr(local_field) else {
            continue;
        };

        if local.port() != tuple.local.port() {
            continue;
        }
        if !local.ip().is_unspecified() && canonical(local.ip()) != canonical(tuple.local.ip()) {
            continue;
        }

        if let (Some(want_remote), Some(row_remote)) = (tuple.remote, parse_proc_addr(remote_field))
        {
            // Rows with a zero remote port are unconnected; they cannot
            // contradict the caller's remote side.
            if row_remote.port() != 0 {
                if row_remote.port() != want_remote.port() {
                    continue;
                }
                if !row_remote.ip().is_unspecified()
                    && canonical(row_remote.ip()) != canonical(want_remote.ip())
                {
                    continue;
                }
            }
        }

        if let Some(uid) = uid_from_fields(&fields) {
            return Some(uid);
        }
    }
    None
}

/// Pick the UID out of a row, tolerating shifted layouts.
///
/// The UID is printed as a plain decimal, so anything non-decimal or
/// zero-padded (the hex queue/retransmit columns) is rejected outright.
/// A bare `0` is ambiguous between a root-owned socket and the timeout
/// column, so it only wins when no candidate column holds a non-zero
/// decimal.
fn uid_from_fields(fields: &[&str]) -> Option<Uid> {
    let mut zero_seen = false;
    for &column in &UID_COLUMNS {
        let Some(field) = fields.get(column) else {
            continue;
        };
        if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        if field.len() > 1 && field.starts_with('0') {
            continue;
        }
        match field.parse::<Uid>() {
            Ok(0) => zero_seen = true,
            Ok(uid) => return Some(uid),
            Err(_) => {}
        }
    }
    zero_seen.then_some(0)
}

/// Parse a `HEXADDR:HEXPORT` field from a procfs connection table.
///
/// The address is one or four 32-bit words, each printed little-endian;
/// the port is plain big-endian hex.
fn parse_proc_addr(field: &str) -> Option<SocketAddr> {
    let (addr_hex, port_hex) = field.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;

    let ip = match addr_hex.len() {
        8 => {
            let word = u32::from_str_radix(addr_hex, 16).ok()?;
            IpAddr::from(word.to_le_bytes())
        }
        32 => {
            let mut bytes = [0u8; 16];
            for (i, chunk) in bytes.chunks_exact_mut(4).enumerate() {
                let word = u32::from_str_radix(&addr_hex[i * 8..(i + 1) * 8], 16).ok()?;
                chunk.copy_from_slice(&word.to_le_bytes());
            }
            IpAddr::from(bytes)
        }
        _ => return None,
    };

    Some(SocketAddr::new(ip, port))
}

/// Fold IPv4-mapped IPv6 addresses down to IPv4 so the tcp6 table can
/// answer for dual-stack sockets.
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        IpAddr::V4(_) => ip,
    }
}

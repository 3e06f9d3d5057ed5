//! SDP answer candidate rewriting
//!
//! The relay may gather ICE candidates on its own container network; those
//! addresses are unreachable from the viewer. Before the remote answer is
//! applied, candidate lines whose address falls inside the known-internal
//! prefixes are rewritten to the host the client actually used to reach the
//! proxy. Every other line passes through byte-for-byte.

use std::net::{IpAddr, Ipv4Addr};

use ipnet::Ipv4Net;

/// Container network ranges the relay is known to gather candidates on.
const INTERNAL_PREFIXES: [(Ipv4Addr, u8); 2] = [
    // Docker bridge pools
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    // Podman default network
    (Ipv4Addr::new(10, 88, 0, 0), 16),
];

fn is_internal_v4(ip: Ipv4Addr) -> bool {
    INTERNAL_PREFIXES.iter().any(|(net, len)| {
        Ipv4Net::new(*net, *len)
            .map(|net| net.contains(&ip))
            .unwrap_or(false)
    })
}

/// Whether the client reached the proxy on the relay's own host, in which
/// case internal candidates are already correct and must not be touched.
pub fn is_colocated(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

/// Rewrite internal candidate addresses in an SDP answer to `host`.
///
/// Only `a=candidate:` lines with an address inside the internal prefixes
/// change; all other lines, including their endings, are preserved exactly.
pub fn rewrite_internal_candidates(sdp: &str, host: &str) -> String {
    if is_colocated(host) {
        return sdp.to_string();
    }

    let mut out = String::with_capacity(sdp.len());
    for segment in sdp.split_inclusive('\n') {
        let (line, ending) = split_line_ending(segment);
        match rewrite_candidate_line(line, host) {
            Some(rewritten) => out.push_str(&rewritten),
            None => out.push_str(line),
        }
        out.push_str(ending);
    }
    out
}

fn split_line_ending(segment: &str) -> (&str, &str) {
    if let Some(line) = segment.strip_suffix("\r\n") {
        (line, "\r\n")
    } else if let Some(line) = segment.strip_suffix('\n') {
        (line, "\n")
    } else {
        (segment, "")
    }
}

/// `a=candidate:<foundation> <component> <proto> <priority> <address> <port> typ <type> ...`
fn rewrite_candidate_line(line: &str, host: &str) -> Option<String> {
    if !line.starts_with("a=candidate:") {
        return None;
    }

    let mut fields: Vec<&str> = line.split(' ').collect();
    if fields.len() < 6 {
        return None;
    }

    let address = fields[4].parse::<Ipv4Addr>().ok()?;
    if !is_internal_v4(address) {
        return None;
    }

    fields[4] = host;
    Some(fields.join(" "))
}

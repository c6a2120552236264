use std::collections::HashSet;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use crate::error::{FingerprintError, Result};
use crate::scanner::ProbeTarget;

/// A scan input line must be a bare IPv4 or IPv6 literal; hostnames are not resolved.
pub fn parse_address(line: &str) -> Result<IpAddr> {
    let trimmed = line.trim();
    trimmed
        .parse::<IpAddr>()
        .map_err(|e| FingerprintError::InvalidTarget(format!("{}: {}", trimmed, e)))
}

/// `192.0.2.1`, `192.0.2.1:5353`, `::1` or `[::1]:5353`.
pub fn parse_endpoint(spec: &str, default_port: u16) -> Result<SocketAddr> {
    let spec = spec.trim();
    if let Ok(addr) = spec.parse::<SocketAddr>() {
        return Ok(addr);
    }
    parse_address(spec).map(|ip| SocketAddr::new(ip, default_port))
}

/// Parse a targets listing: one `label,address[:port]` per line.
///
/// Blank lines and `#` comments are ignored. A label may appear only once,
/// since the corpus is keyed by label.
pub fn parse_targets(content: &str, default_port: u16) -> Result<Vec<ProbeTarget>> {
    let mut targets = Vec::new();
    let mut seen = HashSet::new();

    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (label, endpoint) = line.split_once(',').ok_or_else(|| {
            FingerprintError::InvalidTarget(format!(
                "line {}: expected 'label,address[:port]', got '{}'",
                number + 1,
                line
            ))
        })?;
        let label = label.trim();
        if label.is_empty() {
            return Err(FingerprintError::InvalidTarget(format!(
                "line {}: empty label",
                number + 1
            )));
        }
        if !seen.insert(label.to_string()) {
            return Err(FingerprintError::InvalidTarget(format!(
                "line {}: duplicate label '{}'",
                number + 1,
                label
            )));
        }
        targets.push(ProbeTarget::new(label, parse_endpoint(endpoint, default_port)?));
    }

    Ok(targets)
}

pub fn load_targets(path: &Path, default_port: u16) -> Result<Vec<ProbeTarget>> {
    let content = fs::read_to_string(path).map_err(|e| FingerprintError::file(path, e))?;
    parse_targets(&content, default_port)
}

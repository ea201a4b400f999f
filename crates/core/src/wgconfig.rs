//! Parsing, validation, and storage-normalization of WireGuard `.conf` ini
//! text (spec.md §4.B step 2 and §6 "WireGuard config accepted").

use m360_common::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct ParsedConfig {
    pub interface_lines: Vec<String>,
    pub peer_blocks: Vec<Vec<String>>,
    pub address_v4: String,
    pub private_key: String,
}

/// Splits raw ini text into an `[Interface]` line list and a list of
/// `[Peer]` line lists, preserving original ordering within each block.
fn split_sections(raw: &str) -> (Vec<String>, Vec<Vec<String>>) {
    let mut interface_lines = Vec::new();
    let mut peer_blocks: Vec<Vec<String>> = Vec::new();
    let mut in_interface = false;
    let mut in_peer = false;

    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.eq_ignore_ascii_case("[Interface]") {
            in_interface = true;
            in_peer = false;
            continue;
        }
        if trimmed.eq_ignore_ascii_case("[Peer]") {
            in_interface = false;
            in_peer = true;
            peer_blocks.push(Vec::new());
            continue;
        }
        if trimmed.is_empty() {
            continue;
        }
        if in_interface {
            interface_lines.push(trimmed.to_string());
        } else if in_peer {
            peer_blocks.last_mut().unwrap().push(trimmed.to_string());
        }
    }
    (interface_lines, peer_blocks)
}

fn field<'a>(lines: &'a [String], key: &str) -> Option<&'a str> {
    lines.iter().find_map(|l| {
        let (k, v) = l.split_once('=')?;
        if k.trim().eq_ignore_ascii_case(key) {
            Some(v.trim())
        } else {
            None
        }
    })
}

/// `validate_wg_config`: a single `[Peer]` presence check, not the
/// distilled source's redundant double regex (SPEC_FULL.md §13 Q1).
pub fn validate(raw: &str) -> Result<()> {
    let (interface, peers) = split_sections(raw);
    if interface.is_empty() {
        return Err(Error::InvalidConfig("missing [Interface] section".into()));
    }
    if peers.is_empty() {
        return Err(Error::InvalidConfig("missing [Peer] section".into()));
    }
    if field(&interface, "Address").is_none() {
        return Err(Error::InvalidConfig("[Interface] missing Address".into()));
    }
    if field(&interface, "PrivateKey").is_none() {
        return Err(Error::InvalidConfig("[Interface] missing PrivateKey".into()));
    }
    let peer = &peers[0];
    if field(peer, "PublicKey").is_none() {
        return Err(Error::InvalidConfig("[Peer] missing PublicKey".into()));
    }
    if field(peer, "AllowedIPs").is_none() {
        return Err(Error::InvalidConfig("[Peer] missing AllowedIPs".into()));
    }
    Ok(())
}

fn first_ipv4(cidr_list: &str) -> Option<String> {
    cidr_list.split(',').map(|s| s.trim()).find(|s| !s.contains(':')).map(|s| s.to_string())
}

fn normalize_allowed_ips(raw: &str) -> String {
    let entries: Vec<String> = raw
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty() && !s.contains(':'))
        .map(|s| if s == "0.0.0.0/32" { "0.0.0.0/0".to_string() } else { s.to_string() })
        .collect();
    if entries.is_empty() {
        "0.0.0.0/0".to_string()
    } else {
        entries.join(", ")
    }
}

/// Storage normalization: inject `Table = off`, strip `DNS=`, collapse
/// `Address`/`AllowedIPs` to IPv4-only. Idempotent: re-running on already
/// normalized text produces byte-identical output (invariant 7).
pub fn normalize(raw: &str) -> Result<ParsedConfig> {
    validate(raw)?;
    let (interface, peer_blocks) = split_sections(raw);

    let address_v4 = field(&interface, "Address")
        .and_then(first_ipv4)
        .ok_or_else(|| Error::InvalidConfig("no IPv4 Address in [Interface]".into()))?;
    let private_key = field(&interface, "PrivateKey").unwrap_or_default().to_string();

    let mut new_interface = Vec::new();
    let mut has_table = false;
    for line in &interface {
        let (key, _) = line.split_once('=').unwrap_or((line.as_str(), ""));
        let key = key.trim();
        if key.eq_ignore_ascii_case("DNS") {
            continue;
        }
        if key.eq_ignore_ascii_case("Address") {
            new_interface.push(format!("Address = {address_v4}"));
            continue;
        }
        if key.eq_ignore_ascii_case("Table") {
            has_table = true;
            new_interface.push("Table = off".to_string());
            continue;
        }
        new_interface.push(line.clone());
    }
    if !has_table {
        new_interface.push("Table = off".to_string());
    }

    let mut new_peers = Vec::new();
    for peer in &peer_blocks {
        let mut new_peer = Vec::new();
        for line in peer {
            let (key, _) = line.split_once('=').unwrap_or((line.as_str(), ""));
            let key = key.trim();
            if key.eq_ignore_ascii_case("AllowedIPs") {
                let raw_allowed = field(peer, "AllowedIPs").unwrap_or_default();
                new_peer.push(format!("AllowedIPs = {}", normalize_allowed_ips(raw_allowed)));
                continue;
            }
            new_peer.push(line.clone());
        }
        new_peers.push(new_peer);
    }

    let mut rendered = String::from("[Interface]\n");
    for l in &new_interface {
        rendered.push_str(l);
        rendered.push('\n');
    }
    for peer in &new_peers {
        rendered.push_str("[Peer]\n");
        for l in peer {
            rendered.push_str(l);
            rendered.push('\n');
        }
    }

    Ok(ParsedConfig { interface_lines: vec![rendered], peer_blocks: new_peers, address_v4, private_key })
}

impl ParsedConfig {
    pub fn rendered(&self) -> &str {
        &self.interface_lines[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "[Interface]\nAddress = 10.8.0.2/32\nPrivateKey = cGxhY2Vob2xkZXI=\nDNS = 1.1.1.1\n\n[Peer]\nPublicKey = cGxhY2Vob2xkZXI=\nAllowedIPs = 0.0.0.0/0\nEndpoint = vpn.example.com:51820\n";

    #[test]
    fn normalize_strips_dns_and_injects_table_off() {
        let parsed = normalize(SAMPLE).unwrap();
        assert!(parsed.rendered().contains("Table = off"));
        assert!(!parsed.rendered().contains("DNS"));
        assert_eq!(parsed.address_v4, "10.8.0.2/32");
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize(SAMPLE).unwrap();
        let twice = normalize(once.rendered()).unwrap();
        assert_eq!(once.rendered(), twice.rendered());
    }

    #[test]
    fn allowed_ips_substitutes_host_default() {
        let cfg = SAMPLE.replace("0.0.0.0/0", "0.0.0.0/32");
        let parsed = normalize(&cfg).unwrap();
        assert!(parsed.peer_blocks[0].iter().any(|l| l.contains("0.0.0.0/0")));
    }

    #[test]
    fn validate_rejects_missing_peer() {
        let cfg = "[Interface]\nAddress = 10.8.0.2/32\nPrivateKey = abc\n";
        assert!(validate(cfg).is_err());
    }
}

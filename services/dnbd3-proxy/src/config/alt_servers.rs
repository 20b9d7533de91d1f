//! Parser for the `alt-servers` file: one known alt-server per line.
//!
//! Line format: `[+|-]host[:port] comment...`. A leading `-` marks the
//! server *private*: used for replication but never advertised to clients.
//! A leading `+` marks it *client-only*: advertised to clients but never
//! used by our own uplink for replication. No prefix means both (§6).
//! Anything after the first whitespace run is a free-form comment.

use std::net::SocketAddr;
use std::path::Path;

use thiserror::Error;

use dnbd3_networking::Host;

/// One configured alt-server entry, as read from the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltServerLine {
    pub host: Host,
    pub private: bool,
    pub client_only: bool,
    pub comment: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AltServersParseError {
    #[error("line {line}: empty after flag prefix")]
    EmptyLine { line: usize },

    #[error("line {line}: could not parse '{text}' as host:port")]
    BadAddress { line: usize, text: String },
}

/// Parse the contents of an `alt-servers` file. Blank lines and lines
/// starting with `#` are skipped.
pub fn parse_alt_servers_str(contents: &str) -> Result<Vec<AltServerLine>, AltServersParseError> {
    let mut out = Vec::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (private, client_only, rest) = match line.chars().next() {
            Some('-') => (true, false, line[1..].trim_start()),
            Some('+') => (false, true, line[1..].trim_start()),
            _ => (false, false, line),
        };

        if rest.is_empty() {
            return Err(AltServersParseError::EmptyLine { line: line_no });
        }

        let mut parts = rest.splitn(2, char::is_whitespace);
        let addr_text = parts.next().unwrap_or_default();
        let comment = parts
            .next()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let socket_addr: SocketAddr =
            addr_text.parse().map_err(|_| AltServersParseError::BadAddress {
                line: line_no,
                text: addr_text.to_string(),
            })?;

        out.push(AltServerLine {
            host: Host::from_socket_addr(socket_addr),
            private,
            client_only,
            comment,
        });
    }

    Ok(out)
}

/// Read and parse an `alt-servers` file from disk.
pub fn parse_alt_servers_file(path: &Path) -> anyhow::Result<Vec<AltServerLine>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(parse_alt_servers_str(&contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_flagged_lines() {
        let contents = "\
# comment line
192.0.2.10:5003 primary datacenter
-192.0.2.11:5003 replication only
+192.0.2.12:5003 advertise only
";
        let entries = parse_alt_servers_str(contents).unwrap();
        assert_eq!(entries.len(), 3);

        assert!(!entries[0].private && !entries[0].client_only);
        assert_eq!(entries[0].comment.as_deref(), Some("primary datacenter"));

        assert!(entries[1].private && !entries[1].client_only);
        assert!(!entries[2].private && entries[2].client_only);
    }

    #[test]
    fn rejects_unparsable_address() {
        let err = parse_alt_servers_str("not-an-address\n").unwrap_err();
        assert!(matches!(err, AltServersParseError::BadAddress { line: 1, .. }));
    }

    #[test]
    fn blank_lines_and_comments_are_skipped() {
        let entries = parse_alt_servers_str("\n# comment\n\n192.0.2.1:5003\n\n").unwrap();
        assert_eq!(entries.len(), 1);
    }
}

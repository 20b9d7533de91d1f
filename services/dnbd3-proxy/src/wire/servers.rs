//! `GET_SERVERS` reply payload: a flat run of `server_entry` records (§6).

use bytes::BytesMut;

use dnbd3_networking::{Host, NetworkError, HOST_WIRE_LEN};

/// Encode a list of hosts as the `GET_SERVERS` reply payload, in the order
/// given — the caller (alt-server registry) is responsible for ranking.
pub fn encode_servers(hosts: &[Host]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(hosts.len() * HOST_WIRE_LEN);
    for host in hosts {
        buf.extend_from_slice(&host.to_wire());
    }
    buf
}

/// Decode a `GET_SERVERS` reply payload back into its hosts. A trailing
/// partial record (fewer than `HOST_WIRE_LEN` bytes left over) is ignored
/// rather than rejected, since a peer speaking a newer protocol revision
/// may pad the payload.
pub fn decode_servers(payload: &[u8]) -> Result<Vec<Host>, NetworkError> {
    let mut hosts = Vec::with_capacity(payload.len() / HOST_WIRE_LEN);
    let mut chunks = payload.chunks_exact(HOST_WIRE_LEN);
    for chunk in &mut chunks {
        hosts.push(Host::from_wire(chunk)?);
    }
    Ok(hosts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn round_trips_a_list_of_hosts() {
        let hosts = vec![
            Host::V4(Ipv4Addr::new(10, 0, 0, 1), 5003),
            Host::V4(Ipv4Addr::new(10, 0, 0, 2), 5003),
        ];
        let encoded = encode_servers(&hosts);
        assert_eq!(encoded.len(), HOST_WIRE_LEN * 2);
        let decoded = decode_servers(&encoded).unwrap();
        assert_eq!(decoded, hosts);
    }

    #[test]
    fn empty_list_round_trips() {
        let encoded = encode_servers(&[]);
        assert!(decode_servers(&encoded).unwrap().is_empty());
    }

    #[test]
    fn trailing_partial_record_is_ignored() {
        let hosts = vec![Host::V4(Ipv4Addr::new(10, 0, 0, 1), 5003)];
        let mut encoded = encode_servers(&hosts);
        encoded.extend_from_slice(&[0u8; 5]);
        let decoded = decode_servers(&encoded).unwrap();
        assert_eq!(decoded, hosts);
    }
}

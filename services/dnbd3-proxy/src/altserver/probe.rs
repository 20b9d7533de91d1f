//! RTT Probe & Switch Decision (§4.5).
//!
//! A periodic loop grounded on `heartbeat.rs`'s `run_heartbeat_loop` timer
//! shape, generalized from "post one heartbeat" to "probe up to
//! [`super::registry::MAX_PROBE_CANDIDATES`] alt-servers and hand the
//! uplink worker a switch verdict".

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use dnbd3_networking::Host;

use crate::wire::proto::{Request, PROTOCOL_VERSION};
use crate::wire::select_image::SelectImagePayload;
use crate::wire::{ReplyHeader, CMD_SELECT_IMAGE};

use super::registry::{AltServerRegistry, FAIL_STEP, FAIL_STEP_HARD};

/// Connect timeout for a probe attempt (§4.5: "750 ms").
pub const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_millis(750);

/// Size of the sample block fetched per probe (§4.5: "block 0 of size 4 KiB").
const PROBE_BLOCK_SIZE: u32 = 4096;

/// First probe interval; grows to [`SERVER_RTT_DELAY_MAX`] after a switch.
pub const SERVER_RTT_DELAY_INIT: Duration = Duration::from_secs(2);
/// Upper bound the probe interval grows to once the connection is stable.
pub const SERVER_RTT_DELAY_MAX: Duration = Duration::from_secs(600);

/// Absolute RTT margin (µs) beyond which a switch is taken outright.
///
/// The source spec states the comparison (`currentRtt > bestRtt +
/// RTT_ABSOLUTE_THRESHOLD`) but not the constant; 200 ms is chosen as a
/// conservative value for a WAN-tolerant default and recorded as an Open
/// Question resolution in `DESIGN.md`.
pub const RTT_ABSOLUTE_THRESHOLD_MICROS: u32 = 200_000;

/// Relative margin: `currentRtt * RTT_THRESHOLD_FACTOR > bestRtt +
/// RTT_MARGIN_MICROS` also triggers a switch. `0.8` means "current is at
/// least 25% worse than best" — also an Open Question resolution.
pub const RTT_THRESHOLD_FACTOR: f64 = 0.8;
pub const RTT_MARGIN_MICROS: u32 = 1_000;

/// Best-count hysteresis thresholds (§4.5).
pub const BEST_COUNT_SWITCH_THRESHOLD: u32 = 12;
pub const BEST_COUNT_ANTIFLAP_GATE: u32 = 8;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("wire error: {0}")]
    Wire(#[from] crate::wire::WireError),
    #[error("image name/revision mismatch")]
    ImageMismatch,
    #[error("virtual size mismatch")]
    SizeMismatch,
    #[error("protocol version {0} below minimum")]
    ProtocolTooOld(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchVerdict {
    DoChange(Host),
    DontChange,
    NotReachable,
}

/// Probe one candidate: connect, select the image, fetch block 0, time the
/// whole exchange in microseconds.
pub async fn probe_candidate(
    candidate: Host,
    image_name: &str,
    revision: u16,
    expected_virtual_size: u64,
) -> Result<u32, ProbeError> {
    let start = Instant::now();
    let addr: SocketAddr = candidate.to_socket_addr();

    let mut stream = timeout(PROBE_CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| ProbeError::ConnectTimeout)??;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use bytes::BytesMut;

    let select_payload = SelectImagePayload {
        protocol_version: PROTOCOL_VERSION,
        name: image_name.to_string(),
        revision,
        virtual_size: 0,
    };
    let mut select_request = BytesMut::new();
    select_payload.encode(&mut select_request);

    // Select-image handshake: send a SELECT_IMAGE request whose payload is
    // the encoded name/revision, then read back the server's confirmation.
    let select_header = Request::new(CMD_SELECT_IMAGE, 0, select_request.len() as u32, 0);
    let mut handshake = BytesMut::new();
    select_header.encode(&mut handshake);
    stream.write_all(&handshake).await?;
    stream.write_all(&select_request).await?;

    let mut header_buf = [0u8; crate::wire::proto::REPLY_LEN];
    stream.read_exact(&mut header_buf).await?;
    let reply_header = ReplyHeader::decode(&header_buf)?;

    let mut payload_buf = vec![0u8; reply_header.size as usize];
    stream.read_exact(&mut payload_buf).await?;
    let confirmed = SelectImagePayload::decode(&payload_buf)?;

    if confirmed.name != image_name {
        return Err(ProbeError::ImageMismatch);
    }
    if expected_virtual_size != 0 && confirmed.virtual_size != expected_virtual_size {
        return Err(ProbeError::SizeMismatch);
    }
    if confirmed.protocol_version < crate::wire::proto::MIN_PROTOCOL_VERSION {
        return Err(ProbeError::ProtocolTooOld(confirmed.protocol_version));
    }

    let block_request = Request::new_get_block(0, PROBE_BLOCK_SIZE, 0);
    let mut buf = BytesMut::new();
    block_request.encode(&mut buf);
    stream.write_all(&buf).await?;

    let mut block_header = [0u8; crate::wire::proto::REPLY_LEN];
    stream.read_exact(&mut block_header).await?;
    let block_reply = ReplyHeader::decode(&block_header)?;
    let mut block_payload = vec![0u8; block_reply.size as usize];
    stream.read_exact(&mut block_payload).await?;

    Ok(start.elapsed().as_micros() as u32)
}

/// Pure decision function, kept free of I/O so it's directly testable
/// (boundary scenario 4: anti-flap under alternation).
pub fn decide_switch(
    current: Option<Host>,
    current_rtt: Option<u32>,
    best: Host,
    best_rtt: u32,
    best_count_current: u32,
    best_count_best: u32,
    tie_break_roll: u32,
) -> SwitchVerdict {
    let Some(current_host) = current else {
        return SwitchVerdict::DoChange(best);
    };
    if current_host == best {
        return SwitchVerdict::DontChange;
    }
    let Some(current_rtt) = current_rtt else {
        return SwitchVerdict::DoChange(best);
    };

    if current_rtt > best_rtt.saturating_add(RTT_ABSOLUTE_THRESHOLD_MICROS) {
        return SwitchVerdict::DoChange(best);
    }
    if (current_rtt as f64 * RTT_THRESHOLD_FACTOR) > (best_rtt + RTT_MARGIN_MICROS) as f64 {
        return SwitchVerdict::DoChange(best);
    }

    let gate_open = best_count_best.saturating_sub(best_count_current) >= BEST_COUNT_ANTIFLAP_GATE;
    if best_count_best > BEST_COUNT_SWITCH_THRESHOLD
        && gate_open
        && tie_break_roll < best_count_best
        && best_rtt < current_rtt
    {
        return SwitchVerdict::DoChange(best);
    }

    SwitchVerdict::DontChange
}

/// Run one probe cycle across the candidates in `registry`, updating RTT
/// samples and fail counts, and returning the switch verdict for the
/// uplink worker to act on.
pub async fn run_probe_cycle(
    registry: &AltServerRegistry,
    image_name: &str,
    revision: u16,
    expected_virtual_size: u64,
    current: Option<Host>,
    allow_private: bool,
) -> SwitchVerdict {
    let candidates = registry.select_probe_candidates(allow_private, current).await;
    if candidates.is_empty() {
        return SwitchVerdict::NotReachable;
    }

    let mut best: Option<(Host, u32)> = None;
    for candidate in &candidates {
        match probe_candidate(*candidate, image_name, revision, expected_virtual_size).await {
            Ok(micros) => {
                registry.update_rtt(candidate, micros).await;
                registry.report_success(candidate).await;
                if best.map(|(_, b)| micros < b).unwrap_or(true) {
                    best = Some((*candidate, micros));
                }
            }
            Err(err) => {
                warn!(host = %candidate, error = %err, "alt-server probe failed");
                let step = if matches!(err, ProbeError::ImageMismatch | ProbeError::SizeMismatch | ProbeError::ProtocolTooOld(_)) {
                    FAIL_STEP_HARD
                } else {
                    FAIL_STEP
                };
                registry.report_failure(candidate, step).await;
            }
        }
    }

    let Some((best_host, best_rtt)) = best else {
        return SwitchVerdict::NotReachable;
    };

    registry.apply_best_count_step(&best_host).await;

    let current_rtt = match current {
        Some(host) => registry.entry_snapshot(&host).await.and_then(|e| e.live_rtt_micros),
        None => None,
    };
    let best_count_current = match current {
        Some(host) => registry.best_count(&host).await,
        None => 0,
    };
    let best_count_best = registry.best_count(&best_host).await;
    let tie_break_roll = rand::random::<u32>() % 50;

    let verdict = decide_switch(
        current,
        current_rtt,
        best_host,
        best_rtt,
        best_count_current,
        best_count_best,
        tie_break_roll,
    );

    debug!(?verdict, best_rtt, "probe cycle decided");
    verdict
}

/// Drive [`run_probe_cycle`] on a growing interval, per the heartbeat
/// loop's timer shape, until `shutdown` fires.
pub async fn run_probe_loop(
    registry: std::sync::Arc<AltServerRegistry>,
    image_name: String,
    revision: u16,
    expected_virtual_size: u64,
    mut current: Option<Host>,
    allow_private: bool,
    verdicts: tokio::sync::mpsc::Sender<SwitchVerdict>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = SERVER_RTT_DELAY_INIT;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(image_name, "rtt probe loop shutting down");
                    break;
                }
            }
            _ = tokio::time::sleep(interval) => {
                let verdict = run_probe_cycle(
                    &registry,
                    &image_name,
                    revision,
                    expected_virtual_size,
                    current,
                    allow_private,
                ).await;

                if let SwitchVerdict::DoChange(host) = verdict {
                    current = Some(host);
                    interval = SERVER_RTT_DELAY_MAX;
                }

                if verdicts.send(verdict).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn host(n: u8) -> Host {
        Host::V4(Ipv4Addr::new(10, 0, 0, n), 5003)
    }

    #[test]
    fn no_current_server_switches_to_best() {
        let verdict = decide_switch(None, None, host(1), 1000, 0, 0, 0);
        assert_eq!(verdict, SwitchVerdict::DoChange(host(1)));
    }

    #[test]
    fn absolute_threshold_forces_switch() {
        let verdict = decide_switch(
            Some(host(2)),
            Some(500_000),
            host(1),
            100_000,
            0,
            0,
            0,
        );
        assert_eq!(verdict, SwitchVerdict::DoChange(host(1)));
    }

    #[test]
    fn best_count_switch_is_gated_by_anti_flap() {
        // Best is faster and over the switch threshold, but the gap to
        // current's best_count is below the anti-flap gate: must not switch.
        let verdict = decide_switch(
            Some(host(2)),
            Some(10_100),
            host(1),
            10_000,
            10,
            15,
            0,
        );
        assert_eq!(verdict, SwitchVerdict::DontChange);
    }

    #[test]
    fn best_count_switch_taken_when_gate_open_and_roll_wins() {
        let verdict = decide_switch(
            Some(host(2)),
            Some(10_100),
            host(1),
            10_000,
            0,
            13,
            5,
        );
        assert_eq!(verdict, SwitchVerdict::DoChange(host(1)));
    }

    #[test]
    fn same_host_never_switches() {
        let verdict = decide_switch(Some(host(1)), Some(1000), host(1), 1000, 0, 0, 0);
        assert_eq!(verdict, SwitchVerdict::DontChange);
    }
}

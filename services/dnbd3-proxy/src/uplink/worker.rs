//! The uplink worker's event loop: a bespoke `tokio::select!` loop in the
//! shape of `heartbeat.rs`'s `run_heartbeat_loop`, generalized to multiplex
//! several wakeup sources (socket, new request, RTT verdict, shutdown,
//! keepalive, background replication) instead of a single sleep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use dnbd3_networking::Host;

use crate::altserver::registry::FAIL_STEP;
use crate::altserver::{run_probe_loop, AltServerRegistry, SwitchVerdict};
use crate::config::Config;
use crate::image::backing;
use crate::image::model::Image;
use crate::integrity::IntegrityHandle;
use crate::wire::proto::{Request, ReplyHeader, CMD_ERROR, CMD_GET_BLOCK, PROTOCOL_VERSION, REPLY_LEN};
use crate::wire::select_image::SelectImagePayload;
use crate::wire::CMD_SELECT_IMAGE;

use super::queue::{QueueEntry, UplinkQueue, DEFAULT_CAPACITY};

/// `client` sentinel marking a synthetic background-replication request, so
/// the spare-capacity gate can tell it apart from real client work without
/// the queue needing to know about "background" as a concept.
const BACKGROUND_CLIENT: u64 = u64::MAX;

/// Connect timeout for the worker's own upstream handshake, distinct from
/// (and slightly more patient than) the RTT probe's connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Interval between keepalive pings on an idle upstream connection (§5: "~6 s").
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(6);

/// How often the worker checks for a spare-capacity background replication
/// opportunity.
const BACKGROUND_REPLICATION_TICK: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Error)]
pub enum UplinkError {
    #[error("uplink queue is full")]
    QueueFull,
    #[error("uplink worker shut down")]
    WorkerGone,
    #[error("upstream reported a protocol error")]
    Upstream,
}

struct ReadRequest {
    offset: u64,
    length: u32,
    reply: oneshot::Sender<Result<Bytes, UplinkError>>,
}

/// Handle to a running uplink worker, stored on [`crate::image::ImageState`]
/// for the lifetime of the image's replication.
#[derive(Clone)]
pub struct UplinkHandle {
    requests_tx: mpsc::Sender<ReadRequest>,
    shutdown_tx: watch::Sender<bool>,
}

impl UplinkHandle {
    /// Read `[offset, offset+length)` through the uplink, waiting for the
    /// upstream reply (or an existing coalesced request's reply) to arrive.
    pub async fn read(&self, offset: u64, length: u32) -> Result<Bytes, UplinkError> {
        let (tx, rx) = oneshot::channel();
        self.requests_tx
            .send(ReadRequest {
                offset,
                length,
                reply: tx,
            })
            .await
            .map_err(|_| UplinkError::WorkerGone)?;
        rx.await.map_err(|_| UplinkError::WorkerGone)?
    }

    /// Signal the worker to drop pending clients, close its socket, and
    /// unregister from the image (§4.3 "Termination").
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Spawn the uplink worker and its companion RTT probe task for `image`,
/// returning a handle the client-facing server stores on the image state.
pub fn spawn(
    image: Arc<Image>,
    altservers: Arc<AltServerRegistry>,
    config: Arc<Config>,
    integrity: IntegrityHandle,
    allow_private: bool,
) -> UplinkHandle {
    let (requests_tx, requests_rx) = mpsc::channel(DEFAULT_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (verdict_tx, verdict_rx) = mpsc::channel(4);

    tokio::spawn(run_probe_loop(
        altservers.clone(),
        image.name.clone(),
        image.revision,
        image.virtual_size,
        None,
        allow_private,
        verdict_tx,
        shutdown_rx.clone(),
    ));

    let worker = Worker {
        image,
        altservers,
        config,
        integrity,
        queue: UplinkQueue::new(DEFAULT_CAPACITY),
        pending_replies: HashMap::new(),
        in_flight: HashMap::new(),
        socket: None,
        current_host: None,
        next_handle: 1,
        bgr_cursor: 0,
        requests_rx,
        verdict_rx,
        shutdown_rx,
    };
    tokio::spawn(worker.run());

    UplinkHandle {
        requests_tx,
        shutdown_tx,
    }
}

struct Worker {
    image: Arc<Image>,
    altservers: Arc<AltServerRegistry>,
    config: Arc<Config>,
    integrity: IntegrityHandle,

    queue: UplinkQueue,
    /// Handle → the oneshot the client-facing caller is waiting on. Absent
    /// for synthetic background-replication entries.
    pending_replies: HashMap<u64, oneshot::Sender<Result<Bytes, UplinkError>>>,
    /// Handle → `(offset, length, sent_at)` for every upstream `GET_BLOCK`
    /// currently outstanding, cleared on every socket switch/error so a
    /// stale reply from a since-abandoned connection cannot be matched.
    in_flight: HashMap<u64, (u64, u32, Instant)>,

    socket: Option<TcpStream>,
    current_host: Option<Host>,
    next_handle: u64,
    /// Round-robin cursor for background replication's "next still-missing
    /// hash-block" scan.
    bgr_cursor: u64,

    requests_rx: mpsc::Receiver<ReadRequest>,
    verdict_rx: mpsc::Receiver<SwitchVerdict>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        let mut bgr_tick = tokio::time::interval(BACKGROUND_REPLICATION_TICK);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!(image = %self.image.name, "uplink worker shutting down");
                        self.shutdown();
                        break;
                    }
                }

                verdict = self.verdict_rx.recv() => {
                    match verdict {
                        Some(SwitchVerdict::DoChange(host)) => self.switch_to(host).await,
                        Some(_) => {}
                        None => {}
                    }
                }

                req = self.requests_rx.recv() => {
                    match req {
                        Some(req) => self.handle_new_request(req).await,
                        None => {
                            info!(image = %self.image.name, "uplink worker's handle dropped, shutting down");
                            self.shutdown();
                            break;
                        }
                    }
                }

                reply = next_reply(&mut self.socket) => {
                    match reply {
                        Ok((header, payload)) => self.handle_reply(header, payload).await,
                        Err(err) => {
                            warn!(image = %self.image.name, error = %err, "uplink socket error");
                            self.handle_socket_error();
                        }
                    }
                }

                _ = keepalive.tick() => {
                    self.send_keepalive().await;
                }

                _ = bgr_tick.tick() => {
                    self.maybe_background_replicate().await;
                }
            }
        }
    }

    fn alloc_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        handle
    }

    async fn handle_new_request(&mut self, req: ReadRequest) {
        let handle = self.alloc_handle();
        match self.queue.enqueue(handle, handle, req.offset, req.length) {
            Ok(_) => {
                self.pending_replies.insert(handle, req.reply);
                self.flush_new_entries().await;
            }
            Err(_) => {
                let _ = req.reply.send(Err(UplinkError::QueueFull));
            }
        }
    }

    /// Mark every `New` entry `Pending` and send an upstream request for
    /// each one that needs its own (i.e. was not superset-coalesced).
    async fn flush_new_entries(&mut self) {
        let new_entries = self.queue.take_new_entries();
        for entry in new_entries {
            if entry.needs_upstream_request {
                self.send_upstream_request(&entry).await;
            }
        }
    }

    async fn send_upstream_request(&mut self, entry: &QueueEntry) {
        self.in_flight
            .insert(entry.handle, (entry.offset, entry.length, Instant::now()));

        let Some(socket) = self.socket.as_mut() else {
            // No connection yet; this entry stays Pending and is resent by
            // `resend_pending` once `switch_to` establishes one.
            return;
        };

        let request = Request::new_get_block(entry.offset, entry.length, entry.handle);
        let mut buf = BytesMut::new();
        request.encode(&mut buf);

        if let Err(err) = socket.write_all(&buf).await {
            warn!(image = %self.image.name, error = %err, "failed writing upstream request");
            self.handle_socket_error();
        }
    }

    /// Resend every still-`Pending` entry that needs its own upstream
    /// request, unchanged, per §4.3 step 1 ("resend all Pending requests
    /// unchanged").
    async fn resend_pending(&mut self) {
        let pending = self.queue.pending_entries();
        for entry in pending {
            if entry.needs_upstream_request {
                self.send_upstream_request(&entry).await;
            }
        }
    }

    async fn switch_to(&mut self, host: Host) {
        if self.current_host == Some(host) && self.socket.is_some() {
            return;
        }

        info!(image = %self.image.name, %host, "uplink switching upstream server");
        self.socket = None;
        self.in_flight.clear();

        match connect_and_select(host, &self.image.name, self.image.revision, self.image.virtual_size).await {
            Ok(stream) => {
                self.socket = Some(stream);
                self.current_host = Some(host);
                self.resend_pending().await;
            }
            Err(err) => {
                warn!(image = %self.image.name, %host, error = %err, "failed to connect to alt-server");
                self.altservers.report_failure(&host, FAIL_STEP).await;
            }
        }
    }

    async fn handle_reply(&mut self, header: ReplyHeader, payload: Vec<u8>) {
        if header.cmd == CMD_ERROR {
            warn!(image = %self.image.name, handle = header.handle, "upstream returned a protocol error for a request");
            self.in_flight.remove(&header.handle);
            self.handle_socket_error();
            return;
        }
        if header.cmd != CMD_GET_BLOCK {
            return;
        }

        let Some((offset, _length, sent_at)) = self.in_flight.remove(&header.handle) else {
            debug!(image = %self.image.name, handle = header.handle, "reply for unknown/expired handle, ignoring");
            return;
        };

        if let Some(host) = self.current_host {
            let observed = sent_at.elapsed().as_micros() as u32;
            self.altservers.observe_production_rtt(&host, observed).await;
        }

        if let Err(err) = backing::write_range(&self.image, offset, &payload).await {
            warn!(image = %self.image.name, error = %err, "failed writing uplink reply to backing file");
            return;
        }

        let (completed_hash_blocks, became_complete) = {
            let mut state = self.image.state.write().await;
            let completed_hash_blocks = match state.cache_map.as_mut() {
                Some(cache_map) => cache_map.mark(offset, payload.len() as u64, true),
                None => Vec::new(),
            };
            let became_complete = state
                .cache_map
                .as_ref()
                .map(|cache_map| cache_map.is_complete())
                .unwrap_or(false);
            if became_complete {
                // §3: first-time completeness frees the cache-map and
                // unlinks its `.map` sidecar; `cache_map == None` already
                // means "complete" everywhere else in the codebase.
                state.cache_map = None;
                state.completeness_cache = None;
            }
            (completed_hash_blocks, became_complete)
        };
        for hash_block_idx in completed_hash_blocks {
            self.integrity.enqueue(self.image.clone(), hash_block_idx);
        }
        if became_complete {
            info!(image = %self.image.name, "image reached completeness, freeing cache-map");
            let sidecar = backing::sidecar_path(&self.image.path, "map");
            let _ = tokio::fs::remove_file(&sidecar).await;
        }

        let pending_replies = &mut self.pending_replies;
        let reply_len = payload.len() as u32;
        self.queue.dispatch_reply(offset, reply_len, |entry| {
            if let Some(tx) = pending_replies.remove(&entry.handle) {
                let start = (entry.offset - offset) as usize;
                let end = start + entry.length as usize;
                let _ = tx.send(Ok(Bytes::copy_from_slice(&payload[start..end])));
            }
        });
    }

    fn handle_socket_error(&mut self) {
        self.socket = None;
        self.current_host = None;
        self.in_flight.clear();
        // Pending entries are left untouched in the queue; they are resent
        // once the RTT probe hands us another `DoChange` verdict.
    }

    async fn send_keepalive(&mut self) {
        let Some(socket) = self.socket.as_mut() else {
            return;
        };
        let request = Request::new(crate::wire::CMD_KEEPALIVE, 0, 0, 0);
        let mut buf = BytesMut::new();
        request.encode(&mut buf);
        if let Err(err) = socket.write_all(&buf).await {
            warn!(image = %self.image.name, error = %err, "keepalive write failed");
            self.handle_socket_error();
        }
    }

    async fn maybe_background_replicate(&mut self) {
        if !self.config.background_replication {
            return;
        }
        if self.socket.is_none() {
            return;
        }
        if self.queue.len() >= self.queue.capacity() {
            return;
        }
        if self.queue.has_foreground_work(BACKGROUND_CLIENT) {
            return;
        }

        let hash_block_count = self.image.hash_block_count();
        if hash_block_count == 0 {
            return;
        }

        let next_missing = {
            let state = self.image.state.read().await;
            let Some(cache_map) = state.cache_map.as_ref() else {
                return;
            };
            (0..hash_block_count)
                .map(|i| (self.bgr_cursor + i) % hash_block_count)
                .find(|&hb| !cache_map.is_hash_block_complete(hb))
        };

        let Some(hash_block_idx) = next_missing else {
            return;
        };
        self.bgr_cursor = (hash_block_idx + 1) % hash_block_count;

        let offset = hash_block_idx * crate::image::HASH_BLOCK_SIZE;
        let length = (self.image.virtual_size - offset).min(crate::image::HASH_BLOCK_SIZE) as u32;
        let handle = self.alloc_handle();

        if self.queue.enqueue(BACKGROUND_CLIENT, handle, offset, length).is_ok() {
            self.flush_new_entries().await;
        }
    }

    fn shutdown(&mut self) {
        for entry in self.queue.drain_all() {
            if let Some(tx) = self.pending_replies.remove(&entry.handle) {
                let _ = tx.send(Err(UplinkError::WorkerGone));
            }
        }
        self.socket = None;
    }
}

/// Await the next reply on `socket`, or never resolve if there is none —
/// used as one arm of the worker's `select!` so a missing connection simply
/// leaves that wakeup source quiet instead of needing a separate branch.
async fn next_reply(
    socket: &mut Option<TcpStream>,
) -> Result<(ReplyHeader, Vec<u8>), std::io::Error> {
    match socket {
        Some(s) => recv_one_reply(s).await,
        None => std::future::pending().await,
    }
}

async fn recv_one_reply(socket: &mut TcpStream) -> Result<(ReplyHeader, Vec<u8>), std::io::Error> {
    let mut header_buf = [0u8; REPLY_LEN];
    socket.read_exact(&mut header_buf).await?;
    let header = ReplyHeader::decode(&header_buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let mut payload = vec![0u8; header.size as usize];
    if header.size > 0 {
        socket.read_exact(&mut payload).await?;
    }
    Ok((header, payload))
}

/// Connect to `host` and perform the `SELECT_IMAGE` handshake, verifying
/// the upstream confirms the same name/revision/size we expect.
async fn connect_and_select(
    host: Host,
    name: &str,
    revision: u16,
    expected_virtual_size: u64,
) -> std::io::Result<TcpStream> {
    let addr = host.to_socket_addr();
    let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;

    let payload = SelectImagePayload {
        protocol_version: PROTOCOL_VERSION,
        name: name.to_string(),
        revision,
        virtual_size: expected_virtual_size,
    };
    let mut payload_buf = BytesMut::new();
    payload.encode(&mut payload_buf);

    let header = Request::new(CMD_SELECT_IMAGE, 0, payload_buf.len() as u32, 0);
    let mut frame = BytesMut::new();
    header.encode(&mut frame);
    stream.write_all(&frame).await?;
    stream.write_all(&payload_buf).await?;

    let mut reply_header_buf = [0u8; REPLY_LEN];
    stream.read_exact(&mut reply_header_buf).await?;
    let reply_header = ReplyHeader::decode(&reply_header_buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut reply_payload = vec![0u8; reply_header.size as usize];
    stream.read_exact(&mut reply_payload).await?;
    SelectImagePayload::decode(&reply_payload)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_client_sentinel_is_distinguishable_from_real_handles() {
        let mut queue = UplinkQueue::new(DEFAULT_CAPACITY);
        queue.enqueue(1, 1, 0, 4096).unwrap();
        assert!(queue.has_foreground_work(BACKGROUND_CLIENT));

        let mut only_background = UplinkQueue::new(DEFAULT_CAPACITY);
        only_background
            .enqueue(BACKGROUND_CLIENT, 99, 0, 4096)
            .unwrap();
        assert!(!only_background.has_foreground_work(BACKGROUND_CLIENT));
    }

    #[test]
    fn alloc_handle_never_yields_zero() {
        // `next_handle` wraps via `.max(1)` rather than rolling over to 0,
        // since 0 is reserved as a "no handle" sentinel on the wire.
        let handle_after_wrap = u64::MAX.wrapping_add(1).max(1);
        assert_eq!(handle_after_wrap, 1);
    }
}

//! The client-facing TCP listener (§4, §6): accepts connections, decodes
//! wire requests, and serves them from the cache or the uplink.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use bytes::BytesMut;

use dnbd3_networking::Host;

use crate::altserver::AltServerRegistry;
use crate::config::Config;
use crate::image::{backing, ImageRef, ImageRegistry};
use crate::integrity::IntegrityHandle;
use crate::uplink;
use crate::wire::proto::{
    ReplyHeader, Request, WireError, CMD_GET_BLOCK, CMD_GET_CRC32, CMD_GET_SERVERS,
    CMD_KEEPALIVE, CMD_SELECT_IMAGE, PROTOCOL_VERSION, REQUEST_LEN,
};
use crate::wire::select_image::SelectImagePayload;
use crate::wire::servers::encode_servers;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Shared state every per-connection task needs; cheap to clone since it is
/// all `Arc`s.
pub struct Server {
    registry: Arc<ImageRegistry>,
    altservers: Arc<AltServerRegistry>,
    config: Arc<Config>,
    integrity: IntegrityHandle,
}

impl Server {
    pub fn new(
        registry: Arc<ImageRegistry>,
        altservers: Arc<AltServerRegistry>,
        config: Arc<Config>,
        integrity: IntegrityHandle,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            altservers,
            config,
            integrity,
        })
    }

    /// Bind and run the accept loop until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.listen_address).await?;
        info!(address = %self.config.listen_address, "client listener bound");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("client listener shutting down");
                        return Ok(());
                    }
                }

                accepted = listener.accept() => {
                    let (socket, peer) = accepted?;
                    let server = self.clone();
                    let conn_shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(err) = server.handle_connection(socket, peer, conn_shutdown).await {
                            debug!(%peer, error = %err, "client connection ended with an error");
                        }
                    });
                }
            }
        }
    }

    async fn handle_connection(
        &self,
        mut socket: TcpStream,
        peer: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ServerError> {
        socket.set_nodelay(true).ok();
        let peer_host = Host::from_socket_addr(peer);
        let mut selected: Option<ImageRef> = None;

        let result = loop {
            let read = tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break Ok(());
                    }
                    continue;
                }
                read = timeout(self.config.client_timeout, read_request(&mut socket)) => read,
            };

            let (request, payload) = match read {
                Ok(Ok(frame)) => frame,
                Ok(Err(_)) => break Ok(()),
                Err(_) => {
                    debug!(%peer, "client connection idle timeout");
                    break Ok(());
                }
            };

            let outcome = self
                .dispatch(&request, payload, &peer_host, &mut selected, &mut socket)
                .await;

            if let Err(err) = outcome {
                warn!(%peer, error = %err, "error serving client request");
                break Err(err);
            }
        };

        if let Some(image_ref) = selected {
            self.registry.release(image_ref).await;
        }
        result
    }

    async fn dispatch(
        &self,
        request: &Request,
        payload: Vec<u8>,
        peer_host: &Host,
        selected: &mut Option<ImageRef>,
        socket: &mut TcpStream,
    ) -> Result<(), ServerError> {
        match request.cmd {
            CMD_SELECT_IMAGE => self.handle_select_image(request, &payload, selected, socket).await,
            CMD_GET_BLOCK => self.handle_get_block(request, selected, socket).await,
            CMD_GET_SERVERS => self.handle_get_servers(request, peer_host, socket).await,
            CMD_GET_CRC32 => self.handle_get_crc32(request, selected, socket).await,
            CMD_KEEPALIVE => send_reply(socket, &ReplyHeader::keepalive(), &[]).await,
            _ => send_reply(socket, &ReplyHeader::error(request.handle), &[]).await,
        }
    }

    async fn handle_select_image(
        &self,
        request: &Request,
        payload: &[u8],
        selected: &mut Option<ImageRef>,
        socket: &mut TcpStream,
    ) -> Result<(), ServerError> {
        let decoded = match SelectImagePayload::decode(payload) {
            Ok(p) => p,
            Err(_) => return send_reply(socket, &ReplyHeader::error(request.handle), &[]).await,
        };

        match self.registry.get_or_load(&decoded.name, decoded.revision).await {
            Ok(image_ref) => {
                let confirm = SelectImagePayload {
                    protocol_version: PROTOCOL_VERSION,
                    name: image_ref.name.clone(),
                    revision: image_ref.revision,
                    virtual_size: image_ref.virtual_size,
                };
                let mut buf = BytesMut::new();
                confirm.encode(&mut buf);

                if let Some(previous) = selected.replace(image_ref) {
                    self.registry.release(previous).await;
                }

                send_reply(socket, &ReplyHeader::new(CMD_SELECT_IMAGE, buf.len() as u32, request.handle), &buf).await
            }
            Err(err) => {
                debug!(name = %decoded.name, revision = decoded.revision, error = %err, "select-image failed");
                send_reply(socket, &ReplyHeader::error(request.handle), &[]).await
            }
        }
    }

    async fn handle_get_block(
        &self,
        request: &Request,
        selected: &mut Option<ImageRef>,
        socket: &mut TcpStream,
    ) -> Result<(), ServerError> {
        let Some(image_ref) = selected.as_ref() else {
            return send_reply(socket, &ReplyHeader::error(request.handle), &[]).await;
        };

        let offset = request.byte_offset();
        let length = request.size;
        if length > crate::wire::proto::MAX_PAYLOAD || offset + length as u64 > image_ref.virtual_size {
            return send_reply(socket, &ReplyHeader::error(request.handle), &[]).await;
        }

        {
            let mut state = image_ref.state.write().await;
            state.last_access = std::time::Instant::now();
        }

        // `cache_map == None` means the image has already reached
        // completeness (§3) and every range is servable locally, so the
        // absent case reads as "fully present", not "nothing present".
        let cached = {
            let state = image_ref.state.read().await;
            state
                .cache_map
                .as_ref()
                .map(|map| map.is_range_present(offset, length))
                .unwrap_or(true)
        };

        let data = if cached {
            backing::read_range(image_ref, offset, length).await?
        } else {
            match self.ensure_uplink(image_ref).await {
                Some(uplink) => match uplink.read(offset, length).await {
                    Ok(bytes) => bytes.to_vec(),
                    Err(err) => {
                        debug!(image = %image_ref.name, error = %err, "uplink read failed");
                        return send_reply(socket, &ReplyHeader::error(request.handle), &[]).await;
                    }
                },
                None => return send_reply(socket, &ReplyHeader::error(request.handle), &[]).await,
            }
        };

        send_reply(socket, &ReplyHeader::new(CMD_GET_BLOCK, data.len() as u32, request.handle), &data).await
    }

    async fn handle_get_servers(
        &self,
        request: &Request,
        peer_host: &Host,
        socket: &mut TcpStream,
    ) -> Result<(), ServerError> {
        let hosts = self.altservers.list_for_client(peer_host).await;
        let payload = encode_servers(&hosts);
        send_reply(socket, &ReplyHeader::new(CMD_GET_SERVERS, payload.len() as u32, request.handle), &payload).await
    }

    async fn handle_get_crc32(
        &self,
        request: &Request,
        selected: &mut Option<ImageRef>,
        socket: &mut TcpStream,
    ) -> Result<(), ServerError> {
        let Some(image_ref) = selected.as_ref() else {
            return send_reply(socket, &ReplyHeader::error(request.handle), &[]).await;
        };

        let manifest_bytes = {
            let state = image_ref.state.read().await;
            state.manifest.as_ref().map(|m| m.to_bytes())
        };

        match manifest_bytes {
            Some(bytes) => {
                send_reply(socket, &ReplyHeader::new(CMD_GET_CRC32, bytes.len() as u32, request.handle), &bytes).await
            }
            None => send_reply(socket, &ReplyHeader::error(request.handle), &[]).await,
        }
    }

    /// Lazily spawn the uplink worker for an image the first time it is
    /// needed, storing the handle on `ImageState` for reuse. Returns `None`
    /// in non-proxy mode, where a cache miss is simply unserviceable.
    async fn ensure_uplink(&self, image_ref: &ImageRef) -> Option<uplink::UplinkHandle> {
        if !self.config.is_proxy {
            return None;
        }

        let mut state = image_ref.state.write().await;
        if let Some(handle) = state.uplink.clone() {
            return Some(handle);
        }

        // Our own replication uplink is always allowed to use private
        // alt-servers — "private" only means "never advertised to clients"
        // (§4.4), not "never used for replication".
        let handle = uplink::spawn(
            image_ref.image().clone(),
            self.altservers.clone(),
            self.config.clone(),
            self.integrity.clone(),
            true,
        );
        state.uplink = Some(handle.clone());
        Some(handle)
    }
}

async fn read_request(socket: &mut TcpStream) -> std::io::Result<(Request, Vec<u8>)> {
    let mut header_buf = [0u8; REQUEST_LEN];
    socket.read_exact(&mut header_buf).await?;
    let request = Request::decode(&header_buf).map_err(wire_to_io)?;

    if request.size > crate::wire::proto::MAX_PAYLOAD {
        return Err(wire_to_io(WireError::PayloadTooLarge(request.size)));
    }

    let mut payload = vec![0u8; request.size as usize];
    if request.size > 0 {
        socket.read_exact(&mut payload).await?;
    }
    Ok((request, payload))
}

async fn send_reply(socket: &mut TcpStream, header: &ReplyHeader, payload: &[u8]) -> Result<(), ServerError> {
    let mut buf = BytesMut::new();
    header.encode(&mut buf);
    socket.write_all(&buf).await?;
    if !payload.is_empty() {
        socket.write_all(payload).await?;
    }
    Ok(())
}

fn wire_to_io(err: WireError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_get_block_is_rejected_before_touching_disk() {
        let request = Request::new_get_block(0, crate::wire::proto::MAX_PAYLOAD + 1, 1);
        assert!(request.size > crate::wire::proto::MAX_PAYLOAD);
    }
}

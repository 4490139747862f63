//! Connection gateway: one listener per registered protocol decoder, a
//! per-connection receive-buffer actor driving incremental `decode` calls,
//! and the online-devices registry the command queue drains against.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, RwLock};
use tokio_graceful_shutdown::SubsystemHandle;

use fleetlink_core::position::{ClientInfo, DecodeOutcome, Transport};
use fleetlink_core::ProtocolDecoder;

use crate::command_queue;
use crate::error::ServerError;
use crate::processor::Processor;

/// Frames with no message boundary past this many unconsumed bytes are
/// dropped rather than grown forever (spec's 8 KiB ceiling, used here as
/// the default any decoder can override via `max_buffer_size`).
const MAX_IDLE_BUFFER: usize = 8 * 1024;

/// A bound connection the command queue can write to.
#[derive(Clone)]
pub struct ConnectionHandle {
    tx: mpsc::Sender<Vec<u8>>,
}

impl ConnectionHandle {
    /// Queues bytes for the connection's writer task. Returns `false` if
    /// the connection has already gone away.
    pub fn write(&self, bytes: Vec<u8>) -> bool {
        self.tx.try_send(bytes).is_ok()
    }
}

/// IMEI to bound connection. A new login for an IMEI already present
/// supersedes the old entry without forcibly closing the prior connection
/// (it is left to its own read-timeout path, matching the gateway
/// invariant that this map is the sole source of truth for "can we push
/// to this device right now").
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<String, ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn bind(&self, imei: String, handle: ConnectionHandle) {
        self.inner.write().await.insert(imei, handle);
    }

    pub async fn unbind(&self, imei: &str) {
        self.inner.write().await.remove(imei);
    }

    pub async fn get(&self, imei: &str) -> Option<ConnectionHandle> {
        self.inner.read().await.get(imei).cloned()
    }
}

/// Runs every registered decoder's listener as a sibling subsystem under
/// `subsystem`, following the teacher's `Session::new` pattern of spawning
/// one named `SubsystemBuilder` per independent long-running loop.
pub async fn run_gateways(
    subsystem: &SubsystemHandle,
    bind_host: &str,
    read_timeout: Duration,
    decoders: Vec<Box<dyn ProtocolDecoder>>,
    processor: Arc<Processor>,
    registry: ConnectionRegistry,
) {
    for decoder in decoders {
        let decoder: Arc<dyn ProtocolDecoder> = Arc::from(decoder);
        let bind_host = bind_host.to_string();
        let processor = processor.clone();
        let registry = registry.clone();
        let name = decoder.name().to_string();

        match decoder.transport() {
            Transport::Tcp => {
                subsystem.start(tokio_graceful_shutdown::SubsystemBuilder::new(
                    name,
                    move |subsys| {
                        run_tcp_listener(subsys, bind_host, decoder, processor, registry, read_timeout)
                    },
                ));
            }
            Transport::Udp => {
                subsystem.start(tokio_graceful_shutdown::SubsystemBuilder::new(
                    name,
                    move |subsys| run_udp_listener(subsys, bind_host, decoder, processor),
                ));
            }
        }
    }
}

async fn run_tcp_listener(
    subsys: SubsystemHandle,
    bind_host: String,
    decoder: Arc<dyn ProtocolDecoder>,
    processor: Arc<Processor>,
    registry: ConnectionRegistry,
    read_timeout: Duration,
) -> Result<(), ServerError> {
    let addr = format!("{}:{}", bind_host, decoder.port());
    let listener = TcpListener::bind(&addr).await?;
    log::info!("{} listening on {addr} (tcp)", decoder.name());

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = accepted?;
                let client = ClientInfo {
                    ip: peer.ip().to_string(),
                    port: peer.port(),
                };
                let decoder = decoder.clone();
                let processor = processor.clone();
                let registry = registry.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(socket, client, decoder, processor, registry, read_timeout).await {
                        log::warn!("connection closed with error: {err}");
                    }
                });
            }
            _ = subsys.on_shutdown_requested() => {
                log::info!("{} listener shutting down", decoder.name());
                return Ok(());
            }
        }
    }
}

async fn handle_connection(
    mut socket: tokio::net::TcpStream,
    client: ClientInfo,
    decoder: Arc<dyn ProtocolDecoder>,
    processor: Arc<Processor>,
    registry: ConnectionRegistry,
    read_timeout: Duration,
) -> Result<(), ServerError> {
    let mut buf = BytesMut::with_capacity(1024);
    let mut known_imei: Option<String> = None;
    let (write_tx, mut write_rx) = mpsc::channel::<Vec<u8>>(16);
    let max_buffer = decoder.max_buffer_size().max(MAX_IDLE_BUFFER);

    loop {
        let mut chunk = [0u8; 4096];
        tokio::select! {
            outgoing = write_rx.recv() => {
                let Some(bytes) = outgoing else { continue };
                if socket.write_all(&bytes).await.is_err() {
                    break;
                }
                continue;
            }
            read = tokio::time::timeout(read_timeout, socket.read(&mut chunk)) => {
                let n = match read {
                    Ok(Ok(0)) | Err(_) => break,
                    Ok(Ok(n)) => n,
                    Ok(Err(_)) => break,
                };
                buf.extend_from_slice(&chunk[..n]);

                loop {
                    let (outcome, consumed) =
                        decoder.decode(&buf, &client, known_imei.as_deref());
                    if consumed == 0 {
                        break;
                    }
                    buf.advance(consumed);

                    if let Some(imei) = handle_outcome(&outcome, &processor, &mut socket).await? {
                        known_imei = Some(imei.clone());
                        registry
                            .bind(imei, ConnectionHandle { tx: write_tx.clone() })
                            .await;
                        if let Some(imei) = &known_imei {
                            drain_commands(&processor, decoder.as_ref(), imei, &write_tx).await;
                        }
                    }

                    if buf.is_empty() {
                        break;
                    }
                }

                if buf.len() > max_buffer {
                    log::warn!(
                        "{} connection from {} exceeded {max_buffer} bytes with no frame boundary, flushing",
                        decoder.name(),
                        client.ip
                    );
                    buf.clear();
                }
            }
        }
    }

    if let Some(imei) = known_imei {
        registry.unbind(&imei).await;
    }
    Ok(())
}

/// Applies a single decode outcome: persists any position(s) via the
/// processor and writes back any ACK bytes. Returns the IMEI to bind the
/// connection to, if this frame carried one.
async fn handle_outcome(
    outcome: &DecodeOutcome,
    processor: &Arc<Processor>,
    socket: &mut tokio::net::TcpStream,
) -> Result<Option<String>, ServerError> {
    match outcome {
        DecodeOutcome::None => Ok(None),
        DecodeOutcome::Position(position) => {
            let imei = position.imei.clone();
            processor.process(position.clone()).await?;
            Ok(Some(imei))
        }
        DecodeOutcome::Control(event) => {
            if let Some(bytes) = &event.response_bytes {
                let _ = socket.write_all(bytes).await;
            }
            if let Some(position) = &event.position {
                processor.process(position.clone()).await?;
            }
            for extra in &event.extra_positions {
                processor.process(extra.clone()).await?;
            }
            Ok(event.imei.clone())
        }
    }
}

async fn drain_commands(
    processor: &Arc<Processor>,
    decoder: &dyn ProtocolDecoder,
    imei: &str,
    write_tx: &mpsc::Sender<Vec<u8>>,
) {
    let Ok(Some(device)) = processor.store().find_device_by_imei(imei).await else {
        return;
    };
    let write_tx = write_tx.clone();
    let write = move |bytes: &[u8]| write_tx.try_send(bytes.to_vec()).is_ok();
    if let Err(err) = command_queue::drain_pending(processor.store(), decoder, device.id, write).await {
        log::warn!("command drain failed for device {}: {err}", device.id);
    }
}

async fn run_udp_listener(
    subsys: SubsystemHandle,
    bind_host: String,
    decoder: Arc<dyn ProtocolDecoder>,
    processor: Arc<Processor>,
) -> Result<(), ServerError> {
    let addr = format!("{}:{}", bind_host, decoder.port());
    let socket = UdpSocket::bind(&addr).await?;
    log::info!("{} listening on {addr} (udp)", decoder.name());

    let mut buf = [0u8; 4096];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (n, peer) = received?;
                let client = ClientInfo {
                    ip: peer.ip().to_string(),
                    port: peer.port(),
                };
                let (outcome, _consumed) = decoder.decode(&buf[..n], &client, None);
                if let Err(err) = process_udp_outcome(&outcome, &processor).await {
                    log::warn!("{} datagram from {} failed: {err}", decoder.name(), client.ip);
                }
            }
            _ = subsys.on_shutdown_requested() => {
                log::info!("{} listener shutting down", decoder.name());
                return Ok(());
            }
        }
    }
}

async fn process_udp_outcome(
    outcome: &DecodeOutcome,
    processor: &Arc<Processor>,
) -> Result<(), ServerError> {
    match outcome {
        DecodeOutcome::None => Ok(()),
        DecodeOutcome::Position(position) => processor.process(position.clone()).await,
        DecodeOutcome::Control(event) => {
            if let Some(position) = &event.position {
                processor.process(position.clone()).await?;
            }
            for extra in &event.extra_positions {
                processor.process(extra.clone()).await?;
            }
            Ok(())
        }
    }
}

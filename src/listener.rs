use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{error, info, warn};

use crate::alerts::AlertSink;
use crate::bufpool::BufferPool;
use crate::pipeline::batch::Message;
use crate::pipeline::batcher::{BatcherError, BatcherHandle};
use crate::stats::ProxyStats;

/// Read deadline per socket read, so shutdown is observed promptly.
const READ_DEADLINE: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("invalid bind address {address}: {reason}")]
    Address { address: String, reason: String },

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct ListenerBinding {
    pub port: u16,
    pub dataset_id: String,
    pub tenant_id: String,
}

/// One UDP reader task per configured port. Each task owns its socket and
/// tags every accepted datagram with the binding's tenant and dataset.
pub struct ListenerPool {
    host: String,
    read_buffer_size: usize,
    bindings: Vec<ListenerBinding>,
    buffers: Arc<BufferPool>,
    ingress: BatcherHandle,
    stats: Arc<ProxyStats>,
    alerts: Arc<dyn AlertSink>,
    shutdown: Arc<AtomicBool>,
}

impl ListenerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        host: String,
        read_buffer_size: usize,
        bindings: Vec<ListenerBinding>,
        buffers: Arc<BufferPool>,
        ingress: BatcherHandle,
        stats: Arc<ProxyStats>,
        alerts: Arc<dyn AlertSink>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            host,
            read_buffer_size,
            bindings,
            buffers,
            ingress,
            stats,
            alerts,
            shutdown,
        }
    }

    /// Bind every configured port and spawn its reader loop. Any bind
    /// failure aborts startup.
    pub fn start(&self) -> Result<Vec<tokio::task::JoinHandle<()>>, ListenerError> {
        let mut handles = Vec::with_capacity(self.bindings.len());

        for binding in &self.bindings {
            let socket = bind_udp_socket(&self.host, binding.port, self.read_buffer_size)?;
            info!(
                port = binding.port,
                dataset = %binding.dataset_id,
                "UDP listener bound"
            );

            let reader = ListenerTask {
                socket,
                binding: binding.clone(),
                buffers: Arc::clone(&self.buffers),
                ingress: self.ingress.clone(),
                stats: Arc::clone(&self.stats),
                alerts: Arc::clone(&self.alerts),
                shutdown: Arc::clone(&self.shutdown),
            };
            handles.push(tokio::spawn(reader.run()));
        }

        Ok(handles)
    }
}

struct ListenerTask {
    socket: UdpSocket,
    binding: ListenerBinding,
    buffers: Arc<BufferPool>,
    ingress: BatcherHandle,
    stats: Arc<ProxyStats>,
    alerts: Arc<dyn AlertSink>,
    shutdown: Arc<AtomicBool>,
}

impl ListenerTask {
    async fn run(self) {
        info!(
            port = self.binding.port,
            dataset = %self.binding.dataset_id,
            "UDP listener started"
        );

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            let mut buf = self.buffers.acquire();
            match tokio::time::timeout(READ_DEADLINE, self.socket.recv_from(&mut buf)).await {
                // Deadline: expected, lets the loop observe shutdown.
                Err(_) => {
                    self.buffers.release(buf);
                }
                Ok(Err(e)) => {
                    self.buffers.release(buf);
                    if self.shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    error!(port = self.binding.port, error = %e, "UDP read error");
                    self.stats.record_message_error();
                    self.alerts.critical(
                        "UDP listener failure",
                        "A UDP listener hit a socket read error",
                        &format!("Port: {}, Error: {e}", self.binding.port),
                    );
                }
                Ok(Ok((len, peer))) => {
                    self.handle_datagram(&buf[..len], peer);
                    self.buffers.release(buf);
                }
            }
        }

        info!(port = self.binding.port, "UDP listener stopped");
    }

    fn handle_datagram(&self, data: &[u8], peer: SocketAddr) {
        let payload = sanitize(data);
        if payload.is_empty() {
            return;
        }

        let bytes = payload.len() as u64;
        let message = Message {
            payload: payload.to_vec(),
            source: peer.to_string(),
            received_at: Utc::now(),
            tenant_id: self.binding.tenant_id.clone(),
            dataset_id: self.binding.dataset_id.clone(),
        };

        match self.ingress.try_send(message) {
            Ok(()) => {
                self.stats.record_message(bytes);
            }
            Err(BatcherError::Full) => {
                warn!(
                    port = self.binding.port,
                    peer = %peer,
                    "ingress channel full, dropping datagram"
                );
                self.stats.record_message_error();
            }
            Err(BatcherError::Closed) => {
                // Shutdown path; the loop exits on the next iteration.
                self.stats.record_message_error();
            }
        }
    }
}

/// Bind a nonblocking UDP socket with the receive buffer raised to the
/// configured size. A kernel refusing the buffer size is logged, not fatal.
fn bind_udp_socket(host: &str, port: u16, read_buffer_size: usize) -> Result<UdpSocket, ListenerError> {
    let address = format!("{host}:{port}");
    let addr: SocketAddr = address.parse().map_err(|e| ListenerError::Address {
        address: address.clone(),
        reason: format!("{e}"),
    })?;

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let bind = |addr: SocketAddr| -> std::io::Result<UdpSocket> {
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        if let Err(e) = socket.set_recv_buffer_size(read_buffer_size) {
            warn!(
                requested = read_buffer_size,
                error = %e,
                "failed to set UDP SO_RCVBUF"
            );
        }
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;
        UdpSocket::from_std(socket.into())
    };

    bind(addr).map_err(|e| ListenerError::Bind {
        address,
        source: e,
    })
}

/// Strip surrounding whitespace, then any leading or trailing 0x00 and
/// 0x08 bytes some agents pad datagrams with.
pub fn sanitize(data: &[u8]) -> &[u8] {
    let trimmed = data.trim_ascii();
    let start = trimmed
        .iter()
        .position(|&b| b != 0x00 && b != 0x08)
        .unwrap_or(trimmed.len());
    let end = trimmed
        .iter()
        .rposition(|&b| b != 0x00 && b != 0x08)
        .map(|i| i + 1)
        .unwrap_or(start);
    &trimmed[start..end]
}

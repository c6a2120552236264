use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::debug;

const RECV_BUFFER_SIZE: usize = 4096;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("timeout")]
    Timeout,

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// One request/response exchange over a connectionless transport.
///
/// A transport is created for one worker pool (a round or a scan chunk) and
/// dropped once the pool drains, so nothing is shared across pools.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn exchange(
        &self,
        server: SocketAddr,
        query: &[u8],
        wait: Duration,
    ) -> Result<Vec<u8>, TransportError>;
}

/// UDP transport that recycles bound sockets between exchanges.
pub struct UdpTransport {
    idle_v4: Mutex<Vec<UdpSocket>>,
    idle_v6: Mutex<Vec<UdpSocket>>,
    max_idle: usize,
}

impl UdpTransport {
    pub fn new(max_idle: usize) -> Self {
        Self {
            idle_v4: Mutex::new(Vec::new()),
            idle_v6: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    pub async fn idle_sockets(&self) -> usize {
        self.idle_v4.lock().await.len() + self.idle_v6.lock().await.len()
    }

    fn pool_for(&self, server: SocketAddr) -> &Mutex<Vec<UdpSocket>> {
        if server.is_ipv4() {
            &self.idle_v4
        } else {
            &self.idle_v6
        }
    }

    async fn acquire(&self, server: SocketAddr) -> std::io::Result<UdpSocket> {
        if let Some(socket) = self.pool_for(server).lock().await.pop() {
            return Ok(socket);
        }
        let bind_addr = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        UdpSocket::bind(bind_addr).await
    }

    async fn release(&self, server: SocketAddr, socket: UdpSocket) {
        let mut idle = self.pool_for(server).lock().await;
        if idle.len() < self.max_idle {
            idle.push(socket);
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn exchange(
        &self,
        server: SocketAddr,
        query: &[u8],
        wait: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let socket = self.acquire(server).await?;
        socket.send_to(query, server).await?;

        let deadline = Instant::now() + wait;
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.release(server, socket).await;
                return Err(TransportError::Timeout);
            }

            match timeout(remaining, socket.recv_from(&mut buf)).await {
                Ok(Ok((n, source))) => {
                    // Late answers to an earlier exchange on a recycled socket
                    // carry another transaction ID
                    if source != server || n < 2 || query.get(..2) != Some(&buf[..2]) {
                        debug!("ignoring {} stray bytes from {}", n, source);
                        continue;
                    }
                    buf.truncate(n);
                    self.release(server, socket).await;
                    return Ok(buf);
                }
                Ok(Err(e)) => return Err(TransportError::Io(e)),
                Err(_) => {
                    self.release(server, socket).await;
                    return Err(TransportError::Timeout);
                }
            }
        }
    }
}

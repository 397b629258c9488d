//! TCP transport: one side listens, the other connects.

use super::Duplex;
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

/// Bound socket waiting for a single peer.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        tracing::info!("Listening on {}", inner.local_addr()?);
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub async fn accept(&self) -> io::Result<Duplex> {
        let (stream, peer) = self.inner.accept().await?;
        tracing::info!("Accepted connection from {}", peer);
        Ok(into_duplex(stream, peer))
    }
}

/// Bind `addr` and wait for exactly one peer.
pub async fn listen(addr: impl ToSocketAddrs) -> io::Result<Duplex> {
    Listener::bind(addr).await?.accept().await
}

pub async fn connect(addr: impl ToSocketAddrs) -> io::Result<Duplex> {
    let stream = TcpStream::connect(addr).await?;
    let peer = stream.peer_addr()?;
    tracing::info!("Connected to {}", peer);
    Ok(into_duplex(stream, peer))
}

fn into_duplex(stream: TcpStream, peer: SocketAddr) -> Duplex {
    // Small control frames (OFFER, END, DONE) should not wait on Nagle.
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("Failed to set TCP_NODELAY: {}", e);
    }
    let (reader, writer) = stream.into_split();
    Duplex::new(reader, writer, peer.to_string())
}

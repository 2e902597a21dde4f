//! WebSocket server
//!
//! Accepts TCP connections, performs the WebSocket handshake on the
//! configured path and hands each client to the [`Hub`].

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::connection::ClientSink;
use crate::hub::Hub;
use crate::protocol::ServerMessage;
use crate::transport::WsSink;

pub struct Server {
    hub: Arc<Hub>,
    listener: TcpListener,
}

impl Server {
    /// Bind the listener on `server.bind`
    pub async fn bind(hub: Arc<Hub>) -> io::Result<Self> {
        let listener = TcpListener::bind(hub.config().server.bind).await?;
        Ok(Self { hub, listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept clients until `signal` resolves, then shut the hub down.
    pub async fn run_until<F>(self, signal: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            "WebSocket listening on {} (path: {})",
            self.local_addr()?,
            self.hub.config().server.ws_path
        );
        tokio::pin!(signal);

        loop {
            tokio::select! {
                biased;

                _ = &mut signal => {
                    info!("Shutdown signal received");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("New TCP connection from {}", addr);
                        let hub = self.hub.clone();
                        tokio::spawn(handle_client(hub, stream, addr));
                    }
                    Err(e) => {
                        error!("Failed to accept TCP connection: {}", e);
                    }
                },
            }
        }

        drop(self.listener);
        self.hub.shutdown().await;
        Ok(())
    }
}

async fn handle_client(hub: Arc<Hub>, stream: TcpStream, addr: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
    }

    let config = hub.config();
    let (sink, inbound) = match WsSink::accept_with_path(
        stream,
        &config.server.ws_path,
        config.limits.max_message_size,
    )
    .await
    {
        Ok(split) => split,
        Err(e) => {
            debug!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    let sink = Arc::new(sink);
    match hub.connect(sink.clone(), Some(addr)) {
        Ok(conn) => {
            let end = hub.serve(conn, inbound).await;
            debug!("Session for {} ended: {}", addr, end);
        }
        Err(e) => {
            if let Ok(text) = ServerMessage::error(e.to_string()).to_text() {
                let _ = sink.send(&text).await;
            }
            sink.close().await;
        }
    }
}

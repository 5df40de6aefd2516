//! Convenience wiring for running a [`Connection`] over a real TCP socket.
//!
//! This module owns no retry, backoff, TLS, or reconnection policy — establishing and
//! re-establishing the socket is the caller's job, same as [`crate::transport::Transport`]
//! already requires. What it adds is a background writer task (so [`Transport::send_bytes`]
//! can stay synchronous) and a [`ReadLoop`] that feeds inbound bytes into the connection.
use std::collections::HashMap;
use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, Mutex};
use std::sync::Arc;
#[cfg(feature = "tracing")]
use tracing::Level;

use crate::action::{ActionFields, Pending};
use crate::channel::ChannelRef;
use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::error::AmiError;
use crate::handler::ConnectionHandler;
use crate::message::Headers;
use crate::transport::Transport;

/// A [`Transport`] that queues bytes onto a background task writing to a `TcpStream`'s write
/// half, so [`Connection`] never blocks on the network inside [`Transport::send_bytes`].
pub struct TcpTransport {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}
impl Transport for TcpTransport {
    fn send_bytes(&mut self, bytes: &[u8]) {
        let _ = self.outbound.send(bytes.to_vec());
    }
    fn close(&mut self) {
        // Dropping the sender ends the writer task's loop; the socket itself closes when
        // `ReadLoop` finishes or is dropped.
    }
}

/// A shared handle onto a [`Connection`] running over a live socket. Cheaply cloneable; every
/// method briefly locks the underlying connection, mirroring how [`ReadLoop::run`] does the
/// same to deliver inbound bytes.
#[derive(Clone)]
pub struct TcpConnection {
    inner: Arc<Mutex<Connection<TcpTransport>>>,
}
impl TcpConnection {
    pub async fn banner(&self) -> Option<String> {
        self.inner.lock().await.banner().map(str::to_owned)
    }

    pub async fn channel(&self, name: &str) -> Option<ChannelRef> {
        self.inner.lock().await.registry().get(name)
    }

    pub async fn send_action(&self, name: &str, fields: ActionFields) -> Pending<(Headers, Option<String>)> {
        self.inner.lock().await.send_action(name, fields)
    }

    pub async fn login_md5(&self, username: &str, secret: &str) -> Pending<()> {
        self.inner.lock().await.login_md5(username, secret)
    }

    pub async fn login_plain(&self, username: &str, secret: &str) -> Pending<()> {
        self.inner.lock().await.login_plain(username, secret)
    }

    pub async fn originate_channel_exten_priority(
        &self,
        channel: &str,
        context: &str,
        exten: &str,
        priority: i32,
        caller_id: Option<&str>,
    ) -> Pending<Headers> {
        self.inner
            .lock()
            .await
            .originate_channel_exten_priority(channel, context, exten, priority, caller_id)
    }

    pub async fn originate_async_agi(&self, channel: &str, caller_id: Option<&str>) -> Pending<(ChannelRef, HashMap<String, String>)> {
        self.inner.lock().await.originate_async_agi(channel, caller_id)
    }

    pub async fn send_agi(&self, channel_name: &str, command: &str) -> Result<Pending<(i32, HashMap<String, String>)>, AmiError> {
        self.inner.lock().await.send_agi(channel_name, command)
    }

    pub async fn disconnect(&self) {
        self.inner.lock().await.disconnect();
    }
}

/// Reads bytes off the socket and feeds them into the shared [`Connection`] until the peer
/// closes the stream or a fatal protocol error drops it.
pub struct ReadLoop {
    inner: Arc<Mutex<Connection<TcpTransport>>>,
    read_half: OwnedReadHalf,
}
impl ReadLoop {
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self), level = Level::DEBUG))]
    pub async fn run(mut self) -> Result<(), AmiError> {
        let mut buf = [0u8; 4096];
        loop {
            let n = self.read_half.read(&mut buf).await.map_err(AmiError::Io)?;
            if n == 0 {
                #[cfg(feature = "tracing")]
                tracing::debug!("peer closed the AMI socket");
                return Ok(());
            }
            self.inner.lock().await.bytes_received(&buf[..n]).await?;
        }
    }
}

/// Connect to `addr`, returning a [`TcpConnection`] handle for sending actions and a
/// [`ReadLoop`] the caller must `.run()` (typically via `tokio::spawn`) to actually receive
/// anything. Nothing happens on the wire until the read loop is driven.
pub async fn connect(
    addr: impl ToSocketAddrs,
    connection_handler: Arc<dyn ConnectionHandler>,
    config: ConnectionConfig,
) -> io::Result<(TcpConnection, ReadLoop)> {
    let stream = TcpStream::connect(addr).await?;
    let (read_half, mut write_half) = stream.into_split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::spawn(async move {
        while let Some(bytes) = outbound_rx.recv().await {
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });
    let transport = TcpTransport { outbound: outbound_tx };
    let inner = Arc::new(Mutex::new(Connection::new(transport, connection_handler, config)));
    Ok((
        TcpConnection { inner: inner.clone() },
        ReadLoop { inner, read_half },
    ))
}

//! TCP/IP port forwarding: listeners bound on behalf of the peer,
//! feeding `forwarded-tcpip` channels, plus the small agent/X11
//! forwarding subordinates closed alongside them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::channel::{Channel, ChannelMsg};
use crate::connection::ChannelOpener;
use crate::{Error, Outcome};

struct ListenerHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Listen sockets bound for `tcpip-forward` requests, keyed by the
/// address they actually bound (port 0 in a request means OS-assigned).
#[derive(Default)]
pub struct TcpipForwarder {
    bound: HashMap<SocketAddr, ListenerHandle>,
}

impl TcpipForwarder {
    pub fn new() -> TcpipForwarder {
        TcpipForwarder::default()
    }

    /// Bind a listener for the peer. Every accepted connection opens a
    /// `forwarded-tcpip` channel back through `opener` and pumps bytes
    /// both ways. Returns the address actually bound.
    pub async fn local_port_forwarding_requested(
        &mut self,
        address: &str,
        port: u16,
        opener: ChannelOpener,
    ) -> Result<SocketAddr, Error> {
        // An empty bind address means "all interfaces" (RFC 4254 §7.1).
        let bind_host = if address.is_empty() { "0.0.0.0" } else { address };
        let listener = TcpListener::bind((bind_host, port)).await?;
        let bound = listener.local_addr()?;
        debug!("tcpip-forward: listening on {bound}");

        let (shutdown, shutdown_rx) = oneshot::channel();
        let advertised = address.to_string();
        let task = tokio::spawn(accept_loop(listener, opener, advertised, bound, shutdown_rx));
        self.bound.insert(bound, ListenerHandle { shutdown, task });
        Ok(bound)
    }

    /// Stop and unregister the listener matching this cancellation.
    /// Returns whether anything was bound there.
    pub async fn cancel(&mut self, address: &str, port: u16) -> bool {
        let key = self.bound.keys().copied().find(|a| {
            a.port() == port
                && match address.parse::<std::net::IpAddr>() {
                    Ok(ip) => a.ip() == ip || a.ip().is_unspecified(),
                    Err(_) => true,
                }
        });
        let Some(key) = key else {
            return false;
        };
        if let Some(handle) = self.bound.remove(&key) {
            debug!("tcpip-forward: cancelling {key}");
            let _ = handle.shutdown.send(());
            handle.task.abort();
        }
        true
    }

    /// Stop every listener.
    pub async fn close(&mut self) {
        for (addr, handle) in self.bound.drain() {
            debug!("tcpip-forward: closing {addr}");
            let _ = handle.shutdown.send(());
            handle.task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    opener: ChannelOpener,
    advertised: String,
    bound: SocketAddr,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(x) => x,
                    Err(e) => {
                        warn!("tcpip-forward: accept on {bound} failed: {e:?}");
                        break;
                    }
                };
                debug!("tcpip-forward: connection from {peer} on {bound}");
                let opened = opener.open("forwarded-tcpip", |b| {
                    b.put_str(&advertised);
                    b.put_u32(u32::from(bound.port()));
                    b.put_str(&peer.ip().to_string());
                    b.put_u32(u32::from(peer.port()));
                });
                match opened {
                    Ok((channel, msgs)) => {
                        tokio::spawn(pump(stream, channel, msgs));
                    }
                    Err(e) => {
                        warn!("tcpip-forward: could not open channel: {e:?}");
                        break;
                    }
                }
            }
        }
    }
}

/// Shuttle bytes between an accepted socket and its forwarded channel
/// until either side finishes.
async fn pump(stream: TcpStream, channel: Arc<Channel>, mut msgs: UnboundedReceiver<ChannelMsg>) {
    match channel.open_result().wait(None).await.as_deref() {
        Some(Outcome::Value(Ok(()))) => {}
        _ => {
            debug!("forwarded channel was refused, dropping connection");
            return;
        }
    }
    let (mut rd, mut wr) = stream.into_split();

    let outbound = {
        let channel = Arc::clone(&channel);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 32768];
            loop {
                match rd.read(&mut buf).await {
                    Ok(0) => {
                        let _ = channel.eof();
                        break;
                    }
                    #[allow(clippy::indexing_slicing)] // n <= buf.len()
                    Ok(n) => {
                        if channel.data(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => {
                        let _ = channel.close();
                        break;
                    }
                }
            }
        })
    };

    while let Some(msg) = msgs.recv().await {
        match msg {
            ChannelMsg::Data { data } => {
                if wr.write_all(&data).await.is_err() {
                    let _ = channel.close();
                    break;
                }
            }
            ChannelMsg::Eof => {
                let _ = wr.shutdown().await;
            }
            ChannelMsg::Close => break,
            _ => {}
        }
    }
    let _ = channel.close();
    outbound.abort();
}

/// Agent-forwarding bookkeeping, closed right after the TCP/IP
/// forwarder in the session teardown sequence. The agent channel type
/// itself goes through the ordinary channel factories.
#[derive(Default)]
pub struct AgentForwardSupport {
    enabled: bool,
}

impl AgentForwardSupport {
    pub fn new() -> AgentForwardSupport {
        AgentForwardSupport::default()
    }

    /// Record that the peer asked for agent forwarding on this session.
    pub fn initialize(&mut self) {
        self.enabled = true;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn close(&mut self) {
        if self.enabled {
            debug!("closing agent forwarding");
            self.enabled = false;
        }
    }
}

/// X11-forwarding bookkeeping, same life cycle as
/// [`AgentForwardSupport`].
#[derive(Default)]
pub struct X11ForwardSupport {
    enabled: bool,
}

impl X11ForwardSupport {
    pub fn new() -> X11ForwardSupport {
        X11ForwardSupport::default()
    }

    pub fn initialize(&mut self) {
        self.enabled = true;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn close(&mut self) {
        if self.enabled {
            debug!("closing X11 forwarding");
            self.enabled = false;
        }
    }
}

// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The per-session connection service: channel registry,
//! `SSH_MSG_CHANNEL_*` demultiplexer and global-request dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, trace, warn};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;

use crate::channel::{Channel, ChannelMsg, RequestResult};
use crate::forward::{AgentForwardSupport, TcpipForwarder, X11ForwardSupport};
use crate::session::GlobalRequestResponse;
use crate::{
    msg, Buffer, ChannelId, ChannelOpenFailure, Config, Error, OpenChannelError, Outcome, Service,
    SessionHandle,
};

/// Creates channels for a named channel type when the peer asks to open
/// one. Returning an error refuses the open with its reason code; the
/// channel is discarded.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    /// The channel type this factory serves, e.g. `"session"`.
    fn name(&self) -> &str;

    /// Take ownership of the freshly registered channel and its message
    /// stream. `extra` holds the type-specific bytes of the open
    /// message.
    async fn open(
        &self,
        channel: Arc<Channel>,
        msgs: UnboundedReceiver<ChannelMsg>,
        extra: &mut Buffer,
    ) -> Result<(), OpenChannelError>;
}

/// A handler in the session's global-request chain. The dispatcher
/// walks the chain and stops at the first non-
/// [`RequestResult::Unsupported`] result.
#[async_trait]
pub trait GlobalRequestHandler: Send + Sync {
    async fn process(
        &self,
        service: &mut ConnectionService,
        name: &str,
        want_reply: bool,
        buf: &mut Buffer,
    ) -> Result<RequestResult, Error>;
}

/// The channel registry shared between the service and the helper
/// tasks that open channels on its behalf (forwarder accept loops).
/// Only service-owned plumbing mutates it.
pub(crate) struct Registry {
    channels: Mutex<HashMap<u32, Arc<Channel>>>,
    next_channel_id: AtomicU32,
    max_channels: usize,
}

impl Registry {
    fn new(max_channels: usize) -> Registry {
        Registry {
            channels: Mutex::new(HashMap::new()),
            next_channel_id: AtomicU32::new(0),
            max_channels,
        }
    }

    fn next_id(&self) -> ChannelId {
        ChannelId(self.next_channel_id.fetch_add(1, Ordering::SeqCst))
    }

    fn register(&self, channel: Arc<Channel>) -> Result<(), Error> {
        let Ok(mut channels) = self.channels.lock() else {
            return Err(Error::Inconsistent);
        };
        if channels.len() >= self.max_channels {
            return Err(Error::Inconsistent);
        }
        debug!("registering channel {}", channel.id());
        channels.insert(channel.id().into(), channel);
        Ok(())
    }

    fn get(&self, id: u32) -> Option<Arc<Channel>> {
        self.channels.lock().ok()?.get(&id).cloned()
    }

    fn unregister(&self, id: ChannelId) {
        if let Ok(mut channels) = self.channels.lock() {
            channels.remove(&u32::from(id));
        }
    }

    fn len(&self) -> usize {
        self.channels.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn drain(&self) -> Vec<Arc<Channel>> {
        self.channels
            .lock()
            .map(|mut c| c.drain().map(|(_, ch)| ch).collect())
            .unwrap_or_default()
    }
}

/// Opens outbound channels: allocates a local id, registers the
/// channel and sends `SSH_MSG_CHANNEL_OPEN`. Cloned into forwarder
/// accept loops.
#[derive(Clone)]
pub struct ChannelOpener {
    session: SessionHandle,
    registry: Arc<Registry>,
    window_size: u32,
    packet_size: u32,
}

impl ChannelOpener {
    /// The channel is returned in `Opening` state; wait on its open
    /// result (or [`ChannelEvent::OPENED`](crate::ChannelEvent)) before
    /// writing.
    pub fn open(
        &self,
        typ: &str,
        body: impl FnOnce(&mut Buffer),
    ) -> Result<(Arc<Channel>, UnboundedReceiver<ChannelMsg>), Error> {
        let id = self.registry.next_id();
        let (channel, msgs) = Channel::client(
            id,
            self.session.clone(),
            self.window_size,
            self.packet_size,
        );
        self.registry.register(Arc::clone(&channel))?;
        let mut buf = Buffer::packet(msg::CHANNEL_OPEN);
        buf.put_str(typ);
        buf.put_u32(id.into());
        buf.put_u32(self.window_size);
        buf.put_u32(channel.local_window().packet_size());
        body(&mut buf);
        self.session.write_packet(buf)?;
        Ok((channel, msgs))
    }
}

/// Channel registry, demultiplexer and global-request dispatch for one
/// authenticated session.
pub struct ConnectionService {
    session: SessionHandle,
    config: Arc<Config>,
    registry: Arc<Registry>,
    factories: Vec<Arc<dyn ChannelFactory>>,
    global_handlers: Vec<Arc<dyn GlobalRequestHandler>>,
    tcpip_forwarder: TcpipForwarder,
    agent_forward: AgentForwardSupport,
    x11_forward: X11ForwardSupport,
    allow_more_sessions: bool,
    closing: bool,
}

impl ConnectionService {
    pub fn new(session: SessionHandle, config: Arc<Config>) -> ConnectionService {
        ConnectionService {
            tcpip_forwarder: TcpipForwarder::new(),
            agent_forward: AgentForwardSupport::new(),
            x11_forward: X11ForwardSupport::new(),
            registry: Arc::new(Registry::new(config.max_channels)),
            global_handlers: vec![
                Arc::new(TcpipForwardHandler),
                Arc::new(CancelTcpipForwardHandler),
            ],
            factories: Vec::new(),
            allow_more_sessions: true,
            closing: false,
            session,
            config,
        }
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn tcpip_forwarder(&mut self) -> &mut TcpipForwarder {
        &mut self.tcpip_forwarder
    }

    /// Register a factory for a channel type the peer may open.
    pub fn add_channel_factory(&mut self, factory: Arc<dyn ChannelFactory>) {
        self.factories.push(factory);
    }

    /// Append a handler to the global-request chain.
    pub fn add_global_request_handler(&mut self, handler: Arc<dyn GlobalRequestHandler>) {
        self.global_handlers.push(handler);
    }

    pub fn set_allow_more_sessions(&mut self, allow: bool) {
        self.allow_more_sessions = allow;
    }

    pub fn channel_count(&self) -> usize {
        self.registry.len()
    }

    /// An opener usable from outside the service (accept loops, tests).
    pub fn opener(&self) -> ChannelOpener {
        ChannelOpener {
            session: self.session.clone(),
            registry: Arc::clone(&self.registry),
            window_size: self.config.window_size,
            packet_size: self.config.maximum_packet_size,
        }
    }

    /// Open a channel of the given type towards the peer.
    pub fn open_channel(
        &self,
        typ: &str,
        body: impl FnOnce(&mut Buffer),
    ) -> Result<(Arc<Channel>, UnboundedReceiver<ChannelMsg>), Error> {
        self.opener().open(typ, body)
    }

    /// Open a session channel (the most basic type of channel).
    pub fn open_session(&self) -> Result<(Arc<Channel>, UnboundedReceiver<ChannelMsg>), Error> {
        self.open_channel("session", |_| ())
    }

    /// Open a direct TCP/IP channel towards the peer. See
    /// [RFC4254](https://tools.ietf.org/html/rfc4254#section-7).
    pub fn open_direct_tcpip(
        &self,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
    ) -> Result<(Arc<Channel>, UnboundedReceiver<ChannelMsg>), Error> {
        self.open_channel("direct-tcpip", |b| {
            b.put_str(host_to_connect);
            b.put_u32(port_to_connect);
            b.put_str(originator_address);
            b.put_u32(originator_port);
        })
    }

    /// Ask the peer to listen on `address:port` and forward incoming
    /// connections to us. The returned receiver resolves with the
    /// bound port on success (useful with port 0).
    pub fn request_tcpip_forward(
        &self,
        address: &str,
        port: u32,
    ) -> Result<oneshot::Receiver<Option<u32>>, Error> {
        let (tx, rx) = oneshot::channel();
        self.session.global_request(
            "tcpip-forward",
            true,
            |b| {
                b.put_str(address);
                b.put_u32(port);
            },
            Some(GlobalRequestResponse::TcpIpForward(tx)),
        )?;
        Ok(rx)
    }

    /// Cancel a previously requested remote forwarding.
    pub fn cancel_tcpip_forward(
        &self,
        address: &str,
        port: u32,
    ) -> Result<oneshot::Receiver<bool>, Error> {
        let (tx, rx) = oneshot::channel();
        self.session.global_request(
            "cancel-tcpip-forward",
            true,
            |b| {
                b.put_str(address);
                b.put_u32(port);
            },
            Some(GlobalRequestResponse::CancelTcpIpForward(tx)),
        )?;
        Ok(rx)
    }

    /// Close everything: forwarders sequentially, then all channels in
    /// parallel. The registry is drained regardless of per-channel
    /// unregistration.
    pub async fn shutdown(&mut self) {
        self.closing = true;
        self.tcpip_forwarder.close().await;
        self.agent_forward.close();
        self.x11_forward.close();
        let channels = self.registry.drain();
        futures::future::join_all(channels.into_iter().map(|channel| async move {
            let _ = channel.handle_close();
        }))
        .await;
    }

    fn channel(&self, cmd: u8, buf: &mut Buffer) -> Result<Arc<Channel>, Error> {
        let id = buf.get_u32()?;
        self.registry
            .get(id)
            .ok_or(Error::UnknownChannel { cmd, id })
    }

    fn open_failure(
        session: &SessionHandle,
        peer_id: u32,
        reason: u32,
        description: &str,
    ) {
        let mut buf = Buffer::packet(msg::CHANNEL_OPEN_FAILURE);
        buf.put_u32(peer_id);
        buf.put_u32(reason);
        buf.put_str(description);
        buf.put_str("");
        let _ = session.write_packet(buf);
    }

    async fn channel_open(&mut self, buf: &mut Buffer) -> Result<(), Error> {
        let typ = buf.get_str()?;
        let peer_id = buf.get_u32()?;
        let peer_window_size = buf.get_u32()?;
        let peer_packet_size = buf.get_u32()?;
        debug!("received CHANNEL_OPEN {typ}");

        if self.closing {
            Self::open_failure(
                &self.session,
                peer_id,
                msg::SSH_OPEN_CONNECT_FAILED as u32,
                &format!("SSH server is shutting down: {typ}"),
            );
            return Ok(());
        }
        if !self.allow_more_sessions {
            Self::open_failure(
                &self.session,
                peer_id,
                msg::SSH_OPEN_CONNECT_FAILED as u32,
                "additional sessions disabled",
            );
            return Ok(());
        }
        let Some(factory) = self
            .factories
            .iter()
            .find(|f| f.name() == typ)
            .map(Arc::clone)
        else {
            Self::open_failure(
                &self.session,
                peer_id,
                msg::SSH_OPEN_UNKNOWN_CHANNEL_TYPE as u32,
                &format!("Unsupported channel type: {typ}"),
            );
            return Ok(());
        };

        let local_id = self.registry.next_id();
        let (channel, msgs) = Channel::server(
            local_id,
            peer_id,
            peer_window_size,
            peer_packet_size,
            self.session.clone(),
            self.config.window_size,
            self.config.maximum_packet_size,
        );
        if self.registry.register(Arc::clone(&channel)).is_err() {
            Self::open_failure(
                &self.session,
                peer_id,
                msg::SSH_OPEN_RESOURCE_SHORTAGE as u32,
                &format!("Too many concurrent channels, at most {}", self.config.max_channels),
            );
            return Ok(());
        }

        // Send the reply when the factory resolves the open outcome.
        let open = channel.open_result();
        {
            let session = self.session.clone();
            let registry = Arc::clone(&self.registry);
            let channel = Arc::clone(&channel);
            open.on_complete(move |outcome| match outcome {
                Outcome::Value(Ok(())) => {
                    channel.confirm_local();
                    let mut buf = Buffer::packet(msg::CHANNEL_OPEN_CONFIRMATION);
                    buf.put_u32(peer_id);
                    buf.put_u32(channel.id().into());
                    buf.put_u32(channel.local_window().size());
                    buf.put_u32(channel.local_window().packet_size());
                    let _ = session.write_packet(buf);
                }
                Outcome::Value(Err(e)) => {
                    Self::open_failure(&session, peer_id, e.reason as u32, &e.message);
                    registry.unregister(channel.id());
                }
                Outcome::Canceled => {
                    Self::open_failure(&session, peer_id, 0, "Error opening channel");
                    registry.unregister(channel.id());
                }
            });
        }
        match factory.open(Arc::clone(&channel), msgs, buf).await {
            Ok(()) => open.set(Ok(())),
            Err(e) => open.set(Err(e)),
        }
        Ok(())
    }

    async fn global_request(&mut self, buf: &mut Buffer) -> Result<(), Error> {
        let name = buf.get_str()?;
        let want_reply = buf.get_bool()?;
        debug!("received GLOBAL_REQUEST {name} want-reply={want_reply}");

        let handlers = self.global_handlers.clone();
        let body_rpos = buf.rpos();
        let mut result = RequestResult::Unsupported;
        for handler in handlers {
            buf.set_rpos(body_rpos);
            match handler.process(self, &name, want_reply, buf).await {
                Ok(RequestResult::Unsupported) => continue,
                Ok(r) => {
                    result = r;
                    break;
                }
                Err(e) => {
                    warn!("error processing global request {name}: {e:?}");
                    result = RequestResult::ReplyFailure;
                    break;
                }
            }
        }
        if result == RequestResult::Unsupported {
            warn!("unknown global request: {name}");
        }
        if want_reply {
            match result {
                RequestResult::ReplySuccess => self
                    .session
                    .write_packet(Buffer::packet(msg::REQUEST_SUCCESS))?,
                RequestResult::ReplyFailure | RequestResult::Unsupported => self
                    .session
                    .write_packet(Buffer::packet(msg::REQUEST_FAILURE))?,
                RequestResult::Replied => {}
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Service for ConnectionService {
    async fn process(&mut self, cmd: u8, buf: &mut Buffer) -> Result<(), Error> {
        match cmd {
            msg::CHANNEL_OPEN => self.channel_open(buf).await,
            msg::CHANNEL_OPEN_CONFIRMATION => {
                let channel = self.channel(cmd, buf)?;
                let remote_id = buf.get_u32()?;
                let window_size = buf.get_u32()?;
                let packet_size = buf.get_u32()?;
                debug!("received CHANNEL_OPEN_CONFIRMATION on channel {}", channel.id());
                channel.handle_open_confirmation(remote_id, window_size, packet_size)
            }
            msg::CHANNEL_OPEN_FAILURE => {
                let channel = self.channel(cmd, buf)?;
                let reason =
                    ChannelOpenFailure::from_u32(buf.get_u32()?).unwrap_or(ChannelOpenFailure::Unknown);
                let description = buf.get_str()?;
                let _language_tag = buf.get_str()?;
                self.registry.unregister(channel.id());
                channel.handle_open_failure(reason, description);
                Ok(())
            }
            msg::CHANNEL_DATA => {
                let channel = self.channel(cmd, buf)?;
                let data = buf.get_string()?;
                trace!("channel {}: {} bytes", channel.id(), data.len());
                channel.handle_data(data)
            }
            msg::CHANNEL_EXTENDED_DATA => {
                let channel = self.channel(cmd, buf)?;
                let ext = buf.get_u32()?;
                let data = buf.get_string()?;
                channel.handle_extended_data(ext, data)
            }
            msg::CHANNEL_EOF => {
                let channel = self.channel(cmd, buf)?;
                channel.handle_eof();
                Ok(())
            }
            msg::CHANNEL_CLOSE => {
                let channel = self.channel(cmd, buf)?;
                channel.handle_close()?;
                self.registry.unregister(channel.id());
                Ok(())
            }
            msg::CHANNEL_REQUEST => {
                let channel = self.channel(cmd, buf)?;
                let name = buf.get_str()?;
                let want_reply = buf.get_bool()?;
                debug!("channel {}: request {name} want-reply={want_reply}", channel.id());
                channel.handle_request(&name, want_reply, buf).await
            }
            msg::CHANNEL_SUCCESS => {
                let channel = self.channel(cmd, buf)?;
                channel.handle_success();
                Ok(())
            }
            msg::CHANNEL_FAILURE => {
                let channel = self.channel(cmd, buf)?;
                channel.handle_failure();
                Ok(())
            }
            msg::CHANNEL_WINDOW_ADJUST => {
                let channel = self.channel(cmd, buf)?;
                let amount = buf.get_u32()?;
                channel.handle_window_adjust(amount);
                Ok(())
            }
            msg::GLOBAL_REQUEST => self.global_request(buf).await,
            msg::REQUEST_SUCCESS => {
                self.session.request_success(buf);
                Ok(())
            }
            msg::REQUEST_FAILURE => {
                self.session.request_failure();
                Ok(())
            }
            _ => Err(Error::Inconsistent),
        }
    }

    async fn close(&mut self) -> Result<(), Error> {
        self.shutdown().await;
        Ok(())
    }
}

/// Handles the `tcpip-forward` global request by binding a local
/// listener; the reply carries the bound port.
pub struct TcpipForwardHandler;

#[async_trait]
impl GlobalRequestHandler for TcpipForwardHandler {
    async fn process(
        &self,
        service: &mut ConnectionService,
        name: &str,
        want_reply: bool,
        buf: &mut Buffer,
    ) -> Result<RequestResult, Error> {
        if name != "tcpip-forward" {
            return Ok(RequestResult::Unsupported);
        }
        let address = buf.get_str()?;
        let port = buf.get_u32()?;
        let opener = service.opener();
        match service
            .tcpip_forwarder
            .local_port_forwarding_requested(&address, port as u16, opener)
            .await
        {
            Ok(bound) => {
                if want_reply {
                    let mut reply = Buffer::packet(msg::REQUEST_SUCCESS);
                    reply.put_u32(u32::from(bound.port()));
                    service.session.write_packet(reply)?;
                }
                Ok(RequestResult::Replied)
            }
            Err(e) => {
                warn!("tcpip-forward {address}:{port} failed: {e:?}");
                Ok(RequestResult::ReplyFailure)
            }
        }
    }
}

/// Handles the `cancel-tcpip-forward` global request.
pub struct CancelTcpipForwardHandler;

#[async_trait]
impl GlobalRequestHandler for CancelTcpipForwardHandler {
    async fn process(
        &self,
        service: &mut ConnectionService,
        name: &str,
        want_reply: bool,
        buf: &mut Buffer,
    ) -> Result<RequestResult, Error> {
        if name != "cancel-tcpip-forward" {
            return Ok(RequestResult::Unsupported);
        }
        let address = buf.get_str()?;
        let port = buf.get_u32()?;
        if service
            .tcpip_forwarder
            .cancel(&address, port as u16)
            .await
        {
            if want_reply {
                let mut reply = Buffer::packet(msg::REQUEST_SUCCESS);
                reply.put_u32(port);
                service.session.write_packet(reply)?;
            }
            Ok(RequestResult::Replied)
        } else {
            Ok(RequestResult::ReplyFailure)
        }
    }
}

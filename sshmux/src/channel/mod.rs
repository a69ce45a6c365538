//! One logical channel multiplexed on a session: state machine, flow
//! control, request dispatch and the message stream handed to the
//! application.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bitflags::bitflags;
use log::{debug, trace, warn};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;

use crate::{
    msg, Buffer, ChannelId, ChannelOpenFailure, Error, OpenChannelError, Promise, SessionHandle,
    Sig, Window,
};

/// Life cycle of a channel. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Opening,
    Open,
    EofSent,
    EofReceived,
    Closed,
}

bitflags! {
    /// Condition bits [`Channel::wait_for`] can block on. `TIMEOUT` is
    /// only ever present in return values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChannelEvent: u32 {
        const OPENED = 1;
        const CLOSED = 2;
        const EOF = 4;
        const EXIT_STATUS = 8;
        const EXIT_SIGNAL = 16;
        const TIMEOUT = 32;
    }
}

/// What a channel-request handler did with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestResult {
    /// The handler already sent whatever reply was needed.
    Replied,
    /// Send `SSH_MSG_CHANNEL_SUCCESS` if the peer wants a reply.
    ReplySuccess,
    /// Send `SSH_MSG_CHANNEL_FAILURE` if the peer wants a reply.
    ReplyFailure,
    /// Not this handler's request; keep walking the chain.
    Unsupported,
}

/// A handler in a channel's ordered request chain. The dispatcher walks
/// the chain and stops at the first non-[`RequestResult::Unsupported`]
/// result.
#[async_trait]
pub trait ChannelRequestHandler: Send {
    async fn process(
        &mut self,
        channel: &Channel,
        name: &str,
        want_reply: bool,
        buf: &mut Buffer,
    ) -> Result<RequestResult, Error>;
}

/// Messages a channel delivers to the code using it.
#[derive(Debug)]
#[non_exhaustive]
pub enum ChannelMsg {
    Open {
        id: ChannelId,
        max_packet_size: u32,
        window_size: u32,
    },
    Data {
        data: Vec<u8>,
    },
    ExtendedData {
        data: Vec<u8>,
        ext: u32,
    },
    Eof,
    Close,
    OpenFailure(ChannelOpenFailure),
    Success,
    Failure,
    WindowAdjusted {
        new_size: u32,
    },
    RequestShell {
        want_reply: bool,
    },
    Exec {
        want_reply: bool,
        command: Vec<u8>,
    },
    RequestSubsystem {
        want_reply: bool,
        name: String,
    },
    RequestPty {
        want_reply: bool,
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: Vec<u8>,
    },
    SetEnv {
        want_reply: bool,
        variable_name: String,
        variable_value: String,
    },
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Signal {
        signal: Sig,
    },
    ExitStatus {
        exit_status: u32,
    },
    ExitSignal {
        signal_name: Sig,
        core_dumped: bool,
        error_message: String,
        lang_tag: String,
    },
}

/// The peer's side of the identifier pair, fixed exactly once.
#[derive(Debug, Clone, Copy)]
struct RemoteParams {
    id: u32,
    max_packet_size: u32,
}

struct StateInner {
    state: ChannelState,
    eof_sent: bool,
    close_sent: bool,
}

/// A single multiplexed channel.
///
/// Created and owned by the
/// [`ConnectionService`](crate::connection::ConnectionService); the
/// application keeps a shared reference plus the receiving end of the
/// [`ChannelMsg`] stream.
pub struct Channel {
    local_id: ChannelId,
    session: SessionHandle,
    remote: OnceLock<RemoteParams>,
    inner: Mutex<StateInner>,
    events: Mutex<ChannelEvent>,
    events_notify: Notify,
    local_window: Window,
    remote_window: Window,
    open_result: Promise<Result<(), OpenChannelError>>,
    msgs: UnboundedSender<ChannelMsg>,
    handlers: tokio::sync::Mutex<Vec<Box<dyn ChannelRequestHandler>>>,
    exit_status_sent: AtomicBool,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.local_id)
            .field("state", &self.state())
            .finish()
    }
}

impl Channel {
    fn new(
        local_id: ChannelId,
        session: SessionHandle,
        window_size: u32,
        packet_size: u32,
        state: ChannelState,
    ) -> (std::sync::Arc<Channel>, UnboundedReceiver<ChannelMsg>) {
        let (msgs, rx) = unbounded_channel();
        let channel = std::sync::Arc::new(Channel {
            local_id,
            session,
            remote: OnceLock::new(),
            inner: Mutex::new(StateInner {
                state,
                eof_sent: false,
                close_sent: false,
            }),
            events: Mutex::new(ChannelEvent::empty()),
            events_notify: Notify::new(),
            local_window: Window::new(window_size, packet_size),
            remote_window: Window::new(0, packet_size),
            open_result: Promise::new(),
            msgs,
            handlers: tokio::sync::Mutex::new(vec![Box::new(SessionRequestHandler)
                as Box<dyn ChannelRequestHandler>]),
            exit_status_sent: AtomicBool::new(false),
        });
        (channel, rx)
    }

    /// A channel we are asking the peer to open; stays `Opening` until
    /// the confirmation comes back.
    pub(crate) fn client(
        local_id: ChannelId,
        session: SessionHandle,
        window_size: u32,
        packet_size: u32,
    ) -> (std::sync::Arc<Channel>, UnboundedReceiver<ChannelMsg>) {
        Self::new(local_id, session, window_size, packet_size, ChannelState::Opening)
    }

    /// A channel the peer asked us to open; the remote parameters are
    /// known up front and the channel goes `Open` as soon as the local
    /// side confirms it.
    pub(crate) fn server(
        local_id: ChannelId,
        remote_id: u32,
        remote_window_size: u32,
        remote_packet_size: u32,
        session: SessionHandle,
        window_size: u32,
        packet_size: u32,
    ) -> (std::sync::Arc<Channel>, UnboundedReceiver<ChannelMsg>) {
        let (channel, rx) =
            Self::new(local_id, session, window_size, packet_size, ChannelState::Opening);
        let _ = channel.remote.set(RemoteParams {
            id: remote_id,
            max_packet_size: remote_packet_size,
        });
        channel.remote_window.expand(remote_window_size);
        (channel, rx)
    }

    pub fn id(&self) -> ChannelId {
        self.local_id
    }

    /// The peer's identifier for this channel, once known.
    pub fn remote_id(&self) -> Option<u32> {
        self.remote.get().map(|r| r.id)
    }

    pub fn state(&self) -> ChannelState {
        self.inner
            .lock()
            .map(|i| i.state)
            .unwrap_or(ChannelState::Closed)
    }

    pub fn local_window(&self) -> &Window {
        &self.local_window
    }

    pub fn remote_window(&self) -> &Window {
        &self.remote_window
    }

    /// Resolves once the peer has confirmed or refused the open.
    pub fn open_result(&self) -> Promise<Result<(), OpenChannelError>> {
        self.open_result.clone()
    }

    /// Append a handler to the request chain.
    pub async fn add_request_handler(&self, handler: Box<dyn ChannelRequestHandler>) {
        self.handlers.lock().await.push(handler);
    }

    fn remote(&self) -> Result<RemoteParams, Error> {
        self.remote.get().copied().ok_or(Error::WrongChannel)
    }

    fn set_state(&self, state: ChannelState) {
        if let Ok(mut inner) = self.inner.lock() {
            if inner.state != ChannelState::Closed {
                inner.state = state;
            }
        }
    }

    pub(crate) fn set_event(&self, bits: ChannelEvent) {
        if let Ok(mut ev) = self.events.lock() {
            ev.insert(bits);
        }
        self.events_notify.notify_waiters();
    }

    fn deliver(&self, msg: ChannelMsg) {
        // The application may have dropped its receiver; that's fine.
        let _ = self.msgs.send(msg);
    }

    /// Block until any bit of `mask` is set on the channel, or the
    /// timeout elapses. A timeout is reported as the
    /// [`ChannelEvent::TIMEOUT`] bit, never as an error.
    pub async fn wait_for(&self, mask: ChannelEvent, timeout: Option<Duration>) -> ChannelEvent {
        let satisfied = async {
            loop {
                let notified = self.events_notify.notified();
                let hit = self
                    .events
                    .lock()
                    .map(|ev| *ev & mask)
                    .unwrap_or(ChannelEvent::empty());
                if !hit.is_empty() {
                    return hit;
                }
                notified.await;
            }
        };
        match timeout {
            Some(t) => tokio::time::timeout(t, satisfied)
                .await
                .unwrap_or(ChannelEvent::TIMEOUT),
            None => satisfied.await,
        }
    }

    // Incoming transitions, called by the connection service.

    pub(crate) fn handle_open_confirmation(
        &self,
        remote_id: u32,
        window_size: u32,
        packet_size: u32,
    ) -> Result<(), Error> {
        if self.state() != ChannelState::Opening || self.remote.get().is_some() {
            return Err(Error::Inconsistent);
        }
        self.remote
            .set(RemoteParams {
                id: remote_id,
                max_packet_size: packet_size,
            })
            .map_err(|_| Error::Inconsistent)?;
        self.remote_window.expand(window_size);
        self.set_state(ChannelState::Open);
        self.set_event(ChannelEvent::OPENED);
        self.open_result.set(Ok(()));
        self.deliver(ChannelMsg::Open {
            id: self.local_id,
            max_packet_size: packet_size,
            window_size,
        });
        Ok(())
    }

    /// Confirm a locally accepted (server side) channel open.
    pub(crate) fn confirm_local(&self) {
        self.set_state(ChannelState::Open);
        self.set_event(ChannelEvent::OPENED);
    }

    pub(crate) fn handle_open_failure(&self, reason: ChannelOpenFailure, description: String) {
        debug!("channel {}: open failed: {}", self.local_id, description);
        self.set_state(ChannelState::Closed);
        self.set_event(ChannelEvent::CLOSED);
        self.open_result
            .set(Err(OpenChannelError::new(reason, description)));
        self.deliver(ChannelMsg::OpenFailure(reason));
    }

    pub(crate) fn handle_data(&self, data: Vec<u8>) -> Result<(), Error> {
        if self.state() == ChannelState::Closed {
            trace!("channel {}: dropping data after close", self.local_id);
            return Ok(());
        }
        self.consume_local_window(data.len() as u32)?;
        self.deliver(ChannelMsg::Data { data });
        Ok(())
    }

    pub(crate) fn handle_extended_data(&self, ext: u32, data: Vec<u8>) -> Result<(), Error> {
        if self.state() == ChannelState::Closed {
            trace!("channel {}: dropping extended data after close", self.local_id);
            return Ok(());
        }
        self.consume_local_window(data.len() as u32)?;
        self.deliver(ChannelMsg::ExtendedData { ext, data });
        Ok(())
    }

    fn consume_local_window(&self, len: u32) -> Result<(), Error> {
        if let Some(adjust) = self.local_window.consume_and_check(len)? {
            let remote = self.remote()?;
            let mut buf = Buffer::packet(msg::CHANNEL_WINDOW_ADJUST);
            buf.put_u32(remote.id);
            buf.put_u32(adjust);
            self.session.write_packet(buf)?;
        }
        Ok(())
    }

    pub(crate) fn handle_eof(&self) {
        if self.state() == ChannelState::Open {
            self.set_state(ChannelState::EofReceived);
        }
        self.set_event(ChannelEvent::EOF);
        self.deliver(ChannelMsg::Eof);
    }

    pub(crate) fn handle_close(&self) -> Result<(), Error> {
        let send_close = {
            let Ok(mut inner) = self.inner.lock() else {
                return Err(Error::Inconsistent);
            };
            if inner.state == ChannelState::Closed {
                return Ok(());
            }
            inner.state = ChannelState::Closed;
            !std::mem::replace(&mut inner.close_sent, true)
        };
        if send_close {
            if let Ok(remote) = self.remote() {
                let mut buf = Buffer::packet(msg::CHANNEL_CLOSE);
                buf.put_u32(remote.id);
                self.session.write_packet(buf)?;
            }
        }
        // An open still pending at close time will never complete.
        self.open_result.cancel();
        self.set_event(ChannelEvent::CLOSED);
        self.deliver(ChannelMsg::Close);
        Ok(())
    }

    pub(crate) fn handle_window_adjust(&self, amount: u32) {
        self.remote_window.expand(amount);
        self.deliver(ChannelMsg::WindowAdjusted {
            new_size: self.remote_window.size(),
        });
    }

    pub(crate) fn handle_success(&self) {
        self.deliver(ChannelMsg::Success);
    }

    pub(crate) fn handle_failure(&self) {
        self.deliver(ChannelMsg::Failure);
    }

    pub(crate) async fn handle_request(
        &self,
        name: &str,
        want_reply: bool,
        buf: &mut Buffer,
    ) -> Result<(), Error> {
        let mut handlers = self.handlers.lock().await;
        let body_rpos = buf.rpos();
        let mut result = RequestResult::Unsupported;
        for handler in handlers.iter_mut() {
            buf.set_rpos(body_rpos);
            match handler.process(self, name, want_reply, buf).await {
                Ok(RequestResult::Unsupported) => continue,
                Ok(r) => {
                    result = r;
                    break;
                }
                Err(e) => {
                    warn!("channel {}: error processing request {name}: {e:?}", self.local_id);
                    result = RequestResult::ReplyFailure;
                    break;
                }
            }
        }
        drop(handlers);
        if result == RequestResult::Unsupported {
            warn!("channel {}: unknown channel request {name}", self.local_id);
        }
        if want_reply {
            match result {
                RequestResult::ReplySuccess => {
                    let remote = self.remote()?;
                    let mut buf = Buffer::packet(msg::CHANNEL_SUCCESS);
                    buf.put_u32(remote.id);
                    self.session.write_packet(buf)?;
                }
                RequestResult::ReplyFailure | RequestResult::Unsupported => {
                    let remote = self.remote()?;
                    let mut buf = Buffer::packet(msg::CHANNEL_FAILURE);
                    buf.put_u32(remote.id);
                    self.session.write_packet(buf)?;
                }
                RequestResult::Replied => {}
            }
        }
        Ok(())
    }

    // Outgoing operations.

    fn check_writable(&self) -> Result<RemoteParams, Error> {
        let Ok(inner) = self.inner.lock() else {
            return Err(Error::Inconsistent);
        };
        match inner.state {
            ChannelState::Open | ChannelState::EofReceived if !inner.eof_sent => {
                drop(inner);
                self.remote()
            }
            _ => Err(Error::WrongChannel),
        }
    }

    /// Send data on the main stream, suspending on the remote window.
    pub async fn data(&self, data: &[u8]) -> Result<(), Error> {
        self.send_data(None, data).await
    }

    /// Send data on an extended stream; stream 1 is stderr.
    pub async fn extended_data(&self, ext: u32, data: &[u8]) -> Result<(), Error> {
        self.send_data(Some(ext), data).await
    }

    async fn send_data(&self, ext: Option<u32>, mut data: &[u8]) -> Result<(), Error> {
        let remote = self.check_writable()?;
        while !data.is_empty() {
            let max = (data.len() as u64).min(remote.max_packet_size as u64) as u32;
            let chunk = self.remote_window.consume_up_to(max).await as usize;
            let mut buf = match ext {
                None => {
                    let mut b = Buffer::packet(msg::CHANNEL_DATA);
                    b.put_u32(remote.id);
                    b
                }
                Some(ext) => {
                    let mut b = Buffer::packet(msg::CHANNEL_EXTENDED_DATA);
                    b.put_u32(remote.id);
                    b.put_u32(ext);
                    b
                }
            };
            #[allow(clippy::indexing_slicing)] // chunk <= data.len()
            buf.put_string(&data[..chunk]);
            self.session.write_packet(buf)?;
            #[allow(clippy::indexing_slicing)] // chunk <= data.len()
            {
                data = &data[chunk..];
            }
        }
        Ok(())
    }

    /// Close our outbound stream. Sent at most once.
    pub fn eof(&self) -> Result<(), Error> {
        let remote = self.remote()?;
        {
            let Ok(mut inner) = self.inner.lock() else {
                return Err(Error::Inconsistent);
            };
            if inner.eof_sent || inner.state == ChannelState::Closed {
                return Ok(());
            }
            inner.eof_sent = true;
            if inner.state == ChannelState::Open {
                inner.state = ChannelState::EofSent;
            }
        }
        let mut buf = Buffer::packet(msg::CHANNEL_EOF);
        buf.put_u32(remote.id);
        self.session.write_packet(buf)
    }

    /// Ask the peer to close the channel. Idempotent; the channel turns
    /// `Closed` when the peer's own `SSH_MSG_CHANNEL_CLOSE` arrives.
    pub fn close(&self) -> Result<(), Error> {
        let send_close = {
            let Ok(mut inner) = self.inner.lock() else {
                return Err(Error::Inconsistent);
            };
            inner.state != ChannelState::Closed && !std::mem::replace(&mut inner.close_sent, true)
        };
        if send_close {
            let remote = self.remote()?;
            let mut buf = Buffer::packet(msg::CHANNEL_CLOSE);
            buf.put_u32(remote.id);
            self.session.write_packet(buf)?;
        }
        Ok(())
    }

    /// Send a channel request with a caller-provided body.
    pub fn request(
        &self,
        name: &str,
        want_reply: bool,
        body: impl FnOnce(&mut Buffer),
    ) -> Result<(), Error> {
        let remote = self.remote()?;
        let mut buf = Buffer::packet(msg::CHANNEL_REQUEST);
        buf.put_u32(remote.id);
        buf.put_str(name);
        buf.put_bool(want_reply);
        body(&mut buf);
        self.session.write_packet(buf)
    }

    /// Request a remote shell.
    pub fn request_shell(&self, want_reply: bool) -> Result<(), Error> {
        self.request("shell", want_reply, |_| ())
    }

    /// Execute a remote program (will be passed to a shell).
    pub fn request_exec(&self, want_reply: bool, command: &[u8]) -> Result<(), Error> {
        self.request("exec", want_reply, |b| b.put_string(command))
    }

    /// Request the start of a subsystem with the given name.
    pub fn request_subsystem(&self, want_reply: bool, name: &str) -> Result<(), Error> {
        self.request("subsystem", want_reply, |b| b.put_str(name))
    }

    /// Request a pseudo-terminal. `modes` is the raw encoded terminal
    /// modes blob of RFC 4254 §8.
    pub fn request_pty(
        &self,
        want_reply: bool,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[u8],
    ) -> Result<(), Error> {
        self.request("pty-req", want_reply, |b| {
            b.put_str(term);
            b.put_u32(col_width);
            b.put_u32(row_height);
            b.put_u32(pix_width);
            b.put_u32(pix_height);
            b.put_string(modes);
        })
    }

    /// Set a remote environment variable.
    pub fn set_env(&self, want_reply: bool, name: &str, value: &str) -> Result<(), Error> {
        self.request("env", want_reply, |b| {
            b.put_str(name);
            b.put_str(value);
        })
    }

    /// Inform the peer that our terminal window size has changed.
    pub fn window_change(
        &self,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    ) -> Result<(), Error> {
        self.request("window-change", false, |b| {
            b.put_u32(col_width);
            b.put_u32(row_height);
            b.put_u32(pix_width);
            b.put_u32(pix_height);
        })
    }

    /// Deliver a signal to the remote process.
    pub fn signal(&self, signal: Sig) -> Result<(), Error> {
        self.request("signal", false, |b| b.put_str(signal.name()))
    }

    /// Send the exit status of a finished command. Sent at most once
    /// per channel, without a reply, per RFC 4254 §6.10.
    pub fn exit_status(&self, exit_status: u32) -> Result<(), Error> {
        if self.exit_status_sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.request("exit-status", false, |b| b.put_u32(exit_status))
    }

    /// Report that the remote process was killed by a signal.
    pub fn exit_signal(
        &self,
        signal: Sig,
        core_dumped: bool,
        error_message: &str,
        language_tag: &str,
    ) -> Result<(), Error> {
        self.request("exit-signal", false, |b| {
            b.put_str(signal.name());
            b.put_bool(core_dumped);
            b.put_str(error_message);
            b.put_str(language_tag);
        })
    }
}

/// Built-in handler translating the standard session-channel requests
/// into [`ChannelMsg`] notifications.
struct SessionRequestHandler;

#[async_trait]
impl ChannelRequestHandler for SessionRequestHandler {
    async fn process(
        &mut self,
        channel: &Channel,
        name: &str,
        want_reply: bool,
        buf: &mut Buffer,
    ) -> Result<RequestResult, Error> {
        match name {
            "shell" => {
                channel.deliver(ChannelMsg::RequestShell { want_reply });
                Ok(RequestResult::ReplySuccess)
            }
            "exec" => {
                let command = buf.get_string()?;
                channel.deliver(ChannelMsg::Exec {
                    want_reply,
                    command,
                });
                Ok(RequestResult::ReplySuccess)
            }
            "subsystem" => {
                let name = buf.get_str()?;
                channel.deliver(ChannelMsg::RequestSubsystem { want_reply, name });
                Ok(RequestResult::ReplySuccess)
            }
            "pty-req" => {
                let term = buf.get_str()?;
                let col_width = buf.get_u32()?;
                let row_height = buf.get_u32()?;
                let pix_width = buf.get_u32()?;
                let pix_height = buf.get_u32()?;
                let modes = buf.get_string()?;
                channel.deliver(ChannelMsg::RequestPty {
                    want_reply,
                    term,
                    col_width,
                    row_height,
                    pix_width,
                    pix_height,
                    modes,
                });
                Ok(RequestResult::ReplySuccess)
            }
            "env" => {
                let variable_name = buf.get_str()?;
                let variable_value = buf.get_str()?;
                channel.deliver(ChannelMsg::SetEnv {
                    want_reply,
                    variable_name,
                    variable_value,
                });
                Ok(RequestResult::ReplySuccess)
            }
            "window-change" => {
                let col_width = buf.get_u32()?;
                let row_height = buf.get_u32()?;
                let pix_width = buf.get_u32()?;
                let pix_height = buf.get_u32()?;
                channel.deliver(ChannelMsg::WindowChange {
                    col_width,
                    row_height,
                    pix_width,
                    pix_height,
                });
                Ok(RequestResult::ReplySuccess)
            }
            "signal" => {
                let signal = Sig::from_name(&buf.get_str()?);
                channel.deliver(ChannelMsg::Signal { signal });
                Ok(RequestResult::ReplySuccess)
            }
            "exit-status" => {
                let exit_status = buf.get_u32()?;
                channel.set_event(ChannelEvent::EXIT_STATUS);
                channel.deliver(ChannelMsg::ExitStatus { exit_status });
                Ok(RequestResult::ReplySuccess)
            }
            "exit-signal" => {
                let signal_name = Sig::from_name(&buf.get_str()?);
                let core_dumped = buf.get_bool()?;
                let error_message = buf.get_str()?;
                let lang_tag = buf.get_str()?;
                channel.set_event(ChannelEvent::EXIT_SIGNAL);
                channel.deliver(ChannelMsg::ExitSignal {
                    signal_name,
                    core_dumped,
                    error_message,
                    lang_tag,
                });
                Ok(RequestResult::ReplySuccess)
            }
            _ => Ok(RequestResult::Unsupported),
        }
    }
}

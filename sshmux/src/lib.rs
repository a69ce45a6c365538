#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
#![allow(clippy::single_match, clippy::upper_case_acronyms)]
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

//! SSH-2 connection layer over an external encrypted transport.
//!
//! This crate implements the post-authentication half of an SSH
//! implementation: channel multiplexing and flow control ([RFC
//! 4254](https://tools.ietf.org/html/rfc4254)), the server and client
//! sides of user authentication ([RFC
//! 4252](https://tools.ietf.org/html/rfc4252)), TCP/IP port forwarding,
//! and the SFTP subsystem (versions 3 through 6 of
//! draft-ietf-secsh-filexfer).
//!
//! The binary packet protocol itself - key exchange, encryption, MAC,
//! rekeying - is *not* here. The transport is a collaborator: it decrypts
//! incoming packets and delivers their payloads, one at a time and in
//! order, to [`Service::process`], and it drains outgoing packets from
//! the non-blocking queue behind [`SessionHandle`]. Outgoing packets
//! reserve five bytes in front of the payload so the transport can stamp
//! the packet-length and padding-length fields in place.
//!
//! A session starts by driving a [`auth::UserAuthService`] until it
//! completes, then switches to a [`connection::ConnectionService`] which
//! demultiplexes `SSH_MSG_CHANNEL_*` messages onto [`Channel`]s, walks
//! global-request handler chains, and owns the port forwarders.

use std::convert::TryFrom;
use std::fmt::{Debug, Display, Formatter};

use thiserror::Error;

mod buffer;
mod promise;
mod window;

pub mod msg;

mod session;

pub mod auth;
pub mod channel;
pub mod connection;
pub mod forward;
pub mod sftp;

#[cfg(test)]
mod tests;

pub use buffer::{Buffer, Growth};
pub use channel::{Channel, ChannelEvent, ChannelMsg, ChannelState, RequestResult};
pub use connection::ConnectionService;
pub use promise::{Outcome, Promise};
pub use session::SessionHandle;
pub use window::Window;

use async_trait::async_trait;

#[derive(Debug, Error)]
pub enum Error {
    /// A decode ran past the written part of a buffer.
    #[error("Buffer underrun: needed {needed} bytes, {available} available")]
    BufferUnderrun { needed: usize, available: usize },

    /// A declared string length exceeds the remaining bytes.
    #[error("Malformed string length {0}")]
    BadStringLength(u32),

    /// The protocol is in an inconsistent state.
    #[error("Inconsistent state of the protocol")]
    Inconsistent,

    /// Message received on a channel number we know nothing about.
    #[error("Received {cmd} on unknown channel {id}")]
    UnknownChannel { cmd: u8, id: u32 },

    /// Message received/sent on an unopened channel.
    #[error("Channel not open")]
    WrongChannel,

    /// More data received than the local window had granted.
    #[error("Channel window exceeded: {len} bytes received, {window} granted")]
    WindowExceeded { len: u32, window: u32 },

    /// The peer refused to open a channel.
    #[error("Failed to open channel ({0:?})")]
    ChannelOpenFailure(ChannelOpenFailure),

    /// The peer changed username or service mid-authentication.
    #[error("Change of username or service is not allowed ({0}, {1}) -> ({2}, {3})")]
    AuthParamChange(String, String, String, String),

    /// Too many authentication attempts on one session.
    #[error("Too many authentication failures")]
    TooManyAuthAttempts,

    /// The peer asked for an authentication method we do not know.
    #[error("Unsupported authentication method")]
    UnsupportedAuthMethod,

    /// No authentication method left to try.
    #[error("No authentication method")]
    NoAuthMethod,

    /// Disconnected.
    #[error("Disconnected")]
    Disconnect,

    /// The outgoing packet queue is gone; the transport hung up.
    #[error("Channel send error")]
    SendError,

    /// The request was turned down by the other side.
    #[error("The request was rejected by the other party")]
    RequestDenied,

    /// An SFTP request came back with a non-OK substatus.
    #[error("SFTP status {status}: {message}")]
    Sftp { status: u32, message: String },

    /// Operation not expressible in the negotiated SFTP version.
    #[error("Unsupported for SFTP version {0}")]
    SftpVersion(u32),

    /// Strict-mode key file with permissions open to other users.
    #[error("Insecure permissions on {0}")]
    InsecurePermissions(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    Utf8(#[from] std::str::Utf8Error),

    #[error(transparent)]
    SshKey(#[from] ssh_key::Error),
}

/// A reason for disconnection.
#[allow(missing_docs)] // This should be relatively self-explanatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    HostNotAllowedToConnect = 1,
    ProtocolError = 2,
    KeyExchangeFailed = 3,
    Reserved = 4,
    MACError = 5,
    CompressionError = 6,
    ServiceNotAvailable = 7,
    ProtocolVersionNotSupported = 8,
    HostKeyNotVerifiable = 9,
    ConnectionLost = 10,
    ByApplication = 11,
    TooManyConnections = 12,
    AuthCancelledByUser = 13,
    NoMoreAuthMethodsAvailable = 14,
    IllegalUserName = 15,
}

impl TryFrom<u32> for Disconnect {
    type Error = crate::Error;

    fn try_from(value: u32) -> Result<Self, crate::Error> {
        Ok(match value {
            1 => Self::HostNotAllowedToConnect,
            2 => Self::ProtocolError,
            3 => Self::KeyExchangeFailed,
            4 => Self::Reserved,
            5 => Self::MACError,
            6 => Self::CompressionError,
            7 => Self::ServiceNotAvailable,
            8 => Self::ProtocolVersionNotSupported,
            9 => Self::HostKeyNotVerifiable,
            10 => Self::ConnectionLost,
            11 => Self::ByApplication,
            12 => Self::TooManyConnections,
            13 => Self::AuthCancelledByUser,
            14 => Self::NoMoreAuthMethodsAvailable,
            15 => Self::IllegalUserName,
            _ => return Err(crate::Error::Inconsistent),
        })
    }
}

/// Reason for not being able to open a channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ChannelOpenFailure {
    AdministrativelyProhibited = 1,
    ConnectFailed = 2,
    UnknownChannelType = 3,
    ResourceShortage = 4,
    Unknown = 0,
}

impl ChannelOpenFailure {
    pub fn from_u32(x: u32) -> Option<ChannelOpenFailure> {
        match x {
            1 => Some(ChannelOpenFailure::AdministrativelyProhibited),
            2 => Some(ChannelOpenFailure::ConnectFailed),
            3 => Some(ChannelOpenFailure::UnknownChannelType),
            4 => Some(ChannelOpenFailure::ResourceShortage),
            _ => None,
        }
    }
}

/// Error carried by a refused channel open: a numeric reason code per
/// RFC 4254 §5.1 and human-readable text.
#[derive(Debug, Clone, Error)]
#[error("Error opening channel ({reason:?}): {message}")]
pub struct OpenChannelError {
    pub reason: ChannelOpenFailure,
    pub message: String,
}

impl OpenChannelError {
    pub fn new(reason: ChannelOpenFailure, message: impl Into<String>) -> Self {
        OpenChannelError {
            reason,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
/// The identifier of a channel.
pub struct ChannelId(pub(crate) u32);

impl From<ChannelId> for u32 {
    fn from(c: ChannelId) -> u32 {
        c.0
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The type of signals that can be sent to a remote process. If you
/// plan to use custom signals, read [the
/// RFC](https://tools.ietf.org/html/rfc4254#section-6.10) to
/// understand the encoding.
#[allow(missing_docs)]
// This should be relatively self-explanatory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sig {
    ABRT,
    ALRM,
    FPE,
    HUP,
    ILL,
    INT,
    KILL,
    PIPE,
    QUIT,
    SEGV,
    TERM,
    USR1,
    Custom(String),
}

impl Sig {
    pub fn name(&self) -> &str {
        match *self {
            Sig::ABRT => "ABRT",
            Sig::ALRM => "ALRM",
            Sig::FPE => "FPE",
            Sig::HUP => "HUP",
            Sig::ILL => "ILL",
            Sig::INT => "INT",
            Sig::KILL => "KILL",
            Sig::PIPE => "PIPE",
            Sig::QUIT => "QUIT",
            Sig::SEGV => "SEGV",
            Sig::TERM => "TERM",
            Sig::USR1 => "USR1",
            Sig::Custom(ref c) => c,
        }
    }

    pub fn from_name(name: &str) -> Sig {
        match name {
            "ABRT" => Sig::ABRT,
            "ALRM" => Sig::ALRM,
            "FPE" => Sig::FPE,
            "HUP" => Sig::HUP,
            "ILL" => Sig::ILL,
            "INT" => Sig::INT,
            "KILL" => Sig::KILL,
            "PIPE" => Sig::PIPE,
            "QUIT" => Sig::QUIT,
            "SEGV" => Sig::SEGV,
            "TERM" => Sig::TERM,
            "USR1" => Sig::USR1,
            x => Sig::Custom(x.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
/// Configuration of a session.
pub struct Config {
    /// The initial size of a channel receive window (used for flow control).
    pub window_size: u32,
    /// The maximal size of a single packet.
    pub maximum_packet_size: u32,
    /// Maximal number of concurrently open channels per session.
    pub max_channels: usize,
    /// Authentication method chains, as the space/comma syntax
    /// understood by [`auth::parse_method_chains`]. Empty means one
    /// single-method chain per registered factory.
    pub auth_methods: String,
    /// Maximal number of allowed authentication attempts.
    pub max_auth_requests: usize,
    /// Welcome banner sent just before `SSH_MSG_USERAUTH_SUCCESS`.
    pub welcome_banner: Option<String>,
    /// Maximal number of concurrent sessions per authenticated user,
    /// enforced at authentication time when set.
    pub max_concurrent_sessions: Option<usize>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            window_size: 2097152,
            maximum_packet_size: 32768,
            max_channels: usize::MAX,
            auth_methods: String::new(),
            max_auth_requests: 20,
            welcome_banner: None,
            max_concurrent_sessions: None,
        }
    }
}

/// A protocol service multiplexed on a session: the transport feeds it
/// decrypted payloads serially, one `process` call per packet.
#[async_trait]
pub trait Service: Send {
    /// Handle one incoming message. `buf` is positioned just past the
    /// message-type byte.
    async fn process(&mut self, cmd: u8, buf: &mut Buffer) -> Result<(), Error>;

    /// Release the resources held by the service.
    async fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

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

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

use crate::{msg, Buffer, Disconnect, Error};

/// Reply slot for an outgoing global request, in send order.
pub enum GlobalRequestResponse {
    /// Request was a keepalive, ignore the result.
    Keepalive,
    /// `tcpip-forward`: carries `Some(port)` on success (the bound
    /// port when an ephemeral one was requested), `None` on failure.
    TcpIpForward(oneshot::Sender<Option<u32>>),
    /// `cancel-tcpip-forward`: `true` on success.
    CancelTcpIpForward(oneshot::Sender<bool>),
}

/// Cheap handle to a session's outgoing half.
///
/// `write_packet` is non-blocking: packets are queued and the transport
/// drains, frames and encrypts them. Channels keep one of these as
/// their back-reference to the session; dropping every handle does not
/// tear the session down, the transport does.
#[derive(Clone)]
pub struct SessionHandle {
    out: UnboundedSender<Buffer>,
    pending_globals: Arc<Mutex<VecDeque<GlobalRequestResponse>>>,
    disconnected: Arc<AtomicBool>,
}

impl SessionHandle {
    /// A handle plus the queue end the transport drains.
    pub fn new() -> (SessionHandle, UnboundedReceiver<Buffer>) {
        let (out, rx) = unbounded_channel();
        (
            SessionHandle {
                out,
                pending_globals: Arc::new(Mutex::new(VecDeque::new())),
                disconnected: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    /// Queue one packet payload for the transport.
    pub fn write_packet(&self, buf: Buffer) -> Result<(), Error> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(Error::Disconnect);
        }
        self.out.send(buf).map_err(|_| Error::SendError)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Send a disconnect message and refuse everything after it.
    pub fn disconnect(&self, reason: Disconnect, description: &str, language_tag: &str) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("disconnecting: {:?} {}", reason, description);
        let mut buf = Buffer::packet(msg::DISCONNECT);
        buf.put_u32(reason as u32);
        buf.put_str(description);
        buf.put_str(language_tag);
        let _ = self.out.send(buf);
    }

    /// Send a global request, registering `response` to be resolved by
    /// the matching `SSH_MSG_REQUEST_SUCCESS`/`_FAILURE`.
    pub fn global_request(
        &self,
        name: &str,
        want_reply: bool,
        body: impl FnOnce(&mut Buffer),
        response: Option<GlobalRequestResponse>,
    ) -> Result<(), Error> {
        if let Some(response) = response {
            if let Ok(mut q) = self.pending_globals.lock() {
                q.push_back(response);
            }
        }
        let mut buf = Buffer::packet(msg::GLOBAL_REQUEST);
        buf.put_str(name);
        buf.put_bool(want_reply);
        body(&mut buf);
        self.write_packet(buf)
    }

    /// Resolve the oldest pending global request with a success reply.
    pub fn request_success(&self, buf: &mut Buffer) {
        let front = self.pending_globals.lock().ok().and_then(|mut q| q.pop_front());
        match front {
            Some(GlobalRequestResponse::Keepalive) => {}
            Some(GlobalRequestResponse::TcpIpForward(reply)) => {
                // If a specific port was requested, the reply has no data.
                let port = if buf.available() == 0 {
                    Some(0)
                } else {
                    match buf.get_u32() {
                        Ok(port) => Some(port),
                        Err(e) => {
                            error!("bad tcpip-forward reply: {e:?}");
                            None
                        }
                    }
                };
                let _ = reply.send(port);
            }
            Some(GlobalRequestResponse::CancelTcpIpForward(reply)) => {
                let _ = reply.send(true);
            }
            None => {
                error!("received a global request success with nothing pending");
            }
        }
    }

    /// Resolve the oldest pending global request with a failure reply.
    pub fn request_failure(&self) {
        let front = self.pending_globals.lock().ok().and_then(|mut q| q.pop_front());
        match front {
            Some(GlobalRequestResponse::Keepalive) => {}
            Some(GlobalRequestResponse::TcpIpForward(reply)) => {
                let _ = reply.send(None);
            }
            Some(GlobalRequestResponse::CancelTcpIpForward(reply)) => {
                let _ = reply.send(false);
            }
            None => {
                error!("received a global request failure with nothing pending");
            }
        }
    }
}

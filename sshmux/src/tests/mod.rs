#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]
// Allow unwraps, expects and panics in the test suite

mod test_channels;
mod test_forward;
mod test_sftp;

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use crate::{msg, Buffer, Config, ConnectionService, Service, SessionHandle};

/// Deliver one side's outgoing packets into the other side's service,
/// the way the transport would after decrypting.
pub(crate) fn pump<S: Service + 'static>(
    mut rx: UnboundedReceiver<Buffer>,
    target: Arc<tokio::sync::Mutex<S>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            let payload = packet.payload().to_vec();
            let mut buf = Buffer::from_slice(&payload);
            let Ok(cmd) = buf.get_u8() else { continue };
            if cmd == msg::DISCONNECT {
                break;
            }
            let mut service = target.lock().await;
            if let Err(e) = service.process(cmd, &mut buf).await {
                log::error!("process({cmd}) failed: {e:?}");
                break;
            }
        }
    })
}

pub(crate) struct Peer {
    pub service: Arc<tokio::sync::Mutex<ConnectionService>>,
    pub session: SessionHandle,
}

/// Two connection services wired back to back over in-memory queues.
pub(crate) fn connection_pair(server_config: Config, client_config: Config) -> (Peer, Peer) {
    let _ = env_logger::try_init();

    let (server_session, server_rx) = SessionHandle::new();
    let (client_session, client_rx) = SessionHandle::new();

    let server = Arc::new(tokio::sync::Mutex::new(ConnectionService::new(
        server_session.clone(),
        Arc::new(server_config),
    )));
    let client = Arc::new(tokio::sync::Mutex::new(ConnectionService::new(
        client_session.clone(),
        Arc::new(client_config),
    )));

    pump(server_rx, Arc::clone(&client));
    pump(client_rx, Arc::clone(&server));

    (
        Peer {
            service: server,
            session: server_session,
        },
        Peer {
            service: client,
            session: client_session,
        },
    )
}

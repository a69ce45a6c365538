use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::channel::{Channel, ChannelMsg};
use crate::connection::ChannelFactory;
use crate::{Buffer, Config, OpenChannelError};

use super::connection_pair;

/// The client end of a remote forward: accepts `forwarded-tcpip`
/// channels and echoes whatever arrives.
struct ForwardedEcho;

#[async_trait]
impl ChannelFactory for ForwardedEcho {
    fn name(&self) -> &str {
        "forwarded-tcpip"
    }

    async fn open(
        &self,
        channel: Arc<Channel>,
        mut msgs: UnboundedReceiver<ChannelMsg>,
        extra: &mut Buffer,
    ) -> Result<(), OpenChannelError> {
        // connected address/port, then originator address/port.
        let _address = extra.get_str().map_err(|_| {
            OpenChannelError::new(crate::ChannelOpenFailure::ConnectFailed, "bad open payload")
        })?;
        tokio::spawn(async move {
            while let Some(msg) = msgs.recv().await {
                match msg {
                    ChannelMsg::Data { data } => {
                        if channel.data(&data).await.is_err() {
                            break;
                        }
                    }
                    ChannelMsg::Eof => {
                        let _ = channel.eof();
                    }
                    ChannelMsg::Close => break,
                    _ => {}
                }
            }
        });
        Ok(())
    }
}

#[tokio::test]
async fn global_port_forward_and_cancel() {
    let (server, client) = connection_pair(Config::default(), Config::default());
    client
        .service
        .lock()
        .await
        .add_channel_factory(Arc::new(ForwardedEcho));

    // Ask the peer to bind an ephemeral port; the reply carries the
    // port that was actually bound.
    let reply = client
        .service
        .lock()
        .await
        .request_tcpip_forward("127.0.0.1", 0)
        .unwrap();
    let port = tokio::time::timeout(Duration::from_secs(5), reply)
        .await
        .unwrap()
        .unwrap()
        .expect("forward request denied");
    assert_ne!(port, 0);

    // A connection to the bound port is tunneled to the client side
    // and echoed back.
    let mut socket = TcpStream::connect(("127.0.0.1", port as u16)).await.unwrap();
    socket.write_all(b"ping through the tunnel").await.unwrap();
    let mut buf = vec![0u8; 64];
    let n = tokio::time::timeout(Duration::from_secs(5), socket.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"ping through the tunnel");
    drop(socket);

    // Cancelling reports success and stops the listener.
    let reply = client
        .service
        .lock()
        .await
        .cancel_tcpip_forward("127.0.0.1", port)
        .unwrap();
    assert!(tokio::time::timeout(Duration::from_secs(5), reply)
        .await
        .unwrap()
        .unwrap());

    tokio::time::sleep(Duration::from_millis(50)).await;
    match TcpStream::connect(("127.0.0.1", port as u16)).await {
        Err(_) => {}
        Ok(mut socket) => {
            // The accept loop is gone; nothing answers.
            socket.write_all(b"anyone?").await.ok();
            let mut buf = [0u8; 8];
            match tokio::time::timeout(Duration::from_secs(1), socket.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => {}
                Ok(Ok(n)) => panic!("listener still alive, read {n} bytes"),
            }
        }
    }

    // Cancelling something that was never bound fails.
    let reply = client
        .service
        .lock()
        .await
        .cancel_tcpip_forward("127.0.0.1", 1)
        .unwrap();
    assert!(!tokio::time::timeout(Duration::from_secs(5), reply)
        .await
        .unwrap()
        .unwrap());

    server.service.lock().await.shutdown().await;
}

#[tokio::test]
async fn unknown_global_request_fails_cleanly() {
    let (_server, client) = connection_pair(Config::default(), Config::default());

    let (tx, rx) = tokio::sync::oneshot::channel();
    client
        .session
        .global_request(
            "no-such-request@example.com",
            true,
            |b| b.put_u32(1234),
            Some(crate::session::GlobalRequestResponse::TcpIpForward(tx)),
        )
        .unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, None);
}

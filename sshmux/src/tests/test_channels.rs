use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::channel::{Channel, ChannelEvent, ChannelMsg, ChannelState};
use crate::connection::ChannelFactory;
use crate::{Buffer, ChannelOpenFailure, Config, Error, OpenChannelError, Outcome, Service};

use super::connection_pair;

/// Accepts `session` channels and echoes everything back, including
/// EOF.
struct EchoSession;

#[async_trait]
impl ChannelFactory for EchoSession {
    fn name(&self) -> &str {
        "session"
    }

    async fn open(
        &self,
        channel: Arc<Channel>,
        mut msgs: UnboundedReceiver<ChannelMsg>,
        _extra: &mut Buffer,
    ) -> Result<(), OpenChannelError> {
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
async fn channel_open_echo_close() {
    let (server, client) = connection_pair(Config::default(), Config::default());
    server.service.lock().await.add_channel_factory(Arc::new(EchoSession));

    let (channel, mut msgs) = client.service.lock().await.open_session().unwrap();
    let opened = channel
        .wait_for(ChannelEvent::OPENED, Some(Duration::from_secs(5)))
        .await;
    assert_eq!(opened, ChannelEvent::OPENED);
    assert!(channel.remote_id().is_some());
    assert_eq!(channel.state(), ChannelState::Open);
    assert!(matches!(
        msgs.recv().await,
        Some(ChannelMsg::Open { .. })
    ));

    channel.request_shell(true).unwrap();
    assert!(matches!(msgs.recv().await, Some(ChannelMsg::Success)));

    channel.data(b"hi\n").await.unwrap();
    match msgs.recv().await {
        Some(ChannelMsg::Data { data }) => assert_eq!(&data, b"hi\n"),
        other => panic!("unexpected message {other:?}"),
    }

    channel.eof().unwrap();
    channel.close().unwrap();
    loop {
        match msgs.recv().await {
            Some(ChannelMsg::Eof) => continue,
            Some(ChannelMsg::Close) | None => break,
            other => panic!("unexpected message {other:?}"),
        }
    }
    assert_eq!(channel.state(), ChannelState::Closed);

    // Both registries forget the channel after the close handshake.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.service.lock().await.channel_count(), 0);
    assert_eq!(server.service.lock().await.channel_count(), 0);
}

#[tokio::test]
async fn local_ids_are_unique() {
    let (server, client) = connection_pair(Config::default(), Config::default());
    server.service.lock().await.add_channel_factory(Arc::new(EchoSession));

    let mut ids = std::collections::HashSet::new();
    for _ in 0..10 {
        let (channel, _msgs) = client.service.lock().await.open_session().unwrap();
        assert!(ids.insert(u32::from(channel.id())));
    }
    assert_eq!(client.service.lock().await.channel_count(), 10);
}

#[tokio::test]
async fn unknown_channel_type_is_refused() {
    let (_server, client) = connection_pair(Config::default(), Config::default());

    let (channel, mut msgs) = client
        .service
        .lock()
        .await
        .open_channel("no-such-type", |_| ())
        .unwrap();
    let outcome = channel.open_result().wait(Some(Duration::from_secs(5))).await.unwrap();
    match outcome.as_ref() {
        Outcome::Value(Err(e)) => {
            assert_eq!(e.reason, ChannelOpenFailure::UnknownChannelType)
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(matches!(
        msgs.recv().await,
        Some(ChannelMsg::OpenFailure(ChannelOpenFailure::UnknownChannelType))
    ));
    assert_eq!(channel.state(), ChannelState::Closed);
}

#[tokio::test]
async fn message_on_unknown_channel_is_a_protocol_error() {
    let (server, _client) = connection_pair(Config::default(), Config::default());

    let mut buf = Buffer::new();
    buf.put_u32(42); // recipient id nobody allocated
    buf.put_string(b"boo");
    let err = server
        .service
        .lock()
        .await
        .process(crate::msg::CHANNEL_DATA, &mut buf)
        .await
        .unwrap_err();
    match err {
        Error::UnknownChannel { cmd, id } => {
            assert_eq!(cmd, crate::msg::CHANNEL_DATA);
            assert_eq!(id, 42);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn refusing_factory_sends_open_failure() {
    struct Refuser;

    #[async_trait]
    impl ChannelFactory for Refuser {
        fn name(&self) -> &str {
            "session"
        }

        async fn open(
            &self,
            _channel: Arc<Channel>,
            _msgs: UnboundedReceiver<ChannelMsg>,
            _extra: &mut Buffer,
        ) -> Result<(), OpenChannelError> {
            Err(OpenChannelError::new(
                ChannelOpenFailure::AdministrativelyProhibited,
                "not today",
            ))
        }
    }

    let (server, client) = connection_pair(Config::default(), Config::default());
    server.service.lock().await.add_channel_factory(Arc::new(Refuser));

    let (channel, _msgs) = client.service.lock().await.open_session().unwrap();
    let outcome = channel.open_result().wait(Some(Duration::from_secs(5))).await.unwrap();
    match outcome.as_ref() {
        Outcome::Value(Err(e)) => {
            assert_eq!(e.reason, ChannelOpenFailure::AdministrativelyProhibited);
            assert_eq!(e.message, "not today");
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.service.lock().await.channel_count(), 0);
}

#[tokio::test]
async fn large_transfer_respects_flow_control() {
    // Windows far smaller than the transfer, so the echo only
    // completes if WINDOW_ADJUST keeps flowing both ways.
    let small = Config {
        window_size: 65536,
        ..Config::default()
    };
    let (server, client) = connection_pair(small.clone(), small);
    server.service.lock().await.add_channel_factory(Arc::new(EchoSession));

    let (channel, mut msgs) = client.service.lock().await.open_session().unwrap();
    channel
        .wait_for(ChannelEvent::OPENED, Some(Duration::from_secs(5)))
        .await;

    let payload: Vec<u8> = (0..1_000_000u32).map(|i| i as u8).collect();
    let writer = {
        let channel = Arc::clone(&channel);
        let payload = payload.clone();
        tokio::spawn(async move { channel.data(&payload).await })
    };

    let mut received = Vec::with_capacity(payload.len());
    while received.len() < payload.len() {
        match tokio::time::timeout(Duration::from_secs(10), msgs.recv()).await {
            Ok(Some(ChannelMsg::Data { data })) => received.extend_from_slice(&data),
            Ok(Some(ChannelMsg::Open { .. })) => continue,
            other => panic!("unexpected message {other:?}"),
        }
    }
    writer.await.unwrap().unwrap();
    assert_eq!(received, payload);

    // Both windows were re-opened along the way; neither is exhausted.
    assert!(channel.remote_window().size() > 0);
}

#[tokio::test]
async fn wait_for_reports_timeout_as_a_bit() {
    let (_server, client) = connection_pair(Config::default(), Config::default());
    let (channel, _msgs) = client.service.lock().await.open_channel("session", |_| ()).unwrap();

    let start = std::time::Instant::now();
    let got = channel
        .wait_for(ChannelEvent::EXIT_STATUS, Some(Duration::from_millis(100)))
        .await;
    assert_eq!(got, ChannelEvent::TIMEOUT);
    assert!(start.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn exit_status_is_sent_once() {
    let (server, client) = connection_pair(Config::default(), Config::default());

    struct ExitingSession;

    #[async_trait]
    impl ChannelFactory for ExitingSession {
        fn name(&self) -> &str {
            "session"
        }

        async fn open(
            &self,
            channel: Arc<Channel>,
            mut msgs: UnboundedReceiver<ChannelMsg>,
            _extra: &mut Buffer,
        ) -> Result<(), OpenChannelError> {
            tokio::spawn(async move {
                while let Some(msg) = msgs.recv().await {
                    if let ChannelMsg::Exec { .. } = msg {
                        // A second exit-status must be suppressed.
                        channel.exit_status(7).unwrap();
                        channel.exit_status(8).unwrap();
                        let _ = channel.eof();
                    }
                }
            });
            Ok(())
        }
    }

    server
        .service
        .lock()
        .await
        .add_channel_factory(Arc::new(ExitingSession));

    let (channel, mut msgs) = client.service.lock().await.open_session().unwrap();
    channel
        .wait_for(ChannelEvent::OPENED, Some(Duration::from_secs(5)))
        .await;
    channel.request_exec(true, b"exit 7").unwrap();

    let mut statuses = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(5), msgs.recv()).await {
            Ok(Some(ChannelMsg::ExitStatus { exit_status })) => statuses.push(exit_status),
            Ok(Some(ChannelMsg::Eof)) => break,
            Ok(Some(_)) => continue,
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(statuses, vec![7]);
    assert_eq!(
        channel
            .wait_for(ChannelEvent::EXIT_STATUS, Some(Duration::from_secs(1)))
            .await,
        ChannelEvent::EXIT_STATUS
    );
}

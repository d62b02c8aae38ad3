//! 会话管理器测试
//!
//! 覆盖订阅引用计数、断线重连与订阅恢复、凭证被拒、重连次数用尽以及关闭。

#[cfg(test)]
mod session_tests {
    use std::time::Duration;

    use domain::{ClientEvent, MessageBody, ServerEvent};

    use crate::channel::{Credential, CredentialStore, LinkFrame, RealtimeChannel};
    use crate::error::{ConnectionError, DecodeError};
    use crate::retry::{Backoff, RetryConfig};
    use crate::session::{ConnectionState, SessionManager, SessionPolicy, SessionSignal};
    use crate::test_support::*;

    fn policy(max_attempts: u32) -> SessionPolicy {
        SessionPolicy {
            retry: RetryConfig::new(
                max_attempts,
                Backoff::exponential(Duration::from_millis(100), Duration::from_secs(1)),
            ),
            ..SessionPolicy::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_establish_rejected_handshake() {
        let (connector, _remotes) = FakeConnector::new();
        connector.script(Err(ConnectionError::handshake_rejected("401 Unauthorized")));
        let store = CredentialStore::new();

        let result = SessionManager::establish(
            connector,
            store.clone(),
            Credential::new(user(), "bad"),
            policy(3),
        )
        .await;

        assert!(matches!(result, Err(ConnectionError::HandshakeRejected { .. })));
        // 失败的会话不会留下凭证
        assert!(store.current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscriptions_are_ref_counted() {
        let (connector, mut remotes) = FakeConnector::new();
        let (session, _inbound) = SessionManager::establish(
            connector,
            CredentialStore::new(),
            Credential::new(user(), "t1"),
            policy(3),
        )
        .await
        .unwrap();
        let mut remote = remotes.recv().await.unwrap();
        let room = room_id();

        session.subscribe(room).await.unwrap();
        session.subscribe(room).await.unwrap();
        assert_eq!(remote.next_sent().await, ClientEvent::Subscribe { room_id: room });

        session.unsubscribe(room).await.unwrap();
        assert!(remote.try_sent().is_none());

        session.unsubscribe(room).await.unwrap();
        assert_eq!(remote.next_sent().await, ClientEvent::Unsubscribe { room_id: room });
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_events_are_forwarded_and_garbage_dropped() {
        let (connector, mut remotes) = FakeConnector::new();
        let (_session, mut inbound) = SessionManager::establish(
            connector,
            CredentialStore::new(),
            Credential::new(user(), "t1"),
            policy(3),
        )
        .await
        .unwrap();
        let remote = remotes.recv().await.unwrap();
        let message = message(room_id(), user(), 0);

        remote.push_frame(Ok(LinkFrame::Undecodable(DecodeError::Malformed(
            "not json".into(),
        ))));
        remote.push(ServerEvent::Message(message.clone()));

        // 坏帧被丢弃，后面的事件照常到达
        let event = inbound.recv().await.unwrap();
        assert_eq!(event, ServerEvent::Message(message));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_replays_subscriptions() {
        let (connector, mut remotes) = FakeConnector::new();
        let (session, _inbound) = SessionManager::establish(
            connector.clone(),
            CredentialStore::new(),
            Credential::new(user(), "t1"),
            policy(5),
        )
        .await
        .unwrap();
        let mut signals = session.signals();
        let mut remote = remotes.recv().await.unwrap();
        let room = room_id();

        session.subscribe(room).await.unwrap();
        remote.next_sent().await;

        // 第一次重连失败，第二次成功
        connector.script(Err(ConnectionError::transport("connection refused")));
        drop(remote);

        assert!(matches!(
            signals.recv().await.unwrap(),
            SessionSignal::Disconnected { .. }
        ));
        assert_eq!(signals.recv().await.unwrap(), SessionSignal::Reconnected);

        let mut remote = remotes.recv().await.unwrap();
        assert_eq!(remote.next_sent().await, ClientEvent::Subscribe { room_id: room });
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(connector.tokens().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_disconnected_fails_fast() {
        let (connector, mut remotes) = FakeConnector::new();
        let (session, _inbound) = SessionManager::establish(
            connector.clone(),
            CredentialStore::new(),
            Credential::new(user(), "t1"),
            policy(2),
        )
        .await
        .unwrap();
        let mut signals = session.signals();
        let remote = remotes.recv().await.unwrap();

        connector.script(Err(ConnectionError::transport("down")));
        connector.script(Err(ConnectionError::transport("down")));
        drop(remote);

        loop {
            if let SessionSignal::RetriesExhausted { attempts } = signals.recv().await.unwrap() {
                assert_eq!(attempts, 2);
                break;
            }
        }
        assert_eq!(session.state(), ConnectionState::Disconnected);

        let result = session
            .send(ClientEvent::SendMessage {
                client_message_id: domain::MessageId::generate(),
                room_id: room_id(),
                body: MessageBody::text("hello"),
            })
            .await;
        assert_eq!(result, Err(ConnectionError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_credential_waits_for_rebind() {
        let (connector, mut remotes) = FakeConnector::new();
        let store = CredentialStore::new();
        let owner = user();
        let (session, _inbound) = SessionManager::establish(
            connector.clone(),
            store.clone(),
            Credential::new(owner, "expired"),
            policy(5),
        )
        .await
        .unwrap();
        let mut signals = session.signals();
        let room = room_id();
        session.subscribe(room).await.unwrap();
        let remote = remotes.recv().await.unwrap();

        connector.script(Err(ConnectionError::handshake_rejected("401")));
        drop(remote);

        loop {
            if let SessionSignal::CredentialRejected { .. } = signals.recv().await.unwrap() {
                break;
            }
        }
        // 被拒之后不会继续重试
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(connector.tokens(), vec!["expired", "expired"]);

        session
            .rebind(Credential::new(owner, "fresh"))
            .await
            .unwrap();
        assert_eq!(signals.recv().await.unwrap(), SessionSignal::Reconnected);

        let mut remote = remotes.recv().await.unwrap();
        assert_eq!(remote.next_sent().await, ClientEvent::Subscribe { room_id: room });
        assert_eq!(connector.tokens().last().unwrap(), "fresh");
        assert_eq!(store.current().unwrap().token(), "fresh");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebind_on_live_channel_reopens_immediately() {
        let (connector, mut remotes) = FakeConnector::new();
        let owner = user();
        let (session, _inbound) = SessionManager::establish(
            connector.clone(),
            CredentialStore::new(),
            Credential::new(owner, "t1"),
            policy(3),
        )
        .await
        .unwrap();
        let mut signals = session.signals();
        let _first = remotes.recv().await.unwrap();

        session.rebind(Credential::new(owner, "t2")).await.unwrap();
        assert_eq!(signals.recv().await.unwrap(), SessionSignal::Reconnected);
        assert_eq!(connector.tokens(), vec!["t1", "t2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_is_idempotent() {
        let (connector, _remotes) = FakeConnector::new();
        let store = CredentialStore::new();
        let (session, mut inbound) = SessionManager::establish(
            connector,
            store.clone(),
            Credential::new(user(), "t1"),
            policy(3),
        )
        .await
        .unwrap();

        session.teardown().await;
        session.teardown().await;

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(store.current().is_none());
        assert!(inbound.recv().await.is_none());
        assert_eq!(
            session.send(ClientEvent::Subscribe { room_id: room_id() }).await,
            Err(ConnectionError::Closed)
        );
    }
}

use std::{net::SocketAddr, time::Duration};

use anyhow::Result;
use futures::future::try_join_all;
use sack_chat::{
    config::{ServerConfig, SessionConfig},
    control::StopHandle,
    error::{ProtocolError, SessionError},
    protocol::{ChatCodec, ChatEvent, JoinStatus, Username, read_event, read_status, write_event},
    registry::MemberSnapshot,
    server::ChatServer,
    session::{ClientSession, SessionState},
};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpSocket, TcpStream},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_util::codec::FramedRead;

const WAIT: Duration = Duration::from_secs(2);

struct TestServer {
    addr: SocketAddr,
    stop: StopHandle,
    members: MemberSnapshot,
    task: JoinHandle<Result<()>>,
}

impl TestServer {
    async fn start() -> Result<Self> {
        Self::start_with(ServerConfig::new("127.0.0.1:0".parse()?)).await
    }

    async fn start_with(config: ServerConfig) -> Result<Self> {
        let server = ChatServer::bind(config).await?;
        let addr = server.local_addr()?;
        let stop = server.stop_handle();
        let members = server.members();
        let task = tokio::spawn(server.serve());
        Ok(Self {
            addr,
            stop,
            members,
            task,
        })
    }

    async fn join(&self, username: &str) -> Result<ClientSession> {
        let mut session = ClientSession::new(SessionConfig::new(self.addr.to_string()));
        session.connect().await?;
        session.join_request(username).await?;
        Ok(session)
    }

    /// Admission lands just after the `OK` reply, so poll for it.
    async fn wait_for_members(&self, expected: usize) -> Result<()> {
        timeout(WAIT, async {
            while self.members.len().await != expected {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;
        Ok(())
    }

    async fn shutdown(self) -> Result<()> {
        self.stop.stop();
        timeout(WAIT, self.task).await???;
        Ok(())
    }
}

fn name(raw: &str) -> Username {
    Username::new(raw).expect("valid username")
}

async fn next_from_others(session: &mut ClientSession) -> Result<ChatEvent> {
    Ok(timeout(WAIT, session.receive_from_others()).await??)
}

/// Skips joins that may have been queued before `session` was admitted.
async fn next_skipping_joins(session: &mut ClientSession) -> Result<ChatEvent> {
    loop {
        match next_from_others(session).await? {
            ChatEvent::Connect { .. } => continue,
            event => return Ok(event),
        }
    }
}

#[tokio::test]
async fn alice_and_bob_chat_then_bob_leaves() -> Result<()> {
    let server = TestServer::start().await?;

    let mut alice = server.join("alice").await?;
    let mut bob = server.join("bob").await?;
    server.wait_for_members(2).await?;

    assert_eq!(next_from_others(&mut alice).await?, ChatEvent::connect(name("bob")));

    alice.send_text("hi").await?;
    assert_eq!(next_from_others(&mut bob).await?, ChatEvent::text(name("alice"), "hi"));

    bob.disconnect().await;
    assert_eq!(bob.state(), SessionState::Closed);
    assert_eq!(next_from_others(&mut alice).await?, ChatEvent::disconnect(name("bob")));

    server.wait_for_members(1).await?;
    assert_eq!(server.members.usernames().await, vec![name("alice")]);

    server.shutdown().await
}

#[tokio::test]
async fn own_events_are_echoed_back() -> Result<()> {
    let server = TestServer::start().await?;
    let mut alice = server.join("alice").await?;

    assert_eq!(
        timeout(WAIT, alice.receive()).await??,
        ChatEvent::connect(name("alice"))
    );
    alice.send_text("echo").await?;
    assert_eq!(
        timeout(WAIT, alice.receive()).await??,
        ChatEvent::text(name("alice"), "echo")
    );

    server.shutdown().await
}

#[tokio::test]
async fn concurrent_distinct_joins_are_all_admitted() -> Result<()> {
    const CLIENTS: usize = 24;
    let server = TestServer::start().await?;

    let names: Vec<String> = (0..CLIENTS).map(|n| format!("user-{n}")).collect();
    let sessions = try_join_all(names.iter().map(|name| server.join(name))).await?;
    server.wait_for_members(CLIENTS).await?;

    let mut usernames = server.members.usernames().await;
    usernames.sort();
    let mut expected: Vec<_> = names.iter().map(|raw| name(raw)).collect();
    expected.sort();
    assert_eq!(usernames, expected);

    drop(sessions);
    server.shutdown().await
}

#[tokio::test]
async fn duplicate_username_is_rejected_and_stays_invisible() -> Result<()> {
    let server = TestServer::start().await?;
    let mut alice = server.join("alice").await?;

    let mut impostor = ClientSession::new(SessionConfig::new(server.addr.to_string()));
    impostor.connect().await?;
    let err = impostor.join_request("alice").await.expect_err("name taken");
    assert!(matches!(err, SessionError::UsernameTaken { ref username } if *username == "alice"));
    assert_eq!(impostor.state(), SessionState::Disconnected);

    let _carol = server.join("carol").await?;
    server.wait_for_members(2).await?;

    // Alice's first foreign event is carol; the rejected join left no trace.
    assert_eq!(next_from_others(&mut alice).await?, ChatEvent::connect(name("carol")));
    let mut usernames = server.members.usernames().await;
    usernames.sort();
    assert_eq!(usernames, vec![name("alice"), name("carol")]);

    // The rejected session may retry under another name.
    impostor.connect().await?;
    impostor.join_request("mallory").await?;
    assert_eq!(next_from_others(&mut alice).await?, ChatEvent::connect(name("mallory")));

    server.shutdown().await
}

#[tokio::test]
async fn texts_arrive_byte_identical_and_in_send_order() -> Result<()> {
    let server = TestServer::start().await?;
    let mut alice = server.join("alice").await?;
    let mut bob = server.join("bob").await?;
    server.wait_for_members(2).await?;

    let messages: Vec<String> = (0..50)
        .map(|n| format!("message {n}: ünïcødé, \"quotes\", tabs\tand\nnewlines"))
        .collect();
    for message in &messages {
        alice.send_text(message).await?;
    }

    for message in &messages {
        assert_eq!(
            next_skipping_joins(&mut bob).await?,
            ChatEvent::text(name("alice"), message.as_str())
        );
    }

    server.shutdown().await
}

#[tokio::test]
async fn large_and_escape_heavy_texts_arrive_intact() -> Result<()> {
    let server = TestServer::start().await?;
    let mut alice = server.join("alice").await?;
    let mut bob = server.join("bob").await?;
    server.wait_for_members(2).await?;

    // Both encode to well over 64 KiB of JSON.
    let long = "x".repeat(70_000);
    let escaped = "\u{1}".repeat(12_000);
    alice.send_text(&long).await?;
    alice.send_text(&escaped).await?;

    assert_eq!(next_skipping_joins(&mut bob).await?, ChatEvent::text(name("alice"), long));
    assert_eq!(next_skipping_joins(&mut bob).await?, ChatEvent::text(name("alice"), escaped));

    server.shutdown().await
}

#[tokio::test]
async fn stalled_member_is_evicted_without_slowing_the_room() -> Result<()> {
    const TEXTS: usize = 120;
    let config = ServerConfig {
        write_timeout: Duration::from_millis(100),
        ..ServerConfig::new("127.0.0.1:0".parse()?)
    };
    let server = TestServer::start_with(config).await?;

    // A tiny receive window, and nobody reading it until the end.
    let socket = TcpSocket::new_v4()?;
    socket.set_recv_buffer_size(4096)?;
    let (read, mut write) = socket.connect(server.addr).await?.into_split();
    let mut slow = FramedRead::new(read, ChatCodec::new());
    write_event(&mut write, &ChatEvent::connect(name("slow"))).await?;
    assert_eq!(read_status(&mut slow).await?, JoinStatus::Accepted);

    let mut bob = server.join("bob").await?;
    let alice = server.join("alice").await?;
    server.wait_for_members(3).await?;

    let (mut alice_reader, mut alice_writer) = alice.into_split()?;
    let echoes = tokio::spawn(async move { while alice_reader.receive().await.is_ok() {} });

    let body = "m".repeat(60_000);
    let expected = body.clone();
    let collector = tokio::spawn(async move {
        let mut texts = 0;
        let mut saw_after = false;
        let mut saw_eviction = false;
        while !(saw_after && saw_eviction) {
            match bob.receive_from_others().await? {
                ChatEvent::Text { text, .. } if text == "after" => saw_after = true,
                ChatEvent::Text { text, .. } => {
                    assert_eq!(text, expected);
                    texts += 1;
                }
                ChatEvent::Disconnect { username } if username == name("slow") => saw_eviction = true,
                _ => {}
            }
        }
        Ok::<_, SessionError>((texts, bob))
    });

    for _ in 0..TEXTS {
        alice_writer.send_text(&body).await?;
    }
    alice_writer.send_text("after").await?;

    // Serial writes would cost the write timeout per frame: twelve seconds here.
    let (texts, _bob) = timeout(Duration::from_secs(5), collector).await???;
    assert_eq!(texts, TEXTS);
    server.wait_for_members(2).await?;

    // Whatever reached the stalled socket is whole frames, then the end.
    timeout(Duration::from_secs(5), async {
        loop {
            match read_event(&mut slow).await {
                Ok(Some(ChatEvent::Connect { .. })) => {}
                Ok(Some(ChatEvent::Text { username, text })) => {
                    assert_eq!(username, name("alice"));
                    assert_eq!(text, body);
                }
                Ok(Some(other)) => panic!("unexpected event after stall: {other:?}"),
                Ok(None) => break,
                Err(err) => {
                    assert!(
                        matches!(err, ProtocolError::TruncatedFrame { .. } | ProtocolError::Io(_)),
                        "stream desynced: {err}"
                    );
                    break;
                }
            }
        }
    })
    .await?;

    alice_writer.disconnect().await;
    echoes.abort();
    server.shutdown().await
}

#[tokio::test]
async fn disconnect_is_announced_exactly_once() -> Result<()> {
    let server = TestServer::start().await?;
    let mut alice = server.join("alice").await?;
    let mut bob = server.join("bob").await?;
    let mut carol = server.join("carol").await?;
    server.wait_for_members(3).await?;

    assert_eq!(next_from_others(&mut alice).await?, ChatEvent::connect(name("bob")));
    assert_eq!(next_from_others(&mut alice).await?, ChatEvent::connect(name("carol")));

    bob.disconnect().await;
    bob.disconnect().await;

    assert_eq!(next_from_others(&mut alice).await?, ChatEvent::disconnect(name("bob")));
    assert_eq!(next_skipping_joins(&mut carol).await?, ChatEvent::disconnect(name("bob")));

    alice.send_text("after").await?;
    assert_eq!(next_from_others(&mut carol).await?, ChatEvent::text(name("alice"), "after"));

    server.wait_for_members(2).await?;
    server.shutdown().await
}

#[tokio::test]
async fn malformed_frame_drops_only_that_connection() -> Result<()> {
    let server = TestServer::start().await?;
    let mut alice = server.join("alice").await?;

    let (read, mut write) = TcpStream::connect(server.addr).await?.into_split();
    let mut mallory = FramedRead::new(read, ChatCodec::new());
    write_event(&mut write, &ChatEvent::connect(name("mallory"))).await?;
    assert_eq!(read_status(&mut mallory).await?, JoinStatus::Accepted);
    assert_eq!(next_from_others(&mut alice).await?, ChatEvent::connect(name("mallory")));

    write.write_all(&[0xff, 0xff, 0xff, 0xff, b'{']).await?;

    assert_eq!(next_from_others(&mut alice).await?, ChatEvent::disconnect(name("mallory")));
    alice.send_text("still serving").await?;
    assert_eq!(
        timeout(WAIT, alice.receive()).await??,
        ChatEvent::text(name("alice"), "still serving")
    );

    server.shutdown().await
}

#[tokio::test]
async fn stop_returns_promptly_and_closes_every_socket() -> Result<()> {
    let server = TestServer::start().await?;

    let mut sessions = Vec::new();
    for n in 0..16 {
        sessions.push(server.join(&format!("client-{n}")).await?);
    }
    // A connection that never joins must not hold up shutdown either.
    let _lurker = TcpStream::connect(server.addr).await?;
    server.wait_for_members(16).await?;

    server.shutdown().await?;

    for session in &mut sessions {
        let outcome = timeout(WAIT, async {
            loop {
                match session.receive().await {
                    Ok(_) => continue,
                    Err(err) => return err,
                }
            }
        })
        .await?;
        assert!(matches!(outcome, SessionError::ServerDown), "got {outcome:?}");
        assert_eq!(session.state(), SessionState::Disconnected);
    }
    Ok(())
}

#[tokio::test]
async fn split_reader_sees_closed_after_local_disconnect() -> Result<()> {
    let server = TestServer::start().await?;
    let mut bob = server.join("bob").await?;
    let alice = server.join("alice").await?;
    server.wait_for_members(2).await?;

    let (mut reader, mut writer) = alice.into_split()?;
    writer.send_text("split hello").await?;
    assert_eq!(next_from_others(&mut bob).await?, ChatEvent::connect(name("alice")));
    assert_eq!(next_from_others(&mut bob).await?, ChatEvent::text(name("alice"), "split hello"));

    writer.disconnect().await;
    let outcome = timeout(WAIT, async {
        loop {
            match reader.receive().await {
                Ok(_) => continue,
                Err(err) => return err,
            }
        }
    })
    .await?;
    assert!(matches!(outcome, SessionError::Closed), "got {outcome:?}");
    assert!(matches!(writer.send_text("late").await, Err(SessionError::Closed)));

    assert_eq!(next_from_others(&mut bob).await?, ChatEvent::disconnect(name("alice")));
    server.shutdown().await
}

#[tokio::test]
async fn serve_until_stops_when_the_future_resolves() -> Result<()> {
    let server = ChatServer::bind(ServerConfig::new("127.0.0.1:0".parse()?)).await?;
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let task = tokio::spawn(server.serve_until(async move {
        let _ = rx.await;
    }));

    let _ = tx.send(());
    timeout(WAIT, task).await???;
    Ok(())
}

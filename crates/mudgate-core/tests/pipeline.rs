//! End-to-end pipeline test: raw bytes in, ordered structured events out.

use mudgate_core::block::Entry;
use mudgate_core::classify::NoopTagger;
use mudgate_core::connection::{ConnectionEvent, GameConnection};
use mudgate_core::replay::BufferedSession;
use mudgate_core::session::{NoopTabulator, ParsedSession, SessionEvent};
use mudgate_core::splitter::DirtyTailPolicy;
use std::sync::Arc;
use tokio::sync::mpsc;

struct ScriptedConnection {
    events: Option<mpsc::Receiver<ConnectionEvent>>,
}

impl ScriptedConnection {
    fn new() -> (Self, mpsc::Sender<ConnectionEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (Self { events: Some(rx) }, tx)
    }
}

impl GameConnection for ScriptedConnection {
    fn take_events(&mut self) -> Option<mpsc::Receiver<ConnectionEvent>> {
        self.events.take()
    }
    fn write(&self, _text: &str) {}
    fn close(&self) {}
    fn pause(&self) {}
    fn resume(&self) {}
}

async fn session() -> (BufferedSession, mpsc::Sender<ConnectionEvent>) {
    let (conn, feed) = ScriptedConnection::new();
    let parsed = ParsedSession::new(
        Box::new(conn),
        Arc::new(NoopTagger),
        Arc::new(NoopTabulator),
        DirtyTailPolicy::ProtocolOnly,
    )
    .expect("fresh connection");
    let buffered = BufferedSession::new("tester".into(), parsed, 100);
    feed.send(ConnectionEvent::Connected).await.unwrap();
    feed.send(ConnectionEvent::LoginResult {
        success: true,
        reason: None,
    })
    .await
    .unwrap();
    (buffered, feed)
}

#[tokio::test]
async fn bytes_become_ordered_blocks_and_replay_matches() {
    let (buffered, feed) = session().await;
    let mut rx = buffered.subscribe();

    // Two game output bursts, each terminated by IAC GA, arriving
    // fragmented mid-line and even mid-marker.
    feed.send(ConnectionEvent::Data(b"You say, \"hel".to_vec()))
        .await
        .unwrap();
    feed.send(ConnectionEvent::Data(
        b"lo\"\r\n100/100h, 50/50m lr -\xFF".to_vec(),
    ))
    .await
    .unwrap();
    feed.send(ConnectionEvent::Data(b"\xF9".to_vec())).await.unwrap();
    feed.send(ConnectionEvent::Data(
        b"Billum says, \"well met\"\r\n99/100h, 50/50m lr -\xFF\xF9".to_vec(),
    ))
    .await
    .unwrap();

    let mut live = Vec::new();
    while live.len() < 2 {
        match rx.recv().await.unwrap() {
            SessionEvent::Block(block) => live.push(block),
            _ => continue,
        }
    }

    // First block: our own speech; second: Billum's.
    match &live[0].entries[0] {
        Entry::Comms(c) => assert!(c.who.is_none()),
        other => panic!("unexpected {other:?}"),
    }
    match &live[1].entries[0] {
        Entry::Comms(c) => assert_eq!(c.who.as_deref(), Some("Billum")),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(live[0].prompt.as_deref(), Some("100/100h, 50/50m lr -"));
    let vars = live[0].prompt_vars.as_ref().expect("vitals parse");
    assert_eq!((vars.health, vars.mana_max), (100, 50));

    // The replay buffer holds exactly the live history, in order.
    let mut replayed = Vec::new();
    buffered.replay(|entry| replayed.push(entry.block.clone()));
    assert_eq!(replayed, live);
}

#[tokio::test]
async fn protocol_lines_stay_out_of_band() {
    let (buffered, feed) = session().await;
    let mut rx = buffered.subscribe();

    feed.send(ConnectionEvent::Data(
        b"###channel ccg Loremasters\r\nplain text\r\nprompt\xFF\xF9".to_vec(),
    ))
    .await
    .unwrap();

    let mut protocol = None;
    let mut block = None;
    while block.is_none() {
        match rx.recv().await.unwrap() {
            SessionEvent::Protocol(p) => protocol = Some(p),
            SessionEvent::Block(b) => block = Some(b),
            _ => continue,
        }
    }

    let protocol = protocol.expect("guild membership event");
    assert_eq!(protocol.code, "guild");
    assert_eq!(protocol.content, "Loremasters");
    assert_eq!(
        buffered.protocol_state().get("guild").map(String::as_str),
        Some("Loremasters")
    );

    // The block carries the channel entry and the plain line, in order.
    let block = block.unwrap();
    assert_eq!(block.entries.len(), 2);
    assert!(matches!(&block.entries[0], Entry::Channel(c) if c.name == "Loremasters"));
    assert!(matches!(&block.entries[1], Entry::Line(_)));
}

#[tokio::test]
async fn disconnect_reaches_subscribers() {
    let (buffered, feed) = session().await;
    let mut rx = buffered.subscribe();

    feed.send(ConnectionEvent::Disconnected { had_error: true })
        .await
        .unwrap();

    loop {
        match rx.recv().await.unwrap() {
            SessionEvent::Disconnected { had_error } => {
                assert!(had_error);
                break;
            }
            _ => continue,
        }
    }
}

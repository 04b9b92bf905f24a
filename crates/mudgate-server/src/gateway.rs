//! WebSocket gateway: the front-end transport.
//!
//! One task per browser connection. JSON command messages come in,
//! session events go out; a fresh connect replays buffered history before
//! following the live stream, and a dropped socket pauses the game session
//! instead of closing it.

use crate::directory::ConnectionDirectory;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use mudgate_core::block::Block;
use mudgate_core::classify::ProtocolMsg;
use mudgate_core::replay::BufferedSession;
use mudgate_core::session::SessionEvent;
use mudgate_core::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Messages the front end sends.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ClientMsg {
    #[serde(rename = "connect game")]
    ConnectGame {
        username: String,
        password: String,
        #[serde(default)]
        realm: Option<String>,
        #[serde(default, rename = "replayFrom")]
        replay_from: Option<u64>,
    },
    #[serde(rename = "send")]
    Send { text: String },
    #[serde(rename = "logout")]
    Logout,
    #[serde(rename = "log")]
    Log { msg: String },
}

/// Messages the gateway sends.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ServerMsg {
    #[serde(rename = "connect game ok")]
    ConnectGameOk,
    #[serde(rename = "login result")]
    LoginResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename = "login failure")]
    LoginFailure { reason: String },
    #[serde(rename = "block")]
    Block {
        #[serde(flatten)]
        block: Block,
    },
    #[serde(rename = "protocol")]
    Protocol {
        #[serde(flatten)]
        msg: ProtocolMsg,
    },
    #[serde(rename = "game connected")]
    GameConnected,
    #[serde(rename = "game disconnected")]
    GameDisconnected { had_error: bool },
}

/// Accept front-end connections forever.
pub async fn run(bind: &str, directory: Arc<ConnectionDirectory>) -> BridgeResult<()> {
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|e| BridgeError::Connection(format!("gateway bind {bind}: {e}")))?;
    info!(addr = %bind, "gateway listening");

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let directory = directory.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, addr, directory).await {
                        debug!(remote = %addr, error = %e, "front-end connection ended");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "TCP accept failed");
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    addr: SocketAddr,
    directory: Arc<ConnectionDirectory>,
) -> BridgeResult<()> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| BridgeError::Connection(format!("WS handshake: {e}")))?;
    info!(remote = %addr, "front-end connected");
    let (sink, mut stream) = ws.split();

    let (out_tx, out_rx) = mpsc::channel::<ServerMsg>(256);
    let writer = tokio::spawn(write_out(sink, out_rx));

    let mut session: Option<Arc<BufferedSession>> = None;
    let mut forwarder: Option<JoinHandle<()>> = None;
    let mut username = String::from("<unknown>");

    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                debug!(remote = %addr, error = %e, "WS read error");
                break;
            }
        };
        match msg {
            Message::Text(text) => {
                let cmd = match serde_json::from_str::<ClientMsg>(text.as_ref()) {
                    Ok(cmd) => cmd,
                    Err(e) => {
                        warn!(remote = %addr, error = %e, "unparseable client message");
                        continue;
                    }
                };
                match cmd {
                    ClientMsg::ConnectGame {
                        username: user,
                        password,
                        realm,
                        replay_from,
                    } => {
                        username = user.clone();
                        match directory.get(&user, &password, realm).await {
                            Ok(s) => {
                                attach(&s, addr, replay_from, &out_tx, &mut forwarder).await;
                                session = Some(s);
                            }
                            Err(BridgeError::LoginFailed(reason)) => {
                                warn!(user = %user, reason = %reason, "login failure");
                                let _ = out_tx.send(ServerMsg::LoginFailure { reason }).await;
                            }
                            Err(e) => {
                                warn!(user = %user, error = %e, "game connect failed");
                                let _ = out_tx
                                    .send(ServerMsg::LoginFailure {
                                        reason: e.to_string(),
                                    })
                                    .await;
                            }
                        }
                    }
                    ClientMsg::Send { text } => match &session {
                        Some(s) => s.write(&format!("{text}\r\n")),
                        None => debug!(user = %username, "send with no game session"),
                    },
                    ClientMsg::Logout => {
                        if let Some(s) = &session {
                            s.write("qq\r\n");
                        }
                    }
                    ClientMsg::Log { msg } => info!(user = %username, msg = %msg, "client log"),
                }
            }
            Message::Close(_) => break,
            // Pings are answered by the protocol layer on the next flush.
            _ => {}
        }
    }

    info!(remote = %addr, user = %username, "front-end disconnected");
    if let Some(s) = &session {
        // The game session survives for a later reconnect.
        s.pause();
    }
    if let Some(f) = forwarder {
        f.abort();
    }
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

/// Wire a resolved session to this front end: acknowledge, replay history,
/// refresh macros, replay protocol state, then follow the live stream.
async fn attach(
    session: &Arc<BufferedSession>,
    addr: SocketAddr,
    replay_from: Option<u64>,
    out_tx: &mpsc::Sender<ServerMsg>,
    forwarder: &mut Option<JoinHandle<()>>,
) {
    session.write(&format!("###ack connect@ {addr}\r\n"));
    let _ = out_tx.send(ServerMsg::ConnectGameOk).await;

    let mut backlog = Vec::new();
    let rx = session.catch_up(replay_from, |entry| backlog.push(entry.block.clone()));
    for block in backlog {
        let _ = out_tx.send(ServerMsg::Block { block }).await;
    }

    session.write("MM\r\n");
    for (code, content) in session.protocol_state() {
        let _ = out_tx
            .send(ServerMsg::Protocol {
                msg: ProtocolMsg::new(code, content),
            })
            .await;
    }

    if let Some(old) = forwarder.take() {
        old.abort();
    }
    *forwarder = Some(tokio::spawn(forward_session(rx, out_tx.clone())));
}

/// Map live session events onto the wire, preserving emission order.
async fn forward_session(
    mut rx: broadcast::Receiver<SessionEvent>,
    out: mpsc::Sender<ServerMsg>,
) {
    loop {
        let msg = match rx.recv().await {
            Ok(SessionEvent::Block(block)) => ServerMsg::Block { block },
            Ok(SessionEvent::Protocol(msg)) => ServerMsg::Protocol { msg },
            Ok(SessionEvent::LoginResult { success, reason }) => {
                ServerMsg::LoginResult { success, reason }
            }
            Ok(SessionEvent::Connected) => ServerMsg::GameConnected,
            Ok(SessionEvent::Disconnected { had_error }) => {
                let _ = out.send(ServerMsg::GameDisconnected { had_error }).await;
                break;
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "front end fell behind the session stream");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if out.send(msg).await.is_err() {
            break;
        }
    }
}

async fn write_out(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut rx: mpsc::Receiver<ServerMsg>,
) {
    while let Some(msg) = rx.recv().await {
        match serde_json::to_string(&msg) {
            Ok(text) => {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            Err(e) => error!(error = %e, "failed to serialize gateway message"),
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_parse() {
        let msg: ClientMsg = serde_json::from_str(
            r#"{"type":"connect game","username":"tester","password":"secret","replayFrom":123}"#,
        )
        .unwrap();
        match msg {
            ClientMsg::ConnectGame {
                username,
                replay_from,
                realm,
                ..
            } => {
                assert_eq!(username, "tester");
                assert_eq!(replay_from, Some(123));
                assert!(realm.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }

        let msg: ClientMsg =
            serde_json::from_str(r#"{"type":"send","text":"look"}"#).unwrap();
        assert!(matches!(msg, ClientMsg::Send { text } if text == "look"));
    }

    #[tokio::test]
    async fn front_end_round_trip() {
        use crate::config::ServerConfig;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // A loopback game: login exchange, then answer "look" with a burst.
        let game = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let game_addr = game.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = game.accept().await.unwrap();
            let mut buf = [0u8; 512];
            sock.write_all(b"What is your name? ").await.unwrap();
            let _ = sock.read(&mut buf).await;
            sock.write_all(b"password: ").await.unwrap();
            let _ = sock.read(&mut buf).await;
            sock.write_all(b"###ack login ok\r\n").await.unwrap();
            loop {
                match sock.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if String::from_utf8_lossy(&buf[..n]).contains("look") {
                            sock.write_all(
                                b"You see a plaza.\r\n100/100h, 50/50m lr -\xFF\xF9",
                            )
                            .await
                            .unwrap();
                        }
                    }
                }
            }
        });

        let mut config = ServerConfig::load(None, None, None, None).unwrap();
        config.game.host = game_addr.ip().to_string();
        config.game.port = game_addr.port();
        let directory = Arc::new(ConnectionDirectory::new(config).unwrap());

        // Gateway side on a loopback socket.
        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, peer) = front.accept().await.unwrap();
            let _ = handle_client(stream, peer, directory).await;
        });

        let stream = TcpStream::connect(front_addr).await.unwrap();
        let (mut ws, _) = tokio_tungstenite::client_async("ws://localhost/", stream)
            .await
            .unwrap();

        ws.send(Message::Text(
            r#"{"type":"connect game","username":"tester","password":"secret"}"#.into(),
        ))
        .await
        .unwrap();

        let mut connected = false;
        let mut block: Option<serde_json::Value> = None;
        while block.is_none() {
            let msg = ws.next().await.expect("gateway open").unwrap();
            let Message::Text(text) = msg else { continue };
            let v: serde_json::Value = serde_json::from_str(text.as_ref()).unwrap();
            match v["type"].as_str() {
                Some("connect game ok") => {
                    connected = true;
                    ws.send(Message::Text(r#"{"type":"send","text":"look"}"#.into()))
                        .await
                        .unwrap();
                }
                Some("block") => block = Some(v),
                _ => {}
            }
        }

        assert!(connected);
        let block = block.unwrap();
        assert_eq!(block["qual"], "root");
        assert_eq!(block["prompt"], "100/100h, 50/50m lr -");
        assert_eq!(block["entries"][0]["line"], "You see a plaza.");
        assert_eq!(block["promptVars"]["health"], 100);
    }

    #[test]
    fn server_messages_have_flat_wire_shape() {
        let mut block = Block::new("root");
        block.emitted = Some(42);
        let v = serde_json::to_value(ServerMsg::Block { block }).unwrap();
        assert_eq!(v["type"], "block");
        assert_eq!(v["qual"], "root");
        assert_eq!(v["emitted"], 42);

        let v = serde_json::to_value(ServerMsg::Protocol {
            msg: ProtocolMsg::new("city", "Mercinae"),
        })
        .unwrap();
        assert_eq!(v["type"], "protocol");
        assert_eq!(v["code"], "city");
        assert_eq!(v["content"], "Mercinae");

        let v = serde_json::to_value(ServerMsg::LoginResult {
            success: true,
            reason: None,
        })
        .unwrap();
        assert_eq!(v["type"], "login result");
        assert_eq!(v["success"], true);
        assert!(v.get("reason").is_none());
    }
}

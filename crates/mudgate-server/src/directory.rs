//! Connection directory: one live game session per login key.
//!
//! Front-end connects are resolved here: an existing session for the same
//! key is reused (that is what makes reconnect-with-replay work), otherwise
//! a new telnet session is dialed and registered once its login succeeds.

use crate::config::ServerConfig;
use crate::replaceable::ReplaceableTagger;
use crate::tabulate::ColumnTabulator;
use crate::telnet::TelnetConnection;
use mudgate_core::classify::LineTagger;
use mudgate_core::connection::ConnectParams;
use mudgate_core::replay::BufferedSession;
use mudgate_core::session::{session_key, ParsedSession, SessionEvent, Tabulator};
use mudgate_core::{BridgeError, BridgeResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// How long a dialed session may take to resolve its login.
const LOGIN_TIMEOUT: Duration = Duration::from_secs(45);

pub struct ConnectionDirectory {
    config: ServerConfig,
    tagger: Arc<dyn LineTagger>,
    tabulator: Arc<dyn Tabulator>,
    sessions: Mutex<HashMap<String, Arc<BufferedSession>>>,
}

impl ConnectionDirectory {
    pub fn new(config: ServerConfig) -> BridgeResult<Self> {
        let tagger: Arc<dyn LineTagger> =
            Arc::new(ReplaceableTagger::new(&config.replaceable_rules)?);
        Ok(Self {
            config,
            tagger,
            tabulator: Arc::new(ColumnTabulator),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Resolve a login to a running session, dialing the game if needed.
    ///
    /// A failed login surfaces as `BridgeError::LoginFailed` with the
    /// game's reason; retrying is the caller's decision.
    pub async fn get(
        self: &Arc<Self>,
        username: &str,
        password: &str,
        realm: Option<String>,
    ) -> BridgeResult<Arc<BufferedSession>> {
        let realm = realm.unwrap_or_else(|| self.config.game.realm.clone());
        let key = session_key(username, Some(&realm));

        if let Some(existing) = self.sessions.lock().await.get(&key) {
            info!(session = %key, "reusing live session");
            existing.resume();
            return Ok(existing.clone());
        }

        let params = ConnectParams {
            host: self.config.game.host.clone(),
            port: self.config.game.port,
            username: username.to_string(),
            password: password.to_string(),
            realm: Some(realm),
        };
        let conn = TelnetConnection::connect(&params, &self.config.game).await?;
        let parsed = ParsedSession::new(
            Box::new(conn),
            self.tagger.clone(),
            self.tabulator.clone(),
            self.config.dirty_tail_policy,
        )?;
        let session = Arc::new(BufferedSession::new(
            key.clone(),
            parsed,
            self.config.replay_capacity,
        ));

        let outcome = tokio::time::timeout(LOGIN_TIMEOUT, session.wait_login())
            .await
            .map_err(|_| BridgeError::Timeout)??;
        if !outcome.success {
            return Err(BridgeError::LoginFailed(
                outcome
                    .reason
                    .unwrap_or_else(|| "login rejected by game server".to_string()),
            ));
        }

        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(&key) {
            // A concurrent login for the same key won the race.
            warn!(session = %key, "duplicate login, keeping the established session");
            session.close();
            return Ok(existing.clone());
        }
        sessions.insert(key.clone(), session.clone());
        drop(sessions);

        info!(session = %key, "session registered");
        self.spawn_reaper(key, &session);
        Ok(session)
    }

    /// Number of registered sessions.
    pub async fn count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Remove the session from the directory when its game connection
    /// ends. Only the exact registered instance is removed, so a newer
    /// session under the same key is never clobbered.
    fn spawn_reaper(self: &Arc<Self>, key: String, session: &Arc<BufferedSession>) {
        let directory = self.clone();
        let session = session.clone();
        let mut rx = session.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(SessionEvent::Disconnected { .. })
                    | Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        let mut sessions = directory.sessions.lock().await;
                        if let Some(current) = sessions.get(&key) {
                            if Arc::ptr_eq(current, &session) {
                                sessions.remove(&key);
                                info!(session = %key, "session removed from directory");
                            }
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                }
            }
        });
    }
}

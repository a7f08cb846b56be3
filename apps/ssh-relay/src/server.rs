//! SSH transport glue: public-key auth against the registry, PTY/shell/exec
//! channel requests, and one [`RelaySession`] per interactive channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use relay_proto::Geometry;
use russh::server::{self, Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty};
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use tracing::{debug, info, warn};

use crate::auth::{AuthOutcome, Authorizer};
use crate::repo::selector_from_command;
use crate::session::{client_channel, ClientEvents, ClientSink, RelayConfig, RelaySession, SessionRequest};

pub struct ServerShared {
    pub authorizer: Authorizer,
    pub relay: Arc<RelayConfig>,
}

#[derive(Clone)]
pub struct RelayServer {
    shared: Arc<ServerShared>,
}

impl RelayServer {
    pub fn new(authorizer: Authorizer, relay: RelayConfig) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                authorizer,
                relay: Arc::new(relay),
            }),
        }
    }
}

impl server::Server for RelayServer {
    type Handler = RelayHandler;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> RelayHandler {
        debug!(peer = ?peer, "ssh connection accepted");
        RelayHandler {
            shared: self.shared.clone(),
            peer,
            fingerprint: None,
            auth: None,
            channels: HashMap::new(),
        }
    }
}

#[derive(Default)]
struct ChannelState {
    geometry: Option<Geometry>,
    events: Option<ClientEvents>,
}

/// Connection-scoped state. Authentication happens once per connection; each
/// session channel gets its own relay.
pub struct RelayHandler {
    shared: Arc<ServerShared>,
    peer: Option<SocketAddr>,
    fingerprint: Option<String>,
    auth: Option<AuthOutcome>,
    channels: HashMap<ChannelId, ChannelState>,
}

impl RelayHandler {
    fn start_relay(&mut self, channel: ChannelId, repo: Option<String>, session: &mut Session) {
        let Some(state) = self.channels.get_mut(&channel) else {
            session.channel_failure(channel);
            return;
        };
        if state.events.is_some() {
            // A channel runs at most one shell or exec.
            session.channel_failure(channel);
            return;
        }
        session.channel_success(channel);

        let (events, streams) = client_channel();
        state.events = Some(events);
        let request = SessionRequest {
            fingerprint: self.fingerprint.clone(),
            auth: self.auth.clone(),
            geometry: state.geometry,
            repo,
        };
        let handle = session.handle();
        let sink: Arc<dyn ClientSink> = Arc::new(ChannelSink {
            handle: handle.clone(),
            channel,
        });
        let relay = self.shared.relay.clone();
        let peer = self.peer;

        tokio::spawn(async move {
            let mut relay_session = RelaySession::new(relay);
            let code = relay_session.run(request, sink, streams).await;
            debug!(peer = ?peer, code, "closing ssh channel");
            let _ = handle.exit_status_request(channel, code).await;
            let _ = handle.eof(channel).await;
            let _ = handle.close(channel).await;
        });
    }
}

#[async_trait]
impl server::Handler for RelayHandler {
    type Error = anyhow::Error;

    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        let fingerprint = format!("SHA256:{}", public_key.fingerprint());
        let outcome = self
            .shared
            .authorizer
            .authorize(&fingerprint, &public_key.public_key_bytes())
            .await;
        debug!(user, fingerprint = %fingerprint, outcome = ?outcome, "public key offered");

        if !outcome.admits() {
            return Ok(Auth::Reject {
                proceed_with_methods: None,
            });
        }
        self.fingerprint = Some(fingerprint);
        self.auth = Some(outcome);
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(channel.id(), ChannelState::default());
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        match self.channels.get_mut(&channel) {
            Some(state) => {
                debug!(term, cols = col_width, rows = row_height, "pty requested");
                state.geometry = Some(Geometry::new(col_width, row_height));
                session.channel_success(channel);
            }
            None => session.channel_failure(channel),
        }
        Ok(())
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        self.start_relay(channel, None, session);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data);
        let repo = selector_from_command(&command);
        if let Some(repo) = &repo {
            info!(repo = %repo, "workspace selector requested");
        }
        self.start_relay(channel, repo, session);
        Ok(())
    }

    async fn data(&mut self, channel: ChannelId, data: &[u8], _session: &mut Session) -> Result<(), Self::Error> {
        if let Some(events) = self.channels.get(&channel).and_then(|state| state.events.as_ref()) {
            events.input(data);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            let geometry = Geometry::new(col_width, row_height);
            state.geometry = Some(geometry);
            if let Some(events) = &state.events {
                events.resize(geometry);
            }
        }
        Ok(())
    }

    async fn channel_eof(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        // Output and window changes keep flowing until the channel closes.
        if let Some(events) = self
            .channels
            .get_mut(&channel)
            .and_then(|state| state.events.as_mut())
        {
            events.end_input();
        }
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        // Dropping the events ends a relay that is still running.
        self.channels.remove(&channel);
        Ok(())
    }
}

struct ChannelSink {
    handle: Handle,
    channel: ChannelId,
}

#[async_trait]
impl ClientSink for ChannelSink {
    async fn output(&self, bytes: &[u8]) -> anyhow::Result<()> {
        self.handle
            .data(self.channel, CryptoVec::from_slice(bytes))
            .await
            .map_err(|_| anyhow!("ssh channel {:?} is closed", self.channel))
    }
}

//! HTTP/JSON communicator binding
//!
//! Drives a daemon's configuration endpoint over HTTP: `connect` probes
//! the health endpoint, verbs POST a `{request, attrs}` envelope and
//! decode a `{rc, payload}` reply. Transport failures reset the channel
//! to `Disconnected` so the next pass reconnects.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, trace};

use crate::model::Host;

use super::{CmdReply, CommError, ConnState, Communicator, SharedComm};

const REQUEST_TIMEOUT_SECS: u64 = 5;

/// Command envelope posted to the daemon.
#[derive(Debug, Serialize)]
struct CmdRequest<'a> {
    request: &'a str,
    attrs: &'a BTreeMap<String, String>,
    auth: &'a str,
}

pub struct HttpCommunicator {
    name: String,
    base_url: String,
    auth: String,
    client: reqwest::Client,
    state: Mutex<ConnState>,
}

impl HttpCommunicator {
    pub fn new(name: &str, host: &Host) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            name: name.to_string(),
            base_url: format!("http://{}:{}", host.addr, host.port),
            auth: host.auth.name.clone(),
            client,
            state: Mutex::new(ConnState::Disconnected),
        }
    }

    /// Factory shape expected by the controller's channel set.
    pub fn create(name: &str, host: &Host) -> SharedComm {
        std::sync::Arc::new(Self::new(name, host))
    }

    fn set_state(&self, next: ConnState) {
        *self.state.lock().unwrap() = next;
    }
}

#[async_trait::async_trait]
impl Communicator for HttpCommunicator {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ConnState {
        *self.state.lock().unwrap()
    }

    async fn connect(&self) -> Result<(), CommError> {
        self.set_state(ConnState::Connecting);
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                self.set_state(ConnState::Connected);
                debug!("connected to {} at {}", self.name, self.base_url);
                Ok(())
            }
            Ok(resp) => {
                self.set_state(ConnState::Disconnected);
                Err(CommError::Transport(format!(
                    "{}: HTTP {}",
                    self.name,
                    resp.status()
                )))
            }
            Err(e) => {
                self.set_state(ConnState::Disconnected);
                Err(CommError::Transport(format!("{}: {e}", self.name)))
            }
        }
    }

    async fn reconnect(&self) -> Result<(), CommError> {
        self.set_state(ConnState::Disconnected);
        self.connect().await
    }

    async fn close(&self) -> Result<(), CommError> {
        self.set_state(ConnState::Closing);
        self.set_state(ConnState::Disconnected);
        Ok(())
    }

    async fn command(
        &self,
        verb: &str,
        attrs: &BTreeMap<String, String>,
    ) -> Result<CmdReply, CommError> {
        let url = format!("{}/v1/cmd", self.base_url);
        let envelope = CmdRequest {
            request: verb,
            attrs,
            auth: &self.auth,
        };
        trace!("{} <- {verb}", self.name);

        let resp = self
            .client
            .post(&url)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| {
                self.set_state(ConnState::Disconnected);
                CommError::Transport(format!("{}: {e}", self.name))
            })?;

        if !resp.status().is_success() {
            self.set_state(ConnState::Disconnected);
            return Err(CommError::Transport(format!(
                "{}: HTTP {} on {verb}",
                self.name,
                resp.status()
            )));
        }

        resp.json::<CmdReply>()
            .await
            .map_err(|e| CommError::BadReply(format!("{}: {e}", self.name)))
    }
}

//! Per-daemon RPC channel
//!
//! Every daemon in the fleet is driven through the [`Communicator`] port:
//! a small connection state machine plus the configuration verbs. Verbs
//! resolve to a `(rc, payload)` reply; `rc == 0` is success and the
//! benign codes `EBUSY`/`EEXIST` let callers repeat idempotent verbs
//! freely. The HTTP binding lives in [`http`]; [`mock`] provides a
//! scriptable daemon for tests.

pub mod http;
pub mod mock;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Host, ProducerType};

/// Device or resource busy; the requested transition already holds.
pub const EBUSY: i32 = 16;

/// Already present; a previous pass created the object.
pub const EEXIST: i32 = 17;

/// Connection lifecycle of one daemon channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Errors from the daemon channel.
#[derive(Error, Debug)]
pub enum CommError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("attribute '{0}' is required by '{1}'")]
    MissingAttr(String, String),

    #[error("malformed reply: {0}")]
    BadReply(String),
}

/// Reply to a configuration verb.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdReply {
    pub rc: i32,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl CmdReply {
    pub fn ok(&self) -> bool {
        self.rc == 0
    }

    /// True when the reply means the desired state already holds.
    pub fn benign(&self) -> bool {
        matches!(self.rc, EBUSY | EEXIST)
    }
}

/// Liveness reply from `daemon_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub state: String,
}

/// One producer as reported by a peer aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerStatus {
    pub name: String,
    pub state: String,
}

impl ProducerStatus {
    pub fn is_stopped(&self) -> bool {
        self.state.eq_ignore_ascii_case("stopped")
    }
}

/// One sampler plugin as reported by a sampler daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerStatus {
    pub name: String,
    pub state: String,
}

/// Update scheduling mode carried by `updtr_add`.
#[derive(Debug, Clone)]
pub enum UpdtrMode {
    /// Fixed pull interval, microseconds
    Interval(u64),
    /// Automatic interval selection
    Auto(String),
    /// Push registration
    Push(String),
}

/// Accepted attributes per verb; `open` verbs forward arbitrary extras.
struct VerbSpec {
    req: &'static [&'static str],
    opt: &'static [&'static str],
    open: bool,
}

const fn verb(req: &'static [&'static str], opt: &'static [&'static str]) -> VerbSpec {
    VerbSpec {
        req,
        opt,
        open: false,
    }
}

fn verb_spec(name: &str) -> Option<VerbSpec> {
    let spec = match name {
        "prdcr_add" => verb(&["name", "type", "xprt", "host", "port", "reconnect"], &[]),
        "prdcr_start" | "prdcr_stop" | "updtr_start" | "plugn_load" | "plugn_stop"
        | "strgp_start" => verb(&["name"], &[]),
        "updtr_add" => verb(&["name"], &["interval", "auto", "push"]),
        "updtr_prdcr_add" | "strgp_prdcr_add" => verb(&["name", "regex"], &[]),
        "updtr_match_add" => verb(&["name", "regex"], &["match"]),
        "plugn_config" => VerbSpec {
            req: &["name"],
            opt: &[],
            open: true,
        },
        "smplr_start" => verb(&["name", "interval"], &[]),
        "strgp_add" => verb(&["name", "plugin", "container", "schema"], &[]),
        "daemon_status" | "prdcr_status" | "smplr_status" => verb(&[], &[]),
        _ => return None,
    };
    Some(spec)
}

/// Filter an attribute map down to what a verb accepts and check that
/// every required attribute is present.
pub fn fmt_cmd_args(
    verb: &str,
    attrs: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, CommError> {
    let Some(spec) = verb_spec(verb) else {
        return Ok(attrs.clone());
    };
    for required in spec.req {
        if !attrs.contains_key(*required) {
            return Err(CommError::MissingAttr(
                required.to_string(),
                verb.to_string(),
            ));
        }
    }
    if spec.open {
        return Ok(attrs.clone());
    }
    Ok(attrs
        .iter()
        .filter(|(k, _)| spec.req.contains(&k.as_str()) || spec.opt.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect())
}

macro_rules! attrs {
    ($(($key:expr, $value:expr)),* $(,)?) => {{
        let mut map = BTreeMap::new();
        $(map.insert($key.to_string(), $value.to_string());)*
        map
    }};
}

/// Abstract RPC channel to one daemon.
///
/// Implementations provide the transport primitives; the configuration
/// verbs are derived and validated here so every binding issues the same
/// command stream.
#[async_trait]
pub trait Communicator: Send + Sync {
    /// Daemon name this channel drives, for logs.
    fn name(&self) -> &str;

    fn state(&self) -> ConnState;

    async fn connect(&self) -> Result<(), CommError>;

    async fn reconnect(&self) -> Result<(), CommError>;

    async fn close(&self) -> Result<(), CommError>;

    /// Issue one configuration verb.
    async fn command(
        &self,
        verb: &str,
        attrs: &BTreeMap<String, String>,
    ) -> Result<CmdReply, CommError>;

    async fn daemon_status(&self) -> Result<DaemonStatus, CommError> {
        let reply = self.command("daemon_status", &BTreeMap::new()).await?;
        serde_json::from_value(reply.payload).map_err(|e| CommError::BadReply(e.to_string()))
    }

    async fn prdcr_status(&self) -> Result<Vec<ProducerStatus>, CommError> {
        let reply = self.command("prdcr_status", &BTreeMap::new()).await?;
        serde_json::from_value(reply.payload).map_err(|e| CommError::BadReply(e.to_string()))
    }

    async fn smplr_status(&self) -> Result<Vec<SamplerStatus>, CommError> {
        let reply = self.command("smplr_status", &BTreeMap::new()).await?;
        serde_json::from_value(reply.payload).map_err(|e| CommError::BadReply(e.to_string()))
    }

    async fn prdcr_add(
        &self,
        name: &str,
        ptype: ProducerType,
        xprt: &str,
        host: &str,
        port: u16,
        reconnect_us: u64,
    ) -> Result<CmdReply, CommError> {
        let attrs = attrs![
            ("name", name),
            ("type", ptype),
            ("xprt", xprt),
            ("host", host),
            ("port", port),
            ("reconnect", reconnect_us),
        ];
        self.command("prdcr_add", &fmt_cmd_args("prdcr_add", &attrs)?)
            .await
    }

    async fn prdcr_start(&self, name: &str) -> Result<CmdReply, CommError> {
        self.command("prdcr_start", &attrs![("name", name)]).await
    }

    async fn prdcr_stop(&self, name: &str) -> Result<CmdReply, CommError> {
        self.command("prdcr_stop", &attrs![("name", name)]).await
    }

    async fn updtr_add(&self, name: &str, mode: &UpdtrMode) -> Result<CmdReply, CommError> {
        let attrs = match mode {
            UpdtrMode::Interval(us) => attrs![("name", name), ("interval", us)],
            UpdtrMode::Auto(v) => attrs![("name", name), ("auto", v)],
            UpdtrMode::Push(v) => attrs![("name", name), ("push", v)],
        };
        self.command("updtr_add", &fmt_cmd_args("updtr_add", &attrs)?)
            .await
    }

    async fn updtr_prdcr_add(&self, name: &str, regex: &str) -> Result<CmdReply, CommError> {
        self.command("updtr_prdcr_add", &attrs![("name", name), ("regex", regex)])
            .await
    }

    async fn updtr_match_add(
        &self,
        name: &str,
        regex: &str,
        field: Option<&str>,
    ) -> Result<CmdReply, CommError> {
        let mut attrs = attrs![("name", name), ("regex", regex)];
        if let Some(field) = field {
            attrs.insert("match".to_string(), field.to_string());
        }
        self.command("updtr_match_add", &attrs).await
    }

    async fn updtr_start(&self, name: &str) -> Result<CmdReply, CommError> {
        self.command("updtr_start", &attrs![("name", name)]).await
    }

    async fn plugn_load(&self, name: &str) -> Result<CmdReply, CommError> {
        self.command("plugn_load", &attrs![("name", name)]).await
    }

    async fn plugn_config(
        &self,
        name: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<CmdReply, CommError> {
        let mut attrs = params.clone();
        attrs.insert("name".to_string(), name.to_string());
        self.command("plugn_config", &fmt_cmd_args("plugn_config", &attrs)?)
            .await
    }

    async fn plugn_stop(&self, name: &str) -> Result<CmdReply, CommError> {
        self.command("plugn_stop", &attrs![("name", name)]).await
    }

    async fn smplr_start(&self, name: &str, interval: &str) -> Result<CmdReply, CommError> {
        self.command("smplr_start", &attrs![("name", name), ("interval", interval)])
            .await
    }

    async fn strgp_add(
        &self,
        name: &str,
        plugin: &str,
        container: &str,
        schema: &str,
    ) -> Result<CmdReply, CommError> {
        let attrs = attrs![
            ("name", name),
            ("plugin", plugin),
            ("container", container),
            ("schema", schema),
        ];
        self.command("strgp_add", &fmt_cmd_args("strgp_add", &attrs)?)
            .await
    }

    async fn strgp_prdcr_add(&self, name: &str, regex: &str) -> Result<CmdReply, CommError> {
        self.command("strgp_prdcr_add", &attrs![("name", name), ("regex", regex)])
            .await
    }

    async fn strgp_start(&self, name: &str) -> Result<CmdReply, CommError> {
        self.command("strgp_start", &attrs![("name", name)]).await
    }
}

/// Shared handle to one daemon channel.
pub type SharedComm = Arc<dyn Communicator>;

/// Factory producing a channel for a daemon at a host.
pub type CommFactory = Box<dyn Fn(&str, &Host) -> SharedComm + Send + Sync>;

/// The controller-owned set of long-lived channels, keyed by daemon name.
pub struct CommSet {
    factory: CommFactory,
    comms: Mutex<BTreeMap<String, SharedComm>>,
}

impl CommSet {
    pub fn new(factory: CommFactory) -> Self {
        Self {
            factory,
            comms: Mutex::new(BTreeMap::new()),
        }
    }

    /// Channel for `name`, creating one against `host` on first use.
    pub fn get_or_create(&self, name: &str, host: &Host) -> SharedComm {
        let mut comms = self.comms.lock().unwrap();
        comms
            .entry(name.to_string())
            .or_insert_with(|| (self.factory)(name, host))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<SharedComm> {
        self.comms.lock().unwrap().get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_benign_codes() {
        let busy = CmdReply {
            rc: EBUSY,
            payload: serde_json::Value::Null,
        };
        let exists = CmdReply {
            rc: EEXIST,
            payload: serde_json::Value::Null,
        };
        let failed = CmdReply {
            rc: 22,
            payload: serde_json::Value::Null,
        };
        assert!(busy.benign() && exists.benign());
        assert!(!failed.benign() && !failed.ok());
    }

    #[test]
    fn test_fmt_cmd_args_requires_attrs() {
        let attrs = attrs![("name", "p1")];
        let err = fmt_cmd_args("prdcr_add", &attrs).unwrap_err();
        assert!(matches!(err, CommError::MissingAttr(_, _)));
    }

    #[test]
    fn test_fmt_cmd_args_filters_unknown() {
        let attrs = attrs![("name", "u1"), ("interval", "1000000"), ("bogus", "x")];
        let filtered = fmt_cmd_args("updtr_add", &attrs).unwrap();
        assert!(filtered.contains_key("interval"));
        assert!(!filtered.contains_key("bogus"));
    }

    #[test]
    fn test_fmt_cmd_args_open_verb_passes_extras() {
        let attrs = attrs![("name", "meminfo"), ("producer", "nid0001")];
        let filtered = fmt_cmd_args("plugn_config", &attrs).unwrap();
        assert_eq!(filtered.len(), 2);
    }

    #[test]
    fn test_producer_status_stopped() {
        let p = ProducerStatus {
            name: "p".to_string(),
            state: "STOPPED".to_string(),
        };
        assert!(p.is_stopped());
    }
}

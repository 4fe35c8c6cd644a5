//! # ldmsctl
//!
//! Control plane for a hierarchical LDMS-style telemetry collection
//! fleet: many sampler daemons at the leaves, tiers of aggregator daemons
//! fanning their metric sets in, and a consensus datastore holding the
//! desired configuration.
//!
//! The control plane turns a declarative cluster description into live
//! daemon configuration and keeps it that way:
//!
//! 1. **Expand**: range-notation name specs become fully enumerated
//!    hosts, aggregator groups, sampler groups, producers, updaters, and
//!    storage policies ([`expand`], [`model`]).
//! 2. **Project**: the entity graph is flattened into the datastore
//!    keyspace and read back through a generic tree ([`kvtree`],
//!    [`store`]).
//! 3. **Reconcile**: a supervisor polls daemon liveness, balances
//!    producers across each group's ready aggregators, and drives every
//!    daemon toward the desired state over its RPC channel
//!    ([`reconcile`], [`comm`], [`controller`]).
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        ldmsctl                             │
//! │  description ──> model ──> kvtree ──> datastore            │
//! │                                          │ watch           │
//! │  reconciler <── desired state <──────────┘                 │
//! │      │ commands                                            │
//! └──────┼─────────────────────────────────────────────────────┘
//!        ▼
//!  ┌───────────┐        ┌───────────┐        ┌───────────┐
//!  │  agg-1    │        │  agg-2    │        │ samplers  │
//!  │  (ready)  │        │  (ready)  │        │ nid....   │
//!  └───────────┘        └───────────┘        └───────────┘
//! ```
//!
//! Two binaries share the crate: `ldmsctl-config` expands and saves a
//! description once, `ldmsctl-monitor` reconciles forever.

pub mod balance;
pub mod cli;
pub mod comm;
pub mod controller;
pub mod expand;
pub mod interval;
pub mod kvtree;
pub mod model;
pub mod reconcile;
pub mod store;

pub use controller::{Monitor, RECONCILE_INTERVAL_SECS};
pub use model::DesiredState;

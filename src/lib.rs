//! MySQL operator - Kubernetes operator for Raft-coordinated MySQL clusters.
//!
//! Each `MysqlCluster` runs as a StatefulSet whose pods carry a MySQL server
//! and a Xenon consensus agent. The agents elect a leader among themselves;
//! the operator observes them and keeps the workload converged.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  controller: cluster controller | status controller           │
//! ├──────────────────────────────────────────────────────────────┤
//! │  status: StatusAggregator        syncer: StatefulSetSyncer    │
//! │                                   ├─ podspec   ├─ merge        │
//! │                                   └─ storage (expansion)      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  probe: MemberProbe = sql (MySQL) + consensus (Xenon HTTP)    │
//! ├──────────────────────────────────────────────────────────────┤
//! │  cluster (model) | crd | store (object store seam) | retry    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use mysql_operator::config::OperatorConfig;
//! use mysql_operator::controller::Controller;
//!
//! #[tokio::main]
//! async fn main() -> mysql_operator::Result<()> {
//!     let controller = Controller::new("default".to_string(), OperatorConfig::default()).await?;
//!     controller.run().await
//! }
//! ```

pub mod cluster;
pub mod config;
pub mod context;
pub mod controller;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod probe;
pub mod retry;
pub mod status;
pub mod store;
pub mod syncer;

pub use error::{Error, Result};

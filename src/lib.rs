//! # ML Connector
//!
//! Authenticated calls to remote ML models, and download/verification of
//! model archives.
//!
//! A [`Connector`](ml_connector_core::connector::Connector) describes one
//! remote endpoint: its protocol, templated actions, and credentials. This
//! crate turns a connector into an executor that signs and sends requests,
//! drives predictions through it, and maps responses to tensors.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌────────────┐   ┌──────────────┐
//! │ Connector │──▶│ RemoteInvoker│──▶│  Executor  │──▶│ remote model │
//! │ (core)    │   │ batch+script │   │ sign + send│   │  HTTP / AWS  │
//! └───────────┘   └──────────────┘   └────────────┘   │  OCI         │
//!                                                     └──────────────┘
//! ┌──────────────────┐
//! │ ModelHelper      │──▶ stage ─▶ hash ─▶ verify zip ─▶ chunks
//! │ url / oci-os /fs │
//! └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`signing`] | Request typestate, SigV4 and OCI signers |
//! | [`executor`] | Per-protocol executors |
//! | [`remote`] | Predict/download orchestration |
//! | [`script`] | Lua pre/post-processing |
//! | [`artifact`] | Model archive download, verification, chunking |
//! | [`paths`] | Model cache layout and prebuilt repository URLs |
//! | [`logging`] | Subscriber setup for the binary |

pub mod artifact;
pub mod config;
pub mod executor;
pub mod logging;
pub mod paths;
pub mod remote;
pub mod script;
pub mod signing;

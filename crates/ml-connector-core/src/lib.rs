//! # ml-connector core
//!
//! Data model and validation shared by the `ml-connector` runtime:
//! connector documents, `${namespace.key}` templates, typed auth
//! descriptors, output tensors, model registration types, and the error
//! taxonomy.
//!
//! This crate performs no network or filesystem I/O and pulls in no async
//! runtime. Everything here is pure and cheap to unit test.

pub mod auth;
pub mod connector;
pub mod error;
pub mod input;
pub mod model;
pub mod protocol;
pub mod template;
pub mod tensor;

pub use error::{Error, Result};

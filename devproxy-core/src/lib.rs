//! devproxy - a front-end development server with a prefix-based API proxy
//!
//! Requests whose path starts with a configured prefix are forwarded to a
//! backend with their path rewritten; everything else is served from disk:
//! - `config`: Config file schema and loading (YAML or JSON)
//! - `error`: Configuration and forwarding errors
//! - `rule`: The immutable proxy rule set, matching and path rewriting
//! - `upstream`: Backend targets
//! - `tls`: Outbound TLS for `https` targets
//! - `service`: Request routing and upstream forwarding
//! - `static_files`: Fallback for requests no rule claims
//! - `server`: TCP listener and connection handling

pub mod config;
pub mod error;
pub mod rule;
pub mod server;
pub mod service;
pub mod static_files;
pub mod tls;
pub mod upstream;
pub mod utils;
pub use hyper;

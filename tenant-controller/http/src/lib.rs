//! HTTP surfaces of the tenant controller: the tenant management API and the admin server.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod admin;
mod api;
pub mod auth;
mod metrics;
mod server;


pub use self::{
    admin::{Admin, Readiness},
    api::Api,
    auth::Auth,
    metrics::HttpMetrics,
    server::serve,
};

pub type Body = http_body_util::Full<bytes::Bytes>;

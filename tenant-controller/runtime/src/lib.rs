#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use tenant_controller_core as core;
pub use tenant_controller_http as http;
pub use tenant_controller_log as log;
pub use tenant_controller_store as store;

mod args;
mod logging;

pub use self::{
    args::Args,
    logging::{LogFilter, LogFormat},
};

//! A relay that publishes and resolves signed pkarr records

#![warn(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod cache;
pub mod config;
pub mod dht;
pub mod http;
pub mod metrics;
pub mod propagate;
pub mod record;
pub mod republish;
pub mod scheduler;
pub mod server;
pub mod service;
pub mod state;
pub mod store;
pub mod util;

pub use record::{Record, Response};
pub use service::RecordService;

#![allow(async_fn_in_trait)]
pub mod config;
pub mod convert;
pub mod download;
pub mod error;
pub mod fetch;
pub mod index;
pub mod ingest;
pub mod naming;
pub mod products;
pub mod publish;
pub mod search;
pub mod transport;

pub use error::{Error, Result};

#![deny(missing_docs)]

//! Asynchronous client for the MikroTik RouterOS binary API.
//!
//! The binary API is a length-prefixed, word-oriented request/response
//! protocol on TCP port 8728 (TLS: 8729). This crate implements the wire
//! engine: incremental framing, tag-based multiplexing of concurrent
//! commands over one connection, and long-lived event streams with
//! pause/resume semantics.
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use routeros_api::{command_words, ApiConfig};
//!
//! # async fn run() -> Result<(), routeros_api::Error> {
//! let config = ApiConfig::new("192.168.88.1");
//! let api = routeros_api::connect(config).await?;
//! let api = api.login("admin", "password").await?;
//!
//! // One-shot command: rows are collected until !done.
//! let rows = api
//!     .command(command_words("/interface/print", &[]))?
//!     .collect()
//!     .await?;
//!
//! // Long-lived stream: batches until stopped.
//! let mut addresses = api.stream(command_words(
//!     "/ip/address/listen",
//!     &[("interval", "1")],
//! ))?;
//! while let Some(batch) = addresses.next().await {
//!     println!("{:?}", batch?);
//! }
//! # Ok(())
//! # }
//! ```

mod api;

pub mod proto;

pub use api::{
    command_words, config::defaults, ApiConfig, AsyncStream, Authenticated, Channel,
    ConnectionEvent, Disconnected, Error, Lifecycle, RouterOsApi, State, StreamChannel,
    TlsConfig, TrapCategory,
};

pub use api::de::{from_row, DecodeError};

use api::{attach, transport};

/// Connect to the router described by `config`.
///
/// Dials TCP (or TLS, per the config) and attaches the engine; call
/// [`RouterOsApi::login`] on the result before issuing commands.
pub async fn connect(config: ApiConfig) -> Result<RouterOsApi<Disconnected>, Error> {
    config.validate().map_err(Error::Config)?;

    let io = transport::dial(&config).await?;
    Ok(attach(io, &config))
}

/// Attach the engine to an already-established transport.
///
/// For transports this crate does not dial itself (proxied sockets,
/// in-memory pipes in tests). The configuration only contributes its
/// timeout settings here.
pub fn connect_stream<T>(io: T, config: &ApiConfig) -> RouterOsApi<Disconnected>
where
    T: AsyncStream + 'static,
{
    attach(io, config)
}

//! blazing_ami is an async client for the Asterisk Manager Interface (AMI).
//!
//! blazing_ami requires the use of tokio. Executor independence is currently not a goal, beyond
//! keeping the protocol core (everything except the optional `tcp` module) free of any direct
//! dependency on a particular I/O reactor.
//!
//! To get started, consider this "Hello World" example, assuming the `tcp` feature is enabled:
//! ```ignore
//! use blazing_ami::{config::ConnectionConfig, handler::NoopConnectionHandler, tcp};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (mut conn, mut driver) = tcp::connect(
//!         "127.0.0.1:5038",
//!         Arc::new(NoopConnectionHandler),
//!         ConnectionConfig::default(),
//!     )
//!     .await?;
//!     tokio::spawn(async move { driver.run().await });
//!     conn.login_md5("admin", "secret").await?;
//!     Ok(())
//! }
//! ```
//!
//! In general, blazing_ami works by feeding raw bytes off the wire into a
//! [`connection::Connection`], which frames them into [`message::Frame`]s, dispatches events to
//! per-channel [`channel::ChannelHandler`] hooks (or the connection-wide
//! [`handler::ConnectionHandler`] for anything not routed to a specific channel), and correlates
//! action responses back to whichever caller sent the action. Applications install hooks either
//! by hand or via the `#[connection_handler]`/`#[channel_handler]`/`#[async_agi_handler]`
//! attribute macros from the companion `blazing_ami_macros` crate.
pub mod action;
pub mod asyncagi;
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod handler;
pub mod message;
#[cfg(feature = "tcp")]
pub mod tcp;
pub mod transport;

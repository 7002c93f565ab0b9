//! A crate for controlling broadcast matrix routers that speak the
//! SW-P-08 (Pro-Bel) serial control protocol, over TCP or RS-422 serial.
//!
//! The [Link] runs the framed ACK/NAK wire protocol, the [Router] keeps a
//! cache of observed crosspoint tallies and exposes the typed command API,
//! and the [Server] fans the single router link out to many WebSocket
//! clients.
//!
//! # Example
//! ```no_run
//! # use swp08::{Config, Link, LinkOptions, Router};
//! # use anyhow::Result;
//! # #[tokio::main]
//! # async fn main() -> Result<()> {
//! // Route source 10 to destination 5 on levels 0 and 1 of the router
//! // at the default TCP endpoint.
//! let config = Config::default();
//! let stream = config.transport_config().open().await?;
//! let router = Router::new(config.limits(), LinkOptions::default());
//! router.attach(Link::new(stream, LinkOptions::default()))?;
//! router.take_multi(0, &[0, 1], 5, 10)?;
//! # Ok(())
//! # }
//! ```

pub mod api;
mod config;
mod constants;
mod error;
pub mod frame;
mod labels;
mod link;
mod message;
mod router;
mod salvo;
mod server;
mod state;
mod transport;

pub use config::{Config, SerialSettings, TcpSettings, TransportKind};
pub use error::*;
pub use labels::{LabelKey, LabelKind, LabelStore};
pub use link::{Link, LinkOptions};
pub use message::{Crosspoint, DumpEntry, Message};
pub use router::{Limits, Router, RouterEvent};
pub use salvo::{Salvo, SalvoEntry, SalvoStore};
pub use server::Server;
pub use state::{CrosspointCache, CrosspointState, CrosspointStatus};
pub use transport::{RouterIo, TransportConfig};

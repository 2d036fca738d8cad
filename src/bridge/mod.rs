//! Background execution channel.
//!
//! Many concurrent generation requests share one connection to the background
//! host. Each request is tagged with a correlation id, and the host's streamed
//! events are routed back to the [`Session`] registered under that id.

pub mod client;
pub mod dispatch;
pub mod protocol;
pub mod session;
pub mod transport;

pub use client::{BridgeClient, SessionParams};
pub use dispatch::{GenerationDispatcher, Route};
pub use protocol::{ClaimReply, Event, Request};
pub use session::{Session, SessionEvent};
pub use transport::{Connection, Connector, LocalConnector, WsConnector};

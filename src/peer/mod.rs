//! Peer-facing endpoint for cached responses.
//!
//! Other peers that found this proxy through an announcement fetch the
//! response with `GET /request/<url>` on the announced proxy port.
//!
//! - [`PeerServer`]: TCP listener answering from the local cache
//! - [`request`]: request-line parsing and response heads

pub mod request;
pub mod server;

pub use request::{PeerRequest, Status, REQUEST_PREFIX};
pub use server::{PeerServer, PeerServerError};

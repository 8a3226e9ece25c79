//! Strand peer connection -- the per-device protocol endpoint.
//!
//! A `Connection` multiplexes folder indexes, block requests/responses,
//! cluster configuration, download progress and liveness pings over one
//! pre-established reliable byte stream. Transport setup (dialing, TLS,
//! device verification) and the file model behind the callbacks are the
//! caller's business; this crate owns everything between the two.

pub mod connection;
pub mod counting;
pub mod error;
pub mod model;
pub mod pool;

pub use connection::Connection;
pub use counting::Statistics;
pub use error::ConnectionError;
pub use model::Model;

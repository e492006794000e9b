//! Live-query subscription multiplexer.
//!
//! Application code asks for the current value of a query and keeps it live:
//!
//! ```ignore
//! let mux = Multiplexer::connect(&Config::from_env()?);
//! let server = mux
//!     .acquire(&FunctionRef::query("servers:get"), &json!({ "id": "42" }))
//!     .await?;
//! server.on_change(|value| println!("server changed: {value}"));
//! ```
//!
//! Concurrent and repeated acquisitions of the same `(query, arguments)` share
//! one subscription, which is torn down when the last handle is dropped.
//! Calls go over a streaming primary channel and fall back to a
//! request/response secondary on transient failures.

mod cache_key;
pub mod channel;
pub mod config;
pub mod error;
pub mod http_channel;
mod live_value;
mod multiplexer;
mod recovery;
mod scope;
#[cfg(test)]
mod testing;
pub mod transport;
pub mod types;
pub mod ws_channel;

pub use cache_key::{encode as cache_key, normalize_args};
pub use config::Config;
pub use error::{ChannelError, ErrorClass, Result, TransportError};
pub use live_value::{ChangeCallback, LiveValue};
pub use multiplexer::Multiplexer;
pub use transport::{DualTransport, TransportConfig, TransportEvent};
pub use types::{FunctionPath, FunctionRef, OperationKind, QueryCacheKey};

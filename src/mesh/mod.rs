//! Client side of the lattice: the station's connection to the broker.

mod backoff;
mod connection;

pub use backoff::BackoffConfig;
pub use connection::{ConnectOptions, ConnectionState, MeshConnection, Message, Subscription};

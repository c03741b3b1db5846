mod connection;

pub use connection::{ConnectionPhase, ConnectionStatus};

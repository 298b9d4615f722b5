pub mod connection;
pub mod messages;

pub use connection::{StreamClient, StreamCommand, StreamStats};

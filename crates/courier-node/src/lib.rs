//! Courier client node: TCP feed transport, file-backed coordination state and CLI

pub mod cli;
pub mod config;
pub mod handler;
pub mod surface;
pub mod tcp_feed;

pub use config::{LogFormat, NodeConfig};
pub use handler::NodeHandler;
pub use surface::StdoutSurface;
pub use tcp_feed::TcpFeedTransport;

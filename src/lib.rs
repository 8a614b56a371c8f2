pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod http;
pub mod protocol;
pub mod server;
pub mod storage;

pub use config::ServerConfig;
pub use server::Server;

pub mod bmp;
pub mod config;
mod handler;
pub mod pipeline;
pub mod session;
mod utils;

pub use config::{ConfigOverrides, ServerConfig};
pub use handler::Server;

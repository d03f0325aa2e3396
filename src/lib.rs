pub mod api;
pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod observability;
pub mod routing;
pub mod session;
pub mod state;
pub mod storage;
pub mod stream;
pub mod transport;
pub mod wire;

mod util;

pub use util::{conversation_title, DEFAULT_TITLE};

pub mod chat;
pub mod cors;
pub mod health;
pub mod image;
pub(crate) mod search;

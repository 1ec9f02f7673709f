pub mod auth;
pub mod clients;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod messages;
pub mod room;
pub mod server;
pub mod store;

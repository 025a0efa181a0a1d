pub mod config;
pub mod physics;
pub mod protocol;
pub mod registry;
pub mod rooms;
pub mod router;
pub mod server;

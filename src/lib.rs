pub mod client;
pub mod config;
pub mod error;
pub mod game;
pub mod model;
pub mod net;
pub mod server;
pub mod sync;
pub mod utils;
pub mod world;

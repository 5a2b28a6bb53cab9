pub mod blacklist;
pub mod config;
pub mod directory;
pub mod favorites;
pub mod platform;
pub mod protocol;
pub mod rotation;
pub mod settings;
pub mod sources;
pub mod state;
pub mod store;

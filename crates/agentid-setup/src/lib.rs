pub mod config;
pub mod directory;
pub mod engine;
pub mod render;
pub mod status;

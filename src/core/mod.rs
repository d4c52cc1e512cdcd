pub mod config;
pub mod diagnostics;
pub mod model;
pub mod terminal;
pub mod topology;
pub mod warehouse;

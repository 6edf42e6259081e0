pub mod config;
pub mod constants;
pub mod errors;
pub mod graph;
pub mod logging;
pub mod model;

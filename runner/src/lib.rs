pub mod config;
pub mod distributed;
pub mod executors;
pub mod grid;
pub mod model;
pub mod surrogate;

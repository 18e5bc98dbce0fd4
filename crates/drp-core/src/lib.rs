pub mod config;
pub mod consts;
pub mod data;
pub mod error;
pub mod io;
pub mod monitor;
pub mod paths;
pub mod pipeline;
pub mod processor;
pub mod report;

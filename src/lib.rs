pub mod acquire;
pub mod cli;
pub mod config;
pub mod constants;
pub mod cookies;
pub mod fetch;
pub mod history;
pub mod logging;
pub mod metadata;
pub mod output;
pub mod parsers;
pub mod pipeline;
pub mod scanner;
pub mod snapshot;
pub mod upload;
pub mod util;

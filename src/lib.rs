pub mod app;
pub mod backend;
pub mod cancel;
pub mod config;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod jobs;
pub mod merge;
pub mod output;
pub mod partition;
pub mod toolkit;
pub mod workspace;

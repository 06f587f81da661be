pub mod backlog;
pub mod config;
pub mod headers;
pub mod migrate;
pub mod pagination;

pub mod agent;
pub mod aggregate;
pub mod catalog;
pub mod config;
pub mod export;
pub mod flow;
pub mod sink;

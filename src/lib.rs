pub mod agent;
pub mod bridge;
pub mod cli;
pub mod config;
pub mod gateway;
pub mod llm;
pub mod logging;
pub mod session;
pub mod tools;

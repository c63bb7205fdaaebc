pub mod auth;
pub mod broadcast;
pub mod config;
pub mod execution;
pub mod gatekeeper;
pub mod hooks;
pub mod memory;
pub mod orchestrator;
pub mod runner;
pub mod sandbox;

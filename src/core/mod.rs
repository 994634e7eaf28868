// src/core/mod.rs

pub mod cache;
pub mod command_tree;
pub mod context;
pub mod loader;
pub mod manifest;
pub mod orchestrator;
pub mod paths;

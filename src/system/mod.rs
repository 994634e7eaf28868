//! # System Interaction Layer
//!
//! Narrow wrappers around process spawning. Action bodies call into this
//! layer to run their shell work; the core never inspects shell semantics.

pub mod executor;

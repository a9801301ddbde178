//! Norx - A network intrusion detection system with live rule swap
//!
//! The detection engine is built around an immutable, shared
//! [`detect::DetectionContext`] and one [`detect::WorkerContext`] per worker
//! thread. [`swap::SwapCoordinator`] replaces both while packets keep flowing.

pub mod config;
pub mod core;
pub mod detect;
pub mod rules;
pub mod swap;
pub mod utils;

//! Business logic services.

pub mod dispatch;
pub mod engine;

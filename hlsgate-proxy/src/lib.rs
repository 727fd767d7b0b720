//! The streaming delivery engine: filesystem and upstream-HTTP
//! backends with Range support, the live transfer tracker, and the
//! main proxy handler.

pub mod fs;
pub mod handler;
pub mod range;
pub mod state;
pub mod transfer;
pub mod upstream;

pub use state::AppState;

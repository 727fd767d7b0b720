//! Redis-backed state for hlsgate: the connection façade plus the
//! whitelist, session, replay-counter, key-protection, JS-whitelist,
//! and access-log stores built on top of it.

pub mod access_log;
pub mod js_whitelist;
pub mod key_protect;
pub mod redis;
pub mod replay;
pub mod session;
pub mod whitelist;

pub use crate::redis::RedisStore;

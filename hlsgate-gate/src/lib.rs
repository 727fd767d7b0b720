//! The request-admission control plane: the per-request decision
//! machine and the validation coordinator that feeds it.

pub mod admission;
pub mod validate;

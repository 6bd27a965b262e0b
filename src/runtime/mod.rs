//! Execution runtime for the ASG.
//!
//! `backend` defines the backend trait, `cpu_backend` the ndarray
//! implementation, and `session` the stateful wrapper that owns variable
//! values and commits `Assign` targets.

pub mod backend;
pub mod cpu_backend;
pub mod session;

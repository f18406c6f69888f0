//! Route handlers mounted by the pipeline.
//!
//! Each submodule exposes a `router()` returning `Router<Arc<AppState>>`;
//! the pipeline decides which of them are mounted and behind which stages.

pub mod acquisition;
pub mod auth;
pub mod health;
pub mod legacy;
pub mod management;

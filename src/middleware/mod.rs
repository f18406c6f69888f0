//! Request pipeline stages implemented as `axum::middleware::from_fn` layers.

pub mod body;
pub mod guard;
pub mod headers;
pub mod logging;
pub mod sanitizer;
pub mod timeout;
pub mod upload;

pub use body::{RawBody, RequestBody};
pub use guard::ResponseGuard;
pub use upload::UploadedPackage;

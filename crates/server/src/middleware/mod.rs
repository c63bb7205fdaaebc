pub mod auth;
pub mod model_loaders;
pub mod request_id;

pub use auth::{AuthUser, require_auth};
pub use model_loaders::*;
pub use request_id::{REQUEST_ID_HEADER, RequestId, request_id_middleware};

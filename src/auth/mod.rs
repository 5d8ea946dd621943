//! Bearer-credential handling for the push-fabric handshake.

pub mod jwt;
pub mod middleware;
pub mod models;

pub use jwt::JwtHandler;
pub use middleware::resolve_user_id;
pub use models::Claims;

//! HTTP surface: middleware, error responses and the admin server.

pub mod middleware;
mod response;
mod routes;
mod server;

pub use middleware::{
    protect_admin_operations, protect_order_creation, request_descriptor, with_rate_limit,
    with_size_limit, AuthenticatedUser, ClassGuard,
};
pub use routes::{router, ResetRequest};
pub use server::HttpServer;

//! HTTP surface: the admission middleware, introspection routes, and server.

mod middleware;
mod routes;
mod server;

pub use middleware::{apply_headers, enforce, rejection_response, request_origin, PolicyGuard};
pub use routes::{
    admin_router, health, introspection_router, service_router, ApiError, ApiResponse,
    IntrospectionState,
};
pub use server::HttpServer;

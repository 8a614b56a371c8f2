//! HTTP front door
//!
//! An axum router for the single-shot file endpoints, plus the POST that
//! upgrades a connection to the stream protocol. `server::serve_stream`
//! runs it over hyper, one request per connection.

pub mod deadline;
pub mod endpoints;
pub mod upgrade;

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::header::CONNECTION;
use axum::http::{HeaderName, HeaderValue};
use axum::middleware;
use axum::routing::get;
use log::warn;
use tower_http::set_header::SetResponseHeaderLayer;

use crate::server::ServerContext;

pub use deadline::ReplyDeadline;

/// Echoes `server_name` on every reply.
const SERVER_NAME_HEADER: HeaderName = HeaderName::from_static("ps");

/// Remote address of the connection a request arrived on.
#[derive(Debug, Clone)]
pub struct Peer(pub String);

/// Builds the request router. Connection-scoped extensions (`Peer` and
/// `ReplyDeadline`) are layered on by the caller.
pub fn router(ctx: Arc<ServerContext>) -> Router {
    let mut router = Router::new()
        .route("/", get(endpoints::root).post(upgrade::handoff))
        .route(
            "/{*path}",
            get(endpoints::get_file)
                .put(endpoints::put_file)
                .delete(endpoints::delete_file)
                .post(upgrade::handoff),
        )
        .layer(DefaultBodyLimit::disable())
        .layer(middleware::from_fn(deadline::bound_reply))
        .layer(SetResponseHeaderLayer::if_not_present(
            CONNECTION,
            HeaderValue::from_static("close"),
        ));

    if let Some(name) = &ctx.config().server_name {
        match HeaderValue::from_str(name) {
            Ok(value) => {
                router = router.layer(SetResponseHeaderLayer::overriding(SERVER_NAME_HEADER, value))
            }
            Err(_) => warn!("server_name {:?} is not a valid header value; not sent", name),
        }
    }

    router.with_state(ctx)
}

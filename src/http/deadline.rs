//! Per-connection reply deadline
//!
//! Handlers bound their own waits (locks, request bodies). What is left is
//! writing the reply, which hyper does after the handler returns; this
//! deadline covers that part and `serve_stream` drops the connection once
//! it passes.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use log::{debug, info};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::http::Peer;

struct State {
    at: Instant,
    budget: Option<Duration>,
    reply: Duration,
}

#[derive(Clone)]
pub struct ReplyDeadline {
    state: Arc<Mutex<State>>,
    moved: Arc<Notify>,
}

impl ReplyDeadline {
    /// `ceiling` bounds the exchange until a reply is ready; `reply` bounds
    /// writing the reply unless a handler allows more.
    pub fn new(ceiling: Duration, reply: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                at: Instant::now() + ceiling,
                budget: None,
                reply,
            })),
            moved: Arc::new(Notify::new()),
        }
    }

    pub fn at(&self) -> Instant {
        self.state.lock().at
    }

    pub fn expired(&self) -> bool {
        self.at() <= Instant::now()
    }

    /// Lets the coming reply take `budget` instead of the default.
    pub fn allow(&self, budget: Duration) {
        self.state.lock().budget = Some(budget);
    }

    /// Starts the clock on writing the reply.
    pub fn start_reply(&self) {
        {
            let mut state = self.state.lock();
            let budget = state.budget.take().unwrap_or(state.reply);
            state.at = Instant::now() + budget;
        }
        self.moved.notify_one();
    }

    /// Resolves after the deadline has been moved.
    pub async fn moved(&self) {
        self.moved.notified().await
    }
}

/// Logs each request and starts its reply deadline once the handler is done.
pub async fn bound_reply(req: Request, next: Next) -> Response {
    let deadline = req.extensions().get::<ReplyDeadline>().cloned();
    let peer = req
        .extensions()
        .get::<Peer>()
        .map(|peer| peer.0.clone())
        .unwrap_or_else(|| "unknown".to_string());
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    info!("{} {} from {}", method, path, peer);

    let response = next.run(req).await;
    debug!("{} {} {} -> {}", peer, method, path, response.status());

    if let Some(deadline) = deadline {
        deadline.start_reply();
    }
    response
}

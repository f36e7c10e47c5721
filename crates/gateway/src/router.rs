//! Result routing
//!
//! Maps each request id to the connection that submitted it. Outcomes can be
//! produced before the connection registers its id (a rejected submission is
//! reported synchronously), so unclaimed outcomes are parked until claimed.

use parking_lot::Mutex;
use skinscan_proto::{RequestId, ServerMessage, ServiceEvent};
use std::collections::HashMap;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace};

/// Per-connection outbound queue
pub type ConnectionSender = UnboundedSender<ServerMessage>;

#[derive(Default)]
struct Routes {
    waiting: HashMap<RequestId, ConnectionSender>,
    unclaimed: HashMap<RequestId, ServiceEvent>,
}

/// Routes service events to client connections
#[derive(Default)]
pub struct Router {
    routes: Mutex<Routes>,
}

impl Router {
    /// Create an empty router
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the connection waiting for `id`, delivering at once if the
    /// outcome is already known
    pub fn claim(&self, id: RequestId, connection: ConnectionSender) {
        let mut routes = self.routes.lock();
        match routes.unclaimed.remove(&id) {
            Some(event) => {
                trace!("Request {} outcome was waiting for its connection", id);
                send(&connection, event);
            }
            None => {
                routes.waiting.insert(id, connection);
            }
        }
    }

    /// Deliver an outcome to the connection that claimed its id
    pub fn deliver(&self, event: ServiceEvent) {
        let id = event.id();
        let mut routes = self.routes.lock();
        match routes.waiting.remove(&id) {
            Some(connection) => send(&connection, event),
            None => {
                routes.unclaimed.insert(id, event);
            }
        }
    }

    /// Ids still waiting for an outcome
    pub fn waiting_count(&self) -> usize {
        self.routes.lock().waiting.len()
    }

    /// Outcomes nobody claimed yet
    pub fn unclaimed_count(&self) -> usize {
        self.routes.lock().unclaimed.len()
    }
}

fn send(connection: &ConnectionSender, event: ServiceEvent) {
    let id = event.id();
    if connection.send(ServerMessage::from(event)).is_err() {
        debug!("Connection for request {} is gone, dropping outcome", id);
    }
}

use std::sync::Arc;

use crate::engine::Engine;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn max_body_bytes(&self) -> usize {
        self.engine.config().server.max_body_bytes
    }
}

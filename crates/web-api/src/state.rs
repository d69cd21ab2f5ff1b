use std::sync::Arc;

use application::ChatEngine;

use crate::JwtService;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ChatEngine>,
    pub jwt_service: Arc<JwtService>,
}

impl AppState {
    pub fn new(engine: Arc<ChatEngine>, jwt_service: Arc<JwtService>) -> Self {
        Self {
            engine,
            jwt_service,
        }
    }
}

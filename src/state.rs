use std::sync::Arc;

use crate::database::Db;
use crate::proxy::dispatch::Dispatcher;
use crate::proxy::recorder::UsageRecorder;
use crate::registry::ModelRegistry;

/// Shared handles passed to every handler. Everything here is cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub registry: Arc<ModelRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub recorder: UsageRecorder,
}

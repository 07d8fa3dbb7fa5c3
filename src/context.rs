use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::DeviceRegistry;
use crate::export::ExportEngine;

/// Shared application state: one synchronized entry point per device,
/// constructed once per process and passed by reference instead of living in
/// a global.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub registry: Arc<DeviceRegistry>,
    pub exports: ExportEngine,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(DeviceRegistry::new()),
            exports: ExportEngine::new(),
        }
    }
}

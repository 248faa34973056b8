//! Application state shared across handlers

use common::mqtt::Publisher;
use std::sync::Arc;
use std::time::Duration;

use crate::booking::BookingBroker;
use crate::lifecycle::LifecycleEngine;
use crate::middleware::AdminAuth;

/// What the browser needs to render the card form
#[derive(Debug, Clone)]
pub struct SquareInfo {
    pub app_id: String,
    pub location_id: String,
    pub sdk_url: String,
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: LifecycleEngine,
    pub booking: BookingBroker,
    pub bus: Arc<dyn Publisher>,
    pub home_id: String,
    pub charger_id: String,
    pub response_timeout: Duration,
    pub square: SquareInfo,
    /// None when the admin interface is disabled
    pub admin: Option<AdminAuth>,
}

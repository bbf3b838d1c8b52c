use std::sync::Arc;

use crate::runner::CrawlScheduler;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<CrawlScheduler>,
}

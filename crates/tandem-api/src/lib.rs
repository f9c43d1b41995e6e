pub mod couples;
pub mod error;
pub mod middleware;
pub mod moments;
pub mod notifications;

use std::sync::Arc;

use tandem_core::{BlobStore, MomentCoordinator};
use tandem_db::Database;
use tandem_gateway::Dispatcher;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub blobs: Arc<BlobStore>,
    pub coordinator: Arc<MomentCoordinator>,
    pub dispatcher: Dispatcher,
    pub jwt_secret: String,
}

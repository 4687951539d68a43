//! Process-wide index of session controllers.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::models::identity::Identity;
use crate::models::session::SessionRecord;
use crate::{AppError, Result};

use super::controller::{ControllerContext, SessionController};

/// Maps session ids to their controllers.
pub struct ControllerRegistry {
    ctx: Arc<ControllerContext>,
    controllers: RwLock<HashMap<String, SessionController>>,
}

impl ControllerRegistry {
    /// Empty registry sharing `ctx` with every controller it builds.
    #[must_use]
    pub fn new(ctx: Arc<ControllerContext>) -> Self {
        Self {
            ctx,
            controllers: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild a controller for every persisted record. Must complete
    /// before the registry serves requests.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the records cannot be listed.
    pub async fn recover(&self) -> Result<usize> {
        let records = self.ctx.repo.list_all().await?;
        let mut controllers = self.controllers.write().await;

        for record in records {
            let session_id = record.session_id.clone();
            let controller = SessionController::recover(Arc::clone(&self.ctx), record).await;
            if controllers.insert(session_id.clone(), controller).is_some() {
                warn!(session_id, "duplicate session record during recovery");
            }
        }

        info!(count = controllers.len(), "session controllers recovered");
        Ok(controllers.len())
    }

    /// Create a new session owned by `identity`.
    ///
    /// # Errors
    ///
    /// Propagates [`SessionController::create`] failures.
    pub async fn create(&self, identity: &Identity) -> Result<SessionRecord> {
        let controller = SessionController::new(Arc::clone(&self.ctx));
        let record = controller.create(identity).await?;
        self.controllers
            .write()
            .await
            .insert(record.session_id.clone(), controller);
        Ok(record)
    }

    /// Controller for `session_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown id.
    pub async fn get(&self, session_id: &str) -> Result<SessionController> {
        self.controllers
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("no session {session_id}")))
    }

    /// Destroy the session and forget its controller.
    ///
    /// # Errors
    ///
    /// Propagates [`SessionController::destroy`] failures; the controller
    /// stays registered when destroy fails.
    pub async fn destroy(&self, session_id: &str, identity: &Identity) -> Result<()> {
        let controller = self.get(session_id).await?;
        controller.destroy(identity).await?;
        self.controllers.write().await.remove(session_id);
        Ok(())
    }

    /// Number of registered controllers.
    pub async fn len(&self) -> usize {
        self.controllers.read().await.len()
    }

    /// Whether no controllers are registered.
    pub async fn is_empty(&self) -> bool {
        self.controllers.read().await.is_empty()
    }

    /// Quiesce runtime resources of every controller, leaving records and
    /// sandboxes untouched.
    pub async fn shutdown(&self) {
        let controllers: Vec<SessionController> =
            self.controllers.read().await.values().cloned().collect();
        for controller in &controllers {
            controller.shutdown().await;
        }
        info!(count = controllers.len(), "session controllers shut down");
    }
}

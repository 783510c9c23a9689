//! Circle membership repository contract.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::circles::Circle;
use crate::error::StoreResult;

#[async_trait]
pub trait CirclesRepository: Send + Sync {
    /// Circles the user is an active member of, with settings and members.
    async fn list_for_user(&self, user_id: Uuid) -> StoreResult<Vec<Circle>>;

    async fn get(&self, circle_id: Uuid) -> StoreResult<Option<Circle>>;
}

pub type DynCirclesRepo = Arc<dyn CirclesRepository>;

#[derive(Default)]
pub struct MemoryCirclesRepository {
    circles: DashMap<Uuid, Circle>,
}

impl MemoryCirclesRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, circle: Circle) {
        self.circles.insert(circle.id, circle);
    }
}

#[async_trait]
impl CirclesRepository for MemoryCirclesRepository {
    async fn list_for_user(&self, user_id: Uuid) -> StoreResult<Vec<Circle>> {
        Ok(self
            .circles
            .iter()
            .filter(|c| c.has_active_member(user_id))
            .map(|c| c.clone())
            .collect())
    }

    async fn get(&self, circle_id: Uuid) -> StoreResult<Option<Circle>> {
        Ok(self.circles.get(&circle_id).map(|c| c.clone()))
    }
}

//! User repository contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::users::User;

#[async_trait]
pub trait UsersRepository: Send + Sync {
    async fn get(&self, user_id: Uuid) -> StoreResult<Option<User>>;

    /// Flip the online flag and stamp last-seen.
    async fn set_online(
        &self,
        user_id: Uuid,
        online: bool,
        last_seen: DateTime<Utc>,
    ) -> StoreResult<()>;
}

pub type DynUsersRepo = Arc<dyn UsersRepository>;

#[derive(Default)]
pub struct MemoryUsersRepository {
    users: DashMap<Uuid, User>,
}

impl MemoryUsersRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user: User) {
        self.users.insert(user.id, user);
    }
}

#[async_trait]
impl UsersRepository for MemoryUsersRepository {
    async fn get(&self, user_id: Uuid) -> StoreResult<Option<User>> {
        Ok(self.users.get(&user_id).map(|u| u.clone()))
    }

    async fn set_online(
        &self,
        user_id: Uuid,
        online: bool,
        last_seen: DateTime<Utc>,
    ) -> StoreResult<()> {
        if let Some(mut user) = self.users.get_mut(&user_id) {
            user.is_online = online;
            user.last_seen = Some(last_seen);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: Uuid) -> User {
        User {
            id,
            email: Some("ana@example.com".to_string()),
            phone: None,
            first_name: "Ana".to_string(),
            last_name: "Reyes".to_string(),
            push_token: None,
            is_online: false,
            last_seen: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn set_online_stamps_last_seen() {
        let repo = MemoryUsersRepository::new();
        let id = Uuid::new_v4();
        repo.insert(user(id));

        let now = Utc::now();
        repo.set_online(id, true, now).await.unwrap();
        let stored = repo.get(id).await.unwrap().unwrap();
        assert!(stored.is_online);
        assert_eq!(stored.last_seen, Some(now));
    }
}

use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::{Amount, CatalogOption, UserInfo};

/// Read-only view of the user accounts owned by the identity service.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn user_exists(&self, id: Ulid) -> bool;

    async fn display_info(&self, id: Ulid) -> Option<UserInfo>;
}

/// Read-only view of the option catalog.
#[async_trait]
pub trait OptionCatalog: Send + Sync {
    async fn get(&self, id: Ulid) -> Option<CatalogOption>;
}

#[derive(Default)]
pub struct InMemoryDirectory {
    users: DashMap<Ulid, UserInfo>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: Ulid, info: UserInfo) {
        self.users.insert(id, info);
    }
}

#[async_trait]
impl UserDirectory for InMemoryDirectory {
    async fn user_exists(&self, id: Ulid) -> bool {
        self.users.contains_key(&id)
    }

    async fn display_info(&self, id: Ulid) -> Option<UserInfo> {
        self.users.get(&id).map(|e| e.value().clone())
    }
}

#[derive(Default)]
pub struct InMemoryCatalog {
    options: DashMap<Ulid, CatalogOption>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, option: CatalogOption) {
        self.options.insert(option.id, option);
    }

    /// Returns false if the option does not exist.
    pub fn set_price(&self, id: &Ulid, unit_price: Amount) -> bool {
        match self.options.get_mut(id) {
            Some(mut option) => {
                option.unit_price = unit_price;
                true
            }
            None => false,
        }
    }

    pub fn set_active(&self, id: &Ulid, active: bool) -> bool {
        match self.options.get_mut(id) {
            Some(mut option) => {
                option.active = active;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl OptionCatalog for InMemoryCatalog {
    async fn get(&self, id: Ulid) -> Option<CatalogOption> {
        self.options.get(&id).map(|e| e.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn directory_lookup() {
        let dir = InMemoryDirectory::new();
        let id = Ulid::new();
        assert!(!dir.user_exists(id).await);
        dir.insert(
            id,
            UserInfo {
                name: "Aiko Tanaka".into(),
                email: "aiko@example.com".into(),
                phone: None,
            },
        );
        assert!(dir.user_exists(id).await);
        assert_eq!(dir.display_info(id).await.unwrap().name, "Aiko Tanaka");
    }

    #[tokio::test]
    async fn catalog_price_change() {
        let catalog = InMemoryCatalog::new();
        let id = Ulid::new();
        catalog.insert(CatalogOption {
            id,
            name: "Backdrop".into(),
            unit_price: 1_000,
            unit: "piece".into(),
            active: true,
        });
        assert!(catalog.set_price(&id, 1_200));
        assert!(!catalog.set_price(&Ulid::new(), 1));
        assert_eq!(catalog.get(id).await.unwrap().unit_price, 1_200);
        assert!(catalog.set_active(&id, false));
        assert!(!catalog.get(id).await.unwrap().active);
    }
}

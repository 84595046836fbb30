use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{ConfigError, Result};
use crate::types::{InstanceId, TargetSelector};

/// Instance inventory backend (auto scaling groups + EC2 in production).
#[async_trait]
pub trait InstanceInventory: Send + Sync {
    /// Current live members of `group`, or `None` if no such group exists.
    /// An existing group with no members is `Some(vec![])`.
    async fn resolve_group(&self, group: &str) -> Result<Option<Vec<InstanceId>>>;

    async fn stop_instances(&self, ids: &[InstanceId]) -> Result<()>;
}

/// Maps a [`TargetSelector`] to concrete instance ids.
#[derive(Clone)]
pub struct InstanceResolver {
    inventory: Arc<dyn InstanceInventory>,
}

impl InstanceResolver {
    pub fn new(inventory: Arc<dyn InstanceInventory>) -> Self {
        Self { inventory }
    }

    /// Resolve a selector. Explicit ids are returned as given (duplicates
    /// collapsed, first occurrence kept) without touching the inventory.
    pub async fn resolve(&self, selector: &TargetSelector) -> Result<Vec<InstanceId>> {
        let ids = match selector {
            TargetSelector::Explicit { instances } => instances.clone(),
            TargetSelector::Group { name } => match self.inventory.resolve_group(name).await? {
                Some(members) => members,
                None => return Err(ConfigError::GroupNotFound(name.clone())),
            },
        };
        let ids = dedup(ids);
        tracing::info!(selector = %selector, count = ids.len(), "targets resolved");
        Ok(ids)
    }
}

fn dedup(ids: Vec<InstanceId>) -> Vec<InstanceId> {
    let mut seen = std::collections::HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryInventory;

    fn ids(list: &[&str]) -> Vec<InstanceId> {
        list.iter().map(|s| InstanceId::new(*s)).collect()
    }

    #[tokio::test]
    async fn explicit_ids_pass_through_in_order() {
        let inventory = Arc::new(MemoryInventory::new());
        let resolver = InstanceResolver::new(inventory.clone());
        let got = resolver
            .resolve(&TargetSelector::explicit(["i-b", "i-a", "i-b"]))
            .await
            .unwrap();
        assert_eq!(got, ids(&["i-b", "i-a"]));
        assert_eq!(inventory.group_lookups(), 0);
    }

    #[tokio::test]
    async fn group_members_come_from_inventory() {
        let inventory = Arc::new(MemoryInventory::new().with_group("rp-asg", &["i-1", "i-2"]));
        let resolver = InstanceResolver::new(inventory.clone());
        let got = resolver.resolve(&TargetSelector::group("rp-asg")).await.unwrap();
        assert_eq!(got, ids(&["i-1", "i-2"]));
        assert_eq!(inventory.group_lookups(), 1);
    }

    #[tokio::test]
    async fn empty_group_is_not_an_error() {
        let inventory = Arc::new(MemoryInventory::new().with_group("rp-asg", &[]));
        let resolver = InstanceResolver::new(inventory);
        let got = resolver.resolve(&TargetSelector::group("rp-asg")).await.unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn unknown_group_is_group_not_found() {
        let resolver = InstanceResolver::new(Arc::new(MemoryInventory::new()));
        let err = resolver
            .resolve(&TargetSelector::group("missing-asg"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::GroupNotFound(ref g) if g == "missing-asg"));
    }
}

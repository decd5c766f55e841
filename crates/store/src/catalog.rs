// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tracing::{debug, info};

use handoff_types::identifiers::NodeId;

use crate::target_store::TargetStore;
use crate::{Result, StoreError};

/// All target stores below the hints directory.
#[derive(Debug)]
pub struct HintsCatalog {
    root: PathBuf,
    stores: DashMap<NodeId, Arc<TargetStore>>,
    retired: DashSet<NodeId>,
}

impl HintsCatalog {
    /// Opens every target store found in `root`. Entries whose name is not a node id are
    /// left alone.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(StoreError::io(&root))?;

        let stores = DashMap::new();
        let mut entries = tokio::fs::read_dir(&root)
            .await
            .map_err(StoreError::io(&root))?;
        while let Some(entry) = entries.next_entry().await.map_err(StoreError::io(&root))? {
            let is_dir = entry
                .file_type()
                .await
                .map_err(StoreError::io(entry.path()))?
                .is_dir();
            let target = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<NodeId>().ok());
            match target {
                Some(target) if is_dir => {
                    let store = TargetStore::open(entry.path(), target).await?;
                    stores.insert(target, Arc::new(store));
                }
                _ => debug!("Ignoring unexpected entry {}", entry.path().display()),
            }
        }

        info!(
            targets = stores.len(),
            "Opened hints catalog at {}",
            root.display()
        );
        Ok(Self {
            root,
            stores,
            retired: DashSet::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn get(&self, target: NodeId) -> Option<Arc<TargetStore>> {
        self.stores.get(&target).map(|store| Arc::clone(&store))
    }

    /// Returns the store of `target`, creating it if needed. The flag is `true` if this call
    /// created the store.
    pub async fn get_or_create(&self, target: NodeId) -> Result<(Arc<TargetStore>, bool)> {
        if self.is_retired(target) {
            return Err(StoreError::Retired(target));
        }
        if let Some(store) = self.get(target) {
            return Ok((store, false));
        }

        let store = Arc::new(TargetStore::open(self.target_dir(target), target).await?);
        self.insert_opened(store).await
    }

    async fn insert_opened(&self, store: Arc<TargetStore>) -> Result<(Arc<TargetStore>, bool)> {
        let target = store.target();
        let (entry, created) = {
            let entry = self.stores.entry(target).or_insert(Arc::clone(&store));
            let created = Arc::ptr_eq(&entry, &store);
            (Arc::clone(&entry), created)
        };

        // a retire may have run while the store was being opened
        if self.is_retired(target) {
            self.stores
                .remove_if(&target, |_, inserted| Arc::ptr_eq(inserted, &entry));
            entry.destroy().await?;
            return Err(StoreError::Retired(target));
        }
        Ok((entry, created))
    }

    fn target_dir(&self, target: NodeId) -> PathBuf {
        self.root.join(target.to_string())
    }

    pub fn targets(&self) -> Vec<NodeId> {
        let mut targets: Vec<_> = self.stores.iter().map(|entry| *entry.key()).collect();
        targets.sort_unstable();
        targets
    }

    pub fn stores(&self) -> Vec<Arc<TargetStore>> {
        let mut stores: Vec<_> = self
            .stores
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        stores.sort_by_key(|store| store.target());
        stores
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.stores.iter().map(|entry| entry.size_bytes()).sum()
    }

    pub fn is_retired(&self, target: NodeId) -> bool {
        self.retired.contains(&target)
    }

    /// Deletes everything stored for `target` and refuses hints for it from now on.
    ///
    /// Returns the removed store, if there was one.
    pub async fn retire(&self, target: NodeId) -> Result<Option<Arc<TargetStore>>> {
        self.retired.insert(target);
        let removed = self.stores.remove(&target).map(|(_, store)| store);
        match &removed {
            Some(store) => store.destroy().await?,
            None => match tokio::fs::remove_dir_all(self.target_dir(target)).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(StoreError::io(self.target_dir(target))(err)),
            },
        }
        Ok(removed)
    }

    /// Deletes all hints of all targets. Returns the number of deleted segments.
    pub async fn truncate_all(&self) -> Result<usize> {
        let mut deleted = 0;
        for store in self.stores() {
            deleted += store.truncate().await?.len();
        }
        info!(segments = deleted, "Truncated all stored hints");
        Ok(deleted)
    }
}

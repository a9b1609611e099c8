//! In-memory implementation of the job store.
//!
//! Keeps the exact conditional-update semantics of the Postgres store
//! behind a process-local mutex. Used by the engine test suite and by
//! single-node deployments that do not want a database; it is never a
//! cross-instance coordination point (that role belongs to
//! [`crate::PgJobStore`]).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use renderq_models::{
    LeaseRecord, LeaseStatus, ProductStatus, ResultPayload, WorkKey, WorkProduct,
};

use crate::error::StoreResult;
use crate::store::JobStore;

#[derive(Default)]
struct Inner {
    products: HashMap<WorkKey, WorkProduct>,
    leases: HashMap<WorkKey, LeaseRecord>,
}

/// Process-local job store.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of products held (test helper).
    pub fn product_count(&self) -> usize {
        self.inner.lock().unwrap().products.len()
    }

    /// Overwrite a lease record directly, bypassing conditional checks.
    ///
    /// Test-only escape hatch for fabricating crashed-worker states
    /// (e.g. a processing lease with a 90-minute-old heartbeat).
    pub fn put_lease_unchecked(&self, lease: LeaseRecord) {
        self.inner.lock().unwrap().leases.insert(lease.key.clone(), lease);
    }

    /// Drop a lease record directly, bypassing conditional checks.
    ///
    /// Test-only escape hatch for simulating drift between the tables.
    pub fn remove_lease_unchecked(&self, key: &WorkKey) {
        self.inner.lock().unwrap().leases.remove(key);
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert_new(&self, product: &WorkProduct) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.products.contains_key(&product.key) {
            return Ok(false);
        }
        inner
            .products
            .insert(product.key.clone(), product.clone());
        inner
            .leases
            .entry(product.key.clone())
            .or_insert_with(|| LeaseRecord::new_queued(product.key.clone()));
        Ok(true)
    }

    async fn remove_new(&self, key: &WorkKey) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();

        let removable = matches!(
            (inner.products.get(key), inner.leases.get(key)),
            (Some(product), Some(lease))
                if product.status == ProductStatus::Queued
                    && lease.status == LeaseStatus::Queued
                    && lease.owner_instance_id.is_none()
        );

        if removable {
            inner.products.remove(key);
            inner.leases.remove(key);
        }
        Ok(removable)
    }

    async fn get_product(&self, key: &WorkKey) -> StoreResult<Option<WorkProduct>> {
        Ok(self.inner.lock().unwrap().products.get(key).cloned())
    }

    async fn get_lease(&self, key: &WorkKey) -> StoreResult<Option<LeaseRecord>> {
        Ok(self.inner.lock().unwrap().leases.get(key).cloned())
    }

    async fn claim(&self, key: &WorkKey, owner: &str) -> StoreResult<Option<LeaseRecord>> {
        let mut inner = self.inner.lock().unwrap();

        let claimed = match inner.leases.get_mut(key) {
            Some(lease)
                if lease.status == LeaseStatus::Queued && lease.owner_instance_id.is_none() =>
            {
                lease.claim(owner);
                Some(lease.clone())
            }
            _ => None,
        };

        if claimed.is_some() {
            if let Some(product) = inner.products.get_mut(key) {
                if product.status == ProductStatus::Queued {
                    product.start();
                }
            }
        }

        Ok(claimed)
    }

    async fn heartbeat(&self, key: &WorkKey, owner: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.leases.get_mut(key) {
            Some(lease) if lease.owned_by(owner) => {
                lease.record_heartbeat();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(
        &self,
        key: &WorkKey,
        artifact_ref: &str,
        payload: &ResultPayload,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();

        let won = match inner.products.get_mut(key) {
            Some(product) if !product.is_terminal() => {
                product.complete(artifact_ref, payload.clone());
                true
            }
            _ => false,
        };

        if won {
            inner.leases.remove(key);
        }
        Ok(won)
    }

    async fn fail(&self, key: &WorkKey, error: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();

        let won = match inner.products.get_mut(key) {
            Some(product) if !product.is_terminal() => {
                product.fail(error);
                true
            }
            _ => false,
        };

        if won {
            inner.leases.remove(key);
        }
        Ok(won)
    }

    async fn requeue(&self, key: &WorkKey, owner: &str, last_error: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();

        let won = match inner.leases.get_mut(key) {
            Some(lease) if lease.owned_by(owner) => {
                lease.release(1, Some(last_error.to_string()));
                true
            }
            _ => false,
        };

        if won {
            if let Some(product) = inner.products.get_mut(key) {
                if product.status == ProductStatus::Processing {
                    product.requeue();
                }
            }
        }
        Ok(won)
    }

    async fn release_owned(&self, owner: &str) -> StoreResult<Vec<WorkKey>> {
        let mut inner = self.inner.lock().unwrap();

        let mut released = Vec::new();
        for (key, lease) in inner.leases.iter_mut() {
            if lease.owned_by(owner) {
                lease.status = LeaseStatus::Queued;
                lease.owner_instance_id = None;
                lease.claimed_at = None;
                lease.heartbeat_at = None;
                lease.started_at = None;
                released.push(key.clone());
            }
        }

        for key in &released {
            if let Some(product) = inner.products.get_mut(key) {
                if product.status == ProductStatus::Processing {
                    product.requeue();
                }
            }
        }

        Ok(released)
    }

    async fn list_stale(&self, cutoff_secs: i64) -> StoreResult<Vec<LeaseRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .leases
            .values()
            .filter(|lease| lease.is_stale(cutoff_secs))
            .cloned()
            .collect())
    }

    async fn recover_stale(&self, key: &WorkKey, expected_owner: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();

        let won = match inner.leases.get_mut(key) {
            Some(lease) if lease.owned_by(expected_owner) => {
                lease.release(1, None);
                lease.last_error = None;
                true
            }
            _ => false,
        };

        if won {
            if let Some(product) = inner.products.get_mut(key) {
                if product.status == ProductStatus::Processing {
                    product.requeue();
                }
            }
        }
        Ok(won)
    }

    async fn list_queued(&self, limit: usize) -> StoreResult<Vec<LeaseRecord>> {
        let inner = self.inner.lock().unwrap();

        let mut queued: Vec<(chrono::DateTime<Utc>, LeaseRecord)> = inner
            .leases
            .values()
            .filter(|lease| lease.status == LeaseStatus::Queued)
            .map(|lease| {
                let created = inner
                    .products
                    .get(&lease.key)
                    .map(|p| p.created_at)
                    .unwrap_or_else(Utc::now);
                (created, lease.clone())
            })
            .collect();

        queued.sort_by_key(|(created, _)| *created);
        Ok(queued
            .into_iter()
            .take(limit)
            .map(|(_, lease)| lease)
            .collect())
    }

    async fn list_unleased(&self, limit: usize) -> StoreResult<Vec<WorkProduct>> {
        let inner = self.inner.lock().unwrap();

        let mut drifted: Vec<WorkProduct> = inner
            .products
            .values()
            .filter(|p| !p.is_terminal() && !inner.leases.contains_key(&p.key))
            .cloned()
            .collect();

        drifted.sort_by_key(|p| p.created_at);
        drifted.truncate(limit);
        Ok(drifted)
    }

    async fn ensure_lease(&self, key: &WorkKey) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.leases.contains_key(key) {
            return Ok(false);
        }
        inner
            .leases
            .insert(key.clone(), LeaseRecord::new_queued(key.clone()));
        Ok(true)
    }
}

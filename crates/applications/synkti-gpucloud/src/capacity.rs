//! GPU inventory and tenant quota accounting
//!
//! [`ResourcePool`] tracks committed GPUs per `(region, SKU)` against the
//! overcommit ceiling; [`TenantLedger`] tracks each tenant's quota and usage.
//! Both sit behind a single lock in [`CapacityManager`] because a reservation
//! must check and commit pool and quota together: either both change or
//! neither does.

use crate::config::{PoolSpec, SimConfig};
use crate::error::{Result, SimError};
use crate::types::{GpuSku, Quota, Region, SimTime, Tenant, TenantId, TenantUsage};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Held pool capacity plus tenant quota; released exactly once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationToken {
    id: u64,
    pub tenant_id: TenantId,
    pub region: Region,
    pub sku: GpuSku,
    pub count: u32,
}

impl ReservationToken {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Committed versus available units of one pool entry
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoolUsage {
    pub region: Region,
    pub sku: GpuSku,
    pub total_units: u32,
    pub overcommit_ratio: f64,
    pub committed: u32,
    /// `total_units * overcommit_ratio`
    pub capacity: u32,
}

impl PoolUsage {
    pub fn available(&self) -> u32 {
        self.capacity.saturating_sub(self.committed)
    }
}

#[derive(Debug, Clone)]
struct PoolEntry {
    spec: PoolSpec,
    committed: u32,
}

/// GPU inventory per `(region, SKU)`
#[derive(Debug, Clone, Default)]
pub struct ResourcePool {
    entries: BTreeMap<(Region, GpuSku), PoolEntry>,
}

impl ResourcePool {
    pub fn new(specs: &[PoolSpec]) -> Self {
        let entries = specs
            .iter()
            .map(|spec| {
                (
                    (spec.region, spec.sku),
                    PoolEntry {
                        spec: *spec,
                        committed: 0,
                    },
                )
            })
            .collect();
        Self { entries }
    }

    pub fn supports_region(&self, region: Region) -> bool {
        self.entries.keys().any(|(r, _)| *r == region)
    }

    pub fn supports(&self, region: Region, sku: GpuSku) -> bool {
        self.entries.contains_key(&(region, sku))
    }

    pub fn usage(&self, region: Region, sku: GpuSku) -> Option<PoolUsage> {
        self.entries.get(&(region, sku)).map(|e| PoolUsage {
            region,
            sku,
            total_units: e.spec.total_units,
            overcommit_ratio: e.spec.overcommit_ratio,
            committed: e.committed,
            capacity: e.spec.capacity(),
        })
    }

    pub fn all_usage(&self) -> Vec<PoolUsage> {
        self.entries
            .keys()
            .filter_map(|&(region, sku)| self.usage(region, sku))
            .collect()
    }

    /// Units that can still be committed (zero if the pool does not exist)
    pub fn available(&self, region: Region, sku: GpuSku) -> u32 {
        self.usage(region, sku).map(|u| u.available()).unwrap_or(0)
    }

    fn commit(&mut self, region: Region, sku: GpuSku, count: u32) {
        if let Some(entry) = self.entries.get_mut(&(region, sku)) {
            entry.committed = entry.committed.saturating_add(count);
        }
    }

    fn uncommit(&mut self, region: Region, sku: GpuSku, count: u32) {
        if let Some(entry) = self.entries.get_mut(&(region, sku)) {
            entry.committed = entry.committed.saturating_sub(count);
        }
    }
}

/// Per-tenant quota and usage
#[derive(Debug, Clone, Default)]
pub struct TenantLedger {
    tenants: BTreeMap<TenantId, Tenant>,
}

impl TenantLedger {
    /// Fetch the tenant, creating it with `quota` on first sight
    pub fn ensure(&mut self, id: &TenantId, quota: Quota, now: SimTime) -> &mut Tenant {
        self.tenants.entry(id.clone()).or_insert_with(|| {
            debug!(tenant_id = %id, "Registering tenant");
            Tenant {
                id: id.clone(),
                quota,
                usage: TenantUsage::default(),
                created_at: now,
            }
        })
    }

    pub fn get(&self, id: &TenantId) -> Option<&Tenant> {
        self.tenants.get(id)
    }

    fn get_mut(&mut self, id: &TenantId) -> Option<&mut Tenant> {
        self.tenants.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }

    pub fn all(&self) -> Vec<Tenant> {
        self.tenants.values().cloned().collect()
    }
}

struct Books {
    pool: ResourcePool,
    ledger: TenantLedger,
    active: HashMap<u64, ReservationToken>,
    next_id: u64,
}

/// Global critical section over the pool and the tenant ledger
pub struct CapacityManager {
    default_quota: Quota,
    tenant_quotas: HashMap<TenantId, Quota>,
    books: Mutex<Books>,
}

impl CapacityManager {
    pub fn new(config: &SimConfig) -> Self {
        Self {
            default_quota: config.default_quota,
            tenant_quotas: config.tenant_quotas.clone(),
            books: Mutex::new(Books {
                pool: ResourcePool::new(&config.pools),
                ledger: TenantLedger::default(),
                active: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    fn quota_for(&self, tenant: &TenantId) -> Quota {
        self.tenant_quotas
            .get(tenant)
            .copied()
            .unwrap_or(self.default_quota)
    }

    /// Register the tenant if this is its first request
    pub fn ensure_tenant(&self, tenant: &TenantId, now: SimTime) -> Tenant {
        let quota = self.quota_for(tenant);
        self.books.lock().ledger.ensure(tenant, quota, now).clone()
    }

    /// Whether `(region, sku)` is in the inventory; distinguishes an
    /// unsupported region from a SKU the region does not carry
    pub fn check_offered(&self, region: Region, sku: GpuSku) -> Result<()> {
        let books = self.books.lock();
        if !books.pool.supports_region(region) {
            return Err(SimError::validation(format!("unsupported region: {}", region)));
        }
        if !books.pool.supports(region, sku) {
            return Err(SimError::validation(format!("{} is not offered in {}", sku, region)));
        }
        Ok(())
    }

    /// Atomically check quota and capacity, then commit both
    pub fn reserve(
        &self,
        tenant: &TenantId,
        region: Region,
        sku: GpuSku,
        count: u32,
        now: SimTime,
    ) -> Result<ReservationToken> {
        if count == 0 {
            return Err(SimError::validation("GPU count must be positive"));
        }

        let quota = self.quota_for(tenant);
        let mut books = self.books.lock();
        let Books {
            pool,
            ledger,
            active,
            next_id,
        } = &mut *books;

        if !pool.supports(region, sku) {
            return Err(SimError::validation(format!("{} is not offered in {}", sku, region)));
        }

        let account = ledger.ensure(tenant, quota, now);
        if account.usage.instances.saturating_add(1) > account.quota.max_instances {
            warn!(tenant_id = %tenant, limit = account.quota.max_instances, "Instance quota exhausted");
            return Err(SimError::quota(
                tenant,
                format!("instance limit {} reached", account.quota.max_instances),
            ));
        }
        if account.usage.gpus.saturating_add(count) > account.quota.max_gpus {
            let left = account.quota.max_gpus.saturating_sub(account.usage.gpus);
            warn!(tenant_id = %tenant, requested = count, left, "GPU quota exhausted");
            return Err(SimError::quota(
                tenant,
                format!("requested {} GPUs, {} of {} left", count, left, account.quota.max_gpus),
            ));
        }

        let available = pool.available(region, sku);
        if count > available {
            warn!(%region, %sku, requested = count, available, "Pool capacity exhausted");
            return Err(SimError::CapacityExceeded {
                resource: format!("{} in {}", sku, region),
                requested: count,
                available,
            });
        }

        account.usage.instances = account.usage.instances.saturating_add(1);
        account.usage.gpus = account.usage.gpus.saturating_add(count);
        pool.commit(region, sku, count);

        let token = ReservationToken {
            id: *next_id,
            tenant_id: tenant.clone(),
            region,
            sku,
            count,
        };
        *next_id += 1;
        active.insert(token.id, token.clone());

        debug!(
            tenant_id = %tenant, %region, %sku, count,
            reservation = token.id,
            "Capacity reserved"
        );
        Ok(token)
    }

    /// Return a reservation. Releasing an already released token is a
    /// no-op; returns whether anything was released.
    pub fn release(&self, token: &ReservationToken) -> bool {
        let mut books = self.books.lock();
        let Books {
            pool,
            ledger,
            active,
            ..
        } = &mut *books;

        let Some(held) = active.remove(&token.id) else {
            debug!(reservation = token.id, "Reservation already released");
            return false;
        };

        pool.uncommit(held.region, held.sku, held.count);
        if let Some(account) = ledger.get_mut(&held.tenant_id) {
            account.usage.instances = account.usage.instances.saturating_sub(1);
            account.usage.gpus = account.usage.gpus.saturating_sub(held.count);
        }

        debug!(
            tenant_id = %held.tenant_id, region = %held.region, sku = %held.sku,
            count = held.count, reservation = held.id,
            "Capacity released"
        );
        true
    }

    /// Count one more active job against the tenant's quota
    pub fn acquire_job(&self, tenant: &TenantId, now: SimTime) -> Result<()> {
        let quota = self.quota_for(tenant);
        let mut books = self.books.lock();
        let account = books.ledger.ensure(tenant, quota, now);
        if account.usage.active_jobs >= account.quota.max_active_jobs {
            warn!(tenant_id = %tenant, limit = account.quota.max_active_jobs, "Job quota exhausted");
            return Err(SimError::quota(
                tenant,
                format!("active job limit {} reached", account.quota.max_active_jobs),
            ));
        }
        account.usage.active_jobs = account.usage.active_jobs.saturating_add(1);
        Ok(())
    }

    /// Give back one active job slot
    pub fn release_job(&self, tenant: &TenantId) {
        if let Some(account) = self.books.lock().ledger.get_mut(tenant) {
            account.usage.active_jobs = account.usage.active_jobs.saturating_sub(1);
        }
    }

    pub fn tenant(&self, tenant: &TenantId) -> Option<Tenant> {
        self.books.lock().ledger.get(tenant).cloned()
    }

    pub fn tenants(&self) -> Vec<Tenant> {
        self.books.lock().ledger.all()
    }

    pub fn tenant_count(&self) -> usize {
        self.books.lock().ledger.len()
    }

    pub fn pool_usage(&self) -> Vec<PoolUsage> {
        self.books.lock().pool.all_usage()
    }

    pub fn usage_of(&self, region: Region, sku: GpuSku) -> Option<PoolUsage> {
        self.books.lock().pool.usage(region, sku)
    }

    /// Reservations not yet released
    pub fn active_reservations(&self) -> usize {
        self.books.lock().active.len()
    }
}

//! Admission control for guest resources on this node.
//!
//! A placement first holds a *dangling* reservation for the machine. The
//! agent confirms it when the machine is actually placed, and releases it
//! when the machine is destroyed. Dangling reservations expire after a TTL
//! and are dropped by [`LocalAllocator::gc`].

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use fleet_id::MachineId;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::machine::GuestResources;

#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("no reservation for machine {0}")]
    NotFound(MachineId),

    #[error("reservation for machine {0} expired")]
    Expired(MachineId),

    #[error("machine {0} already holds a confirmed allocation")]
    AlreadyAllocated(MachineId),

    #[error("insufficient {resource} to admit machine {machine_id}")]
    Exhausted {
        machine_id: MachineId,
        resource: &'static str,
    },
}

/// Allocator operations the machine lifecycle depends on.
#[async_trait]
pub trait Allocator: Send + Sync {
    /// Turns a dangling reservation into a confirmed allocation.
    async fn confirm_allocation(&self, machine_id: MachineId) -> Result<(), AllocatorError>;

    /// Releases the allocation. Returns [`AllocatorError::NotFound`] if none
    /// is held; callers only warn about that.
    async fn delete_allocation(&self, machine_id: MachineId) -> Result<(), AllocatorError>;
}

#[derive(Debug, Clone, Copy)]
enum Hold {
    Dangling { expires_at: Instant },
    Confirmed,
}

#[derive(Debug, Clone, Copy)]
struct Reservation {
    resources: GuestResources,
    hold: Hold,
}

impl Reservation {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.hold, Hold::Dangling { expires_at } if expires_at <= now)
    }
}

/// In-memory allocator bounded by the node's capacity.
pub struct LocalAllocator {
    capacity: GuestResources,
    ttl: Duration,
    reservations: Mutex<HashMap<MachineId, Reservation>>,
}

impl LocalAllocator {
    pub fn new(capacity: GuestResources, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            reservations: Mutex::new(HashMap::new()),
        }
    }

    fn reservations(&self) -> MutexGuard<'_, HashMap<MachineId, Reservation>> {
        self.reservations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Holds `resources` for `machine_id` until confirmed or expired.
    ///
    /// A dangling hold is replaced; a confirmed one is never downgraded.
    pub fn reserve(
        &self,
        machine_id: MachineId,
        resources: GuestResources,
    ) -> Result<(), AllocatorError> {
        let now = Instant::now();
        let mut reservations = self.reservations();

        if reservations
            .get(&machine_id)
            .is_some_and(|r| matches!(r.hold, Hold::Confirmed))
        {
            return Err(AllocatorError::AlreadyAllocated(machine_id));
        }

        let used = reservations
            .iter()
            .filter(|(id, r)| **id != machine_id && !r.is_expired(now))
            .fold((0u32, 0u64), |(cpus, mem), (_, r)| {
                (cpus + r.resources.cpus, mem + r.resources.memory_mb)
            });

        if used.0 + resources.cpus > self.capacity.cpus {
            return Err(AllocatorError::Exhausted {
                machine_id,
                resource: "cpus",
            });
        }
        if used.1 + resources.memory_mb > self.capacity.memory_mb {
            return Err(AllocatorError::Exhausted {
                machine_id,
                resource: "memory_mb",
            });
        }

        reservations.insert(
            machine_id,
            Reservation {
                resources,
                hold: Hold::Dangling {
                    expires_at: now + self.ttl,
                },
            },
        );
        debug!(machine_id = %machine_id, cpus = resources.cpus, memory_mb = resources.memory_mb, "Reserved resources");
        Ok(())
    }

    /// Drops expired dangling reservations. Returns how many were dropped.
    pub fn gc(&self) -> usize {
        let now = Instant::now();
        let mut reservations = self.reservations();
        let before = reservations.len();
        reservations.retain(|_, r| !r.is_expired(now));
        let dropped = before - reservations.len();
        if dropped > 0 {
            info!(dropped, "Released expired reservations");
        }
        dropped
    }

    /// Resources held by live reservations.
    pub fn used(&self) -> GuestResources {
        let now = Instant::now();
        self.reservations()
            .values()
            .filter(|r| !r.is_expired(now))
            .fold(
                GuestResources {
                    cpus: 0,
                    memory_mb: 0,
                },
                |acc, r| GuestResources {
                    cpus: acc.cpus + r.resources.cpus,
                    memory_mb: acc.memory_mb + r.resources.memory_mb,
                },
            )
    }

    pub fn is_confirmed(&self, machine_id: MachineId) -> bool {
        self.reservations()
            .get(&machine_id)
            .is_some_and(|r| matches!(r.hold, Hold::Confirmed))
    }
}

#[async_trait]
impl Allocator for LocalAllocator {
    async fn confirm_allocation(&self, machine_id: MachineId) -> Result<(), AllocatorError> {
        let now = Instant::now();
        let mut reservations = self.reservations();
        let reservation = reservations
            .get_mut(&machine_id)
            .ok_or(AllocatorError::NotFound(machine_id))?;

        if reservation.is_expired(now) {
            reservations.remove(&machine_id);
            return Err(AllocatorError::Expired(machine_id));
        }
        reservation.hold = Hold::Confirmed;
        Ok(())
    }

    async fn delete_allocation(&self, machine_id: MachineId) -> Result<(), AllocatorError> {
        self.reservations()
            .remove(&machine_id)
            .map(|_| ())
            .ok_or(AllocatorError::NotFound(machine_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> GuestResources {
        GuestResources {
            cpus: 1,
            memory_mb: 512,
        }
    }

    fn allocator() -> LocalAllocator {
        LocalAllocator::new(
            GuestResources {
                cpus: 2,
                memory_mb: 1024,
            },
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn test_reserve_confirm_delete() {
        let allocator = allocator();
        let id = MachineId::new();

        allocator.reserve(id, small()).unwrap();
        assert!(!allocator.is_confirmed(id));

        allocator.confirm_allocation(id).await.unwrap();
        assert!(allocator.is_confirmed(id));
        assert_eq!(allocator.used(), small());

        allocator.delete_allocation(id).await.unwrap();
        assert!(matches!(
            allocator.delete_allocation(id).await,
            Err(AllocatorError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserve_keeps_confirmed_allocation() {
        let allocator = allocator();
        let id = MachineId::new();
        allocator.reserve(id, small()).unwrap();
        allocator.confirm_allocation(id).await.unwrap();

        let err = allocator.reserve(id, small()).unwrap_err();
        assert!(matches!(err, AllocatorError::AlreadyAllocated(_)));
        assert!(allocator.is_confirmed(id));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(allocator.gc(), 0);
        assert!(allocator.is_confirmed(id));
        assert_eq!(allocator.used(), small());
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let allocator = allocator();
        allocator.reserve(MachineId::new(), small()).unwrap();
        allocator.reserve(MachineId::new(), small()).unwrap();

        let err = allocator.reserve(MachineId::new(), small()).unwrap_err();
        assert!(matches!(err, AllocatorError::Exhausted { resource: "cpus", .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dangling_reservations_expire() {
        let allocator = allocator();
        let dangling = MachineId::new();
        let confirmed = MachineId::new();
        allocator.reserve(dangling, small()).unwrap();
        allocator.reserve(confirmed, small()).unwrap();
        allocator.confirm_allocation(confirmed).await.unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(matches!(
            allocator.confirm_allocation(dangling).await,
            Err(AllocatorError::Expired(_))
        ));
        assert_eq!(allocator.gc(), 0);
        assert!(allocator.is_confirmed(confirmed));

        let late = MachineId::new();
        allocator.reserve(late, small()).unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(allocator.gc(), 1);
    }
}

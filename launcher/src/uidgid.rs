/*
 * SPDX-FileCopyrightText: Copyright 2026 Communication Manager contributors
 * SPDX-License-Identifier: Apache-2.0
 */

//! UID and GID pools: range-bounded identifier allocation shared by every
//! `Instance`.

use common::error::{CmError, Result};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

/// Vetoes a candidate id before it is handed out, e.g. by consulting
/// `/etc/passwd` for a conflicting system account.
pub type Validator = Box<dyn Fn(u32) -> bool + Send + Sync>;

fn always_valid(_id: u32) -> bool {
    true
}

/// Allocates unique integers from `[range_begin, range_end)`.
pub struct UidPool {
    range_begin: u32,
    range_end: u32,
    validator: Validator,
    locked: Mutex<HashSet<u32>>,
}

impl UidPool {
    pub fn new(range_begin: u32, range_end: u32) -> Result<Self> {
        Self::with_validator(range_begin, range_end, Box::new(always_valid))
    }

    pub fn with_validator(range_begin: u32, range_end: u32, validator: Validator) -> Result<Self> {
        if range_begin >= range_end {
            return Err(CmError::InvalidArgument(format!(
                "invalid uid pool range [{range_begin}, {range_end})"
            )));
        }
        Ok(Self {
            range_begin,
            range_end,
            validator,
            locked: Mutex::new(HashSet::new()),
        })
    }

    /// Acquires the first free, validator-approved id in range.
    pub async fn acquire(&self) -> Result<u32> {
        let mut locked = self.locked.lock().await;
        for id in self.range_begin..self.range_end {
            if locked.contains(&id) {
                continue;
            }
            if !(self.validator)(id) {
                continue;
            }
            locked.insert(id);
            return Ok(id);
        }
        Err(CmError::NoMemory("uid pool exhausted".into()))
    }

    /// Reserves a specific id, e.g. when reloading a persisted instance.
    pub async fn try_acquire(&self, id: u32) -> Result<()> {
        if id < self.range_begin || id >= self.range_end {
            return Err(CmError::OutOfRange(format!(
                "uid {id} outside pool range [{}, {})",
                self.range_begin, self.range_end
            )));
        }
        let mut locked = self.locked.lock().await;
        if !locked.insert(id) {
            return Err(CmError::AlreadyExist(format!("uid {id} already held")));
        }
        Ok(())
    }

    pub async fn release(&self, id: u32) {
        self.locked.lock().await.remove(&id);
    }
}

/// Per-item reference-counted GID allocation: every service instance of the
/// same item shares one GID.
pub struct GidPool {
    range_begin: u32,
    range_end: u32,
    state: Mutex<GidPoolState>,
}

struct GidPoolState {
    by_item: HashMap<String, (u32, u32)>,
    held: HashSet<u32>,
}

impl GidPool {
    pub fn new(range_begin: u32, range_end: u32) -> Result<Self> {
        if range_begin >= range_end {
            return Err(CmError::InvalidArgument(format!(
                "invalid gid pool range [{range_begin}, {range_end})"
            )));
        }
        Ok(Self {
            range_begin,
            range_end,
            state: Mutex::new(GidPoolState {
                by_item: HashMap::new(),
                held: HashSet::new(),
            }),
        })
    }

    /// Returns `item_id`'s GID, incrementing its refcount. Allocates a new
    /// id (or honors `requested_gid` if nonzero and free) on first use.
    pub async fn get_gid(&self, item_id: &str, requested_gid: u32) -> Result<u32> {
        let mut state = self.state.lock().await;
        if let Some((gid, refcount)) = state.by_item.get_mut(item_id) {
            *refcount += 1;
            return Ok(*gid);
        }

        let gid = if requested_gid != 0 {
            if requested_gid < self.range_begin || requested_gid >= self.range_end {
                return Err(CmError::OutOfRange(format!(
                    "gid {requested_gid} outside pool range [{}, {})",
                    self.range_begin, self.range_end
                )));
            }
            if state.held.contains(&requested_gid) {
                return Err(CmError::AlreadyExist(format!("gid {requested_gid} already held")));
            }
            requested_gid
        } else {
            let mut found = None;
            for id in self.range_begin..self.range_end {
                if !state.held.contains(&id) {
                    found = Some(id);
                    break;
                }
            }
            found.ok_or_else(|| CmError::NoMemory("gid pool exhausted".into()))?
        };

        state.held.insert(gid);
        state.by_item.insert(item_id.to_string(), (gid, 1));
        Ok(gid)
    }

    /// Decrements `item_id`'s refcount; returns the id to the pool at zero.
    pub async fn release(&self, item_id: &str) {
        let mut state = self.state.lock().await;
        let Some((gid, refcount)) = state.by_item.get_mut(item_id) else {
            return;
        };
        *refcount -= 1;
        if *refcount == 0 {
            let gid = *gid;
            state.by_item.remove(item_id);
            state.held.remove(&gid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn uid_pool_acquires_distinct_ids() {
        let pool = UidPool::new(1000, 1003).unwrap();
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert!(matches!(pool.acquire().await, Err(CmError::NoMemory(_))));
    }

    #[tokio::test]
    async fn uid_pool_release_frees_id() {
        let pool = UidPool::new(1000, 1001).unwrap();
        let a = pool.acquire().await.unwrap();
        pool.release(a).await;
        assert_eq!(pool.acquire().await.unwrap(), a);
    }

    #[tokio::test]
    async fn uid_pool_try_acquire_respects_range_and_conflicts() {
        let pool = UidPool::new(1000, 1010).unwrap();
        assert!(matches!(pool.try_acquire(5).await, Err(CmError::OutOfRange(_))));
        pool.try_acquire(1005).await.unwrap();
        assert!(matches!(pool.try_acquire(1005).await, Err(CmError::AlreadyExist(_))));
    }

    #[tokio::test]
    async fn uid_pool_validator_vetoes_ids() {
        let pool = UidPool::with_validator(1000, 1003, Box::new(|id| id != 1000)).unwrap();
        assert_eq!(pool.acquire().await.unwrap(), 1001);
    }

    #[tokio::test]
    async fn gid_pool_shares_gid_across_refs() {
        let pool = GidPool::new(2000, 2010).unwrap();
        let a = pool.get_gid("item1", 0).await.unwrap();
        let b = pool.get_gid("item1", 0).await.unwrap();
        assert_eq!(a, b);
        let other = pool.get_gid("item2", 0).await.unwrap();
        assert_ne!(a, other);
    }

    #[tokio::test]
    async fn gid_pool_releases_on_zero_refcount() {
        let pool = GidPool::new(2000, 2001).unwrap();
        let a = pool.get_gid("item1", 0).await.unwrap();
        pool.get_gid("item1", 0).await.unwrap();
        pool.release("item1").await;
        // still refcounted once
        assert!(matches!(pool.get_gid("item2", 0).await, Err(CmError::NoMemory(_))));
        pool.release("item1").await;
        assert_eq!(pool.get_gid("item2", 0).await.unwrap(), a);
    }

    #[tokio::test]
    async fn gid_pool_honors_requested_gid() {
        let pool = GidPool::new(2000, 2010).unwrap();
        let gid = pool.get_gid("item1", 2005).await.unwrap();
        assert_eq!(gid, 2005);
    }
}

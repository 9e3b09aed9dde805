use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::Serialize;
use shared_utils::config::{AllocationStrategy, IpamConfig};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IpamError {
    #[error("invalid address pool {cidr}: {reason}")]
    InvalidPool { cidr: String, reason: String },

    #[error("no free addresses left in {network}")]
    Exhausted { network: Ipv4Net },
}

/// Parse an assignment entry given either as a bare address or in CIDR form.
pub fn parse_host(entry: &str) -> Option<Ipv4Addr> {
    let entry = entry.trim();
    if entry.contains('/') {
        entry.parse::<Ipv4Net>().ok().map(|net| net.addr())
    } else {
        entry.parse().ok()
    }
}

/// Immutable description of the assignable range.
///
/// The network address and the gateway are never assignable. The broadcast
/// address is excluded too, except in a `/30` where both addresses after the
/// network address are handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressPool {
    network: Ipv4Net,
    gateway: Ipv4Addr,
    first: u32,
    last: u32,
}

impl AddressPool {
    pub fn new(cidr: &str, gateway: &str) -> Result<Self, IpamError> {
        let invalid = |reason: String| IpamError::InvalidPool {
            cidr: cidr.to_string(),
            reason,
        };

        let network = cidr
            .trim()
            .parse::<Ipv4Net>()
            .map_err(|e| invalid(e.to_string()))?
            .trunc();
        if network.prefix_len() >= 31 {
            return Err(invalid("prefix must be /30 or shorter".to_string()));
        }

        let gateway = parse_host(gateway)
            .ok_or_else(|| invalid(format!("gateway {gateway:?} is not an IPv4 address")))?;
        if !network.contains(&gateway) {
            return Err(invalid(format!("gateway {gateway} lies outside the network")));
        }

        let broadcast = u32::from(network.broadcast());
        let pool = AddressPool {
            network,
            gateway,
            first: u32::from(network.network()) + 1,
            last: if network.prefix_len() == 30 {
                broadcast
            } else {
                broadcast - 1
            },
        };
        if pool.capacity() == 0 {
            return Err(invalid("no assignable addresses".to_string()));
        }
        Ok(pool)
    }

    pub fn from_config(config: &IpamConfig) -> Result<Self, IpamError> {
        Self::new(&config.cidr, &config.gateway)
    }

    pub fn network(&self) -> Ipv4Net {
        self.network
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    pub fn first(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.first)
    }

    pub fn last(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.last)
    }

    pub fn is_assignable(&self, addr: Ipv4Addr) -> bool {
        let value = u32::from(addr);
        value >= self.first && value <= self.last && addr != self.gateway
    }

    /// Number of assignable addresses.
    pub fn capacity(&self) -> u32 {
        let span = self.last - self.first + 1;
        if self.gateway_in(self.first, self.last + 1) {
            span - 1
        } else {
            span
        }
    }

    fn gateway_in(&self, start: u32, end_exclusive: u32) -> bool {
        let gateway = u32::from(self.gateway);
        gateway >= start && gateway < end_exclusive
    }
}

/// Allocation counters, resettable through [`AddressAllocator::reset_stats`].
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct AllocatorStats {
    pub total_allocations: u64,
    pub failed_allocations: u64,
    pub last_allocation: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkInfo {
    pub cidr: String,
    pub gateway: String,
    pub range: String,
}

#[derive(Debug, Default)]
struct AllocationState {
    /// Addresses handed out by this allocator and not yet released
    reserved: BTreeSet<u32>,
    /// Every assignable address below this one is known to be in use
    floor: u32,
    stats: AllocatorStats,
}

/// Hands out unique addresses from an [`AddressPool`].
///
/// Callers pass the assignments they already know about (normally the peer
/// registry contents). The allocator also remembers what it has handed out
/// itself until [`release`](Self::release) is called, so concurrent callers
/// that have not yet persisted their assignment never receive the same
/// address.
#[derive(Clone)]
pub struct AddressAllocator {
    pool: AddressPool,
    strategy: AllocationStrategy,
    state: Arc<Mutex<AllocationState>>,
}

impl AddressAllocator {
    pub fn new(pool: AddressPool, strategy: AllocationStrategy) -> Self {
        let state = AllocationState {
            floor: pool.first,
            ..Default::default()
        };
        Self {
            pool,
            strategy,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn from_config(config: &IpamConfig) -> Result<Self, IpamError> {
        Ok(Self::new(AddressPool::from_config(config)?, config.strategy))
    }

    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    pub fn strategy(&self) -> AllocationStrategy {
        self.strategy
    }

    fn in_use(&self, known: &[String], reserved: &BTreeSet<u32>) -> BTreeSet<u32> {
        known
            .iter()
            .filter_map(|entry| parse_host(entry))
            .filter(|addr| self.pool.is_assignable(*addr))
            .map(u32::from)
            .chain(reserved.iter().copied())
            .collect()
    }

    fn scan(&self, start: u32, in_use: &BTreeSet<u32>) -> Option<u32> {
        let gateway = u32::from(self.pool.gateway);
        (start..=self.pool.last).find(|candidate| *candidate != gateway && !in_use.contains(candidate))
    }

    /// The floor is usable only if every assignable address below it is still in use.
    fn floor_is_valid(&self, floor: u32, in_use: &BTreeSet<u32>) -> bool {
        if floor <= self.pool.first {
            return true;
        }
        let mut assignable_below = floor - self.pool.first;
        if self.pool.gateway_in(self.pool.first, floor) {
            assignable_below -= 1;
        }
        in_use.range(self.pool.first..floor).count() as u32 == assignable_below
    }

    /// Reserve and return the lowest free address as a `/32`.
    pub async fn allocate(&self, known: &[String]) -> Result<Ipv4Net, IpamError> {
        let mut state = self.state.lock().await;
        let in_use = self.in_use(known, &state.reserved);

        let found = match self.strategy {
            AllocationStrategy::Linear => self.scan(self.pool.first, &in_use),
            AllocationStrategy::Tracked => {
                let start = if self.floor_is_valid(state.floor, &in_use) {
                    state.floor
                } else {
                    self.pool.first
                };
                self.scan(start, &in_use)
            }
        };

        match found {
            Some(value) => {
                state.reserved.insert(value);
                state.floor = value.saturating_add(1);
                state.stats.total_allocations += 1;
                state.stats.last_allocation = Some(Utc::now());
                let addr = Ipv4Addr::from(value);
                debug!(%addr, strategy = ?self.strategy, "address allocated");
                Ok(Ipv4Net::from(addr))
            }
            None => {
                state.stats.failed_allocations += 1;
                warn!(network = %self.pool.network, "address pool exhausted");
                Err(IpamError::Exhausted {
                    network: self.pool.network,
                })
            }
        }
    }

    /// Whether `candidate` could be handed out right now.
    pub async fn is_available(&self, candidate: &str, known: &[String]) -> bool {
        let Some(addr) = parse_host(candidate) else {
            return false;
        };
        if !self.pool.is_assignable(addr) {
            return false;
        }
        let state = self.state.lock().await;
        !self.in_use(known, &state.reserved).contains(&u32::from(addr))
    }

    /// Return an address to the pool. Returns whether it was reserved here.
    pub async fn release(&self, addr: Ipv4Addr) -> bool {
        if !self.pool.is_assignable(addr) {
            warn!(%addr, "attempted to release address outside of pool");
            return false;
        }
        let value = u32::from(addr);
        let mut state = self.state.lock().await;
        if value < state.floor {
            state.floor = value;
        }
        let released = state.reserved.remove(&value);
        debug!(%addr, released, "address released");
        released
    }

    pub async fn stats(&self) -> AllocatorStats {
        self.state.lock().await.stats.clone()
    }

    pub async fn reset_stats(&self) {
        self.state.lock().await.stats = AllocatorStats::default();
    }

    pub fn network_info(&self) -> NetworkInfo {
        NetworkInfo {
            cidr: self.pool.network.to_string(),
            gateway: self.pool.gateway.to_string(),
            range: format!("{}-{}", self.pool.first(), self.pool.last()),
        }
    }
}

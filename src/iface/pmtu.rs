//! Path-MTU cache.
//!
//! One entry per remote address, reference-counted by the connections
//! observing it. ICMP "fragmentation needed" reports clamp an entry down
//! within `[MIN_MTU, iface_mtu]`; a periodic aging pass raises stale
//! estimates back to the interface MTU so paths can recover.

use heapless::LinearMap;

use crate::config::PMTU_CACHE_COUNT;
use crate::time::{Duration, Instant};
use crate::wire::{Ipv4Address, IPV4_MIN_MTU};

/// How long a lowered estimate is honored before it is probed upward.
const PMTU_RAISE_INTERVAL: Duration = Duration::from_secs(600);

/// How long an unreferenced entry is kept for reuse.
const PMTU_UNUSED_TTL: Duration = Duration::from_secs(600);

/// Plateau table from RFC 1191 used when a "fragmentation needed" report
/// does not carry a next-hop MTU.
const MTU_PLATEAUS: [u16; 10] = [
    65535, 32000, 17914, 8166, 4352, 2002, 1492, 1006, 508, 296,
];

#[derive(Debug)]
struct PmtuEntry {
    mtu: u16,
    iface_mtu: u16,
    refcount: u16,
    expires_at: Instant,
}

/// A reference into the [PmtuCache].
///
/// The reference is created in not-setup state. Callers must [`reset`] it
/// before dropping it; the drop handler cannot do so because the reference
/// does not carry a cache pointer.
///
/// [PmtuCache]: struct.PmtuCache.html
/// [`reset`]: #method.reset
#[derive(Debug, Default)]
pub struct MtuRef {
    remote: Option<Ipv4Address>,
}

impl MtuRef {
    pub const fn new() -> MtuRef {
        MtuRef { remote: None }
    }

    pub fn is_setup(&self) -> bool {
        self.remote.is_some()
    }

    pub fn remote(&self) -> Option<Ipv4Address> {
        self.remote
    }

    /// Install a reference on the entry for `remote_addr`, creating the
    /// entry if needed, and return the current PMTU estimate (at least
    /// `MIN_MTU`). Returns `None` when the cache is full of referenced
    /// entries.
    pub fn setup(
        &mut self,
        cache: &mut PmtuCache,
        remote_addr: Ipv4Address,
        iface_mtu: u16,
        now: Instant,
    ) -> Option<u16> {
        debug_assert!(!self.is_setup());
        let mtu = cache.acquire(remote_addr, iface_mtu, now)?;
        self.remote = Some(remote_addr);
        Some(mtu)
    }

    /// Release the reference, returning the object to not-setup state.
    pub fn reset(&mut self, cache: &mut PmtuCache) {
        if let Some(remote) = self.remote.take() {
            cache.release(remote);
        }
    }
}

impl Drop for MtuRef {
    fn drop(&mut self) {
        debug_assert!(!self.is_setup(), "MtuRef dropped without reset");
    }
}

/// Per-destination path-MTU estimates.
#[derive(Debug)]
pub struct PmtuCache {
    entries: LinearMap<Ipv4Address, PmtuEntry, PMTU_CACHE_COUNT>,
}

impl PmtuCache {
    pub fn new() -> PmtuCache {
        PmtuCache {
            entries: LinearMap::new(),
        }
    }

    fn clamp_mtu(mtu: u16, iface_mtu: u16) -> u16 {
        mtu.min(iface_mtu).max(IPV4_MIN_MTU as u16)
    }

    fn acquire(&mut self, remote: Ipv4Address, iface_mtu: u16, now: Instant) -> Option<u16> {
        if let Some(entry) = self.entries.get_mut(&remote) {
            entry.refcount += 1;
            entry.iface_mtu = iface_mtu;
            entry.mtu = Self::clamp_mtu(entry.mtu, iface_mtu);
            return Some(entry.mtu);
        }

        if self.entries.len() == PMTU_CACHE_COUNT {
            // evict an unreferenced entry, preferring the most stale
            let victim = self
                .entries
                .iter()
                .filter(|(_, e)| e.refcount == 0)
                .min_by_key(|(_, e)| e.expires_at)
                .map(|(addr, _)| *addr)?;
            self.entries.remove(&victim);
        }

        let mtu = Self::clamp_mtu(iface_mtu, iface_mtu);
        let entry = PmtuEntry {
            mtu,
            iface_mtu,
            refcount: 1,
            expires_at: now + PMTU_RAISE_INTERVAL,
        };
        if self.entries.insert(remote, entry).is_err() {
            unreachable!("eviction left no room");
        }
        Some(mtu)
    }

    fn release(&mut self, remote: Ipv4Address) {
        let entry = self
            .entries
            .get_mut(&remote)
            .expect("released an unknown PMTU entry");
        debug_assert!(entry.refcount > 0);
        entry.refcount -= 1;
    }

    /// Current estimate for `remote`, if an entry exists.
    pub fn get(&self, remote: Ipv4Address) -> Option<u16> {
        self.entries.get(&remote).map(|e| e.mtu)
    }

    /// Apply an ICMP "fragmentation needed" report.
    ///
    /// `next_hop_mtu` of zero means the router did not report one; the
    /// estimate then drops to the next plateau below its current value.
    /// Returns the new estimate if it changed.
    pub fn handle_frag_needed(
        &mut self,
        remote: Ipv4Address,
        next_hop_mtu: u16,
        now: Instant,
    ) -> Option<u16> {
        let entry = self.entries.get_mut(&remote)?;
        let target = if next_hop_mtu == 0 {
            *MTU_PLATEAUS
                .iter()
                .find(|&&p| p < entry.mtu)
                .unwrap_or(&(IPV4_MIN_MTU as u16))
        } else {
            next_hop_mtu
        };
        let target = Self::clamp_mtu(target, entry.iface_mtu);
        // reports may only lower the estimate
        if target >= entry.mtu {
            return None;
        }
        entry.mtu = target;
        entry.expires_at = now + PMTU_RAISE_INTERVAL;
        net_debug!("pmtu: {} lowered to {}", remote, target);
        Some(target)
    }

    /// Earliest time at which [`age`] has work to do.
    ///
    /// [`age`]: #method.age
    pub fn poll_at(&self) -> Option<Instant> {
        self.entries.values().map(|e| e.expires_at).min()
    }

    /// Periodic maintenance: raise stale referenced estimates back toward
    /// the interface MTU and drop expired unreferenced entries. Returns
    /// the addresses whose estimate was raised through `raised`.
    pub fn age(&mut self, now: Instant, mut raised: impl FnMut(Ipv4Address, u16)) {
        let mut drop_addrs: heapless::Vec<Ipv4Address, PMTU_CACHE_COUNT> = heapless::Vec::new();
        for (addr, entry) in self.entries.iter_mut() {
            if entry.expires_at > now {
                continue;
            }
            if entry.refcount == 0 {
                let _ = drop_addrs.push(*addr);
                continue;
            }
            if entry.mtu < entry.iface_mtu {
                entry.mtu = entry.iface_mtu;
                raised(*addr, entry.mtu);
            }
            entry.expires_at = now + PMTU_UNUSED_TTL;
        }
        for addr in drop_addrs {
            self.entries.remove(&addr);
        }
    }
}

impl Default for PmtuCache {
    fn default() -> Self {
        PmtuCache::new()
    }
}

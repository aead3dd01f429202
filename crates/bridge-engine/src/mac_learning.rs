//! The MAC-learning table.
//!
//! Maps `(MAC, VLAN)` to the bridge port the address was last seen on.
//! Entries age out, are bounded by an LRU cap, and each carries a
//! revalidation tag so that cached forwarding decisions that consulted an
//! entry can be invalidated precisely when it changes or disappears.

use bridge_types::{MacAddress, Tag, TagSet, VlanSet};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Maximum number of learned entries.
pub const MAC_TABLE_CAPACITY: usize = 2048;

/// Default idle time before an entry ages out.
const DEFAULT_IDLE_TIME_MS: u64 = 60_000;

/// One learned address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacEntry {
    /// The learned source MAC.
    pub mac: MacAddress,
    /// Effective VLAN the address was seen on (0 = untagged).
    pub vlan: u16,
    /// Bridge port index the address was learned on.
    pub port_idx: usize,
    /// Revalidation tag for decisions that consulted this entry.
    pub tag: Tag,
    /// Wall-clock expiry, milliseconds.
    pub expires_ms: u64,
}

/// The learning table. LRU order doubles as expiry order because every
/// learn refreshes the expiry and moves the entry to the tail.
pub struct MacLearningTable {
    idle_time_ms: u64,
    entries: HashMap<(MacAddress, u16), MacEntry>,
    lru: VecDeque<(MacAddress, u16)>,
    flood_vlans: Option<VlanSet>,
    /// Tags of entries displaced by the LRU cap, reported on the next run.
    pending_evictions: Vec<Tag>,
}

impl MacLearningTable {
    /// Creates a table with the default 60 s idle time.
    pub fn new() -> Self {
        Self::with_idle_time(DEFAULT_IDLE_TIME_MS)
    }

    /// Creates a table with a specific idle time. The idle time is fixed
    /// for the life of the table, so aging is deterministic for a given
    /// configuration.
    pub fn with_idle_time(idle_time_ms: u64) -> Self {
        MacLearningTable {
            idle_time_ms,
            entries: HashMap::new(),
            lru: VecDeque::new(),
            flood_vlans: None,
            pending_evictions: Vec::new(),
        }
    }

    /// The configured idle time in milliseconds.
    pub fn idle_time_ms(&self) -> u64 {
        self.idle_time_ms
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing has been learned.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_flood_vlan(&self, vlan: u16) -> bool {
        self.flood_vlans
            .as_ref()
            .is_some_and(|set| set.contains(vlan))
    }

    fn touch_lru(&mut self, key: &(MacAddress, u16)) {
        if let Some(pos) = self.lru.iter().position(|k| k == key) {
            self.lru.remove(pos);
        }
        self.lru.push_back(*key);
    }

    /// Learns or refreshes `(mac, vlan) → port_idx`.
    ///
    /// Returns the *old* tag when the key previously mapped to a different
    /// port (a MAC move): the caller must revalidate cached flows that
    /// depended on the old mapping. Multicast sources and flood VLANs are
    /// never learned.
    pub fn learn(
        &mut self,
        mac: MacAddress,
        vlan: u16,
        port_idx: usize,
        now_ms: u64,
    ) -> Option<Tag> {
        if mac.is_multicast() || self.is_flood_vlan(vlan) {
            return None;
        }

        let key = (mac, vlan);
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.expires_ms = now_ms + self.idle_time_ms;
            let moved = if entry.port_idx != port_idx {
                let old_tag = entry.tag;
                entry.port_idx = port_idx;
                entry.tag = Tag::random();
                Some(old_tag)
            } else {
                None
            };
            self.touch_lru(&key);
            return moved;
        }

        if self.entries.len() >= MAC_TABLE_CAPACITY {
            if let Some(oldest) = self.lru.pop_front() {
                if let Some(evicted) = self.entries.remove(&oldest) {
                    self.pending_evictions.push(evicted.tag);
                }
            }
        }

        self.entries.insert(
            key,
            MacEntry {
                mac,
                vlan,
                port_idx,
                tag: Tag::random(),
                expires_ms: now_ms + self.idle_time_ms,
            },
        );
        self.lru.push_back(key);
        None
    }

    /// Looks up the port a MAC was learned on, without tag tracking.
    pub fn lookup(&self, mac: MacAddress, vlan: u16) -> Option<usize> {
        if self.is_flood_vlan(vlan) {
            return None;
        }
        self.entries.get(&(mac, vlan)).map(|e| e.port_idx)
    }

    /// Looks up the port a MAC was learned on, accumulating the entry's
    /// tag so the resulting flow can be revalidated when the entry goes.
    pub fn lookup_with_tag(&self, mac: MacAddress, vlan: u16, tags: &mut TagSet) -> Option<usize> {
        if self.is_flood_vlan(vlan) {
            return None;
        }
        self.entries.get(&(mac, vlan)).map(|e| {
            tags.insert(e.tag);
            e.port_idx
        })
    }

    /// Replaces the flood-VLAN set. Returns true if the set changed, in
    /// which case the caller should flush the bridge.
    pub fn set_flood_vlans(&mut self, vlans: Option<VlanSet>) -> bool {
        if self.flood_vlans == vlans {
            return false;
        }
        self.flood_vlans = vlans;
        true
    }

    /// Drops every entry.
    pub fn flush(&mut self) {
        self.entries.clear();
        self.lru.clear();
        self.pending_evictions.clear();
    }

    /// Ages out expired entries, reporting each evicted entry's tag (along
    /// with any tags displaced by the LRU cap since the last call).
    pub fn run(&mut self, now_ms: u64, report: &mut dyn FnMut(Tag)) {
        for tag in self.pending_evictions.drain(..) {
            report(tag);
        }
        while let Some(key) = self.lru.front().copied() {
            let expired = self
                .entries
                .get(&key)
                .map(|e| now_ms >= e.expires_ms)
                .unwrap_or(true);
            if !expired {
                break;
            }
            self.lru.pop_front();
            if let Some(entry) = self.entries.remove(&key) {
                debug!(mac = %entry.mac, vlan = entry.vlan, "expired learning entry");
                report(entry.tag);
            }
        }
    }

    /// The earliest expiry deadline, for the poll loop.
    pub fn next_expiry(&self) -> Option<u64> {
        self.lru
            .front()
            .and_then(|key| self.entries.get(key))
            .map(|e| e.expires_ms)
    }

    /// Iterates entries from least to most recently used.
    pub fn iter(&self) -> impl Iterator<Item = &MacEntry> + '_ {
        self.lru.iter().filter_map(move |key| self.entries.get(key))
    }
}

impl Default for MacLearningTable {
    fn default() -> Self {
        Self::new()
    }
}

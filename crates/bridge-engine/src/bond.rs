//! Bond (link aggregation) state machinery.
//!
//! A bonded port spreads load across its slaves by source-MAC hash and
//! survives carrier loss through debounced failover. Each slave moves
//! through four states:
//!
//! | state    | enabled | delay_expires |
//! |----------|---------|---------------|
//! | ENABLED  | true    | none          |
//! | FAILING  | true    | t + downdelay |
//! | DISABLED | false   | none          |
//! | RISING   | false   | t + updelay   |
//!
//! Hash buckets are sticky: a source MAC keeps its slave for as long as
//! that slave stays enabled. Rebalancing migrates buckets from hot slaves
//! to cold ones on a fixed cadence, decaying the byte counters so history
//! fades.

use crate::flow::{benign_learning_packet, DpAction, Flow, ETH_TYPE_GRATUITOUS_LEARN};
use crate::mac_learning::MacLearningTable;
use crate::netdev::NetdevProvider;
use crate::ofswitch::OfSwitch;
use crate::port::{Port, BOND_MASK};
use bridge_types::{MacAddress, Tag, TagSet, VlanId};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Milliseconds between rebalancing passes.
pub const REBALANCE_INTERVAL_MS: u64 = 10_000;

/// Hashes a source MAC into one of the 256 bond buckets (FNV-1a).
pub fn bond_hash(mac: &MacAddress) -> u8 {
    let mut h: u32 = 0x811c_9dc5;
    for &b in mac.as_bytes() {
        h ^= u32::from(b);
        h = h.wrapping_mul(0x0100_0193);
    }
    (h & u32::from(BOND_MASK)) as u8
}

/// Feeds a carrier observation into a slave's debounce state machine.
pub(crate) fn link_status_update(
    port: &mut Port,
    iface_idx: usize,
    carrier: bool,
    now_ms: u64,
    ml: &MacLearningTable,
    ofproto: &mut dyn OfSwitch,
) {
    let iface = &port.ifaces[iface_idx];
    // Steady state, or a transition in this direction already pending.
    if (carrier == iface.enabled) == iface.delay_expires.is_none() {
        return;
    }
    info!(
        iface = %iface.name,
        carrier = if carrier { "detected" } else { "dropped" },
        "bond slave carrier change"
    );
    if carrier == iface.enabled {
        // Carrier came back (or went away) before the pending transition
        // fired; cancel it.
        port.ifaces[iface_idx].delay_expires = None;
    } else if carrier && port.bond.as_ref().is_some_and(|b| b.active_iface.is_none()) {
        // No active slave at all: skip the updelay entirely.
        if port.updelay_ms > 0 {
            info!(
                iface = %port.ifaces[iface_idx].name,
                updelay_ms = port.updelay_ms,
                "skipping updelay, no other interface is up"
            );
        }
        enable_slave(port, iface_idx, true, false, ml, ofproto);
    } else {
        let delay = if carrier {
            port.updelay_ms
        } else {
            port.downdelay_ms
        };
        port.ifaces[iface_idx].delay_expires = Some(now_ms + delay);
        if delay > 0 {
            info!(
                iface = %port.ifaces[iface_idx].name,
                delay_ms = delay,
                pending = if carrier { "enable" } else { "disable" },
                "bond slave transition pending"
            );
        }
    }
}

/// Picks a usable slave: the first enabled one, else the pending slave
/// with the earliest deadline, promoted early. Returns `None` when no
/// slave can be used at all.
fn choose_iface(
    port: &mut Port,
    moving_active: bool,
    ml: &MacLearningTable,
    ofproto: &mut dyn OfSwitch,
) -> Option<usize> {
    let mut best_down: Option<usize> = None;
    let mut next_expiry = u64::MAX;
    for (i, iface) in port.ifaces.iter().enumerate() {
        if iface.enabled {
            return Some(i);
        }
        if let Some(expires) = iface.delay_expires {
            if expires < next_expiry {
                best_down = Some(i);
                next_expiry = expires;
            }
        }
    }

    if let Some(i) = best_down {
        info!(
            iface = %port.ifaces[i].name,
            "skipping remaining updelay, no other interface is up"
        );
        enable_slave(port, i, true, moving_active, ml, ofproto);
    }
    best_down
}

/// Re-elects the active slave and mints a fresh active tag.
pub(crate) fn choose_active_iface(
    port: &mut Port,
    moving_active: bool,
    ml: &MacLearningTable,
    ofproto: &mut dyn OfSwitch,
) {
    let chosen = choose_iface(port, moving_active, ml, ofproto);
    let port_name = port.name.clone();
    let iface_name = chosen.map(|i| port.ifaces[i].name.clone());
    if let Some(bond) = port.bond.as_mut() {
        bond.active_iface = chosen;
        bond.active_tag = Tag::random();
    }
    match iface_name {
        Some(name) => info!(port = %port_name, active = %name, "active interface changed"),
        None => warn!(port = %port_name, "all slaves disabled, no active interface"),
    }
}

/// Enables or disables a slave, with all the consequences: tag
/// revalidation, active-slave re-election, and gratuitous learning.
///
/// `moving_active` suppresses the redundant re-election on the enable
/// path when disabling one slave is what promoted this one.
pub(crate) fn enable_slave(
    port: &mut Port,
    iface_idx: usize,
    enable: bool,
    moving_active: bool,
    ml: &MacLearningTable,
    ofproto: &mut dyn OfSwitch,
) {
    port.ifaces[iface_idx].delay_expires = None;
    if enable == port.ifaces[iface_idx].enabled {
        return;
    }

    port.ifaces[iface_idx].enabled = enable;
    if !enable {
        warn!(iface = %port.ifaces[iface_idx].name, "interface disabled");
        ofproto.revalidate(port.ifaces[iface_idx].tag);
        let was_active = port
            .bond
            .as_ref()
            .is_some_and(|b| b.active_iface == Some(iface_idx));
        if was_active {
            ofproto.revalidate(port.bond.as_ref().unwrap().active_tag);
            // Disabling the active slave may immediately enable another
            // that was waiting on an updelay; the flag keeps the newly
            // enabled slave from redoing the election we are in.
            choose_active_iface(port, true, ml, ofproto);
        }
        send_learning_packets(port, ml, ofproto);
    } else {
        warn!(iface = %port.ifaces[iface_idx].name, "interface enabled");
        let no_active = port.bond.as_ref().is_some_and(|b| b.active_iface.is_none());
        if no_active && !moving_active {
            ofproto.revalidate(port.bond.as_ref().unwrap().no_ifaces_tag);
            choose_active_iface(port, moving_active, ml, ofproto);
            send_learning_packets(port, ml, ofproto);
        }
        port.ifaces[iface_idx].tag = Tag::random();
    }

    if let Some(bond) = port.bond.as_mut() {
        bond.compat_stale = true;
    }
}

/// Selects the egress interface of a port for a given source MAC,
/// accumulating every tag the choice depended on. Returns the datapath
/// port number, or `None` when the port has no usable interface (in which
/// case the bond's `no_ifaces_tag` is accumulated instead).
pub(crate) fn choose_output_iface(
    port: &mut Port,
    dl_src: &MacAddress,
    tags: &mut TagSet,
    ml: &MacLearningTable,
    ofproto: &mut dyn OfSwitch,
) -> Option<u16> {
    debug_assert!(!port.ifaces.is_empty());
    let iface_idx = if port.ifaces.len() == 1 || port.bond.is_none() {
        0
    } else {
        let h = bond_hash(dl_src) as usize;
        let needs_reassign = {
            let bond = port.bond.as_ref().unwrap();
            match bond.hash[h].iface {
                Some(i) => i >= port.ifaces.len() || !port.ifaces[i].enabled,
                None => true,
            }
        };
        if needs_reassign {
            let chosen = choose_iface(port, false, ml, ofproto);
            let bond = port.bond.as_mut().unwrap();
            match chosen {
                Some(i) => {
                    bond.hash[h].iface = Some(i);
                    bond.hash[h].tag = Tag::random();
                    bond.compat_stale = true;
                }
                None => {
                    tags.insert(bond.no_ifaces_tag);
                    return None;
                }
            }
        }
        let bond = port.bond.as_ref().unwrap();
        tags.insert(bond.hash[h].tag);
        bond.hash[h].iface.unwrap()
    };

    let iface = &port.ifaces[iface_idx];
    tags.insert(iface.tag);
    iface.dp_ifidx
}

/// Flips slaves whose pending transition deadline has passed.
pub(crate) fn run_delays(
    port: &mut Port,
    now_ms: u64,
    ml: &MacLearningTable,
    ofproto: &mut dyn OfSwitch,
) {
    if port.ifaces.len() < 2 {
        return;
    }
    for j in 0..port.ifaces.len() {
        if let Some(expires) = port.ifaces[j].delay_expires {
            if now_ms >= expires {
                let enable = !port.ifaces[j].enabled;
                enable_slave(port, j, enable, false, ml, ofproto);
            }
        }
    }
}

/// The earliest pending slave transition on a bonded port.
pub(crate) fn next_delay_expiry(port: &Port) -> Option<u64> {
    if port.ifaces.len() < 2 {
        return None;
    }
    port.ifaces.iter().filter_map(|i| i.delay_expires).min()
}

/// Sends one benign learning frame per `ML` entry not learned on this
/// port, so upstream switches move those MACs to the new egress after an
/// active-slave change.
pub(crate) fn send_learning_packets(
    port: &mut Port,
    ml: &MacLearningTable,
    ofproto: &mut dyn OfSwitch,
) {
    if port.ifaces.is_empty() || port.bond.as_ref().map_or(true, |b| b.active_iface.is_none()) {
        return;
    }

    let entries: Vec<(MacAddress, u16, usize)> =
        ml.iter().map(|e| (e.mac, e.vlan, e.port_idx)).collect();

    let mut n_packets = 0u32;
    let mut n_errors = 0u32;
    for (mac, vlan, entry_port) in entries {
        if entry_port == port.port_idx {
            continue;
        }
        let mut tags = TagSet::new();
        let Some(dp_ifidx) = choose_output_iface(port, &mac, &mut tags, ml, ofproto) else {
            continue;
        };

        let mut actions = Vec::with_capacity(2);
        if vlan != 0 {
            if let Ok(vid) = VlanId::new(vlan) {
                actions.push(DpAction::SetVlanVid(vid));
            }
        }
        actions.push(DpAction::Output(dp_ifidx));

        let packet = benign_learning_packet(mac);
        let flow = Flow {
            dl_src: mac,
            dl_dst: MacAddress::BROADCAST,
            dl_type: ETH_TYPE_GRATUITOUS_LEARN,
            ..Flow::default()
        };
        n_packets += 1;
        if ofproto.send_packet(&flow, &actions, &packet).is_err() {
            n_errors += 1;
        }
    }

    if n_errors > 0 {
        warn!(
            bond = %port.name,
            errors = n_errors,
            packets = n_packets,
            "errors sending gratuitous learning packets"
        );
    } else {
        debug!(bond = %port.name, packets = n_packets, "sent gratuitous learning packets");
    }
}

/// Per-slave view used by one rebalancing pass.
struct SlaveBalance {
    iface_idx: usize,
    enabled: bool,
    tx_bytes: u64,
    /// Buckets assigned to this slave, ascending by tx_bytes.
    hashes: Vec<usize>,
}

/// Restores sorted order (descending tx_bytes) after position `p` changed.
fn resort(bals: &mut [SlaveBalance], mut p: usize) {
    while p > 0 && bals[p].tx_bytes > bals[p - 1].tx_bytes {
        bals.swap(p, p - 1);
        p -= 1;
    }
    while p + 1 < bals.len() && bals[p].tx_bytes < bals[p + 1].tx_bytes {
        bals.swap(p, p + 1);
        p += 1;
    }
}

/// One rebalancing pass: migrate buckets from the most-loaded slave to
/// the least-loaded one while the imbalance is worth fixing, then decay
/// every bucket's byte count by half.
pub(crate) fn rebalance_port(port: &mut Port, ofproto: &mut dyn OfSwitch) {
    let port_name = port.name.clone();
    let Port { ifaces, bond, .. } = port;
    let Some(bond) = bond.as_mut() else {
        return;
    };
    let n = ifaces.len();

    let mut bals: Vec<SlaveBalance> = (0..n)
        .map(|i| SlaveBalance {
            iface_idx: i,
            enabled: ifaces[i].enabled,
            tx_bytes: 0,
            hashes: Vec::new(),
        })
        .collect();

    // Group buckets by slave, ascending tx within a slave, so that we
    // prefer shifting small buckets first.
    let mut order: Vec<usize> = (0..bond.hash.len()).collect();
    order.sort_by_key(|&h| (bond.hash[h].iface, bond.hash[h].tx_bytes));
    for h in order {
        if let Some(i) = bond.hash[h].iface {
            if i < n {
                bals[i].tx_bytes += bond.hash[h].tx_bytes;
                bals[i].hashes.push(h);
            }
        }
    }

    // Enabled slaves first, then descending load.
    bals.sort_by(|a, b| {
        b.enabled
            .cmp(&a.enabled)
            .then(b.tx_bytes.cmp(&a.tx_bytes))
    });
    while bals.last().is_some_and(|b| !b.enabled) {
        bals.pop();
    }
    if bals.is_empty() {
        return;
    }

    let to = bals.len() - 1;
    let mut from = 0;
    while from < to {
        let overload = bals[from].tx_bytes - bals[to].tx_bytes;
        if overload < bals[to].tx_bytes >> 5 || overload < 100_000 {
            // Under ~3% or under ~1 Mbps of imbalance: not worth moving.
            break;
        }
        if bals[from].hashes.len() == 1 {
            // A single bucket cannot be split.
            from += 1;
            continue;
        }

        // Pick the first bucket whose migration improves the load ratio
        // by more than 0.1.
        let mut chosen: Option<(usize, bool)> = None;
        for (pos, &h) in bals[from].hashes.iter().enumerate() {
            let delta = bond.hash[h].tx_bytes;
            if delta == 0 || bals[from].tx_bytes - delta == 0 {
                continue;
            }
            let order_swapped = bals[from].tx_bytes - delta < bals[to].tx_bytes + delta;
            if bals[to].tx_bytes == 0 {
                chosen = Some((pos, order_swapped));
                break;
            }
            let old_ratio = bals[from].tx_bytes as f64 / bals[to].tx_bytes as f64;
            let mut new_ratio =
                (bals[from].tx_bytes - delta) as f64 / (bals[to].tx_bytes + delta) as f64;
            if new_ratio == 0.0 {
                continue;
            }
            if new_ratio < 1.0 {
                new_ratio = 1.0 / new_ratio;
            }
            if old_ratio - new_ratio > 0.1 {
                chosen = Some((pos, order_swapped));
                break;
            }
        }

        match chosen {
            Some((pos, order_swapped)) => {
                let h = bals[from].hashes.remove(pos);
                let delta = bond.hash[h].tx_bytes;
                info!(
                    bond = %port_name,
                    hash = h,
                    kb = delta / 1024,
                    from = %ifaces[bals[from].iface_idx].name,
                    to = %ifaces[bals[to].iface_idx].name,
                    "shifting bond load"
                );
                bals[from].tx_bytes -= delta;
                bals[to].tx_bytes += delta;
                ofproto.revalidate(bond.hash[h].tag);
                bond.hash[h].iface = Some(bals[to].iface_idx);
                bond.hash[h].tag = Tag::random();
                bond.compat_stale = true;
                // The bucket is deliberately not added to the target's
                // list: migrating it twice in one pass is pointless.
                if order_swapped {
                    bals.swap(from, to);
                }
                resort(&mut bals, from);
                resort(&mut bals, to);
            }
            None => from += 1,
        }
    }

    // Exponentially weighted moving average: a weight of 1/2 decays
    // history to under 1% in 7 passes.
    for entry in bond.hash.iter_mut() {
        entry.tx_bytes /= 2;
    }
}

/// Recomputes the bond's externally visible link status and, for
/// fake-interface bonds, flips the internal device's UP flag.
pub(crate) fn refresh_status(port: &mut Port, net: &mut dyn NetdevProvider) {
    if port.ifaces.len() < 2 {
        return;
    }
    // A slave counts as up only when enabled with no pending transition.
    let bond_up = port
        .ifaces
        .iter()
        .any(|i| i.enabled && i.delay_expires.is_none());
    if port.fake_iface {
        if let Ok(mut nd) = net.open(&port.name, "", &HashMap::new(), false, true) {
            let _ = nd.set_up(bond_up);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InterfaceConfig;
    use crate::port::{Bond, Iface};
    use crate::sim::Sim;

    fn mac(last: u8) -> MacAddress {
        MacAddress::new([0x00, 0x11, 0x22, 0x33, 0x44, last])
    }

    fn bonded_port(names: &[&str]) -> Port {
        let mut p = Port::new(3, "bond0");
        for (j, name) in names.iter().enumerate() {
            let mut iface = Iface::new(j, InterfaceConfig::named(*name));
            iface.enabled = true;
            iface.dp_ifidx = Some(10 + j as u16);
            p.ifaces.push(iface);
        }
        p.bond = Some(Bond::new());
        p.downdelay_ms = 200;
        p.updelay_ms = 100;
        p
    }

    fn setup() -> (Sim, Box<dyn OfSwitch>, MacLearningTable, Port) {
        let sim = Sim::new();
        let mut sw = sim.make_switch("br0");
        let ml = MacLearningTable::new();
        let mut port = bonded_port(&["eth3a", "eth3b"]);
        choose_active_iface(&mut port, false, &ml, sw.as_mut());
        (sim, sw, ml, port)
    }

    #[test]
    fn test_bond_hash_is_deterministic() {
        let a = bond_hash(&mac(1));
        assert_eq!(a, bond_hash(&mac(1)));
        // Not a collapse to a single bucket.
        let distinct: std::collections::HashSet<u8> =
            (0..=255u8).map(|i| bond_hash(&mac(i))).collect();
        assert!(distinct.len() > 64);
    }

    #[test]
    fn test_failover_respects_downdelay() {
        let (sim, mut sw, ml, mut port) = setup();
        assert_eq!(port.bond.as_ref().unwrap().active_iface, Some(0));

        // Carrier lost at t=0: FAILING, still enabled.
        link_status_update(&mut port, 0, false, 0, &ml, sw.as_mut());
        assert!(port.ifaces[0].enabled);
        assert_eq!(port.ifaces[0].delay_expires, Some(200));

        // Not before the deadline.
        run_delays(&mut port, 100, &ml, sw.as_mut());
        assert!(port.ifaces[0].enabled);

        // At/after the deadline: disabled, active moves to the other slave.
        run_delays(&mut port, 250, &ml, sw.as_mut());
        assert!(!port.ifaces[0].enabled);
        assert_eq!(port.ifaces[0].delay_expires, None);
        assert_eq!(port.bond.as_ref().unwrap().active_iface, Some(1));
        assert!(!sim.revalidations("br0").is_empty());
    }

    #[test]
    fn test_carrier_regained_cancels_pending_disable() {
        let (_sim, mut sw, ml, mut port) = setup();
        link_status_update(&mut port, 0, false, 0, &ml, sw.as_mut());
        assert_eq!(port.ifaces[0].delay_expires, Some(200));
        link_status_update(&mut port, 0, true, 100, &ml, sw.as_mut());
        assert_eq!(port.ifaces[0].delay_expires, None);
        assert!(port.ifaces[0].enabled);
        // Deadline passing now changes nothing.
        run_delays(&mut port, 300, &ml, sw.as_mut());
        assert!(port.ifaces[0].enabled);
    }

    #[test]
    fn test_short_circuit_promotion_of_rising_slave() {
        let (_sim, mut sw, ml, mut port) = setup();
        port.updelay_ms = 10_000;

        // eth3b goes down and comes back: RISING with a long updelay.
        link_status_update(&mut port, 1, false, 0, &ml, sw.as_mut());
        run_delays(&mut port, 200, &ml, sw.as_mut());
        assert!(!port.ifaces[1].enabled);
        link_status_update(&mut port, 1, true, 300, &ml, sw.as_mut());
        assert_eq!(port.ifaces[1].delay_expires, Some(10_300));

        // eth3a (active) is disabled: eth3b must be promoted immediately,
        // skipping the rest of its updelay.
        enable_slave(&mut port, 0, false, false, &ml, sw.as_mut());
        assert!(port.ifaces[1].enabled);
        assert_eq!(port.ifaces[1].delay_expires, None);
        assert_eq!(port.bond.as_ref().unwrap().active_iface, Some(1));
    }

    #[test]
    fn test_slave_coming_up_with_no_active_skips_updelay() {
        let (_sim, mut sw, ml, mut port) = setup();
        enable_slave(&mut port, 0, false, false, &ml, sw.as_mut());
        enable_slave(&mut port, 1, false, false, &ml, sw.as_mut());
        assert_eq!(port.bond.as_ref().unwrap().active_iface, None);

        link_status_update(&mut port, 0, true, 1000, &ml, sw.as_mut());
        assert!(port.ifaces[0].enabled);
        assert_eq!(port.bond.as_ref().unwrap().active_iface, Some(0));
    }

    #[test]
    fn test_hash_stickiness() {
        let (_sim, mut sw, ml, mut port) = setup();
        let src = mac(7);
        let mut tags = TagSet::new();
        let first = choose_output_iface(&mut port, &src, &mut tags, &ml, sw.as_mut()).unwrap();
        for _ in 0..10 {
            let mut tags = TagSet::new();
            let again = choose_output_iface(&mut port, &src, &mut tags, &ml, sw.as_mut());
            assert_eq!(again, Some(first));
        }
    }

    #[test]
    fn test_hash_reassigned_when_slave_disabled() {
        let (_sim, mut sw, ml, mut port) = setup();
        let src = mac(7);
        let mut tags = TagSet::new();
        let first = choose_output_iface(&mut port, &src, &mut tags, &ml, sw.as_mut()).unwrap();
        let first_slave = port.ifaces.iter().position(|i| i.dp_ifidx == Some(first)).unwrap();

        enable_slave(&mut port, first_slave, false, false, &ml, sw.as_mut());
        let mut tags = TagSet::new();
        let second = choose_output_iface(&mut port, &src, &mut tags, &ml, sw.as_mut()).unwrap();
        assert_ne!(second, first);
    }

    #[test]
    fn test_no_usable_slave_accumulates_no_ifaces_tag() {
        let (_sim, mut sw, ml, mut port) = setup();
        enable_slave(&mut port, 0, false, false, &ml, sw.as_mut());
        enable_slave(&mut port, 1, false, false, &ml, sw.as_mut());

        let mut tags = TagSet::new();
        let out = choose_output_iface(&mut port, &mac(7), &mut tags, &ml, sw.as_mut());
        assert_eq!(out, None);
        assert!(tags.intersects(port.bond.as_ref().unwrap().no_ifaces_tag));
    }

    #[test]
    fn test_gratuitous_learning_on_failover() {
        let (sim, mut sw, mut ml, mut port) = setup();
        // Two MACs elsewhere, one on the bond itself.
        ml.learn(mac(1), 10, 0, 0);
        ml.learn(mac(2), 0, 1, 0);
        ml.learn(mac(3), 10, port.port_idx, 0);

        sim.clear_sent_packets("br0");
        enable_slave(&mut port, 0, false, false, &ml, sw.as_mut());

        let sent = sim.sent_packets("br0");
        assert_eq!(sent.len(), 2);
        for pkt in &sent {
            assert_eq!(pkt.flow.dl_type, ETH_TYPE_GRATUITOUS_LEARN);
            assert_eq!(
                u16::from_be_bytes([pkt.packet[12], pkt.packet[13]]),
                ETH_TYPE_GRATUITOUS_LEARN
            );
            assert!(matches!(pkt.actions.last(), Some(DpAction::Output(_))));
        }
        // The VLAN 10 entry carries a set-VLAN action, the VLAN 0 one not.
        assert!(sent.iter().any(|p| p
            .actions
            .contains(&DpAction::SetVlanVid(VlanId::new(10).unwrap()))));
        assert!(sent
            .iter()
            .any(|p| p.actions.len() == 1));
        // The bond's own MAC was excluded.
        assert!(sent.iter().all(|p| p.flow.dl_src != mac(3)));
    }

    #[test]
    fn test_rebalance_moves_load_toward_cold_slave() {
        let (_sim, mut sw, _ml, mut port) = setup();
        {
            let bond = port.bond.as_mut().unwrap();
            bond.hash[1].iface = Some(0);
            bond.hash[1].tx_bytes = 500_000;
            bond.hash[2].iface = Some(0);
            bond.hash[2].tx_bytes = 600_000;
        }

        rebalance_port(&mut port, sw.as_mut());

        let bond = port.bond.as_ref().unwrap();
        // The smaller bucket migrated to the idle slave.
        assert_eq!(bond.hash[1].iface, Some(1));
        assert_eq!(bond.hash[2].iface, Some(0));
        // And the EWMA decay halved both counters.
        assert_eq!(bond.hash[1].tx_bytes, 250_000);
        assert_eq!(bond.hash[2].tx_bytes, 300_000);
    }

    #[test]
    fn test_rebalance_leaves_small_imbalance_alone() {
        let (sim, mut sw, _ml, mut port) = setup();
        {
            let bond = port.bond.as_mut().unwrap();
            bond.hash[1].iface = Some(0);
            bond.hash[1].tx_bytes = 30_000;
            bond.hash[2].iface = Some(1);
            bond.hash[2].tx_bytes = 10_000;
        }
        sim.clear_revalidations("br0");
        rebalance_port(&mut port, sw.as_mut());

        let bond = port.bond.as_ref().unwrap();
        assert_eq!(bond.hash[1].iface, Some(0));
        assert_eq!(bond.hash[2].iface, Some(1));
        assert!(sim.revalidations("br0").is_empty());
    }

    #[test]
    fn test_ewma_decays_below_one_percent_in_seven_runs() {
        let (_sim, mut sw, _ml, mut port) = setup();
        {
            let bond = port.bond.as_mut().unwrap();
            // Balanced load: no migrations, decay only.
            bond.hash[1].iface = Some(0);
            bond.hash[1].tx_bytes = 1_000_000;
            bond.hash[2].iface = Some(1);
            bond.hash[2].tx_bytes = 1_000_000;
        }
        for _ in 0..7 {
            rebalance_port(&mut port, sw.as_mut());
        }
        let bond = port.bond.as_ref().unwrap();
        assert!(bond.hash[1].tx_bytes < 10_000);
        assert!(bond.hash[2].tx_bytes < 10_000);
    }

    #[test]
    fn test_rebalance_skips_when_all_disabled() {
        let (_sim, mut sw, ml, mut port) = setup();
        enable_slave(&mut port, 0, false, false, &ml, sw.as_mut());
        enable_slave(&mut port, 1, false, false, &ml, sw.as_mut());
        {
            let bond = port.bond.as_mut().unwrap();
            bond.hash[1].iface = Some(0);
            bond.hash[1].tx_bytes = 1_000_000;
        }
        rebalance_port(&mut port, sw.as_mut());
        // Early return skips even the decay.
        assert_eq!(port.bond.as_ref().unwrap().hash[1].tx_bytes, 1_000_000);
    }

    #[test]
    fn test_next_delay_expiry() {
        let (_sim, mut sw, ml, mut port) = setup();
        assert_eq!(next_delay_expiry(&port), None);
        link_status_update(&mut port, 0, false, 0, &ml, sw.as_mut());
        assert_eq!(next_delay_expiry(&port), Some(200));
    }
}

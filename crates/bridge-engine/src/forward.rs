//! The forwarding decision pipeline.
//!
//! Given a parsed flow and its ingress datapath port, decide the ordered
//! set of (datapath port, VLAN) destinations, learn the source MAC, apply
//! mirroring, and emit the action list. This is the hot path: it runs for
//! every flow-setup request and must be side-effect-precise, so every
//! mutable object it consults contributes a revalidation tag.

use crate::bond;
use crate::bridge::Bridge;
use crate::flow::{DpAction, Flow, NF_OUT_DROP, NF_OUT_FLOOD};
use crate::mac_learning::MacLearningTable;
use crate::mirror::MirrorOutput;
use crate::ofswitch::OfSwitch;
use crate::port::Port;
use bridge_types::{TagSet, VlanId};
use tracing::{debug, warn};

/// One forwarding destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Dst {
    /// VLAN the frame must carry on this leg; `None` = untagged.
    pub vlan: Option<VlanId>,
    /// Egress datapath port.
    pub dp_ifidx: u16,
}

/// Resolved egress of the pipeline before mirror expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Egress {
    Drop,
    Flood,
    Port(usize),
}

/// Determines the effective VLAN of a frame on its ingress port: the
/// access VLAN for untagged frames on access ports, the (normalised) tag
/// on trunks. `None` means the frame is invalid here and must be dropped.
fn flow_get_vlan(
    br: &mut Bridge,
    flow: &Flow,
    in_port_idx: usize,
    have_packet: bool,
    now_ms: u64,
) -> Option<u16> {
    // A missing 802.1Q header and a header with VID 0 both mean VLAN 0.
    let tag = flow.dl_vlan.map(|v| v.as_u16()).unwrap_or(0);
    let access = br.ports[in_port_idx].access_vlan();
    match access {
        Some(access_vlan) => {
            if tag != 0 {
                // No VLAN-in-VLAN: a tagged frame on an access port is
                // invalid.
                if have_packet && br.fwd_rl.allow(now_ms) {
                    warn!(
                        bridge = %br.name,
                        port = %br.ports[in_port_idx].name,
                        vlan = tag,
                        implicit = access_vlan,
                        "dropping tagged packet received on access port"
                    );
                }
                None
            } else {
                Some(access_vlan)
            }
        }
        None => {
            if !br.ports[in_port_idx].includes_vlan(tag) {
                if have_packet && br.fwd_rl.allow(now_ms) {
                    warn!(
                        bridge = %br.name,
                        port = %br.ports[in_port_idx].name,
                        vlan = tag,
                        "dropping packet on port not trunking its VLAN"
                    );
                }
                None
            } else {
                Some(tag)
            }
        }
    }
}

/// Learns the flow's source MAC, revalidating displaced decisions on a
/// MAC move.
fn update_learning_table(br: &mut Bridge, flow: &Flow, vlan: u16, in_port_idx: usize, now_ms: u64) {
    let Bridge {
        ml, ofproto, name, ..
    } = br;
    if let Some(rev_tag) = ml.learn(flow.dl_src, vlan, in_port_idx, now_ms) {
        debug!(
            bridge = %name,
            mac = %flow.dl_src,
            port_idx = in_port_idx,
            vlan,
            "source MAC moved; revalidating"
        );
        ofproto.revalidate(rev_tag);
    }
}

/// Computes the destination for one egress port: the VLAN the frame must
/// carry there, and the concrete interface chosen by the bond hash.
fn set_dst(
    flow: &Flow,
    ingress_access_vlan: Option<u16>,
    out_port: &mut Port,
    tags: &mut TagSet,
    ml: &MacLearningTable,
    ofproto: &mut dyn OfSwitch,
) -> Option<Dst> {
    let vlan = if out_port.access_vlan().is_some() {
        None
    } else if let Some(v) = ingress_access_vlan {
        Some(VlanId::new(v).expect("access VLANs are always in range"))
    } else {
        flow.dl_vlan
    };
    let dp_ifidx = bond::choose_output_iface(out_port, &flow.dl_src, tags, ml, ofproto)?;
    Some(Dst { vlan, dp_ifidx })
}

fn dst_is_duplicate(dsts: &[Dst], test: &Dst) -> bool {
    dsts.iter().any(|d| d == test)
}

/// Moves destinations whose VLAN equals the frame's current tag to the
/// front, minimising VLAN set/strip actions on the action stream.
fn partition_dsts(dsts: &mut [Dst], vlan: Option<VlanId>) {
    dsts.sort_by_key(|d| d.vlan != vlan);
}

/// Expands the resolved egress into the final destination list: flood
/// fan-out, then mirrors in ascending index order (SPAN outputs deduped,
/// RSPAN re-tagged, nothing sent back to the ingress port on the frame's
/// original VLAN).
fn compose_dsts(
    br: &mut Bridge,
    flow: &Flow,
    vlan: Option<u16>,
    in_port_idx: usize,
    egress: Egress,
    tags: &mut TagSet,
    nf_output_iface: &mut u16,
) -> Vec<Dst> {
    let Bridge {
        ports,
        mirrors,
        ml,
        ofproto,
        ..
    } = br;

    let ingress_access_vlan = ports[in_port_idx].access_vlan();
    let mut mirror_mask = ports[in_port_idx].src_mirrors;
    let mut dsts: Vec<Dst> = Vec::new();

    match egress {
        Egress::Flood => {
            let v = vlan.expect("flooding requires a valid effective VLAN");
            for i in 0..ports.len() {
                if i == in_port_idx
                    || !ports[i].includes_vlan(v)
                    || ports[i].is_mirror_output_port
                {
                    continue;
                }
                if let Some(d) = set_dst(
                    flow,
                    ingress_access_vlan,
                    &mut ports[i],
                    tags,
                    ml,
                    ofproto.as_mut(),
                ) {
                    mirror_mask |= ports[i].dst_mirrors;
                    dsts.push(d);
                }
            }
            *nf_output_iface = NF_OUT_FLOOD;
        }
        Egress::Port(out_idx) => {
            if let Some(d) = set_dst(
                flow,
                ingress_access_vlan,
                &mut ports[out_idx],
                tags,
                ml,
                ofproto.as_mut(),
            ) {
                *nf_output_iface = d.dp_ifidx;
                mirror_mask |= ports[out_idx].dst_mirrors;
                dsts.push(d);
            }
        }
        Egress::Drop => {}
    }

    let mut mask = mirror_mask;
    while mask != 0 {
        let idx = mask.trailing_zeros() as usize;
        mask &= mask - 1;
        let Some(m) = mirrors.get(idx) else { continue };
        if !m.vlans.is_empty() && !m.vlan_is_mirrored(vlan) {
            continue;
        }
        match m.out {
            MirrorOutput::Port(out_idx) => {
                if let Some(d) = set_dst(
                    flow,
                    ingress_access_vlan,
                    &mut ports[out_idx],
                    tags,
                    ml,
                    ofproto.as_mut(),
                ) {
                    if !dst_is_duplicate(&dsts, &d) {
                        dsts.push(d);
                    }
                }
            }
            MirrorOutput::Vlan(out_vlan) => {
                for i in 0..ports.len() {
                    if !ports[i].includes_vlan(out_vlan.as_u16()) {
                        continue;
                    }
                    let Some(mut d) = set_dst(
                        flow,
                        ingress_access_vlan,
                        &mut ports[i],
                        tags,
                        ml,
                        ofproto.as_mut(),
                    ) else {
                        continue;
                    };
                    if ports[i].access_vlan().is_none() {
                        d.vlan = Some(out_vlan);
                    }
                    if dst_is_duplicate(&dsts, &d) {
                        continue;
                    }
                    // Compare against the tag the frame actually carried,
                    // before any implicit access-VLAN tagging: VID 0 and
                    // no header are the same thing here.
                    let flow_vlan = match flow.dl_vlan {
                        Some(v) if v.as_u16() == 0 => None,
                        other => other,
                    };
                    if i == in_port_idx && d.vlan == flow_vlan {
                        // Never reflect a frame out its ingress port on
                        // the VLAN it arrived on.
                        continue;
                    }
                    dsts.push(d);
                }
            }
        }
    }

    partition_dsts(&mut dsts, flow.dl_vlan);
    dsts
}

/// Turns the destination list into the action stream.
fn compose_actions(
    br: &mut Bridge,
    flow: &Flow,
    vlan: Option<u16>,
    in_port_idx: usize,
    egress: Egress,
    tags: &mut TagSet,
    actions: &mut Vec<DpAction>,
    nf_output_iface: &mut u16,
) {
    let dsts = compose_dsts(br, flow, vlan, in_port_idx, egress, tags, nf_output_iface);
    let mut cur_vlan = flow.dl_vlan;
    for d in &dsts {
        if d.vlan != cur_vlan {
            match d.vlan {
                None => actions.push(DpAction::StripVlan),
                Some(v) => actions.push(DpAction::SetVlanVid(v)),
            }
            cur_vlan = d.vlan;
        }
        actions.push(DpAction::Output(d.dp_ifidx));
    }
}

/// The full pipeline. Returns true if the composed actions may be
/// installed for any packet in this flow; false if the flow must not be
/// installed (unicast revalidation miss).
pub(crate) fn process_flow(
    br: &mut Bridge,
    flow: &Flow,
    packet: Option<&[u8]>,
    tags: &mut TagSet,
    actions: &mut Vec<DpAction>,
    nf_output_iface: &mut u16,
    now_ms: u64,
) -> bool {
    *nf_output_iface = NF_OUT_DROP;

    // Resolve the ingress interface and port.
    let Some((in_port_idx, in_iface_idx)) = br.iface_from_dp_ifidx(flow.in_port) else {
        if packet.is_some() && br.fwd_rl.allow(now_ms) {
            warn!(
                bridge = %br.name,
                dp_ifidx = flow.in_port,
                "received packet on unknown interface"
            );
        }
        // No actions: drop packets on this flow.
        return true;
    };

    let vlan = flow_get_vlan(br, flow, in_port_idx, packet.is_some(), now_ms);
    let mut egress = Egress::Drop;

    'pipeline: {
        let Some(effective_vlan) = vlan else {
            break 'pipeline;
        };

        // Frames for the 802.1D link-local block are never forwarded.
        if flow.dl_dst.is_reserved() {
            break 'pipeline;
        }

        // Mirror output ports carry mirrored traffic exclusively.
        if br.ports[in_port_idx].is_mirror_output_port {
            if br.fwd_rl.allow(now_ms) {
                warn!(
                    bridge = %br.name,
                    port = %br.ports[in_port_idx].name,
                    "dropping packet received on mirror output port"
                );
            }
            break 'pipeline;
        }

        // Bonded ingress needs care to avoid duplicates: the peer sends
        // every broadcast down one link only, and unicast we already know
        // from another port is probably our own frame reflected.
        if br.ports[in_port_idx].is_bonded() {
            if flow.dl_dst.is_multicast() {
                if let Some(b) = br.ports[in_port_idx].bond.as_ref() {
                    tags.insert(b.active_tag);
                    if b.active_iface != Some(in_iface_idx) {
                        break 'pipeline;
                    }
                }
            }
            if let Some(src_idx) = br.ml.lookup(flow.dl_src, effective_vlan) {
                if src_idx != in_port_idx && !flow.is_broadcast_arp_reply() {
                    break 'pipeline;
                }
            }
        }

        egress = Egress::Flood;

        // Learn the source MAC, but never from revalidation.
        if packet.is_some() {
            update_learning_table(br, flow, effective_vlan, in_port_idx, now_ms);
        }

        match br.ml.lookup_with_tag(flow.dl_dst, effective_vlan, tags) {
            Some(out_idx) if out_idx < br.ports.len() => egress = Egress::Port(out_idx),
            Some(_) => {}
            None => {
                if packet.is_none() && !flow.dl_dst.is_multicast() {
                    // Revalidating without a learning entry: refuse to
                    // install a flood flow that could blackhole or loop
                    // frames until the table catches up.
                    return false;
                }
            }
        }

        // Hairpin suppression.
        if egress == Egress::Port(in_port_idx) {
            egress = Egress::Drop;
        }
    }

    compose_actions(
        br,
        flow,
        vlan,
        in_port_idx,
        egress,
        tags,
        actions,
        nf_output_iface,
    );
    true
}

/// Folds datapath byte counts back into the learning table and the bond
/// hash counters.
pub(crate) fn account_flow(
    br: &mut Bridge,
    flow: &Flow,
    actions: &[DpAction],
    n_bytes: u64,
    now_ms: u64,
) {
    // Keep the learning table warm for traffic that never leaves the
    // datapath's flow cache.
    if let Some((in_port_idx, _)) = br.iface_from_dp_ifidx(flow.in_port) {
        if let Some(vlan) = flow_get_vlan(br, flow, in_port_idx, false, now_ms) {
            update_learning_table(br, flow, vlan, in_port_idx, now_ms);
        }
    }

    if !br.has_bonded_ports {
        return;
    }
    for action in actions {
        let DpAction::Output(dp_ifidx) = action else {
            continue;
        };
        let Some((port_idx, _)) = br.iface_from_dp_ifidx(*dp_ifidx) else {
            continue;
        };
        let port = &mut br.ports[port_idx];
        if port.ifaces.len() >= 2 {
            if let Some(bond) = port.bond.as_mut() {
                let h = bond::bond_hash(&flow.dl_src) as usize;
                bond.hash[h].tx_bytes += n_bytes;
            }
        }
    }
}

/// Rebalances every bonded port once the cadence deadline passes.
pub(crate) fn account_checkpoint(br: &mut Bridge, now_ms: u64) {
    if !br.has_bonded_ports || now_ms < br.next_rebalance_ms {
        return;
    }
    br.next_rebalance_ms = now_ms + bond::REBALANCE_INTERVAL_MS;

    let Bridge { ports, ofproto, .. } = br;
    for port in ports.iter_mut() {
        if port.ifaces.len() > 1 {
            bond::rebalance_port(port, ofproto.as_mut());
        }
    }
}

//! Parsed flows and datapath actions.

use bridge_types::{MacAddress, VlanId};

/// Ethertype of ARP frames.
pub const ETH_TYPE_ARP: u16 = 0x0806;

/// Ethertype used for gratuitous learning frames sent after a bond
/// failover so upstream switches re-learn the new egress.
pub const ETH_TYPE_GRATUITOUS_LEARN: u16 = 0xf177;

/// ARP operation code for replies (carried in `nw_proto`).
pub const ARP_OP_REPLY: u8 = 2;

/// NetFlow output-interface sentinel: the flow was flooded.
pub const NF_OUT_FLOOD: u16 = 0xffff;

/// NetFlow output-interface sentinel: the flow was dropped.
pub const NF_OUT_DROP: u16 = 0xfffe;

/// OpenFlow pseudo-port for "process normally", used by the catch-all
/// flow installed when no controller is configured.
pub const OFPP_NORMAL: u16 = 0xfffa;

/// Minimum Ethernet frame length (without FCS).
const ETH_MIN_LEN: usize = 60;

/// A parsed flow: L2, 802.1Q, and enough of L3/L4 to classify.
///
/// `dl_vlan` is `None` when the frame carries no 802.1Q header; a header
/// with VID 0 (priority tagging) parses as `Some(VlanId(0))` and is treated
/// as untagged by the VLAN pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flow {
    /// Ingress datapath port number.
    pub in_port: u16,
    /// Source MAC address.
    pub dl_src: MacAddress,
    /// Destination MAC address.
    pub dl_dst: MacAddress,
    /// 802.1Q VLAN tag, if present.
    pub dl_vlan: Option<VlanId>,
    /// Ethertype.
    pub dl_type: u16,
    /// IP protocol, or ARP opcode for ARP frames.
    pub nw_proto: u8,
    /// IPv4 source address.
    pub nw_src: u32,
    /// IPv4 destination address.
    pub nw_dst: u32,
    /// Transport source port.
    pub tp_src: u16,
    /// Transport destination port.
    pub tp_dst: u16,
}

impl Default for Flow {
    fn default() -> Self {
        Flow {
            in_port: 0,
            dl_src: MacAddress::ZERO,
            dl_dst: MacAddress::ZERO,
            dl_vlan: None,
            dl_type: 0,
            nw_proto: 0,
            nw_src: 0,
            nw_dst: 0,
            tp_src: 0,
            tp_dst: 0,
        }
    }
}

impl Flow {
    /// Returns true for a broadcast ARP reply. A host that moved to the
    /// far side of a bond announces itself this way, so the bonded-ingress
    /// duplicate suppression must let these frames through.
    pub fn is_broadcast_arp_reply(&self) -> bool {
        self.dl_type == ETH_TYPE_ARP
            && self.nw_proto == ARP_OP_REPLY
            && self.dl_dst.is_broadcast()
    }
}

/// One datapath action. The action stream is stateful: a VLAN action
/// applies to every subsequent output until the next VLAN action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpAction {
    /// Remove the 802.1Q header.
    StripVlan,
    /// Set (or add) the 802.1Q VID.
    SetVlanVid(VlanId),
    /// Emit the frame on a datapath port.
    Output(u16),
}

/// Composes the benign broadcast frame used for gratuitous learning: the
/// learned MAC as source, a distinctive Ethertype, and a short ASCII note
/// as payload, padded to the minimum frame size.
pub fn benign_learning_packet(src: MacAddress) -> Vec<u8> {
    let payload = b"bond failover relearn";
    let mut frame = Vec::with_capacity(ETH_MIN_LEN);
    frame.extend_from_slice(MacAddress::BROADCAST.as_bytes());
    frame.extend_from_slice(src.as_bytes());
    frame.extend_from_slice(&ETH_TYPE_GRATUITOUS_LEARN.to_be_bytes());
    frame.extend_from_slice(payload);
    frame.resize(ETH_MIN_LEN, 0);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(s: &str) -> MacAddress {
        s.parse().unwrap()
    }

    #[test]
    fn test_broadcast_arp_reply_detection() {
        let flow = Flow {
            dl_type: ETH_TYPE_ARP,
            nw_proto: ARP_OP_REPLY,
            dl_dst: MacAddress::BROADCAST,
            ..Flow::default()
        };
        assert!(flow.is_broadcast_arp_reply());

        let unicast_reply = Flow {
            dl_dst: mac("00:11:22:33:44:55"),
            ..flow.clone()
        };
        assert!(!unicast_reply.is_broadcast_arp_reply());

        let request = Flow {
            nw_proto: 1,
            ..flow.clone()
        };
        assert!(!request.is_broadcast_arp_reply());

        let not_arp = Flow {
            dl_type: 0x0800,
            ..flow
        };
        assert!(!not_arp.is_broadcast_arp_reply());
    }

    #[test]
    fn test_learning_packet_layout() {
        let src = mac("aa:bb:cc:dd:ee:01");
        let frame = benign_learning_packet(src);
        assert_eq!(frame.len(), ETH_MIN_LEN);
        assert_eq!(&frame[0..6], MacAddress::BROADCAST.as_bytes());
        assert_eq!(&frame[6..12], src.as_bytes());
        assert_eq!(
            u16::from_be_bytes([frame[12], frame[13]]),
            ETH_TYPE_GRATUITOUS_LEARN
        );
    }
}

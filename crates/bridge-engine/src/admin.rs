//! Administrative commands.
//!
//! The daemon's control socket maps each request line onto one of these
//! handlers; replies are plain text, errors are one-line strings. The
//! command set covers learning-table inspection, flow-table dumps, and
//! bond manipulation.

use crate::bond;
use crate::engine::BridgeEngine;
use bridge_types::{MacAddress, TagSet};
use std::fmt::Write as _;

impl BridgeEngine {
    /// Dispatches one admin request line (`COMMAND [ARG]...`).
    pub fn admin_command(&mut self, line: &str, now_ms: u64) -> Result<String, String> {
        let mut parts = line.split_whitespace();
        let cmd = parts.next().ok_or_else(|| "missing command".to_string())?;
        let args: Vec<&str> = parts.collect();
        match cmd {
            "fdb/show" => {
                let bridge = args.first().ok_or("usage: fdb/show BRIDGE")?;
                self.fdb_show(bridge, now_ms)
            }
            "bridge/dump-flows" => {
                let bridge = args.first().ok_or("usage: bridge/dump-flows BRIDGE")?;
                self.dump_flows(bridge)
            }
            "bond/list" => Ok(self.bond_list()),
            "bond/show" => {
                let bond = args.first().ok_or("usage: bond/show BOND")?;
                self.bond_show(bond, now_ms)
            }
            "bond/migrate" => self.bond_migrate(&args),
            "bond/set-active-slave" => self.bond_set_active_slave(&args),
            "bond/enable-slave" => self.bond_change_slave(&args, true),
            "bond/disable-slave" => self.bond_change_slave(&args, false),
            "bond/hash" => {
                let mac = args.first().ok_or("usage: bond/hash MAC")?;
                bond_hash_command(mac)
            }
            other => Err(format!("unknown command: {other}")),
        }
    }

    fn fdb_show(&self, bridge: &str, now_ms: u64) -> Result<String, String> {
        let br = self.bridge(bridge).ok_or("no such bridge")?;
        let mut out = String::from(" port  VLAN  MAC                Age\n");
        for entry in br.ml().iter() {
            if entry.port_idx >= br.ports().len() {
                continue;
            }
            let Some(dp_ifidx) = br.ports()[entry.port_idx]
                .ifaces
                .first()
                .and_then(|i| i.dp_ifidx)
            else {
                continue;
            };
            let idle = br.ml().idle_time_ms();
            let age_s = idle
                .saturating_sub(entry.expires_ms.saturating_sub(now_ms))
                / 1000;
            let _ = writeln!(
                out,
                "{:5}  {:4}  {}  {:3}",
                dp_ifidx, entry.vlan, entry.mac, age_s
            );
        }
        Ok(out)
    }

    fn dump_flows(&self, bridge: &str) -> Result<String, String> {
        let br = self.bridge(bridge).ok_or("no such bridge")?;
        Ok(br.ofproto.dump_flows())
    }

    fn bond_list(&self) -> String {
        let mut out = String::from("bridge\tbond\tslaves\n");
        for br in &self.bridges {
            for port in br.ports() {
                if port.ifaces.len() > 1 {
                    let slaves: Vec<&str> =
                        port.ifaces.iter().map(|i| i.name.as_str()).collect();
                    let _ = writeln!(out, "{}\t{}\t{}", br.name(), port.name, slaves.join(", "));
                }
            }
        }
        out
    }

    /// Finds a bonded port by name across all bridges.
    fn bond_find(&self, name: &str) -> Option<(usize, usize)> {
        for (bi, br) in self.bridges.iter().enumerate() {
            for (pi, port) in br.ports().iter().enumerate() {
                if port.name == name && port.ifaces.len() > 1 {
                    return Some((bi, pi));
                }
            }
        }
        None
    }

    fn bond_show(&mut self, name: &str, now_ms: u64) -> Result<String, String> {
        let (bi, pi) = self.bond_find(name).ok_or("no such bond")?;
        let br = &mut self.bridges[bi];
        let next_rebalance = br.next_rebalance_ms.saturating_sub(now_ms);

        let mut out = String::new();
        let _ = writeln!(out, "updelay: {} ms", br.ports[pi].updelay_ms);
        let _ = writeln!(out, "downdelay: {} ms", br.ports[pi].downdelay_ms);
        let _ = writeln!(out, "next rebalance: {} ms", next_rebalance);

        let crate::bridge::Bridge {
            ports, ml, ofproto, ..
        } = br;
        let port = &mut ports[pi];
        for j in 0..port.ifaces.len() {
            let _ = writeln!(
                out,
                "slave {}: {}",
                port.ifaces[j].name,
                if port.ifaces[j].enabled {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            if port.bond.as_ref().is_some_and(|b| b.active_iface == Some(j)) {
                out.push_str("\tactive slave\n");
            }
            if let Some(expires) = port.ifaces[j].delay_expires {
                let _ = writeln!(
                    out,
                    "\t{} expires in {} ms",
                    if port.ifaces[j].enabled {
                        "downdelay"
                    } else {
                        "updelay"
                    },
                    expires.saturating_sub(now_ms)
                );
            }

            let hashes: Vec<(usize, u64)> = port
                .bond
                .as_ref()
                .map(|b| {
                    b.hash
                        .iter()
                        .enumerate()
                        .filter(|(_, e)| e.iface == Some(j))
                        .map(|(h, e)| (h, e.tx_bytes))
                        .collect()
                })
                .unwrap_or_default();
            for (h, tx_bytes) in hashes {
                let _ = writeln!(out, "\thash {}: {} kB load", h, tx_bytes / 1024);
                let entries: Vec<MacAddress> = ml
                    .iter()
                    .filter(|e| {
                        bond::bond_hash(&e.mac) as usize == h && e.port_idx != port.port_idx
                    })
                    .map(|e| e.mac)
                    .collect();
                for mac in entries {
                    let mut tags = TagSet::new();
                    let chosen =
                        bond::choose_output_iface(port, &mac, &mut tags, ml, ofproto.as_mut());
                    if chosen == port.ifaces[j].dp_ifidx {
                        let _ = writeln!(out, "\t\t{mac}");
                    }
                }
            }
        }
        Ok(out)
    }

    fn bond_migrate(&mut self, args: &[&str]) -> Result<String, String> {
        let [bond_s, hash_s, slave_s] = args else {
            return Err("usage: bond/migrate BOND HASH SLAVE".to_string());
        };
        let (bi, pi) = self.bond_find(bond_s).ok_or("no such bond")?;

        let hash = if let Ok(mac) = hash_s.parse::<MacAddress>() {
            bond::bond_hash(&mac) as usize
        } else if let Ok(n) = hash_s.parse::<u32>() {
            (n & 0xff) as usize
        } else {
            return Err("bad hash".to_string());
        };

        let crate::bridge::Bridge { ports, ofproto, .. } = &mut self.bridges[bi];
        let port = &mut ports[pi];
        let Some(j) = port.iface_index(slave_s) else {
            return Err("no such slave".to_string());
        };
        if !port.ifaces[j].enabled {
            return Err("cannot migrate to disabled slave".to_string());
        }

        let bond_state = port.bond.as_mut().ok_or("no such bond")?;
        ofproto.revalidate(bond_state.hash[hash].tag);
        bond_state.hash[hash].iface = Some(j);
        bond_state.hash[hash].tag = bridge_types::Tag::random();
        bond_state.compat_stale = true;
        Ok("migrated".to_string())
    }

    fn bond_set_active_slave(&mut self, args: &[&str]) -> Result<String, String> {
        let [bond_s, slave_s] = args else {
            return Err("usage: bond/set-active-slave BOND SLAVE".to_string());
        };
        let (bi, pi) = self.bond_find(bond_s).ok_or("no such bond")?;
        let br = &mut self.bridges[bi];

        let Some(j) = br.ports[pi].iface_index(slave_s) else {
            return Err("no such slave".to_string());
        };
        if !br.ports[pi].ifaces[j].enabled {
            return Err("cannot make disabled slave active".to_string());
        }

        let crate::bridge::Bridge {
            ports, ml, ofproto, ..
        } = br;
        let port = &mut ports[pi];
        let bond_state = port.bond.as_mut().ok_or("no such bond")?;
        if bond_state.active_iface == Some(j) {
            return Ok("no change".to_string());
        }
        ofproto.revalidate(bond_state.active_tag);
        bond_state.active_iface = Some(j);
        bond_state.active_tag = bridge_types::Tag::random();
        tracing::info!(port = %port.name, active = %port.ifaces[j].name, "active interface is now");
        bond::send_learning_packets(port, ml, ofproto.as_mut());
        Ok("done".to_string())
    }

    fn bond_change_slave(&mut self, args: &[&str], enable: bool) -> Result<String, String> {
        let [bond_s, slave_s] = args else {
            return Err(format!(
                "usage: bond/{}-slave BOND SLAVE",
                if enable { "enable" } else { "disable" }
            ));
        };
        let (bi, pi) = self.bond_find(bond_s).ok_or("no such bond")?;
        let br = &mut self.bridges[bi];
        let Some(j) = br.ports[pi].iface_index(slave_s) else {
            return Err("no such slave".to_string());
        };

        let crate::bridge::Bridge {
            ports, ml, ofproto, ..
        } = br;
        bond::enable_slave(&mut ports[pi], j, enable, false, ml, ofproto.as_mut());
        Ok(if enable { "enabled" } else { "disabled" }.to_string())
    }
}

fn bond_hash_command(mac_s: &str) -> Result<String, String> {
    match mac_s.parse::<MacAddress>() {
        Ok(mac) => Ok(format!("{}", bond::bond_hash(&mac))),
        Err(_) => Err("invalid mac".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BridgeConfig, InterfaceConfig, NetworkConfig, PortConfig};
    use crate::flow::Flow;
    use crate::sim::Sim;
    use bridge_types::TagSet;

    fn mac(last: u8) -> MacAddress {
        MacAddress::new([0x00, 0x10, 0x20, 0x30, 0x40, last])
    }

    fn setup() -> (Sim, BridgeEngine) {
        let sim = Sim::new();
        sim.add_netdev("eth1", mac(0x11), true);
        sim.add_netdev("eth3a", mac(0x13), true);
        sim.add_netdev("eth3b", mac(0x14), true);
        let (dp, net, of) = sim.providers();
        let mut eng = BridgeEngine::new(dp, net, of);
        let cfg = NetworkConfig {
            bridges: vec![BridgeConfig {
                name: "br0".into(),
                ports: vec![
                    PortConfig {
                        name: "p1".into(),
                        interfaces: vec![InterfaceConfig::named("eth1")],
                        tag: Some(10),
                        ..Default::default()
                    },
                    PortConfig {
                        name: "bond0".into(),
                        interfaces: vec![
                            InterfaceConfig::named("eth3a"),
                            InterfaceConfig::named("eth3b"),
                        ],
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }],
            ..Default::default()
        };
        eng.init(&cfg, 0);
        (sim, eng)
    }

    #[test]
    fn test_fdb_show() {
        let (_sim, mut eng) = setup();
        {
            let br = eng.bridge_mut("br0").unwrap();
            let flow = Flow {
                in_port: 1,
                dl_src: mac(0xaa),
                dl_dst: mac(0xbb),
                ..Flow::default()
            };
            let mut tags = TagSet::new();
            let mut actions = Vec::new();
            let mut nf = 0;
            br.on_normal_flow(&flow, Some(&[0u8; 60]), &mut tags, &mut actions, &mut nf, 0);
        }

        let out = eng.admin_command("fdb/show br0", 5_000).unwrap();
        assert!(out.starts_with(" port  VLAN  MAC"));
        assert!(out.contains("00:10:20:30:40:aa"));
        assert!(out.contains("  10  "));
        // Learned 5 s ago.
        assert!(out.trim_end().ends_with("5"));

        assert!(eng.admin_command("fdb/show nope", 0).is_err());
    }

    #[test]
    fn test_bond_list_and_show() {
        let (_sim, mut eng) = setup();
        let out = eng.admin_command("bond/list", 0).unwrap();
        assert!(out.contains("br0\tbond0\teth3a, eth3b"));
        assert!(!out.contains("p1"));

        let out = eng.admin_command("bond/show bond0", 0).unwrap();
        assert!(out.contains("updelay: 0 ms"));
        assert!(out.contains("slave eth3a: enabled"));
        assert!(out.contains("slave eth3b: enabled"));
        assert!(out.contains("active slave"));

        assert!(eng.admin_command("bond/show p1", 0).is_err());
    }

    #[test]
    fn test_bond_hash_command() {
        let (_sim, mut eng) = setup();
        let out = eng
            .admin_command("bond/hash 00:10:20:30:40:aa", 0)
            .unwrap();
        let h: u32 = out.parse().unwrap();
        assert_eq!(h, bond::bond_hash(&mac(0xaa)) as u32);
        assert!(eng.admin_command("bond/hash junk", 0).is_err());
    }

    #[test]
    fn test_bond_migrate_by_number_and_mac() {
        let (sim, mut eng) = setup();
        let out = eng
            .admin_command("bond/migrate bond0 7 eth3b", 0)
            .unwrap();
        assert_eq!(out, "migrated");
        {
            let br = eng.bridge("br0").unwrap();
            let bond0 = br.ports().iter().find(|p| p.name == "bond0").unwrap();
            let j = bond0.iface_index("eth3b").unwrap();
            assert_eq!(bond0.bond.as_ref().unwrap().hash[7].iface, Some(j));
        }
        assert!(!sim.revalidations("br0").is_empty());

        // A MAC argument selects its hash bucket.
        let h = bond::bond_hash(&mac(0x77)) as usize;
        eng.admin_command("bond/migrate bond0 00:10:20:30:40:77 eth3a", 0)
            .unwrap();
        let br = eng.bridge("br0").unwrap();
        let bond0 = br.ports().iter().find(|p| p.name == "bond0").unwrap();
        let j = bond0.iface_index("eth3a").unwrap();
        assert_eq!(bond0.bond.as_ref().unwrap().hash[h].iface, Some(j));

        assert!(eng.admin_command("bond/migrate bond0 junk eth3a", 0).is_err());
        assert!(eng.admin_command("bond/migrate bond0 7", 0).is_err());
    }

    #[test]
    fn test_bond_set_active_slave() {
        let (_sim, mut eng) = setup();
        let active_name = {
            let br = eng.bridge("br0").unwrap();
            let bond0 = br.ports().iter().find(|p| p.name == "bond0").unwrap();
            let j = bond0.bond.as_ref().unwrap().active_iface.unwrap();
            bond0.ifaces[j].name.clone()
        };
        let other = if active_name == "eth3a" { "eth3b" } else { "eth3a" };

        let out = eng
            .admin_command(&format!("bond/set-active-slave bond0 {other}"), 0)
            .unwrap();
        assert_eq!(out, "done");
        let out = eng
            .admin_command(&format!("bond/set-active-slave bond0 {other}"), 0)
            .unwrap();
        assert_eq!(out, "no change");
    }

    #[test]
    fn test_bond_enable_disable_slave() {
        let (_sim, mut eng) = setup();
        let out = eng
            .admin_command("bond/disable-slave bond0 eth3a", 0)
            .unwrap();
        assert_eq!(out, "disabled");
        {
            let br = eng.bridge("br0").unwrap();
            let bond0 = br.ports().iter().find(|p| p.name == "bond0").unwrap();
            let j = bond0.iface_index("eth3a").unwrap();
            assert!(!bond0.ifaces[j].enabled);
        }

        // A disabled slave rejects migration and activation.
        assert!(eng.admin_command("bond/migrate bond0 7 eth3a", 0).is_err());
        assert!(eng
            .admin_command("bond/set-active-slave bond0 eth3a", 0)
            .is_err());

        let out = eng
            .admin_command("bond/enable-slave bond0 eth3a", 0)
            .unwrap();
        assert_eq!(out, "enabled");
    }

    #[test]
    fn test_dump_flows() {
        let (_sim, mut eng) = setup();
        // Standalone mode installed the catch-all flow.
        let out = eng.admin_command("bridge/dump-flows br0", 0).unwrap();
        assert!(out.contains("priority=0"));
    }

    #[test]
    fn test_unknown_command() {
        let (_sim, mut eng) = setup();
        assert!(eng.admin_command("frob/nicate br0", 0).is_err());
        assert!(eng.admin_command("", 0).is_err());
    }
}

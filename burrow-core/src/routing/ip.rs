//! Edge-compressed binary tries for IP rules.
//!
//! Nodes store runs of bits; inserting a key that partitions an existing run
//! splits the node in place.

use super::Rule;

#[derive(Debug)]
struct IpNode {
    /// One bit per element, most significant first.
    bits: Vec<u8>,
    rule: Rule,
    children: [Option<Box<IpNode>>; 2],
}

impl IpNode {
    fn leaf(bits: &[u8], rule: Rule) -> Box<Self> {
        Box::new(Self {
            bits: bits.to_vec(),
            rule,
            children: [None, None],
        })
    }
}

#[derive(Debug, Default)]
pub(crate) struct IpTree {
    children: [Option<Box<IpNode>>; 2],
}

fn bit_at(octets: &[u8], i: usize) -> u8 {
    (octets[i / 8] >> (7 - i % 8)) & 1
}

impl IpTree {
    /// Inserts the first `prefix_len` bits of `octets` with `rule`.
    pub(crate) fn insert(&mut self, octets: &[u8], prefix_len: usize, rule: Rule) {
        if prefix_len == 0 || prefix_len > octets.len() * 8 {
            return;
        }
        let key: Vec<u8> = (0..prefix_len).map(|i| bit_at(octets, i)).collect();
        insert_into(&mut self.children[key[0] as usize], &key, rule);
    }

    /// Longest-prefix lookup. Only nodes whose whole run matched at their
    /// position contribute; the deepest one with a rule wins.
    pub(crate) fn lookup(&self, octets: &[u8]) -> Rule {
        let total = octets.len() * 8;
        let mut best = Rule::None;
        let mut pos = 0;
        let mut slot = &self.children[bit_at(octets, 0) as usize];
        while let Some(node) = slot {
            if pos + node.bits.len() > total {
                break;
            }
            if !node
                .bits
                .iter()
                .enumerate()
                .all(|(j, &b)| bit_at(octets, pos + j) == b)
            {
                break;
            }
            pos += node.bits.len();
            if node.rule != Rule::None {
                best = node.rule;
            }
            if pos == total {
                break;
            }
            slot = &node.children[bit_at(octets, pos) as usize];
        }
        best
    }
}

fn insert_into(slot: &mut Option<Box<IpNode>>, key: &[u8], rule: Rule) {
    let Some(node) = slot else {
        *slot = Some(IpNode::leaf(key, rule));
        return;
    };

    let common = node
        .bits
        .iter()
        .zip(key.iter())
        .take_while(|(a, b)| a == b)
        .count();

    if common == node.bits.len() {
        if common == key.len() {
            // run ends exactly here: assign in place
            node.rule = rule;
        } else {
            let next = key[common] as usize;
            insert_into(&mut node.children[next], &key[common..], rule);
        }
        return;
    }

    // The key partitions this node's run: split off the shared prefix and
    // reattach the tail below it.
    let mut tail = std::mem::replace(node, IpNode::leaf(&key[..common], Rule::None));
    tail.bits.drain(..common);
    let tail_bit = tail.bits[0] as usize;
    node.children[tail_bit] = Some(tail);

    if common == key.len() {
        node.rule = rule;
    } else {
        let new_bit = key[common] as usize;
        node.children[new_bit] = Some(IpNode::leaf(&key[common..], rule));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn v4(s: &str) -> [u8; 4] {
        s.parse::<Ipv4Addr>().unwrap().octets()
    }

    #[test]
    fn split_on_diverging_runs() {
        let mut tree = IpTree::default();
        tree.insert(&v4("10.1.1.0"), 24, Rule::Proxy);
        tree.insert(&v4("10.2.0.0"), 16, Rule::Direct);
        assert_eq!(tree.lookup(&v4("10.1.1.7")), Rule::Proxy);
        assert_eq!(tree.lookup(&v4("10.2.200.1")), Rule::Direct);
        assert_eq!(tree.lookup(&v4("10.1.2.1")), Rule::None);
        assert_eq!(tree.lookup(&v4("11.1.1.1")), Rule::None);
    }

    #[test]
    fn shorter_prefix_splits_existing_run() {
        let mut tree = IpTree::default();
        tree.insert(&v4("192.168.4.0"), 24, Rule::Proxy);
        tree.insert(&v4("192.168.0.0"), 16, Rule::Direct);
        assert_eq!(tree.lookup(&v4("192.168.4.9")), Rule::Proxy);
        assert_eq!(tree.lookup(&v4("192.168.9.9")), Rule::Direct);
    }

    #[test]
    fn deeper_prefix_wins() {
        let mut tree = IpTree::default();
        tree.insert(&v4("10.0.0.0"), 8, Rule::Direct);
        tree.insert(&v4("10.1.1.0"), 24, Rule::Proxy);
        tree.insert(&v4("10.1.1.1"), 32, Rule::Auto);
        assert_eq!(tree.lookup(&v4("10.9.9.9")), Rule::Direct);
        assert_eq!(tree.lookup(&v4("10.1.1.9")), Rule::Proxy);
        assert_eq!(tree.lookup(&v4("10.1.1.1")), Rule::Auto);
    }

    #[test]
    fn equal_prefix_reinsertion_overwrites() {
        let mut tree = IpTree::default();
        tree.insert(&v4("172.16.0.0"), 12, Rule::Proxy);
        tree.insert(&v4("172.16.0.0"), 12, Rule::Direct);
        assert_eq!(tree.lookup(&v4("172.20.1.1")), Rule::Direct);
    }

    #[test]
    fn ipv6_prefixes() {
        let mut tree = IpTree::default();
        let net = "2001:db8::".parse::<Ipv6Addr>().unwrap().octets();
        tree.insert(&net, 32, Rule::Proxy);
        let inside = "2001:db8::1".parse::<Ipv6Addr>().unwrap().octets();
        let outside = "2001:db9::1".parse::<Ipv6Addr>().unwrap().octets();
        assert_eq!(tree.lookup(&inside), Rule::Proxy);
        assert_eq!(tree.lookup(&outside), Rule::None);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        /// Reference longest-prefix match over a flat rule list.
        fn reference(rules: &[(u32, u8, Rule)], ip: u32) -> Rule {
            let mut best: Option<(u8, Rule)> = None;
            for &(net, len, rule) in rules {
                let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
                if ip & mask == net & mask && best.map_or(true, |(l, _)| len >= l) {
                    best = Some((len, rule));
                }
            }
            best.map(|(_, r)| r).unwrap_or(Rule::None)
        }

        fn arb_rule() -> impl Strategy<Value = Rule> {
            prop_oneof![
                Just(Rule::Proxy),
                Just(Rule::Direct),
                Just(Rule::Auto),
            ]
        }

        proptest! {
            #[test]
            fn lookup_matches_reference(
                rules in proptest::collection::vec((any::<u32>(), 1u8..=32, arb_rule()), 1..24),
                probes in proptest::collection::vec(any::<u32>(), 16),
            ) {
                let mut tree = IpTree::default();
                // normalize to network addresses so insertion order only
                // matters for identical prefixes, as in the reference
                let rules: Vec<(u32, u8, Rule)> = rules
                    .into_iter()
                    .map(|(ip, len, rule)| (ip & (u32::MAX << (32 - len)), len, rule))
                    .collect();
                for &(net, len, rule) in &rules {
                    tree.insert(&net.to_be_bytes(), len as usize, rule);
                }
                // identical prefixes overwrite, so the reference keeps the
                // last one: rebuild the list accordingly
                let mut dedup: Vec<(u32, u8, Rule)> = Vec::new();
                for &(net, len, rule) in &rules {
                    if let Some(entry) = dedup.iter_mut().find(|(n, l, _)| *n == net && *l == len) {
                        entry.2 = rule;
                    } else {
                        dedup.push((net, len, rule));
                    }
                }
                for ip in probes {
                    prop_assert_eq!(tree.lookup(&ip.to_be_bytes()), reference(&dedup, ip));
                }
            }
        }
    }
}

//! Set algebra over hosts, for groups and single tunnels alike.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use lariat_proto::ErrorResult;

use crate::group::Group;
use crate::tunnel::Tunnel;

/// Union, intersection, difference and symmetric difference over host
/// identity. A tunnel participates as a group of one.
///
/// The resulting group keeps the remembered connection errors of every
/// host that survives the operation.
pub trait SetOps {
    /// This value as a group.
    fn as_group(&self) -> Group;

    /// Hosts in `self` or `other`.
    fn union(&self, other: &impl SetOps) -> Group {
        self.set_op(other, |left, right| {
            left.union(right).cloned().collect()
        })
    }

    /// Hosts in both `self` and `other`.
    fn intersection(&self, other: &impl SetOps) -> Group {
        self.set_op(other, |left, right| {
            left.intersection(right).cloned().collect()
        })
    }

    /// Hosts in `self` but not `other`.
    fn difference(&self, other: &impl SetOps) -> Group {
        self.set_op(other, |left, right| {
            left.difference(right).cloned().collect()
        })
    }

    /// Hosts in exactly one of `self` and `other`.
    fn symmetric_difference(&self, other: &impl SetOps) -> Group {
        self.set_op(other, |left, right| {
            left.symmetric_difference(right).cloned().collect()
        })
    }

    /// Applies `op` over the two host sets and rebuilds a group from the
    /// surviving hosts.
    fn set_op(
        &self,
        other: &impl SetOps,
        op: fn(&HashSet<String>, &HashSet<String>) -> HashSet<String>,
    ) -> Group {
        let left = self.as_group();
        let right = other.as_group();

        let left_hosts: HashSet<String> = left.hosts().iter().map(|&h| h.to_owned()).collect();
        let right_hosts: HashSet<String> = right.hosts().iter().map(|&h| h.to_owned()).collect();
        let keep = op(&left_hosts, &right_hosts);

        // Left operand wins when both sides carry a tunnel for a host.
        let tunnels: Vec<Arc<Tunnel>> = left
            .tunnels()
            .iter()
            .chain(right.tunnels().iter())
            .filter(|t| keep.contains(t.host()))
            .map(Arc::clone)
            .collect();
        let group = Group::new(tunnels);

        let mut errors: HashMap<String, ErrorResult> = HashMap::new();
        for source in [&left, &right] {
            for (host, err) in source.connection_errors() {
                if keep.contains(&host) {
                    errors.insert(host, err);
                }
            }
        }
        group.set_connection_errors(errors);
        group
    }
}

impl SetOps for Group {
    fn as_group(&self) -> Group {
        self.clone()
    }
}

impl SetOps for Arc<Tunnel> {
    fn as_group(&self) -> Group {
        Group::new([Arc::clone(self)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(hosts: &[&str]) -> Group {
        Group::from_hosts(hosts.iter().copied())
    }

    fn sorted_hosts(g: &Group) -> Vec<String> {
        let mut hosts: Vec<String> = g.hosts().iter().map(|&h| h.to_owned()).collect();
        hosts.sort();
        hosts
    }

    #[test]
    fn set_algebra_over_hosts() {
        let a = group(&["h1", "h2", "h3"]);
        let b = group(&["h2", "h3", "h4"]);

        assert_eq!(sorted_hosts(&a.union(&b)), ["h1", "h2", "h3", "h4"]);
        assert_eq!(sorted_hosts(&a.intersection(&b)), ["h2", "h3"]);
        assert_eq!(sorted_hosts(&a.difference(&b)), ["h1"]);
        assert_eq!(sorted_hosts(&a.symmetric_difference(&b)), ["h1", "h4"]);
    }

    #[test]
    fn tunnel_acts_as_singleton_group() {
        let t = Arc::new(Tunnel::ssh("h9"));
        let g = group(&["h1"]);
        assert_eq!(sorted_hosts(&t.union(&g)), ["h1", "h9"]);
        assert_eq!(sorted_hosts(&t.intersection(&g)), Vec::<String>::new());
    }

    #[test]
    fn connection_errors_follow_surviving_hosts() {
        let a = group(&["h1", "h2"]);
        a.set_connection_errors(
            [
                ("h1".to_owned(), ErrorResult::new("down")),
                ("h2".to_owned(), ErrorResult::new("also down")),
            ]
            .into_iter()
            .collect(),
        );
        let b = group(&["h2", "h3"]);

        let diff = a.difference(&b);
        let errors = diff.connection_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors.get("h1").map(|e| e.msg.as_str()), Some("down"));
    }
}

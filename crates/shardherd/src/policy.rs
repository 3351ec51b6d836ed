//! Replication policy evaluation.
//!
//! A policy is a tree of constraints over locality attributes, e.g. "across
//! zones choose three, one process per zone". Two entry points:
//! - [`ReplicationPolicy::satisfies`]: does a set of localities, taken
//!   together, meet the policy?
//! - [`ReplicationPolicy::select_replicas`]: choose a minimal satisfying
//!   subset that includes a set of forced entries.
//!
//! The evaluator is pure: it reads only the policy tree, the input entries,
//! and the caller-supplied RNG (selection among equivalent candidates is
//! randomized so teams spread out).

use std::collections::{BTreeMap, BTreeSet};

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::locality::Locality;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationPolicy {
    /// Any single entry.
    One,
    /// At least `count` distinct values of `attribute`, each of whose entry
    /// group satisfies `inner`.
    Across {
        attribute: String,
        count: usize,
        inner: Box<ReplicationPolicy>,
    },
    /// All child policies satisfied by the same entry set.
    And(Vec<ReplicationPolicy>),
}

impl ReplicationPolicy {
    /// The common storage policy: `count` replicas on distinct zones.
    pub fn across_zones(count: usize) -> Self {
        ReplicationPolicy::Across {
            attribute: crate::locality::ZONE_ID.to_string(),
            count,
            inner: Box::new(ReplicationPolicy::One),
        }
    }

    /// Total number of replicas a minimal satisfying set contains.
    pub fn replica_count(&self) -> usize {
        match self {
            ReplicationPolicy::One => 1,
            ReplicationPolicy::Across { count, inner, .. } => count * inner.replica_count(),
            ReplicationPolicy::And(children) => {
                children.iter().map(|c| c.replica_count()).max().unwrap_or(0)
            }
        }
    }

    /// Attribute names referenced anywhere in the tree.
    pub fn referenced_attributes(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_attributes(&mut out);
        out
    }

    fn collect_attributes<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            ReplicationPolicy::One => {}
            ReplicationPolicy::Across { attribute, inner, .. } => {
                out.insert(attribute.as_str());
                inner.collect_attributes(out);
            }
            ReplicationPolicy::And(children) => {
                for c in children {
                    c.collect_attributes(out);
                }
            }
        }
    }

    /// A locality is usable under this policy iff it carries every attribute
    /// the policy constrains.
    pub fn valid_locality(&self, locality: &Locality) -> bool {
        self.referenced_attributes()
            .iter()
            .all(|attr| locality.get(attr).is_some())
    }

    /// Whether `entries`, taken together, satisfy the policy.
    pub fn satisfies(&self, entries: &[&Locality]) -> bool {
        match self {
            ReplicationPolicy::One => !entries.is_empty(),
            ReplicationPolicy::Across { attribute, count, inner } => {
                let groups = group_by_attribute(entries, attribute);
                groups.values().filter(|g| inner.satisfies(g)).count() >= *count
            }
            ReplicationPolicy::And(children) => children.iter().all(|c| c.satisfies(entries)),
        }
    }

    /// Choose a minimal subset of `entries` (by index) that includes every
    /// index in `forced` and satisfies the policy. Returns `None` when no
    /// such subset exists; the forced entries are always part of the result.
    pub fn select_replicas(
        &self,
        entries: &[&Locality],
        forced: &[usize],
        rng: &mut impl Rng,
    ) -> Option<Vec<usize>> {
        let mut chosen: BTreeSet<usize> = forced.iter().copied().collect();
        if chosen.iter().any(|&i| i >= entries.len()) {
            return None;
        }
        if !self.select_into(entries, &mut chosen, rng) {
            return None;
        }
        Some(chosen.into_iter().collect())
    }

    /// Extend `chosen` until the policy is satisfied; returns false if
    /// impossible. Entries already in `chosen` count toward every branch.
    fn select_into(
        &self,
        entries: &[&Locality],
        chosen: &mut BTreeSet<usize>,
        rng: &mut impl Rng,
    ) -> bool {
        match self {
            ReplicationPolicy::One => {
                if !chosen.is_empty() {
                    return true;
                }
                if entries.is_empty() {
                    return false;
                }
                chosen.insert(rng.gen_range(0..entries.len()));
                true
            }
            ReplicationPolicy::Across { attribute, count, inner } => {
                // Index groups by attribute value; entries missing the
                // attribute cannot contribute.
                let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
                for (idx, loc) in entries.iter().enumerate() {
                    if let Some(value) = loc.get(attribute) {
                        groups.entry(value).or_default().push(idx);
                    }
                }

                // Every group holding a forced entry must itself satisfy the
                // inner policy (possibly by selecting more from that group).
                let mut satisfied = 0usize;
                let mut untouched: Vec<&Vec<usize>> = Vec::new();
                for members in groups.values() {
                    let mut local: BTreeSet<usize> =
                        members.iter().copied().filter(|i| chosen.contains(i)).collect();
                    if local.is_empty() {
                        untouched.push(members);
                        continue;
                    }
                    let group_entries: Vec<&Locality> =
                        members.iter().map(|&i| entries[i]).collect();
                    // Re-map chosen indices into the group's index space.
                    let mut group_chosen: BTreeSet<usize> = BTreeSet::new();
                    for (pos, idx) in members.iter().enumerate() {
                        if local.remove(idx) {
                            group_chosen.insert(pos);
                        }
                    }
                    if !inner.select_into(&group_entries, &mut group_chosen, rng) {
                        return false;
                    }
                    for pos in group_chosen {
                        chosen.insert(members[pos]);
                    }
                    satisfied += 1;
                }

                // Recruit additional groups at random until the count holds.
                untouched.shuffle(rng);
                for members in untouched {
                    if satisfied >= *count {
                        break;
                    }
                    let group_entries: Vec<&Locality> =
                        members.iter().map(|&i| entries[i]).collect();
                    let mut group_chosen = BTreeSet::new();
                    if inner.select_into(&group_entries, &mut group_chosen, rng) {
                        for pos in group_chosen {
                            chosen.insert(members[pos]);
                        }
                        satisfied += 1;
                    }
                }

                satisfied >= *count
            }
            ReplicationPolicy::And(children) => {
                for child in children {
                    if !child.select_into(entries, chosen, rng) {
                        return false;
                    }
                }
                true
            }
        }
    }
}

fn group_by_attribute<'a>(
    entries: &[&'a Locality],
    attribute: &str,
) -> BTreeMap<String, Vec<&'a Locality>> {
    let mut groups: BTreeMap<String, Vec<&'a Locality>> = BTreeMap::new();
    for loc in entries {
        if let Some(value) = loc.get(attribute) {
            groups.entry(value.to_string()).or_default().push(loc);
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn loc(zone: &str) -> Locality {
        Locality::new("dc1", "hallA", zone, format!("p-{zone}"))
    }

    fn refs(locs: &[Locality]) -> Vec<&Locality> {
        locs.iter().collect()
    }

    #[test]
    fn across_zones_satisfied_by_distinct_zones() {
        let policy = ReplicationPolicy::across_zones(3);
        let locs = vec![loc("z1"), loc("z2"), loc("z3")];
        assert!(policy.satisfies(&refs(&locs)));

        let dup = vec![loc("z1"), loc("z1"), loc("z2")];
        assert!(!policy.satisfies(&refs(&dup)));
    }

    #[test]
    fn select_includes_forced_and_is_minimal() {
        let policy = ReplicationPolicy::across_zones(3);
        let locs = vec![loc("z1"), loc("z2"), loc("z3"), loc("z4"), loc("z5")];
        let mut rng = SmallRng::seed_from_u64(7);
        let picked = policy
            .select_replicas(&refs(&locs), &[4], &mut rng)
            .expect("policy satisfiable");
        assert_eq!(picked.len(), 3);
        assert!(picked.contains(&4));
    }

    #[test]
    fn select_fails_when_not_enough_zones() {
        let policy = ReplicationPolicy::across_zones(3);
        let locs = vec![loc("z1"), loc("z1"), loc("z2")];
        let mut rng = SmallRng::seed_from_u64(7);
        assert!(policy.select_replicas(&refs(&locs), &[], &mut rng).is_none());
    }

    #[test]
    fn forced_entries_in_same_group_stay_selected() {
        let policy = ReplicationPolicy::across_zones(2);
        // Two entries on z1; forcing both must keep both and add one zone.
        let locs = vec![loc("z1"), loc("z1"), loc("z2")];
        let mut rng = SmallRng::seed_from_u64(3);
        let picked = policy
            .select_replicas(&refs(&locs), &[0, 1], &mut rng)
            .expect("satisfiable");
        assert!(picked.contains(&0) && picked.contains(&1) && picked.contains(&2));
    }

    #[test]
    fn and_policy_requires_all_children() {
        let policy = ReplicationPolicy::And(vec![
            ReplicationPolicy::across_zones(2),
            ReplicationPolicy::Across {
                attribute: crate::locality::DATA_HALL_ID.to_string(),
                count: 2,
                inner: Box::new(ReplicationPolicy::One),
            },
        ]);
        let same_hall = vec![loc("z1"), loc("z2")];
        assert!(!policy.satisfies(&refs(&same_hall)));

        let mut split = vec![loc("z1"), loc("z2")];
        split[1].set(crate::locality::DATA_HALL_ID, "hallB");
        assert!(policy.satisfies(&refs(&split)));
    }

    #[test]
    fn valid_locality_requires_referenced_attributes() {
        let policy = ReplicationPolicy::across_zones(3);
        assert!(policy.valid_locality(&loc("z1")));
        let mut incomplete = Locality::default();
        incomplete.set("rack", "r1");
        assert!(!policy.valid_locality(&incomplete));
    }

    #[test]
    fn selection_is_deterministic_for_a_seed() {
        let policy = ReplicationPolicy::across_zones(3);
        let locs: Vec<Locality> = (0..8).map(|i| loc(&format!("z{i}"))).collect();
        let a = policy
            .select_replicas(&refs(&locs), &[0], &mut SmallRng::seed_from_u64(42))
            .unwrap();
        let b = policy
            .select_replicas(&refs(&locs), &[0], &mut SmallRng::seed_from_u64(42))
            .unwrap();
        assert_eq!(a, b);
    }
}

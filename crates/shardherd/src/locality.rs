//! Locality records describing where a storage process runs.
//!
//! A locality is a small set of named attributes with a fixed hierarchy:
//! datacenter, data hall, zone (one zone per physical machine), and process.
//! The policy evaluator treats attributes generically by name; everything
//! else in the crate goes through the typed accessors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Attribute keys understood by the built-in policies.
pub const DCID: &str = "dcid";
pub const DATA_HALL_ID: &str = "data_hall";
pub const ZONE_ID: &str = "zoneid";
pub const PROCESS_ID: &str = "processid";

/// Locality of one process, as reported by the worker registration path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Locality {
    attrs: BTreeMap<String, String>,
}

impl Locality {
    pub fn new(
        dc: impl Into<String>,
        data_hall: impl Into<String>,
        zone: impl Into<String>,
        process: impl Into<String>,
    ) -> Self {
        let mut attrs = BTreeMap::new();
        attrs.insert(DCID.to_string(), dc.into());
        attrs.insert(DATA_HALL_ID.to_string(), data_hall.into());
        attrs.insert(ZONE_ID.to_string(), zone.into());
        attrs.insert(PROCESS_ID.to_string(), process.into());
        Locality { attrs }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attrs.insert(key.into(), value.into());
    }

    pub fn dc_id(&self) -> Option<&str> {
        self.get(DCID)
    }

    pub fn data_hall_id(&self) -> Option<&str> {
        self.get(DATA_HALL_ID)
    }

    pub fn zone_id(&self) -> Option<&str> {
        self.get(ZONE_ID)
    }

    pub fn process_id(&self) -> Option<&str> {
        self.get(PROCESS_ID)
    }

    /// Two processes share a machine iff they share a zone.
    pub fn same_machine(&self, other: &Locality) -> bool {
        self.zone_id().is_some() && self.zone_id() == other.zone_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_accessors_read_back_attributes() {
        let loc = Locality::new("dc1", "hallA", "z3", "p9");
        assert_eq!(loc.dc_id(), Some("dc1"));
        assert_eq!(loc.data_hall_id(), Some("hallA"));
        assert_eq!(loc.zone_id(), Some("z3"));
        assert_eq!(loc.process_id(), Some("p9"));
        assert_eq!(loc.get("rack"), None);
    }

    #[test]
    fn same_machine_requires_matching_zone() {
        let a = Locality::new("dc1", "hallA", "z1", "p1");
        let b = Locality::new("dc1", "hallB", "z1", "p2");
        let c = Locality::new("dc1", "hallA", "z2", "p3");
        assert!(a.same_machine(&b));
        assert!(!a.same_machine(&c));
        assert!(!Locality::default().same_machine(&Locality::default()));
    }
}

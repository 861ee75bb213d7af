use parking_lot::RwLock;
use std::collections::HashMap;

use crate::{Error, Member, ResourceMapper};

#[derive(Debug, Default)]
struct Mappings {
    explicit: HashMap<String, Member>,
    default: Option<Member>,
}

/// Resource mapper driven entirely by hand-written assignments.
///
/// Meant for tests and manual overrides. Unlike the hashing mappers it is
/// mutable, so every snapshot that shares it sees updates immediately. An
/// unmapped resource with no default is a fixture mistake and reports
/// [`Error::NoMembersAvailable`].
#[derive(Debug, Default)]
pub struct ExplicitResourceMapper {
    mappings: RwLock<Mappings>,
}

impl ExplicitResourceMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_mapping(&self, resource_id: impl Into<String>, member: Member) {
        self.mappings
            .write()
            .explicit
            .insert(resource_id.into(), member);
    }

    pub fn remove_mapping(&self, resource_id: &str) -> Option<Member> {
        self.mappings.write().explicit.remove(resource_id)
    }

    pub fn set_default_mapping(&self, member: Member) {
        self.mappings.write().default = Some(member);
    }

    pub fn clear_default_mapping(&self) {
        self.mappings.write().default = None;
    }
}

impl ResourceMapper for ExplicitResourceMapper {
    fn owner(&self, resource_id: &str) -> Result<Member, Error> {
        let mappings = self.mappings.read();
        mappings
            .explicit
            .get(resource_id)
            .or(mappings.default.as_ref())
            .cloned()
            .ok_or_else(|| Error::no_members(resource_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_mapping_wins_over_default() {
        let mapper = ExplicitResourceMapper::new();
        let me = Member::new("me", "10.0.0.1");
        let other = Member::new("not-me", "10.0.0.3");

        mapper.set_default_mapping(other.clone());
        mapper.add_mapping("leases/foo", me.clone());

        assert_eq!(mapper.owner("leases/foo").unwrap(), me);
        assert_eq!(mapper.owner("leases/bar").unwrap(), other);

        assert_eq!(mapper.remove_mapping("leases/foo"), Some(me));
        assert_eq!(mapper.owner("leases/foo").unwrap(), other);
    }

    #[test]
    fn test_explicit_unmapped_without_default_fails() {
        let mapper = ExplicitResourceMapper::new();
        mapper.add_mapping("foo", Member::new("me", "10.0.0.1"));

        assert!(mapper.owner("foo").is_ok());
        match mapper.owner("bar") {
            Err(Error::NoMembersAvailable { resource_id }) => assert_eq!(resource_id, "bar"),
            other => panic!("expected NoMembersAvailable, got {:?}", other),
        }
    }

    #[test]
    fn test_explicit_clear_default() {
        let mapper = ExplicitResourceMapper::new();
        mapper.set_default_mapping(Member::new("me", "10.0.0.1"));
        assert!(mapper.owner("anything").is_ok());

        mapper.clear_default_mapping();
        assert!(mapper.owner("anything").is_err());
    }
}

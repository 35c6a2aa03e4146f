//! Capability discovery.
//!
//! The invokable operations of a hosted object are either taken from its own
//! authoritative enumeration or derived by walking its member table.

use std::collections::BTreeSet;

use once_cell::sync::OnceCell;

use crate::core::object::{MemberKind, RemoteObject};
use crate::error::Result;

/// First character of names that are never exposed as capabilities.
pub const PRIVATE_MARKER: char = '_';

pub fn is_private(name: &str) -> bool {
    name.starts_with(PRIVATE_MARKER)
}

/// Sorted, deduplicated capability names of `obj`.
///
/// Without an authoritative enumeration, a member qualifies when it is a
/// public method not tagged "not a capability". Members whose name starts
/// with `metadata_prefix` are listed regardless of their kind.
pub fn enumerate(obj: &dyn RemoteObject, metadata_prefix: &str) -> Vec<String> {
    if let Some(names) = obj.capabilities() {
        return names
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
    }
    obj.members()
        .into_iter()
        .filter(|member| !is_private(&member.name))
        .filter(|member| {
            let marker = !metadata_prefix.is_empty() && member.name.starts_with(metadata_prefix);
            marker || (member.kind == MemberKind::Method && member.capability)
        })
        .map(|member| member.name)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// `remote` joined with operations provided locally, sorted and deduplicated.
pub fn union_with_local(remote: Vec<String>, local: &[&str]) -> Vec<String> {
    remote
        .into_iter()
        .chain(local.iter().map(|name| name.to_string()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Capability list computed at most once.
#[derive(Debug, Default)]
pub struct CapabilityCache {
    names: OnceCell<Vec<String>>,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached list, computing it with `compute` on first use. A failed
    /// computation is not cached.
    pub fn get_or_compute<F>(&self, compute: F) -> Result<Vec<String>>
    where
        F: FnOnce() -> Result<Vec<String>>,
    {
        self.names.get_or_try_init(compute).cloned()
    }

    pub fn is_computed(&self) -> bool {
        self.names.get().is_some()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::object::{Class, Instance};
    use crate::core::value::Value;
    use crate::error::Fault;

    struct Lib;

    fn library() -> std::sync::Arc<Instance<Lib>> {
        let base = Class::<Lib>::builder("test.Base")
            .method("inherited", |_, _| Ok(Value::None))
            .build();
        let class = Class::<Lib>::builder("test.Provider")
            .extends(&base)
            .method("get_answer", |_, _| Ok(Value::Int(42)))
            .method("_private", |_, _| Ok(Value::None))
            .helper("help_method", |_, _| Ok(Value::None))
            .property("value", |_| Ok(Value::Int(1)))
            .constant("answer", 43)
            .constant("ROBOT_LIBRARY_SCOPE", "GLOBAL")
            .build();
        Instance::new(class, Lib)
    }

    #[test]
    fn test_member_walk_filters() {
        let obj = library();
        assert_eq!(
            enumerate(obj.as_ref(), "ROBOT_LIBRARY_"),
            vec!["ROBOT_LIBRARY_SCOPE", "get_answer", "inherited"]
        );
    }

    #[test]
    fn test_authoritative_enumeration_wins() {
        let class = Class::<Lib>::builder("test.Dynamic")
            .method("ignored", |_, _| Ok(Value::None))
            .enumerate_with(|_| vec!["b".into(), "a".into(), "b".into()])
            .build();
        let obj = Instance::new(class, Lib);
        assert_eq!(enumerate(obj.as_ref(), "ROBOT_LIBRARY_"), vec!["a", "b"]);
    }

    #[test]
    fn test_union_with_local() {
        let names = union_with_local(
            vec!["stop_remote_server".into(), "add".into()],
            &["remote_eval", "stop_remote_server"],
        );
        assert_eq!(names, vec!["add", "remote_eval", "stop_remote_server"]);
    }

    #[test]
    fn test_cache_computes_once_and_skips_failures() {
        let cache = CapabilityCache::new();
        assert!(cache
            .get_or_compute(|| Err(Fault::connection("down")))
            .is_err());
        assert!(!cache.is_computed());
        let mut calls = 0;
        for _ in 0..3 {
            let names = cache
                .get_or_compute(|| {
                    calls += 1;
                    Ok(vec!["x".into()])
                })
                .unwrap();
            assert_eq!(names, vec!["x"]);
        }
        assert_eq!(calls, 1);
    }
}

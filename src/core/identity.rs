//! # Object Identity
//!
//! An [`IdPack`] names one remote-capable object stably within a session:
//! `(qualified type name, type identity, instance identity)`.
//!
//! [`compute_id_pack`] is total. Identity sits on every value that crosses
//! the boundary by reference, so objects with missing metadata degrade to a
//! placeholder identity instead of failing the call.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::core::object::Identity;
use crate::core::value::ObjectRef;

/// Type name used for objects that carry no usable metadata.
pub const OPAQUE_TYPE_NAME: &str = "<opaque>";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdPack {
    pub name: String,
    pub type_id: u64,
    pub instance_id: u64,
}

impl IdPack {
    pub fn new(name: impl Into<String>, type_id: u64, instance_id: u64) -> Self {
        Self {
            name: name.into(),
            type_id,
            instance_id,
        }
    }
}

impl fmt::Display for IdPack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{:x}@{:x}",
            self.name, self.type_id, self.instance_id
        )
    }
}

/// Process-wide registry of namespace names, the counterpart of a runtime's
/// module table. A registered namespace is identified by its bare name.
static NAMESPACES: Lazy<RwLock<HashMap<String, u64>>> = Lazy::new(|| RwLock::new(HashMap::new()));

/// Register `obj` under `name` so its identity uses the bare registry name.
pub fn register_namespace(name: impl Into<String>, obj: &ObjectRef) {
    if let Ok(mut names) = NAMESPACES.write() {
        names.insert(name.into(), instance_identity(obj));
    }
}

pub fn unregister_namespace(name: &str) {
    if let Ok(mut names) = NAMESPACES.write() {
        names.remove(name);
    }
}

fn registered_as(name: &str, instance_id: u64) -> bool {
    NAMESPACES
        .read()
        .map(|names| names.get(name) == Some(&instance_id))
        .unwrap_or(false)
}

/// Address of the shared allocation. Stable for as long as the object lives.
pub fn instance_identity(obj: &ObjectRef) -> u64 {
    Arc::as_ptr(obj) as *const () as usize as u64
}

/// Stable hash of the concrete type behind the trait object.
pub fn type_identity(obj: &ObjectRef) -> u64 {
    // method syntax dispatches through the vtable to the concrete type
    let type_id = (**obj).type_id();
    let mut hasher = DefaultHasher::new();
    type_id.hash(&mut hasher);
    hasher.finish()
}

/// Compute the identity of `obj`. Never fails.
pub fn compute_id_pack(obj: &ObjectRef) -> IdPack {
    // proxies first: chained connections reuse the embedded identity
    if let Some(proxy) = obj.as_proxy() {
        return proxy.id_pack().clone();
    }

    let instance_id = instance_identity(obj);
    let type_name = obj.type_name();

    match obj.identity() {
        _ if type_name.is_empty() => IdPack::new(OPAQUE_TYPE_NAME, 0, instance_id),
        Identity::Opaque => IdPack::new(OPAQUE_TYPE_NAME, 0, instance_id),
        Identity::Namespace(name) => {
            let qualified = if registered_as(&name, instance_id) {
                name
            } else {
                format!("{type_name}.{name}")
            };
            IdPack::new(qualified, type_identity(obj), instance_id)
        }
        Identity::Instance => IdPack::new(type_name, type_identity(obj), instance_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::object::RemoteObject;
    use crate::core::value::Value;
    use crate::error::{Fault, Result};

    struct Plain(&'static str, Identity);

    impl RemoteObject for Plain {
        fn type_name(&self) -> &str {
            self.0
        }

        fn identity(&self) -> Identity {
            self.1.clone()
        }

        fn get_attr(&self, name: &str) -> Result<Value> {
            Err(Fault::attribute(self.0, name))
        }
    }

    fn obj(name: &'static str, identity: Identity) -> ObjectRef {
        Arc::new(Plain(name, identity))
    }

    #[test]
    fn test_instance_identity_is_stable() {
        let a = obj("pkg.Thing", Identity::Instance);
        let first = compute_id_pack(&a);
        let second = compute_id_pack(&a.clone());
        assert_eq!(first, second);
        assert_eq!(first.name, "pkg.Thing");
        assert_ne!(first.type_id, 0);
    }

    #[test]
    fn test_distinct_instances_differ() {
        let a = obj("pkg.Thing", Identity::Instance);
        let b = obj("pkg.Thing", Identity::Instance);
        let (ida, idb) = (compute_id_pack(&a), compute_id_pack(&b));
        assert_eq!(ida.type_id, idb.type_id);
        assert_ne!(ida, idb);
    }

    #[test]
    fn test_missing_metadata_falls_back() {
        let nameless = obj("", Identity::Instance);
        let opaque = obj("pkg.Hidden", Identity::Opaque);
        assert_eq!(compute_id_pack(&nameless).name, OPAQUE_TYPE_NAME);
        assert_eq!(compute_id_pack(&opaque).type_id, 0);
    }

    #[test]
    fn test_namespace_prefers_registry_name() {
        let module = obj("module", Identity::Namespace("helpers".into()));
        assert_eq!(compute_id_pack(&module).name, "module.helpers");

        register_namespace("helpers", &module);
        assert_eq!(compute_id_pack(&module).name, "helpers");

        // a different object claiming the same name is not the registered one
        let impostor = obj("module", Identity::Namespace("helpers".into()));
        assert_eq!(compute_id_pack(&impostor).name, "module.helpers");

        unregister_namespace("helpers");
        assert_eq!(compute_id_pack(&module).name, "module.helpers");
    }
}

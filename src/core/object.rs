//! Hosted object model.
//!
//! [`RemoteObject`] is the seam between the protocol and user code: anything
//! that can be reached through a proxy implements it, including proxies
//! themselves.
//!
//! Most hosted types do not implement the trait by hand. They describe their
//! operations once in a [`Class`] table (methods, properties, constants, with
//! optional inheritance and a per-member capability tag) and wrap their state
//! in an [`Instance`]. Dispatch then looks names up in that table instead of
//! reflecting on the object for every call.
//!
//! ```rust
//! use remote_object::core::object::{Class, Instance, RemoteObject};
//! use remote_object::core::value::{Args, Value};
//!
//! struct Calculator;
//!
//! let class = Class::<Calculator>::builder("demo.Calculator")
//!     .method("add", |_, args: Args| Ok(Value::Int(args.int(0, "a")? + args.int(1, "b")?)))
//!     .build();
//! let calc = Instance::new(class, Calculator);
//! let sum = calc.invoke("add", Args::new(vec![2.into(), 3.into()])).ok();
//! assert_eq!(sum, Some(Value::Int(5)));
//! ```

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};

use crate::core::value::{Args, ObjectRef, Value};
use crate::error::{constants, Fault, Phase, Result};
use crate::protocol::registry::Proxy;

/// How an object wants to be identified when it crosses by reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// Ordinary instance: identified by its type and its allocation
    Instance,
    /// Namespace/module-like object carrying its own name
    Namespace(String),
    /// No usable metadata; identified by a placeholder and its allocation
    Opaque,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Method,
    Property,
    Constant,
}

/// One entry of an object's member listing, as seen by capability discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub name: String,
    pub kind: MemberKind,
    /// `false` when the member is explicitly tagged "not a capability"
    pub capability: bool,
}

/// An object that can be hosted and reached by reference from a peer.
pub trait RemoteObject: Any + Send + Sync {
    /// Qualified type name, e.g. `provider.Provider`.
    fn type_name(&self) -> &str;

    fn identity(&self) -> Identity {
        Identity::Instance
    }

    fn get_attr(&self, name: &str) -> Result<Value>;

    fn set_attr(&self, name: &str, _value: Value) -> Result<()> {
        Err(Fault::attribute(self.type_name(), name))
    }

    fn del_attr(&self, name: &str) -> Result<()> {
        Err(Fault::attribute(self.type_name(), name))
    }

    fn is_callable(&self) -> bool {
        false
    }

    fn call(&self, _args: Args) -> Result<Value> {
        Err(Fault::raised(
            Phase::Call,
            "TypeError",
            format!("'{}' {}", self.type_name(), constants::ERR_NOT_CALLABLE),
        ))
    }

    /// Resolve `name` and call it. Lookup failures keep their lookup phase,
    /// failures of the call itself are reported in the call phase.
    fn invoke(&self, name: &str, args: Args) -> Result<Value> {
        let target = self
            .get_attr(name)
            .map_err(|fault| fault.in_phase(Phase::Lookup))?;
        match target {
            Value::Object(obj) => obj.call(args).map_err(|fault| fault.raised_in(Phase::Call)),
            other => Err(Fault::raised(
                Phase::Call,
                "TypeError",
                format!("'{}' {}", other.type_label(), constants::ERR_NOT_CALLABLE),
            )),
        }
    }

    /// Own and inherited members.
    fn members(&self) -> Vec<MemberInfo> {
        Vec::new()
    }

    /// Authoritative capability enumeration, when the object provides one.
    fn capabilities(&self) -> Option<Vec<String>> {
        None
    }

    fn doc(&self) -> Option<String> {
        None
    }

    fn as_proxy(&self) -> Option<&Proxy> {
        None
    }
}

type MethodFn<T> = Arc<dyn Fn(&T, Args) -> Result<Value> + Send + Sync>;
type GetterFn<T> = Arc<dyn Fn(&T) -> Result<Value> + Send + Sync>;
type SetterFn<T> = Arc<dyn Fn(&T, Value) -> Result<()> + Send + Sync>;
type EnumerateFn<T> = Arc<dyn Fn(&T) -> Vec<String> + Send + Sync>;

enum Member<T> {
    Method(MethodFn<T>),
    Property {
        get: GetterFn<T>,
        set: Option<SetterFn<T>>,
    },
    Constant(Value),
}

struct MemberDef<T> {
    member: Member<T>,
    capability: bool,
    doc: Option<String>,
}

impl<T> MemberDef<T> {
    fn kind(&self) -> MemberKind {
        match self.member {
            Member::Method(_) => MemberKind::Method,
            Member::Property { .. } => MemberKind::Property,
            Member::Constant(_) => MemberKind::Constant,
        }
    }
}

/// Member table of a hosted type, built once and shared by all instances.
pub struct Class<T> {
    name: String,
    doc: Option<String>,
    identity: Identity,
    members: BTreeMap<String, MemberDef<T>>,
    enumerate: Option<EnumerateFn<T>>,
    base: Option<Arc<Class<T>>>,
}

impl<T: Send + Sync + 'static> Class<T> {
    pub fn builder(name: impl Into<String>) -> ClassBuilder<T> {
        ClassBuilder {
            class: Class {
                name: name.into(),
                doc: None,
                identity: Identity::Instance,
                members: BTreeMap::new(),
                enumerate: None,
                base: None,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lookup(&self, name: &str) -> Option<&MemberDef<T>> {
        self.members
            .get(name)
            .or_else(|| self.base.as_ref().and_then(|base| base.lookup(name)))
    }

    fn enumerate_fn(&self) -> Option<&EnumerateFn<T>> {
        self.enumerate
            .as_ref()
            .or_else(|| self.base.as_ref().and_then(|base| base.enumerate_fn()))
    }

    /// Own and inherited members sorted by name; a subclass entry shadows its base.
    pub fn member_infos(&self) -> Vec<MemberInfo> {
        let mut seen: BTreeMap<&str, MemberInfo> = BTreeMap::new();
        let mut class = Some(self);
        while let Some(current) = class {
            for (name, def) in &current.members {
                seen.entry(name.as_str()).or_insert_with(|| MemberInfo {
                    name: name.clone(),
                    kind: def.kind(),
                    capability: def.capability,
                });
            }
            class = current.base.as_deref();
        }
        seen.into_values().collect()
    }
}

pub struct ClassBuilder<T> {
    class: Class<T>,
}

impl<T: Send + Sync + 'static> ClassBuilder<T> {
    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.class.doc = Some(doc.into());
        self
    }

    /// Mark instances as namespace-like; they are identified by `name`.
    pub fn namespace(mut self, name: impl Into<String>) -> Self {
        self.class.identity = Identity::Namespace(name.into());
        self
    }

    /// Inherit every member of `base` that this class does not redefine.
    pub fn extends(mut self, base: &Arc<Class<T>>) -> Self {
        self.class.base = Some(base.clone());
        self
    }

    pub fn method<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&T, Args) -> Result<Value> + Send + Sync + 'static,
    {
        self.insert(name, Member::Method(Arc::new(f)), true)
    }

    /// A public method that is explicitly not a capability.
    pub fn helper<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&T, Args) -> Result<Value> + Send + Sync + 'static,
    {
        self.insert(name, Member::Method(Arc::new(f)), false)
    }

    pub fn property<G>(self, name: impl Into<String>, get: G) -> Self
    where
        G: Fn(&T) -> Result<Value> + Send + Sync + 'static,
    {
        let member = Member::Property {
            get: Arc::new(get),
            set: None,
        };
        self.insert(name, member, true)
    }

    pub fn property_rw<G, S>(self, name: impl Into<String>, get: G, set: S) -> Self
    where
        G: Fn(&T) -> Result<Value> + Send + Sync + 'static,
        S: Fn(&T, Value) -> Result<()> + Send + Sync + 'static,
    {
        let member = Member::Property {
            get: Arc::new(get),
            set: Some(Arc::new(set)),
        };
        self.insert(name, member, true)
    }

    pub fn constant(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, Member::Constant(value.into()), true)
    }

    /// Attach a documentation string to an already added member.
    pub fn with_doc(mut self, name: &str, doc: impl Into<String>) -> Self {
        if let Some(def) = self.class.members.get_mut(name) {
            def.doc = Some(doc.into());
        }
        self
    }

    /// Authoritative capability enumeration, replacing the member walk.
    pub fn enumerate_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&T) -> Vec<String> + Send + Sync + 'static,
    {
        self.class.enumerate = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Arc<Class<T>> {
        Arc::new(self.class)
    }

    fn insert(mut self, name: impl Into<String>, member: Member<T>, capability: bool) -> Self {
        self.class.members.insert(
            name.into(),
            MemberDef {
                member,
                capability,
                doc: None,
            },
        );
        self
    }
}

/// Hosted state `T` bound to its member table.
pub struct Instance<T> {
    class: Arc<Class<T>>,
    state: T,
    dynamic: Mutex<HashMap<String, Value>>,
    this: Weak<Instance<T>>,
}

impl<T: Send + Sync + 'static> Instance<T> {
    pub fn new(class: Arc<Class<T>>, state: T) -> Arc<Self> {
        Arc::new_cyclic(|this| Instance {
            class,
            state,
            dynamic: Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    pub fn state(&self) -> &T {
        &self.state
    }

    pub fn class(&self) -> &Arc<Class<T>> {
        &self.class
    }

    fn dynamic_attr(&self, name: &str) -> Option<Value> {
        self.dynamic.lock().ok()?.get(name).cloned()
    }
}

impl<T: Send + Sync + 'static> RemoteObject for Instance<T> {
    fn type_name(&self) -> &str {
        &self.class.name
    }

    fn identity(&self) -> Identity {
        self.class.identity.clone()
    }

    fn get_attr(&self, name: &str) -> Result<Value> {
        if let Some(value) = self.dynamic_attr(name) {
            return Ok(value);
        }
        let def = self
            .class
            .lookup(name)
            .ok_or_else(|| Fault::attribute(self.type_name(), name))?;
        match &def.member {
            Member::Method(f) => {
                let instance = self
                    .this
                    .upgrade()
                    .ok_or_else(|| Fault::attribute(self.type_name(), name))?;
                Ok(Value::Object(Arc::new(BoundMethod {
                    instance,
                    name: name.to_string(),
                    func: f.clone(),
                    doc: def.doc.clone(),
                })))
            }
            Member::Property { get, .. } => {
                get(&self.state).map_err(|fault| fault.raised_in(Phase::Lookup))
            }
            Member::Constant(value) => Ok(value.clone()),
        }
    }

    fn set_attr(&self, name: &str, value: Value) -> Result<()> {
        match self.class.lookup(name).map(|def| &def.member) {
            Some(Member::Property { set: Some(set), .. }) => {
                set(&self.state, value).map_err(|fault| fault.raised_in(Phase::Call))
            }
            Some(Member::Property { set: None, .. }) => Err(Fault::raised(
                Phase::Call,
                "AttributeError",
                format!("property '{name}' of '{}' has no setter", self.type_name()),
            )),
            _ => {
                self.dynamic.lock()?.insert(name.to_string(), value);
                Ok(())
            }
        }
    }

    fn del_attr(&self, name: &str) -> Result<()> {
        match self.dynamic.lock()?.remove(name) {
            Some(_) => Ok(()),
            None => Err(Fault::attribute(self.type_name(), name)),
        }
    }

    fn invoke(&self, name: &str, args: Args) -> Result<Value> {
        match self.class.lookup(name).map(|def| &def.member) {
            Some(Member::Method(f)) if self.dynamic_attr(name).is_none() => {
                f(&self.state, args).map_err(|fault| fault.raised_in(Phase::Call))
            }
            _ => {
                let target = self
                    .get_attr(name)
                    .map_err(|fault| fault.in_phase(Phase::Lookup))?;
                match target {
                    Value::Object(obj) => {
                        obj.call(args).map_err(|fault| fault.raised_in(Phase::Call))
                    }
                    other => Err(Fault::raised(
                        Phase::Call,
                        "TypeError",
                        format!("'{}' {}", other.type_label(), constants::ERR_NOT_CALLABLE),
                    )),
                }
            }
        }
    }

    fn members(&self) -> Vec<MemberInfo> {
        self.class.member_infos()
    }

    fn capabilities(&self) -> Option<Vec<String>> {
        self.class.enumerate_fn().map(|f| f(&self.state))
    }

    fn doc(&self) -> Option<String> {
        self.class.doc.clone()
    }
}

/// A method of an [`Instance`] resolved by attribute access.
struct BoundMethod<T> {
    instance: Arc<Instance<T>>,
    name: String,
    func: MethodFn<T>,
    doc: Option<String>,
}

impl<T: Send + Sync + 'static> RemoteObject for BoundMethod<T> {
    fn type_name(&self) -> &str {
        "method"
    }

    fn get_attr(&self, name: &str) -> Result<Value> {
        match name {
            "__name__" => Ok(Value::Str(self.name.clone())),
            "__self__" => Ok(Value::Object(self.instance.clone() as ObjectRef)),
            _ => Err(Fault::attribute(self.type_name(), name)),
        }
    }

    fn is_callable(&self) -> bool {
        true
    }

    fn call(&self, args: Args) -> Result<Value> {
        (self.func)(&self.instance.state, args).map_err(|fault| fault.raised_in(Phase::Call))
    }

    fn doc(&self) -> Option<String> {
        self.doc.clone()
    }
}

/// Free-standing callable built from a closure.
pub struct Function {
    name: String,
    func: Box<dyn Fn(Args) -> Result<Value> + Send + Sync>,
}

impl Function {
    pub fn new<F>(name: impl Into<String>, func: F) -> Arc<Self>
    where
        F: Fn(Args) -> Result<Value> + Send + Sync + 'static,
    {
        Arc::new(Function {
            name: name.into(),
            func: Box::new(func),
        })
    }
}

impl RemoteObject for Function {
    fn type_name(&self) -> &str {
        "function"
    }

    fn get_attr(&self, name: &str) -> Result<Value> {
        match name {
            "__name__" => Ok(Value::Str(self.name.clone())),
            _ => Err(Fault::attribute(self.type_name(), name)),
        }
    }

    fn is_callable(&self) -> bool {
        true
    }

    fn call(&self, args: Args) -> Result<Value> {
        (self.func)(args).map_err(|fault| fault.raised_in(Phase::Call))
    }
}

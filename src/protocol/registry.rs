//! # Reference Registry
//!
//! Both halves of reference tracking for one connection.
//!
//! - [`LocalObjectTable`]: objects this side has handed out by reference,
//!   each with the number of references the peer holds. An entry keeps its
//!   object alive until the peer's count drops to zero.
//! - [`ProxyRegistry`]: proxies this side holds for the peer's objects, at
//!   most one live [`Proxy`] per [`IdPack`]. Each decode of the same
//!   reference bumps the proxy's count; dropping the last handle queues one
//!   decref for the full count.
//!
//! ## Release path
//! `Drop for Proxy` can run on any thread, including while the connection is
//! mid-request. It never blocks: the cache lock is only tried, and the decref
//! goes onto an unbounded channel that the connection drains before its next
//! outgoing message.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc, Mutex, Weak};

use tracing::{debug, trace};

use crate::core::identity::{compute_id_pack, IdPack};
use crate::core::object::RemoteObject;
use crate::core::value::{Args, ObjectRef, Value};
use crate::error::constants::{ERR_CONNECTION_CLOSED, ERR_UNKNOWN_LOCAL_REF};
use crate::error::{Fault, Result};
use crate::protocol::connection::{ConnInner, Connection};
use crate::protocol::message::{Request, Target};

struct LocalEntry {
    obj: ObjectRef,
    refs: u32,
}

/// Objects owned by this side and referenced by the peer.
#[derive(Default)]
pub struct LocalObjectTable {
    entries: Mutex<HashMap<IdPack, LocalEntry>>,
}

impl LocalObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one more peer reference to `obj` and return its identity.
    pub fn register(&self, obj: &ObjectRef) -> Result<IdPack> {
        let id_pack = compute_id_pack(obj);
        let mut entries = self.entries.lock()?;
        entries
            .entry(id_pack.clone())
            .and_modify(|entry| entry.refs += 1)
            .or_insert_with(|| LocalEntry {
                obj: obj.clone(),
                refs: 1,
            });
        Ok(id_pack)
    }

    pub fn get(&self, id_pack: &IdPack) -> Result<ObjectRef> {
        self.entries
            .lock()?
            .get(id_pack)
            .map(|entry| entry.obj.clone())
            .ok_or_else(|| Fault::Protocol(format!("{ERR_UNKNOWN_LOCAL_REF}: {id_pack}")))
    }

    /// Subtract `count` peer references. Returns `true` when the entry was
    /// removed.
    pub fn release(&self, id_pack: &IdPack, count: u32) -> Result<bool> {
        let removed = {
            let mut entries = self.entries.lock()?;
            match entries.get_mut(id_pack) {
                Some(entry) if entry.refs > count => {
                    entry.refs -= count;
                    None
                }
                Some(_) => entries.remove(id_pack),
                None => {
                    debug!(%id_pack, "decref for unknown local object ignored");
                    return Ok(false);
                }
            }
        };
        // the object is dropped outside the lock
        Ok(removed.is_some())
    }

    pub fn refs(&self, id_pack: &IdPack) -> Option<u32> {
        self.entries.lock().ok()?.get(id_pack).map(|entry| entry.refs)
    }

    pub fn contains(&self, id_pack: &IdPack) -> bool {
        self.refs(id_pack).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let drained: Vec<LocalEntry> = match self.entries.lock() {
            Ok(mut entries) => entries.drain().map(|(_, entry)| entry).collect(),
            Err(_) => return,
        };
        drop(drained);
    }
}

/// Proxies held for the peer's objects.
pub struct ProxyRegistry {
    conn_id: u64,
    conn: Weak<ConnInner>,
    cache: Mutex<HashMap<IdPack, Weak<Proxy>>>,
    decref_tx: mpsc::Sender<(IdPack, u32)>,
    decref_rx: Mutex<mpsc::Receiver<(IdPack, u32)>>,
}

impl ProxyRegistry {
    pub(crate) fn new(conn_id: u64, conn: Weak<ConnInner>) -> Self {
        let (decref_tx, decref_rx) = mpsc::channel();
        Self {
            conn_id,
            conn,
            cache: Mutex::new(HashMap::new()),
            decref_tx,
            decref_rx: Mutex::new(decref_rx),
        }
    }

    /// Registry that is not attached to a live connection. Proxies it creates
    /// still queue their decrefs, but cannot forward operations.
    pub fn detached(conn_id: u64) -> Self {
        Self::new(conn_id, Weak::new())
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Return the live proxy for `id_pack`, bumping its count, or create it.
    /// The flag reports whether a new proxy was created.
    pub fn get_or_create(&self, id_pack: IdPack, callable: bool) -> Result<(Arc<Proxy>, bool)> {
        let mut cache = self.cache.lock()?;
        if let Some(proxy) = cache.get(&id_pack).and_then(Weak::upgrade) {
            proxy.refcount.fetch_add(1, Ordering::AcqRel);
            return Ok((proxy, false));
        }
        let proxy = Arc::new(Proxy {
            id_pack: id_pack.clone(),
            callable,
            refcount: AtomicU32::new(1),
            conn_id: self.conn_id,
            conn: self.conn.clone(),
            release: self.decref_tx.clone(),
        });
        trace!(%id_pack, "proxy created");
        cache.insert(id_pack, Arc::downgrade(&proxy));
        Ok((proxy, true))
    }

    /// Live proxy for `id_pack`, if any, without touching its count.
    pub fn lookup(&self, id_pack: &IdPack) -> Option<Arc<Proxy>> {
        self.cache.lock().ok()?.get(id_pack).and_then(Weak::upgrade)
    }

    pub fn live_count(&self) -> usize {
        self.cache
            .lock()
            .map(|cache| cache.values().filter(|w| w.strong_count() > 0).count())
            .unwrap_or(0)
    }

    /// Drop the cache entry of a dying proxy unless it was already replaced.
    fn forget(&self, id_pack: &IdPack, dying: *const Proxy) {
        // try_lock: a proxy may die while this thread holds the cache
        if let Ok(mut cache) = self.cache.try_lock() {
            if cache
                .get(id_pack)
                .is_some_and(|weak| Weak::as_ptr(weak) == dying)
            {
                cache.remove(id_pack);
            }
        }
    }

    /// Take every queued decref, coalesced per identity.
    pub fn drain_decrefs(&self) -> Vec<(IdPack, u32)> {
        let Ok(rx) = self.decref_rx.lock() else {
            return Vec::new();
        };
        let mut merged: BTreeMap<IdPack, u32> = BTreeMap::new();
        while let Ok((id_pack, count)) = rx.try_recv() {
            *merged.entry(id_pack).or_insert(0) += count;
        }
        merged.into_iter().collect()
    }
}

/// Stand-in for an object living on the peer.
pub struct Proxy {
    id_pack: IdPack,
    callable: bool,
    refcount: AtomicU32,
    conn_id: u64,
    conn: Weak<ConnInner>,
    release: mpsc::Sender<(IdPack, u32)>,
}

impl Proxy {
    pub fn id_pack(&self) -> &IdPack {
        &self.id_pack
    }

    /// References the peer has handed us for this object.
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    fn connection(&self) -> Result<Connection> {
        self.conn
            .upgrade()
            .map(Connection::from_inner)
            .ok_or_else(|| Fault::connection(ERR_CONNECTION_CLOSED))
    }

    fn target(&self) -> Target {
        Target::Object(self.id_pack.clone())
    }

    fn request(&self, request: Request) -> Result<Value> {
        self.connection()?.request(request)
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("id_pack", &self.id_pack)
            .field("refcount", &self.refcount())
            .field("conn_id", &self.conn_id)
            .finish()
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        let count = *self.refcount.get_mut();
        if let Some(inner) = self.conn.upgrade() {
            inner.proxies.forget(&self.id_pack, self as *const Proxy);
        }
        if count > 0 {
            // receiver gone means the connection is gone; nothing to release
            let _ = self.release.send((self.id_pack.clone(), count));
        }
    }
}

impl RemoteObject for Proxy {
    fn type_name(&self) -> &str {
        &self.id_pack.name
    }

    fn get_attr(&self, name: &str) -> Result<Value> {
        self.request(Request::GetAttr {
            target: self.target(),
            name: name.to_string(),
        })
    }

    fn set_attr(&self, name: &str, value: Value) -> Result<()> {
        let conn = self.connection()?;
        let value = conn.boxer().box_value(&value)?;
        conn.request(Request::SetAttr {
            target: self.target(),
            name: name.to_string(),
            value,
        })
        .map(drop)
    }

    fn del_attr(&self, name: &str) -> Result<()> {
        self.request(Request::DelAttr {
            target: self.target(),
            name: name.to_string(),
        })
        .map(drop)
    }

    fn is_callable(&self) -> bool {
        self.callable
    }

    fn call(&self, args: Args) -> Result<Value> {
        let conn = self.connection()?;
        let (args, kwargs) = conn.boxer().box_args(&args)?;
        conn.request(Request::Call {
            target: self.target(),
            args,
            kwargs,
        })
    }

    fn invoke(&self, name: &str, args: Args) -> Result<Value> {
        let conn = self.connection()?;
        let (args, kwargs) = conn.boxer().box_args(&args)?;
        conn.request(Request::Invoke {
            target: self.target(),
            name: name.to_string(),
            args,
            kwargs,
        })
    }

    fn capabilities(&self) -> Option<Vec<String>> {
        let names = self
            .request(Request::Capabilities {
                target: self.target(),
            })
            .ok()?;
        Some(
            names
                .as_tuple()?
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        )
    }

    fn doc(&self) -> Option<String> {
        self.request(Request::Doc {
            target: self.target(),
        })
        .ok()?
        .as_str()
        .map(str::to_string)
    }

    fn as_proxy(&self) -> Option<&Proxy> {
        Some(self)
    }
}

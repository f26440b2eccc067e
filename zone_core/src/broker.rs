//! Component Broker, §4.1. A rooted tree of broker nodes: one global root,
//! each arena a child node whose `parent` points back to the root.
//!
//! Three orthogonal services share one node: interfaces (service locator,
//! refcounted), callbacks (pub/sub, registration-order dispatch), and
//! advisors (read-mostly opinion collections, snapshot reads).

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::BrokerError;

#[derive(Clone, PartialEq, Eq, Hash)]
struct InterfaceKey(TypeId, Option<String>);

struct InterfaceEntry {
    instance: Arc<dyn Any + Send + Sync>,
    refcount: AtomicUsize,
}

/// Opaque token returned by [`ComponentBroker::register_interface`]; required
/// to unregister.
#[derive(Clone)]
pub struct InterfaceHandle {
    key: InterfaceKey,
}

type CallbackList<E> = Arc<Mutex<Vec<(u64, Arc<dyn Fn(&E) + Send + Sync>)>>>;
type AdvisorList<T> = Arc<Mutex<Vec<(u64, Arc<T>)>>>;

/// Opaque token returned by [`ComponentBroker::register_callback`].
pub struct CallbackHandle<E> {
    id: u64,
    _marker: std::marker::PhantomData<fn(&E)>,
}

/// Opaque token returned by [`ComponentBroker::register_advisor`].
pub struct AdvisorHandle<T> {
    id: u64,
    _marker: std::marker::PhantomData<fn() -> T>,
}

struct Inner {
    parent: Option<ComponentBroker>,
    interfaces: Mutex<HashMap<InterfaceKey, InterfaceEntry>>,
    callbacks: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
    advisors: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
    next_id: AtomicU64,
}

/// A node in the broker tree. Cheaply `Clone`-able (an `Arc` handle); the
/// global root and every arena broker share this type.
#[derive(Clone)]
pub struct ComponentBroker {
    inner: Arc<Inner>,
}

impl ComponentBroker {
    /// Creates the process-wide global root (no parent).
    pub fn new_root() -> Self {
        Self::new(None)
    }

    /// Creates an arena-scoped child node whose interface/advisor lookups
    /// fall through to this node.
    pub fn new_child(&self) -> Self {
        Self::new(Some(self.clone()))
    }

    fn new(parent: Option<ComponentBroker>) -> Self {
        Self {
            inner: Arc::new(Inner {
                parent,
                interfaces: Mutex::new(HashMap::new()),
                callbacks: Mutex::new(HashMap::new()),
                advisors: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn parent(&self) -> Option<ComponentBroker> {
        self.inner.parent.clone()
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    // ---- Interfaces -----------------------------------------------------

    /// Registers `instance` under the optional `name`. Fails if an instance
    /// of the same type and name is already registered on this node.
    pub fn register_interface<T: Any + Send + Sync + 'static>(
        &self,
        name: Option<&str>,
        instance: Arc<T>,
    ) -> Result<InterfaceHandle, BrokerError> {
        let key = InterfaceKey(TypeId::of::<T>(), name.map(String::from));
        let mut interfaces = self.inner.interfaces.lock();
        if interfaces.contains_key(&key) {
            return Err(BrokerError::DuplicateName(
                name.unwrap_or("<unnamed>").to_string(),
            ));
        }
        interfaces.insert(
            key.clone(),
            InterfaceEntry {
                instance: instance as Arc<dyn Any + Send + Sync>,
                refcount: AtomicUsize::new(0),
            },
        );
        Ok(InterfaceHandle { key })
    }

    /// Resolves an interface on this node, then its parent chain, taking a
    /// refcount on the matching entry.
    pub fn get_interface<T: Any + Send + Sync + 'static>(&self, name: Option<&str>) -> Option<Arc<T>> {
        let key = InterfaceKey(TypeId::of::<T>(), name.map(String::from));
        let mut cur = self.clone();
        loop {
            {
                let interfaces = cur.inner.interfaces.lock();
                if let Some(entry) = interfaces.get(&key) {
                    entry.refcount.fetch_add(1, Ordering::SeqCst);
                    if let Ok(typed) = entry.instance.clone().downcast::<T>() {
                        return Some(typed);
                    }
                }
            }
            cur = match cur.parent() {
                Some(p) => p,
                None => return None,
            };
        }
    }

    /// Releases a refcount taken by `get_interface`, searching the same
    /// node-then-parent chain.
    pub fn release_interface<T: Any + Send + Sync + 'static>(&self, name: Option<&str>) {
        let key = InterfaceKey(TypeId::of::<T>(), name.map(String::from));
        let mut cur = self.clone();
        loop {
            {
                let interfaces = cur.inner.interfaces.lock();
                if let Some(entry) = interfaces.get(&key) {
                    entry
                        .refcount
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                            Some(c.saturating_sub(1))
                        })
                        .ok();
                    return;
                }
            }
            cur = match cur.parent() {
                Some(p) => p,
                None => return,
            };
        }
    }

    /// Unregisters an interface on this node. Fails with `Busy` if its
    /// refcount has not returned to zero.
    pub fn unregister_interface(&self, handle: InterfaceHandle) -> Result<(), BrokerError> {
        let mut interfaces = self.inner.interfaces.lock();
        let refcount = interfaces
            .get(&handle.key)
            .map(|e| e.refcount.load(Ordering::SeqCst))
            .unwrap_or(0);
        if refcount > 0 {
            return Err(BrokerError::Busy { refcount });
        }
        interfaces.remove(&handle.key);
        Ok(())
    }

    // ---- Callbacks --------------------------------------------------------

    fn callback_list<E: 'static>(&self) -> CallbackList<E> {
        let mut callbacks = self.inner.callbacks.lock();
        callbacks
            .entry(TypeId::of::<E>())
            .or_insert_with(|| Box::new(CallbackList::<E>::new(Mutex::new(Vec::new()))))
            .downcast_ref::<CallbackList<E>>()
            .expect("callback list type mismatch for TypeId")
            .clone()
    }

    /// Registers a handler, appended after any already registered for `E` on
    /// this node.
    pub fn register_callback<E: 'static, F>(&self, handler: F) -> CallbackHandle<E>
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.callback_list::<E>().lock().push((id, Arc::new(handler)));
        CallbackHandle {
            id,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn unregister_callback<E: 'static>(&self, handle: CallbackHandle<E>) {
        self.callback_list::<E>().lock().retain(|(id, _)| *id != handle.id);
    }

    /// Fires `event` to handlers registered on this node only — per §4.1,
    /// an arena fire does not reach global handlers and vice versa. Takes a
    /// snapshot at entry so a handler that unregisters mid-fire still sees
    /// every handler present when `fire` began (open-question decision,
    /// see DESIGN.md).
    pub fn fire<E: 'static>(&self, event: &E) {
        let snapshot: Vec<_> = self.callback_list::<E>().lock().clone();
        for (_, handler) in snapshot {
            handler(event);
        }
    }

    // ---- Advisors -----------------------------------------------------

    fn advisor_list<T: Any + Send + Sync + 'static>(&self) -> AdvisorList<T> {
        let mut advisors = self.inner.advisors.lock();
        advisors
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(AdvisorList::<T>::new(Mutex::new(Vec::new()))))
            .downcast_ref::<AdvisorList<T>>()
            .expect("advisor list type mismatch for TypeId")
            .clone()
    }

    pub fn register_advisor<T: Any + Send + Sync + 'static>(&self, advisor: Arc<T>) -> AdvisorHandle<T> {
        let id = self.next_id();
        self.advisor_list::<T>().lock().push((id, advisor));
        AdvisorHandle {
            id,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn unregister_advisor<T: Any + Send + Sync + 'static>(&self, handle: AdvisorHandle<T>) {
        self.advisor_list::<T>().lock().retain(|(id, _)| *id != handle.id);
    }

    /// Returns an immutable snapshot of advisors registered on this node and
    /// all ancestors, taken at call time (registrations after the call are
    /// not guaranteed to be visible — §4.1).
    pub fn get_advisors<T: Any + Send + Sync + 'static>(&self) -> Vec<Arc<T>> {
        let mut result = Vec::new();
        let mut cur = Some(self.clone());
        while let Some(node) = cur {
            result.extend(node.advisor_list::<T>().lock().iter().map(|(_, a)| a.clone()));
            cur = node.parent();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    struct IChat;

    #[test]
    fn interface_resolves_through_parent_chain() {
        let root = ComponentBroker::new_root();
        root.register_interface::<IChat>(None, Arc::new(IChat)).unwrap();
        let arena = root.new_child();
        let handle = arena.get_interface::<IChat>(None);
        assert!(handle.is_some());
    }

    #[test]
    fn unregister_fails_while_held() {
        let root = ComponentBroker::new_root();
        let handle = root.register_interface::<IChat>(None, Arc::new(IChat)).unwrap();
        let _held = root.get_interface::<IChat>(None).unwrap();
        let err = root.unregister_interface(handle.clone()).unwrap_err();
        matches!(err, BrokerError::Busy { refcount: 1 });
        root.release_interface::<IChat>(None);
        assert!(root.unregister_interface(handle).is_ok());
    }

    struct ArenaCreated(u32);

    #[test]
    fn callbacks_fire_in_registration_order_and_respect_snapshot() {
        let root = ComponentBroker::new_root();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        root.register_callback::<ArenaCreated, _>(move |e| o1.lock().push((1, e.0)));
        let o2 = order.clone();
        let handle2 = root.register_callback::<ArenaCreated, _>(move |e| o2.lock().push((2, e.0)));

        root.fire(&ArenaCreated(7));
        assert_eq!(*order.lock(), vec![(1, 7), (2, 7)]);

        // Unregistering a handler mid-callback-list affects only future fires.
        root.unregister_callback(handle2);
        root.fire(&ArenaCreated(8));
        assert_eq!(*order.lock(), vec![(1, 7), (2, 7), (1, 8)]);
    }

    #[test]
    fn arena_fire_does_not_reach_global_handlers() {
        let root = ComponentBroker::new_root();
        let hits = Arc::new(AtomicI32::new(0));
        let h = hits.clone();
        root.register_callback::<ArenaCreated, _>(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let arena = root.new_child();
        arena.fire(&ArenaCreated(1));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    struct KillAdvisor;

    #[test]
    fn advisors_union_ancestors_with_snapshot_semantics() {
        let root = ComponentBroker::new_root();
        root.register_advisor(Arc::new(KillAdvisor));
        let arena = root.new_child();
        arena.register_advisor(Arc::new(KillAdvisor));
        assert_eq!(arena.get_advisors::<KillAdvisor>().len(), 2);
        assert_eq!(root.get_advisors::<KillAdvisor>().len(), 1);
    }
}

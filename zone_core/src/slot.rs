//! Extra-data slot registry, §3 `ExtraDataSlot` / §9 Design Notes
//! "reflection-based extra-data slots". The original uses runtime type
//! metadata; here a slot is an index into a growable per-owner vector, with
//! type safety restored at the API boundary by an opaque typed [`SlotKey`].

use std::any::Any;
use std::marker::PhantomData;

use parking_lot::Mutex;

/// Typed handle to a registered slot. Carries no data itself — only an
/// index plus a phantom type so `SlotTable::get` can downcast safely.
pub struct SlotKey<T> {
    id: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for SlotKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for SlotKey<T> {}

struct SlotDescriptor {
    factory: Box<dyn Fn() -> Box<dyn Any + Send + Sync> + Send + Sync>,
    reset: Box<dyn Fn(&mut Box<dyn Any + Send + Sync>) + Send + Sync>,
    dispose: Box<dyn Fn(Box<dyn Any + Send + Sync>) + Send + Sync>,
}

/// Shared between a [`crate::player::PlayerManager`] and
/// [`crate::arena::ArenaManager`]-equivalent owner: one registry per owner
/// kind (players, arenas), holding the factory/dispose pair for every
/// allocated slot.
#[derive(Default)]
pub struct SlotRegistry {
    descriptors: Mutex<Vec<Option<SlotDescriptor>>>,
}

impl SlotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a new slot. `factory` produces the initial value whenever
    /// an owner is created; `reset` runs on a pooled owner's existing value
    /// when it is returned to service instead of torn down (§3/§9 "records
    /// a factory, a reset function, and a disposal function"); `dispose`
    /// runs once when the owner is destroyed or the slot itself is freed
    /// early.
    pub fn allocate<T, F, R, D>(&self, factory: F, reset: R, dispose: D) -> SlotKey<T>
    where
        T: Any + Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
        R: Fn(&mut T) + Send + Sync + 'static,
        D: Fn(T) + Send + Sync + 'static,
    {
        let mut descriptors = self.descriptors.lock();
        let id = descriptors.len();
        descriptors.push(Some(SlotDescriptor {
            factory: Box::new(move || Box::new(factory()) as Box<dyn Any + Send + Sync>),
            reset: Box::new(move |boxed| {
                if let Some(value) = boxed.downcast_mut::<T>() {
                    reset(value);
                }
            }),
            dispose: Box::new(move |boxed| {
                if let Ok(value) = boxed.downcast::<T>() {
                    dispose(*value);
                }
            }),
        }));
        SlotKey {
            id,
            _marker: PhantomData,
        }
    }

    /// Frees a slot's descriptor. Existing owner tables keep whatever value
    /// they were holding (it is dropped, not disposed through the original
    /// `dispose` hook, since the descriptor that knows how is gone); new
    /// owners created after this call won't get that slot populated.
    pub fn free<T>(&self, key: SlotKey<T>) {
        let mut descriptors = self.descriptors.lock();
        if let Some(slot) = descriptors.get_mut(key.id) {
            *slot = None;
        }
    }

    /// Runs every currently-registered factory, producing a fresh
    /// [`SlotTable`] for a newly created owner.
    pub fn create_owner_slots(&self) -> SlotTable {
        let descriptors = self.descriptors.lock();
        let slots = descriptors
            .iter()
            .map(|d| d.as_ref().map(|desc| (desc.factory)()))
            .collect();
        SlotTable { slots }
    }

    /// Runs each populated slot's reset hook in place, for a pooled owner
    /// being recycled back into service rather than destroyed (§9 "a reset
    /// hook for pooled types").
    pub fn reset_owner_slots(&self, table: &mut SlotTable) {
        let descriptors = self.descriptors.lock();
        for (id, slot) in table.slots.iter_mut().enumerate() {
            if let Some(value) = slot {
                if let Some(Some(desc)) = descriptors.get(id) {
                    (desc.reset)(value);
                }
            }
        }
    }

    /// Runs each populated slot's disposal hook, consuming the table. Call
    /// when an owner (player or arena) is torn down.
    pub fn dispose_owner_slots(&self, table: SlotTable) {
        let descriptors = self.descriptors.lock();
        for (id, slot) in table.slots.into_iter().enumerate() {
            if let Some(value) = slot {
                if let Some(Some(desc)) = descriptors.get(id) {
                    (desc.dispose)(value);
                }
            }
        }
    }
}

/// Per-owner vector of slot values, indexed by [`SlotKey::id`].
pub struct SlotTable {
    slots: Vec<Option<Box<dyn Any + Send + Sync>>>,
}

impl SlotTable {
    pub fn get<T: Any + Send + Sync + 'static>(&self, key: &SlotKey<T>) -> Option<&T> {
        self.slots
            .get(key.id)
            .and_then(|s| s.as_ref())
            .and_then(|b| b.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any + Send + Sync + 'static>(&mut self, key: &SlotKey<T>) -> Option<&mut T> {
        self.slots
            .get_mut(key.id)
            .and_then(|s| s.as_mut())
            .and_then(|b| b.downcast_mut::<T>())
    }
}

//! Per-type slot storage.
//!
//! An [`EntityFamily`] maps slot indices to entity payloads for one entity
//! type. It is always held behind an [`Arc`]: [`ImmutableEntityFamily`] only
//! reads through it, while [`MutableEntityFamily`] splits the shared array on
//! its first write (`Arc::make_mut`) and then the touched entity payload the
//! same way. Forking is therefore a reference-count bump per family, and a
//! frozen family is never affected by writes on any builder derived from it.
//!
//! The type-erased traits at the bottom of this module let barrels hold
//! families of arbitrarily many entity types in one map keyed by
//! [`EntityTypeId`].

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use downcast_rs::{DowncastSync, impl_downcast};

use crate::entity::{
    EntityData, EntityId, EntitySource, EntityTypeId, ErasedData, ErasedEntityData, WorkspaceEntity,
};

/// Slot array for one entity type.
#[derive(Debug, Clone)]
pub struct EntityFamily<T> {
    /// `slots[i]` holds the entity with index `i`, or `None` once removed.
    slots: Vec<Option<Arc<EntityData<T>>>>,
    /// Number of occupied slots.
    live: usize,
}

impl<T: WorkspaceEntity> EntityFamily<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            live: 0,
        }
    }

    /// Returns the entity stored at `index`, if the slot is occupied.
    #[must_use]
    pub fn get(&self, index: u32) -> Option<&EntityData<T>> {
        self.get_shared(index).map(Arc::as_ref)
    }

    pub(crate) fn get_shared(&self, index: u32) -> Option<&Arc<EntityData<T>>> {
        self.slots.get(index as usize).and_then(Option::as_ref)
    }

    #[must_use]
    pub fn contains(&self, index: u32) -> bool {
        self.get_shared(index).is_some()
    }

    /// Number of live entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Number of slots ever allocated, including removed ones.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Iterates live entities in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &EntityData<T>> {
        self.slots.iter().filter_map(|slot| slot.as_deref())
    }

    fn ids(&self) -> Vec<EntityId> {
        self.iter().map(EntityData::id).collect()
    }
}

/// Read-only view of a family, shared by every snapshot that contains it.
#[derive(Debug)]
pub struct ImmutableEntityFamily<T> {
    family: Arc<EntityFamily<T>>,
}

impl<T> Clone for ImmutableEntityFamily<T> {
    fn clone(&self) -> Self {
        Self {
            family: Arc::clone(&self.family),
        }
    }
}

impl<T: WorkspaceEntity> ImmutableEntityFamily<T> {
    /// Start a writable family sharing this one's storage.
    #[must_use]
    pub fn to_mutable(&self) -> MutableEntityFamily<T> {
        MutableEntityFamily {
            family: Arc::clone(&self.family),
        }
    }
}

impl<T> std::ops::Deref for ImmutableEntityFamily<T> {
    type Target = EntityFamily<T>;

    fn deref(&self) -> &Self::Target {
        &self.family
    }
}

/// Writable family owned by one builder.
#[derive(Debug)]
pub struct MutableEntityFamily<T> {
    family: Arc<EntityFamily<T>>,
}

impl<T: WorkspaceEntity> MutableEntityFamily<T> {
    /// Create a fresh, independent, empty family.
    #[must_use]
    pub fn create_empty_mutable() -> Self {
        Self {
            family: Arc::new(EntityFamily::new()),
        }
    }

    fn slots_mut(&mut self) -> &mut EntityFamily<T> {
        Arc::make_mut(&mut self.family)
    }

    /// Store a new entity and return its id. Indices are never reused.
    pub fn add(&mut self, entity_source: EntitySource, fields: T) -> EntityId {
        let family = self.slots_mut();
        let index = u32::try_from(family.slots.len())
            .unwrap_or_else(|_| panic!("{} family exhausted its id space", T::TYPE_NAME));
        let id = EntityId::new(EntityTypeId::of::<T>(), index);
        family
            .slots
            .push(Some(Arc::new(EntityData::new(id, entity_source, fields))));
        family.live += 1;
        id
    }

    /// Empty the slot at `index` and return what it held.
    ///
    /// Removing an empty slot returns `None`; callers decide whether that is
    /// an error.
    pub fn remove(&mut self, index: u32) -> Option<Arc<EntityData<T>>> {
        if !self.contains(index) {
            return None;
        }
        let family = self.slots_mut();
        let removed = family.slots[index as usize].take();
        family.live -= 1;
        removed
    }

    /// Overwrite an occupied slot with `data`, keyed by `data`'s id.
    ///
    /// # Panics
    ///
    /// Panics if the slot is empty or was removed.
    pub fn replace_by_id(&mut self, data: EntityData<T>) {
        let index = data.id().index;
        assert!(
            self.contains(index),
            "cannot replace {}: the {} slot is empty",
            data.id(),
            T::TYPE_NAME
        );
        self.slots_mut().slots[index as usize] = Some(Arc::new(data));
    }

    /// Exclusive access to the entity at `index`, copying the shared array
    /// and the entity payload first if anyone else still references them.
    ///
    /// # Panics
    ///
    /// Panics if the slot is empty.
    pub fn get_for_modification(&mut self, index: u32) -> &mut EntityData<T> {
        match self
            .slots_mut()
            .slots
            .get_mut(index as usize)
            .and_then(Option::as_mut)
        {
            Some(data) => Arc::make_mut(data),
            None => panic!(
                "cannot modify {}: no entity at index {index}",
                T::TYPE_NAME
            ),
        }
    }

    /// Freeze the current contents. The returned view shares storage until
    /// this family is written again.
    #[must_use]
    pub fn to_immutable(&self) -> ImmutableEntityFamily<T> {
        ImmutableEntityFamily {
            family: Arc::clone(&self.family),
        }
    }
}

impl<T> std::ops::Deref for MutableEntityFamily<T> {
    type Target = EntityFamily<T>;

    fn deref(&self) -> &Self::Target {
        &self.family
    }
}

/// Read operations every family supports regardless of its entity type.
pub(crate) trait ErasedFamily: DowncastSync + fmt::Debug {
    fn contains(&self, index: u32) -> bool;
    fn erased_data(&self, index: u32) -> Option<ErasedData>;
    fn ids(&self) -> Vec<EntityId>;
    fn len(&self) -> usize;
    fn type_name(&self) -> &'static str;
    /// The underlying [`EntityFamily`] as `Any`, for typed reads.
    fn family_any(&self) -> &(dyn Any + 'static);
}

pub(crate) trait ErasedImmutableFamily: ErasedFamily {
    fn to_mutable_erased(&self) -> Box<dyn ErasedMutableFamily>;
    fn as_erased(&self) -> &dyn ErasedFamily;
}

pub(crate) trait ErasedMutableFamily: ErasedFamily {
    fn remove_erased(&mut self, index: u32) -> Option<ErasedData>;
    /// Returns the record before and after the change.
    fn change_source(&mut self, index: u32, source: EntitySource) -> (ErasedData, ErasedData);
    fn to_immutable_erased(&self) -> Box<dyn ErasedImmutableFamily>;
    fn as_erased(&self) -> &dyn ErasedFamily;
    /// Store a copy of `data` under a fresh id.
    fn add_erased(&mut self, data: &(dyn ErasedEntityData + 'static)) -> EntityId;
    /// Overwrite the fields at `index` with those of `data`, keeping the source.
    fn set_fields_erased(&mut self, index: u32, data: &(dyn ErasedEntityData + 'static));
    /// A new empty family of the same entity type.
    fn empty_like(&self) -> Box<dyn ErasedMutableFamily>;
}

impl_downcast!(sync ErasedMutableFamily);

fn typed_data<'a, T: WorkspaceEntity>(data: &'a (dyn ErasedEntityData + 'static)) -> &'a EntityData<T> {
    match data.typed::<T>() {
        Some(data) => data,
        None => panic!("{} is a {}, not a {}", data.id(), data.type_name(), T::TYPE_NAME),
    }
}

fn erase<T: WorkspaceEntity>(data: &Arc<EntityData<T>>) -> ErasedData {
    Arc::clone(data) as ErasedData
}

macro_rules! impl_erased_family {
    ($family:ident) => {
        impl<T: WorkspaceEntity> ErasedFamily for $family<T> {
            fn contains(&self, index: u32) -> bool {
                EntityFamily::<T>::contains(self, index)
            }

            fn erased_data(&self, index: u32) -> Option<ErasedData> {
                self.get_shared(index).map(erase)
            }

            fn ids(&self) -> Vec<EntityId> {
                EntityFamily::<T>::ids(self)
            }

            fn len(&self) -> usize {
                EntityFamily::<T>::len(self)
            }

            fn type_name(&self) -> &'static str {
                T::TYPE_NAME
            }

            fn family_any(&self) -> &(dyn Any + 'static) {
                &*self.family
            }
        }
    };
}

impl_erased_family!(ImmutableEntityFamily);
impl_erased_family!(MutableEntityFamily);

impl<T: WorkspaceEntity> ErasedImmutableFamily for ImmutableEntityFamily<T> {
    fn to_mutable_erased(&self) -> Box<dyn ErasedMutableFamily> {
        Box::new(self.to_mutable())
    }

    fn as_erased(&self) -> &dyn ErasedFamily {
        self
    }
}

impl<T: WorkspaceEntity> ErasedMutableFamily for MutableEntityFamily<T> {
    fn remove_erased(&mut self, index: u32) -> Option<ErasedData> {
        self.remove(index).map(|data| data as ErasedData)
    }

    fn change_source(&mut self, index: u32, source: EntitySource) -> (ErasedData, ErasedData) {
        let before = self.get_shared(index).map(erase);
        self.get_for_modification(index).entity_source = source;
        match (before, self.get_shared(index).map(erase)) {
            (Some(before), Some(after)) => (before, after),
            _ => unreachable!("get_for_modification panics on an empty slot"),
        }
    }

    fn to_immutable_erased(&self) -> Box<dyn ErasedImmutableFamily> {
        Box::new(self.to_immutable())
    }

    fn as_erased(&self) -> &dyn ErasedFamily {
        self
    }

    fn add_erased(&mut self, data: &(dyn ErasedEntityData + 'static)) -> EntityId {
        let data = typed_data::<T>(data);
        self.add(data.entity_source.clone(), data.fields.clone())
    }

    fn set_fields_erased(&mut self, index: u32, data: &(dyn ErasedEntityData + 'static)) {
        let fields = typed_data::<T>(data).fields.clone();
        self.get_for_modification(index).fields = fields;
    }

    fn empty_like(&self) -> Box<dyn ErasedMutableFamily> {
        Box::new(Self::create_empty_mutable())
    }
}

fn typed_family<T: WorkspaceEntity>(family: &dyn ErasedFamily) -> &EntityFamily<T> {
    match family.family_any().downcast_ref::<EntityFamily<T>>() {
        Some(family) => family,
        None => panic!(
            "entity type name `{}` is shared by `{}` and another Rust type",
            T::TYPE_NAME,
            family.type_name()
        ),
    }
}

/// Lookup of families by entity type, shared by both barrel kinds.
pub(crate) trait FamilyLookup: fmt::Debug {
    fn family(&self, entity_type: EntityTypeId) -> Option<&dyn ErasedFamily>;
    fn entity_types(&self) -> Vec<EntityTypeId>;
}

impl dyn FamilyLookup + '_ {
    pub(crate) fn typed<T: WorkspaceEntity>(&self) -> Option<&EntityFamily<T>> {
        self.family(EntityTypeId::of::<T>()).map(typed_family::<T>)
    }

    pub(crate) fn contains(&self, id: EntityId) -> bool {
        self.family(id.entity_type)
            .is_some_and(|family| family.contains(id.index))
    }

    pub(crate) fn erased_data(&self, id: EntityId) -> Option<ErasedData> {
        self.family(id.entity_type)
            .and_then(|family| family.erased_data(id.index))
    }
}

/// All families of a snapshot.
#[derive(Debug, Default)]
pub(crate) struct ImmutableEntitiesBarrel {
    families: HashMap<EntityTypeId, Box<dyn ErasedImmutableFamily>>,
}

impl ImmutableEntitiesBarrel {
    /// Writable barrel sharing every family with this one.
    pub(crate) fn to_mutable(&self) -> MutableEntitiesBarrel {
        MutableEntitiesBarrel {
            families: self
                .families
                .iter()
                .map(|(&ty, family)| (ty, family.to_mutable_erased()))
                .collect(),
        }
    }
}

impl FamilyLookup for ImmutableEntitiesBarrel {
    fn family(&self, entity_type: EntityTypeId) -> Option<&dyn ErasedFamily> {
        self.families
            .get(&entity_type)
            .map(|family| family.as_erased())
    }

    fn entity_types(&self) -> Vec<EntityTypeId> {
        self.families.keys().copied().collect()
    }
}

/// All families of a builder.
#[derive(Debug, Default)]
pub(crate) struct MutableEntitiesBarrel {
    families: HashMap<EntityTypeId, Box<dyn ErasedMutableFamily>>,
}

impl MutableEntitiesBarrel {
    /// The writable family for `T`, created on first use.
    pub(crate) fn family_mut<T: WorkspaceEntity>(&mut self) -> &mut MutableEntityFamily<T> {
        let family = self
            .families
            .entry(EntityTypeId::of::<T>())
            .or_insert_with(|| Box::new(MutableEntityFamily::<T>::create_empty_mutable()));
        let stored_name = family.type_name();
        match family.downcast_mut::<MutableEntityFamily<T>>() {
            Some(family) => family,
            None => panic!(
                "entity type name `{}` is shared by `{stored_name}` and another Rust type",
                T::TYPE_NAME
            ),
        }
    }

    pub(crate) fn erased(&self, entity_type: EntityTypeId) -> Option<&(dyn ErasedMutableFamily + 'static)> {
        self.families.get(&entity_type).map(Box::as_ref)
    }

    pub(crate) fn erased_mut(
        &mut self,
        entity_type: EntityTypeId,
    ) -> Option<&mut (dyn ErasedMutableFamily + 'static)> {
        self.families.get_mut(&entity_type).map(Box::as_mut)
    }

    /// The family for `template`'s entity type, created empty on first use.
    pub(crate) fn family_like(
        &mut self,
        template: &(dyn ErasedMutableFamily + 'static),
    ) -> &mut (dyn ErasedMutableFamily + 'static) {
        let entity_type = EntityTypeId::from_name(template.type_name());
        self.families
            .entry(entity_type)
            .or_insert_with(|| template.empty_like())
            .as_mut()
    }

    pub(crate) fn to_immutable(&self) -> ImmutableEntitiesBarrel {
        ImmutableEntitiesBarrel {
            families: self
                .families
                .iter()
                .map(|(&ty, family)| (ty, family.to_immutable_erased()))
                .collect(),
        }
    }
}

impl FamilyLookup for MutableEntitiesBarrel {
    fn family(&self, entity_type: EntityTypeId) -> Option<&dyn ErasedFamily> {
        self.families
            .get(&entity_type)
            .map(|family| family.as_erased())
    }

    fn entity_types(&self) -> Vec<EntityTypeId> {
        self.families.keys().copied().collect()
    }
}

//! Collection merge engine.
//!
//! A document can be published by several data sources at once: every socket
//! feeding `added`/`changed`/`removed`, and every method call whose result
//! carried entities. Each source keeps its own field set per document; the
//! merged view folds them in contribution order, so the source that touched a
//! document last wins on conflicting fields.
//!
//! Mutations only mark a collection dirty. Materialized documents are rebuilt
//! through the collection's model constructor on [`ActionKind::Flush`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::ejson::Ejson;
use crate::proto::Fields;
use crate::store::{Action, ActionKind};

/// Collection name → document id → partial fields.
pub type Entities = BTreeMap<String, BTreeMap<String, Fields>>;

/// Builds the materialized document for `(id, merged fields)`.
pub type ModelConstructor = Arc<dyn Fn(&str, &Fields) -> Ejson + Send + Sync>;

/// Model constructors by collection name.
#[derive(Clone, Default)]
pub struct ModelTable {
    models: HashMap<String, ModelConstructor>,
}

impl ModelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model<F>(mut self, collection: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&str, &Fields) -> Ejson + Send + Sync + 'static,
    {
        self.models.insert(collection.into(), Arc::new(constructor));
        self
    }

    /// Materializes one document; collections without a model get a plain
    /// object holding `_id` and the fields.
    pub fn build(&self, collection: &str, id: &str, fields: &Fields) -> Ejson {
        match self.models.get(collection) {
            Some(constructor) => constructor(id, fields),
            None => Ejson::Object(fields.clone()).with("_id", id),
        }
    }
}

impl fmt::Debug for ModelTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.models.keys()).finish()
    }
}

/// Per-source field sets of one document.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DocumentSlot {
    sources: BTreeMap<String, Fields>,
    /// Contributing sources, most recent last, no duplicates.
    order: Vec<String>,
}

impl DocumentSlot {
    pub fn sources(&self) -> &[String] {
        &self.order
    }

    pub fn fields_from(&self, source: &str) -> Option<&Fields> {
        self.sources.get(source)
    }

    pub fn merged(&self) -> Fields {
        let mut merged = Fields::new();
        for source in &self.order {
            if let Some(fields) = self.sources.get(source) {
                merged.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        merged
    }

    fn contribute(&mut self, source: &str, fields: &Fields, cleared: &[String]) {
        let own = self.sources.entry(source.to_string()).or_default();
        own.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        for name in cleared {
            own.remove(name);
        }
        self.order.retain(|existing| existing != source);
        self.order.push(source.to_string());
    }

    fn withdraw(&mut self, source: &str) -> bool {
        self.order.retain(|existing| existing != source);
        self.sources.remove(source).is_some()
    }

    fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct CollectionState {
    slots: BTreeMap<String, DocumentSlot>,
    documents: BTreeMap<String, Ejson>,
    needs_update: bool,
}

impl CollectionState {
    pub fn slot(&self, id: &str) -> Option<&DocumentSlot> {
        self.slots.get(id)
    }

    /// Documents as of the last flush.
    pub fn documents(&self) -> &BTreeMap<String, Ejson> {
        &self.documents
    }

    pub fn needs_update(&self) -> bool {
        self.needs_update
    }

    fn rebuild(&mut self, collection: &str, models: &ModelTable) {
        self.documents = self
            .slots
            .iter()
            .map(|(id, slot)| (id.clone(), models.build(collection, id, &slot.merged())))
            .collect();
        self.needs_update = false;
    }
}

/// All collections, each behind its own `Arc` so untouched collections keep
/// their identity across updates.
#[derive(Clone, Debug, Default)]
pub struct Collections {
    collections: BTreeMap<String, Arc<CollectionState>>,
}

impl Collections {
    pub fn get(&self, collection: &str) -> Option<&Arc<CollectionState>> {
        self.collections.get(collection)
    }

    pub fn documents(&self, collection: &str) -> Option<&BTreeMap<String, Ejson>> {
        self.get(collection).map(|state| state.documents())
    }

    /// True while any collection has unflushed changes.
    pub fn needs_update(&self) -> bool {
        self.collections.values().any(|state| state.needs_update)
    }

    /// Merges `entities` under `data_source_id`. Returns `this` unchanged when
    /// `entities` names no document.
    pub fn insert_entities(this: &Arc<Self>, data_source_id: &str, entities: &Entities) -> Arc<Self> {
        if entities.values().all(BTreeMap::is_empty) {
            return Arc::clone(this);
        }

        let mut next = Self::clone(this);
        for (collection, documents) in entities.iter().filter(|(_, docs)| !docs.is_empty()) {
            let state = Arc::make_mut(next.collections.entry(collection.clone()).or_default());
            for (id, fields) in documents {
                state
                    .slots
                    .entry(id.clone())
                    .or_default()
                    .contribute(data_source_id, fields, &[]);
            }
            state.needs_update = true;
        }
        Arc::new(next)
    }

    pub fn changed(
        this: &Arc<Self>,
        data_source_id: &str,
        collection: &str,
        id: &str,
        fields: &Fields,
        cleared: &[String],
    ) -> Arc<Self> {
        let mut next = Self::clone(this);
        let state = Arc::make_mut(next.collections.entry(collection.to_string()).or_default());
        state
            .slots
            .entry(id.to_string())
            .or_default()
            .contribute(data_source_id, fields, cleared);
        state.needs_update = true;
        Arc::new(next)
    }

    pub fn removed(this: &Arc<Self>, data_source_id: &str, collection: &str, id: &str) -> Arc<Self> {
        let contributed = this
            .get(collection)
            .and_then(|state| state.slot(id))
            .is_some_and(|slot| slot.fields_from(data_source_id).is_some());
        if !contributed {
            return Arc::clone(this);
        }

        let mut next = Self::clone(this);
        if let Some(state) = next.collections.get_mut(collection) {
            let state = Arc::make_mut(state);
            if let Some(slot) = state.slots.get_mut(id) {
                slot.withdraw(data_source_id);
                if slot.is_empty() {
                    state.slots.remove(id);
                }
            }
            state.needs_update = true;
        }
        Arc::new(next)
    }

    /// Drops every contribution of `data_source_id`.
    pub fn release_data_source(this: &Arc<Self>, data_source_id: &str) -> Arc<Self> {
        let mut next = Self::clone(this);
        let mut changed = false;
        for state in next.collections.values_mut() {
            let touches = state
                .slots
                .values()
                .any(|slot| slot.fields_from(data_source_id).is_some());
            if !touches {
                continue;
            }
            let state = Arc::make_mut(state);
            state.slots.retain(|_, slot| {
                slot.withdraw(data_source_id);
                !slot.is_empty()
            });
            state.needs_update = true;
            changed = true;
        }

        if changed {
            Arc::new(next)
        } else {
            Arc::clone(this)
        }
    }

    /// Rebuilds the documents of every dirty collection.
    pub fn flush(this: &Arc<Self>, models: &ModelTable) -> Arc<Self> {
        if !this.needs_update() {
            return Arc::clone(this);
        }

        let mut next = Self::clone(this);
        for (collection, state) in next.collections.iter_mut() {
            if state.needs_update {
                Arc::make_mut(state).rebuild(collection, models);
            }
        }
        Arc::new(next)
    }

    pub fn handle(this: &Arc<Self>, action: &Action, models: &ModelTable) -> Arc<Self> {
        match &action.kind {
            ActionKind::Flush => Self::flush(this, models),
            ActionKind::ReleaseDataSource { data_source_id } => {
                Self::release_data_source(this, data_source_id)
            }
            ActionKind::Result { id, entities, .. } => Self::insert_entities(this, id, entities),
            ActionKind::Added {
                collection,
                id,
                fields,
            } => {
                let Some(socket_id) = action.socket_id() else {
                    return Arc::clone(this);
                };
                let entities =
                    Entities::from([(collection.clone(), BTreeMap::from([(id.clone(), fields.clone())]))]);
                Self::insert_entities(this, socket_id, &entities)
            }
            ActionKind::Changed {
                collection,
                id,
                fields,
                cleared,
            } => match action.socket_id() {
                Some(socket_id) => Self::changed(this, socket_id, collection, id, fields, cleared),
                None => Arc::clone(this),
            },
            ActionKind::Removed { collection, id } => match action.socket_id() {
                Some(socket_id) => Self::removed(this, socket_id, collection, id),
                None => Arc::clone(this),
            },
            _ => Arc::clone(this),
        }
    }
}

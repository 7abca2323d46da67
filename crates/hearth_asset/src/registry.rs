//! Asset tables and the load pipeline.
//!
//! Loading happens once at startup, single-threaded: discover files per
//! kind, resolve inheritance in topological order, decode against the
//! kind's schema, assign stable indices in sorted-key order, then run
//! `after_decode` hooks across all kinds in registration (dependency)
//! order. The sealed registry is read-only; hot reload swaps whole
//! tables under `&mut self` and bumps a generation counter.

use std::any::{Any, TypeId};
use std::collections::BTreeMap;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::info;

use crate::error::AssetError;
use crate::ident::Ident;
use crate::schema::{Fields, Schema};
use crate::source::AssetSource;

/// An immutable record loaded from declarative source files.
pub trait Asset: Sized + Send + Sync + 'static {
    /// Kind name; also the source subdirectory, e.g. `fluid`.
    const KIND: &'static str;

    fn schema() -> Schema;

    fn from_fields(fields: &Fields) -> anyhow::Result<Self>;

    /// Runs after every kind is loaded, in registration order. Typical
    /// work is interning string references to adjacent assets via
    /// [`ResolveCx::index_of`].
    #[allow(unused_variables)]
    fn after_decode(&mut self, cx: &ResolveCx<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

type IndexDirectory = FxHashMap<&'static str, FxHashMap<Ident, u32>>;

/// Lookup context handed to `after_decode` hooks.
pub struct ResolveCx<'a> {
    indices: &'a IndexDirectory,
}

impl ResolveCx<'_> {
    /// Interns a `kind` asset's string key to its integer index.
    pub fn index_of(&self, kind: &str, key: &str) -> anyhow::Result<u32> {
        let ident = Ident::new(key)?;
        self.indices
            .get(kind)
            .and_then(|keys| keys.get(&ident))
            .copied()
            .ok_or_else(|| anyhow::anyhow!("unknown {kind} asset '{key}'"))
    }
}

struct Entry<T> {
    key: Ident,
    asset: T,
}

/// One kind's assets, addressable by key and by stable integer index.
///
/// Index slots are never re-bound: a removed key leaves a hole, new keys
/// extend the range. That is what lets clients cache indices across hot
/// reloads.
pub struct IndexedTable<T> {
    slots: Vec<Option<Entry<T>>>,
    by_key: FxHashMap<Ident, u32>,
    generation: u64,
}

impl<T> Default for IndexedTable<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            by_key: FxHashMap::default(),
            generation: 0,
        }
    }
}

impl<T> IndexedTable<T> {
    pub fn get(&self, key: &Ident) -> Option<&T> {
        self.by_index(self.index_of(key)?)
    }

    pub fn index_of(&self, key: &Ident) -> Option<u32> {
        self.by_key.get(key).copied()
    }

    pub fn by_index(&self, index: u32) -> Option<&T> {
        self.slots
            .get(index as usize)?
            .as_ref()
            .map(|entry| &entry.asset)
    }

    pub fn key_of(&self, index: u32) -> Option<&Ident> {
        self.slots
            .get(index as usize)?
            .as_ref()
            .map(|entry| &entry.key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Ident, u32, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.as_ref()
                .map(|entry| (&entry.key, index as u32, &entry.asset))
        })
    }

    /// Count of live entries; holes from removed keys do not count.
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

trait AnyTable: Send + Sync {
    fn kind(&self) -> &'static str;

    fn indices(&self) -> FxHashMap<Ident, u32>;

    fn run_hooks(&mut self, cx: &ResolveCx<'_>) -> Result<(), AssetError>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Asset> AnyTable for IndexedTable<T> {
    fn kind(&self) -> &'static str {
        T::KIND
    }

    fn indices(&self) -> FxHashMap<Ident, u32> {
        self.by_key.clone()
    }

    fn run_hooks(&mut self, cx: &ResolveCx<'_>) -> Result<(), AssetError> {
        for slot in self.slots.iter_mut().flatten() {
            slot.asset
                .after_decode(cx)
                .map_err(|source| AssetError::Decode {
                    kind: T::KIND.to_owned(),
                    key: slot.key.to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Startup-time registration of asset kinds. Registration order is hook
/// order, so dependencies register before their dependents.
#[derive(Default)]
pub struct AssetRegistryBuilder {
    loaders: Vec<(TypeId, Box<dyn Fn(&dyn AssetSource) -> Result<Box<dyn AnyTable>, AssetError>>)>,
    kinds: Vec<&'static str>,
}

impl AssetRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Asset>(&mut self) -> Result<&mut Self, AssetError> {
        if self.kinds.contains(&T::KIND) {
            return Err(AssetError::DuplicateKind(T::KIND));
        }

        self.kinds.push(T::KIND);
        self.loaders.push((
            TypeId::of::<T>(),
            Box::new(|source| {
                let table = load_table::<T>(source)?;
                Ok(Box::new(table) as Box<dyn AnyTable>)
            }),
        ));

        Ok(self)
    }

    /// Runs the whole load flow and seals the registry.
    pub fn load(self, source: &dyn AssetSource) -> Result<AssetRegistry, AssetError> {
        let mut tables: Vec<(TypeId, Box<dyn AnyTable>)> = Vec::with_capacity(self.loaders.len());
        for (type_id, loader) in &self.loaders {
            tables.push((*type_id, loader(source)?));
        }

        let mut directory = IndexDirectory::default();
        for (_, table) in &tables {
            directory.insert(table.kind(), table.indices());
        }

        let cx = ResolveCx {
            indices: &directory,
        };
        for (_, table) in &mut tables {
            table.run_hooks(&cx)?;
            info!(kind = table.kind(), "loaded assets");
        }

        let by_kind = tables
            .iter()
            .map(|(type_id, table)| (table.kind(), *type_id))
            .collect();

        Ok(AssetRegistry {
            tables: tables.into_iter().collect(),
            by_kind,
            directory,
        })
    }
}

/// The sealed, process-wide asset store.
pub struct AssetRegistry {
    tables: FxHashMap<TypeId, Box<dyn AnyTable>>,
    by_kind: FxHashMap<&'static str, TypeId>,
    directory: IndexDirectory,
}

impl AssetRegistry {
    pub fn get<T: Asset>(&self, key: &Ident) -> Option<&T> {
        self.table::<T>()?.get(key)
    }

    pub fn index_of<T: Asset>(&self, key: &Ident) -> Option<u32> {
        self.table::<T>()?.index_of(key)
    }

    pub fn by_index<T: Asset>(&self, index: u32) -> Option<&T> {
        self.table::<T>()?.by_index(index)
    }

    pub fn generation<T: Asset>(&self) -> Option<u64> {
        Some(self.table::<T>()?.generation())
    }

    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.by_kind.keys().copied()
    }

    pub fn table<T: Asset>(&self) -> Option<&IndexedTable<T>> {
        self.tables
            .get(&TypeId::of::<T>())?
            .as_any()
            .downcast_ref()
    }

    /// Reloads one kind from `source`, producing a replacement table.
    ///
    /// Indices of surviving keys are preserved; new keys take fresh
    /// indices at the end of the range; removed keys leave holes. The
    /// kind's generation is bumped and the diff describes what a client
    /// sync needs to send.
    pub fn reload<T: Asset + PartialEq>(
        &mut self,
        source: &dyn AssetSource,
    ) -> Result<AssetDiff, AssetError> {
        let decoded = decode_kind::<T>(source)?;

        let type_id = TypeId::of::<T>();
        let old = self
            .tables
            .get(&type_id)
            .and_then(|table| table.as_any().downcast_ref::<IndexedTable<T>>())
            .ok_or(AssetError::UnknownKind(T::KIND))?;

        // Surviving keys keep their slots; fresh keys extend the range.
        let mut slots: Vec<Option<Entry<T>>> = (0..old.slots.len()).map(|_| None).collect();
        let mut by_key = FxHashMap::default();
        let mut removed: Vec<Ident> = old
            .by_key
            .keys()
            .filter(|key| !decoded.contains_key(*key))
            .cloned()
            .collect();
        removed.sort();

        for (key, asset) in decoded {
            let index = match old.index_of(&key) {
                Some(index) => index,
                None => {
                    slots.push(None);
                    (slots.len() - 1) as u32
                }
            };
            by_key.insert(key.clone(), index);
            slots[index as usize] = Some(Entry { key, asset });
        }

        let mut table = IndexedTable {
            slots,
            by_key,
            generation: old.generation() + 1,
        };

        // Hooks see the updated directory so re-interned indices are
        // consistent with the new table.
        self.directory.insert(T::KIND, table.by_key.clone());
        let cx = ResolveCx {
            indices: &self.directory,
        };
        AnyTable::run_hooks(&mut table, &cx)?;

        // Diff after hooks, so interned fields participate.
        let old = self
            .tables
            .get(&type_id)
            .and_then(|t| t.as_any().downcast_ref::<IndexedTable<T>>())
            .ok_or(AssetError::UnknownKind(T::KIND))?;

        let mut upserted = Vec::new();
        for (key, index, asset) in table.iter() {
            if old.get(key) != Some(asset) {
                upserted.push((key.clone(), index));
            }
        }

        self.tables.insert(type_id, Box::new(table));

        info!(
            kind = T::KIND,
            upserted = upserted.len(),
            removed = removed.len(),
            "reloaded assets"
        );

        Ok(AssetDiff { upserted, removed })
    }
}

/// What changed in one kind across a reload.
#[derive(Debug, Default)]
pub struct AssetDiff {
    pub upserted: Vec<(Ident, u32)>,
    pub removed: Vec<Ident>,
}

fn load_table<T: Asset>(source: &dyn AssetSource) -> Result<IndexedTable<T>, AssetError> {
    let decoded = decode_kind::<T>(source)?;

    // Sorted-by-key order assigns the initial indices deterministically.
    let mut slots = Vec::with_capacity(decoded.len());
    let mut by_key = FxHashMap::default();
    for (index, (key, asset)) in decoded.into_iter().enumerate() {
        by_key.insert(key.clone(), index as u32);
        slots.push(Some(Entry { key, asset }));
    }

    Ok(IndexedTable {
        slots,
        by_key,
        generation: 0,
    })
}

/// Discover, parse, resolve inheritance, and schema-decode one kind.
fn decode_kind<T: Asset>(source: &dyn AssetSource) -> Result<BTreeMap<Ident, T>, AssetError> {
    let mut docs: BTreeMap<Ident, Value> = BTreeMap::new();

    let paths = source.list(T::KIND).map_err(|source| AssetError::Source {
        kind: T::KIND.to_owned(),
        source,
    })?;

    for path in paths {
        let bytes = source.read(&path).map_err(|source| AssetError::Source {
            kind: T::KIND.to_owned(),
            source,
        })?;
        let parsed: Value =
            serde_json::from_slice(&bytes).map_err(|e| AssetError::Source {
                kind: T::KIND.to_owned(),
                source: anyhow::Error::new(e).context(format!("parsing {}", path.display())),
            })?;

        let Value::Object(map) = parsed else {
            return Err(AssetError::Source {
                kind: T::KIND.to_owned(),
                source: anyhow::anyhow!("{} is not a key-to-asset object", path.display()),
            });
        };

        for (key, doc) in map {
            let key = Ident::new(key)?;
            if docs.insert(key.clone(), doc).is_some() {
                return Err(AssetError::DuplicateKey {
                    kind: T::KIND.to_owned(),
                    key: key.to_string(),
                });
            }
        }
    }

    let docs = resolve_inheritance(T::KIND, docs)?;

    let schema = T::schema();
    let mut decoded = BTreeMap::new();
    for (key, doc) in docs {
        let fields = schema.decode(T::KIND, &key, &doc)?;
        let asset = T::from_fields(&fields).map_err(|source| AssetError::Decode {
            kind: T::KIND.to_owned(),
            key: key.to_string(),
            source,
        })?;
        decoded.insert(key, asset);
    }

    Ok(decoded)
}

/// Fills each child's missing fields from its fully-resolved parent.
/// Parents resolve before children by topological order; a cycle is a
/// startup error.
fn resolve_inheritance(
    kind: &'static str,
    mut docs: BTreeMap<Ident, Value>,
) -> Result<BTreeMap<Ident, Value>, AssetError> {
    let mut graph = DiGraph::<Ident, ()>::new();
    let mut nodes = FxHashMap::default();

    for key in docs.keys() {
        let node = graph.add_node(key.clone());
        nodes.insert(key.clone(), node);
    }

    for (key, doc) in &docs {
        let Some(parent) = doc.get("inherit").and_then(Value::as_str) else {
            continue;
        };
        let parent = Ident::new(parent)?;
        let Some(&parent_node) = nodes.get(&parent) else {
            return Err(AssetError::UnknownParent {
                kind: kind.to_owned(),
                key: key.to_string(),
                parent: parent.to_string(),
            });
        };
        graph.add_edge(parent_node, nodes[key], ());
    }

    let order = toposort(&graph, None).map_err(|cycle| AssetError::CyclicInheritance {
        kind: kind.to_owned(),
        key: graph[cycle.node_id()].to_string(),
    })?;

    for node in order {
        let key = graph[node].clone();
        let Some(parent) = docs[&key].get("inherit").and_then(Value::as_str) else {
            continue;
        };
        let parent = Ident::new(parent)?;

        let parent_doc = docs[&parent].clone();
        let child_doc = docs.get_mut(&key).and_then(Value::as_object_mut);
        let (Some(child), Value::Object(parent_fields)) = (child_doc, parent_doc) else {
            continue;
        };

        child.remove("inherit");
        for (field, value) in parent_fields {
            if field != "inherit" {
                child.entry(field).or_insert(value);
            }
        }
    }

    Ok(docs)
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::RwLock;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::schema::{FieldKind, FieldSpec, FieldValue, Validator};

    /// In-memory source: kind -> list of (file name, JSON text).
    #[derive(Default)]
    struct MapSource {
        files: RwLock<Vec<(&'static str, &'static str, String)>>,
    }

    impl MapSource {
        fn with(files: &[(&'static str, &'static str, &str)]) -> Self {
            Self {
                files: RwLock::new(
                    files
                        .iter()
                        .map(|(kind, name, text)| (*kind, *name, (*text).to_owned()))
                        .collect(),
                ),
            }
        }

        fn replace(&self, files: &[(&'static str, &'static str, &str)]) {
            *self.files.write().unwrap() = files
                .iter()
                .map(|(kind, name, text)| (*kind, *name, (*text).to_owned()))
                .collect();
        }
    }

    impl AssetSource for MapSource {
        fn list(&self, kind: &str) -> anyhow::Result<Vec<PathBuf>> {
            let mut paths: Vec<PathBuf> = self
                .files
                .read()
                .unwrap()
                .iter()
                .filter(|(k, ..)| *k == kind)
                .map(|(k, name, _)| PathBuf::from(format!("{k}/{name}")))
                .collect();
            paths.sort();
            Ok(paths)
        }

        fn read(&self, path: &Path) -> anyhow::Result<Vec<u8>> {
            let files = self.files.read().unwrap();
            let found = files
                .iter()
                .find(|(kind, name, _)| PathBuf::from(format!("{kind}/{name}")) == path)
                .map(|(.., text)| text.clone().into_bytes())
                .ok_or_else(|| anyhow::anyhow!("no such file {}", path.display()))?;
            Ok(found)
        }
    }

    #[derive(PartialEq, Debug)]
    struct Sound {
        volume: f64,
    }

    impl Asset for Sound {
        const KIND: &'static str = "sound";

        fn schema() -> Schema {
            Schema::new(vec![FieldSpec::optional(
                "volume",
                FieldKind::Float,
                FieldValue::Float(1.0),
            )])
        }

        fn from_fields(fields: &Fields) -> anyhow::Result<Self> {
            Ok(Self {
                volume: fields.float("volume")?,
            })
        }
    }

    #[derive(PartialEq, Debug)]
    struct Fluid {
        flow_rate: i64,
        can_demote: bool,
        splash_sound: String,
        splash_index: u32,
    }

    impl Asset for Fluid {
        const KIND: &'static str = "fluid";

        fn schema() -> Schema {
            Schema::new(vec![
                FieldSpec::required("flow_rate", FieldKind::Int).validated(Validator::Min(1.0)),
                FieldSpec::optional("can_demote", FieldKind::Bool, FieldValue::Bool(true)),
                FieldSpec::required("splash_sound", FieldKind::Str)
                    .validated(Validator::NonEmpty),
            ])
        }

        fn from_fields(fields: &Fields) -> anyhow::Result<Self> {
            Ok(Self {
                flow_rate: fields.int("flow_rate")?,
                can_demote: fields.bool("can_demote")?,
                splash_sound: fields.str("splash_sound")?.to_owned(),
                splash_index: u32::MAX,
            })
        }

        fn after_decode(&mut self, cx: &ResolveCx<'_>) -> anyhow::Result<()> {
            self.splash_index = cx.index_of(Sound::KIND, &self.splash_sound)?;
            Ok(())
        }
    }

    fn sound_files() -> (&'static str, &'static str, &'static str) {
        (
            "sound",
            "sounds.json",
            r#"{
                "hearth:splash": {"volume": 0.8},
                "hearth:sizzle": {}
            }"#,
        )
    }

    fn builder() -> AssetRegistryBuilder {
        let mut builder = AssetRegistryBuilder::new();
        builder.register::<Sound>().unwrap();
        builder.register::<Fluid>().unwrap();
        builder
    }

    #[test]
    fn load_resolves_inheritance_and_interns_references() {
        let source = MapSource::with(&[
            sound_files(),
            (
                "fluid",
                "fluids.json",
                r#"{
                    "hearth:water": {"flow_rate": 5, "splash_sound": "hearth:splash"},
                    "hearth:deep_water": {"inherit": "hearth:water", "can_demote": false}
                }"#,
            ),
        ]);

        let registry = builder().load(&source).unwrap();

        let water = Ident::new("hearth:water").unwrap();
        let deep = Ident::new("hearth:deep_water").unwrap();

        // Child inherited flow_rate and splash_sound, overrode can_demote.
        let deep_water = registry.get::<Fluid>(&deep).unwrap();
        assert_eq!(deep_water.flow_rate, 5);
        assert!(!deep_water.can_demote);
        assert_eq!(deep_water.splash_sound, "hearth:splash");

        // Indices assigned in sorted-key order: deep_water before water.
        assert_eq!(registry.index_of::<Fluid>(&deep), Some(0));
        assert_eq!(registry.index_of::<Fluid>(&water), Some(1));

        // The hook interned the sound key to its index.
        let sizzle = Ident::new("hearth:sizzle").unwrap();
        let splash = Ident::new("hearth:splash").unwrap();
        assert_eq!(
            registry.index_of::<Sound>(&splash),
            Some(deep_water.splash_index)
        );
        assert!(registry.index_of::<Sound>(&sizzle).is_some());
        assert_eq!(
            registry.by_index::<Fluid>(1).unwrap().splash_sound,
            "hearth:splash"
        );
    }

    #[test]
    fn inheritance_cycles_are_startup_fatal() {
        let source = MapSource::with(&[
            sound_files(),
            (
                "fluid",
                "fluids.json",
                r#"{
                    "hearth:a": {"inherit": "hearth:b", "flow_rate": 1, "splash_sound": "hearth:splash"},
                    "hearth:b": {"inherit": "hearth:a"}
                }"#,
            ),
        ]);

        assert!(matches!(
            builder().load(&source),
            Err(AssetError::CyclicInheritance { .. })
        ));
    }

    #[test]
    fn unknown_parent_is_startup_fatal() {
        let source = MapSource::with(&[
            sound_files(),
            (
                "fluid",
                "fluids.json",
                r#"{"hearth:a": {"inherit": "hearth:ghost", "flow_rate": 1, "splash_sound": "hearth:splash"}}"#,
            ),
        ]);

        assert!(matches!(
            builder().load(&source),
            Err(AssetError::UnknownParent { .. })
        ));
    }

    #[test]
    fn reload_preserves_surviving_indices() {
        let source = MapSource::with(&[
            sound_files(),
            (
                "fluid",
                "fluids.json",
                r#"{
                    "hearth:lava": {"flow_rate": 10, "splash_sound": "hearth:sizzle"},
                    "hearth:water": {"flow_rate": 5, "splash_sound": "hearth:splash"}
                }"#,
            ),
        ]);

        let mut registry = builder().load(&source).unwrap();

        let lava = Ident::new("hearth:lava").unwrap();
        let water = Ident::new("hearth:water").unwrap();
        let lava_index = registry.index_of::<Fluid>(&lava).unwrap();
        let water_index = registry.index_of::<Fluid>(&water).unwrap();

        // Drop lava, change water, add mud.
        source.replace(&[
            sound_files(),
            (
                "fluid",
                "fluids.json",
                r#"{
                    "hearth:mud": {"flow_rate": 20, "splash_sound": "hearth:splash"},
                    "hearth:water": {"flow_rate": 7, "splash_sound": "hearth:splash"}
                }"#,
            ),
        ]);

        let diff = registry.reload::<Fluid>(&source).unwrap();

        // Water kept its index across the reload; mud extended the range.
        let mud = Ident::new("hearth:mud").unwrap();
        assert_eq!(registry.index_of::<Fluid>(&water), Some(water_index));
        let mud_index = registry.index_of::<Fluid>(&mud).unwrap();
        assert_eq!(mud_index, 2);

        // Lava's index is retired, not re-bound.
        assert!(registry.by_index::<Fluid>(lava_index).is_none());
        assert_eq!(registry.get::<Fluid>(&water).unwrap().flow_rate, 7);

        assert_eq!(diff.removed, vec![lava]);
        let mut upserted_keys: Vec<_> =
            diff.upserted.iter().map(|(k, _)| k.as_str()).collect();
        upserted_keys.sort_unstable();
        assert_eq!(upserted_keys, ["hearth:mud", "hearth:water"]);

        assert_eq!(registry.generation::<Fluid>(), Some(1));
    }

    #[test]
    fn duplicate_keys_across_files_are_rejected() {
        let source = MapSource::with(&[
            sound_files(),
            (
                "fluid",
                "a.json",
                r#"{"hearth:water": {"flow_rate": 5, "splash_sound": "hearth:splash"}}"#,
            ),
            (
                "fluid",
                "b.json",
                r#"{"hearth:water": {"flow_rate": 9, "splash_sound": "hearth:splash"}}"#,
            ),
        ]);

        assert!(matches!(
            builder().load(&source),
            Err(AssetError::DuplicateKey { .. })
        ));
    }
}

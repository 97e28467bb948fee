//! Replicated document state for one room.
//!
//! Layout inside the Yrs document:
//!
//! ```text
//! Doc
//!  ├── map "operations"  opId            → DrawingOperation JSON (append-only)
//!  ├── map "objects"     "{id}/{field}"  → field value JSON
//!  ├── map "background"  "state"         → BackgroundState JSON (absent = none)
//!  └── map "settings"    "brushSize" | "brushColor"
//! ```
//!
//! Objects are stored one map entry per field, so concurrent edits to
//! different fields of the same object both survive the merge. An object
//! exists while its `type` entry exists; fields written concurrently with a
//! removal are left behind without a `type` and are ignored by readers.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Doc, Map, MapRef, Observable, Out, ReadTxn, StateVector, Subscription, Transact,
    TransactionMut, Update,
};

use crate::error::StoreError;
use crate::model::{
    BackgroundState, BrushDefaults, CanvasObject, DrawingOperation, ObjectId, ObjectKind,
    ObjectUpdate,
};

const OPERATIONS: &str = "operations";
const OBJECTS: &str = "objects";
const BACKGROUND: &str = "background";
const SETTINGS: &str = "settings";

const BACKGROUND_KEY: &str = "state";
const BRUSH_SIZE_KEY: &str = "brushSize";
const BRUSH_COLOR_KEY: &str = "brushColor";
const TYPE_FIELD: &str = "type";

/// Encoded Yrs v1 update produced by a local mutation.
pub type Delta = Vec<u8>;

/// What a merged update changed, as seen by readers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreChanges {
    /// Operations that became visible, in log order.
    pub operations: Vec<DrawingOperation>,
    pub objects_changed: bool,
    pub background_changed: bool,
    pub settings_changed: bool,
}

impl StoreChanges {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
            && !self.objects_changed
            && !self.background_changed
            && !self.settings_changed
    }
}

/// Set by root-map observers while a transaction commits.
#[derive(Default)]
struct ChangeFlags {
    operations: AtomicBool,
    objects: AtomicBool,
    background: AtomicBool,
    settings: AtomicBool,
}

impl ChangeFlags {
    fn reset(&self) {
        self.operations.store(false, Ordering::Relaxed);
        self.objects.store(false, Ordering::Relaxed);
        self.background.store(false, Ordering::Relaxed);
        self.settings.store(false, Ordering::Relaxed);
    }
}

/// Eventually-consistent replica of one room's drawing state.
///
/// Every mutation is applied to the local replica before it returns and
/// hands back the delta to propagate; the network is never consulted.
pub struct SharedDocumentStore {
    doc: Doc,
    operations: MapRef,
    objects: MapRef,
    background: MapRef,
    settings: MapRef,
    /// Operation keys already surfaced to readers of `StoreChanges`.
    known_operations: HashSet<String>,
    changes: Arc<ChangeFlags>,
    _subscriptions: Vec<Subscription>,
}

impl Default for SharedDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedDocumentStore {
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    /// Create with a fixed replica client id (deterministic tests).
    pub fn with_client_id(client_id: u64) -> Self {
        Self::from_doc(Doc::with_client_id(client_id))
    }

    fn from_doc(doc: Doc) -> Self {
        let operations = doc.get_or_insert_map(OPERATIONS);
        let objects = doc.get_or_insert_map(OBJECTS);
        let background = doc.get_or_insert_map(BACKGROUND);
        let settings = doc.get_or_insert_map(SETTINGS);

        let changes = Arc::new(ChangeFlags::default());
        let mut subscriptions = Vec::with_capacity(4);
        {
            let flags = changes.clone();
            subscriptions.push(operations.observe(move |_txn, _event| {
                flags.operations.store(true, Ordering::Relaxed);
            }));
        }
        {
            let flags = changes.clone();
            subscriptions.push(objects.observe(move |_txn, _event| {
                flags.objects.store(true, Ordering::Relaxed);
            }));
        }
        {
            let flags = changes.clone();
            subscriptions.push(background.observe(move |_txn, _event| {
                flags.background.store(true, Ordering::Relaxed);
            }));
        }
        {
            let flags = changes.clone();
            subscriptions.push(settings.observe(move |_txn, _event| {
                flags.settings.store(true, Ordering::Relaxed);
            }));
        }

        Self {
            doc,
            operations,
            objects,
            background,
            settings,
            known_operations: HashSet::new(),
            changes,
            _subscriptions: subscriptions,
        }
    }

    /// Replica client id used by the CRDT for tie-breaking.
    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    // ── Local mutations ─────────────────────────────────────────

    /// Append a drawing operation to the log.
    ///
    /// Appending an id that is already present is a no-op apart from the
    /// returned delta.
    pub fn add_operation(&mut self, op: &DrawingOperation) -> Result<Delta, StoreError> {
        if !op.is_finite() {
            return Err(non_finite(format!("operation {}", op.id)));
        }
        let key = op.id.to_key();
        let json =
            serde_json::to_string(op).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.known_operations.insert(key.clone());

        let mut txn = self.doc.transact_mut();
        if self.operations.get(&txn, &key).is_none() {
            self.operations.insert(&mut txn, key, json);
        }
        Ok(txn.encode_update_v1())
    }

    /// Create a new object with a generated id.
    pub fn add_object(
        &mut self,
        x: f64,
        y: f64,
        kind: ObjectKind,
    ) -> Result<(ObjectId, Delta), StoreError> {
        let object = CanvasObject::new(ObjectId::generate(), x, y, kind);
        let delta = self.insert_object(&object)?;
        Ok((object.id, delta))
    }

    /// Write every field of `object` under its own id.
    pub fn insert_object(&mut self, object: &CanvasObject) -> Result<Delta, StoreError> {
        if !object.is_finite() {
            return Err(non_finite(format!("object {}", object.id)));
        }
        let fields = to_fields(object)?;
        let mut txn = self.doc.transact_mut();
        write_fields(&self.objects, &mut txn, &object.id, fields);
        Ok(txn.encode_update_v1())
    }

    /// Overwrite only the fields present in `update`.
    pub fn update_object(
        &mut self,
        id: &ObjectId,
        update: &ObjectUpdate,
    ) -> Result<Delta, StoreError> {
        if !update.is_finite() {
            return Err(non_finite(format!("update of object {id}")));
        }
        let fields = to_fields(update)?;
        let mut txn = self.doc.transact_mut();
        if self.objects.get(&txn, &field_key(id, TYPE_FIELD)).is_none() {
            return Err(StoreError::ObjectNotFound(id.clone()));
        }
        write_fields(&self.objects, &mut txn, id, fields);
        Ok(txn.encode_update_v1())
    }

    pub fn remove_object(&mut self, id: &ObjectId) -> Delta {
        let mut txn = self.doc.transact_mut();
        let keys: Vec<String> = self
            .objects
            .keys(&txn)
            .filter(|key| matches!(key.rsplit_once('/'), Some((owner, _)) if owner == id.as_str()))
            .map(str::to_string)
            .collect();
        for key in keys {
            self.objects.remove(&mut txn, &key);
        }
        txn.encode_update_v1()
    }

    /// Remove every canvas object.
    pub fn clear_objects(&mut self) -> Delta {
        let mut txn = self.doc.transact_mut();
        self.objects.clear(&mut txn);
        txn.encode_update_v1()
    }

    /// Replace the background as a whole. `None` or an empty data URL clears it.
    pub fn set_background_state(
        &mut self,
        state: Option<&BackgroundState>,
    ) -> Result<Delta, StoreError> {
        let json = match state.filter(|s| s.has_image()) {
            Some(state) => {
                let state = state.clone().clamped();
                if !state.is_finite() {
                    return Err(non_finite("background".to_string()));
                }
                Some(
                    serde_json::to_string(&state)
                        .map_err(|e| StoreError::Serialization(e.to_string()))?,
                )
            }
            None => None,
        };

        let mut txn = self.doc.transact_mut();
        match json {
            Some(json) => {
                self.background.insert(&mut txn, BACKGROUND_KEY, json);
            }
            None => {
                self.background.remove(&mut txn, BACKGROUND_KEY);
            }
        }
        Ok(txn.encode_update_v1())
    }

    /// A non-finite `size` leaves the stored size as it was.
    pub fn set_brush_defaults(&mut self, size: f64, color: &str) -> Delta {
        let mut txn = self.doc.transact_mut();
        if size.is_finite() {
            self.settings
                .insert(&mut txn, BRUSH_SIZE_KEY, Value::from(size).to_string());
        } else {
            log::warn!("Ignoring non-finite brush size {size}");
        }
        self.settings
            .insert(&mut txn, BRUSH_COLOR_KEY, Value::from(color).to_string());
        txn.encode_update_v1()
    }

    // ── Readers ─────────────────────────────────────────────────

    /// The whole drawing log ordered by (timestamp, user, seq).
    pub fn all_operations(&self) -> Vec<DrawingOperation> {
        let txn = self.doc.transact();
        let (mut ops, errors) = collect_operations(&self.operations, &txn);
        log_skipped("operation", &errors);
        sort_operations(&mut ops);
        ops
    }

    pub fn operation_count(&self) -> usize {
        let txn = self.doc.transact();
        self.operations.len(&txn) as usize
    }

    pub fn all_objects(&self) -> BTreeMap<ObjectId, CanvasObject> {
        let txn = self.doc.transact();
        let (objects, errors) = collect_objects(&self.objects, &txn);
        log_skipped("object", &errors);
        objects
    }

    pub fn object(&self, id: &ObjectId) -> Option<CanvasObject> {
        self.all_objects().remove(id)
    }

    pub fn background_state(&self) -> Option<BackgroundState> {
        let txn = self.doc.transact();
        match read_background(&self.background, &txn) {
            Ok(state) => state,
            Err(e) => {
                log::warn!("Ignoring malformed background state: {e}");
                None
            }
        }
    }

    pub fn brush_defaults(&self) -> BrushDefaults {
        let txn = self.doc.transact();
        read_brush_defaults(&self.settings, &txn).unwrap_or_default()
    }

    // ── Replication ─────────────────────────────────────────────

    /// Merge a remote delta and report what became visible.
    pub fn apply_update(&mut self, update: &[u8]) -> Result<StoreChanges, StoreError> {
        let update = Update::decode_v1(update)
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;

        self.changes.reset();
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        }
        Ok(self.take_changes())
    }

    /// Encoded state vector, sent as the first relay sync step.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything this replica has that `state_vector` lacks.
    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Delta, StoreError> {
        let sv = StateVector::decode_v1(state_vector)
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Full replica state as one update.
    pub fn encode_state(&self) -> Delta {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Opaque snapshot string: base64 of the LZ4-compressed full update.
    pub fn export_state(&self) -> String {
        let compressed = lz4_flex::compress_prepend_size(&self.encode_state());
        STANDARD.encode(compressed)
    }

    /// Restore a snapshot produced by [`export_state`](Self::export_state).
    ///
    /// All-or-nothing: the snapshot is decoded and merged into a scratch
    /// replica first, and the live replica is only touched once that merge
    /// succeeds. Entries that do not parse are skipped the same way the
    /// readers skip them.
    pub fn import_state(&mut self, snapshot: &str) -> Result<StoreChanges, StoreError> {
        let compressed = STANDARD
            .decode(snapshot.trim())
            .map_err(|e| StoreError::Deserialization(format!("base64: {e}")))?;
        let update = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Deserialization(format!("lz4: {e}")))?;

        self.validate_update(&update)?;
        self.apply_update(&update)
    }

    fn validate_update(&self, update: &[u8]) -> Result<(), StoreError> {
        let scratch = Doc::new();
        let operations = scratch.get_or_insert_map(OPERATIONS);
        let objects = scratch.get_or_insert_map(OBJECTS);
        let background = scratch.get_or_insert_map(BACKGROUND);
        let settings = scratch.get_or_insert_map(SETTINGS);

        let base = Update::decode_v1(&self.encode_state())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        let incoming = Update::decode_v1(update)
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        {
            let mut txn = scratch.transact_mut();
            txn.apply_update(base)
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            txn.apply_update(incoming)
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        }

        let txn = scratch.transact();
        let (_, op_errors) = collect_operations(&operations, &txn);
        log_skipped("operation in snapshot", &op_errors);
        let (_, object_errors) = collect_objects(&objects, &txn);
        log_skipped("object in snapshot", &object_errors);
        if let Err(e) = read_background(&background, &txn) {
            log::warn!("Snapshot background will be ignored: {e}");
        }
        if let Err(e) = read_brush_defaults(&settings, &txn) {
            log::warn!("Snapshot brush defaults will be ignored: {e}");
        }
        Ok(())
    }

    fn take_changes(&mut self) -> StoreChanges {
        let mut changes = StoreChanges {
            operations: Vec::new(),
            objects_changed: self.changes.objects.swap(false, Ordering::Relaxed),
            background_changed: self.changes.background.swap(false, Ordering::Relaxed),
            settings_changed: self.changes.settings.swap(false, Ordering::Relaxed),
        };

        if self.changes.operations.swap(false, Ordering::Relaxed) {
            let txn = self.doc.transact();
            let fresh: Vec<String> = self
                .operations
                .keys(&txn)
                .filter(|key| !self.known_operations.contains(*key))
                .map(str::to_string)
                .collect();

            for key in fresh {
                match read_string(&self.operations, &txn, &key)
                    .map(|raw| serde_json::from_str::<DrawingOperation>(&raw))
                {
                    Some(Ok(op)) => changes.operations.push(op),
                    Some(Err(e)) => log::warn!("Skipping malformed operation {key}: {e}"),
                    None => log::warn!("Skipping non-string operation entry {key}"),
                }
                self.known_operations.insert(key);
            }
            sort_operations(&mut changes.operations);
        }

        changes
    }
}

// ───────────────────────────────────────────────────────────────────
// Field helpers
// ───────────────────────────────────────────────────────────────────

fn non_finite(what: String) -> StoreError {
    StoreError::Serialization(format!("{what} has a NaN or infinite value"))
}

fn field_key(id: &ObjectId, field: &str) -> String {
    format!("{id}/{field}")
}

fn to_fields<T: serde::Serialize>(value: &T) -> Result<serde_json::Map<String, Value>, StoreError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(other) => Err(StoreError::Serialization(format!(
            "expected an object, got {other}"
        ))),
        Err(e) => Err(StoreError::Serialization(e.to_string())),
    }
}

fn write_fields(
    objects: &MapRef,
    txn: &mut TransactionMut,
    id: &ObjectId,
    fields: serde_json::Map<String, Value>,
) {
    for (field, value) in fields {
        if field == "id" {
            continue;
        }
        objects.insert(txn, field_key(id, &field), value.to_string());
    }
}

fn read_string<T: ReadTxn>(map: &MapRef, txn: &T, key: &str) -> Option<String> {
    match map.get(txn, key)? {
        Out::Any(Any::String(raw)) => Some(raw.to_string()),
        _ => None,
    }
}

fn collect_operations<T: ReadTxn>(
    map: &MapRef,
    txn: &T,
) -> (Vec<DrawingOperation>, Vec<String>) {
    let mut ops = Vec::new();
    let mut errors = Vec::new();
    for (key, value) in map.iter(txn) {
        match value {
            Out::Any(Any::String(raw)) => match serde_json::from_str::<DrawingOperation>(&raw) {
                Ok(op) => ops.push(op),
                Err(e) => errors.push(format!("{key}: {e}")),
            },
            _ => errors.push(format!("{key}: not a JSON string")),
        }
    }
    (ops, errors)
}

fn collect_objects<T: ReadTxn>(
    map: &MapRef,
    txn: &T,
) -> (BTreeMap<ObjectId, CanvasObject>, Vec<String>) {
    let mut grouped: BTreeMap<String, serde_json::Map<String, Value>> = BTreeMap::new();
    let mut errors = Vec::new();

    for (key, value) in map.iter(txn) {
        let Some((id, field)) = key.rsplit_once('/') else {
            errors.push(format!("{key}: missing field separator"));
            continue;
        };
        let Out::Any(Any::String(raw)) = value else {
            errors.push(format!("{key}: not a JSON string"));
            continue;
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(v) => {
                grouped
                    .entry(id.to_string())
                    .or_default()
                    .insert(field.to_string(), v);
            }
            Err(e) => errors.push(format!("{key}: {e}")),
        }
    }

    let mut objects = BTreeMap::new();
    for (id, mut fields) in grouped {
        if !fields.contains_key(TYPE_FIELD) {
            continue;
        }
        fields.insert("id".to_string(), Value::String(id.clone()));
        match serde_json::from_value::<CanvasObject>(Value::Object(fields)) {
            Ok(object) => {
                objects.insert(object.id.clone(), object);
            }
            Err(e) => errors.push(format!("{id}: {e}")),
        }
    }
    (objects, errors)
}

fn read_background<T: ReadTxn>(
    map: &MapRef,
    txn: &T,
) -> Result<Option<BackgroundState>, StoreError> {
    let Some(raw) = read_string(map, txn, BACKGROUND_KEY) else {
        return Ok(None);
    };
    let state: BackgroundState = serde_json::from_str(&raw)
        .map_err(|e| StoreError::Deserialization(format!("background: {e}")))?;
    Ok(Some(state).filter(BackgroundState::has_image))
}

fn read_brush_defaults<T: ReadTxn>(map: &MapRef, txn: &T) -> Result<BrushDefaults, StoreError> {
    let mut defaults = BrushDefaults::default();
    if let Some(raw) = read_string(map, txn, BRUSH_SIZE_KEY) {
        defaults.size = serde_json::from_str(&raw)
            .map_err(|e| StoreError::Deserialization(format!("brush size: {e}")))?;
    }
    if let Some(raw) = read_string(map, txn, BRUSH_COLOR_KEY) {
        defaults.color = serde_json::from_str(&raw)
            .map_err(|e| StoreError::Deserialization(format!("brush color: {e}")))?;
    }
    Ok(defaults)
}

fn sort_operations(ops: &mut [DrawingOperation]) {
    ops.sort_by(|a, b| {
        (a.id.timestamp, &a.id.user_id, a.id.seq).cmp(&(b.id.timestamp, &b.id.user_id, b.id.seq))
    });
}

fn log_skipped(what: &str, errors: &[String]) {
    for e in errors {
        log::warn!("Skipping malformed {what} {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OperationId, OperationKind, ShapeTool, Size, UserId};

    fn op(user: &str, ts: u64, seq: u64, x: f64, y: f64) -> DrawingOperation {
        DrawingOperation::stroke(
            OperationId::new(UserId::from(user), ts, seq),
            OperationKind::Draw,
            x,
            y,
            5.0,
            "#ff0000",
        )
    }

    fn image(scale: f64) -> ObjectKind {
        ObjectKind::Image {
            data_url: "data:image/png;base64,AAAA".into(),
            width: 40.0,
            height: 20.0,
            scale,
        }
    }

    #[test]
    fn test_local_write_visible_immediately() {
        let mut store = SharedDocumentStore::new();
        store.add_operation(&op("a", 1, 0, 10.0, 10.0)).unwrap();
        let (id, _) = store.add_object(100.0, 100.0, image(0.5)).unwrap();

        assert_eq!(store.all_operations().len(), 1);
        let object = store.object(&id).unwrap();
        assert_eq!(object.x, 100.0);
        assert_eq!(object.transform().scale, Some(0.5));
    }

    #[test]
    fn test_delta_replicates_operations_in_log_order() {
        let mut a = SharedDocumentStore::new();
        let mut b = SharedDocumentStore::new();

        let d1 = a.add_operation(&op("a", 2, 1, 12.0, 11.0)).unwrap();
        let d0 = a.add_operation(&op("a", 1, 0, 10.0, 10.0)).unwrap();

        let changes = b.apply_update(&d1).unwrap();
        assert_eq!(changes.operations.len(), 1);
        let changes = b.apply_update(&d0).unwrap();
        assert_eq!(changes.operations.len(), 1);

        let ops = b.all_operations();
        assert_eq!(ops[0].id.seq, 0);
        assert_eq!(ops[1].id.seq, 1);
    }

    #[test]
    fn test_reapplying_delta_surfaces_nothing_new() {
        let mut a = SharedDocumentStore::new();
        let mut b = SharedDocumentStore::new();
        let delta = a.add_operation(&op("a", 1, 0, 1.0, 1.0)).unwrap();

        assert_eq!(b.apply_update(&delta).unwrap().operations.len(), 1);
        assert!(b.apply_update(&delta).unwrap().operations.is_empty());
        assert_eq!(b.operation_count(), 1);
    }

    #[test]
    fn test_own_operations_are_not_resurfaced() {
        let mut a = SharedDocumentStore::new();
        let delta = a.add_operation(&op("a", 1, 0, 1.0, 1.0)).unwrap();
        let changes = a.apply_update(&delta).unwrap();
        assert!(changes.operations.is_empty());
    }

    #[test]
    fn test_disjoint_field_edits_converge_in_any_order() {
        let mut origin = SharedDocumentStore::with_client_id(1);
        let (id, created) = origin.add_object(0.0, 0.0, image(1.0)).unwrap();

        let mut a = SharedDocumentStore::with_client_id(2);
        let mut b = SharedDocumentStore::with_client_id(3);
        a.apply_update(&created).unwrap();
        b.apply_update(&created).unwrap();

        let move_delta = a.update_object(&id, &ObjectUpdate::position(50.0, 60.0)).unwrap();
        let scale_delta = b
            .update_object(&id, &ObjectUpdate { scale: Some(2.0), ..Default::default() })
            .unwrap();

        let mut forward = SharedDocumentStore::with_client_id(4);
        forward.apply_update(&created).unwrap();
        forward.apply_update(&move_delta).unwrap();
        forward.apply_update(&scale_delta).unwrap();

        let mut backward = SharedDocumentStore::with_client_id(5);
        backward.apply_update(&scale_delta).unwrap();
        backward.apply_update(&move_delta).unwrap();
        backward.apply_update(&created).unwrap();

        a.apply_update(&scale_delta).unwrap();
        b.apply_update(&move_delta).unwrap();

        let expected = forward.object(&id).unwrap();
        assert_eq!(expected.x, 50.0);
        assert_eq!(expected.y, 60.0);
        assert_eq!(expected.transform().scale, Some(2.0));
        assert_eq!(backward.object(&id), Some(expected.clone()));
        assert_eq!(a.object(&id), Some(expected.clone()));
        assert_eq!(b.object(&id), Some(expected));
    }

    #[test]
    fn test_update_missing_object_fails() {
        let mut store = SharedDocumentStore::new();
        let err = store
            .update_object(&ObjectId::from("ghost"), &ObjectUpdate::position(1.0, 1.0))
            .unwrap_err();
        assert!(matches!(err, StoreError::ObjectNotFound(_)));
    }

    #[test]
    fn test_remove_object_and_concurrent_edit_stays_removed() {
        let mut a = SharedDocumentStore::with_client_id(1);
        let (id, created) = a
            .add_object(
                1.0,
                2.0,
                ObjectKind::Shape {
                    tool: ShapeTool::Rectangle,
                    x2: 5.0,
                    y2: 6.0,
                    brush_size: 2.0,
                    color: "#000".into(),
                },
            )
            .unwrap();
        let mut b = SharedDocumentStore::with_client_id(2);
        b.apply_update(&created).unwrap();

        let removed = a.remove_object(&id);
        let moved = b.update_object(&id, &ObjectUpdate::position(9.0, 9.0)).unwrap();

        a.apply_update(&moved).unwrap();
        b.apply_update(&removed).unwrap();

        assert!(a.all_objects().is_empty());
        assert!(b.all_objects().is_empty());
    }

    #[test]
    fn test_objects_changed_flag() {
        let mut a = SharedDocumentStore::new();
        let mut b = SharedDocumentStore::new();
        let (_, delta) = a.add_object(0.0, 0.0, image(1.0)).unwrap();
        let changes = b.apply_update(&delta).unwrap();
        assert!(changes.objects_changed);
        assert!(!changes.background_changed);
        assert!(changes.operations.is_empty());
    }

    #[test]
    fn test_background_whole_value_replace_and_clear() {
        let mut a = SharedDocumentStore::new();
        let mut b = SharedDocumentStore::new();

        let mut bg = BackgroundState::new("data:image/png;base64,BBBB", Size { width: 800.0, height: 600.0 });
        bg.scale = 9.0;
        let delta = a.set_background_state(Some(&bg)).unwrap();
        let changes = b.apply_update(&delta).unwrap();
        assert!(changes.background_changed);

        let received = b.background_state().unwrap();
        assert_eq!(received.scale, 5.0);
        assert_eq!(received.original_size.width, 800.0);

        let delta = a.set_background_state(None).unwrap();
        b.apply_update(&delta).unwrap();
        assert!(b.background_state().is_none());
    }

    #[test]
    fn test_empty_data_url_clears_background() {
        let mut store = SharedDocumentStore::new();
        store
            .set_background_state(Some(&BackgroundState::new("data:x", Size::default())))
            .unwrap();
        store
            .set_background_state(Some(&BackgroundState::new("", Size::default())))
            .unwrap();
        assert!(store.background_state().is_none());
    }

    #[test]
    fn test_brush_defaults() {
        let mut store = SharedDocumentStore::new();
        assert_eq!(store.brush_defaults(), BrushDefaults::default());
        store.set_brush_defaults(12.0, "#00ff00");
        let defaults = store.brush_defaults();
        assert_eq!(defaults.size, 12.0);
        assert_eq!(defaults.color, "#00ff00");
    }

    #[test]
    fn test_export_import_round_trip() {
        let mut source = SharedDocumentStore::new();
        source.add_operation(&op("a", 1, 0, 10.0, 10.0)).unwrap();
        source.add_operation(&op("a", 2, 1, 12.0, 11.0)).unwrap();
        source.add_object(100.0, 100.0, image(0.5)).unwrap();
        source
            .set_background_state(Some(&BackgroundState::new("data:bg", Size { width: 10.0, height: 10.0 })))
            .unwrap();

        let snapshot = source.export_state();
        let mut restored = SharedDocumentStore::new();
        let changes = restored.import_state(&snapshot).unwrap();

        assert_eq!(changes.operations.len(), 2);
        assert_eq!(restored.all_operations(), source.all_operations());
        assert_eq!(restored.all_objects(), source.all_objects());
        assert_eq!(restored.background_state(), source.background_state());
    }

    #[test]
    fn test_import_garbage_leaves_state_untouched() {
        let mut store = SharedDocumentStore::new();
        store.add_operation(&op("a", 1, 0, 1.0, 1.0)).unwrap();
        let before = store.export_state();

        for bad in ["not base64 !!", "AAAA", &STANDARD.encode(b"\x05\x00\x00\x00abc")] {
            let err = store.import_state(bad).unwrap_err();
            assert!(matches!(err, StoreError::Deserialization(_)), "{bad}");
        }
        assert_eq!(store.all_operations().len(), 1);
        assert_eq!(store.export_state(), before);
    }

    #[test]
    fn test_import_skips_malformed_entry() {
        // A replica holding one good operation and one that does not parse.
        let rogue = Doc::new();
        let ops = rogue.get_or_insert_map(OPERATIONS);
        let good = op("a", 1, 0, 1.0, 1.0);
        {
            let mut txn = rogue.transact_mut();
            ops.insert(&mut txn, "x:1:0", "{\"not\":\"an op\"}".to_string());
            ops.insert(&mut txn, good.id.to_key(), serde_json::to_string(&good).unwrap());
        }
        let update = rogue.transact().encode_state_as_update_v1(&StateVector::default());
        let snapshot = STANDARD.encode(lz4_flex::compress_prepend_size(&update));

        let mut store = SharedDocumentStore::new();
        let changes = store.import_state(&snapshot).unwrap();
        assert_eq!(changes.operations, vec![good.clone()]);
        assert_eq!(store.all_operations(), vec![good]);

        // Exporting what the replica tolerated imports again.
        let mut again = SharedDocumentStore::new();
        again.import_state(&store.export_state()).unwrap();
        assert_eq!(again.all_operations().len(), 1);
    }

    #[test]
    fn test_non_finite_writes_rejected() {
        let mut store = SharedDocumentStore::new();
        let err = store.add_operation(&op("a", 1, 0, f64::NAN, 1.0)).unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));

        let err = store.add_object(f64::INFINITY, 0.0, image(1.0)).unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));

        let (id, _) = store.add_object(0.0, 0.0, image(1.0)).unwrap();
        let nan_scale = ObjectUpdate { scale: Some(f64::NAN), ..Default::default() };
        assert!(store.update_object(&id, &nan_scale).is_err());

        let mut bg = BackgroundState::new("data:bg", Size { width: 1.0, height: 1.0 });
        bg.y = f64::NAN;
        assert!(store.set_background_state(Some(&bg)).is_err());
        assert!(store.background_state().is_none());

        store.set_brush_defaults(f64::INFINITY, "#123456");
        assert_eq!(store.brush_defaults().size, BrushDefaults::default().size);
        assert_eq!(store.brush_defaults().color, "#123456");

        assert_eq!(store.operation_count(), 0);
        assert_eq!(store.object(&id).unwrap().transform().scale, Some(1.0));

        let mut restored = SharedDocumentStore::new();
        restored.import_state(&store.export_state()).unwrap();
        assert_eq!(restored.all_objects(), store.all_objects());
    }

    #[test]
    fn test_store_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<SharedDocumentStore>();
    }

    #[test]
    fn test_diff_sync_between_replicas() {
        let mut a = SharedDocumentStore::new();
        let mut b = SharedDocumentStore::new();
        a.add_operation(&op("a", 1, 0, 1.0, 1.0)).unwrap();
        b.add_operation(&op("b", 1, 0, 2.0, 2.0)).unwrap();

        let for_b = a.encode_diff(&b.state_vector()).unwrap();
        let for_a = b.encode_diff(&a.state_vector()).unwrap();
        b.apply_update(&for_b).unwrap();
        a.apply_update(&for_a).unwrap();

        assert_eq!(a.all_operations(), b.all_operations());
        assert_eq!(a.operation_count(), 2);
    }

    #[test]
    fn test_clear_objects() {
        let mut store = SharedDocumentStore::new();
        store.add_object(0.0, 0.0, image(1.0)).unwrap();
        store.add_object(5.0, 5.0, image(1.0)).unwrap();
        store.clear_objects();
        assert!(store.all_objects().is_empty());
    }
}

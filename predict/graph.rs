// ========================================================================================
//
//                         THE MODEL ARTIFACT OBJECT GRAPH
//
// ========================================================================================
//
// ### Purpose ###
//
// A fitted classifier is not a tree. Pipelines hold their steps, steps hold nested
// sub-estimators, and some of those point back at their parent. This module holds
// such a graph in memory as shared, interior-mutable nodes so that a node reachable
// along two paths is one node, and a patch applied to it is seen along both.
//
// ### Document Format ###
//
// On disk an artifact is a JSON document with a few reserved keys:
//
//   {"$type": "KernelPCA", "alphas_": [...]}   a typed attribute container
//   {"gamma": 1.0}                             a plain mapping
//   [1, 2, 3]                                  a sequence
//   {"$set": [...]}                            a set
//   {"$list": [...], "$id": 4}                 a sequence that is referenced elsewhere
//   "$id": 7  /  {"$ref": 7}                   registration and back-reference
//
// A `$ref` may only name a node whose `$id` has already been opened, which is exactly
// what a back-reference (including a self-reference) needs.

use crate::patch::GraphNode;
use ahash::{AHashMap, AHashSet};
use serde_json::{Map, Value as Json};
use std::cell::RefCell;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;
use std::rc::Rc;
use thiserror::Error;

const TYPE_KEY: &str = "$type";
const ID_KEY: &str = "$id";
const REF_KEY: &str = "$ref";
const SET_KEY: &str = "$set";
const LIST_KEY: &str = "$list";

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Model artifact is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Model artifact refers to object '{0}' before it is defined.")]
    UnknownReference(String),
    #[error("Model artifact defines object '{0}' more than once.")]
    DuplicateId(String),
    #[error("Model artifact uses an invalid object id: {0}")]
    InvalidId(String),
    #[error("A '$ref' object must not carry any other keys (found {0}).")]
    MalformedReference(String),
    #[error("The value under '{0}' must be a JSON array.")]
    ExpectedArray(&'static str),
    #[error("The root of a model artifact must be an object or array, not a scalar.")]
    ScalarRoot,
}

/// A leaf or an edge to another node.
#[derive(Debug, Clone)]
pub enum Value {
    Scalar(Json),
    Node(ObjectRef),
}

impl Value {
    pub fn as_node(&self) -> Option<&ObjectRef> {
        match self {
            Value::Node(node) => Some(node),
            Value::Scalar(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Scalar(Json::String(s)) => Some(s),
            _ => None,
        }
    }
}

impl From<Json> for Value {
    fn from(json: Json) -> Self {
        Value::Scalar(json)
    }
}

impl From<ObjectRef> for Value {
    fn from(node: ObjectRef) -> Self {
        Value::Node(node)
    }
}

#[derive(Debug)]
pub enum Object {
    Instance {
        type_name: String,
        attrs: Vec<(String, Value)>,
    },
    Mapping(Vec<(String, Value)>),
    Sequence(Vec<Value>),
    Set(Vec<Value>),
}

/// A shared handle to one node of the graph. Clones alias the same node.
#[derive(Clone)]
pub struct ObjectRef(Rc<RefCell<Object>>);

impl fmt::Debug for ObjectRef {
    // Shallow on purpose: the graph may be cyclic.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &*self.0.borrow() {
            Object::Instance { type_name, .. } => type_name.clone(),
            Object::Mapping(_) => "mapping".to_string(),
            Object::Sequence(_) => "sequence".to_string(),
            Object::Set(_) => "set".to_string(),
        };
        write!(f, "ObjectRef({kind} @ {:#x})", self.identity())
    }
}

impl ObjectRef {
    pub fn new(object: Object) -> Self {
        ObjectRef(Rc::new(RefCell::new(object)))
    }

    pub fn instance(type_name: &str, attrs: Vec<(&str, Value)>) -> Self {
        Self::new(Object::Instance {
            type_name: type_name.to_string(),
            attrs: attrs.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        })
    }

    pub fn mapping(entries: Vec<(&str, Value)>) -> Self {
        Self::new(Object::Mapping(
            entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        ))
    }

    pub fn sequence(items: Vec<Value>) -> Self {
        Self::new(Object::Sequence(items))
    }

    pub fn set(items: Vec<Value>) -> Self {
        Self::new(Object::Set(items))
    }

    /// Stable for the lifetime of the node; two handles to one node share it.
    pub fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    pub fn type_name(&self) -> Option<String> {
        match &*self.0.borrow() {
            Object::Instance { type_name, .. } => Some(type_name.clone()),
            _ => None,
        }
    }

    /// An attribute of a typed container.
    pub fn attr(&self, name: &str) -> Option<Value> {
        match &*self.0.borrow() {
            Object::Instance { attrs, .. } => lookup(attrs, name),
            _ => None,
        }
    }

    /// An entry of a plain mapping.
    pub fn entry(&self, key: &str) -> Option<Value> {
        match &*self.0.borrow() {
            Object::Mapping(entries) => lookup(entries, key),
            _ => None,
        }
    }

    /// Sets an attribute on a typed container, replacing any previous value.
    /// Returns `false` if this node is not a typed container.
    pub fn set_attr(&self, name: &str, value: Value) -> bool {
        match &mut *self.0.borrow_mut() {
            Object::Instance { attrs, .. } => {
                match attrs.iter_mut().find(|(k, _)| k == name) {
                    Some(slot) => slot.1 = value,
                    None => attrs.push((name.to_string(), value)),
                }
                true
            }
            _ => false,
        }
    }

    /// Appends to a sequence or set. Returns `false` for any other node.
    #[cfg(test)]
    pub(crate) fn push_item(&self, value: Value) -> bool {
        match &mut *self.0.borrow_mut() {
            Object::Sequence(items) | Object::Set(items) => {
                items.push(value);
                true
            }
            _ => false,
        }
    }

    /// The string elements of a sequence or set; `None` if this is neither or if
    /// any element is not a string.
    pub fn strings(&self) -> Option<Vec<String>> {
        match &*self.0.borrow() {
            Object::Sequence(items) | Object::Set(items) => items
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => None,
        }
    }

    /// Every value directly held by this node, in stored order.
    fn values(&self) -> Vec<Value> {
        match &*self.0.borrow() {
            Object::Instance { attrs, .. } => attrs.iter().map(|(_, v)| v.clone()).collect(),
            Object::Mapping(entries) => entries.iter().map(|(_, v)| v.clone()).collect(),
            Object::Sequence(items) | Object::Set(items) => items.clone(),
        }
    }
}

fn lookup(pairs: &[(String, Value)], key: &str) -> Option<Value> {
    pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
}

impl GraphNode for ObjectRef {
    fn identity(&self) -> usize {
        ObjectRef::identity(self)
    }

    fn type_name(&self) -> Option<String> {
        ObjectRef::type_name(self)
    }

    fn children(&self) -> Vec<Self> {
        self.values()
            .into_iter()
            .filter_map(|v| match v {
                Value::Node(node) => Some(node),
                Value::Scalar(_) => None,
            })
            .collect()
    }

    fn has_attribute(&self, name: &str) -> bool {
        self.attr(name).is_some()
    }

    fn alias_attribute(&self, from: &str, to: &str) -> bool {
        match self.attr(from) {
            Some(value) => self.set_attr(to, value),
            None => false,
        }
    }
}

/// Reads an artifact document from disk.
pub fn load_artifact(path: &Path) -> Result<ObjectRef, GraphError> {
    let reader = BufReader::new(File::open(path)?);
    let document: Json = serde_json::from_reader(reader)?;
    decode(&document)
}

/// Writes an artifact document to disk, with ids only where a node is shared.
pub fn save_artifact(root: &ObjectRef, path: &Path) -> Result<(), GraphError> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut writer, &encode(root))?;
    writer.flush()?;
    Ok(())
}

pub fn decode(document: &Json) -> Result<ObjectRef, GraphError> {
    let mut decoder = Decoder::default();
    match decoder.decode(document)? {
        Value::Node(root) => Ok(root),
        Value::Scalar(_) => Err(GraphError::ScalarRoot),
    }
}

pub fn encode(root: &ObjectRef) -> Json {
    let mut encoder = Encoder {
        shared: shared_nodes(root),
        ids: AHashMap::new(),
    };
    encoder.encode_node(root)
}

#[derive(Default)]
struct Decoder {
    registry: AHashMap<String, ObjectRef>,
}

impl Decoder {
    fn decode(&mut self, json: &Json) -> Result<Value, GraphError> {
        match json {
            Json::Array(items) => {
                let node = ObjectRef::sequence(Vec::new());
                let decoded = self.decode_all(items)?;
                *node.0.borrow_mut() = Object::Sequence(decoded);
                Ok(Value::Node(node))
            }
            Json::Object(map) => self.decode_object(map),
            scalar => Ok(Value::Scalar(scalar.clone())),
        }
    }

    fn decode_all(&mut self, items: &[Json]) -> Result<Vec<Value>, GraphError> {
        items.iter().map(|item| self.decode(item)).collect()
    }

    fn decode_object(&mut self, map: &Map<String, Json>) -> Result<Value, GraphError> {
        if let Some(reference) = map.get(REF_KEY) {
            if map.len() != 1 {
                return Err(GraphError::MalformedReference(format!("{} keys", map.len())));
            }
            let id = id_key(reference)?;
            return match self.registry.get(&id) {
                Some(node) => Ok(Value::Node(node.clone())),
                None => Err(GraphError::UnknownReference(id)),
            };
        }

        // Register before descending so children can refer back to this node.
        let node = ObjectRef::mapping(Vec::new());
        if let Some(id) = map.get(ID_KEY) {
            let id = id_key(id)?;
            if self.registry.contains_key(&id) {
                return Err(GraphError::DuplicateId(id));
            }
            self.registry.insert(id, node.clone());
        }

        let object = if let Some(items) = map.get(SET_KEY) {
            Object::Set(self.decode_array(items, SET_KEY)?)
        } else if let Some(items) = map.get(LIST_KEY) {
            Object::Sequence(self.decode_array(items, LIST_KEY)?)
        } else {
            let mut pairs = Vec::with_capacity(map.len());
            for (key, value) in map {
                if key == TYPE_KEY || key == ID_KEY {
                    continue;
                }
                pairs.push((key.clone(), self.decode(value)?));
            }
            match map.get(TYPE_KEY).and_then(Json::as_str) {
                Some(type_name) => Object::Instance {
                    type_name: type_name.to_string(),
                    attrs: pairs,
                },
                None => Object::Mapping(pairs),
            }
        };
        *node.0.borrow_mut() = object;
        Ok(Value::Node(node))
    }

    fn decode_array(&mut self, json: &Json, key: &'static str) -> Result<Vec<Value>, GraphError> {
        match json {
            Json::Array(items) => self.decode_all(items),
            _ => Err(GraphError::ExpectedArray(key)),
        }
    }
}

fn id_key(json: &Json) -> Result<String, GraphError> {
    match json {
        Json::String(s) => Ok(s.clone()),
        Json::Number(n) => Ok(n.to_string()),
        other => Err(GraphError::InvalidId(other.to_string())),
    }
}

/// Nodes reachable along more than one path (or along a cycle).
fn shared_nodes(root: &ObjectRef) -> AHashSet<usize> {
    let mut seen = AHashSet::new();
    let mut shared = AHashSet::new();
    let mut worklist = vec![root.clone()];
    while let Some(node) = worklist.pop() {
        if !seen.insert(node.identity()) {
            shared.insert(node.identity());
            continue;
        }
        worklist.extend(GraphNode::children(&node));
    }
    shared
}

struct Encoder {
    shared: AHashSet<usize>,
    ids: AHashMap<usize, usize>,
}

impl Encoder {
    fn encode_value(&mut self, value: &Value) -> Json {
        match value {
            Value::Scalar(json) => json.clone(),
            Value::Node(node) => self.encode_node(node),
        }
    }

    fn encode_node(&mut self, node: &ObjectRef) -> Json {
        let identity = node.identity();
        if let Some(&id) = self.ids.get(&identity) {
            let mut reference = Map::new();
            reference.insert(REF_KEY.to_string(), Json::from(id));
            return Json::Object(reference);
        }

        let id = if self.shared.contains(&identity) {
            let id = self.ids.len() + 1;
            self.ids.insert(identity, id);
            Some(id)
        } else {
            None
        };

        let mut out = Map::new();
        if let Some(id) = id {
            out.insert(ID_KEY.to_string(), Json::from(id));
        }
        let object = node.0.borrow();
        match &*object {
            Object::Instance { type_name, attrs } => {
                out.insert(TYPE_KEY.to_string(), Json::from(type_name.as_str()));
                for (key, value) in attrs {
                    let encoded = self.encode_value(value);
                    out.insert(key.clone(), encoded);
                }
            }
            Object::Mapping(entries) => {
                for (key, value) in entries {
                    let encoded = self.encode_value(value);
                    out.insert(key.clone(), encoded);
                }
            }
            Object::Set(items) => {
                let encoded = items.iter().map(|v| self.encode_value(v)).collect();
                out.insert(SET_KEY.to_string(), Json::Array(encoded));
            }
            Object::Sequence(items) => {
                let encoded: Vec<Json> = items.iter().map(|v| self.encode_value(v)).collect();
                if id.is_none() {
                    return Json::Array(encoded);
                }
                out.insert(LIST_KEY.to_string(), Json::Array(encoded));
            }
        }
        Json::Object(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_typed_containers_mappings_and_sequences() {
        let root = decode(&json!({
            "$type": "Pipeline",
            "named_steps": {
                "preprocess": {"$type": "Preprocessing", "genes": ["TP53", "PAX5"]}
            },
            "flags": {"$set": ["a", "b"]}
        }))
        .unwrap();
        assert_eq!(root.type_name().as_deref(), Some("Pipeline"));
        let steps = root.attr("named_steps").unwrap();
        let preprocess = steps.as_node().unwrap().entry("preprocess").unwrap();
        let genes = preprocess.as_node().unwrap().attr("genes").unwrap();
        assert_eq!(
            genes.as_node().unwrap().strings().unwrap(),
            vec!["TP53".to_string(), "PAX5".to_string()]
        );
        let flags = root.attr("flags").unwrap();
        assert_eq!(flags.as_node().unwrap().strings().unwrap().len(), 2);
    }

    #[test]
    fn back_references_resolve_to_the_same_node() {
        let root = decode(&json!({
            "$type": "Pipeline",
            "$id": 1,
            "steps": [{"$type": "Step", "parent": {"$ref": 1}}]
        }))
        .unwrap();
        let steps = root.attr("steps").unwrap();
        let step = GraphNode::children(steps.as_node().unwrap()).remove(0);
        let parent = step.attr("parent").unwrap();
        assert_eq!(parent.as_node().unwrap().identity(), root.identity());
    }

    #[test]
    fn forward_references_are_rejected() {
        let err = decode(&json!({"a": {"$ref": "later"}, "b": {"$id": "later"}})).unwrap_err();
        assert!(matches!(err, GraphError::UnknownReference(id) if id == "later"));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = decode(&json!([{"$id": 1}, {"$id": 1}])).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateId(_)));
    }

    #[test]
    fn scalar_root_is_rejected() {
        assert!(matches!(decode(&json!(3)), Err(GraphError::ScalarRoot)));
    }

    #[test]
    fn cyclic_graphs_encode_with_references_and_decode_back() {
        let shared_list = ObjectRef::sequence(vec![Value::from(json!(1))]);
        let root = ObjectRef::instance(
            "Pipeline",
            vec![
                ("a", Value::from(shared_list.clone())),
                ("b", Value::from(shared_list.clone())),
            ],
        );
        root.set_attr("me", Value::from(root.clone()));

        let encoded = encode(&root);
        let decoded = decode(&encoded).unwrap();
        let me = decoded.attr("me").unwrap();
        assert_eq!(me.as_node().unwrap().identity(), decoded.identity());
        let a = decoded.attr("a").unwrap();
        let b = decoded.attr("b").unwrap();
        assert_eq!(
            a.as_node().unwrap().identity(),
            b.as_node().unwrap().identity()
        );
    }

    #[test]
    fn unshared_sequences_stay_plain_arrays() {
        let root = ObjectRef::mapping(vec![(
            "xs",
            Value::from(ObjectRef::sequence(vec![Value::from(json!(1.5))])),
        )]);
        assert_eq!(encode(&root), json!({"xs": [1.5]}));
    }

    #[test]
    fn artifact_files_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let root = ObjectRef::instance("KernelPCA", vec![("alphas_", Value::from(json!([0.5])))]);
        save_artifact(&root, &path).unwrap();
        let loaded = load_artifact(&path).unwrap();
        assert_eq!(loaded.type_name().as_deref(), Some("KernelPCA"));
        assert!(loaded.attr("alphas_").is_some());
    }
}

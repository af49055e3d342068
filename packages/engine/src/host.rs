//! The host value layer - live program state as seen by the engine.
//!
//! Variables bind to *host values*: either plain data (numbers, strings,
//! immutable composites) or shared mutable state that outlives any single
//! refresh pass. Shared values carry identity (their allocation pointer),
//! which is what the OID tables in [`crate::walk`] key on.
//!
//! Structured host types plug in behind the [`HostRecord`] capability trait
//! (`get_field` / `set_field`); JSON-shaped maps are the default adapter.
//! Callable path elements are [`HostFn`] values declaring which argument
//! shapes they accept.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

/// A shared mutable sequence.
pub type SharedList = Arc<RwLock<Vec<HostValue>>>;

/// A shared mutable string-keyed map. The default record adapter.
pub type SharedMap = Arc<RwLock<BTreeMap<String, HostValue>>>;

/// A shared structured host object behind the [`HostRecord`] adapter.
pub type SharedRecord = Arc<RwLock<Box<dyn HostRecord>>>;

/// A shared single-value cell; `None` means unassigned.
pub type SharedCell = Arc<RwLock<Option<HostValue>>>;

pub(crate) fn read_lock<T: ?Sized>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T: ?Sized>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Capability interface for structured host types.
///
/// Implement this once per host type at integration time; the engine never
/// reflects over concrete types. `BTreeMap<String, HostValue>` state should
/// use [`HostValue::Map`] directly instead.
pub trait HostRecord: Send + Sync {
    /// Read a field by name. `None` when the field does not exist.
    fn get_field(&self, name: &str) -> Option<HostValue>;

    /// Write a field by name.
    fn set_field(&mut self, name: &str, value: HostValue) -> Result<(), String>;

    /// The record's field names, in a stable order.
    fn field_names(&self) -> Vec<String>;

    /// Short type label used in verbose reference output.
    fn type_name(&self) -> &str {
        "record"
    }

    /// A detached copy of the record's current contents.
    fn snapshot(&self) -> HostValue {
        let entries = self
            .field_names()
            .into_iter()
            .filter_map(|n| self.get_field(&n).map(|v| (HostValue::Str(n), v)))
            .collect();
        HostValue::Entries(Arc::new(entries))
    }
}

impl HostRecord for BTreeMap<String, HostValue> {
    fn get_field(&self, name: &str) -> Option<HostValue> {
        self.get(name).cloned()
    }

    fn set_field(&mut self, name: &str, value: HostValue) -> Result<(), String> {
        self.insert(name.to_string(), value);
        Ok(())
    }

    fn field_names(&self) -> Vec<String> {
        self.keys().cloned().collect()
    }

    fn type_name(&self) -> &str {
        "map"
    }
}

/// Argument shapes a [`HostFn`] can be invoked with.
///
/// The parent-bearing shapes are only applicable when the variable's path
/// used `..`; the value-bearing shapes apply to setter invocation. Dispatch
/// prefers the richest applicable shape, in the order the variants are
/// declared here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    CtxCurParent,
    CtxCur,
    CurParent,
    Cur,
    CtxCurValue,
    CurValue,
}

impl Arity {
    /// Whether this shape passes the call context.
    pub fn wants_ctx(self) -> bool {
        matches!(self, Arity::CtxCurParent | Arity::CtxCur | Arity::CtxCurValue)
    }

    /// Whether this shape passes the traversal parent.
    pub fn wants_parent(self) -> bool {
        matches!(self, Arity::CtxCurParent | Arity::CurParent)
    }

    /// Whether this shape passes an incoming value (setter form).
    pub fn wants_value(self) -> bool {
        matches!(self, Arity::CtxCurValue | Arity::CurValue)
    }
}

/// Ambient context handed to host callables.
#[derive(Clone)]
pub struct CallCtx {
    /// Name of the connection driving the call.
    pub connection: String,
    /// The connection's root table.
    pub roots: Roots,
}

/// Arguments for a single [`HostFn`] invocation.
///
/// Fields not requested by the dispatched [`Arity`] are `None`.
pub struct FnArgs {
    pub ctx: Option<CallCtx>,
    pub current: HostValue,
    pub parent: Option<HostValue>,
    pub value: Option<HostValue>,
}

/// Shared body of a [`HostFn`]; opaque outside this module.
pub struct HostFnInner {
    name: String,
    arities: Vec<Arity>,
    body: Box<dyn Fn(FnArgs) -> Result<HostValue, String> + Send + Sync>,
}

/// A callable path element: getter, setter, or action.
///
/// The function declares which [`Arity`] shapes it accepts; the engine
/// dispatches the richest applicable one.
#[derive(Clone)]
pub struct HostFn {
    inner: Arc<HostFnInner>,
}

impl HostFn {
    pub fn new<F>(name: impl Into<String>, arities: Vec<Arity>, body: F) -> Self
    where
        F: Fn(FnArgs) -> Result<HostValue, String> + Send + Sync + 'static,
    {
        HostFn {
            inner: Arc::new(HostFnInner {
                name: name.into(),
                arities,
                body: Box::new(body),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the callable accepts the given shape.
    pub fn supports(&self, arity: Arity) -> bool {
        self.inner.arities.contains(&arity)
    }

    /// Invoke with the given shape, filling only the fields it wants.
    pub fn call(
        &self,
        arity: Arity,
        ctx: &CallCtx,
        current: HostValue,
        parent: Option<HostValue>,
        value: Option<HostValue>,
    ) -> Result<HostValue, String> {
        let args = FnArgs {
            ctx: arity.wants_ctx().then(|| ctx.clone()),
            current,
            parent: if arity.wants_parent() { parent } else { None },
            value: if arity.wants_value() { value } else { None },
        };
        (self.inner.body)(args)
    }

    fn ptr(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }
}

/// A host value reachable through a variable path.
///
/// Plain data (`Null`..`Entries`) walks structurally into JSON. Shared
/// values (`List`..`Func`) carry identity and are substituted by `{"ref"}`
/// records when walked; see [`crate::walk`].
#[derive(Clone, Default)]
pub enum HostValue {
    /// Absence of a value; also the JSON form of a missing field.
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Immutable sequence; walks to a JSON array.
    Tuple(Arc<Vec<HostValue>>),
    /// Immutable key/value pairs. All-string keys walk to a JSON object,
    /// anything else to an array of `[key, value]` pairs.
    Entries(Arc<Vec<(HostValue, HostValue)>>),
    /// Shared mutable sequence.
    List(SharedList),
    /// Shared mutable string-keyed map.
    Map(SharedMap),
    /// Shared structured host object behind a [`HostRecord`] adapter.
    Record(SharedRecord),
    /// Shared single-value cell.
    Cell(SharedCell),
    /// Callable path element.
    Func(HostFn),
}

/// Identity of a shared host value, derived from its allocation pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjKey(usize);

/// A weak handle to a shared host value, held by the OID table so the
/// engine never pins host objects.
#[derive(Clone)]
pub enum WeakHost {
    List(Weak<RwLock<Vec<HostValue>>>),
    Map(Weak<RwLock<BTreeMap<String, HostValue>>>),
    Record(Weak<RwLock<Box<dyn HostRecord>>>),
    Cell(Weak<RwLock<Option<HostValue>>>),
    Func(Weak<HostFnInner>),
}

impl WeakHost {
    /// Upgrade back to a live value, or `None` when the host object has
    /// been collected.
    pub fn upgrade(&self) -> Option<HostValue> {
        match self {
            WeakHost::List(w) => w.upgrade().map(HostValue::List),
            WeakHost::Map(w) => w.upgrade().map(HostValue::Map),
            WeakHost::Record(w) => w.upgrade().map(HostValue::Record),
            WeakHost::Cell(w) => w.upgrade().map(HostValue::Cell),
            WeakHost::Func(w) => w.upgrade().map(|inner| HostValue::Func(HostFn { inner })),
        }
    }

    /// Whether the referenced host object is still alive.
    pub fn is_alive(&self) -> bool {
        match self {
            WeakHost::List(w) => w.strong_count() > 0,
            WeakHost::Map(w) => w.strong_count() > 0,
            WeakHost::Record(w) => w.strong_count() > 0,
            WeakHost::Cell(w) => w.strong_count() > 0,
            WeakHost::Func(w) => w.strong_count() > 0,
        }
    }
}

impl HostValue {
    /// Build a shared mutable list.
    pub fn list(items: Vec<HostValue>) -> Self {
        HostValue::List(Arc::new(RwLock::new(items)))
    }

    /// Build a shared mutable map.
    pub fn map(entries: impl IntoIterator<Item = (String, HostValue)>) -> Self {
        HostValue::Map(Arc::new(RwLock::new(entries.into_iter().collect())))
    }

    /// Build a shared cell.
    pub fn cell(contents: Option<HostValue>) -> Self {
        HostValue::Cell(Arc::new(RwLock::new(contents)))
    }

    /// Wrap a structured host object behind its adapter.
    pub fn record(record: impl HostRecord + 'static) -> Self {
        HostValue::Record(Arc::new(RwLock::new(Box::new(record))))
    }

    /// Whether this value is shared mutable host state (carries identity).
    pub fn is_shared(&self) -> bool {
        matches!(
            self,
            HostValue::List(_)
                | HostValue::Map(_)
                | HostValue::Record(_)
                | HostValue::Cell(_)
                | HostValue::Func(_)
        )
    }

    /// Identity key for shared values; `None` for plain data.
    pub fn obj_key(&self) -> Option<ObjKey> {
        let ptr = match self {
            HostValue::List(a) => Arc::as_ptr(a) as *const () as usize,
            HostValue::Map(a) => Arc::as_ptr(a) as *const () as usize,
            HostValue::Record(a) => Arc::as_ptr(a) as *const () as usize,
            HostValue::Cell(a) => Arc::as_ptr(a) as *const () as usize,
            HostValue::Func(f) => f.ptr(),
            _ => return None,
        };
        Some(ObjKey(ptr))
    }

    /// Downgrade a shared value to a weak handle.
    pub fn downgrade(&self) -> Option<WeakHost> {
        match self {
            HostValue::List(a) => Some(WeakHost::List(Arc::downgrade(a))),
            HostValue::Map(a) => Some(WeakHost::Map(Arc::downgrade(a))),
            HostValue::Record(a) => Some(WeakHost::Record(Arc::downgrade(a))),
            HostValue::Cell(a) => Some(WeakHost::Cell(Arc::downgrade(a))),
            HostValue::Func(f) => Some(WeakHost::Func(Arc::downgrade(&f.inner))),
            _ => None,
        }
    }

    /// Short kind label for error messages and verbose refs.
    pub fn kind_name(&self) -> &'static str {
        match self {
            HostValue::Null => "null",
            HostValue::Bool(_) => "bool",
            HostValue::Int(_) => "int",
            HostValue::Float(_) => "float",
            HostValue::Str(_) => "string",
            HostValue::Tuple(_) => "tuple",
            HostValue::Entries(_) => "entries",
            HostValue::List(_) => "list",
            HostValue::Map(_) => "map",
            HostValue::Record(_) => "record",
            HostValue::Cell(_) => "cell",
            HostValue::Func(_) => "fn",
        }
    }

    /// Short human description, used for verbose `{"ref", "repr"}` output.
    pub fn repr(&self) -> String {
        match self {
            HostValue::List(a) => format!("list[{}]", read_lock(a).len()),
            HostValue::Map(a) => format!("map[{}]", read_lock(a).len()),
            HostValue::Record(a) => read_lock(a).type_name().to_string(),
            HostValue::Cell(a) => match &*read_lock(a) {
                Some(v) => format!("cell({})", v.kind_name()),
                None => "cell()".to_string(),
            },
            HostValue::Func(f) => format!("fn {}", f.name()),
            other => other.kind_name().to_string(),
        }
    }

    /// Field lookup on a map-like or structured value.
    pub fn get_field(&self, name: &str) -> Option<HostValue> {
        match self {
            HostValue::Map(m) => read_lock(m).get(name).cloned(),
            HostValue::Record(r) => read_lock(r).get_field(name),
            HostValue::Entries(e) => e.iter().find_map(|(k, v)| match k {
                HostValue::Str(s) if s == name => Some(v.clone()),
                _ => None,
            }),
            _ => None,
        }
    }

    /// Field assignment on a map-like or structured value.
    pub fn set_field(&self, name: &str, value: HostValue) -> Result<(), String> {
        match self {
            HostValue::Map(m) => {
                write_lock(m).insert(name.to_string(), value);
                Ok(())
            }
            HostValue::Record(r) => write_lock(r).set_field(name, value),
            _ => Err(format!("cannot set field '{}' on {}", name, self.kind_name())),
        }
    }

    /// Element count of a sequence value.
    pub fn seq_len(&self) -> Option<usize> {
        match self {
            HostValue::List(l) => Some(read_lock(l).len()),
            HostValue::Tuple(t) => Some(t.len()),
            _ => None,
        }
    }

    /// 1-based index lookup on a sequence value.
    pub fn index_get(&self, index: usize) -> Option<HostValue> {
        if index == 0 {
            return None;
        }
        match self {
            HostValue::List(l) => read_lock(l).get(index - 1).cloned(),
            HostValue::Tuple(t) => t.get(index - 1).cloned(),
            _ => None,
        }
    }

    /// 1-based index assignment. An index of `len + 1` appends; anything
    /// past that is an error.
    pub fn index_set(&self, index: usize, value: HostValue) -> Result<(), String> {
        match self {
            HostValue::List(l) => {
                let mut items = write_lock(l);
                if index == 0 || index > items.len() + 1 {
                    Err(format!(
                        "index {} out of bounds for list of length {}",
                        index,
                        items.len()
                    ))
                } else if index == items.len() + 1 {
                    items.push(value);
                    Ok(())
                } else {
                    items[index - 1] = value;
                    Ok(())
                }
            }
            HostValue::Tuple(_) => Err("cannot assign into an immutable tuple".to_string()),
            other => Err(format!("cannot index into {}", other.kind_name())),
        }
    }

    /// Detached copy for change detection. Shared containers are copied
    /// into fresh allocations; cycles are preserved through a seen-map.
    pub fn snapshot(&self) -> HostValue {
        self.snapshot_inner(&mut std::collections::HashMap::new())
    }

    fn snapshot_inner(
        &self,
        seen: &mut std::collections::HashMap<ObjKey, HostValue>,
    ) -> HostValue {
        if let Some(key) = self.obj_key() {
            if let Some(copy) = seen.get(&key) {
                return copy.clone();
            }
        }
        match self {
            HostValue::Null => HostValue::Null,
            HostValue::Bool(b) => HostValue::Bool(*b),
            HostValue::Int(i) => HostValue::Int(*i),
            HostValue::Float(f) => HostValue::Float(*f),
            HostValue::Str(s) => HostValue::Str(s.clone()),
            HostValue::Tuple(t) => HostValue::Tuple(Arc::new(
                t.iter().map(|v| v.snapshot_inner(seen)).collect(),
            )),
            HostValue::Entries(e) => HostValue::Entries(Arc::new(
                e.iter()
                    .map(|(k, v)| (k.snapshot_inner(seen), v.snapshot_inner(seen)))
                    .collect(),
            )),
            HostValue::List(l) => {
                let copy: SharedList = Arc::new(RwLock::new(Vec::new()));
                seen.insert(
                    self.obj_key().unwrap_or(ObjKey(0)),
                    HostValue::List(copy.clone()),
                );
                let items: Vec<HostValue> = read_lock(l)
                    .iter()
                    .map(|v| v.snapshot_inner(seen))
                    .collect();
                *write_lock(&copy) = items;
                HostValue::List(copy)
            }
            HostValue::Map(m) => {
                let copy: SharedMap = Arc::new(RwLock::new(BTreeMap::new()));
                seen.insert(
                    self.obj_key().unwrap_or(ObjKey(0)),
                    HostValue::Map(copy.clone()),
                );
                let entries: BTreeMap<String, HostValue> = read_lock(m)
                    .iter()
                    .map(|(k, v)| (k.clone(), v.snapshot_inner(seen)))
                    .collect();
                *write_lock(&copy) = entries;
                HostValue::Map(copy)
            }
            HostValue::Record(r) => {
                // Records snapshot through the adapter; revisits break the
                // cycle with Null since the copy cannot be pre-registered.
                seen.insert(self.obj_key().unwrap_or(ObjKey(0)), HostValue::Null);
                read_lock(r).snapshot()
            }
            HostValue::Cell(c) => {
                let copy: SharedCell = Arc::new(RwLock::new(None));
                seen.insert(
                    self.obj_key().unwrap_or(ObjKey(0)),
                    HostValue::Cell(copy.clone()),
                );
                let contents = read_lock(c).as_ref().map(|v| v.snapshot_inner(seen));
                *write_lock(&copy) = contents;
                HostValue::Cell(copy)
            }
            HostValue::Func(f) => HostValue::Func(f.clone()),
        }
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Null => write!(f, "Null"),
            HostValue::Bool(b) => write!(f, "Bool({})", b),
            HostValue::Int(i) => write!(f, "Int({})", i),
            HostValue::Float(x) => write!(f, "Float({})", x),
            HostValue::Str(s) => write!(f, "Str({:?})", s),
            other => write!(f, "{}", other.repr()),
        }
    }
}

// Conversion from common types, mirroring plain data literals.

impl From<bool> for HostValue {
    fn from(v: bool) -> Self {
        HostValue::Bool(v)
    }
}

impl From<i64> for HostValue {
    fn from(v: i64) -> Self {
        HostValue::Int(v)
    }
}

impl From<i32> for HostValue {
    fn from(v: i32) -> Self {
        HostValue::Int(v as i64)
    }
}

impl From<f64> for HostValue {
    fn from(v: f64) -> Self {
        HostValue::Float(v)
    }
}

impl From<&str> for HostValue {
    fn from(v: &str) -> Self {
        HostValue::Str(v.to_string())
    }
}

impl From<String> for HostValue {
    fn from(v: String) -> Self {
        HostValue::Str(v)
    }
}

/// Structural equality over host values.
///
/// Shared and immutable composites compare by contents, so a detached
/// snapshot compares equal to the live value it was taken from. Cycles are
/// handled with a seen-set of identity pairs; a pair already under
/// comparison is assumed equal. Cells are equal only when both are assigned
/// to equal targets or both unassigned. Functions compare by identity.
pub fn is_same(a: &HostValue, b: &HostValue) -> bool {
    same_inner(a, b, &mut std::collections::HashSet::new())
}

fn same_inner(
    a: &HostValue,
    b: &HostValue,
    seen: &mut std::collections::HashSet<(ObjKey, ObjKey)>,
) -> bool {
    if let (Some(ka), Some(kb)) = (a.obj_key(), b.obj_key()) {
        if ka == kb {
            return true;
        }
        if !seen.insert((ka, kb)) {
            return true;
        }
    }

    match (a, b) {
        (HostValue::Null, HostValue::Null) => true,
        (HostValue::Bool(x), HostValue::Bool(y)) => x == y,
        (HostValue::Int(x), HostValue::Int(y)) => x == y,
        (HostValue::Float(x), HostValue::Float(y)) => x == y,
        (HostValue::Int(x), HostValue::Float(y)) | (HostValue::Float(y), HostValue::Int(x)) => {
            *x as f64 == *y
        }
        (HostValue::Str(x), HostValue::Str(y)) => x == y,
        (HostValue::Cell(x), HostValue::Cell(y)) => {
            match (&*read_lock(x), &*read_lock(y)) {
                (None, None) => true,
                (Some(cx), Some(cy)) => same_inner(cx, cy, seen),
                _ => false,
            }
        }
        (HostValue::Func(x), HostValue::Func(y)) => x.ptr() == y.ptr(),
        _ => {
            // Sequences and map-likes compare by contents across variants.
            if let (Some(xs), Some(ys)) = (seq_items(a), seq_items(b)) {
                return xs.len() == ys.len()
                    && xs.iter().zip(ys.iter()).all(|(x, y)| same_inner(x, y, seen));
            }
            if let (Some(xs), Some(ys)) = (map_items(a), map_items(b)) {
                return xs.len() == ys.len()
                    && xs
                        .iter()
                        .zip(ys.iter())
                        .all(|((kx, vx), (ky, vy))| kx == ky && same_inner(vx, vy, seen));
            }
            if let (HostValue::Entries(xs), HostValue::Entries(ys)) = (a, b) {
                return xs.len() == ys.len()
                    && xs.iter().zip(ys.iter()).all(|((kx, vx), (ky, vy))| {
                        same_inner(kx, ky, seen) && same_inner(vx, vy, seen)
                    });
            }
            false
        }
    }
}

fn seq_items(v: &HostValue) -> Option<Vec<HostValue>> {
    match v {
        HostValue::List(l) => Some(read_lock(l).clone()),
        HostValue::Tuple(t) => Some(t.as_ref().clone()),
        _ => None,
    }
}

fn map_items(v: &HostValue) -> Option<Vec<(String, HostValue)>> {
    match v {
        HostValue::Map(m) => Some(read_lock(m).iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        HostValue::Record(r) => {
            let rec = read_lock(r);
            let mut items: Vec<(String, HostValue)> = rec
                .field_names()
                .into_iter()
                .filter_map(|n| rec.get_field(&n).map(|v| (n, v)))
                .collect();
            items.sort_by(|a, b| a.0.cmp(&b.0));
            Some(items)
        }
        HostValue::Entries(e) => {
            let mut items = Vec::with_capacity(e.len());
            for (k, v) in e.iter() {
                match k {
                    HostValue::Str(s) => items.push((s.clone(), v.clone())),
                    _ => return None,
                }
            }
            items.sort_by(|a, b| a.0.cmp(&b.0));
            Some(items)
        }
        _ => None,
    }
}

/// The ambient root table: named host values referenced by `@name` path
/// components and module-qualified bindings.
#[derive(Clone, Default)]
pub struct Roots {
    inner: Arc<RwLock<BTreeMap<String, HostValue>>>,
}

impl Roots {
    pub fn new() -> Self {
        Roots::default()
    }

    /// Build a root table from name/value pairs.
    pub fn from_entries(entries: impl IntoIterator<Item = (String, HostValue)>) -> Self {
        Roots {
            inner: Arc::new(RwLock::new(entries.into_iter().collect())),
        }
    }

    pub fn get(&self, name: &str) -> Option<HostValue> {
        read_lock(&self.inner).get(name).cloned()
    }

    pub fn insert(&self, name: impl Into<String>, value: HostValue) {
        write_lock(&self.inner).insert(name.into(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        read_lock(&self.inner).contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_values_have_identity() {
        let a = HostValue::list(vec![HostValue::Int(1)]);
        let b = a.clone();
        let c = HostValue::list(vec![HostValue::Int(1)]);

        assert_eq!(a.obj_key(), b.obj_key());
        assert_ne!(a.obj_key(), c.obj_key());
        assert!(HostValue::Int(1).obj_key().is_none());
    }

    #[test]
    fn weak_handles_follow_collection() {
        let live = HostValue::list(vec![]);
        let weak = live.downgrade().unwrap();
        assert!(weak.is_alive());
        assert!(weak.upgrade().is_some());

        drop(live);
        assert!(!weak.is_alive());
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn is_same_compares_contents_across_variants() {
        let live = HostValue::map([("a".to_string(), HostValue::Int(1))]);
        let snap = live.snapshot();
        assert!(is_same(&live, &snap));

        live.set_field("a", HostValue::Int(2)).unwrap();
        assert!(!is_same(&live, &snap));
    }

    #[test]
    fn is_same_entries_vs_map() {
        let entries = HostValue::Entries(Arc::new(vec![(
            HostValue::Str("x".to_string()),
            HostValue::Str("y".to_string()),
        )]));
        let map = HostValue::map([("x".to_string(), HostValue::Str("y".to_string()))]);
        assert!(is_same(&entries, &map));
    }

    #[test]
    fn is_same_numeric_promotion() {
        assert!(is_same(&HostValue::Int(2), &HostValue::Float(2.0)));
        assert!(!is_same(&HostValue::Int(2), &HostValue::Float(2.5)));
    }

    #[test]
    fn cells_compare_by_assignment() {
        let empty_a = HostValue::cell(None);
        let empty_b = HostValue::cell(None);
        let full_a = HostValue::cell(Some(HostValue::Int(7)));
        let full_b = HostValue::cell(Some(HostValue::Int(7)));
        let full_c = HostValue::cell(Some(HostValue::Int(8)));

        assert!(is_same(&empty_a, &empty_b));
        assert!(is_same(&full_a, &full_b));
        assert!(!is_same(&full_a, &full_c));
        assert!(!is_same(&empty_a, &full_a));
        assert!(!is_same(&full_a, &HostValue::Int(7)));
    }

    #[test]
    fn is_same_survives_cycles() {
        let a = HostValue::list(vec![]);
        if let HostValue::List(l) = &a {
            write_lock(l).push(a.clone());
        }
        let b = HostValue::list(vec![]);
        if let HostValue::List(l) = &b {
            write_lock(l).push(b.clone());
        }
        assert!(is_same(&a, &b));
    }

    #[test]
    fn snapshot_detaches() {
        let live = HostValue::list(vec![HostValue::Int(1)]);
        let snap = live.snapshot();
        assert_ne!(live.obj_key(), snap.obj_key());
        assert!(is_same(&live, &snap));

        live.index_set(2, HostValue::Int(2)).unwrap();
        assert!(!is_same(&live, &snap));
    }

    #[test]
    fn snapshot_preserves_cycles() {
        let a = HostValue::list(vec![]);
        if let HostValue::List(l) = &a {
            write_lock(l).push(a.clone());
        }
        let snap = a.snapshot();
        // The copy's first element is the copy itself, not the original.
        if let HostValue::List(l) = &snap {
            let first = read_lock(l)[0].clone();
            assert_eq!(first.obj_key(), snap.obj_key());
            assert_ne!(first.obj_key(), a.obj_key());
        } else {
            panic!("expected list snapshot");
        }
    }

    #[test]
    fn one_based_index_access() {
        let list = HostValue::list(vec![HostValue::Int(10), HostValue::Int(20)]);
        assert!(matches!(list.index_get(1), Some(HostValue::Int(10))));
        assert!(matches!(list.index_get(2), Some(HostValue::Int(20))));
        assert!(list.index_get(0).is_none());
        assert!(list.index_get(3).is_none());
    }

    #[test]
    fn index_set_appends_at_len_plus_one() {
        let list = HostValue::list(vec![HostValue::Int(1)]);
        list.index_set(2, HostValue::Int(2)).unwrap();
        assert_eq!(list.seq_len(), Some(2));
        assert!(list.index_set(4, HostValue::Int(4)).is_err());
    }

    #[test]
    fn record_adapter_roundtrip() {
        struct Point {
            x: i64,
            y: i64,
        }
        impl HostRecord for Point {
            fn get_field(&self, name: &str) -> Option<HostValue> {
                match name {
                    "x" => Some(HostValue::Int(self.x)),
                    "y" => Some(HostValue::Int(self.y)),
                    _ => None,
                }
            }
            fn set_field(&mut self, name: &str, value: HostValue) -> Result<(), String> {
                let v = match value {
                    HostValue::Int(i) => i,
                    other => return Err(format!("expected int, got {}", other.kind_name())),
                };
                match name {
                    "x" => self.x = v,
                    "y" => self.y = v,
                    _ => return Err(format!("no field '{}'", name)),
                }
                Ok(())
            }
            fn field_names(&self) -> Vec<String> {
                vec!["x".to_string(), "y".to_string()]
            }
            fn type_name(&self) -> &str {
                "point"
            }
        }

        let p = HostValue::record(Point { x: 1, y: 2 });
        assert!(matches!(p.get_field("x"), Some(HostValue::Int(1))));
        p.set_field("y", HostValue::Int(5)).unwrap();
        assert!(matches!(p.get_field("y"), Some(HostValue::Int(5))));
        assert!(p.set_field("z", HostValue::Int(0)).is_err());
        assert_eq!(p.repr(), "point");
    }

    #[test]
    fn hostfn_dispatch_fills_requested_args() {
        let f = HostFn::new("probe", vec![Arity::CtxCur, Arity::Cur], |args: FnArgs| {
            Ok(HostValue::Bool(args.ctx.is_some()))
        });
        let ctx = CallCtx {
            connection: "test".to_string(),
            roots: Roots::new(),
        };
        let with_ctx = f.call(Arity::CtxCur, &ctx, HostValue::Null, None, None).unwrap();
        let without = f.call(Arity::Cur, &ctx, HostValue::Null, None, None).unwrap();
        assert!(matches!(with_ctx, HostValue::Bool(true)));
        assert!(matches!(without, HostValue::Bool(false)));
        assert!(f.supports(Arity::CtxCur));
        assert!(!f.supports(Arity::CurParent));
    }
}

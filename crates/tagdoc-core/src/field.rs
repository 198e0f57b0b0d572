//! Leaf values: the typed primitives every structural node is built from.
//!
//! A [`Field`] reads itself from a [`Cursor`], writes itself back and knows
//! its default. Reference fields additionally carry resolved entity handles
//! that are rebuilt from the stored indices after a parse.

use log::warn;
use serde::{Deserialize, Serialize};

use crate::cursor::{Cursor, Writer};
use crate::error::{Diagnostic, DiagnosticKind, Error, Result};
use crate::group::{EntityId, GroupId, GroupIndex, NodeGroup};
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumVariant {
    pub value: i64,
    pub label: String,
}

/// Index list pointing into a document-level node group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefSpec {
    /// Name of the target group.
    pub group: String,
    #[serde(default = "default_ref_width")]
    pub width: u8,
    #[serde(default)]
    pub signed: bool,
    /// Stored value meaning "no reference".
    pub sentinel: i64,
    /// Fixed slot count; `None` fills the enclosing span.
    #[serde(default)]
    pub count: Option<usize>,
    /// Indices are relative to the authoring document's group and must be
    /// shifted when the owning entity is imported.
    #[serde(default)]
    pub dependent: bool,
}

fn default_ref_width() -> u8 {
    4
}

fn default_bool_width() -> u8 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    Int {
        width: u8,
        #[serde(default)]
        signed: bool,
    },
    F32,
    F64,
    Bool {
        #[serde(default = "default_bool_width")]
        width: u8,
    },
    Enum {
        width: u8,
        #[serde(default)]
        signed: bool,
        variants: Vec<EnumVariant>,
    },
    /// Null-terminated string inside a fixed span; the rest is `fill`.
    PaddedString { len: usize, fill: u8 },
    /// Null-terminated string occupying the whole enclosing span.
    CString,
    /// Unsigned byte count of `len_width` bytes, then that many bytes of
    /// text with no terminator.
    PrefixedString {
        #[serde(default = "default_ref_width")]
        len_width: u8,
    },
    /// Fixed-size float vector.
    Vector { count: usize },
    IntList {
        width: u8,
        #[serde(default)]
        signed: bool,
        #[serde(default)]
        count: Option<usize>,
    },
    Bytes {
        #[serde(default)]
        len: Option<usize>,
    },
    Reference(RefSpec),
}

impl FieldKind {
    pub fn int(width: u8) -> Self {
        FieldKind::Int {
            width,
            signed: true,
        }
    }

    pub fn uint(width: u8) -> Self {
        FieldKind::Int {
            width,
            signed: false,
        }
    }

    pub fn padded(len: usize, fill: u8) -> Self {
        FieldKind::PaddedString { len, fill }
    }

    pub fn enumeration(width: u8, variants: &[(i64, &str)]) -> Self {
        FieldKind::Enum {
            width,
            signed: false,
            variants: variants
                .iter()
                .map(|(value, label)| EnumVariant {
                    value: *value,
                    label: (*label).to_string(),
                })
                .collect(),
        }
    }

    pub fn reference(group: &str, width: u8, sentinel: i64) -> Self {
        FieldKind::Reference(RefSpec {
            group: group.to_string(),
            width,
            signed: sentinel < 0,
            sentinel,
            count: Some(1),
            dependent: true,
        })
    }

    /// Reject kinds no reader could handle: integer widths other than 1, 2,
    /// 4 or 8, and sentinels that do not fit their reference.
    pub fn check(&self) -> std::result::Result<(), String> {
        match self {
            FieldKind::Int { width, .. }
            | FieldKind::Enum { width, .. }
            | FieldKind::Bool { width }
            | FieldKind::IntList { width, .. } => check_width(*width),
            FieldKind::PrefixedString { len_width } => check_width(*len_width),
            FieldKind::Reference(spec) => {
                check_width(spec.width)?;
                check_int(spec.sentinel, spec.width, spec.signed)
                    .map_err(|e| format!("sentinel {e}"))
            }
            FieldKind::PaddedString { len, .. } if *len == 0 => Err("padded string length is 0".into()),
            _ => Ok(()),
        }
    }

    pub fn ref_spec(&self) -> Option<&RefSpec> {
        match self {
            FieldKind::Reference(spec) => Some(spec),
            _ => None,
        }
    }

    pub fn default_value(&self) -> Value {
        match self {
            FieldKind::Int { .. } => Value::Int(0),
            FieldKind::Enum { variants, .. } => {
                Value::Int(variants.first().map(|v| v.value).unwrap_or(0))
            }
            FieldKind::F32 => Value::F32(0.0),
            FieldKind::F64 => Value::F64(0.0),
            FieldKind::Bool { .. } => Value::Bool(false),
            FieldKind::PaddedString { .. } | FieldKind::CString | FieldKind::PrefixedString { .. } => {
                Value::Str(String::new())
            }
            FieldKind::Vector { count } => Value::Floats(vec![0.0; *count]),
            FieldKind::IntList { count, .. } => Value::Ints(vec![0; count.unwrap_or(0)]),
            FieldKind::Bytes { len } => Value::Bytes(vec![0; len.unwrap_or(0)]),
            FieldKind::Reference(spec) => {
                Value::Ints(vec![spec.sentinel; spec.count.unwrap_or(0)])
            }
        }
    }

    fn decode(&self, cur: &mut Cursor<'_>, span: usize) -> Result<Value> {
        let v = match self {
            FieldKind::Int { width, signed } | FieldKind::Enum { width, signed, .. } => {
                Value::Int(cur.read_int(*width, *signed)?)
            }
            FieldKind::F32 => Value::F32(cur.read_f32()?),
            FieldKind::F64 => Value::F64(cur.read_f64()?),
            FieldKind::Bool { width } => match cur.read_int(*width, false)? {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                other => Value::Int(other),
            },
            FieldKind::PaddedString { len, .. } => {
                if *len == 0 {
                    return Err(Error::MalformedData {
                        offset: cur.offset(),
                        message: "padded string span is empty".into(),
                    });
                }
                Value::Str(leading_cstr(cur.read_bytes(*len)?))
            }
            FieldKind::CString => {
                if span == 0 {
                    return Err(Error::MalformedData {
                        offset: cur.offset(),
                        message: "string span is empty".into(),
                    });
                }
                Value::Str(leading_cstr(cur.read_bytes(span)?))
            }
            FieldKind::PrefixedString { len_width } => {
                let at = cur.offset();
                let n = usize::try_from(cur.read_int(*len_width, false)?).map_err(|_| Error::MalformedData {
                    offset: at,
                    message: "string length out of range".into(),
                })?;
                Value::Str(String::from_utf8_lossy(cur.read_bytes(n)?).into_owned())
            }
            FieldKind::Vector { count } => {
                let mut out = Vec::with_capacity(*count);
                for _ in 0..*count {
                    out.push(cur.read_f32()?);
                }
                Value::Floats(out)
            }
            FieldKind::IntList {
                width,
                signed,
                count,
            } => Value::Ints(read_ints(cur, *width, *signed, *count, span)?),
            FieldKind::Reference(spec) => {
                Value::Ints(read_ints(cur, spec.width, spec.signed, spec.count, span)?)
            }
            FieldKind::Bytes { len } => Value::Bytes(cur.read_bytes(len.unwrap_or(span))?.to_vec()),
        };
        Ok(v)
    }

    fn encode(&self, value: &Value, w: &mut Writer) {
        match self {
            FieldKind::Int { width, .. }
            | FieldKind::Enum { width, .. }
            | FieldKind::Bool { width } => w.write_int(value.as_i64().unwrap_or(0), *width),
            FieldKind::F32 => w.write_f32(match value {
                Value::F32(v) => *v,
                other => other.as_f64().unwrap_or(0.0) as f32,
            }),
            FieldKind::F64 => w.write_f64(value.as_f64().unwrap_or(0.0)),
            FieldKind::PaddedString { len, fill } => {
                let s = value.as_str().unwrap_or("").as_bytes();
                let n = s.len().min(len.saturating_sub(1));
                w.write_bytes(&s[..n]);
                if *len > n {
                    w.write_u8(0);
                    let pad = if n == 0 { 0 } else { *fill };
                    w.fill(pad, len - n - 1);
                }
            }
            FieldKind::CString => {
                w.write_bytes(value.as_str().unwrap_or("").as_bytes());
                w.write_u8(0);
            }
            FieldKind::PrefixedString { len_width } => {
                let s = value.as_str().unwrap_or("").as_bytes();
                w.write_int(s.len() as i64, *len_width);
                w.write_bytes(s);
            }
            FieldKind::Vector { .. } => {
                if let Value::Floats(v) = value {
                    v.iter().for_each(|f| w.write_f32(*f));
                }
            }
            FieldKind::IntList { width, .. } => {
                if let Value::Ints(v) = value {
                    v.iter().for_each(|i| w.write_int(*i, *width));
                }
            }
            FieldKind::Reference(spec) => {
                if let Value::Ints(v) = value {
                    v.iter().for_each(|i| w.write_int(*i, spec.width));
                }
            }
            FieldKind::Bytes { .. } => {
                if let Value::Bytes(b) = value {
                    w.write_bytes(b);
                }
            }
        }
    }

    /// Convert `value` into this kind's canonical value, or explain why not.
    pub fn coerce(&self, value: Value) -> std::result::Result<Value, String> {
        match (self, value) {
            (FieldKind::Int { width, signed } | FieldKind::Enum { width, signed, .. }, v) => {
                let n = v.as_i64().ok_or_else(|| format!("expected int, got {}", v.type_name()))?;
                check_int(n, *width, *signed)?;
                Ok(Value::Int(n))
            }
            (FieldKind::Bool { .. }, Value::Bool(b)) => Ok(Value::Bool(b)),
            (FieldKind::Bool { width }, Value::Int(n)) => {
                check_int(n, *width, false)?;
                Ok(Value::Int(n))
            }
            (FieldKind::F32, Value::F32(x)) => Ok(Value::F32(x)),
            (FieldKind::F32, v) => match v.as_f64() {
                Some(f) => Ok(Value::F32(f as f32)),
                None => Err(format!("expected float, got {}", v.type_name())),
            },
            (FieldKind::F64, v) => v
                .as_f64()
                .map(Value::F64)
                .ok_or_else(|| format!("expected float, got {}", v.type_name())),
            (FieldKind::PaddedString { len, .. }, Value::Str(s)) => {
                if s.contains('\0') {
                    return Err("string contains a null byte".into());
                }
                if s.len() + 1 > *len {
                    return Err(format!("string of {} bytes does not fit {len}", s.len()));
                }
                Ok(Value::Str(s))
            }
            (FieldKind::CString, Value::Str(s)) => {
                if s.contains('\0') {
                    return Err("string contains a null byte".into());
                }
                Ok(Value::Str(s))
            }
            (FieldKind::PrefixedString { len_width }, Value::Str(s)) => {
                check_int(s.len() as i64, *len_width, false)
                    .map_err(|_| format!("string of {} bytes is too long for its length prefix", s.len()))?;
                Ok(Value::Str(s))
            }
            (FieldKind::Vector { count }, v) => {
                let floats: Vec<f32> = match v {
                    Value::Floats(f) => f,
                    Value::Ints(i) => i.into_iter().map(|x| x as f32).collect(),
                    other => return Err(format!("expected float vector, got {}", other.type_name())),
                };
                if floats.len() != *count {
                    return Err(format!("expected {count} elements, got {}", floats.len()));
                }
                Ok(Value::Floats(floats))
            }
            (
                FieldKind::IntList {
                    width,
                    signed,
                    count,
                },
                Value::Ints(v),
            ) => {
                check_list(&v, *width, *signed, *count)?;
                Ok(Value::Ints(v))
            }
            (FieldKind::Reference(spec), Value::Int(n)) if spec.count == Some(1) => {
                check_int(n, spec.width, spec.signed)?;
                Ok(Value::Ints(vec![n]))
            }
            (FieldKind::Reference(spec), Value::Ints(v)) => {
                check_list(&v, spec.width, spec.signed, spec.count)?;
                Ok(Value::Ints(v))
            }
            (FieldKind::Bytes { len }, Value::Bytes(b)) => match len {
                Some(n) if *n != b.len() => Err(format!("expected {n} bytes, got {}", b.len())),
                _ => Ok(Value::Bytes(b)),
            },
            (kind, v) => Err(format!("{} does not fit {kind:?}", v.type_name())),
        }
    }
}

fn leading_cstr(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn read_ints(
    cur: &mut Cursor<'_>,
    width: u8,
    signed: bool,
    count: Option<usize>,
    span: usize,
) -> Result<Vec<i64>> {
    let n = count.unwrap_or(span / (width.max(1) as usize));
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(cur.read_int(width, signed)?);
    }
    Ok(out)
}

fn check_width(width: u8) -> std::result::Result<(), String> {
    match width {
        1 | 2 | 4 | 8 => Ok(()),
        _ => Err(format!("unsupported integer width {width}")),
    }
}

fn check_int(n: i64, width: u8, signed: bool) -> std::result::Result<(), String> {
    check_width(width)?;
    if width == 8 {
        return Ok(());
    }
    let bits = width as u32 * 8;
    let ok = if signed {
        let half = 1i64 << (bits - 1);
        (-half..half).contains(&n)
    } else {
        (0..(1i64 << bits)).contains(&n)
    };
    if ok {
        Ok(())
    } else {
        Err(format!("{n} does not fit in {width} byte(s)"))
    }
}

fn check_list(
    v: &[i64],
    width: u8,
    signed: bool,
    count: Option<usize>,
) -> std::result::Result<(), String> {
    if let Some(n) = count
        && n != v.len()
    {
        return Err(format!("expected {n} elements, got {}", v.len()));
    }
    v.iter().try_for_each(|x| check_int(*x, width, signed))
}

/// Everything needed to put a field back exactly as it was.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldState {
    pub value: Value,
    raw: Option<Vec<u8>>,
    links: Vec<Option<EntityId>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    name: String,
    kind: FieldKind,
    default: Value,
    value: Value,
    assigned: bool,
    /// Bytes as read, kept while re-encoding the value would not reproduce them.
    raw: Option<Vec<u8>>,
    /// Target group of a reference field.
    target: Option<GroupId>,
    /// Resolved handles, one per stored index (reference fields only).
    links: Vec<Option<EntityId>>,
}

impl Field {
    pub fn new(name: impl Into<String>, kind: FieldKind, default: Option<Value>) -> Self {
        let default = default.unwrap_or_else(|| kind.default_value());
        let links = match &kind {
            FieldKind::Reference(spec) => vec![None; spec.count.unwrap_or(0)],
            _ => Vec::new(),
        };
        Self {
            name: name.into(),
            kind,
            value: default.clone(),
            default,
            assigned: true,
            raw: None,
            target: None,
            links,
        }
    }

    pub(crate) fn with_target(mut self, target: Option<GroupId>) -> Self {
        self.target = target;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn default_value(&self) -> &Value {
        &self.default
    }

    pub fn is_assigned(&self) -> bool {
        self.assigned
    }

    pub fn target(&self) -> Option<GroupId> {
        self.target
    }

    pub fn links(&self) -> &[Option<EntityId>] {
        &self.links
    }

    /// Label of the current enum value, if this is an enum with a known variant.
    pub fn enum_label(&self) -> Option<&str> {
        let FieldKind::Enum { variants, .. } = &self.kind else {
            return None;
        };
        let v = self.value.as_i64()?;
        variants.iter().find(|x| x.value == v).map(|x| x.label.as_str())
    }

    pub(crate) fn set_assigned(&mut self, assigned: bool) {
        self.assigned = assigned;
    }

    /// Same value, bytes and presence; resolved links are not compared.
    pub(crate) fn same_content(&self, other: &Field) -> bool {
        self.value == other.value && self.raw == other.raw && self.assigned == other.assigned
    }

    pub(crate) fn reset(&mut self) {
        self.value = self.default.clone();
        self.raw = None;
        self.links = match &self.kind {
            FieldKind::Reference(spec) => vec![None; spec.count.unwrap_or(0)],
            _ => Vec::new(),
        };
    }

    pub fn state(&self) -> FieldState {
        FieldState {
            value: self.value.clone(),
            raw: self.raw.clone(),
            links: self.links.clone(),
        }
    }

    pub(crate) fn restore(&mut self, state: FieldState) {
        self.value = state.value;
        self.raw = state.raw;
        self.links = state.links;
    }

    /// Replace the value after coercing it to this field's kind.
    /// Reference links are cleared; the owner re-resolves them.
    pub(crate) fn set_value(&mut self, value: Value) -> Result<()> {
        let value = self.kind.coerce(value).map_err(|message| Error::InvalidValue {
            field: self.name.clone(),
            message,
        })?;
        if let Value::Ints(v) = &value
            && self.kind.ref_spec().is_some()
        {
            self.links = vec![None; v.len()];
        }
        self.value = value;
        self.raw = None;
        Ok(())
    }

    /// Read this field from `cur`. `span` is the number of bytes available in
    /// the enclosing block, used by span-sized kinds.
    pub fn read(&mut self, cur: &mut Cursor<'_>, span: usize) -> Result<()> {
        let start = cur.position();
        let mut probe = cur.clone();
        let value = self.kind.decode(cur, span)?;
        let consumed = probe.read_bytes(cur.position() - start)?;

        let mut check = Writer::with_capacity(consumed.len());
        self.kind.encode(&value, &mut check);
        self.raw = (check.into_inner() != consumed).then(|| consumed.to_vec());

        if let Value::Ints(v) = &value
            && self.kind.ref_spec().is_some()
        {
            self.links = vec![None; v.len()];
        }
        self.value = value;
        self.assigned = true;
        Ok(())
    }

    pub fn write(&self, w: &mut Writer, groups: &[NodeGroup]) {
        if let FieldKind::Reference(_) = &self.kind {
            let flat = self.flatten(groups);
            if self.raw.is_none() || self.value.as_ints() != Some(flat.as_slice()) {
                self.kind.encode(&Value::Ints(flat), w);
                return;
            }
        }
        match &self.raw {
            Some(raw) => w.write_bytes(raw),
            None => self.kind.encode(&self.value, w),
        }
    }

    // ---- reference handling ----

    /// Stored indices with every live link mapped to its entity's current index.
    pub fn flatten(&self, groups: &[NodeGroup]) -> Vec<i64> {
        let (Some(spec), Some(stored)) = (self.kind.ref_spec(), self.value.as_ints()) else {
            return Vec::new();
        };
        let group = self.target.and_then(|g| groups.get(g.0));
        stored
            .iter()
            .enumerate()
            .map(|(slot, idx)| match (self.links.get(slot).copied().flatten(), group) {
                (Some(id), Some(group)) => group
                    .index_of(id)
                    .map(|i| i as i64)
                    .unwrap_or(spec.sentinel),
                _ => *idx,
            })
            .collect()
    }

    /// Rebuild links from stored indices. Out-of-range indices resolve to none.
    pub(crate) fn resolve(&mut self, group: &GroupIndex, diagnostics: &mut Vec<Diagnostic>) {
        let (Some(spec), Some(stored)) = (self.kind.ref_spec(), self.value.as_ints()) else {
            return;
        };
        let mut links = Vec::with_capacity(stored.len());
        for idx in stored {
            if *idx == spec.sentinel {
                links.push(None);
            } else if let Some(id) = usize::try_from(*idx).ok().and_then(|i| group.id_at(i)) {
                links.push(Some(id));
            } else {
                warn!(
                    "reference '{}' index {idx} is outside group '{}' ({} entities)",
                    self.name,
                    group.name(),
                    group.len()
                );
                diagnostics.push(Diagnostic {
                    kind: DiagnosticKind::Reference,
                    offset: 0,
                    message: format!(
                        "'{}' points at {idx}, outside '{}' ({} entities)",
                        self.name,
                        group.name(),
                        group.len()
                    ),
                });
                links.push(None);
            }
        }
        self.links = links;
    }

    /// Re-flatten links after the target group changed. Links to entities no
    /// longer in the group are cleared to the sentinel. Returns true if any
    /// stored index changed.
    pub(crate) fn sync(&mut self, group: &GroupIndex) -> bool {
        let Some(sentinel) = self.kind.ref_spec().map(|s| s.sentinel) else {
            return false;
        };
        let Value::Ints(stored) = &mut self.value else {
            return false;
        };
        let mut changed = false;
        for (slot, idx) in stored.iter_mut().enumerate() {
            let Some(Some(id)) = self.links.get(slot).copied() else {
                continue;
            };
            let next = match group.index_of(id) {
                Some(i) => i as i64,
                None => {
                    self.links[slot] = None;
                    sentinel
                }
            };
            if *idx != next {
                *idx = next;
                changed = true;
            }
        }
        if changed {
            self.raw = None;
        }
        changed
    }

    pub(crate) fn set_link(&mut self, slot: usize, target: Option<EntityId>, group: &GroupIndex) -> Result<()> {
        let Some(sentinel) = self.kind.ref_spec().map(|s| s.sentinel) else {
            return Err(Error::InvalidOperation(format!("'{}' is not a reference", self.name)));
        };
        let Value::Ints(stored) = &mut self.value else {
            return Err(Error::InvalidOperation(format!("'{}' holds no indices", self.name)));
        };
        if slot >= stored.len() {
            return Err(Error::InvalidOperation(format!(
                "'{}' has {} slot(s), not {}",
                self.name,
                stored.len(),
                slot + 1
            )));
        }
        stored[slot] = match target {
            Some(id) => group.index_of(id).ok_or_else(|| Error::DanglingReference {
                group: group.name().to_string(),
                index: -1,
            })? as i64,
            None => sentinel,
        };
        self.links[slot] = target;
        self.raw = None;
        Ok(())
    }

    /// Shift stored indices of an imported dependent reference by `offset`.
    /// The sentinel is never shifted.
    pub(crate) fn apply_dependency_offset(&mut self, offset: i64) {
        let Some(spec) = self.kind.ref_spec() else {
            return;
        };
        if !spec.dependent || offset == 0 {
            return;
        }
        let sentinel = spec.sentinel;
        if let Value::Ints(stored) = &mut self.value {
            for idx in stored.iter_mut().filter(|i| **i != sentinel && **i >= 0) {
                *idx += offset;
            }
            self.raw = None;
        }
    }
}

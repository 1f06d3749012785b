use crate::dtype::TypeId;
use crate::label::LabelId;
use std::sync::{Arc, Weak};

/// A single payload value inside a record.
#[derive(Clone, Debug, PartialEq)]
pub enum Field {
    Null,
    UInt(u64),
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
    /// A group of whole records, produced by bundling.
    Bundle(Vec<Record>),
}

impl Field {
    /// Byte view used for keying. Numeric fields key on their
    /// little-endian encoding.
    pub fn as_key_bytes(&self) -> Vec<u8> {
        match self {
            Field::Null => vec![],
            Field::UInt(v) => v.to_le_bytes().to_vec(),
            Field::Int(v) => v.to_le_bytes().to_vec(),
            Field::Str(s) => s.as_bytes().to_vec(),
            Field::Bytes(b) => b.clone(),
            Field::Bundle(_) => vec![],
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Field::UInt(v) => Some(*v),
            Field::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }
}

/// Why a flush record was synthesized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushKind {
    /// End-of-run flush: sources are exhausted, the graph is draining.
    Exit,
    /// Mid-run flush requested by a module.
    Periodic,
}

#[derive(Clone, Debug, PartialEq)]
struct RecordInner {
    dtype: TypeId,
    labels: Vec<LabelId>,
    fields: Vec<Field>,
}

/// A labeled, reference-counted data record.
///
/// Cloning a `Record` clones the handle, not the payload. The scheduler
/// clones once per surviving subscriber edge and drops the clone after
/// dispatch, so the record is freed when the last consumer finishes
/// with it. Mutation after the record has been shared copies the
/// payload first.
#[derive(Clone, Debug)]
pub struct Record {
    inner: Arc<RecordInner>,
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl Record {
    pub fn new(dtype: TypeId) -> Self {
        Self::with_fields(dtype, vec![])
    }

    pub fn with_fields(dtype: TypeId, fields: Vec<Field>) -> Self {
        Self {
            inner: Arc::new(RecordInner {
                dtype,
                labels: Vec::new(),
                fields,
            }),
        }
    }

    pub fn dtype(&self) -> TypeId {
        self.inner.dtype
    }

    pub fn fields(&self) -> &[Field] {
        &self.inner.fields
    }

    pub fn fields_mut(&mut self) -> &mut Vec<Field> {
        &mut Arc::make_mut(&mut self.inner).fields
    }

    pub fn labels(&self) -> &[LabelId] {
        &self.inner.labels
    }

    pub fn add_label(&mut self, label: LabelId) {
        if !self.inner.labels.contains(&label) {
            Arc::make_mut(&mut self.inner).labels.push(label);
        }
    }

    pub fn has_label(&self, label: LabelId) -> bool {
        self.inner.labels.contains(&label)
    }

    /// Number of live handles to this record's payload.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Weak observer for drain accounting in tests: upgradeable only
    /// while at least one strong handle survives.
    pub fn observe(&self) -> RecordObserver {
        RecordObserver {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Weak handle to a record, used to observe whether it has been freed.
#[derive(Clone, Debug)]
pub struct RecordObserver {
    inner: Weak<RecordInner>,
}

impl RecordObserver {
    pub fn is_live(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

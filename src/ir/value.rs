use std::fmt::Display;

/// Function-local identity of a non-constant value.
///
/// Ids are handed out densely by [`FunctionBuilder`](super::FunctionBuilder),
/// so `index()` can be used to address per-value tables.
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy, Hash)]
pub struct ValueId(u32);

impl ValueId {
    pub fn new_with(num: u32) -> Self {
        ValueId(num)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl Display for ValueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Type {
    Int,
    Bool,
    Ptr,
    Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    Constant { value: i64, ty: Type },
    Parameter { id: ValueId, index: usize, ty: Type },
    Temporary { id: ValueId, ty: Type },
}

impl Value {
    pub fn int(value: i64) -> Self {
        Value::Constant {
            value,
            ty: Type::Int,
        }
    }

    pub fn bool(value: bool) -> Self {
        Value::Constant {
            value: value as i64,
            ty: Type::Bool,
        }
    }

    /// `None` for constants, which are never allocated.
    pub fn id(&self) -> Option<ValueId> {
        match self {
            Value::Constant { .. } => None,
            Value::Parameter { id, .. } | Value::Temporary { id, .. } => Some(*id),
        }
    }

    pub fn ty(&self) -> Type {
        match self {
            Value::Constant { ty, .. }
            | Value::Parameter { ty, .. }
            | Value::Temporary { ty, .. } => *ty,
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Value::Constant { .. })
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Constant { value, .. } => write!(f, "{}", value),
            Value::Parameter { index, .. } => write!(f, "%arg{}", index),
            Value::Temporary { id, .. } => write!(f, "%{}", id),
        }
    }
}

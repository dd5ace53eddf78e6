//! Expression algebra built from field references
//!
//! ```rust,ignore
//! let adults = User::field("age").gte(18) & User::field("name").contains("jo");
//! let older_first = User::field("birth_date").asc();
//! let reserve = Stock::field("available") - 1;
//! ```

use serde_json::Value;
use std::ops::{Add, BitAnd, BitOr, Not, Sub};

use crate::core::field::FieldKind;

/// Symbolic reference to a model field
#[derive(Debug, Clone)]
pub struct FieldRef {
    owner: String,
    path: String,
    in_array: bool,
    kind: Option<FieldKind>,
}

impl FieldRef {
    pub fn new(owner: &str, path: &str, kind: Option<FieldKind>) -> Self {
        Self {
            owner: owner.to_string(),
            path: path.to_string(),
            in_array: false,
            kind,
        }
    }

    /// Name of the model owning the field
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Dotted path from the document root, or from the array element when `in_array`
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn in_array(&self) -> bool {
        self.in_array
    }

    pub fn kind(&self) -> Option<&FieldKind> {
        self.kind.as_ref()
    }

    /// Reference a field of the elements of this array field
    pub fn elem(&self, sub_path: &str) -> FieldRef {
        FieldRef {
            owner: self.owner.clone(),
            path: sub_path.to_string(),
            in_array: true,
            kind: None,
        }
    }

    /// Reference the elements of this array field themselves
    pub fn element(&self) -> FieldRef {
        FieldRef {
            owner: self.owner.clone(),
            path: String::new(),
            in_array: true,
            kind: self.kind.clone(),
        }
    }

    /// Reference a nested field of this embedded model field
    pub fn child(&self, sub_path: &str) -> FieldRef {
        FieldRef {
            owner: self.owner.clone(),
            path: if self.path.is_empty() {
                sub_path.to_string()
            } else {
                format!("{}.{}", self.path, sub_path)
            },
            in_array: self.in_array,
            kind: None,
        }
    }

    fn compare(&self, op: CompareOp, operand: Value) -> Expr {
        Expr::Compare {
            field: self.clone(),
            op,
            operand,
        }
    }

    pub fn eq(&self, value: impl Into<Value>) -> Expr {
        self.compare(CompareOp::Eq, value.into())
    }

    pub fn ne(&self, value: impl Into<Value>) -> Expr {
        self.compare(CompareOp::Ne, value.into())
    }

    pub fn lt(&self, value: impl Into<Value>) -> Expr {
        self.compare(CompareOp::Lt, value.into())
    }

    pub fn lte(&self, value: impl Into<Value>) -> Expr {
        self.compare(CompareOp::Lte, value.into())
    }

    pub fn gt(&self, value: impl Into<Value>) -> Expr {
        self.compare(CompareOp::Gt, value.into())
    }

    pub fn gte(&self, value: impl Into<Value>) -> Expr {
        self.compare(CompareOp::Gte, value.into())
    }

    /// Case-insensitive substring match; a list operand matches any of its elements
    pub fn contains(&self, value: impl Into<Value>) -> Expr {
        match value.into() {
            Value::Array(items) => Expr::Bool {
                op: BoolOp::Or,
                children: items.into_iter().map(|item| self.eq(item)).collect(),
            },
            other => self.compare(CompareOp::Regex, other),
        }
    }

    pub fn is_in<I, V>(&self, values: I) -> Expr
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.compare(
            CompareOp::In,
            Value::Array(values.into_iter().map(Into::into).collect()),
        )
    }

    /// Array length equals `n`
    pub fn size(&self, n: u64) -> Expr {
        self.compare(CompareOp::Size, Value::from(n))
    }

    pub fn is_null(&self) -> Expr {
        self.compare(CompareOp::IsNull, Value::Null)
    }

    pub fn is_not_null(&self) -> Expr {
        !self.is_null()
    }

    /// Documents with at least one array element satisfying `inner`
    pub fn any(&self, inner: Expr) -> Expr {
        Expr::ArrayAny {
            field: self.clone(),
            inner: Box::new(inner),
        }
    }

    pub fn asc(&self) -> SortSpec {
        SortSpec {
            path: self.path.clone(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(&self) -> SortSpec {
        SortSpec {
            path: self.path.clone(),
            direction: SortDirection::Desc,
        }
    }

    fn update(&self, op: UpdateOp, operand: Value) -> Update {
        Update {
            field: self.clone(),
            op,
            operand,
        }
    }

    pub fn set(&self, value: impl Into<Value>) -> Update {
        self.update(UpdateOp::Set, value.into())
    }

    pub fn inc(&self, by: impl Into<Value>) -> Update {
        self.update(UpdateOp::Inc, by.into())
    }

    pub fn dec(&self, by: impl Into<Value>) -> Update {
        self.update(UpdateOp::Dec, by.into())
    }

    pub fn push(&self, value: impl Into<Value>) -> Update {
        self.update(UpdateOp::Push, value.into())
    }

    pub fn pull(&self, value: impl Into<Value>) -> Update {
        self.update(UpdateOp::Pull, value.into())
    }
}

impl Add<i64> for FieldRef {
    type Output = Update;

    fn add(self, rhs: i64) -> Update {
        self.inc(rhs)
    }
}

impl Sub<i64> for FieldRef {
    type Output = Update;

    fn sub(self, rhs: i64) -> Update {
        self.dec(rhs)
    }
}

impl Add<i64> for &FieldRef {
    type Output = Update;

    fn add(self, rhs: i64) -> Update {
        self.inc(rhs)
    }
}

impl Sub<i64> for &FieldRef {
    type Output = Update;

    fn sub(self, rhs: i64) -> Update {
        self.dec(rhs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    Regex,
    In,
    Size,
    IsNull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
    Not,
}

/// Filter expression tree
#[derive(Debug, Clone)]
pub enum Expr {
    Compare {
        field: FieldRef,
        op: CompareOp,
        operand: Value,
    },
    Bool {
        op: BoolOp,
        children: Vec<Expr>,
    },
    ArrayAny {
        field: FieldRef,
        inner: Box<Expr>,
    },
}

impl Expr {
    /// Conjunction of all expressions
    pub fn all(children: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::Bool {
            op: BoolOp::And,
            children: children.into_iter().collect(),
        }
    }

    /// Disjunction of all expressions
    pub fn any(children: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::Bool {
            op: BoolOp::Or,
            children: children.into_iter().collect(),
        }
    }

    fn combine(self, op: BoolOp, other: Expr) -> Expr {
        match self {
            Expr::Bool {
                op: current,
                mut children,
            } if current == op => {
                children.push(other);
                Expr::Bool { op, children }
            }
            lhs => Expr::Bool {
                op,
                children: vec![lhs, other],
            },
        }
    }

    pub fn and(self, other: Expr) -> Expr {
        self.combine(BoolOp::And, other)
    }

    pub fn or(self, other: Expr) -> Expr {
        self.combine(BoolOp::Or, other)
    }
}

impl BitAnd for Expr {
    type Output = Expr;

    fn bitand(self, rhs: Expr) -> Expr {
        self.and(rhs)
    }
}

impl BitOr for Expr {
    type Output = Expr;

    fn bitor(self, rhs: Expr) -> Expr {
        self.or(rhs)
    }
}

impl Not for Expr {
    type Output = Expr;

    fn not(self) -> Expr {
        Expr::Bool {
            op: BoolOp::Not,
            children: vec![self],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_i32(self) -> i32 {
        match self {
            SortDirection::Asc => 1,
            SortDirection::Desc => -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub path: String,
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn new(path: impl Into<String>, direction: SortDirection) -> Self {
        Self {
            path: path.into(),
            direction,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp {
    Set,
    Inc,
    Dec,
    Push,
    Pull,
}

/// Atomic update of one field
#[derive(Debug, Clone)]
pub struct Update {
    pub field: FieldRef,
    pub op: UpdateOp,
    pub operand: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field(path: &str) -> FieldRef {
        FieldRef::new("User", path, Some(FieldKind::String))
    }

    #[test]
    fn test_and_chains_flatten() {
        let expr = field("a").eq(1) & field("b").eq(2) & field("c").eq(3);
        match expr {
            Expr::Bool { op, children } => {
                assert_eq!(op, BoolOp::And);
                assert_eq!(children.len(), 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_mixed_operators_nest() {
        let expr = (field("a").eq(1) | field("b").eq(2)) & field("c").eq(3);
        match expr {
            Expr::Bool { op: BoolOp::And, children } => {
                assert!(matches!(children[0], Expr::Bool { op: BoolOp::Or, .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_contains_list_becomes_or() {
        match field("roles").contains(json!(["Admin", "User"])) {
            Expr::Bool { op: BoolOp::Or, children } => assert_eq!(children.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            field("name").contains("jo"),
            Expr::Compare { op: CompareOp::Regex, .. }
        ));
    }

    #[test]
    fn test_arithmetic_builds_updates() {
        let update = field("available") - 1;
        assert_eq!(update.op, UpdateOp::Dec);
        assert_eq!(update.operand, json!(1));
        let update = &field("available") + 5;
        assert_eq!(update.op, UpdateOp::Inc);
    }

    #[test]
    fn test_sort_specs() {
        assert_eq!(field("name").asc().direction.as_i32(), 1);
        assert_eq!(field("name").desc().direction.as_i32(), -1);
    }

    #[test]
    fn test_elem_refs() {
        let elem = field("addresses").elem("city");
        assert!(elem.in_array());
        assert_eq!(elem.path(), "city");
        assert_eq!(field("address").child("city").path(), "address.city");
    }
}

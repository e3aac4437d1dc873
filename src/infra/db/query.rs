//! Composable SELECT/UPDATE/DELETE statements rendered into [`sqlx::QueryBuilder`].
//!
//! Identifiers are `&'static str` and every value goes through `push_bind`, so
//! nothing supplied at runtime ends up in the SQL text. Conditions nest
//! arbitrarily through [`Condition::All`] (AND) and [`Condition::Any`] (OR).

use std::ops::Not;

use sqlx::{QueryBuilder, Sqlite};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Text(String),
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value.into())
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<&String> for Value {
    fn from(value: &String) -> Self {
        Value::Text(value.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl Op {
    fn as_sql(self) -> &'static str {
        match self {
            Op::Eq => " = ",
            Op::Ne => " <> ",
            Op::Lt => " < ",
            Op::Lte => " <= ",
            Op::Gt => " > ",
            Op::Gte => " >= ",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Compare {
        column: &'static str,
        op: Op,
        value: Value,
    },
    IsNull(&'static str),
    IsNotNull(&'static str),
    In {
        column: &'static str,
        values: Vec<Value>,
    },
    InSelect {
        column: &'static str,
        select: Box<Select>,
    },
    /// Every child must hold; renders `1=1` when empty.
    All(Vec<Condition>),
    /// At least one child must hold; renders `1=0` when empty.
    Any(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    fn compare(column: &'static str, op: Op, value: impl Into<Value>) -> Self {
        Condition::Compare {
            column,
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: &'static str, value: impl Into<Value>) -> Self {
        Self::compare(column, Op::Eq, value)
    }

    pub fn ne(column: &'static str, value: impl Into<Value>) -> Self {
        Self::compare(column, Op::Ne, value)
    }

    pub fn lt(column: &'static str, value: impl Into<Value>) -> Self {
        Self::compare(column, Op::Lt, value)
    }

    pub fn lte(column: &'static str, value: impl Into<Value>) -> Self {
        Self::compare(column, Op::Lte, value)
    }

    pub fn gt(column: &'static str, value: impl Into<Value>) -> Self {
        Self::compare(column, Op::Gt, value)
    }

    pub fn gte(column: &'static str, value: impl Into<Value>) -> Self {
        Self::compare(column, Op::Gte, value)
    }

    pub fn is_null(column: &'static str) -> Self {
        Condition::IsNull(column)
    }

    pub fn is_not_null(column: &'static str) -> Self {
        Condition::IsNotNull(column)
    }

    pub fn is_in<V: Into<Value>>(column: &'static str, values: impl IntoIterator<Item = V>) -> Self {
        Condition::In {
            column,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn in_select(column: &'static str, select: Select) -> Self {
        Condition::InSelect {
            column,
            select: Box::new(select),
        }
    }

    pub fn all(conditions: impl IntoIterator<Item = Condition>) -> Self {
        Condition::All(conditions.into_iter().collect())
    }

    pub fn any(conditions: impl IntoIterator<Item = Condition>) -> Self {
        Condition::Any(conditions.into_iter().collect())
    }

    /// Conjunction that flattens into an existing AND group.
    pub fn and(self, other: Condition) -> Self {
        match self {
            Condition::All(mut children) => {
                children.push(other);
                Condition::All(children)
            }
            first => Condition::All(vec![first, other]),
        }
    }

    /// Disjunction that flattens into an existing OR group.
    pub fn or(self, other: Condition) -> Self {
        match self {
            Condition::Any(mut children) => {
                children.push(other);
                Condition::Any(children)
            }
            first => Condition::Any(vec![first, other]),
        }
    }

    pub fn push_to<'args>(&self, qb: &mut QueryBuilder<'args, Sqlite>) {
        match self {
            Condition::Compare { column, op, value } => {
                qb.push(*column);
                qb.push(op.as_sql());
                push_value(qb, value);
            }
            Condition::IsNull(column) => {
                qb.push(*column);
                qb.push(" IS NULL");
            }
            Condition::IsNotNull(column) => {
                qb.push(*column);
                qb.push(" IS NOT NULL");
            }
            Condition::In { values, .. } if values.is_empty() => {
                qb.push("1=0");
            }
            Condition::In { column, values } => {
                qb.push(*column);
                qb.push(" IN (");
                for (index, value) in values.iter().enumerate() {
                    if index > 0 {
                        qb.push(", ");
                    }
                    push_value(qb, value);
                }
                qb.push(")");
            }
            Condition::InSelect { column, select } => {
                qb.push(*column);
                qb.push(" IN (");
                select.push_to(qb);
                qb.push(")");
            }
            Condition::All(children) => push_group(qb, children, " AND ", "1=1"),
            Condition::Any(children) => push_group(qb, children, " OR ", "1=0"),
            Condition::Not(inner) => {
                qb.push("NOT (");
                inner.push_to(qb);
                qb.push(")");
            }
        }
    }
}

impl Not for Condition {
    type Output = Condition;

    fn not(self) -> Self::Output {
        Condition::Not(Box::new(self))
    }
}

fn push_value<'args>(qb: &mut QueryBuilder<'args, Sqlite>, value: &Value) {
    match value {
        Value::Int(value) => {
            qb.push_bind(*value);
        }
        Value::Text(value) => {
            qb.push_bind(value.clone());
        }
    }
}

fn push_group<'args>(
    qb: &mut QueryBuilder<'args, Sqlite>,
    children: &[Condition],
    joiner: &'static str,
    empty: &'static str,
) {
    match children {
        [] => {
            qb.push(empty);
        }
        [only] => only.push_to(qb),
        many => {
            qb.push("(");
            for (index, child) in many.iter().enumerate() {
                if index > 0 {
                    qb.push(joiner);
                }
                child.push_to(qb);
            }
            qb.push(")");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

impl Order {
    fn as_sql(self) -> &'static str {
        match self {
            Order::Asc => " ASC",
            Order::Desc => " DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Select {
    table: &'static str,
    columns: Vec<&'static str>,
    filter: Condition,
    order_by: Vec<(&'static str, Order)>,
    limit: Option<i64>,
    offset: Option<i64>,
}

impl Select {
    pub fn from(table: &'static str) -> Self {
        Self {
            table,
            columns: vec!["*"],
            filter: Condition::All(Vec::new()),
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    /// `SELECT COUNT(*)` over the table.
    pub fn count(table: &'static str) -> Self {
        Self::from(table).columns(&["COUNT(*)"])
    }

    pub fn columns(mut self, columns: &[&'static str]) -> Self {
        self.columns = columns.to_vec();
        self
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.filter = condition;
        self
    }

    pub fn order_by(mut self, column: &'static str, order: Order) -> Self {
        self.order_by.push((column, order));
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn push_to<'args>(&self, qb: &mut QueryBuilder<'args, Sqlite>) {
        qb.push("SELECT ");
        qb.push(self.columns.join(", "));
        qb.push(" FROM ");
        qb.push(self.table);
        qb.push(" WHERE ");
        self.filter.push_to(qb);

        if !self.order_by.is_empty() {
            qb.push(" ORDER BY ");
            for (index, (column, order)) in self.order_by.iter().enumerate() {
                if index > 0 {
                    qb.push(", ");
                }
                qb.push(*column);
                qb.push(order.as_sql());
            }
        }

        // SQLite only accepts OFFSET after a LIMIT; -1 means unbounded.
        if self.limit.is_some() || self.offset.is_some() {
            qb.push(" LIMIT ");
            qb.push_bind(self.limit.unwrap_or(-1));
        }
        if let Some(offset) = self.offset {
            qb.push(" OFFSET ");
            qb.push_bind(offset);
        }
    }

    pub fn build<'args>(&self) -> QueryBuilder<'args, Sqlite> {
        let mut qb = QueryBuilder::new("");
        self.push_to(&mut qb);
        qb
    }
}

/// Right-hand side of a `SET column = ...` assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assign {
    Value(Value),
    Null,
    /// Static expression over the row, e.g. `attempts + 1`.
    Expr(&'static str),
    /// Keep the current value unless it is NULL.
    IfNull(Value),
}

#[derive(Debug, Clone)]
pub struct Update {
    table: &'static str,
    assignments: Vec<(&'static str, Assign)>,
    filter: Condition,
    returning: Vec<&'static str>,
}

impl Update {
    pub fn table(table: &'static str) -> Self {
        Self {
            table,
            assignments: Vec::new(),
            filter: Condition::All(Vec::new()),
            returning: Vec::new(),
        }
    }

    pub fn set(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.assignments.push((column, Assign::Value(value.into())));
        self
    }

    pub fn set_null(mut self, column: &'static str) -> Self {
        self.assignments.push((column, Assign::Null));
        self
    }

    pub fn set_expr(mut self, column: &'static str, expr: &'static str) -> Self {
        self.assignments.push((column, Assign::Expr(expr)));
        self
    }

    pub fn set_if_null(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.assignments.push((column, Assign::IfNull(value.into())));
        self
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.filter = condition;
        self
    }

    pub fn returning(mut self, columns: &[&'static str]) -> Self {
        self.returning = columns.to_vec();
        self
    }

    pub fn push_to<'args>(&self, qb: &mut QueryBuilder<'args, Sqlite>) {
        qb.push("UPDATE ");
        qb.push(self.table);
        qb.push(" SET ");
        for (index, (column, assign)) in self.assignments.iter().enumerate() {
            if index > 0 {
                qb.push(", ");
            }
            qb.push(*column);
            qb.push(" = ");
            match assign {
                Assign::Value(value) => push_value(qb, value),
                Assign::Null => {
                    qb.push("NULL");
                }
                Assign::Expr(expr) => {
                    qb.push(*expr);
                }
                Assign::IfNull(value) => {
                    qb.push("COALESCE(");
                    qb.push(*column);
                    qb.push(", ");
                    push_value(qb, value);
                    qb.push(")");
                }
            }
        }
        qb.push(" WHERE ");
        self.filter.push_to(qb);
        if !self.returning.is_empty() {
            qb.push(" RETURNING ");
            qb.push(self.returning.join(", "));
        }
    }

    pub fn build<'args>(&self) -> QueryBuilder<'args, Sqlite> {
        let mut qb = QueryBuilder::new("");
        self.push_to(&mut qb);
        qb
    }
}

#[derive(Debug, Clone)]
pub struct Delete {
    table: &'static str,
    filter: Condition,
    bound: Option<(&'static str, &'static str, Order, i64)>,
}

impl Delete {
    pub fn from(table: &'static str) -> Self {
        Self {
            table,
            filter: Condition::All(Vec::new()),
            bound: None,
        }
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.filter = condition;
        self
    }

    /// Delete at most `limit` matching rows, picked by `order_column`.
    ///
    /// Rendered as `key IN (SELECT key ... LIMIT n)` since SQLite builds
    /// without `DELETE ... LIMIT` by default.
    pub fn bounded(
        mut self,
        key: &'static str,
        order_column: &'static str,
        order: Order,
        limit: i64,
    ) -> Self {
        self.bound = Some((key, order_column, order, limit));
        self
    }

    pub fn push_to<'args>(&self, qb: &mut QueryBuilder<'args, Sqlite>) {
        qb.push("DELETE FROM ");
        qb.push(self.table);
        qb.push(" WHERE ");
        match self.bound {
            None => self.filter.push_to(qb),
            Some((key, order_column, order, limit)) => {
                let inner = Select::from(self.table)
                    .columns(&[key])
                    .filter(self.filter.clone())
                    .order_by(order_column, order)
                    .limit(limit);
                Condition::in_select(key, inner).push_to(qb);
            }
        }
    }

    pub fn build<'args>(&self) -> QueryBuilder<'args, Sqlite> {
        let mut qb = QueryBuilder::new("");
        self.push_to(&mut qb);
        qb
    }
}

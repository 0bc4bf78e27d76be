//! The conjunction-of-filters query model described by the spec's
//! `query(q)` / `watch_query(q)` contract. Only the semantics the engine
//! depends on are implemented here — this is not a general query DSL.

use rusqlite::types::Value as SqlValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    IsNull,
    IsNotNull,
    In,
    NotIn,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Text(String),
    Integer(i64),
    Real(f64),
    Boolean(bool),
    List(Vec<FilterValue>),
}

impl FilterValue {
    fn to_sql(&self) -> SqlValue {
        match self {
            FilterValue::Text(s) => SqlValue::Text(s.clone()),
            FilterValue::Integer(i) => SqlValue::Integer(*i),
            FilterValue::Real(r) => SqlValue::Real(*r),
            FilterValue::Boolean(b) => SqlValue::Integer(if *b { 1 } else { 0 }),
            FilterValue::List(_) => unreachable!("lists are expanded by the caller"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Option<FilterValue>,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: FilterValue) -> Self {
        Self { field: field.into(), op: FilterOp::Eq, value: Some(value) }
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Self { field: field.into(), op: FilterOp::IsNull, value: None }
    }

    pub fn is_not_null(field: impl Into<String>) -> Self {
        Self { field: field.into(), op: FilterOp::IsNotNull, value: None }
    }

    pub fn in_set(field: impl Into<String>, values: Vec<FilterValue>) -> Self {
        Self { field: field.into(), op: FilterOp::In, value: Some(FilterValue::List(values)) }
    }

    pub fn not_in_set(field: impl Into<String>, values: Vec<FilterValue>) -> Self {
        Self { field: field.into(), op: FilterOp::NotIn, value: Some(FilterValue::List(values)) }
    }
}

#[derive(Debug, Clone)]
pub struct SortKey {
    pub field: String,
    pub descending: bool,
}

impl SortKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self { field: field.into(), descending: false }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self { field: field.into(), descending: true }
    }
}

#[derive(Debug, Clone)]
pub struct Query {
    pub repository: String,
    pub filters: Vec<Filter>,
    pub sorts: Vec<SortKey>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub include_deleted: bool,
}

impl Query {
    pub fn new(repository: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            filters: Vec::new(),
            sorts: Vec::new(),
            limit: None,
            offset: None,
            include_deleted: false,
        }
    }

    pub fn filter(mut self, f: Filter) -> Self {
        self.filters.push(f);
        self
    }

    pub fn sort(mut self, s: SortKey) -> Self {
        self.sorts.push(s);
        self
    }

    pub fn limit(mut self, n: i64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: i64) -> Self {
        self.offset = Some(n);
        self
    }

    pub fn include_deleted(mut self, yes: bool) -> Self {
        self.include_deleted = yes;
        self
    }

    /// Returns `true` for a conjunction that can never match anything — an
    /// empty `in`-set, per spec. Callers short-circuit instead of querying.
    pub fn is_unsatisfiable(&self) -> bool {
        self.filters.iter().any(|f| match (&f.op, &f.value) {
            (FilterOp::In, Some(FilterValue::List(items))) => items.is_empty(),
            _ => false,
        })
    }

    /// Compile to a `(sql, params)` pair selecting from `table`, joined
    /// against the event table's last-applied-event metadata columns which
    /// the caller has aliased as `le_*`.
    pub fn compile_where(&self, indexed_fields: &[String]) -> (String, Vec<SqlValue>) {
        let mut clauses = Vec::new();
        let mut params = Vec::new();

        if !self.include_deleted {
            clauses.push("le_operation IS NOT 'delete'".to_string());
        }

        for f in &self.filters {
            let col = if indexed_fields.iter().any(|n| n == &f.field) {
                format!("\"{}\"", f.field)
            } else {
                // Unindexed fields are read out of the JSON payload.
                format!("json_extract(data, '$.{}')", f.field)
            };

            match f.op {
                FilterOp::Eq => {
                    clauses.push(format!("{col} = ?"));
                    params.push(f.value.as_ref().unwrap().to_sql());
                }
                FilterOp::Ne => {
                    clauses.push(format!("{col} != ?"));
                    params.push(f.value.as_ref().unwrap().to_sql());
                }
                FilterOp::Lt => {
                    clauses.push(format!("{col} < ?"));
                    params.push(f.value.as_ref().unwrap().to_sql());
                }
                FilterOp::Le => {
                    clauses.push(format!("{col} <= ?"));
                    params.push(f.value.as_ref().unwrap().to_sql());
                }
                FilterOp::Gt => {
                    clauses.push(format!("{col} > ?"));
                    params.push(f.value.as_ref().unwrap().to_sql());
                }
                FilterOp::Ge => {
                    clauses.push(format!("{col} >= ?"));
                    params.push(f.value.as_ref().unwrap().to_sql());
                }
                FilterOp::IsNull => {
                    clauses.push(format!("{col} IS NULL"));
                }
                FilterOp::IsNotNull => {
                    clauses.push(format!("{col} IS NOT NULL"));
                }
                FilterOp::In => {
                    if let Some(FilterValue::List(items)) = &f.value {
                        let placeholders = vec!["?"; items.len()].join(", ");
                        clauses.push(format!("{col} IN ({placeholders})"));
                        for item in items {
                            params.push(item.to_sql());
                        }
                    }
                }
                FilterOp::NotIn => {
                    if let Some(FilterValue::List(items)) = &f.value {
                        let placeholders = vec!["?"; items.len()].join(", ");
                        clauses.push(format!("{col} NOT IN ({placeholders})"));
                        for item in items {
                            params.push(item.to_sql());
                        }
                    }
                }
            }
        }

        let where_sql = if clauses.is_empty() {
            "1=1".to_string()
        } else {
            clauses.join(" AND ")
        };
        (where_sql, params)
    }

    pub fn compile_order_by(&self, indexed_fields: &[String]) -> String {
        if self.sorts.is_empty() {
            return String::new();
        }
        let parts: Vec<String> = self
            .sorts
            .iter()
            .map(|s| {
                let col = if indexed_fields.iter().any(|n| n == &s.field) {
                    format!("\"{}\"", s.field)
                } else {
                    format!("json_extract(data, '$.{}')", s.field)
                };
                format!("{col} {}", if s.descending { "DESC" } else { "ASC" })
            })
            .collect();
        format!(" ORDER BY {}", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_in_set_is_unsatisfiable() {
        let q = Query::new("user").filter(Filter::in_set("name", vec![]));
        assert!(q.is_unsatisfiable());
    }

    #[test]
    fn non_empty_in_set_is_satisfiable() {
        let q = Query::new("user").filter(Filter::in_set("name", vec![FilterValue::Text("a".into())]));
        assert!(!q.is_unsatisfiable());
    }

    #[test]
    fn excludes_deleted_by_default() {
        let q = Query::new("user");
        let (sql, _) = q.compile_where(&[]);
        assert!(sql.contains("le_operation IS NOT 'delete'"));
    }

    #[test]
    fn include_deleted_skips_clause() {
        let q = Query::new("user").include_deleted(true);
        let (sql, _) = q.compile_where(&[]);
        assert!(!sql.contains("le_operation"));
    }
}

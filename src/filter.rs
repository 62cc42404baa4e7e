//! Predicate builders for record queries.
//!
//! Conditions are collected as a token stream (conditions, groups, `or`,
//! `not`) in the style of a fluent query builder and compiled to a
//! parameterized SQL clause against the resolved schema's slots. Only
//! fields with their own slot are queryable: the object id, the timestamp
//! roles, and denormalized keys. Consecutive conditions combine with AND
//! unless separated by `or()`.

use rusqlite::types::Value as SqlValue;

use crate::error::{Error, Result};
use crate::schema::Schema;
use crate::value::Value;

#[derive(Debug, Clone)]
enum Op {
  Eq(Value),
  Ne(Value),
  Gt(Value),
  Ge(Value),
  Lt(Value),
  Le(Value),
  Between(Value, Value),
  Contains(String),
  BeginsWith(String),
  EndsWith(String),
  In(Vec<Value>),
  IsNull,
  IsNotNull,
}

#[derive(Debug, Clone)]
enum Token {
  Cond { field: String, op: Op },
  BeginGroup,
  EndGroup,
  Or,
  Not,
}

/// A predicate under construction, in terms of queryable field names.
#[derive(Debug, Clone, Default)]
pub struct Filter {
  tokens: Vec<Token>,
}

impl Filter {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn is_empty(&self) -> bool {
    self.tokens.is_empty()
  }

  fn cond(mut self, field: impl Into<String>, op: Op) -> Self {
    self.tokens.push(Token::Cond {
      field: field.into(),
      op,
    });
    self
  }

  pub fn equal_to(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
    self.cond(field, Op::Eq(value.into()))
  }

  pub fn not_equal_to(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
    self.cond(field, Op::Ne(value.into()))
  }

  pub fn greater_than(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
    self.cond(field, Op::Gt(value.into()))
  }

  pub fn greater_than_or_equal_to(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
    self.cond(field, Op::Ge(value.into()))
  }

  pub fn less_than(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
    self.cond(field, Op::Lt(value.into()))
  }

  pub fn less_than_or_equal_to(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
    self.cond(field, Op::Le(value.into()))
  }

  /// Inclusive range condition.
  pub fn between(
    self,
    field: impl Into<String>,
    from: impl Into<Value>,
    to: impl Into<Value>,
  ) -> Self {
    self.cond(field, Op::Between(from.into(), to.into()))
  }

  pub fn contains(self, field: impl Into<String>, value: impl Into<String>) -> Self {
    self.cond(field, Op::Contains(value.into()))
  }

  pub fn begins_with(self, field: impl Into<String>, value: impl Into<String>) -> Self {
    self.cond(field, Op::BeginsWith(value.into()))
  }

  pub fn ends_with(self, field: impl Into<String>, value: impl Into<String>) -> Self {
    self.cond(field, Op::EndsWith(value.into()))
  }

  /// Membership condition. The value list must not be empty.
  pub fn is_in(self, field: impl Into<String>, values: Vec<Value>) -> Self {
    self.cond(field, Op::In(values))
  }

  pub fn is_null(self, field: impl Into<String>) -> Self {
    self.cond(field, Op::IsNull)
  }

  pub fn is_not_null(self, field: impl Into<String>) -> Self {
    self.cond(field, Op::IsNotNull)
  }

  /// Begin a parenthesized group; close it with `end_group`.
  pub fn begin_group(mut self) -> Self {
    self.tokens.push(Token::BeginGroup);
    self
  }

  pub fn end_group(mut self) -> Self {
    self.tokens.push(Token::EndGroup);
    self
  }

  /// Combine the previous and next condition with OR instead of AND.
  pub fn or(mut self) -> Self {
    self.tokens.push(Token::Or);
    self
  }

  /// Negate the next condition or group.
  pub fn not(mut self) -> Self {
    self.tokens.push(Token::Not);
    self
  }

  /// Compile to a SQL clause over the schema's slots. Fields without a
  /// slot of their own are rejected: they live inside the payload and are
  /// not reachable by the store's predicate pushdown.
  pub(crate) fn compile(&self, schema: &Schema, class_name: &str) -> Result<CompiledFilter> {
    let mut clause = String::new();
    let mut params: Vec<SqlValue> = Vec::new();
    let mut depth = 0usize;
    let mut pending_or = false;
    let mut pending_not = false;
    // True once something precedes the next condition at the current level
    let mut need_connector = false;

    for token in &self.tokens {
      match token {
        Token::Cond { field, op } => {
          let slot = schema.slot_for_field(field).ok_or_else(|| {
            Error::Configuration(format!(
              "field {field} of class {class_name} has no queryable slot"
            ))
          })?;
          if need_connector {
            clause.push_str(if pending_or { " OR " } else { " AND " });
          }
          if pending_not {
            clause.push_str("NOT ");
          }
          compile_condition(slot, op, &mut clause, &mut params)?;
          need_connector = true;
          pending_or = false;
          pending_not = false;
        }
        Token::BeginGroup => {
          if need_connector {
            clause.push_str(if pending_or { " OR " } else { " AND " });
          }
          if pending_not {
            clause.push_str("NOT ");
          }
          clause.push('(');
          depth += 1;
          need_connector = false;
          pending_or = false;
          pending_not = false;
        }
        Token::EndGroup => {
          if depth == 0 {
            return Err(Error::Configuration(
              "end_group() without matching begin_group()".to_string(),
            ));
          }
          if !need_connector {
            return Err(Error::Configuration("empty predicate group".to_string()));
          }
          clause.push(')');
          depth -= 1;
          need_connector = true;
        }
        Token::Or => {
          if !need_connector || pending_or {
            return Err(Error::Configuration(
              "or() must come between two conditions".to_string(),
            ));
          }
          pending_or = true;
        }
        Token::Not => {
          pending_not = true;
        }
      }
    }

    if depth != 0 {
      return Err(Error::Configuration(
        "begin_group() without matching end_group()".to_string(),
      ));
    }
    if pending_or || pending_not {
      return Err(Error::Configuration(
        "dangling or()/not() at end of predicate".to_string(),
      ));
    }

    Ok(CompiledFilter { clause, params })
  }
}

/// A predicate compiled against a concrete schema.
#[derive(Debug, Clone)]
pub(crate) struct CompiledFilter {
  pub clause: String,
  pub params: Vec<SqlValue>,
}

impl CompiledFilter {
  /// Single-slot equality, used for lookups by object id.
  pub fn equals(slot: &str, value: &str) -> Self {
    Self {
      clause: format!("\"{slot}\" = ?"),
      params: vec![SqlValue::Text(value.to_string())],
    }
  }
}

fn compile_condition(
  slot: &str,
  op: &Op,
  clause: &mut String,
  params: &mut Vec<SqlValue>,
) -> Result<()> {
  let column = format!("\"{slot}\"");
  match op {
    Op::Eq(Value::Null) => clause.push_str(&format!("{column} IS NULL")),
    Op::Ne(Value::Null) => clause.push_str(&format!("{column} IS NOT NULL")),
    Op::Eq(v) => {
      clause.push_str(&format!("{column} = ?"));
      params.push(scalar_param(v)?);
    }
    Op::Ne(v) => {
      clause.push_str(&format!("{column} != ?"));
      params.push(scalar_param(v)?);
    }
    Op::Gt(v) => {
      clause.push_str(&format!("{column} > ?"));
      params.push(scalar_param(v)?);
    }
    Op::Ge(v) => {
      clause.push_str(&format!("{column} >= ?"));
      params.push(scalar_param(v)?);
    }
    Op::Lt(v) => {
      clause.push_str(&format!("{column} < ?"));
      params.push(scalar_param(v)?);
    }
    Op::Le(v) => {
      clause.push_str(&format!("{column} <= ?"));
      params.push(scalar_param(v)?);
    }
    Op::Between(from, to) => {
      clause.push_str(&format!("{column} BETWEEN ? AND ?"));
      params.push(scalar_param(from)?);
      params.push(scalar_param(to)?);
    }
    Op::Contains(s) => {
      clause.push_str(&format!("{column} LIKE ? ESCAPE '\\'"));
      params.push(SqlValue::Text(format!("%{}%", escape_like(s))));
    }
    Op::BeginsWith(s) => {
      clause.push_str(&format!("{column} LIKE ? ESCAPE '\\'"));
      params.push(SqlValue::Text(format!("{}%", escape_like(s))));
    }
    Op::EndsWith(s) => {
      clause.push_str(&format!("{column} LIKE ? ESCAPE '\\'"));
      params.push(SqlValue::Text(format!("%{}", escape_like(s))));
    }
    Op::In(values) => {
      if values.is_empty() {
        return Err(Error::Configuration(
          "is_in() requires at least one value".to_string(),
        ));
      }
      let placeholders: Vec<&str> = values.iter().map(|_| "?").collect();
      clause.push_str(&format!("{column} IN ({})", placeholders.join(", ")));
      for v in values {
        params.push(scalar_param(v)?);
      }
    }
    Op::IsNull => clause.push_str(&format!("{column} IS NULL")),
    Op::IsNotNull => clause.push_str(&format!("{column} IS NOT NULL")),
  }
  Ok(())
}

/// Map a scalar predicate argument to its stored representation.
fn scalar_param(value: &Value) -> Result<SqlValue> {
  match value {
    Value::Null => Ok(SqlValue::Null),
    Value::Bool(b) => Ok(SqlValue::Integer(i64::from(*b))),
    Value::Integer(n) => Ok(SqlValue::Integer(*n)),
    Value::Float(n) => Ok(SqlValue::Real(*n)),
    Value::String(s) => Ok(SqlValue::Text(s.clone())),
    Value::Pointer(_) | Value::List(_) | Value::Map(_) => Err(Error::Configuration(
      "only scalar values can be used in predicates".to_string(),
    )),
  }
}

/// Escape LIKE wildcards in a literal match string.
fn escape_like(s: &str) -> String {
  let mut out = String::with_capacity(s.len());
  for c in s.chars() {
    if matches!(c, '%' | '_' | '\\') {
      out.push('\\');
    }
    out.push(c);
  }
  out
}

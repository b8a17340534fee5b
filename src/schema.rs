//! Declared table schemas and the process-wide binding cache
//!
//! A target type declares once, in [`CdcRecord::schema`], how source
//! columns map onto its fields. The declaration is finalized and validated
//! the first time [`bindings_for`] sees the type and is reused for every
//! message after that.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;

use crate::error::{CdcError, Result};

/// A record type decodable from captured row changes
///
/// Implementors are `Default`-constructed per event and filled in by the
/// decoder, so fields without a matching column keep their default value.
/// `chrono::DateTime` has no default; timestamp fields are therefore
/// usually `Option<DateTime<Utc>>`, or the record implements `Default` by
/// hand.
///
/// ```
/// use cdc_connector::{CdcRecord, SchemaBuilder};
///
/// #[derive(Default)]
/// struct User {
///     id: i64,
///     user_name: String,
///     deleted: bool,
/// }
///
/// impl CdcRecord for User {
///     fn schema() -> SchemaBuilder<Self> {
///         SchemaBuilder::<Self>::new()
///             .int("id", |r, v| r.id = v)
///             .string("user_name", |r, v| r.user_name = v)
///             .bool("deleted", |r, v| r.deleted = v)
///     }
/// }
/// ```
pub trait CdcRecord: Default + Send + Sync + 'static {
    /// Declare the column-to-field bindings for this record
    fn schema() -> SchemaBuilder<Self>;
}

/// Wire representation expected for a bound field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Numeric flag, `1` means true
    Bool,
    String,
    Int,
    Float,
    /// Epoch milliseconds or a `YYYY-MM-DD HH:MM:SS` string
    Timestamp,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldKind::Bool => "bool",
            FieldKind::String => "string",
            FieldKind::Int => "int",
            FieldKind::Float => "float",
            FieldKind::Timestamp => "timestamp",
        };
        f.write_str(name)
    }
}

/// A decoded column value on its way into a record field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    String(String),
    Int(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
}

type Setter<T> = Arc<dyn Fn(&mut T, FieldValue) + Send + Sync>;

/// One column-to-field mapping inside a [`TableSchema`]
pub struct FieldBinding<T> {
    field: String,
    column: String,
    kind: FieldKind,
    nullable: bool,
    set: Setter<T>,
}

impl<T> FieldBinding<T> {
    /// Target field path; embedded members read `embed.member`
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Resolved source column name
    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    /// Whether the target stores an optional value
    pub fn nullable(&self) -> bool {
        self.nullable
    }

    pub(crate) fn apply(&self, record: &mut T, value: FieldValue) {
        (self.set)(record, value)
    }
}

impl<T> fmt::Debug for FieldBinding<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldBinding")
            .field("field", &self.field)
            .field("column", &self.column)
            .field("kind", &self.kind)
            .field("nullable", &self.nullable)
            .finish()
    }
}

/// Finalized, validated binding table for one record type
pub struct TableSchema<T> {
    record: &'static str,
    bindings: Vec<FieldBinding<T>>,
}

impl<T> TableSchema<T> {
    /// Bindings in declaration order
    pub fn bindings(&self) -> &[FieldBinding<T>] {
        &self.bindings
    }

    /// Short name of the record type, for diagnostics
    pub fn record_name(&self) -> &'static str {
        self.record
    }
}

impl<T> fmt::Debug for TableSchema<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableSchema")
            .field("record", &self.record)
            .field("bindings", &self.bindings)
            .finish()
    }
}

struct PendingBinding<T> {
    field: String,
    column: Option<String>,
    kind: FieldKind,
    nullable: bool,
    set: Setter<T>,
}

/// Declares the bindings of a [`CdcRecord`]
///
/// Each binding method names the target field and takes the closure that
/// writes the decoded value into the record. Start a declaration with
/// `SchemaBuilder::<Self>::new()`; naming the record type up front is what
/// lets the binding closures infer their argument types. The source column
/// defaults to the snake_case form of the field name;
/// [`SchemaBuilder::column`] overrides it for the binding declared
/// immediately before.
pub struct SchemaBuilder<T> {
    bindings: Vec<PendingBinding<T>>,
    misuse: Option<String>,
}

impl<T: CdcRecord> Default for SchemaBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: CdcRecord> SchemaBuilder<T> {
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
            misuse: None,
        }
    }

    /// Bind a numeric flag column, stored as `v == 1`
    pub fn bool(
        self,
        field: &'static str,
        set: impl Fn(&mut T, bool) + Send + Sync + 'static,
    ) -> Self {
        self.push(field, FieldKind::Bool, false, wrap_bool(set))
    }

    /// Bind a numeric flag column into an optional field
    pub fn opt_bool(
        self,
        field: &'static str,
        set: impl Fn(&mut T, bool) + Send + Sync + 'static,
    ) -> Self {
        self.push(field, FieldKind::Bool, true, wrap_bool(set))
    }

    /// Bind a text column
    pub fn string(
        self,
        field: &'static str,
        set: impl Fn(&mut T, String) + Send + Sync + 'static,
    ) -> Self {
        self.push(field, FieldKind::String, false, wrap_string(set))
    }

    /// Bind a text column into an optional field
    pub fn opt_string(
        self,
        field: &'static str,
        set: impl Fn(&mut T, String) + Send + Sync + 'static,
    ) -> Self {
        self.push(field, FieldKind::String, true, wrap_string(set))
    }

    /// Bind an integer column; wire numbers are truncated toward zero
    pub fn int(
        self,
        field: &'static str,
        set: impl Fn(&mut T, i64) + Send + Sync + 'static,
    ) -> Self {
        self.push(field, FieldKind::Int, false, wrap_int(set))
    }

    /// Bind an integer column into an optional field
    pub fn opt_int(
        self,
        field: &'static str,
        set: impl Fn(&mut T, i64) + Send + Sync + 'static,
    ) -> Self {
        self.push(field, FieldKind::Int, true, wrap_int(set))
    }

    /// Bind a floating point column
    pub fn float(
        self,
        field: &'static str,
        set: impl Fn(&mut T, f64) + Send + Sync + 'static,
    ) -> Self {
        self.push(field, FieldKind::Float, false, wrap_float(set))
    }

    /// Bind a floating point column into an optional field
    pub fn opt_float(
        self,
        field: &'static str,
        set: impl Fn(&mut T, f64) + Send + Sync + 'static,
    ) -> Self {
        self.push(field, FieldKind::Float, true, wrap_float(set))
    }

    /// Bind a timestamp column; accepts epoch milliseconds or a formatted
    /// wall-clock string
    pub fn timestamp(
        self,
        field: &'static str,
        set: impl Fn(&mut T, DateTime<Utc>) + Send + Sync + 'static,
    ) -> Self {
        self.push(field, FieldKind::Timestamp, false, wrap_timestamp(set))
    }

    /// Bind a timestamp column into an optional field
    pub fn opt_timestamp(
        self,
        field: &'static str,
        set: impl Fn(&mut T, DateTime<Utc>) + Send + Sync + 'static,
    ) -> Self {
        self.push(field, FieldKind::Timestamp, true, wrap_timestamp(set))
    }

    /// Override the source column of the binding declared immediately
    /// before
    pub fn column(mut self, name: impl Into<String>) -> Self {
        match self.bindings.last_mut() {
            Some(last) => last.column = Some(name.into()),
            None => self.note_misuse("column override must follow a field binding"),
        }
        self
    }

    /// Flatten another record's bindings into this schema through a member
    /// projection
    ///
    /// The embedded type keeps its own column names; its field paths are
    /// prefixed with `field.` for diagnostics. Relation members are simply
    /// never embedded.
    pub fn embed<E: CdcRecord>(mut self, field: &'static str, project: fn(&mut T) -> &mut E) -> Self {
        match bindings_for::<E>() {
            Ok(embedded) => {
                for binding in embedded.bindings() {
                    let set = Arc::clone(&binding.set);
                    self.bindings.push(PendingBinding {
                        field: format!("{field}.{}", binding.field),
                        column: Some(binding.column.clone()),
                        kind: binding.kind,
                        nullable: binding.nullable,
                        set: Arc::new(move |record: &mut T, value| set(project(record), value)),
                    });
                }
            }
            Err(err) => {
                self.note_misuse(format!("embedded {}: {err}", short_type_name::<E>()));
            }
        }
        self
    }

    fn push(mut self, field: &'static str, kind: FieldKind, nullable: bool, set: Setter<T>) -> Self {
        self.bindings.push(PendingBinding {
            field: field.to_string(),
            column: None,
            kind,
            nullable,
            set,
        });
        self
    }

    fn note_misuse(&mut self, reason: impl Into<String>) {
        if self.misuse.is_none() {
            self.misuse = Some(reason.into());
        }
    }

    fn build(self) -> Result<TableSchema<T>> {
        let record = short_type_name::<T>();
        if let Some(reason) = self.misuse {
            return Err(CdcError::Schema { record, reason });
        }
        let mut seen_fields = HashSet::new();
        let mut seen_columns = HashSet::new();
        let mut bindings = Vec::with_capacity(self.bindings.len());
        for pending in self.bindings {
            let column = pending
                .column
                .unwrap_or_else(|| snake_case(&pending.field));
            if !seen_fields.insert(pending.field.clone()) {
                return Err(CdcError::Schema {
                    record,
                    reason: format!("field {} is bound more than once", pending.field),
                });
            }
            if !seen_columns.insert(column.clone()) {
                return Err(CdcError::Schema {
                    record,
                    reason: format!("column {column} is bound more than once"),
                });
            }
            bindings.push(FieldBinding {
                field: pending.field,
                column,
                kind: pending.kind,
                nullable: pending.nullable,
                set: pending.set,
            });
        }
        Ok(TableSchema { record, bindings })
    }
}

fn wrap_bool<T>(set: impl Fn(&mut T, bool) + Send + Sync + 'static) -> Setter<T> {
    Arc::new(move |record, value| {
        if let FieldValue::Bool(v) = value {
            set(record, v)
        }
    })
}

fn wrap_string<T>(set: impl Fn(&mut T, String) + Send + Sync + 'static) -> Setter<T> {
    Arc::new(move |record, value| {
        if let FieldValue::String(v) = value {
            set(record, v)
        }
    })
}

fn wrap_int<T>(set: impl Fn(&mut T, i64) + Send + Sync + 'static) -> Setter<T> {
    Arc::new(move |record, value| {
        if let FieldValue::Int(v) = value {
            set(record, v)
        }
    })
}

fn wrap_float<T>(set: impl Fn(&mut T, f64) + Send + Sync + 'static) -> Setter<T> {
    Arc::new(move |record, value| {
        if let FieldValue::Float(v) = value {
            set(record, v)
        }
    })
}

fn wrap_timestamp<T>(set: impl Fn(&mut T, DateTime<Utc>) + Send + Sync + 'static) -> Setter<T> {
    Arc::new(move |record, value| {
        if let FieldValue::Timestamp(v) = value {
            set(record, v)
        }
    })
}

static SCHEMA_CACHE: Lazy<RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Finalized bindings for `T`, built on first use and cached for the life
/// of the process
///
/// Safe to race from multiple consumption units; a concurrent first call
/// builds twice and keeps one result.
pub fn bindings_for<T: CdcRecord>() -> Result<Arc<TableSchema<T>>> {
    let key = TypeId::of::<T>();
    {
        let cache = SCHEMA_CACHE.read().unwrap_or_else(|e| e.into_inner());
        if let Some(cached) = cache.get(&key) {
            if let Ok(schema) = Arc::clone(cached).downcast::<TableSchema<T>>() {
                return Ok(schema);
            }
        }
    }

    // Build outside the lock: schema declarations may themselves resolve
    // embedded types through this cache.
    let built = Arc::new(T::schema().build()?);

    let mut cache = SCHEMA_CACHE.write().unwrap_or_else(|e| e.into_inner());
    if let Some(cached) = cache.get(&key) {
        if let Ok(schema) = Arc::clone(cached).downcast::<TableSchema<T>>() {
            return Ok(schema);
        }
    }
    cache.insert(key, built.clone());
    Ok(built)
}

/// Deterministic snake_case form of a field name, used as the default
/// source column (`EntityType` -> `entity_type`, `AgeTT` -> `age_tt`)
pub(crate) fn snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() {
            let prev_soft = i > 0
                && (chars[i - 1].is_ascii_lowercase() || chars[i - 1].is_ascii_digit());
            let prev_upper = i > 0 && chars[i - 1].is_ascii_uppercase();
            let next_lower = chars
                .get(i + 1)
                .map_or(false, |n| n.is_ascii_lowercase());
            if prev_soft || (prev_upper && next_lower) {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Account {
        id: i64,
        user_name: String,
        entity_type: String,
        external_ref: String,
        active: bool,
    }

    impl CdcRecord for Account {
        fn schema() -> SchemaBuilder<Self> {
            SchemaBuilder::<Self>::new()
                .int("id", |r, v| r.id = v)
                .string("user_name", |r, v| r.user_name = v)
                .string("EntityType", |r, v| r.entity_type = v)
                .string("external_ref", |r, v| r.external_ref = v)
                .column("legacy_ref")
                .bool("active", |r, v| r.active = v)
        }
    }

    #[derive(Default)]
    struct Audit {
        created_at: Option<DateTime<Utc>>,
        updated_at: Option<DateTime<Utc>>,
    }

    impl CdcRecord for Audit {
        fn schema() -> SchemaBuilder<Self> {
            SchemaBuilder::<Self>::new()
                .opt_timestamp("created_at", |r, v| r.created_at = Some(v))
                .opt_timestamp("updated_at", |r, v| r.updated_at = Some(v))
        }
    }

    #[derive(Default)]
    struct Post {
        id: i64,
        audit: Audit,
    }

    impl CdcRecord for Post {
        fn schema() -> SchemaBuilder<Self> {
            SchemaBuilder::<Self>::new()
                .int("id", |r, v| r.id = v)
                .embed("audit", |r: &mut Post| &mut r.audit)
        }
    }

    #[test]
    fn snake_case_matches_naming_convention() {
        assert_eq!(snake_case("EntityType"), "entity_type");
        assert_eq!(snake_case("AgeTT"), "age_tt");
        assert_eq!(snake_case("ID"), "id");
        assert_eq!(snake_case("UserID"), "user_id");
        assert_eq!(snake_case("HTMLBody"), "html_body");
        assert_eq!(snake_case("already_snake"), "already_snake");
        assert_eq!(snake_case("name"), "name");
    }

    #[test]
    fn columns_resolve_from_field_names_and_overrides() {
        let schema = bindings_for::<Account>().unwrap();
        let columns: Vec<&str> = schema.bindings().iter().map(|b| b.column()).collect();
        assert_eq!(
            columns,
            vec!["id", "user_name", "entity_type", "legacy_ref", "active"]
        );
    }

    #[test]
    fn bindings_are_cached_per_type() {
        let first = bindings_for::<Account>().unwrap();
        let second = bindings_for::<Account>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn setters_write_through_to_the_record() {
        let schema = bindings_for::<Account>().unwrap();
        let mut account = Account::default();
        schema.bindings()[0].apply(&mut account, FieldValue::Int(42));
        schema.bindings()[1].apply(&mut account, FieldValue::String("ada".into()));
        schema.bindings()[2].apply(&mut account, FieldValue::String("person".into()));
        schema.bindings()[3].apply(&mut account, FieldValue::String("ext-1".into()));
        schema.bindings()[4].apply(&mut account, FieldValue::Bool(true));
        assert_eq!(account.id, 42);
        assert_eq!(account.user_name, "ada");
        assert_eq!(account.entity_type, "person");
        assert_eq!(account.external_ref, "ext-1");
        assert!(account.active);
    }

    #[test]
    fn mismatched_value_kind_is_ignored_by_the_setter() {
        let schema = bindings_for::<Account>().unwrap();
        let mut account = Account::default();
        schema.bindings()[0].apply(&mut account, FieldValue::String("nope".into()));
        assert_eq!(account.id, 0);
    }

    #[test]
    fn embedding_flattens_bindings_through_the_projection() {
        let schema = bindings_for::<Post>().unwrap();
        let fields: Vec<&str> = schema.bindings().iter().map(|b| b.field()).collect();
        assert_eq!(fields, vec!["id", "audit.created_at", "audit.updated_at"]);
        let columns: Vec<&str> = schema.bindings().iter().map(|b| b.column()).collect();
        assert_eq!(columns, vec!["id", "created_at", "updated_at"]);

        let mut post = Post::default();
        let when = DateTime::from_timestamp(1_704_067_200, 0).unwrap();
        schema.bindings()[1].apply(&mut post, FieldValue::Timestamp(when));
        assert_eq!(post.audit.created_at, Some(when));
        assert_eq!(post.audit.updated_at, None);
    }

    #[derive(Default)]
    struct DoubleField {
        id: i64,
    }

    impl CdcRecord for DoubleField {
        fn schema() -> SchemaBuilder<Self> {
            SchemaBuilder::<Self>::new()
                .int("id", |r, v| r.id = v)
                .int("id", |r, v| r.id = v)
        }
    }

    #[derive(Default)]
    struct DoubleColumn {
        id: i64,
        other: i64,
    }

    impl CdcRecord for DoubleColumn {
        fn schema() -> SchemaBuilder<Self> {
            SchemaBuilder::<Self>::new()
                .int("id", |r, v| r.id = v)
                .int("other", |r, v| r.other = v)
                .column("id")
        }
    }

    #[derive(Default)]
    struct StrayOverride {
        id: i64,
    }

    impl CdcRecord for StrayOverride {
        fn schema() -> SchemaBuilder<Self> {
            SchemaBuilder::<StrayOverride>::new()
                .column("first")
                .int("id", |r, v| r.id = v)
        }
    }

    #[test]
    fn duplicate_fields_are_rejected() {
        let err = bindings_for::<DoubleField>().unwrap_err();
        assert!(matches!(err, CdcError::Schema { record, .. } if record == "DoubleField"));
        // A failed build is never cached, so the error is repeatable.
        assert!(bindings_for::<DoubleField>().is_err());
    }

    #[test]
    fn duplicate_columns_are_rejected() {
        let err = bindings_for::<DoubleColumn>().unwrap_err();
        assert!(
            matches!(err, CdcError::Schema { ref reason, .. } if reason.contains("column id")),
            "{err}"
        );
    }

    #[test]
    fn stray_column_override_is_rejected() {
        let err = bindings_for::<StrayOverride>().unwrap_err();
        assert!(
            matches!(err, CdcError::Schema { ref reason, .. } if reason.contains("override")),
            "{err}"
        );
    }
}

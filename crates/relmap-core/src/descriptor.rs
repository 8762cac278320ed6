//! Persistence descriptors.
//!
//! A [`Descriptor`] maps one entity type onto one table: ordered field
//! mappings (attribute name, column name, SQL type), the primary-key
//! attributes, and an explicit accessor pair per attribute. Accessors are
//! plain function pointers built once when the descriptor is built, so the
//! engine never reaches into an object by name at runtime.
//!
//! Single-table inheritance is expressed with a discriminator attribute and a
//! list of variants. Each variant names the attributes only it carries and a
//! factory that constructs it. An attribute owned by one variant is *absent*
//! on objects of any other variant: it is never read, compared or written.

use std::any::{Any, TypeId};
use std::fmt;
use std::marker::PhantomData;

use crate::entity::Entity;
use crate::error::{DescriptorError, DescriptorErrorKind, Error, Result, TypeError};
use crate::identity::IdentityKey;
use crate::row::Row;
use crate::types::SqlType;
use crate::value::Value;

/// Reads one attribute of a `T` as a [`Value`].
pub type Getter<T> = fn(&T) -> Value;

/// Writes one attribute of a `T` from a [`Value`].
pub type Setter<T> = fn(&mut T, Value) -> Result<()>;

/// How two values of one attribute are compared during change detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComparisonPolicy {
    /// Direct value equality.
    Value,
    /// The attribute holds the primary key of another entity; equal when it
    /// identifies the same object.
    Reference {
        /// Entity name of the referenced descriptor
        target: &'static str,
    },
    /// The attribute holds an array of elements.
    Collection(CollectionOrder),
}

/// Element order semantics for collection mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionOrder {
    /// Same elements in the same order
    Ordered,
    /// Same elements with the same multiplicity, any order
    Unordered,
}

/// Type-erased accessor pair for one attribute.
trait AttributeAccessor: Send + Sync {
    fn get(&self, object: &dyn Any) -> Option<Value>;
    fn set(&self, object: &mut dyn Any, value: Value) -> Option<Result<()>>;
}

struct FnAccessor<T> {
    get: Getter<T>,
    set: Setter<T>,
}

impl<T: 'static> AttributeAccessor for FnAccessor<T> {
    fn get(&self, object: &dyn Any) -> Option<Value> {
        object.downcast_ref::<T>().map(self.get)
    }

    fn set(&self, object: &mut dyn Any, value: Value) -> Option<Result<()>> {
        object.downcast_mut::<T>().map(|obj| (self.set)(obj, value))
    }
}

trait ObjectFactory: Send + Sync {
    fn create(&self) -> Box<dyn Any + Send + Sync>;
}

struct FnFactory<T>(fn() -> T);

impl<T: Send + Sync + 'static> ObjectFactory for FnFactory<T> {
    fn create(&self) -> Box<dyn Any + Send + Sync> {
        Box::new((self.0)())
    }
}

/// Mapping of one attribute onto one column.
pub struct FieldMapping {
    attribute: &'static str,
    column: &'static str,
    sql_type: SqlType,
    nullable: bool,
    policy: ComparisonPolicy,
    accessor: Box<dyn AttributeAccessor>,
}

impl FieldMapping {
    pub fn attribute(&self) -> &'static str {
        self.attribute
    }

    pub fn column(&self) -> &'static str {
        self.column
    }

    pub fn sql_type(&self) -> &SqlType {
        &self.sql_type
    }

    pub fn nullable(&self) -> bool {
        self.nullable
    }

    pub fn policy(&self) -> &ComparisonPolicy {
        &self.policy
    }

    /// Entity referenced by this mapping, if it is a reference mapping.
    pub fn reference_target(&self) -> Option<&'static str> {
        match self.policy {
            ComparisonPolicy::Reference { target } => Some(target),
            _ => None,
        }
    }

    /// Compare two values of this attribute under the mapping's policy.
    pub fn values_equal(&self, a: &Value, b: &Value) -> bool {
        match &self.policy {
            ComparisonPolicy::Value | ComparisonPolicy::Reference { .. } => a.key_eq(b),
            ComparisonPolicy::Collection(order) => match (a, b) {
                (Value::Array(left), Value::Array(right)) => match order {
                    CollectionOrder::Ordered => a.key_eq(b),
                    CollectionOrder::Unordered => same_elements(left, right),
                },
                _ => a.key_eq(b),
            },
        }
    }
}

impl fmt::Debug for FieldMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldMapping")
            .field("attribute", &self.attribute)
            .field("column", &self.column)
            .field("sql_type", &self.sql_type)
            .field("nullable", &self.nullable)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Multiset comparison; elements compared with identity-key equality.
fn same_elements(left: &[Value], right: &[Value]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    let mut used = vec![false; right.len()];
    'outer: for item in left {
        for (i, candidate) in right.iter().enumerate() {
            if !used[i] && item.key_eq(candidate) {
                used[i] = true;
                continue 'outer;
            }
        }
        return false;
    }
    true
}

/// One concrete variant in a single-table inheritance hierarchy.
pub struct Variant {
    name: &'static str,
    tag: Value,
    attributes: Vec<usize>,
    factory: Box<dyn ObjectFactory>,
}

impl Variant {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Discriminator value identifying this variant.
    pub fn tag(&self) -> &Value {
        &self.tag
    }

    /// Indexes of the mappings only this variant carries.
    pub fn attributes(&self) -> &[usize] {
        &self.attributes
    }
}

impl fmt::Debug for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variant")
            .field("name", &self.name)
            .field("tag", &self.tag)
            .field("attributes", &self.attributes)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct Inheritance {
    discriminator: usize,
    variants: Vec<Variant>,
    /// `true` for mappings listed by at least one variant.
    variant_specific: Vec<bool>,
}

/// Snapshot of an object's mapped attributes, in mapping order.
///
/// `None` marks an attribute that does not apply to the object's variant;
/// `Some(Value::Null)` is an explicit null.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectState {
    values: Vec<Option<Value>>,
}

impl ObjectState {
    pub fn new(values: Vec<Option<Value>>) -> Self {
        Self { values }
    }

    /// Value of the attribute at `index`, `None` when absent.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index).and_then(Option::as_ref)
    }

    pub fn values(&self) -> &[Option<Value>] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Immutable persistence metadata for one entity type.
pub struct Descriptor {
    entity: &'static str,
    type_id: TypeId,
    table: &'static str,
    mappings: Vec<FieldMapping>,
    primary_key: Vec<usize>,
    generated_key: bool,
    inheritance: Option<Inheritance>,
    factory: Box<dyn ObjectFactory>,
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("entity", &self.entity)
            .field("table", &self.table)
            .field("mappings", &self.mappings)
            .field("primary_key", &self.primary_key)
            .field("generated_key", &self.generated_key)
            .field("inheritance", &self.inheritance)
            .finish_non_exhaustive()
    }
}

impl Descriptor {
    pub fn entity(&self) -> &'static str {
        self.entity
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    pub fn mappings(&self) -> &[FieldMapping] {
        &self.mappings
    }

    pub fn mapping(&self, index: usize) -> Option<&FieldMapping> {
        self.mappings.get(index)
    }

    /// Index of the mapping for `attribute`.
    pub fn index_of(&self, attribute: &str) -> Option<usize> {
        self.mappings.iter().position(|m| m.attribute == attribute)
    }

    /// Mapping for `attribute`, or an unknown-attribute error.
    pub fn attribute(&self, attribute: &str) -> Result<(usize, &FieldMapping)> {
        self.index_of(attribute)
            .map(|i| (i, &self.mappings[i]))
            .ok_or_else(|| Error::unknown_attribute(self.entity, attribute))
    }

    /// Indexes of the primary-key mappings, in key order.
    pub fn primary_key(&self) -> &[usize] {
        &self.primary_key
    }

    /// Whether the database assigns the (single) primary key on insert.
    pub fn has_generated_key(&self) -> bool {
        self.generated_key
    }

    pub fn columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.mappings.iter().map(|m| m.column)
    }

    /// Entities this descriptor references, excluding itself.
    pub fn referenced_entities(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.mappings
            .iter()
            .filter_map(FieldMapping::reference_target)
            .filter(move |target| *target != self.entity)
    }

    pub fn variants(&self) -> &[Variant] {
        self.inheritance
            .as_ref()
            .map_or(&[][..], |inh| inh.variants.as_slice())
    }

    /// Index of the discriminator mapping, if the entity has variants.
    pub fn discriminator(&self) -> Option<usize> {
        self.inheritance.as_ref().map(|inh| inh.discriminator)
    }

    fn variant_for(&self, tag: &Value) -> Option<&Variant> {
        self.inheritance
            .as_ref()
            .and_then(|inh| inh.variants.iter().find(|v| v.tag.key_eq(tag)))
    }

    /// Whether the mapping at `index` applies to an object of `variant`.
    fn applies(&self, index: usize, variant: Option<&Variant>) -> bool {
        let Some(inh) = &self.inheritance else {
            return true;
        };
        if !inh.variant_specific[index] {
            return true;
        }
        variant.is_some_and(|v| v.attributes.contains(&index))
    }

    fn access_error(&self, message: &str) -> Error {
        Error::Descriptor(DescriptorError {
            kind: DescriptorErrorKind::Access,
            entity: self.entity.to_string(),
            message: message.to_string(),
        })
    }

    /// Read every applicable attribute of `object`.
    pub fn read_state(&self, object: &dyn Any) -> Result<ObjectState> {
        let variant = match &self.inheritance {
            Some(inh) => {
                let tag = self.mappings[inh.discriminator]
                    .accessor
                    .get(object)
                    .ok_or_else(|| self.access_error("object is not of the described type"))?;
                self.variant_for(&tag)
            }
            None => None,
        };
        let mut values = Vec::with_capacity(self.mappings.len());
        for (index, mapping) in self.mappings.iter().enumerate() {
            if !self.applies(index, variant) {
                values.push(None);
                continue;
            }
            let value = mapping
                .accessor
                .get(object)
                .ok_or_else(|| self.access_error("object is not of the described type"))?;
            values.push(Some(value));
        }
        Ok(ObjectState { values })
    }

    /// Write `value` into the attribute at `index` of `object`.
    pub fn apply(&self, object: &mut dyn Any, index: usize, value: Value) -> Result<()> {
        let mapping = self
            .mappings
            .get(index)
            .ok_or_else(|| self.access_error("attribute index out of range"))?;
        mapping
            .accessor
            .set(object, value)
            .ok_or_else(|| self.access_error("object is not of the described type"))?
    }

    /// Identity key built from the primary-key attributes of `state`.
    ///
    /// Returns `None` while any key attribute is null, which is how a new,
    /// not-yet-keyed object is recognized.
    pub fn key_from_state(&self, state: &ObjectState) -> Option<IdentityKey> {
        let mut values = Vec::with_capacity(self.primary_key.len());
        for &index in &self.primary_key {
            match state.get(index) {
                Some(v) if !v.is_null() => values.push(v.clone()),
                _ => return None,
            }
        }
        Some(IdentityKey::new(self.entity, values))
    }

    /// Identity key for explicit primary-key values.
    pub fn key_from_values(&self, values: Vec<Value>) -> Result<IdentityKey> {
        if values.len() != self.primary_key.len() || values.iter().any(Value::is_null) {
            return Err(Error::Descriptor(DescriptorError {
                kind: DescriptorErrorKind::MissingPrimaryKey,
                entity: self.entity.to_string(),
                message: format!(
                    "expected {} non-null primary key value(s), got {}",
                    self.primary_key.len(),
                    values.len()
                ),
            }));
        }
        Ok(IdentityKey::new(self.entity, values))
    }

    /// Identity key of the row's primary-key columns.
    pub fn key_from_row(&self, row: &Row) -> Result<IdentityKey> {
        let mut values = Vec::with_capacity(self.primary_key.len());
        for &index in &self.primary_key {
            values.push(self.column_value(row, index)?.clone());
        }
        self.key_from_values(values)
    }

    fn column_value<'r>(&self, row: &'r Row, index: usize) -> Result<&'r Value> {
        let column = self.mappings[index].column;
        row.get_by_name(column).ok_or_else(|| {
            Error::Type(TypeError {
                expected: "mapped column",
                actual: format!("column '{}' missing from result", column),
                column: Some(column.to_string()),
                rust_type: None,
            })
        })
    }

    /// Construct a new object from a result row.
    ///
    /// The discriminator column, when present, selects the variant factory.
    pub fn instantiate(&self, row: &Row) -> Result<Box<dyn Any + Send + Sync>> {
        let variant = match &self.inheritance {
            Some(inh) => {
                let tag = self.column_value(row, inh.discriminator)?;
                Some(self.variant_for(tag).ok_or_else(|| {
                    self.access_error(&format!("unknown discriminator value {}", tag))
                })?)
            }
            None => None,
        };
        let mut object = match variant {
            Some(v) => v.factory.create(),
            None => self.factory.create(),
        };
        for (index, mapping) in self.mappings.iter().enumerate() {
            if !self.applies(index, variant) {
                continue;
            }
            let value = self.column_value(row, index)?.clone();
            mapping
                .accessor
                .set(object.as_mut() as &mut dyn Any, value)
                .ok_or_else(|| self.access_error("factory produced a foreign type"))??;
        }
        Ok(object)
    }

    /// Typed variant of [`Descriptor::instantiate`].
    pub fn build_from_row<T: Entity>(&self, row: &Row) -> Result<T> {
        self.instantiate(row)?
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| self.access_error("descriptor does not describe the requested type"))
    }
}

/// Builder for a [`Descriptor`], usually returned from [`Entity::descriptor`].
///
/// ```rust,ignore
/// DescriptorBuilder::<Employee>::new("EMPLOYEE")
///     .field("id", "EMP_ID", SqlType::BigInt, |e| e.id.into(), |e, v| { e.id = v.try_into()?; Ok(()) })
///     .field("salary", "SALARY", SqlType::BigInt, |e| e.salary.into(), |e, v| { e.salary = v.try_into()?; Ok(()) })
///     .primary_key(&["id"])
/// ```
pub struct DescriptorBuilder<T> {
    table: &'static str,
    mappings: Vec<FieldMapping>,
    primary_key: Vec<&'static str>,
    generated_key: bool,
    discriminator: Option<&'static str>,
    variants: Vec<(&'static str, Value, fn() -> T, Vec<&'static str>)>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Entity> DescriptorBuilder<T> {
    pub fn new(table: &'static str) -> Self {
        Self {
            table,
            mappings: Vec::new(),
            primary_key: Vec::new(),
            generated_key: false,
            discriminator: None,
            variants: Vec::new(),
            _marker: PhantomData,
        }
    }

    fn push(
        mut self,
        attribute: &'static str,
        column: &'static str,
        sql_type: SqlType,
        policy: ComparisonPolicy,
        get: Getter<T>,
        set: Setter<T>,
    ) -> Self {
        self.mappings.push(FieldMapping {
            attribute,
            column,
            sql_type,
            nullable: true,
            policy,
            accessor: Box::new(FnAccessor { get, set }),
        });
        self
    }

    /// Map a plain attribute compared by value.
    pub fn field(
        self,
        attribute: &'static str,
        column: &'static str,
        sql_type: SqlType,
        get: Getter<T>,
        set: Setter<T>,
    ) -> Self {
        self.push(attribute, column, sql_type, ComparisonPolicy::Value, get, set)
    }

    /// Map a foreign-key attribute holding the primary key of `target`.
    pub fn reference(
        self,
        attribute: &'static str,
        column: &'static str,
        sql_type: SqlType,
        target: &'static str,
        get: Getter<T>,
        set: Setter<T>,
    ) -> Self {
        self.push(
            attribute,
            column,
            sql_type,
            ComparisonPolicy::Reference { target },
            get,
            set,
        )
    }

    /// Map an array-valued attribute.
    pub fn collection(
        self,
        attribute: &'static str,
        column: &'static str,
        sql_type: SqlType,
        order: CollectionOrder,
        get: Getter<T>,
        set: Setter<T>,
    ) -> Self {
        self.push(
            attribute,
            column,
            sql_type,
            ComparisonPolicy::Collection(order),
            get,
            set,
        )
    }

    /// Mark the most recently added mapping NOT NULL.
    pub fn not_null(mut self) -> Self {
        if let Some(last) = self.mappings.last_mut() {
            last.nullable = false;
        }
        self
    }

    pub fn primary_key(mut self, attributes: &[&'static str]) -> Self {
        self.primary_key = attributes.to_vec();
        self
    }

    /// The database assigns the primary key; INSERT omits it.
    pub fn generated_key(mut self) -> Self {
        self.generated_key = true;
        self
    }

    /// Use `attribute` to select the variant when reading rows.
    pub fn discriminator(mut self, attribute: &'static str) -> Self {
        self.discriminator = Some(attribute);
        self
    }

    /// Declare a variant identified by `tag` carrying `attributes`.
    pub fn variant(
        mut self,
        name: &'static str,
        tag: impl Into<Value>,
        factory: fn() -> T,
        attributes: &[&'static str],
    ) -> Self {
        self.variants
            .push((name, tag.into(), factory, attributes.to_vec()));
        self
    }

    fn invalid(message: String) -> Error {
        Error::Descriptor(DescriptorError {
            kind: DescriptorErrorKind::Registry,
            entity: T::ENTITY_NAME.to_string(),
            message,
        })
    }

    /// Validate and freeze the descriptor.
    pub fn build(self) -> Result<Descriptor> {
        let entity = T::ENTITY_NAME;
        for (i, m) in self.mappings.iter().enumerate() {
            let duplicate = self.mappings[..i]
                .iter()
                .any(|other| other.attribute == m.attribute || other.column == m.column);
            if duplicate {
                return Err(Self::invalid(format!(
                    "attribute '{}' or column '{}' mapped twice",
                    m.attribute, m.column
                )));
            }
        }
        let index_of = |attr: &str| -> Result<usize> {
            self.mappings
                .iter()
                .position(|m| m.attribute == attr)
                .ok_or_else(|| Error::unknown_attribute(entity, attr))
        };

        if self.primary_key.is_empty() {
            return Err(Error::Descriptor(DescriptorError {
                kind: DescriptorErrorKind::MissingPrimaryKey,
                entity: entity.to_string(),
                message: format!("entity '{}' declares no primary key", entity),
            }));
        }
        let primary_key = self
            .primary_key
            .iter()
            .map(|attr| index_of(attr))
            .collect::<Result<Vec<_>>>()?;
        if self.generated_key
            && (primary_key.len() != 1 || !self.mappings[primary_key[0]].sql_type.can_generate())
        {
            return Err(Self::invalid(
                "a generated key requires exactly one integer primary-key attribute".to_string(),
            ));
        }

        let inheritance = match self.discriminator {
            Some(attr) => {
                let discriminator = index_of(attr)?;
                let mut variant_specific = vec![false; self.mappings.len()];
                let mut variants = Vec::with_capacity(self.variants.len());
                for (name, tag, factory, attrs) in self.variants {
                    if tag.is_null() || variants.iter().any(|v: &Variant| v.tag.key_eq(&tag)) {
                        return Err(Self::invalid(format!(
                            "variant '{}' has a null or duplicate discriminator value",
                            name
                        )));
                    }
                    let mut attributes = Vec::with_capacity(attrs.len());
                    for attr in attrs {
                        let index = index_of(attr)?;
                        if index == discriminator || primary_key.contains(&index) {
                            return Err(Self::invalid(format!(
                                "key or discriminator attribute '{}' cannot be variant-specific",
                                attr
                            )));
                        }
                        variant_specific[index] = true;
                        attributes.push(index);
                    }
                    variants.push(Variant {
                        name,
                        tag,
                        attributes,
                        factory: Box::new(FnFactory(factory)),
                    });
                }
                if variants.is_empty() {
                    return Err(Self::invalid("discriminator declared without variants".into()));
                }
                Some(Inheritance {
                    discriminator,
                    variants,
                    variant_specific,
                })
            }
            None if !self.variants.is_empty() => {
                return Err(Self::invalid("variants declared without a discriminator".into()));
            }
            None => None,
        };

        Ok(Descriptor {
            entity,
            type_id: TypeId::of::<T>(),
            table: self.table,
            mappings: self.mappings,
            primary_key,
            generated_key: self.generated_key,
            inheritance,
            factory: Box::new(FnFactory(T::default)),
        })
    }
}

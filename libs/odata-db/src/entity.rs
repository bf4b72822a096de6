//! Entity metadata: what an entity set looks like on the wire and in the database.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use sea_orm::sea_query::ColumnType;
use sea_orm::{
    ColumnTrait, EntityTrait, IdenStatic, Iterable, PrimaryKeyToColumn,
    PrimaryKeyTrait,
};

/// Logical property types.
///
/// Drives literal coercion in filters, request-body decoding and
/// row-to-JSON rendering.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    String,
    I64,
    F64,
    Bool,
    Uuid,
    DateTimeUtc,
    Date,
    Time,
    Decimal,
}

impl FieldKind {
    /// CSDL primitive type name.
    #[must_use]
    pub fn edm_type(self) -> &'static str {
        match self {
            FieldKind::String => "Edm.String",
            FieldKind::I64 => "Edm.Int64",
            FieldKind::F64 => "Edm.Double",
            FieldKind::Bool => "Edm.Boolean",
            FieldKind::Uuid => "Edm.Guid",
            FieldKind::DateTimeUtc => "Edm.DateTimeOffset",
            FieldKind::Date => "Edm.Date",
            FieldKind::Time => "Edm.TimeOfDay",
            FieldKind::Decimal => "Edm.Decimal",
        }
    }

    #[must_use]
    pub fn is_numeric(self) -> bool {
        matches!(self, FieldKind::I64 | FieldKind::F64 | FieldKind::Decimal)
    }

    fn from_column_type(ty: &ColumnType) -> Option<Self> {
        Some(match ty {
            ColumnType::Char(_) | ColumnType::String(_) | ColumnType::Text => FieldKind::String,
            ColumnType::TinyInteger
            | ColumnType::SmallInteger
            | ColumnType::Integer
            | ColumnType::BigInteger
            | ColumnType::TinyUnsigned
            | ColumnType::SmallUnsigned
            | ColumnType::Unsigned
            | ColumnType::BigUnsigned => FieldKind::I64,
            ColumnType::Float | ColumnType::Double => FieldKind::F64,
            ColumnType::Decimal(_) | ColumnType::Money(_) => FieldKind::Decimal,
            ColumnType::Boolean => FieldKind::Bool,
            ColumnType::Uuid => FieldKind::Uuid,
            ColumnType::DateTime | ColumnType::Timestamp | ColumnType::TimestampWithTimeZone => {
                FieldKind::DateTimeUtc
            }
            ColumnType::Date => FieldKind::Date,
            ColumnType::Time => FieldKind::Time,
            _ => return None,
        })
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldKind::String => "String",
            FieldKind::I64 => "I64",
            FieldKind::F64 => "F64",
            FieldKind::Bool => "Bool",
            FieldKind::Uuid => "Uuid",
            FieldKind::DateTimeUtc => "DateTimeUtc",
            FieldKind::Date => "Date",
            FieldKind::Time => "Time",
            FieldKind::Decimal => "Decimal",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Property {
    /// Name used in URLs, filters and JSON bodies.
    pub name: String,
    pub column: String,
    pub kind: FieldKind,
    pub nullable: bool,
    /// Filled in by the database (auto-increment keys, defaults); ignored in request bodies.
    pub computed: bool,
}

impl Property {
    /// Non-nullable property whose column has the same name.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        let name = name.into();
        Self {
            column: name.clone(),
            name,
            kind,
            nullable: false,
            computed: false,
        }
    }

    #[must_use]
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    #[must_use]
    pub fn computed(mut self) -> Self {
        self.computed = true;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NavigationKind {
    OneToOne,
    OneToMany,
    ManyToOne,
}

impl NavigationKind {
    /// Whether the navigation yields a collection.
    #[must_use]
    pub fn is_collection(self) -> bool {
        matches!(self, NavigationKind::OneToMany)
    }
}

/// Declared relation to another entity type.
///
/// For `ManyToOne` and `OneToOne` the foreign key is a property of the
/// source type; for `OneToMany` it is a property of the target type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Navigation {
    pub name: String,
    pub kind: NavigationKind,
    /// Entity type name, resolved through [`EntityRegistry`] on use.
    pub target: String,
    pub foreign_key: String,
}

impl Navigation {
    #[must_use]
    pub fn many_to_one(
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self::new(name, NavigationKind::ManyToOne, target, foreign_key)
    }

    #[must_use]
    pub fn one_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self::new(name, NavigationKind::OneToMany, target, foreign_key)
    }

    #[must_use]
    pub fn one_to_one(
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self::new(name, NavigationKind::OneToOne, target, foreign_key)
    }

    fn new(
        name: impl Into<String>,
        kind: NavigationKind,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            target: target.into(),
            foreign_key: foreign_key.into(),
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum EntityError {
    #[error("entity type '{0}' declares no key")]
    MissingKey(String),

    #[error("key '{key}' is not a property of '{entity}'")]
    UnknownKey { entity: String, key: String },

    #[error("entity type '{0}' has a composite primary key")]
    CompositeKey(String),

    #[error("'{entity}' declares '{name}' more than once")]
    Duplicate { entity: String, name: String },

    #[error("column '{column}' of '{entity}' has unsupported type {ty}")]
    UnsupportedColumnType {
        entity: String,
        column: String,
        ty: String,
    },

    #[error("entity type or set '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("navigation '{entity}/{navigation}' targets unknown entity type '{target}'")]
    UnresolvedTarget {
        entity: String,
        navigation: String,
        target: String,
    },

    #[error("navigation '{entity}/{navigation}' uses unknown foreign key '{foreign_key}'")]
    UnknownForeignKey {
        entity: String,
        navigation: String,
        foreign_key: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityType {
    pub name: String,
    pub set_name: String,
    pub table: String,
    pub schema: Option<String>,
    pub key: String,
    pub properties: Vec<Property>,
    pub navigations: Vec<Navigation>,
    key_property: Property,
}

impl EntityType {
    pub fn builder(name: impl Into<String>) -> EntityTypeBuilder {
        EntityTypeBuilder::new(name)
    }

    /// Builder pre-filled from a SeaORM entity: table, schema, key and one
    /// property per column (API names in `PascalCase`).
    ///
    /// # Errors
    /// `EntityError::CompositeKey` or `EntityError::UnsupportedColumnType`.
    pub fn from_sea_orm<E>(name: impl Into<String>) -> Result<EntityTypeBuilder, EntityError>
    where
        E: EntityTrait,
    {
        let name = name.into();
        let entity = E::default();

        let mut keys = E::PrimaryKey::iter().map(|pk| pk.into_column().as_str().to_owned());
        let key_column = keys.next().ok_or_else(|| EntityError::MissingKey(name.clone()))?;
        if keys.next().is_some() {
            return Err(EntityError::CompositeKey(name));
        }
        let auto_increment = <E::PrimaryKey as PrimaryKeyTrait>::auto_increment();

        let mut builder = EntityTypeBuilder::new(name.clone()).table(entity.table_name());
        if let Some(schema) = entity.schema_name() {
            builder = builder.schema(schema);
        }

        for col in E::Column::iter() {
            let column = col.as_str();
            let def = col.def();
            let kind = FieldKind::from_column_type(def.get_column_type()).ok_or_else(|| {
                EntityError::UnsupportedColumnType {
                    entity: name.clone(),
                    column: column.to_owned(),
                    ty: format!("{:?}", def.get_column_type()),
                }
            })?;

            let mut prop = Property::new(pascal_case(column), kind).column(column);
            if column == key_column {
                builder = builder.key(prop.name.clone());
                if auto_increment {
                    prop = prop.computed();
                }
            } else if def.is_null() {
                prop = prop.nullable();
            }
            builder = builder.property(prop);
        }

        Ok(builder)
    }

    /// Case-insensitive property lookup by API name.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    #[must_use]
    pub fn navigation(&self, name: &str) -> Option<&Navigation> {
        self.navigations
            .iter()
            .find(|n| n.name.eq_ignore_ascii_case(name))
    }

    /// The key property, captured by [`EntityTypeBuilder::build`].
    #[must_use]
    pub fn key_property(&self) -> &Property {
        &self.key_property
    }
}

#[must_use]
pub struct EntityTypeBuilder {
    name: String,
    set_name: Option<String>,
    table: Option<String>,
    schema: Option<String>,
    key: Option<String>,
    properties: Vec<Property>,
    navigations: Vec<Navigation>,
}

impl EntityTypeBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            set_name: None,
            table: None,
            schema: None,
            key: None,
            properties: Vec::new(),
            navigations: Vec::new(),
        }
    }

    /// Entity set name; defaults to the type name.
    pub fn set_name(mut self, set_name: impl Into<String>) -> Self {
        self.set_name = Some(set_name.into());
        self
    }

    /// Table name; defaults to the type name.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn key(mut self, property: impl Into<String>) -> Self {
        self.key = Some(property.into());
        self
    }

    pub fn property(mut self, property: Property) -> Self {
        self.properties.push(property);
        self
    }

    pub fn navigation(mut self, navigation: Navigation) -> Self {
        self.navigations.push(navigation);
        self
    }

    /// Fill in the schema only when none was declared.
    pub fn default_schema(mut self, schema: Option<&str>) -> Self {
        if self.schema.is_none() {
            self.schema = schema.map(str::to_owned);
        }
        self
    }

    /// # Errors
    /// Missing or unknown key, or a duplicated property/navigation name.
    pub fn build(self) -> Result<EntityType, EntityError> {
        let key = self
            .key
            .ok_or_else(|| EntityError::MissingKey(self.name.clone()))?;

        let mut seen = std::collections::HashSet::new();
        let names = self
            .properties
            .iter()
            .map(|p| &p.name)
            .chain(self.navigations.iter().map(|n| &n.name));
        for name in names {
            if !seen.insert(name.to_ascii_lowercase()) {
                return Err(EntityError::Duplicate {
                    entity: self.name,
                    name: name.clone(),
                });
            }
        }

        let Some(key_prop) = self
            .properties
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(&key))
        else {
            return Err(EntityError::UnknownKey {
                entity: self.name,
                key,
            });
        };
        let key_property = key_prop.clone();

        Ok(EntityType {
            set_name: self.set_name.unwrap_or_else(|| self.name.clone()),
            table: self.table.unwrap_or_else(|| self.name.clone()),
            name: self.name,
            schema: self.schema,
            key: key_property.name.clone(),
            properties: self.properties,
            navigations: self.navigations,
            key_property,
        })
    }
}

/// A navigation with both ends looked up.
#[derive(Clone, Debug)]
pub struct ResolvedNavigation<'a> {
    pub navigation: &'a Navigation,
    pub target: Arc<EntityType>,
    /// Foreign-key property: on the source for to-one, on the target for one-to-many.
    pub foreign_key: Property,
}

/// Read-only lookup of entity types by type name and by entity-set name.
#[derive(Clone, Debug, Default)]
pub struct EntityRegistry {
    types: Vec<Arc<EntityType>>,
    by_name: HashMap<String, usize>,
    by_set: HashMap<String, usize>,
}

impl EntityRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// `EntityError::AlreadyRegistered` when the type or set name is taken.
    pub fn register(&mut self, entity: EntityType) -> Result<Arc<EntityType>, EntityError> {
        let name = entity.name.to_ascii_lowercase();
        let set = entity.set_name.to_ascii_lowercase();
        if self.by_name.contains_key(&name) {
            return Err(EntityError::AlreadyRegistered(entity.name));
        }
        if self.by_set.contains_key(&set) {
            return Err(EntityError::AlreadyRegistered(entity.set_name));
        }

        let idx = self.types.len();
        let entity = Arc::new(entity);
        self.types.push(entity.clone());
        self.by_name.insert(name, idx);
        self.by_set.insert(set, idx);
        Ok(entity)
    }

    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<Arc<EntityType>> {
        self.by_name
            .get(&name.to_ascii_lowercase())
            .map(|&i| self.types[i].clone())
    }

    #[must_use]
    pub fn by_set(&self, set_name: &str) -> Option<Arc<EntityType>> {
        self.by_set
            .get(&set_name.to_ascii_lowercase())
            .map(|&i| self.types[i].clone())
    }

    /// Registered types in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<EntityType>> {
        self.types.iter()
    }

    /// Look up the target type and foreign-key property of a navigation.
    ///
    /// # Errors
    /// `UnresolvedTarget` or `UnknownForeignKey` for misdeclared navigations.
    pub fn resolve<'a>(
        &self,
        source: &EntityType,
        navigation: &'a Navigation,
    ) -> Result<ResolvedNavigation<'a>, EntityError> {
        let target = self
            .by_name(&navigation.target)
            .ok_or_else(|| EntityError::UnresolvedTarget {
                entity: source.name.clone(),
                navigation: navigation.name.clone(),
                target: navigation.target.clone(),
            })?;

        let owner: &EntityType = if navigation.kind.is_collection() {
            &target
        } else {
            source
        };
        let foreign_key = owner
            .property(&navigation.foreign_key)
            .cloned()
            .ok_or_else(|| EntityError::UnknownForeignKey {
                entity: source.name.clone(),
                navigation: navigation.name.clone(),
                foreign_key: navigation.foreign_key.clone(),
            })?;

        Ok(ResolvedNavigation {
            navigation,
            target,
            foreign_key,
        })
    }

    /// Resolve every navigation of every type.
    ///
    /// # Errors
    /// The first navigation that cannot be resolved.
    pub fn validate(&self) -> Result<(), EntityError> {
        for entity in &self.types {
            for nav in &entity.navigations {
                self.resolve(entity, nav)?;
            }
        }
        Ok(())
    }
}

fn pascal_case(column: &str) -> String {
    column
        .split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().chain(chars).collect()
            })
        })
        .collect()
}

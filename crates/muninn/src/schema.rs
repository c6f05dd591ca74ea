//! Namespace definitions: ordered, typed field sets.
//!
//! A namespace other than `core` implicitly carries a `uuid` primary key
//! that is also a foreign key to the core table; extensions must not
//! redeclare it. The `core` namespace is fixed at design time.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use crate::error::{Error, Result};
use crate::value::DataType;

/// One field of a namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
    pub optional: bool,
    pub indexed: bool,
}

impl Field {
    pub fn new(name: &str, data_type: DataType) -> Self {
        Field {
            name: name.to_string(),
            data_type,
            optional: false,
            indexed: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }
}

/// A named, ordered set of typed fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Namespace {
    name: String,
    fields: Vec<Field>,
}

/// Lowercase identifier starting with a letter.
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl Namespace {
    pub fn new(name: &str) -> Result<Namespace> {
        if !is_valid_name(name) {
            return Err(Error::Schema(format!(
                "invalid namespace name {:?}: expected a lowercase identifier starting with a letter",
                name
            )));
        }
        Ok(Namespace {
            name: name.to_string(),
            fields: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn push(&mut self, field: Field) -> Result<()> {
        if !is_valid_name(&field.name) {
            return Err(Error::Schema(format!(
                "invalid field name {:?} in namespace {:?}",
                field.name, self.name
            )));
        }
        if self.name != CORE && field.name == "uuid" {
            return Err(Error::Schema(format!(
                "namespace {:?} must not redeclare the implicit 'uuid' field",
                self.name
            )));
        }
        if self.field(&field.name).is_some() {
            return Err(Error::Schema(format!(
                "duplicate field {:?} in namespace {:?}",
                field.name, self.name
            )));
        }
        self.fields.push(field);
        Ok(())
    }

    pub fn with_field(mut self, field: Field) -> Result<Namespace> {
        self.push(field)?;
        Ok(self)
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }
}

pub const CORE: &str = "core";

/// The fixed core namespace.
pub fn core_namespace() -> &'static Namespace {
    static CORE_NAMESPACE: OnceLock<Namespace> = OnceLock::new();
    CORE_NAMESPACE.get_or_init(|| {
        let mut ns = Namespace {
            name: CORE.to_string(),
            fields: Vec::new(),
        };
        let fields = [
            Field::new("uuid", DataType::Uuid),
            Field::new("active", DataType::Boolean).indexed(),
            Field::new("hash", DataType::Text).optional().indexed(),
            Field::new("size", DataType::Long64).optional().indexed(),
            Field::new("metadata_date", DataType::Timestamp).indexed(),
            Field::new("archive_date", DataType::Timestamp)
                .optional()
                .indexed(),
            Field::new("archive_path", DataType::Text).optional(),
            Field::new("product_type", DataType::Text).indexed(),
            Field::new("product_name", DataType::Text).indexed(),
            Field::new("physical_name", DataType::Text).indexed(),
            Field::new("validity_start", DataType::Timestamp)
                .optional()
                .indexed(),
            Field::new("validity_stop", DataType::Timestamp)
                .optional()
                .indexed(),
            Field::new("creation_date", DataType::Timestamp)
                .optional()
                .indexed(),
            Field::new("footprint", DataType::Geometry).optional(),
            Field::new("remote_url", DataType::Text).optional(),
        ];
        for field in fields {
            ns.fields.push(field);
        }
        ns
    })
}

/// Names that cannot be used for extension namespaces.
const RESERVED: [&str; 3] = [CORE, "tag", "link"];

/// The set of registered namespaces, core included, in registration order.
#[derive(Clone, Debug)]
pub struct SchemaSet {
    order: Vec<String>,
    namespaces: BTreeMap<String, Arc<Namespace>>,
}

impl Default for SchemaSet {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaSet {
    pub fn new() -> SchemaSet {
        let core = Arc::new(core_namespace().clone());
        SchemaSet {
            order: vec![CORE.to_string()],
            namespaces: BTreeMap::from([(CORE.to_string(), core)]),
        }
    }

    pub fn register(&mut self, namespace: Namespace) -> Result<()> {
        let name = namespace.name().to_string();
        if RESERVED.contains(&name.as_str()) {
            return Err(Error::Schema(format!(
                "namespace name {:?} is reserved",
                name
            )));
        }
        if self.namespaces.contains_key(&name) {
            return Err(Error::Schema(format!(
                "namespace {:?} is already registered",
                name
            )));
        }
        self.order.push(name.clone());
        self.namespaces.insert(name, Arc::new(namespace));
        Ok(())
    }

    pub fn namespace(&self, name: &str) -> Option<&Arc<Namespace>> {
        self.namespaces.get(name)
    }

    /// Namespaces in registration order, core first.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Namespace>> {
        self.order.iter().filter_map(|name| self.namespaces.get(name))
    }

    /// Extension namespaces only, in registration order.
    pub fn extensions(&self) -> impl Iterator<Item = &Arc<Namespace>> {
        self.iter().filter(|ns| ns.name() != CORE)
    }

    /// Resolve a `(namespace, field)` reference.
    pub fn resolve(&self, namespace: &str, field: &str) -> Result<&Field> {
        let ns = self.namespace(namespace).ok_or_else(|| {
            Error::Schema(format!("undefined namespace {:?}", namespace))
        })?;
        if namespace != CORE && field == "uuid" {
            // The implicit key is addressable even though extensions
            // cannot declare it.
            static UUID_FIELD: OnceLock<Field> = OnceLock::new();
            return Ok(UUID_FIELD.get_or_init(|| Field::new("uuid", DataType::Uuid)));
        }
        ns.field(field).ok_or_else(|| {
            Error::Schema(format!(
                "namespace {:?} has no field {:?}",
                namespace, field
            ))
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn core_shape() {
        let core = core_namespace();
        assert_eq!(core.name(), "core");
        assert_eq!(core.fields().len(), 15);
        assert!(!core.field("uuid").unwrap().optional);
        assert!(core.field("archive_path").unwrap().optional);
        assert!(core.field("product_type").unwrap().indexed);
        assert_eq!(
            core.field("footprint").unwrap().data_type,
            DataType::Geometry
        );
    }

    #[test]
    fn name_validation() {
        assert!(is_valid_name("mynamespace"));
        assert!(is_valid_name("a2_b"));
        assert!(!is_valid_name("2abc"));
        assert!(!is_valid_name("Upper"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("has-dash"));
    }

    #[test]
    fn uuid_redeclaration_rejected() {
        let ns = Namespace::new("mynamespace").unwrap();
        let err = ns
            .with_field(Field::new("uuid", DataType::Uuid))
            .unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn registration() {
        let mut set = SchemaSet::new();
        let ns = Namespace::new("mynamespace")
            .unwrap()
            .with_field(Field::new("myfield", DataType::Text).indexed())
            .unwrap();
        set.register(ns).unwrap();

        assert!(set.resolve("mynamespace", "myfield").is_ok());
        assert!(set.resolve("mynamespace", "uuid").is_ok());
        assert!(set.resolve("mynamespace", "other").is_err());
        assert!(set.resolve("other", "myfield").is_err());

        // Duplicate and reserved names are rejected.
        let dup = Namespace::new("mynamespace").unwrap();
        assert!(set.register(dup).is_err());
        let tag = Namespace::new("tag").unwrap();
        assert!(set.register(tag).is_err());
    }
}

//! The nested, namespaced property container carried through every
//! catalogue operation.
//!
//! A container maps namespace name → field name → value. Both levels admit
//! a null sentinel: a `None` namespace marks the whole namespace for
//! removal during an update, a `None` field clears that single field.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::schema::{SchemaSet, CORE};
use crate::value::Value;

type FieldMap = BTreeMap<String, Option<Value>>;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Properties {
    namespaces: BTreeMap<String, Option<FieldMap>>,
}

impl Properties {
    pub fn new() -> Properties {
        Properties::default()
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }

    /// Set a field value.
    pub fn set(&mut self, namespace: &str, field: &str, value: Value) {
        self.namespaces
            .entry(namespace.to_string())
            .or_insert_with(|| Some(FieldMap::new()))
            .get_or_insert_with(FieldMap::new)
            .insert(field.to_string(), Some(value));
    }

    /// Mark a single field as cleared (null sentinel).
    pub fn clear_field(&mut self, namespace: &str, field: &str) {
        self.namespaces
            .entry(namespace.to_string())
            .or_insert_with(|| Some(FieldMap::new()))
            .get_or_insert_with(FieldMap::new)
            .insert(field.to_string(), None);
    }

    /// Mark a whole namespace as removed (null sentinel).
    pub fn clear_namespace(&mut self, namespace: &str) {
        self.namespaces.insert(namespace.to_string(), None);
    }

    pub fn get(&self, namespace: &str, field: &str) -> Option<&Value> {
        self.namespaces
            .get(namespace)?
            .as_ref()?
            .get(field)?
            .as_ref()
    }

    /// Whether the namespace is present with a concrete field map.
    pub fn is_defined(&self, namespace: &str) -> bool {
        matches!(self.namespaces.get(namespace), Some(Some(_)))
    }

    /// Whether the namespace carries the removal sentinel.
    pub fn is_cleared(&self, namespace: &str) -> bool {
        matches!(self.namespaces.get(namespace), Some(None))
    }

    /// Namespace names present in the container, sentinels included.
    pub fn namespace_names(&self) -> impl Iterator<Item = &str> {
        self.namespaces.keys().map(|s| s.as_str())
    }

    /// `(namespace, fields)` pairs for namespaces with a concrete map.
    pub fn defined(&self) -> impl Iterator<Item = (&str, &FieldMap)> {
        self.namespaces
            .iter()
            .filter_map(|(name, fields)| Some((name.as_str(), fields.as_ref()?)))
    }

    pub fn fields(&self, namespace: &str) -> Option<&FieldMap> {
        self.namespaces.get(namespace)?.as_ref()
    }

    pub fn remove_namespace(&mut self, namespace: &str) {
        self.namespaces.remove(namespace);
    }

    /// Deep merge of `other` into `self`. Namespace sentinels remove the
    /// namespace; field sentinels remove the field.
    pub fn merge(&mut self, other: &Properties) {
        for (name, fields) in &other.namespaces {
            match fields {
                None => {
                    self.namespaces.remove(name);
                }
                Some(fields) => {
                    let target = self
                        .namespaces
                        .entry(name.clone())
                        .or_insert_with(|| Some(FieldMap::new()))
                        .get_or_insert_with(FieldMap::new);
                    for (field, value) in fields {
                        match value {
                            None => {
                                target.remove(field);
                            }
                            Some(value) => {
                                target.insert(field.clone(), Some(value.clone()));
                            }
                        }
                    }
                }
            }
        }
    }

    /// Shallow diff: the fields of `self` that are new or changed relative
    /// to `base`, plus sentinels for fields and namespaces of `base` that
    /// `self` no longer carries.
    pub fn diff(&self, base: &Properties) -> Properties {
        let mut out = Properties::new();
        for (name, fields) in self.defined() {
            for (field, value) in fields {
                let value = match value {
                    Some(v) => v,
                    None => continue,
                };
                if base.get(name, field) != Some(value) {
                    out.set(name, field, value.clone());
                }
            }
        }
        for (name, fields) in base.defined() {
            match self.namespaces.get(name) {
                None | Some(None) => out.clear_namespace(name),
                Some(Some(_)) => {
                    for field in fields.keys() {
                        let present = self
                            .fields(name)
                            .map(|f| f.get(field).map(|v| v.is_some()).unwrap_or(false))
                            .unwrap_or(false);
                        if !present {
                            out.clear_field(name, field);
                        }
                    }
                }
            }
        }
        out
    }

    /// Keep only the listed namespaces.
    pub fn project(&self, namespaces: &[String]) -> Properties {
        Properties {
            namespaces: self
                .namespaces
                .iter()
                .filter(|(name, _)| namespaces.iter().any(|n| n == *name))
                .map(|(name, fields)| (name.clone(), fields.clone()))
                .collect(),
        }
    }

    /// Keep only the listed dotted fields (`ns.field`, or `field` meaning
    /// `core.field`).
    pub fn project_fields(&self, fields: &[String]) -> Properties {
        let mut out = Properties::new();
        for dotted in fields {
            let (namespace, field) = split_reference(dotted);
            if let Some(value) = self.get(namespace, field) {
                out.set(namespace, field, value.clone());
            }
        }
        out
    }

    /// Validate against the schema. With `partial` set, required fields may
    /// be absent (used for update diffs); types must match either way.
    pub fn validate(&self, schema: &SchemaSet, partial: bool) -> Result<()> {
        for (name, fields) in &self.namespaces {
            let namespace = schema
                .namespace(name)
                .ok_or_else(|| Error::Schema(format!("undefined namespace {:?}", name)))?;
            let fields = match fields {
                Some(fields) => fields,
                None => continue,
            };
            for (field, value) in fields {
                let definition = schema.resolve(name, field)?;
                if let Some(value) = value {
                    let actual = value.data_type();
                    if actual != definition.data_type && actual.widen(definition.data_type).is_none()
                    {
                        return Err(Error::Schema(format!(
                            "field {}.{} expects {}, got {}",
                            name, field, definition.data_type, actual
                        )));
                    }
                } else if !definition.optional && !partial {
                    return Err(Error::Schema(format!(
                        "required field {}.{} may not be null",
                        name, field
                    )));
                }
            }
            if !partial {
                for definition in namespace.fields() {
                    if !definition.optional && self.get(name, &definition.name).is_none() {
                        return Err(Error::Schema(format!(
                            "missing required field {}.{}",
                            name, definition.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Render to a JSON object: `{namespace: {field: value}}`; cleared
    /// namespaces and fields render as JSON null.
    pub fn to_json(&self) -> serde_json::Value {
        let mut doc = serde_json::Map::new();
        for (name, fields) in &self.namespaces {
            let entry = match fields {
                None => serde_json::Value::Null,
                Some(fields) => {
                    let mut map = serde_json::Map::new();
                    for (field, value) in fields {
                        map.insert(
                            field.clone(),
                            value
                                .as_ref()
                                .map(Value::to_json)
                                .unwrap_or(serde_json::Value::Null),
                        );
                    }
                    serde_json::Value::Object(map)
                }
            };
            doc.insert(name.clone(), entry);
        }
        serde_json::Value::Object(doc)
    }

    // Typed accessors for hot core fields.

    pub fn uuid(&self) -> Option<Uuid> {
        self.get(CORE, "uuid").and_then(Value::as_uuid)
    }

    pub fn require_uuid(&self) -> Result<Uuid> {
        self.uuid()
            .ok_or_else(|| Error::Schema("product properties carry no core.uuid".into()))
    }

    pub fn active(&self) -> bool {
        self.get(CORE, "active")
            .and_then(Value::as_boolean)
            .unwrap_or(false)
    }

    pub fn product_type(&self) -> Option<&str> {
        self.get(CORE, "product_type").and_then(Value::as_text)
    }

    pub fn product_name(&self) -> Option<&str> {
        self.get(CORE, "product_name").and_then(Value::as_text)
    }

    pub fn physical_name(&self) -> Option<&str> {
        self.get(CORE, "physical_name").and_then(Value::as_text)
    }

    pub fn archive_path(&self) -> Option<&str> {
        self.get(CORE, "archive_path").and_then(Value::as_text)
    }

    pub fn remote_url(&self) -> Option<&str> {
        self.get(CORE, "remote_url").and_then(Value::as_text)
    }

    pub fn size(&self) -> Option<i64> {
        self.get(CORE, "size").and_then(Value::as_long)
    }

    pub fn hash(&self) -> Option<&str> {
        self.get(CORE, "hash").and_then(Value::as_text)
    }

    pub fn metadata_date(&self) -> Option<NaiveDateTime> {
        self.get(CORE, "metadata_date").and_then(Value::as_timestamp)
    }

    pub fn set_core(&mut self, field: &str, value: Value) {
        self.set(CORE, field, value);
    }
}

/// Split a dotted reference into `(namespace, field)`; a bare name is a
/// core field.
pub fn split_reference(dotted: &str) -> (&str, &str) {
    match dotted.split_once('.') {
        Some((namespace, field)) => (namespace, field),
        None => (CORE, dotted),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::schema::{Field, Namespace};
    use crate::value::DataType;

    fn sample() -> Properties {
        let mut props = Properties::new();
        props.set_core("product_type", Value::Text("ABC".into()));
        props.set_core("product_name", Value::Text("alpha.dat".into()));
        props.set("mynamespace", "myfield", Value::Integer32(7));
        props
    }

    #[test]
    fn get_set() {
        let props = sample();
        assert_eq!(props.product_type(), Some("ABC"));
        assert_eq!(
            props.get("mynamespace", "myfield"),
            Some(&Value::Integer32(7))
        );
        assert!(props.is_defined("mynamespace"));
        assert!(!props.is_defined("other"));
    }

    #[test]
    fn merge_applies_sentinels() {
        let mut props = sample();

        let mut update = Properties::new();
        update.set("mynamespace", "myfield", Value::Integer32(8));
        props.merge(&update);
        assert_eq!(
            props.get("mynamespace", "myfield"),
            Some(&Value::Integer32(8))
        );

        let mut removal = Properties::new();
        removal.clear_namespace("mynamespace");
        props.merge(&removal);
        assert!(!props.is_defined("mynamespace"));

        let mut field_removal = Properties::new();
        field_removal.clear_field(CORE, "product_name");
        props.merge(&field_removal);
        assert_eq!(props.product_name(), None);
        assert_eq!(props.product_type(), Some("ABC"));
    }

    #[test]
    fn diff_reports_changes_and_removals() {
        let base = sample();

        let mut updated = base.clone();
        updated.set_core("product_name", Value::Text("beta.dat".into()));
        let diff = updated.diff(&base);
        assert_eq!(
            diff.get(CORE, "product_name"),
            Some(&Value::Text("beta.dat".into()))
        );
        assert_eq!(diff.get(CORE, "product_type"), None);
        assert!(!diff.is_defined("mynamespace"));

        let mut stripped = base.clone();
        stripped.remove_namespace("mynamespace");
        let diff = stripped.diff(&base);
        assert!(diff.is_cleared("mynamespace"));
    }

    #[test]
    fn renders_to_json() {
        let props = sample();
        insta::assert_snapshot!(
            props.to_json().to_string(),
            @r###"{"core":{"product_name":"alpha.dat","product_type":"ABC"},"mynamespace":{"myfield":7}}"###
        );
    }

    #[test]
    fn projection() {
        let props = sample();
        let core_only = props.project(&[CORE.to_string()]);
        assert!(core_only.is_defined(CORE));
        assert!(!core_only.is_defined("mynamespace"));

        let fields = props.project_fields(&[
            "product_type".to_string(),
            "mynamespace.myfield".to_string(),
        ]);
        assert_eq!(fields.product_type(), Some("ABC"));
        assert_eq!(fields.product_name(), None);
        assert_eq!(
            fields.get("mynamespace", "myfield"),
            Some(&Value::Integer32(7))
        );
    }

    #[test]
    fn validation() {
        let mut schema = SchemaSet::new();
        schema
            .register(
                Namespace::new("mynamespace")
                    .unwrap()
                    .with_field(Field::new("myfield", DataType::Integer32))
                    .unwrap(),
            )
            .unwrap();

        let props = sample();
        // Partial validation checks types only.
        props.validate(&schema, true).unwrap();

        let mut bad = Properties::new();
        bad.set("mynamespace", "myfield", Value::Text("seven".into()));
        assert!(matches!(
            bad.validate(&schema, true),
            Err(Error::Schema(_))
        ));

        let mut unknown = Properties::new();
        unknown.set("nowhere", "field", Value::Integer32(0));
        assert!(unknown.validate(&schema, true).is_err());

        // Full validation requires mandatory fields.
        assert!(props.validate(&schema, false).is_err());
    }
}

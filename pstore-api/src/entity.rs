/// Entity <-> record conversion
///
/// Entities are plain serde types. They travel through `serde_json` into an
/// `Item` keyed by logical field names; each backend maps those names to its
/// own columns or document keys using the injected `EntitySchema`.

use pstore_core::{item_from_json, item_to_json, EntitySchema, Error, IdStrategy, Item, Result, Value};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub(crate) struct EntityMapper<'s> {
    schema: &'s EntitySchema,
}

impl<'s> EntityMapper<'s> {
    pub fn new(schema: &'s EntitySchema) -> Self {
        Self { schema }
    }

    pub fn to_item<E: Serialize>(&self, entity: &E) -> Result<Item> {
        let json = serde_json::to_value(entity)?;
        if !json.is_object() {
            return Err(Error::serialization(format!(
                "entity for '{}' must serialize to an object",
                self.schema.name
            )));
        }
        Ok(item_from_json(&json))
    }

    pub fn from_item<E: DeserializeOwned>(&self, item: &Item) -> Result<E> {
        Ok(serde_json::from_value(item_to_json(item))?)
    }

    /// The entity's id, or `None` when it is missing or null
    pub fn id_of(&self, item: &Item) -> Option<Value> {
        item.get(&self.schema.primary_key)
            .filter(|v| !v.is_null())
            .cloned()
    }

    /// Id to store for a new record. AutoIncrement leaves it to the engine.
    pub fn prepare_id(&self, item: &mut Item) -> Result<Option<Value>> {
        if let Some(id) = self.id_of(item) {
            self.schema.check_id(&id)?;
            return Ok(Some(id));
        }
        match self.schema.id_strategy {
            IdStrategy::Provided => Err(Error::invalid_argument(format!(
                "'{}' requires a caller-provided '{}'",
                self.schema.name, self.schema.primary_key
            ))),
            IdStrategy::AutoIncrement => {
                item.remove(&self.schema.primary_key);
                Ok(None)
            }
            IdStrategy::Uuid => {
                let id = Value::String(uuid::Uuid::new_v4().to_string());
                item.insert(self.schema.primary_key.clone(), id.clone());
                Ok(Some(id))
            }
        }
    }

    /// Write a generated id back into `entity`
    pub fn assign_id<E: Serialize + DeserializeOwned>(&self, entity: &mut E, id: Value) -> Result<()> {
        let mut item = self.to_item(entity)?;
        item.insert(self.schema.primary_key.clone(), id);
        *entity = self.from_item(&item)?;
        Ok(())
    }

    /// Partial updates may only touch declared, non-key fields
    pub fn check_partial(&self, fields: &Item) -> Result<()> {
        if fields.is_empty() {
            return Err(Error::invalid_argument("partial update needs at least one field"));
        }
        for name in fields.keys() {
            if self.schema.is_primary_key(name) {
                return Err(Error::validation(format!("primary key '{}' cannot be updated", name)));
            }
            if self.schema.get_field(name).is_none() {
                return Err(Error::validation(format!(
                    "'{}' is not a field of '{}'",
                    name, self.schema.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pstore_core::{ErrorKind, FieldDef, FieldKind};
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Note {
        id: Option<String>,
        body: String,
    }

    fn schema() -> EntitySchema {
        EntitySchema::new("notes", "id")
            .id_strategy(IdStrategy::Uuid)
            .field(FieldDef::new("id", FieldKind::Text))
            .field(FieldDef::new("body", FieldKind::Text))
    }

    #[test]
    fn test_uuid_assignment() {
        let schema = schema();
        let mapper = EntityMapper::new(&schema);
        let mut note = Note { id: None, body: "hi".into() };
        let mut item = mapper.to_item(&note).unwrap();
        let id = mapper.prepare_id(&mut item).unwrap().unwrap();
        mapper.assign_id(&mut note, id.clone()).unwrap();
        assert_eq!(note.id.as_deref(), id.as_str());
        assert_eq!(note.id.as_ref().map(String::len), Some(36));
    }

    #[test]
    fn test_partial_update_rules() {
        let schema = schema();
        let mapper = EntityMapper::new(&schema);
        let mut fields = Item::new();
        fields.insert("id".into(), Value::string("x"));
        assert_eq!(mapper.check_partial(&fields).unwrap_err().kind(), ErrorKind::Validation);

        let mut fields = Item::new();
        fields.insert("nope".into(), Value::Int(1));
        assert_eq!(mapper.check_partial(&fields).unwrap_err().kind(), ErrorKind::Validation);

        assert_eq!(mapper.check_partial(&Item::new()).unwrap_err().kind(), ErrorKind::InvalidArgument);
    }
}

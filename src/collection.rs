//! Collection Query Engine
//!
//! A conjunction of `field = value` filters over one model, resolved as the
//! intersection of the matching index sets. Without filters the model's
//! collection set stands for "every instance". A `pk` filter narrows the
//! result to that pk when it exists.

use crate::command::{Command, CommandName};
use crate::error::{Error, Result};
use crate::model::{Instance, Model};
use crate::schema::PK_FIELD;
use crate::types::Value;
use std::collections::BTreeSet;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Collection {
    model: Model,
    index_keys: BTreeSet<String>,
    pks: BTreeSet<String>,
}

impl Collection {
    pub(crate) fn new(model: Model) -> Self {
        Collection {
            model,
            index_keys: BTreeSet::new(),
            pks: BTreeSet::new(),
        }
    }

    /// Add a `field = value` term; checked before any store call
    pub fn filter(mut self, field: &str, value: impl Into<Value>) -> Result<Self> {
        let value = value.into();
        let text = value.to_store_string().ok_or_else(|| {
            Error::InvalidArgument(format!("cannot filter {} on {:?}", field, value))
        })?;

        if field == PK_FIELD {
            self.pks.insert(text);
            return Ok(self);
        }

        let schema = self.model.schema();
        let def = schema.require_field(field)?;
        if !def.indexable {
            return Err(Error::Configuration(format!(
                "Field {} of model {} is not indexable, it cannot be used to filter",
                field,
                schema.full_name()
            )));
        }
        let key = schema.index_key(def, &text);
        self.index_keys.insert(key);
        Ok(self)
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    fn run(&self, command: Command) -> Result<Value> {
        self.model.database().run_command(command)
    }

    /// The single pk filter, `Ok(None)` when the filter can't match anything
    fn pk_filter(&self) -> Result<Option<Option<String>>> {
        match self.pks.len() {
            0 => Ok(Some(None)),
            1 => {
                let pk = self.pks.iter().next().cloned().unwrap_or_default();
                if self.model.pk_exists(&pk)? {
                    Ok(Some(Some(pk)))
                } else {
                    Ok(None)
                }
            }
            // two different pks can't both match
            _ => Ok(None),
        }
    }

    fn set_keys(&self) -> Vec<Value> {
        if self.index_keys.is_empty() {
            vec![Value::Str(self.model.schema().collection_key())]
        } else {
            self.index_keys.iter().cloned().map(Value::Str).collect()
        }
    }

    /// Matching pks
    pub fn pks(&self) -> Result<Vec<String>> {
        let pk = match self.pk_filter()? {
            Some(pk) => pk,
            None => return Ok(Vec::new()),
        };

        if let (Some(pk), true) = (&pk, self.index_keys.is_empty()) {
            return Ok(vec![pk.clone()]);
        }

        let keys = self.set_keys();
        debug!(model = %self.model.name(), sets = keys.len(), "collection query");
        let command = if keys.len() == 1 {
            Command::new(CommandName::SMembers, keys)
        } else {
            Command::new(CommandName::SInter, keys)
        };
        let mut members = self.run(command)?.into_strings();
        if let Some(pk) = pk {
            members.retain(|member| *member == pk);
        }
        Ok(members)
    }

    /// Number of matching instances; a single set is counted by the store
    pub fn len(&self) -> Result<usize> {
        if self.pks.is_empty() && self.index_keys.len() <= 1 {
            let count = self.run(Command::new(CommandName::SCard, self.set_keys()))?;
            return Ok(count.as_i64().unwrap_or(0).max(0) as usize);
        }
        Ok(self.pks()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn instances(&self) -> Result<Vec<Instance>> {
        Ok(self
            .pks()?
            .iter()
            .map(|pk| self.model.lazy_connect(pk))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionSettings, DatabaseConfig};
    use crate::database::Database;
    use crate::schema::{FieldDef, ModelSchema};

    fn fruits(db: u32) -> Model {
        let database =
            Database::open(DatabaseConfig::new(ConnectionSettings::new("collection-tests", 0, db)))
                .unwrap();
        database
            .register(
                ModelSchema::new("fruit")
                    .namespace("shop")
                    .field(FieldDef::string("color").indexable())
                    .field(FieldDef::instance_hash("shape").indexable())
                    .field(FieldDef::string("taste")),
            )
            .unwrap()
    }

    #[test]
    fn test_filter_on_non_indexable_field() {
        let model = fruits(1);
        let err = model.collection().filter("taste", "sweet").unwrap_err();
        assert!(err.is_configuration());
        assert!(model.collection().filter("missing", "x").unwrap_err().is_configuration());
    }

    #[test]
    fn test_intersection() {
        let model = fruits(2);
        model.create(&[("color", "red".into()), ("shape", "round".into())]).unwrap();
        model.create(&[("color", "red".into()), ("shape", "long".into())]).unwrap();
        model.create(&[("color", "yellow".into()), ("shape", "long".into())]).unwrap();

        let red = model.filter(&[("color", "red".into())]).unwrap();
        assert_eq!(red.pks().unwrap(), vec!["1", "2"]);
        assert_eq!(red.len().unwrap(), 2);

        let red_long = red.filter("shape", "long").unwrap();
        assert_eq!(red_long.pks().unwrap(), vec!["2"]);
        assert_eq!(red_long.len().unwrap(), 1);

        assert_eq!(model.collection().len().unwrap(), 3);
        assert!(model.filter(&[("color", "blue".into())]).unwrap().is_empty().unwrap());
    }

    #[test]
    fn test_pk_filter() {
        let model = fruits(3);
        model.create(&[("color", "red".into())]).unwrap();
        model.create(&[("color", "green".into())]).unwrap();

        let by_pk = model.collection().filter("pk", "2").unwrap();
        assert_eq!(by_pk.pks().unwrap(), vec!["2"]);
        assert!(model.collection().filter("pk", "9").unwrap().pks().unwrap().is_empty());
        assert!(by_pk.clone().filter("color", "red").unwrap().pks().unwrap().is_empty());
        assert_eq!(by_pk.clone().filter("color", "green").unwrap().len().unwrap(), 1);
        assert!(by_pk.filter("pk", "1").unwrap().pks().unwrap().is_empty());
    }

    #[test]
    fn test_instances() {
        let model = fruits(4);
        model.create(&[("color", "red".into())]).unwrap();
        let found = model.filter(&[("color", "red".into())]).unwrap().instances().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].field("color").unwrap().get().unwrap(), Value::from("red"));
    }
}

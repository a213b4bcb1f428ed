//! Models and instances
//!
//! A `Model` is a validated schema bound to a `Database`. An `Instance` is
//! one pk of a model; it hands out `FieldProxy`s and owns their caches.

use crate::cache::FieldCache;
use crate::collection::Collection;
use crate::command::{Command, CommandName};
use crate::database::Database;
use crate::error::{Error, Result};
use crate::field::FieldProxy;
use crate::schema::{FieldKind, ModelSchema, PkKind, PK_FIELD};
use crate::types::Value;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct Model {
    database: Arc<Database>,
    schema: Arc<ModelSchema>,
}

impl Model {
    pub(crate) fn bind(database: Arc<Database>, schema: Arc<ModelSchema>) -> Self {
        Model { database, schema }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    pub fn schema(&self) -> &ModelSchema {
        &self.schema
    }

    pub fn name(&self) -> String {
        self.schema.full_name()
    }

    fn run(&self, command: Command) -> Result<Value> {
        self.database.run_command(command)
    }

    /// Create an instance; `pk` must be among `values` for explicit-pk models
    pub fn create(&self, values: &[(&str, Value)]) -> Result<Instance> {
        let mut explicit_pk = None;
        for (name, value) in values {
            if *name == PK_FIELD {
                explicit_pk = Some(value.to_store_string().ok_or_else(|| {
                    Error::InvalidArgument(format!("invalid pk {:?}", value))
                })?);
            } else {
                self.schema.require_field(name)?;
            }
        }

        // Refuse a taken unique value before anything is written
        for (name, value) in values {
            let field = match self.schema.get_field(name) {
                Some(field) if field.unique => field,
                _ => continue,
            };
            if let Some(text) = value.to_store_string() {
                let key = self.schema.index_key(field, &text);
                let owners = self
                    .run(Command::new(CommandName::SMembers, vec![Value::Str(key.clone())]))?
                    .into_strings();
                if let Some(owner) = owners.into_iter().next() {
                    return Err(Error::Uniqueness { key, owner });
                }
            }
        }

        let pk = self.allocate_pk(explicit_pk)?;
        let instance = Instance::new(self.clone(), pk);
        debug!(model = %self.name(), pk = %instance.pk(), "instance created");

        if let Err(e) = self.populate(&instance, values) {
            if let Err(cleanup) = instance.delete() {
                warn!(model = %self.name(), pk = %instance.pk(), error = %cleanup, "cleanup after failed create");
            }
            return Err(e);
        }
        Ok(instance)
    }

    fn allocate_pk(&self, explicit: Option<String>) -> Result<String> {
        let collection = Value::Str(self.schema.collection_key());
        let pk = match (self.schema.pk, explicit) {
            (PkKind::Auto, Some(_)) => {
                return Err(Error::InvalidArgument(format!(
                    "pk of model {} is auto-generated",
                    self.name()
                )))
            }
            (PkKind::Explicit, None) => {
                return Err(Error::InvalidArgument(format!(
                    "model {} needs an explicit pk",
                    self.name()
                )))
            }
            (PkKind::Auto, None) => {
                let next = self.run(Command::new(
                    CommandName::Incr,
                    vec![Value::Str(self.schema.max_pk_key())],
                ))?;
                next.to_store_string()
                    .ok_or_else(|| Error::Store(format!("unexpected pk counter reply {:?}", next)))?
            }
            (PkKind::Explicit, Some(pk)) => pk,
        };

        // SADD reporting 0 means the pk is already taken
        let added = self.run(Command::new(
            CommandName::SAdd,
            vec![collection.clone(), Value::Str(pk.clone())],
        ))?;
        if !added.is_truthy() {
            return Err(Error::Uniqueness {
                key: self.schema.collection_key(),
                owner: pk,
            });
        }
        Ok(pk)
    }

    fn populate(&self, instance: &Instance, values: &[(&str, Value)]) -> Result<()> {
        for (name, value) in values {
            if *name != PK_FIELD {
                instance.field(name)?.assign(value.clone())?;
            }
        }
        for field in &self.schema.fields {
            let given = values.iter().any(|(name, _)| *name == field.name);
            if let (false, Some(default)) = (given, &field.default) {
                instance.field(&field.name)?.assign(default.clone())?;
            }
        }
        Ok(())
    }

    pub fn pk_exists(&self, pk: &str) -> Result<bool> {
        Ok(self
            .run(Command::new(
                CommandName::SIsMember,
                vec![Value::Str(self.schema.collection_key()), Value::from(pk)],
            ))?
            .is_truthy())
    }

    /// Existing instance, or `DoesNotExist`
    pub fn get_by_pk(&self, pk: &str) -> Result<Instance> {
        if !self.pk_exists(pk)? {
            return Err(Error::DoesNotExist(format!(
                "No {} found with pk {}",
                self.name(),
                pk
            )));
        }
        Ok(Instance::new(self.clone(), pk.to_string()))
    }

    /// Instance handle without checking the pk exists
    pub fn lazy_connect(&self, pk: &str) -> Instance {
        Instance::new(self.clone(), pk.to_string())
    }

    /// Every instance
    pub fn collection(&self) -> Collection {
        Collection::new(self.clone())
    }

    pub fn filter(&self, filters: &[(&str, Value)]) -> Result<Collection> {
        filters
            .iter()
            .try_fold(self.collection(), |collection, (name, value)| {
                collection.filter(name, value.clone())
            })
    }

    pub fn exists(&self, filters: &[(&str, Value)]) -> Result<bool> {
        if filters.is_empty() {
            return Err(Error::InvalidArgument(
                "exists needs at least one filter".to_string(),
            ));
        }
        Ok(!self.filter(filters)?.is_empty()?)
    }

    /// The one instance matching `filters`
    pub fn get(&self, filters: &[(&str, Value)]) -> Result<Instance> {
        if filters.is_empty() {
            return Err(Error::InvalidArgument(
                "get needs at least one filter".to_string(),
            ));
        }
        let pks = self.filter(filters)?.pks()?;
        match pks.as_slice() {
            [] => Err(Error::DoesNotExist(format!(
                "No {} found matching {:?}",
                self.name(),
                filters
            ))),
            [pk] => Ok(Instance::new(self.clone(), pk.clone())),
            _ => Err(Error::InvalidArgument(format!(
                "{} instances of {} match {:?}",
                pks.len(),
                self.name(),
                filters
            ))),
        }
    }

    /// `(instance, created)`
    pub fn get_or_create(&self, filters: &[(&str, Value)]) -> Result<(Instance, bool)> {
        match self.get(filters) {
            Ok(instance) => Ok((instance, false)),
            Err(Error::DoesNotExist(_)) => Ok((self.create(filters)?, true)),
            Err(e) => Err(e),
        }
    }

    /// Move this model to `database`
    pub fn use_database(&self, database: &Arc<Database>) -> Result<Model> {
        if Arc::ptr_eq(&self.database, database) {
            return Ok(self.clone());
        }
        database.add_model(Arc::clone(&self.schema))?;
        self.database.unregister(&self.name());
        Ok(Model::bind(Arc::clone(database), Arc::clone(&self.schema)))
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.name())
            .field("database", &self.database.id())
            .finish()
    }
}

/// One addressable object of a model
pub struct Instance {
    model: Model,
    pk: String,
    caches: Mutex<HashMap<String, FieldCache>>,
}

impl Instance {
    fn new(model: Model, pk: String) -> Self {
        Instance {
            model,
            pk,
            caches: Mutex::new(HashMap::new()),
        }
    }

    pub fn pk(&self) -> &str {
        &self.pk
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn field(&self, name: &str) -> Result<FieldProxy<'_>> {
        let def = self.model.schema.require_field(name)?;
        Ok(FieldProxy::new(self, def))
    }

    pub(crate) fn with_cache<R>(&self, field: &str, f: impl FnOnce(&mut FieldCache) -> R) -> R {
        let mut caches = self.caches.lock();
        f(caches.entry(field.to_string()).or_default())
    }

    fn hash_fields(&self, names: &[&str]) -> Result<()> {
        for name in names {
            let def = self.model.schema.require_field(name)?;
            if def.kind != FieldKind::InstanceHash {
                return Err(Error::Configuration(format!(
                    "{} is not stored in the instance hash",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Several instance-hash fields in one call
    pub fn hmget(&self, names: &[&str]) -> Result<Vec<Value>> {
        self.hash_fields(names)?;
        let mut args = vec![Value::Str(self.model.schema.hash_key(&self.pk))];
        args.extend(names.iter().map(|n| Value::from(*n)));
        Ok(self
            .model
            .run(Command::new(CommandName::HMGet, args))?
            .into_array())
    }

    /// Set several instance-hash fields; indexable ones go through the index engine
    pub fn hmset(&self, values: &[(&str, Value)]) -> Result<()> {
        let names: Vec<&str> = values.iter().map(|(n, _)| *n).collect();
        self.hash_fields(&names)?;

        let any_indexable = names
            .iter()
            .filter_map(|n| self.model.schema.get_field(n))
            .any(|f| f.indexable);
        if any_indexable {
            for (name, value) in values {
                self.field(name)?.set(value.clone())?;
            }
            return Ok(());
        }

        let mut args = vec![Value::Str(self.model.schema.hash_key(&self.pk))];
        for (name, value) in values {
            args.push(Value::from(*name));
            args.push(value.clone());
        }
        let result = self.model.run(Command::new(CommandName::HMSet, args));
        for name in &names {
            self.with_cache(name, |cache| cache.clear());
        }
        result.map(|_| ())
    }

    /// Deindex and remove every field, the instance hash and the pk
    pub fn delete(&self) -> Result<()> {
        for field in &self.model.schema.fields {
            FieldProxy::new(self, field).delete()?;
        }
        let schema = &self.model.schema;
        self.model.run(Command::new(
            CommandName::Del,
            vec![Value::Str(schema.hash_key(&self.pk))],
        ))?;
        self.model.run(Command::new(
            CommandName::SRem,
            vec![Value::Str(schema.collection_key()), Value::Str(self.pk.clone())],
        ))?;
        debug!(model = %self.model.name(), pk = %self.pk, "instance deleted");
        Ok(())
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("model", &self.model.name())
            .field("pk", &self.pk)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionSettings, DatabaseConfig};
    use crate::schema::FieldDef;

    fn database(db: u32) -> Arc<Database> {
        Database::open(DatabaseConfig::new(ConnectionSettings::new("model-tests", 0, db))).unwrap()
    }

    fn bike(db: &Arc<Database>) -> Model {
        db.register(
            ModelSchema::new("bike")
                .field(FieldDef::string("name").indexable())
                .field(FieldDef::instance_hash("serial").unique())
                .field(FieldDef::string("wheels").default_value(2)),
        )
        .unwrap()
    }

    #[test]
    fn test_auto_pk_and_defaults() {
        let db = database(1);
        let bike = bike(&db);

        let first = bike.create(&[("name", "rosalie".into())]).unwrap();
        let second = bike.create(&[]).unwrap();
        assert_eq!(first.pk(), "1");
        assert_eq!(second.pk(), "2");
        assert_eq!(first.field("wheels").unwrap().get().unwrap(), Value::from("2"));
        assert_eq!(second.field("name").unwrap().get().unwrap(), Value::Nil);
        assert!(bike.get_by_pk("3").unwrap_err().is_does_not_exist());
    }

    #[test]
    fn test_explicit_pk() {
        let db = database(2);
        let user = db
            .register(ModelSchema::new("user").pk(PkKind::Explicit).field(FieldDef::string("email")))
            .unwrap();

        let alice = user.create(&[("pk", "alice".into())]).unwrap();
        assert_eq!(alice.pk(), "alice");
        assert!(user.create(&[("pk", "alice".into())]).unwrap_err().is_uniqueness());
        assert!(user.create(&[]).is_err());
    }

    #[test]
    fn test_create_refuses_taken_unique_value() {
        let db = database(3);
        let bike = bike(&db);
        bike.create(&[("serial", "SN1".into())]).unwrap();

        let err = bike
            .create(&[("name", "other".into()), ("serial", "SN1".into())])
            .unwrap_err();
        assert!(err.is_uniqueness());
        // nothing was written, not even the pk
        assert_eq!(bike.collection().pks().unwrap(), vec!["1"]);
        assert!(bike.filter(&[("name", "other".into())]).unwrap().pks().unwrap().is_empty());
    }

    #[test]
    fn test_get_and_get_or_create() {
        let db = database(4);
        let bike = bike(&db);
        bike.create(&[("name", "twin".into())]).unwrap();
        bike.create(&[("name", "twin".into())]).unwrap();

        assert!(matches!(
            bike.get(&[("name", "twin".into())]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(bike.get(&[("name", "none".into())]).unwrap_err().is_does_not_exist());

        let (solo, created) = bike.get_or_create(&[("name", "solo".into())]).unwrap();
        assert!(created);
        let (again, created) = bike.get_or_create(&[("name", "solo".into())]).unwrap();
        assert!(!created);
        assert_eq!(solo.pk(), again.pk());
        assert!(bike.exists(&[("name", "solo".into())]).unwrap());
        assert!(bike.exists(&[]).is_err());
    }

    #[test]
    fn test_delete_removes_everything() {
        let db = database(5);
        let bike = bike(&db);
        let instance = bike
            .create(&[("name", "gone".into()), ("serial", "SN9".into())])
            .unwrap();
        instance.delete().unwrap();

        assert!(!bike.pk_exists(instance.pk()).unwrap());
        assert!(bike.filter(&[("name", "gone".into())]).unwrap().pks().unwrap().is_empty());
        // the unique value is free again
        assert!(bike.create(&[("serial", "SN9".into())]).is_ok());
    }

    #[test]
    fn test_hmget_hmset() {
        let db = database(6);
        let person = db
            .register(
                ModelSchema::new("person")
                    .field(FieldDef::instance_hash("first"))
                    .field(FieldDef::instance_hash("last").indexable())
                    .field(FieldDef::string("bio")),
            )
            .unwrap();
        let p = person.create(&[]).unwrap();

        p.hmset(&[("first", "Ada".into()), ("last", "Lovelace".into())]).unwrap();
        assert_eq!(
            p.hmget(&["first", "last"]).unwrap(),
            vec![Value::from("Ada"), Value::from("Lovelace")]
        );
        assert_eq!(
            person.filter(&[("last", "Lovelace".into())]).unwrap().pks().unwrap(),
            vec![p.pk().to_string()]
        );
        assert!(p.hmget(&["bio"]).unwrap_err().is_configuration());
    }

    #[test]
    fn test_use_database() {
        let first = database(7);
        let second = database(8);
        let bike = bike(&first);

        let moved = bike.use_database(&second).unwrap();
        assert!(first.model("bike").is_none());
        assert!(second.model("bike").is_some());
        moved.create(&[("name", "moved".into())]).unwrap();
        assert_eq!(moved.collection().len().unwrap(), 1);
    }
}

//! Restricting node config fields to a dynamically registered schema
//!
//! Node driver configs carry whatever fields the driver's schema declares,
//! plus object plumbing. Before a config is embedded in a machine template it
//! is pruned to the fields the `DynamicSchema` named after its kind declares.

use async_trait::async_trait;
use kube::{Api, Client};
use serde_json::{Map, Value};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::{DynamicSchema, DynamicSchemaSpec};
use crate::Result;

/// Lookup of dynamic schemas by name
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SchemaLookup: Send + Sync {
    /// The schema called `name`, or `None` if there is none
    async fn get(&self, name: &str) -> Result<Option<DynamicSchemaSpec>>;
}

/// Remove every key of `fields` that the schema for `kind` does not declare
///
/// The schema is looked up by the lowercased kind. A missing schema leaves
/// `fields` untouched; any other lookup failure is returned.
pub async fn prune(
    kind: &str,
    fields: &mut Map<String, Value>,
    schemas: &dyn SchemaLookup,
) -> Result<()> {
    let name = kind.to_lowercase();
    let Some(schema) = schemas.get(&name).await? else {
        debug!(schema = %name, "no dynamic schema, keeping all fields");
        return Ok(());
    };

    fields.retain(|key, _| schema.resource_fields.contains_key(key));
    Ok(())
}

/// [`SchemaLookup`] reading `DynamicSchema` objects from the API server
pub struct KubeSchemaLookup {
    client: Client,
}

impl KubeSchemaLookup {
    /// Create a new KubeSchemaLookup
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SchemaLookup for KubeSchemaLookup {
    async fn get(&self, name: &str) -> Result<Option<DynamicSchemaSpec>> {
        let api: Api<DynamicSchema> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.map(|schema| schema.spec))
    }
}

use cairn_core::{ObjectKey, Result};
use cairn_graph::Graph;
use uuid::Uuid;

use crate::objects;
use crate::{TransformContext, Transformer};

/// Derives the connection-credential Secret shared by all components.
/// An existing password is carried over so repeated cycles stay stable.
pub struct CredentialTransformer;

pub(crate) fn credential_key(ctx: &TransformContext) -> ObjectKey {
    let c = ctx.cluster();
    ObjectKey::namespaced("Secret", c.namespace(), &objects::credential_secret_name(c.name()))
}

impl Transformer for CredentialTransformer {
    fn name(&self) -> &'static str { "credential" }

    fn transform(&self, ctx: &mut TransformContext, dag: &mut Graph) -> Result<()> {
        if ctx.cluster().is_deleting() {
            return Ok(());
        }
        let key = credential_key(ctx);
        let password = ctx
            .observed()
            .get(&key)
            .and_then(objects::observed_password)
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let secret = objects::credential_secret(ctx.cluster(), &password);
        dag.add_or_update_node(key, Some(objects::to_json(&secret)?));
        Ok(())
    }
}

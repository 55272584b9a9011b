use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::capability::DatabaseQuery;
use crate::graph::{Node, NodeKind};
use crate::node::{NodeContext, NodeError, NodeExecutor, NodeInput};

use super::{config, required};

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseQueryConfig {
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub parameters: Vec<Value>,
}

pub struct DatabaseQueryNode;

#[async_trait]
impl NodeExecutor for DatabaseQueryNode {
    fn kind(&self) -> NodeKind {
        NodeKind::DatabaseQuery
    }

    #[tracing::instrument(name = "database_query_node", skip_all, fields(node_id = %node.id))]
    async fn run(&self, node: &Node, input: &NodeInput, ctx: &mut NodeContext) -> Result<Value, NodeError> {
        let cfg: DatabaseQueryConfig = config(node)?;
        let context = input.context();

        let query = DatabaseQuery {
            connection_id: required(&cfg.connection_id, "connectionId")?.to_string(),
            query: ctx.render(required(&cfg.query, "query")?, &context)?,
            parameters: cfg
                .parameters
                .iter()
                .map(|p| ctx.render_value(p, &context))
                .collect::<Result<_, _>>()?,
        };

        ctx.check_cancelled()?;
        let database = ctx.capabilities().database.clone();
        let result = database.query(query).await?;

        Ok(json!({
            "rowCount": result.row_count,
            "rows": result.rows,
            "fields": result.fields,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::capability::{Capabilities, CapabilityResult, DatabaseClient, QueryResult};
    use crate::environment::Environment;
    use crate::nodes::testing::{context, context_with};
    use crate::result::StandardResult;

    #[derive(Default)]
    struct FakeDb {
        seen: Mutex<Option<DatabaseQuery>>,
    }

    #[async_trait]
    impl DatabaseClient for FakeDb {
        async fn query(&self, query: DatabaseQuery) -> CapabilityResult<QueryResult> {
            *self.seen.lock().unwrap() = Some(query);
            Ok(QueryResult {
                row_count: 1,
                rows: vec![json!({"id": 1})],
                fields: vec![json!({"name": "id"})],
            })
        }
    }

    #[tokio::test]
    async fn test_templated_query() {
        let db = Arc::new(FakeDb::default());
        let caps = Capabilities::headless(Duration::from_secs(1)).with_database(db.clone());
        let mut ctx = context_with(caps, Environment::new().with_variable("TABLE", json!("users")));
        let node = Node::new(
            "q",
            NodeKind::DatabaseQuery,
            json!({"connectionId": "pg", "query": "select * from {{$TABLE}} where id = $1", "parameters": ["{{src.response.id}}"]}),
        );
        let input = NodeInput::new().with("src", StandardResult::success("src", json!({"id": 1})));

        let r = DatabaseQueryNode.execute(&node, &input, &mut ctx).await;
        assert_eq!(r.response["rowCount"], json!(1));
        let seen = db.seen.lock().unwrap().clone().unwrap();
        assert_eq!(seen.query, "select * from users where id = $1");
        assert_eq!(seen.parameters, vec![json!("1")]);
    }

    #[tokio::test]
    async fn test_default_database_is_unsupported() {
        let node = Node::new("q", NodeKind::DatabaseQuery, json!({"connectionId": "pg", "query": "select 1"}));
        let r = DatabaseQueryNode.execute(&node, &NodeInput::new(), &mut context()).await;
        assert_eq!(r.error.as_deref(), Some("database is not available in this runtime"));
    }
}

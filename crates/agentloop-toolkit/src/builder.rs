//! Turn async or sync closures into [`Tool`] implementations.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use agentloop_core::tools::{Tool, ToolBox, ToolContext, ToolOutput, ToolParameterSchema, ToolSchema};
use async_trait::async_trait;
use serde_json::Value;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

pub type AsyncToolFn =
    Arc<dyn Fn(Value, ToolContext) -> BoxFuture<anyhow::Result<ToolOutput>> + Send + Sync>;

struct FunctionTool {
    schema: ToolSchema,
    handler: AsyncToolFn,
}

#[async_trait]
impl Tool for FunctionTool {
    fn schema(&self) -> ToolSchema {
        self.schema.clone()
    }

    async fn execute(&self, args: Value, ctx: ToolContext) -> anyhow::Result<ToolOutput> {
        (self.handler)(args, ctx).await
    }
}

pub struct ToolBuilder {
    name: String,
    description: String,
    parameters: Option<ToolParameterSchema>,
}

impl ToolBuilder {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: None,
        }
    }

    pub fn with_parameters(mut self, parameters: ToolParameterSchema) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn build_async<F, Fut>(self, handler: F) -> ToolBox
    where
        F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ToolOutput>> + Send + 'static,
    {
        let schema = ToolSchema::new(
            self.name,
            self.description,
            self.parameters
                .unwrap_or_else(ToolParameterSchema::empty_object),
        );
        let handler: AsyncToolFn = Arc::new(move |args, ctx| Box::pin(handler(args, ctx)));
        Arc::new(FunctionTool { schema, handler })
    }

    pub fn build_sync<F>(self, handler: F) -> ToolBox
    where
        F: Fn(Value, ToolContext) -> anyhow::Result<ToolOutput> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.build_async(move |args, ctx| {
            let handler = handler.clone();
            async move { handler(args, ctx) }
        })
    }
}

pub fn tool<F, Fut>(
    name: impl Into<String>,
    description: impl Into<String>,
    parameters: ToolParameterSchema,
    handler: F,
) -> ToolBox
where
    F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<ToolOutput>> + Send + 'static,
{
    ToolBuilder::new(name, description)
        .with_parameters(parameters)
        .build_async(handler)
}

pub fn tool_sync<F>(
    name: impl Into<String>,
    description: impl Into<String>,
    parameters: ToolParameterSchema,
    handler: F,
) -> ToolBox
where
    F: Fn(Value, ToolContext) -> anyhow::Result<ToolOutput> + Send + Sync + 'static,
{
    ToolBuilder::new(name, description)
        .with_parameters(parameters)
        .build_sync(handler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::StateBackend;
    use agentloop_core::backend::Backend;
    use agentloop_core::state::AgentState;
    use serde_json::json;

    fn ctx() -> ToolContext {
        ToolContext::new(Arc::new(AgentState::new("t1")), Arc::new(StateBackend::new()))
    }

    #[tokio::test]
    async fn async_tool_reads_through_backend() {
        let tool = ToolBuilder::new("cat", "Print a file").build_async(|args, ctx| async move {
            let path = args["path"].as_str().unwrap_or("/");
            let body = ctx.backend.read_to_string(path).await?;
            Ok(ToolOutput::text(body))
        });
        assert_eq!(tool.schema().name, "cat");

        let ctx = ctx();
        ctx.backend.write("/x.txt", b"hi").await.unwrap();
        let (text, _) = tool
            .execute(json!({"path": "/x.txt"}), ctx)
            .await
            .unwrap()
            .into_parts();
        assert_eq!(text, "hi");
    }

    #[tokio::test]
    async fn sync_tool_works() {
        let tool = tool_sync(
            "add",
            "Adds two numbers",
            ToolParameterSchema::object(
                "Add parameters",
                [
                    ("a".to_string(), ToolParameterSchema::number("First number")),
                    ("b".to_string(), ToolParameterSchema::number("Second number")),
                ]
                .into_iter()
                .collect(),
                vec!["a".to_string(), "b".to_string()],
            ),
            |args, _ctx| {
                let sum = args["a"].as_f64().unwrap_or(0.0) + args["b"].as_f64().unwrap_or(0.0);
                Ok(ToolOutput::text(format!("Sum: {sum}")))
            },
        );

        let out = tool.execute(json!({"a": 5, "b": 3}), ctx()).await.unwrap();
        assert_eq!(out, ToolOutput::text("Sum: 8"));
    }
}

//! MCP protocol bridge and transports.
//!
//! Adapts the [`ToolRegistry`] to the MCP JSON-RPC protocol so agents and
//! IDE plugins can discover and call the façade over either transport.
//! Tool names, argument schemas, and result shapes are identical on stdio
//! and streamable HTTP.

use std::borrow::Cow;
use std::sync::Arc;

use rmcp::model::*;
use rmcp::transport::stdio;
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpService,
};
use rmcp::{ErrorData as McpError, ServerHandler, ServiceExt};

use crate::tools::{AppServices, ToolRegistry};

/// Bridges the tool registry to MCP. Every session shares the same
/// registry and services (everything is behind `Arc`).
#[derive(Clone)]
pub struct McpBridge {
    services: Arc<AppServices>,
    tools: Arc<ToolRegistry>,
}

impl McpBridge {
    pub fn new(services: Arc<AppServices>, tools: Arc<ToolRegistry>) -> Self {
        Self { services, tools }
    }

    fn to_mcp_tool(tool: &dyn crate::tools::Tool) -> Tool {
        let schema_value = tool.parameters_schema();
        let input_schema: Arc<serde_json::Map<String, serde_json::Value>> = match schema_value {
            serde_json::Value::Object(map) => Arc::new(map),
            _ => Arc::new(serde_json::Map::new()),
        };

        Tool {
            name: Cow::Owned(tool.name().to_string()),
            title: None,
            description: Some(Cow::Owned(tool.description().to_string())),
            input_schema,
            output_schema: None,
            annotations: None,
            icons: None,
            meta: None,
        }
    }
}

impl ServerHandler for McpBridge {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "helpdex".to_string(),
                title: Some("Helpdex".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Helpdex — indexed vendor help topics for AI agents. Use semantic_search for \
                 natural-language questions, keyword_search or get_function_info for exact API \
                 identifiers, get_topic for full topic text, and save_snippet to contribute \
                 working code examples."
                    .to_string(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        let tools: Vec<Tool> = self
            .tools
            .tools()
            .iter()
            .map(|t| Self::to_mcp_tool(t.as_ref()))
            .collect();
        std::future::ready(Ok(ListToolsResult::with_all_items(tools)))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let params = request
            .arguments
            .map(serde_json::Value::Object)
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));

        match self
            .tools
            .dispatch(&request.name, params, &self.services)
            .await
        {
            Ok(result) => {
                let text = serde_json::to_string_pretty(&result).unwrap_or_default();
                Ok(CallToolResult::success(vec![Content::text(text)]))
            }
            Err(e) => {
                tracing::debug!(tool = %request.name, kind = e.kind(), error = %e, "tool error");
                let body = e.render(self.services.config.production);
                let text = serde_json::to_string(&body).unwrap_or_default();
                Ok(CallToolResult::error(vec![Content::text(text)]))
            }
        }
    }
}

/// Serve the bridge on stdio (line-framed MCP). Runs until the client
/// closes the stream.
pub async fn serve_stdio(bridge: McpBridge) -> anyhow::Result<()> {
    tracing::info!("mcp server on stdio");
    let service = bridge.serve(stdio()).await?;
    service.waiting().await?;
    Ok(())
}

/// Serve the bridge over streamable HTTP on `host:port/path`.
pub async fn serve_http(bridge: McpBridge, host: &str, port: u16, path: &str) -> anyhow::Result<()> {
    let service: StreamableHttpService<McpBridge, LocalSessionManager> =
        StreamableHttpService::new(
            move || Ok(bridge.clone()),
            LocalSessionManager::default().into(),
            Default::default(),
        );

    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    // Browser-based MCP clients connect cross-origin.
    let cors = tower_http::cors::CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any);
    let app = axum::Router::new().nest_service(&path, service).layer(cors);
    let addr = format!("{}:{}", host, port);
    tracing::info!(addr = %addr, path = %path, "mcp server on streamable http");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use rmcp::{
    ErrorData as McpError, RoleServer, ServerHandler, ServiceExt,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo},
    service::RequestContext,
    tool, tool_handler, tool_router,
    transport::stdio,
};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use graph_memory_mcp_rs::config::Config;
use graph_memory_mcp_rs::logging::{init_logging, TransportMode};
use graph_memory_mcp_rs::{
    Entity, GraphError, KnowledgeGraphManager, ObservationDeletion, ObservationInput, Relation,
    SearchMode,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Database file (.db) or ":memory:" [env: MEMORY_DB_PATH]
    #[arg(long = "db-path", value_name = "PATH")]
    db_path: Option<PathBuf>,

    /// Search strategy: substring, full-text or ranked
    #[arg(long, default_value = "full-text")]
    search_mode: SearchMode,

    /// Do not create full-text search tables (substring search only)
    #[arg(long = "no-fts")]
    no_fts: bool,

    /// Enable streamable HTTP mode (default: stdio)
    #[arg(short = 's', long = "stream")]
    stream_mode: bool,

    /// HTTP port for stream mode
    #[arg(short = 'p', long, default_value = "8000")]
    port: u16,

    /// Bind address for stream mode
    #[arg(short = 'b', long, default_value = "127.0.0.1")]
    bind: String,

    /// Enable file logging. Optionally specify log file name (default: graph-memory-mcp-rs.log)
    #[arg(short = 'l', long, value_name = "FILE", num_args = 0..=1, default_missing_value = "graph-memory-mcp-rs.log")]
    log: Option<PathBuf>,
}

#[derive(Clone)]
struct MemoryServer {
    manager: Arc<KnowledgeGraphManager>,
    tool_router: ToolRouter<Self>,
}

impl MemoryServer {
    fn new(manager: Arc<KnowledgeGraphManager>) -> Self {
        Self {
            manager,
            tool_router: Self::tool_router(),
        }
    }

    fn server_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: Default::default(),
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .build(),
            server_info: Implementation {
                name: "graph-memory-mcp-rs".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
                website_url: None,
                icons: None,
            },
            instructions: Some(
                "Persistent knowledge graph memory: entities with observations, linked by typed relations."
                    .to_string(),
            ),
        }
    }
}

/// Text summary plus the value as structured content
fn structured<T: serde::Serialize>(summary: String, value: &T) -> CallToolResult {
    let mut result = CallToolResult::success(vec![Content::text(summary)]);
    result.structured_content = Some(json!(value));
    result
}

#[tool_router]
impl MemoryServer {
    /// Create new entities in knowledge graph
    #[tool(
        name = "create_entities",
        description = "Create multiple new entities in the knowledge graph. Entities whose name already exists are skipped."
    )]
    async fn create_entities(
        &self,
        Parameters(args): Parameters<CreateEntitiesArgs>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let created = self
            .manager
            .create_entities(args.entities, context.ct)
            .await
            .map_err(graph_err("Failed to create entities"))?;

        Ok(structured(
            format!("{} entities created successfully", created.len()),
            &created,
        ))
    }

    /// Create relations between entities
    #[tool(
        name = "create_relations",
        description = "Create multiple new relations between entities in the knowledge graph. Relations should be in active voice. Relations naming unknown entities are skipped."
    )]
    async fn create_relations(
        &self,
        Parameters(args): Parameters<CreateRelationsArgs>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let created = self
            .manager
            .create_relations(args.relations, context.ct)
            .await
            .map_err(graph_err("Failed to create relations"))?;

        Ok(structured(
            format!("{} relations created successfully", created.len()),
            &created,
        ))
    }

    /// Add observations to entities
    #[tool(
        name = "add_observations",
        description = "Add new observations to existing entities in the knowledge graph. Fails if any entity does not exist."
    )]
    async fn add_observations(
        &self,
        Parameters(args): Parameters<AddObservationsArgs>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let results = self
            .manager
            .add_observations(args.observations, context.ct)
            .await
            .map_err(graph_err("Failed to add observations"))?;

        let added: usize = results.iter().map(|r| r.added_observations.len()).sum();
        Ok(structured(
            format!("Added {} observations to {} entities", added, results.len()),
            &results,
        ))
    }

    /// Delete entities and their relations
    #[tool(
        name = "delete_entities",
        description = "Delete multiple entities and their associated observations and relations from the knowledge graph"
    )]
    async fn delete_entities(
        &self,
        Parameters(args): Parameters<DeleteEntitiesArgs>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let count = self
            .manager
            .delete_entities(args.entity_names, context.ct)
            .await
            .map_err(graph_err("Failed to delete entities"))?;

        Ok(CallToolResult::success(vec![Content::text(format!(
            "{} entities deleted successfully",
            count
        ))]))
    }

    /// Delete observations from entities
    #[tool(
        name = "delete_observations",
        description = "Delete specific observations from entities in the knowledge graph"
    )]
    async fn delete_observations(
        &self,
        Parameters(args): Parameters<DeleteObservationsArgs>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.manager
            .delete_observations(args.deletions, context.ct)
            .await
            .map_err(graph_err("Failed to delete observations"))?;

        Ok(CallToolResult::success(vec![Content::text(
            "Observations deleted successfully",
        )]))
    }

    /// Delete relations
    #[tool(
        name = "delete_relations",
        description = "Delete specific relations from the knowledge graph"
    )]
    async fn delete_relations(
        &self,
        Parameters(args): Parameters<DeleteRelationsArgs>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let count = self
            .manager
            .delete_relations(args.relations, context.ct)
            .await
            .map_err(graph_err("Failed to delete relations"))?;

        Ok(CallToolResult::success(vec![Content::text(format!(
            "{} relations deleted successfully",
            count
        ))]))
    }

    /// Read entire knowledge graph
    #[tool(
        name = "read_graph",
        description = "Read the entire knowledge graph"
    )]
    async fn read_graph(
        &self,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let graph = self
            .manager
            .read_graph(context.ct)
            .await
            .map_err(graph_err("Failed to read graph"))?;

        Ok(structured(
            format!(
                "Knowledge graph contains {} entities and {} relations",
                graph.entities.len(),
                graph.relations.len()
            ),
            &graph,
        ))
    }

    /// Search nodes by query
    #[tool(
        name = "search_nodes",
        description = "Search for nodes in the knowledge graph. Matches entity names, types, and observation content; an empty query returns everything."
    )]
    async fn search_nodes(
        &self,
        Parameters(args): Parameters<SearchNodesArgs>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let result = self
            .manager
            .search_nodes(args.query, context.ct)
            .await
            .map_err(graph_err("Failed to search nodes"))?;

        Ok(structured(
            format!(
                "Found {} entities and {} relations",
                result.entities.len(),
                result.relations.len()
            ),
            &result,
        ))
    }

    /// Open specific nodes by names
    #[tool(
        name = "open_nodes",
        description = "Open specific nodes in the knowledge graph by their names"
    )]
    async fn open_nodes(
        &self,
        Parameters(args): Parameters<OpenNodesArgs>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let result = self
            .manager
            .open_nodes(args.names, context.ct)
            .await
            .map_err(graph_err("Failed to open nodes"))?;

        Ok(structured(
            format!(
                "Retrieved {} entities and {} relations",
                result.entities.len(),
                result.relations.len()
            ),
            &result,
        ))
    }
}

#[tool_handler]
impl ServerHandler for MemoryServer {
    fn get_info(&self) -> ServerInfo {
        self.server_info()
    }
}

// Tool argument schemas

#[derive(Debug, Deserialize, JsonSchema)]
struct CreateEntitiesArgs {
    /// Entities to create
    entities: Vec<Entity>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct CreateRelationsArgs {
    /// Relations to create
    relations: Vec<Relation>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct AddObservationsArgs {
    /// Observations to add, grouped by entity
    observations: Vec<ObservationInput>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct DeleteEntitiesArgs {
    /// Names of the entities to delete
    #[serde(rename = "entityNames")]
    entity_names: Vec<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct DeleteObservationsArgs {
    /// Observations to delete, grouped by entity
    deletions: Vec<ObservationDeletion>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct DeleteRelationsArgs {
    /// Relations to delete
    relations: Vec<Relation>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SearchNodesArgs {
    /// Text to match against entity names, types and observations
    #[serde(default)]
    query: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct OpenNodesArgs {
    /// Names of the entities to retrieve
    names: Vec<String>,
}

// Bad requests become invalid_params, store faults internal_error
fn graph_err(msg: &'static str) -> impl FnOnce(GraphError) -> McpError + Clone {
    move |err| {
        let data = Some(json!({ "error": err.to_string() }));
        if err.is_client_error() {
            McpError::invalid_params(msg, data)
        } else {
            McpError::internal_error(msg, data)
        }
    }
}

/// Run server in stdio mode (default)
async fn run_stdio_mode(server: MemoryServer) -> Result<(), Box<dyn std::error::Error>> {
    let svc = server.serve(stdio()).await?;
    svc.waiting().await?;
    Ok(())
}

/// Run server in streamable HTTP mode
async fn run_stream_mode(
    server: MemoryServer,
    bind: &str,
    port: u16,
) -> Result<(), Box<dyn std::error::Error>> {
    use rmcp::transport::StreamableHttpService;
    use rmcp::transport::streamable_http_server::session::local::LocalSessionManager;

    let addr = format!("{}:{}", bind, port);
    info!("Starting MCP HTTP server on http://{}/mcp", addr);

    let service = StreamableHttpService::new(
        move || Ok(server.clone()),
        LocalSessionManager::default().into(),
        Default::default(),
    );

    // MCP endpoint plus health check
    let router = axum::Router::new()
        .nest_service("/mcp", service)
        .route("/health", axum::routing::get(|| async { "OK" }));

    let tcp_listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(tcp_listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
        })
        .await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mode = if args.stream_mode {
        TransportMode::Stream
    } else {
        TransportMode::Stdio
    };

    // stdio mode MUST NOT log to stderr (breaks the MCP handshake)
    init_logging(mode, args.log.as_deref())?;

    let config = Config::load(args.db_path, args.search_mode, !args.no_fts)?;
    info!(
        db_path = %config.db_path.display(),
        search_mode = %config.search_mode,
        "loading knowledge graph"
    );

    let manager = Arc::new(KnowledgeGraphManager::from_config(&config)?);
    let stats = manager.stats().await?;
    info!(
        entities = stats.entities,
        relations = stats.relations,
        full_text = stats.full_text_enabled,
        "knowledge graph ready"
    );

    let server = MemoryServer::new(manager);
    match mode {
        TransportMode::Stdio => run_stdio_mode(server).await,
        TransportMode::Stream => run_stream_mode(server, &args.bind, args.port).await,
    }
}

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::{ErrorData as McpError, ServerHandler, ServiceExt, tool, tool_handler, tool_router};
use tokio::io::{stdin, stdout};

use crate::cli::EmbedDevice;
use crate::rag::{RagConfig, RagService};

/// Flag surface of the tool-server binary. This mirrors
/// `ToolServerConfig::to_argv` on the client side; keep the two in sync.
#[derive(Debug, Parser)]
#[command(name = "scantree-rag-server")]
#[command(about = "Document retrieval MCP server over stdio")]
pub struct ServerArgs {
    #[arg(long = "server-name", default_value = "rag-stdio-server")]
    pub server_name: String,

    #[arg(long = "docs", num_args = 1.., required = true)]
    pub docs: Vec<String>,

    #[arg(long = "embed-model", default_value = "feature-hash-256")]
    pub embed_model: String,

    #[arg(long = "embed-device", value_enum, default_value_t = EmbedDevice::Cpu)]
    pub embed_device: EmbedDevice,

    #[arg(long = "chunk-size", default_value_t = 1024)]
    pub chunk_size: usize,

    #[arg(long = "chunk-overlap", default_value_t = 128)]
    pub chunk_overlap: usize,

    #[arg(long = "default-top-k", default_value_t = 5)]
    pub default_top_k: usize,

    #[arg(long = "persist-dir", default_value = "./storage_cache")]
    pub persist_dir: String,

    /// Log destination; stdout carries the protocol, so logs must go
    /// elsewhere.
    #[arg(long = "log-file")]
    pub log_file: Option<String>,

    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,
}

impl ServerArgs {
    pub fn rag_config(&self) -> RagConfig {
        RagConfig {
            docs: self.docs.clone(),
            embed_model: self.embed_model.clone(),
            embed_device: self.embed_device,
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
            default_top_k: self.default_top_k,
            persist_dir: self.persist_dir.clone(),
        }
    }
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct RetrieveRequest {
    #[schemars(description = "Query describing the information to find in the documents")]
    pub query: String,
    #[schemars(
        description = "Number of most relevant chunks to return; the server default applies when omitted or not positive"
    )]
    pub top_k: Option<i64>,
}

#[derive(Clone)]
pub struct RagToolServer {
    service: Arc<RagService>,
    server_name: String,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl RagToolServer {
    pub fn new(service: Arc<RagService>, server_name: String) -> Self {
        Self {
            service,
            server_name,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        name = "retrieve_document_chunks",
        description = "Retrieves the most relevant text chunks from the indexed service documentation for a query. Returns a JSON list of chunk texts, ranked by relevance; an empty list means nothing matched."
    )]
    async fn retrieve_document_chunks(
        &self,
        Parameters(request): Parameters<RetrieveRequest>,
    ) -> Result<CallToolResult, McpError> {
        let chunks = self.service.retrieve(&request.query, request.top_k);
        tracing::info!(
            query = %request.query,
            top_k = ?request.top_k,
            returned = chunks.len(),
            "retrieval query served"
        );

        let texts = chunks
            .iter()
            .map(|chunk| chunk.text.as_str())
            .collect::<Vec<&str>>();
        let payload = serde_json::to_string(&texts)
            .map_err(|err| McpError::internal_error(err.to_string(), None))?;

        Ok(CallToolResult::success(vec![Content::text(payload)]))
    }
}

#[tool_handler]
impl ServerHandler for RagToolServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo::new(ServerCapabilities::builder().enable_tools().build())
            .with_server_info(Implementation::from_build_env())
            .with_instructions(format!(
                "Document retrieval server '{}'. Use retrieve_document_chunks to look up \
                 protocol details from the indexed service documentation.",
                self.server_name
            ))
    }
}

pub fn init_server_tracing(log_file: Option<&str>, log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match log_file {
        Some(path) => {
            if let Some(parent) = Path::new(path).parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create log directory '{}'", parent.display())
                })?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file '{path}'"))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .with_target(false)
                .try_init()
                .map_err(|err| anyhow::anyhow!("failed to initialize server tracing: {err}"))
        }
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize server tracing: {err}")),
    }
}

/// Entry point of the tool-server binary: build or load the index (fatal on
/// failure for this server only), then serve MCP over stdio until the client
/// closes the session.
pub async fn run_rag_server(args: ServerArgs) -> Result<()> {
    init_server_tracing(args.log_file.as_deref(), &args.log_level)?;

    tracing::info!(
        server = %args.server_name,
        docs = args.docs.len(),
        persist_dir = %args.persist_dir,
        "initializing retrieval resources"
    );

    let service = match RagService::initialize(&args.rag_config()) {
        Ok(service) => service,
        Err(err) => {
            tracing::error!(
                server = %args.server_name,
                error = %err,
                "retrieval initialization failed; server exiting"
            );
            return Err(err);
        }
    };

    let server = RagToolServer::new(Arc::new(service), args.server_name.clone());
    tracing::info!(server = %args.server_name, "serving MCP over stdio");

    let running = server
        .serve((stdin(), stdout()))
        .await
        .context("MCP stdio handshake failed")?;
    running
        .waiting()
        .await
        .context("MCP server terminated abnormally")?;

    Ok(())
}

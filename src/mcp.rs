use std::sync::Arc;

use rmcp::{
    ServerHandler,
    ServiceExt,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{
        CallToolResult,
        Content,
        Implementation,
        ServerCapabilities,
        ServerInfo,
    },
    tool,
    tool_handler,
    tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    citation::{self, Citation},
    error::{self, Error},
    llm::LlmProvider,
    rag::{AskOptions, Orchestrator},
    reranker::Reranker,
    search::{DEFAULT_LIMIT, DEFAULT_THRESHOLD, HybridRetriever, SearchParams},
    store::{self, IndexStore},
};

/// Everything the tools need, built once at startup.
pub struct McpState {
    store: Arc<dyn IndexStore>,
    retriever: HybridRetriever,
    reranker: Reranker,
    /// Absent when no chat model is configured.
    orchestrator: Option<Orchestrator>,
    chat_model: String,
}

impl McpState {
    pub fn new(
        store: Arc<dyn IndexStore>,
        retriever: HybridRetriever,
        reranker: Reranker,
        llm: Option<Arc<dyn LlmProvider>>,
        chat_model: impl Into<String>,
    ) -> Self {
        let orchestrator = llm.map(|llm| {
            Orchestrator::new(
                Arc::clone(&store),
                retriever.clone(),
                reranker.clone(),
                llm,
            )
        });
        Self {
            store,
            retriever,
            reranker,
            orchestrator,
            chat_model: chat_model.into(),
        }
    }
}

#[derive(Clone)]
pub struct DocragMcpServer {
    state: Arc<McpState>,
    tool_router: ToolRouter<Self>,
}

impl DocragMcpServer {
    pub fn new(state: McpState) -> Self {
        Self {
            state: Arc::new(state),
            tool_router: Self::tool_router(),
        }
    }
}

#[tool_router(router = tool_router)]
impl DocragMcpServer {
    /// Hybrid search over indexed documentation chunks.
    #[tool(
        name = "search_docs",
        description = "Search the documentation knowledge base. Returns the most relevant chunks with their source and citation URL."
    )]
    pub async fn search_docs(
        &self,
        params: Parameters<SearchDocsParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let params = params.0;
        let search = SearchParams {
            query: params.query.clone(),
            limit: params.limit.unwrap_or(DEFAULT_LIMIT),
            threshold: params.similarity_threshold.unwrap_or(DEFAULT_THRESHOLD),
        };

        let mut results = self
            .state
            .retriever
            .search(&search)
            .await
            .map_err(|e| mcp_error("search failed", e))?;
        if params.rerank.unwrap_or(false) {
            let reranker = &self.state.reranker;
            let reranked = reranker.rerank(&search.query, results).await;
            if let Some(usage) = reranked.usage {
                let store = self.state.store.as_ref();
                store::record_best_effort(store, usage).await;
            }
            results = reranked.results;
        }

        let citations = citation::citations(&results);
        let items: Vec<SearchResultItem> = results
            .into_iter()
            .zip(citations)
            .map(|(r, c)| SearchResultItem {
                chunk_id: r.chunk_id,
                title: r.title,
                source_path: r.source_path,
                heading: c.heading,
                url: c.url,
                score: r.score,
                rerank_score: r.rerank_score,
                start_line: r.start_line,
                end_line: r.end_line,
                content: r.content,
            })
            .collect();

        let summary = format_search_summary(&items, &params.query);
        let structured = serde_json::to_value(SearchResponse {
            query: params.query,
            result_count: items.len(),
            results: items,
        })
        .map_err(|e| mcp_error("failed to serialize search results", e))?;

        let mut result = CallToolResult::success(vec![Content::text(summary)]);
        result.structured_content = Some(structured);
        Ok(result)
    }

    /// Answer a question from the documentation, with citations.
    #[tool(
        name = "query_knowledge_base",
        description = "Answer a question using only the documentation knowledge base. Returns the answer and the cited sources."
    )]
    pub async fn query_knowledge_base(
        &self,
        params: Parameters<QueryParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let params = params.0;
        let Some(orchestrator) = &self.state.orchestrator else {
            let message =
                Error::MissingCredential("OPENAI_API_KEY").to_string();
            let mut result = CallToolResult::success(vec![Content::text(message)]);
            result.is_error = Some(true);
            return Ok(result);
        };

        let options = AskOptions {
            limit: params.limit.unwrap_or(DEFAULT_LIMIT),
            threshold: params.similarity_threshold.unwrap_or(DEFAULT_THRESHOLD),
            model: self.state.chat_model.clone(),
            rerank: true,
        };

        let answered = orchestrator.answer(&params.message, &options).await;
        let answer = match answered {
            Ok(answer) => answer,
            Err(Error::EmptyQuestion) => {
                return Err(rmcp::ErrorData::invalid_params(
                    "message must not be empty",
                    None,
                ));
            }
            Err(e) => return Err(mcp_error("query failed", e)),
        };

        let text = format_answer(&answer.answer, &answer.sources);
        let structured = serde_json::to_value(&answer)
            .map_err(|e| mcp_error("failed to serialize answer", e))?;

        let mut result = CallToolResult::success(vec![Content::text(text)]);
        result.structured_content = Some(structured);
        Ok(result)
    }
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for DocragMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo::new(ServerCapabilities::builder().enable_tools().build())
            .with_server_info(
                Implementation::new("docrag", env!("CARGO_PKG_VERSION"))
                    .with_title("docrag MCP"),
            )
            .with_instructions(
                "Use search_docs to find relevant documentation chunks. Use query_knowledge_base for a cited answer to a question.",
            )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchDocsParams {
    /// Search query string.
    pub query: String,
    /// Maximum number of results (default: 5).
    pub limit: Option<usize>,
    /// Minimum fused score (default: 0.01).
    pub similarity_threshold: Option<f32>,
    /// Rerank results with the cross-encoder (default: false).
    pub rerank: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueryParams {
    /// The question to answer.
    pub message: String,
    /// Maximum number of context chunks (default: 5).
    pub limit: Option<usize>,
    /// Minimum fused score for context chunks (default: 0.01).
    pub similarity_threshold: Option<f32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    query: String,
    result_count: usize,
    results: Vec<SearchResultItem>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchResultItem {
    chunk_id: String,
    title: String,
    source_path: String,
    heading: Option<String>,
    url: String,
    score: f32,
    rerank_score: Option<f32>,
    start_line: usize,
    end_line: usize,
    content: String,
}

fn format_search_summary(results: &[SearchResultItem], query: &str) -> String {
    if results.is_empty() {
        return format!("No results found for \"{query}\"");
    }

    let mut lines = Vec::with_capacity(results.len() + 1);
    let suffix = if results.len() == 1 { "" } else { "s" };
    lines.push(format!(
        "Found {} result{} for \"{query}\":",
        results.len(),
        suffix
    ));

    for item in results {
        lines.push(format!(
            "{:.4} {}:{}-{} {}",
            item.score,
            item.source_path,
            item.start_line,
            item.end_line,
            item.url
        ));
    }

    lines.join("\n")
}

fn format_answer(answer: &str, sources: &[Citation]) -> String {
    if sources.is_empty() {
        return answer.to_string();
    }
    let mut out = format!("{answer}\n\nSources:");
    for source in sources {
        out.push_str(&format!(
            "\n[{}] {} {}",
            source.citation_number, source.title, source.url
        ));
    }
    out
}

fn mcp_error(message: &str, error: impl std::fmt::Display) -> rmcp::ErrorData {
    rmcp::ErrorData::internal_error(
        message.to_string(),
        Some(json!({ "error": error.to_string() })),
    )
}

/// Serve the tools over stdio until the client disconnects.
pub async fn run_mcp(state: McpState) -> error::Result<()> {
    let server = DocragMcpServer::new(state);
    let transport = rmcp::transport::stdio();
    let running = server.serve(transport).await.map_err(|e| {
        Error::Config(format!("MCP server initialization failed: {e}"))
    })?;
    running
        .waiting()
        .await
        .map_err(|e| Error::Config(format!("MCP server error: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        embedding::tests::FakeEmbedder,
        llm::tests::FakeLlm,
        local_store::tests::seeded_store,
    };

    fn text_of(result: &CallToolResult) -> String {
        result
            .content
            .first()
            .and_then(|c| c.as_text())
            .map(|t| t.text.clone())
            .unwrap_or_default()
    }

    async fn server(
        llm: Option<Arc<dyn LlmProvider>>,
    ) -> (tempfile::TempDir, DocragMcpServer) {
        let (tmp, store) = seeded_store().await;
        let store: Arc<dyn IndexStore> = Arc::new(store);
        let embedder = Arc::new(FakeEmbedder::new());
        let retriever = HybridRetriever::new(Arc::clone(&store), embedder);
        let state = McpState::new(
            store,
            retriever,
            Reranker::passthrough(),
            llm,
            "fake-chat",
        );
        (tmp, DocragMcpServer::new(state))
    }

    #[tokio::test]
    async fn search_tool_returns_structured_results() {
        let (_tmp, server) = server(None).await;
        let params = SearchDocsParams {
            query: "abort signals".to_string(),
            limit: Some(2),
            similarity_threshold: Some(0.0),
            rerank: None,
        };

        let result = server.search_docs(Parameters(params)).await.unwrap();

        let structured = result.structured_content.clone().expect("structured");
        let results = structured
            .get("results")
            .and_then(|v| v.as_array())
            .expect("results array");
        assert_eq!(results.len(), 2);
        assert_eq!(
            results[0].get("sourcePath").and_then(|v| v.as_str()),
            Some("a.md")
        );
        let url = results[0].get("url").and_then(|v| v.as_str()).unwrap();
        assert!(url.starts_with(citation::DOCS_BASE_URL));
        assert!(text_of(&result).contains("Found 2 results"));
    }

    #[tokio::test]
    async fn query_tool_answers_with_sources() {
        let llm = Arc::new(FakeLlm::answering("Use an AbortController [1]."));
        let provider: Arc<dyn LlmProvider> = llm.clone();
        let (_tmp, server) = server(Some(provider)).await;
        let params = QueryParams {
            message: "How do I cancel a fetch?".to_string(),
            limit: None,
            similarity_threshold: Some(0.0),
        };

        let result = server
            .query_knowledge_base(Parameters(params))
            .await
            .unwrap();

        assert_eq!(result.is_error, Some(false));
        assert_eq!(llm.calls(), 1);
        let text = text_of(&result);
        assert!(text.starts_with("Use an AbortController [1]."));
        assert!(text.contains("Sources:\n[1]"));
        let structured = result.structured_content.expect("structured");
        assert!(
            !structured["sources"].as_array().unwrap().is_empty()
        );
        assert_eq!(llm.prompts.lock().unwrap()[0].model, "fake-chat");
    }

    #[tokio::test]
    async fn query_tool_without_llm_is_a_tool_error() {
        let (_tmp, server) = server(None).await;
        let params = QueryParams {
            message: "anything".to_string(),
            limit: None,
            similarity_threshold: None,
        };
        let result = server
            .query_knowledge_base(Parameters(params))
            .await
            .unwrap();
        assert_eq!(result.is_error, Some(true));
        assert!(text_of(&result).contains("OPENAI_API_KEY"));
    }

    #[tokio::test]
    async fn blank_message_is_invalid_params() {
        let provider: Arc<dyn LlmProvider> =
            Arc::new(FakeLlm::answering("unused"));
        let (_tmp, server) = server(Some(provider)).await;
        let params = QueryParams {
            message: "   ".to_string(),
            limit: None,
            similarity_threshold: None,
        };
        assert!(server.query_knowledge_base(Parameters(params)).await.is_err());
    }
}

//! Question answering over the index.
//!
//! The pipeline is linear: retrieve, optionally rerank, and either return
//! the canned not-found answer (no model call) or build a context block,
//! prompt the model and cite the chunks that went into the context.

use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::{
    citation::{self, Citation},
    error::{Error, Result},
    llm::{self, GenerateRequest, Generation, LlmProvider, TaskGuard},
    reranker::Reranker,
    search::{self, HybridRetriever, SearchParams, SearchResult},
    store::{IndexStore, record_best_effort},
    usage::{Operation, TokenUsage, Usage, UsageDetail},
};

/// Answer returned when retrieval finds nothing.
pub const NOT_FOUND_ANSWER: &str = "I couldn't find any relevant information in the knowledge base to answer your question. You may want to try rephrasing your question or checking if the information exists in the documents.";

const EMPTY_CONTEXT: &str = "No relevant context found.";

const SYSTEM_PROMPT: &str = "You are a documentation assistant. Answer the question using the context documents below. Follow these rules:

1. Base your answer on the context documents, not on prior knowledge.
2. If the context does not fully answer the question, say which information is missing.
3. Cite the documents you rely on by their title or index.
4. If documents disagree or are unclear, point that out.
5. Be concise without leaving out steps the reader needs.
6. Format the answer as markdown and include code examples when the context has them.
7. Do not add information that is not in the context.";

#[derive(Debug, Clone, PartialEq)]
pub struct AskOptions {
    pub limit: usize,
    /// Minimum fused retrieval score.
    pub threshold: f32,
    pub model: String,
    pub rerank: bool,
}

impl Default for AskOptions {
    fn default() -> Self {
        Self {
            limit: search::DEFAULT_LIMIT,
            threshold: search::DEFAULT_THRESHOLD,
            model: llm::DEFAULT_CHAT_MODEL.to_string(),
            rerank: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RagAnswer {
    pub answer: String,
    pub sources: Vec<Citation>,
    /// Absent when no model call was made.
    pub usage: Option<Usage>,
}

impl RagAnswer {
    fn not_found() -> Self {
        Self {
            answer: NOT_FOUND_ANSWER.to_string(),
            sources: Vec::new(),
            usage: None,
        }
    }
}

/// A streaming answer. Sources are known before the first token.
///
/// Dropping the stream aborts generation; usage is only recorded for a
/// stream that runs to completion.
#[derive(Debug)]
pub struct RagStream {
    pub sources: Vec<Citation>,
    tokens: mpsc::Receiver<String>,
    task: TaskGuard<Result<RagAnswer>>,
}

impl RagStream {
    /// Hand each token to `on_token` as it arrives, then resolve the
    /// complete answer.
    pub async fn finish(
        mut self,
        mut on_token: impl FnMut(&str) -> Result<()>,
    ) -> Result<RagAnswer> {
        while let Some(token) = self.tokens.recv().await {
            on_token(&token)?;
        }
        self.task.await?
    }
}

/// Sequences retrieval, reranking and generation.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn IndexStore>,
    retriever: HybridRetriever,
    reranker: Reranker,
    llm: Arc<dyn LlmProvider>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn IndexStore>,
        retriever: HybridRetriever,
        reranker: Reranker,
        llm: Arc<dyn LlmProvider>,
    ) -> Self {
        Self {
            store,
            retriever,
            reranker,
            llm,
        }
    }

    /// Retrieve context for `question` and answer it.
    pub async fn answer(
        &self,
        question: &str,
        options: &AskOptions,
    ) -> Result<RagAnswer> {
        let results = self.retrieve(question, options).await?;
        if results.is_empty() {
            tracing::info!("no relevant chunks, skipping generation");
            return Ok(RagAnswer::not_found());
        }

        let request = self.request(question, &results, options);
        let generation = self.llm.generate(&request).await?;
        tracing::info!(
            tokens = generation.usage.total_tokens,
            "generated answer"
        );

        record_generation(
            self.store.as_ref(),
            &options.model,
            question,
            results.len(),
            generation.usage,
        )
        .await;

        Ok(RagAnswer {
            answer: generation.text,
            sources: citation::citations(&results),
            usage: Some(generation.usage),
        })
    }

    /// [`Orchestrator::answer`] bounded by `timeout`.
    ///
    /// On expiry the in-flight provider calls are dropped and
    /// [`Error::Timeout`] is returned. Nothing is persisted for a timed-out
    /// request.
    pub async fn answer_with_timeout(
        &self,
        question: &str,
        options: &AskOptions,
        timeout: Duration,
    ) -> Result<RagAnswer> {
        tokio::time::timeout(timeout, self.answer(question, options))
            .await
            .map_err(|_| Error::Timeout(timeout))?
    }

    /// Like [`Orchestrator::answer`], but streams the answer text.
    pub async fn answer_stream(
        &self,
        question: &str,
        options: &AskOptions,
    ) -> Result<RagStream> {
        let results = self.retrieve(question, options).await?;
        let sources = citation::citations(&results);

        if results.is_empty() {
            let (tx, rx) = mpsc::channel(1);
            let task = TaskGuard::new(tokio::spawn(async move {
                let _ = tx.send(NOT_FOUND_ANSWER.to_string()).await;
                Ok(RagAnswer::not_found())
            }));
            return Ok(RagStream {
                sources,
                tokens: rx,
                task,
            });
        }

        let request = self.request(question, &results, options);
        let (tokens, generation) = self.llm.generate_stream(&request).await?;

        let store = Arc::clone(&self.store);
        let model = options.model.clone();
        let question = question.to_string();
        let count = results.len();
        let cited = sources.clone();
        // Owning the generation guard means aborting this task aborts the
        // generation too.
        let task = TaskGuard::new(tokio::spawn(async move {
            let Generation { text, usage } = generation.await??;
            record_generation(store.as_ref(), &model, &question, count, usage)
                .await;
            Ok(RagAnswer {
                answer: text,
                sources: cited,
                usage: Some(usage),
            })
        }));

        Ok(RagStream {
            sources,
            tokens,
            task,
        })
    }

    /// Stream an answer into `on_token`, giving up after `timeout`.
    ///
    /// A timed-out stream is dropped, which aborts generation before any
    /// usage is recorded.
    pub async fn stream_with_timeout(
        &self,
        question: &str,
        options: &AskOptions,
        timeout: Duration,
        on_token: impl FnMut(&str) -> Result<()>,
    ) -> Result<RagAnswer> {
        let work = async {
            let stream = self.answer_stream(question, options).await?;
            stream.finish(on_token).await
        };
        tokio::time::timeout(timeout, work)
            .await
            .map_err(|_| Error::Timeout(timeout))?
    }

    /// Retrieve, then rerank when enabled. Thresholding happens before the
    /// rerank cutoff.
    async fn retrieve(
        &self,
        question: &str,
        options: &AskOptions,
    ) -> Result<Vec<SearchResult>> {
        let question = question.trim();
        if question.is_empty() {
            return Err(Error::EmptyQuestion);
        }

        let params = SearchParams {
            query: question.to_string(),
            limit: options.limit,
            threshold: options.threshold,
        };
        let results = self.retriever.search(&params).await?;
        tracing::info!(count = results.len(), "retrieved chunks");

        if !options.rerank || !self.reranker.is_enabled() {
            return Ok(results);
        }
        let reranked = self.reranker.rerank(question, results).await;
        if let Some(usage) = reranked.usage {
            record_best_effort(self.store.as_ref(), usage).await;
        }
        Ok(reranked.results)
    }

    fn request(
        &self,
        question: &str,
        results: &[SearchResult],
        options: &AskOptions,
    ) -> GenerateRequest {
        let prompt = build_prompt(question.trim(), &format_context(results));
        GenerateRequest::new(prompt, options.model.clone())
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("reranker", &self.reranker)
            .finish_non_exhaustive()
    }
}

async fn record_generation(
    store: &dyn IndexStore,
    model: &str,
    question: &str,
    source_count: usize,
    usage: Usage,
) {
    let mut record = TokenUsage::new(
        Operation::Generation,
        model,
        usage.total_tokens,
        UsageDetail::Query {
            question: question.to_string(),
            source_count,
        },
    );
    record.input_tokens = usage.prompt_tokens;
    record.output_tokens = usage.completion_tokens;
    record_best_effort(store, record).await;
}

/// The similarity shown to the model: rerank score, else cosine
/// similarity, else the fused score.
fn display_similarity(result: &SearchResult) -> f32 {
    result
        .rerank_score
        .or(result.vector_score)
        .unwrap_or(result.score)
}

/// Render results as tagged context documents, numbered from 1.
pub fn format_context(results: &[SearchResult]) -> String {
    if results.is_empty() {
        return EMPTY_CONTEXT.to_string();
    }

    let mut context = String::from(
        "Here are the relevant documents to help answer the question:\n\n",
    );
    for (i, r) in results.iter().enumerate() {
        context.push_str(&format!("<document index=\"{}\">\n", i + 1));
        context.push_str(&format!("  <title>{}</title>\n", r.title));
        if let Some(heading) = &r.heading {
            let section = format!("  <section>{}</section>\n", heading.text);
            context.push_str(&section);
        }
        context.push_str(&format!(
            "  <similarity>{:.1}%</similarity>\n",
            display_similarity(r) * 100.0
        ));
        context.push_str(&format!(
            "  <content><![CDATA[{}]]></content>\n",
            r.content.replace("]]>", "]]]]><![CDATA[>")
        ));
        context.push_str("</document>\n\n");
    }
    context
}

pub fn build_prompt(question: &str, context: &str) -> String {
    format!(
        "{SYSTEM_PROMPT}\n\nContext Documents:\n{context}\n\n\
         Question: {question}\n\nAnswer:"
    )
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            Mutex,
            atomic::{AtomicBool, Ordering},
        },
    };

    use async_trait::async_trait;

    use super::*;
    use crate::{
        chunking::Heading,
        embedding::tests::FakeEmbedder,
        llm::tests::FakeLlm,
        reranker::tests::{FakeRerank, score},
        search::tests::{hit, result},
        store::{
            ChunkState,
            ChunkWrite,
            DocumentMeta,
            DocumentRecord,
            SearchHit,
            StoreStats,
        },
    };

    /// Store serving fixed rankings and collecting usage records.
    #[derive(Default)]
    struct FakeStore {
        dense: Vec<SearchHit>,
        sparse: Vec<SearchHit>,
        usage: Mutex<Vec<TokenUsage>>,
        reject_usage: AtomicBool,
    }

    #[async_trait]
    impl IndexStore for FakeStore {
        async fn upsert_document(
            &self,
            _: DocumentMeta,
            _: usize,
        ) -> Result<DocumentRecord> {
            Err(Error::Config("read-only".to_string()))
        }
        async fn chunk_states(
            &self,
            _: &[String],
        ) -> Result<HashMap<String, ChunkState>> {
            Ok(HashMap::new())
        }
        async fn upsert_chunks(&self, _: Vec<ChunkWrite>) -> Result<()> {
            Err(Error::Config("read-only".to_string()))
        }
        async fn nearest(&self, _: &[f32], k: usize) -> Result<Vec<SearchHit>> {
            Ok(self.dense.iter().take(k).cloned().collect())
        }
        async fn lexical(
            &self,
            _: &[String],
            k: usize,
        ) -> Result<Vec<SearchHit>> {
            Ok(self.sparse.iter().take(k).cloned().collect())
        }
        async fn delete_document(&self, _: &str) -> Result<bool> {
            Ok(false)
        }
        async fn list_documents(&self) -> Result<Vec<DocumentRecord>> {
            Ok(Vec::new())
        }
        async fn record_usage(&self, usage: TokenUsage) -> Result<()> {
            if self.reject_usage.load(Ordering::SeqCst) {
                return Err(Error::Config("usage table locked".to_string()));
            }
            self.usage.lock().unwrap().push(usage);
            Ok(())
        }
        async fn list_usage(&self) -> Result<Vec<TokenUsage>> {
            Ok(self.usage.lock().unwrap().clone())
        }
        async fn stats(&self) -> Result<StoreStats> {
            Ok(StoreStats::default())
        }
        async fn get_setting(&self, _: &str) -> Result<Option<String>> {
            Ok(None)
        }
        async fn set_setting(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
    }

    /// Two fused results: `fetch` (both legs, about 0.033) then `cors`
    /// (dense only, about 0.016).
    fn populated_store() -> Arc<FakeStore> {
        let mut with_heading = hit("fetch", 0.92);
        with_heading.chunk.heading = Some(Heading {
            text: "Basic usage".to_string(),
            level: 2,
            line_number: 12,
        });
        Arc::new(FakeStore {
            dense: vec![with_heading.clone(), hit("cors", 0.71)],
            sparse: vec![with_heading],
            ..FakeStore::default()
        })
    }

    fn orchestrator(store: Arc<FakeStore>, llm: Arc<FakeLlm>) -> Orchestrator {
        with_reranker(store, llm, Reranker::passthrough())
    }

    fn with_reranker(
        store: Arc<FakeStore>,
        llm: Arc<FakeLlm>,
        reranker: Reranker,
    ) -> Orchestrator {
        let embedder = Arc::new(FakeEmbedder::new());
        let retriever = HybridRetriever::new(store.clone(), embedder);
        Orchestrator::new(store, retriever, reranker, llm)
    }

    async fn ask(rag: &Orchestrator, question: &str) -> RagAnswer {
        rag.answer(question, &AskOptions::default()).await.unwrap()
    }

    #[tokio::test]
    async fn zero_results_skip_the_model() {
        let store = Arc::new(FakeStore::default());
        let llm = Arc::new(FakeLlm::answering("unused"));
        let rag = orchestrator(store.clone(), llm.clone());

        let answer = ask(&rag, "What is CORS?").await;
        assert_eq!(answer.answer, NOT_FOUND_ANSWER);
        assert!(answer.sources.is_empty());
        assert!(answer.usage.is_none());
        assert_eq!(llm.calls(), 0);
        assert!(store.usage.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn answers_with_context_and_citations() {
        let store = populated_store();
        let llm = Arc::new(FakeLlm::answering("Use fetch() [1]."));
        let rag = orchestrator(store.clone(), llm.clone());

        let answer = ask(&rag, "  How do I fetch?  ").await;
        assert_eq!(answer.answer, "Use fetch() [1].");
        assert_eq!(answer.sources.len(), 2);
        assert_eq!(answer.sources[0].chunk_id, "fetch");
        assert_eq!(
            answer.sources[0].url,
            "https://developer.mozilla.org/en-US/docs/Web/fetch#basic_usage"
        );
        assert_eq!(answer.usage.unwrap().total_tokens, 120);

        let prompts = llm.prompts.lock().unwrap();
        let request = &prompts[0];
        assert!((request.temperature - 0.1).abs() < 1e-6);
        assert_eq!(request.model, "gpt-4o-mini");
        assert!(request.prompt.contains("<document index=\"1\">"));
        assert!(request.prompt.contains("<section>Basic usage</section>"));
        assert!(request.prompt.contains("<similarity>92.0%</similarity>"));
        assert!(
            request
                .prompt
                .ends_with("Question: How do I fetch?\n\nAnswer:")
        );

        let usage = store.usage.lock().unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].operation, Operation::Generation);
        assert_eq!(usage[0].input_tokens, 100);
    }

    #[tokio::test]
    async fn reranker_reorders_and_cuts_the_context() {
        let store = populated_store();
        let llm = Arc::new(FakeLlm::answering("CORS [1]."));
        let provider =
            Arc::new(FakeRerank::scoring(vec![score(1, 0.83), score(0, 0.31)]));
        let rag = with_reranker(
            store.clone(),
            llm.clone(),
            Reranker::new(provider.clone()),
        );

        let answer = ask(&rag, "cors?").await;
        let cited: Vec<_> =
            answer.sources.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(cited, vec!["cors"]);
        assert_eq!(provider.calls(), 1);

        let prompts = llm.prompts.lock().unwrap();
        assert!(prompts[0].prompt.contains("<similarity>83.0%</similarity>"));
        assert!(!prompts[0].prompt.contains("content of fetch"));

        let operations: Vec<Operation> =
            store.usage.lock().unwrap().iter().map(|u| u.operation).collect();
        assert_eq!(operations, vec![Operation::Rerank, Operation::Generation]);
    }

    #[tokio::test]
    async fn threshold_applies_before_reranking() {
        let store = populated_store();
        let llm = Arc::new(FakeLlm::answering("fetch [1]."));
        // Index 1 would be `cors`, had it survived the threshold.
        let provider =
            Arc::new(FakeRerank::scoring(vec![score(1, 0.95), score(0, 0.9)]));
        let rag = with_reranker(store, llm, Reranker::new(provider));

        let options = AskOptions {
            threshold: 0.02,
            ..AskOptions::default()
        };
        let answer = rag.answer("fetch?", &options).await.unwrap();
        let cited: Vec<_> =
            answer.sources.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(cited, vec!["fetch"]);
    }

    #[tokio::test]
    async fn cutoff_emptying_the_list_skips_the_model() {
        let store = populated_store();
        let llm = Arc::new(FakeLlm::answering("unused"));
        let provider =
            Arc::new(FakeRerank::scoring(vec![score(0, 0.2), score(1, 0.1)]));
        let rag = with_reranker(store, llm.clone(), Reranker::new(provider));

        let answer = ask(&rag, "fetch?").await;
        assert_eq!(answer.answer, NOT_FOUND_ANSWER);
        assert!(answer.sources.is_empty());
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn failing_usage_audit_does_not_fail_the_answer() {
        let store = populated_store();
        store.reject_usage.store(true, Ordering::SeqCst);
        let provider =
            Arc::new(FakeRerank::scoring(vec![score(0, 0.9), score(1, 0.8)]));
        let rag = with_reranker(
            store.clone(),
            Arc::new(FakeLlm::answering("fine")),
            Reranker::new(provider),
        );

        let answer = ask(&rag, "fetch?").await;
        assert_eq!(answer.answer, "fine");
        assert_eq!(answer.sources.len(), 2);
        assert!(store.usage.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn blank_question_is_rejected() {
        let llm = Arc::new(FakeLlm::answering("x"));
        let rag = orchestrator(populated_store(), llm);
        let err = rag.answer("   ", &AskOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::EmptyQuestion));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_generation_times_out() {
        let mut llm = FakeLlm::answering("late");
        llm.delay = Some(Duration::from_secs(60));
        let rag = orchestrator(populated_store(), Arc::new(llm));

        let timeout = Duration::from_secs(5);
        let err = rag
            .answer_with_timeout("fetch?", &AskOptions::default(), timeout)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(d) if d == timeout));
    }

    #[tokio::test]
    async fn stream_yields_tokens_then_answer() {
        let store = populated_store();
        let llm = Arc::new(FakeLlm::answering("streamed"));
        let rag = orchestrator(store.clone(), llm);

        let stream = rag
            .answer_stream("fetch?", &AskOptions::default())
            .await
            .unwrap();
        assert_eq!(stream.sources.len(), 2);
        let mut text = String::new();
        let answer = stream
            .finish(|token| {
                text.push_str(token);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(text, "streamed");
        assert_eq!(answer.answer, "streamed");
        assert_eq!(store.usage.lock().unwrap().len(), 1);
    }

    /// Streams one token, then stalls before finishing.
    struct StallingLlm;

    #[async_trait]
    impl LlmProvider for StallingLlm {
        async fn generate(
            &self,
            _: &GenerateRequest,
        ) -> Result<Generation> {
            Err(Error::Config("streaming only".to_string()))
        }

        async fn generate_stream(
            &self,
            _: &GenerateRequest,
        ) -> Result<llm::TokenStream> {
            let (tx, rx) = mpsc::channel(4);
            let task = tokio::spawn(async move {
                let _ = tx.send("partial".to_string()).await;
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Generation {
                    text: "partial answer".to_string(),
                    usage: Usage {
                        prompt_tokens: 10,
                        completion_tokens: 2,
                        total_tokens: 12,
                    },
                })
            });
            Ok((rx, TaskGuard::new(task)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_stream_records_nothing() {
        let store = populated_store();
        let embedder = Arc::new(FakeEmbedder::new());
        let retriever = HybridRetriever::new(store.clone(), embedder);
        let rag = Orchestrator::new(
            store.clone(),
            retriever,
            Reranker::passthrough(),
            Arc::new(StallingLlm),
        );

        let mut seen = Vec::new();
        let err = rag
            .stream_with_timeout(
                "fetch?",
                &AskOptions::default(),
                Duration::from_secs(5),
                |token| {
                    seen.push(token.to_string());
                    Ok(())
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(seen, vec!["partial"]);

        // Well past the point where the generation would have finished.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(store.usage.lock().unwrap().is_empty());
    }

    #[test]
    fn empty_context_placeholder() {
        assert_eq!(format_context(&[]), EMPTY_CONTEXT);
    }

    #[test]
    fn context_escapes_cdata_terminators() {
        let mut r = result("x", 0.02);
        r.content = "a ]]> b".to_string();
        let context = format_context(&[r]);
        assert!(context.contains("<![CDATA[a ]]]]><![CDATA[> b]]>"));
        assert!(context.contains("<similarity>2.0%</similarity>"));
        assert!(!context.contains("<section>"));
    }
}

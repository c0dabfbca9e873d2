use std::path::Path;

use tantivy::{
    Index,
    IndexReader,
    IndexWriter,
    TantivyDocument,
    Term,
    collector::TopDocs,
    doc,
    query::QueryParser,
    schema::*,
    tokenizer::{
        LowerCaser,
        RemoveLongFilter,
        SimpleTokenizer,
        Stemmer,
        TextAnalyzer,
    },
};

use crate::error::Result;

/// Field names used in the schema.
pub mod fields {
    pub const CHUNK_ID: &str = "chunk_id";
    pub const SOURCE: &str = "source";
    pub const CONTENT: &str = "content";
}

/// Writer memory budget used outside of tests.
pub const WRITER_BUDGET: usize = 50_000_000;

/// BM25 index over chunk content, the sparse leg of hybrid retrieval.
pub struct LexicalIndex {
    index: Index,
    reader: IndexReader,
    fields: SchemaFields,
}

/// Resolved field handles for the schema.
#[derive(Debug, Clone, Copy)]
struct SchemaFields {
    pub chunk_id: Field,
    pub source: Field,
    pub content: Field,
}

fn build_schema() -> (Schema, SchemaFields) {
    let mut builder = Schema::builder();

    let chunk_id = builder.add_text_field(fields::CHUNK_ID, STRING | STORED);
    let source = builder.add_text_field(fields::SOURCE, STRING);

    let content_opts = TextOptions::default().set_indexing_options(
        TextFieldIndexing::default()
            .set_tokenizer("en_stem")
            .set_index_option(IndexRecordOption::WithFreqsAndPositions),
    );
    let content = builder.add_text_field(fields::CONTENT, content_opts);

    let schema = builder.build();
    (
        schema,
        SchemaFields {
            chunk_id,
            source,
            content,
        },
    )
}

fn register_tokenizers(index: &Index) {
    let en_stem = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .filter(Stemmer::new(tantivy::tokenizer::Language::English))
        .build();
    index.tokenizers().register("en_stem", en_stem);
}

/// Normalize a free-text query into lexical terms.
///
/// Lowercases, replaces every character that is not alphanumeric or `_`
/// with a space, and splits on whitespace. The terms are OR-combined at
/// search time.
///
/// ```
/// use docrag::tantivy_index::lexical_terms;
///
/// assert_eq!(
///     lexical_terms("How does fetch() handle CORS?"),
///     vec!["how", "does", "fetch", "handle", "cors"]
/// );
/// ```
pub fn lexical_terms(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

impl LexicalIndex {
    /// Open or create a lexical index at the given directory.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let (schema, fields) = build_schema();

        let mmap_dir = tantivy::directory::MmapDirectory::open(dir)
            .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()))?;
        let index = if Index::exists(&mmap_dir)
            .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()))?
        {
            Index::open(mmap_dir)?
        } else {
            Index::create(mmap_dir, schema, tantivy::IndexSettings::default())?
        };

        Self::from_index(index, fields)
    }

    /// Create an in-memory lexical index (for testing).
    pub fn open_in_ram() -> Result<Self> {
        let (schema, fields) = build_schema();
        Self::from_index(Index::create_in_ram(schema), fields)
    }

    fn from_index(index: Index, fields: SchemaFields) -> Result<Self> {
        register_tokenizers(&index);
        let reader = index.reader()?;
        Ok(Self {
            index,
            reader,
            fields,
        })
    }

    /// Create a writer with the given memory budget (in bytes).
    pub fn writer(&self, memory_budget: usize) -> Result<IndexWriter> {
        Ok(self.index.writer(memory_budget)?)
    }

    /// Index a chunk, replacing any previous entry with the same id.
    pub fn add_chunk(
        &self,
        writer: &IndexWriter,
        chunk_id: &str,
        source: &str,
        content: &str,
    ) -> Result<()> {
        let f = self.fields;
        writer.delete_term(Term::from_field_text(f.chunk_id, chunk_id));
        writer.add_document(doc!(
            f.chunk_id => chunk_id,
            f.source => source,
            f.content => content,
        ))?;
        Ok(())
    }

    pub fn delete_chunk(&self, writer: &IndexWriter, chunk_id: &str) {
        let term = Term::from_field_text(self.fields.chunk_id, chunk_id);
        writer.delete_term(term);
    }

    /// Delete every chunk of a source document.
    pub fn delete_source(&self, writer: &IndexWriter, source: &str) {
        writer.delete_term(Term::from_field_text(self.fields.source, source));
    }

    /// BM25 search for any of `terms`.
    ///
    /// Returns `(chunk_id, score)` pairs, best first. No terms means no
    /// results.
    pub fn search(
        &self,
        terms: &[String],
        limit: usize,
    ) -> Result<Vec<(String, f32)>> {
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let f = self.fields;
        self.reader.reload()?;
        let searcher = self.reader.searcher();

        let parser = QueryParser::for_index(&self.index, vec![f.content]);
        let (query, errors) = parser.parse_query_lenient(&terms.join(" "));
        if !errors.is_empty() {
            tracing::debug!(?errors, "lenient lexical query parse");
        }
        let top_docs = searcher.search(&query, &TopDocs::with_limit(limit))?;

        let mut results = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            let doc: TantivyDocument = searcher.doc(doc_address)?;
            results.push((extract_text(&doc, f.chunk_id), score));
        }
        Ok(results)
    }

    /// Number of live (non-deleted) chunks in the index.
    pub fn num_chunks(&self) -> Result<u64> {
        self.reader.reload()?;
        Ok(self.reader.searcher().num_docs())
    }
}

impl std::fmt::Debug for LexicalIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LexicalIndex").finish_non_exhaustive()
    }
}

fn extract_text(doc: &TantivyDocument, field: Field) -> String {
    doc.get_first(field)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

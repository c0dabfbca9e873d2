use std::path::PathBuf;

use rmcp::{
    ServiceExt,
    model::CallToolRequestParams,
    transport::{ConfigureCommandExt, TokioChildProcess},
};
use serde_json::json;

#[tokio::test]
async fn mcp_stdio_lists_tools_and_reports_missing_chat_key()
-> Result<(), Box<dyn std::error::Error>> {
    let tempdir = tempfile::tempdir()?;

    let bin = docrag_bin()?;
    let transport = TokioChildProcess::new(
        tokio::process::Command::new(bin).configure(|cmd| {
            cmd.arg("mcp")
                .env("DOCRAG_DATA_DIR", tempdir.path())
                .env("VOYAGE_API_KEY", "test-key")
                .env("DOCRAG_LOG", "error")
                .env_remove("OPENAI_API_KEY");
        }),
    )?;

    let client = ().serve(transport).await?;

    let tools = client.peer().list_all_tools().await?;
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_ref()).collect();
    assert!(names.contains(&"search_docs"));
    assert!(names.contains(&"query_knowledge_base"));

    let args = json!({ "message": "How do I cancel a fetch?" });
    let result = client
        .peer()
        .call_tool(
            CallToolRequestParams::new("query_knowledge_base")
                .with_arguments(args.as_object().unwrap().clone()),
        )
        .await?;

    assert_eq!(result.is_error, Some(true));
    let text = result
        .content
        .first()
        .and_then(|c| c.as_text())
        .map(|t| t.text.clone())
        .unwrap_or_default();
    assert!(text.contains("OPENAI_API_KEY"));

    client.cancel().await?;
    Ok(())
}

fn docrag_bin() -> Result<PathBuf, Box<dyn std::error::Error>> {
    if let Ok(bin) = std::env::var("CARGO_BIN_EXE_docrag") {
        return Ok(PathBuf::from(bin));
    }

    let mut path = std::env::current_exe()?;
    path.pop();
    if path.ends_with("deps") {
        path.pop();
    }
    path.push("docrag");

    if cfg!(windows) {
        path.set_extension("exe");
    }

    Ok(path)
}

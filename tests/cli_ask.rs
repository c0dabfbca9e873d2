use std::{
    path::{Path, PathBuf},
    process::{Command, Output},
};

fn ask(data_dir: &Path, voyage_key: Option<&str>) -> Output {
    let mut cmd = Command::new(docrag_bin());
    cmd.args(["ask", "How do I cancel a fetch?"])
        .env("DOCRAG_DATA_DIR", data_dir)
        .env("DOCRAG_LOG", "error")
        .env_remove("OPENAI_API_KEY")
        .env_remove("VOYAGE_API_KEY");
    if let Some(key) = voyage_key {
        cmd.env("VOYAGE_API_KEY", key);
    }
    cmd.output().expect("failed to run docrag")
}

#[test]
fn ask_without_voyage_key_exits_with_failure() {
    let tempdir = tempfile::tempdir().unwrap();
    let output = ask(tempdir.path(), None);

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("error: missing credential: set VOYAGE_API_KEY"),
        "stderr: {stderr}"
    );
    assert!(output.stdout.is_empty());
}

#[test]
fn ask_without_openai_key_exits_with_failure() {
    let tempdir = tempfile::tempdir().unwrap();
    let output = ask(tempdir.path(), Some("test-key"));

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("error: missing credential: set OPENAI_API_KEY"),
        "stderr: {stderr}"
    );
}

fn docrag_bin() -> PathBuf {
    if let Some(bin) = option_env!("CARGO_BIN_EXE_docrag") {
        return PathBuf::from(bin);
    }

    let mut path = std::env::current_exe().unwrap();
    path.pop();
    if path.ends_with("deps") {
        path.pop();
    }
    path.push("docrag");

    if cfg!(windows) {
        path.set_extension("exe");
    }

    path
}

//! Model worker speaking length-prefixed JSON frames on stdin/stdout.
//!
//! Usage: lmlayer-worker [--model-dir <dir>]
//!
//! Model identifiers in `initialize` are JSON model files, resolved against
//! `--model-dir` when relative.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};

use lmlayer::{FileModelLoader, LMLAYER_VERSION, logging, run_worker_stdio};

fn parse_args(args: &[String]) -> anyhow::Result<Option<PathBuf>> {
    let mut model_dir = None;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--model-dir" => {
                i += 1;
                let dir = args.get(i).context("--model-dir requires a value")?;
                model_dir = Some(PathBuf::from(dir));
            }
            arg => bail!("unexpected argument: {arg}"),
        }
        i += 1;
    }
    Ok(model_dir)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let model_dir = parse_args(&args)?;

    let mut loader = FileModelLoader::new();
    if let Some(dir) = model_dir {
        loader = loader.with_base_dir(dir);
    }

    tracing::info!(version = LMLAYER_VERSION, "lmlayer worker starting");
    run_worker_stdio(Arc::new(loader))
        .await
        .context("worker terminated")?;
    Ok(())
}

//! Command-line surface for the engine
//!
//! Exit codes: 0 success, 1 user error, 2 store error, 3 provider error.

use docent::{Dataset, Engine, EngineConfig, EngineError};
use std::path::Path;
use std::process::ExitCode;

const USAGE: &str = "\
docent: hybrid retrieval-augmented reasoning over documents

Usage:
  docent ingest <path>            Ingest a document, print its id
  docent query <question>         Answer a question, print the answer JSON
  docent list                     Enumerate ingested documents
  docent delete <id>              Cascade-delete a document
  docent eval <dataset> [--judge] Run an evaluation dataset, print the report

Configuration is read from DOCENT_CONFIG (json/toml/yaml) when set, with
DOCENT_* environment overrides (e.g. DOCENT_PROVIDER__API_KEY).";

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(exit_code(&e))
        }
    }
}

fn exit_code(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<EngineError>() {
        Some(engine_error) => match engine_error.category() {
            "store" => 2,
            "provider" => 3,
            _ => 1,
        },
        None => 1,
    }
}

async fn run(args: Vec<String>) -> anyhow::Result<()> {
    let command = args.first().map(String::as_str);

    let config = match std::env::var("DOCENT_CONFIG") {
        Ok(path) => EngineConfig::load(Some(path))?,
        Err(_) => EngineConfig::load(None::<&str>)?,
    };

    match command {
        Some("ingest") => {
            let path = args
                .get(1)
                .ok_or_else(|| anyhow::anyhow!("ingest requires a file path\n\n{USAGE}"))?;
            let engine = Engine::new(config).await?;
            let outcome = engine.ingest(Path::new(path)).await?;
            if outcome.changed {
                println!(
                    "{} ({} chunks)",
                    outcome.document_id, outcome.chunks_inserted
                );
            } else {
                println!("{} (unchanged)", outcome.document_id);
            }
            Ok(())
        }

        Some("query") => {
            let question = args
                .get(1)
                .ok_or_else(|| anyhow::anyhow!("query requires a question\n\n{USAGE}"))?;
            let engine = Engine::new(config).await?;
            let answer = engine.query(question).await?;
            println!("{}", serde_json::to_string_pretty(&answer)?);
            Ok(())
        }

        Some("list") => {
            let engine = Engine::new(config).await?;
            let documents = engine.list_documents().await?;
            if documents.is_empty() {
                println!("no documents ingested");
                return Ok(());
            }
            for doc in documents {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    doc.id,
                    doc.status.as_str(),
                    doc.format,
                    doc.language.as_deref().unwrap_or("-"),
                    doc.path
                );
            }
            Ok(())
        }

        Some("delete") => {
            let id: i64 = args
                .get(1)
                .ok_or_else(|| anyhow::anyhow!("delete requires a document id\n\n{USAGE}"))?
                .parse()
                .map_err(|_| anyhow::anyhow!("document id must be an integer"))?;
            let engine = Engine::new(config).await?;
            engine.delete_document(id).await?;
            println!("deleted {id}");
            Ok(())
        }

        Some("eval") => {
            let dataset_path = args
                .get(1)
                .ok_or_else(|| anyhow::anyhow!("eval requires a dataset file\n\n{USAGE}"))?;
            let use_judge = args.iter().any(|a| a == "--judge");

            let dataset = Dataset::from_file(dataset_path)?;
            let engine = Engine::new(config).await?;
            let evaluator = if use_judge {
                engine.evaluator().with_judge()
            } else {
                engine.evaluator()
            };
            let report = evaluator.run(&dataset).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }

        Some("help") | Some("--help") | Some("-h") => {
            println!("{USAGE}");
            Ok(())
        }

        Some(other) => Err(anyhow::anyhow!("unknown command {other:?}\n\n{USAGE}")),
        None => Err(anyhow::anyhow!("{USAGE}")),
    }
}

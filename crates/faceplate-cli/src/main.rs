use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;
use std::sync::Arc;

use clap::{Parser as ClapParser, Subcommand};
use faceplate::engine::BindingRuntime;
use faceplate::script::parser::{parse_expression, parse_module, parse_script, parse_transform};
use faceplate::{BindingGraph, ExpressionMode, FaceplateRecord, MemoryStore};

#[derive(ClapParser)]
#[command(name = "faceplate")]
#[command(about = "Check and evaluate faceplate binding documents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that every script, module and transform in a faceplate
    /// document compiles
    Check {
        /// Path to a faceplate JSON document
        file: PathBuf,
    },
    /// Evaluate a faceplate document against an entity snapshot and print
    /// the binding value map
    Eval {
        /// Path to a faceplate JSON document
        file: PathBuf,
        /// Path to an entity snapshot JSON file
        #[arg(long)]
        entities: PathBuf,
        /// Entity id to bind
        #[arg(long)]
        entity: String,
    },
    /// Print the compiled binding graph: expression keys, dependency index
    /// and fan-out
    Graph {
        /// Path to a faceplate JSON document
        file: PathBuf,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Check { file } => check_document(&file),
        Commands::Eval {
            file,
            entities,
            entity,
        } => eval_document(&file, &entities, &entity).await,
        Commands::Graph { file } => print_graph(&file),
    }
}

fn load_record(file: &PathBuf) -> Result<FaceplateRecord, String> {
    let raw = fs::read_to_string(file)
        .map_err(|error| format!("cannot read {}: {error}", file.display()))?;
    serde_json::from_str(&raw)
        .map_err(|error| format!("malformed faceplate document {}: {error}", file.display()))
}

fn check_document(file: &PathBuf) -> ExitCode {
    let record = match load_record(file) {
        Ok(record) => record,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };

    let mut failures = 0usize;
    for module in &record.modules {
        if let Err(error) = parse_module(&module.source, &module.name) {
            eprintln!("{error}");
            failures += 1;
        }
    }

    for binding in &record.bindings {
        let context = format!("{}:{}", binding.component, binding.property);
        let mode = binding
            .mode
            .unwrap_or_else(|| ExpressionMode::infer(&binding.expression));
        let result = match mode {
            ExpressionMode::Literal => Ok(()),
            ExpressionMode::Field => {
                parse_expression(binding.expression.trim(), &context).map(|_| ())
            }
            ExpressionMode::Script => {
                let source = binding
                    .expression
                    .trim()
                    .strip_prefix("script:")
                    .unwrap_or(binding.expression.trim());
                parse_script(source, &context).map(|_| ())
            }
        };
        if let Err(error) = result {
            eprintln!("{error}");
            failures += 1;
        }
        if let Some(transform) = &binding.transform {
            if let Err(error) = parse_transform(transform, &context) {
                eprintln!("{error}");
                failures += 1;
            }
        }
    }

    if failures == 0 {
        println!(
            "ok: {} binding(s), {} module(s)",
            record.bindings.len(),
            record.modules.len()
        );
        ExitCode::SUCCESS
    } else {
        eprintln!("{failures} compile failure(s)");
        ExitCode::FAILURE
    }
}

async fn eval_document(file: &PathBuf, entities: &PathBuf, entity: &str) -> ExitCode {
    let record = match load_record(file) {
        Ok(record) => record,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };

    let snapshot: serde_json::Value = match fs::read_to_string(entities)
        .map_err(|error| format!("cannot read {}: {error}", entities.display()))
        .and_then(|raw| {
            serde_json::from_str(&raw)
                .map_err(|error| format!("malformed entity snapshot: {error}"))
        }) {
        Ok(snapshot) => snapshot,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };

    let store = Rc::new(MemoryStore::new());
    if let Err(error) = store.load_entities_json(&snapshot) {
        eprintln!("{error}");
        return ExitCode::FAILURE;
    }

    let runtime = BindingRuntime::new(store.clone() as Rc<dyn faceplate::DataStore>);
    runtime.load_faceplate(&record);
    runtime
        .evaluate_all_bindings(Some(Arc::from(entity)), Some(Arc::from(record.id.as_str())))
        .await;
    runtime.register_notifications().await;

    let values: serde_json::Map<String, serde_json::Value> = runtime
        .binding_values()
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_json()))
        .collect();
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::Value::Object(values))
            .expect("slot map serializes")
    );

    for error in runtime.compile_errors() {
        eprintln!("compile error in {}: {}", error.context, error.message);
    }
    for error in runtime.runtime_errors() {
        eprintln!("runtime error in {}: {}", error.context, error.message);
    }
    ExitCode::SUCCESS
}

fn print_graph(file: &PathBuf) -> ExitCode {
    let record = match load_record(file) {
        Ok(record) => record,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };

    let graph = BindingGraph::build(&record.bindings);
    let expressions: Vec<serde_json::Value> = graph
        .metadata
        .iter()
        .map(|(key, meta)| {
            let targets: Vec<String> = graph
                .targets
                .get(key)
                .map(|targets| {
                    targets
                        .iter()
                        .map(|target| format!("{}:{}", target.component, target.property))
                        .collect()
                })
                .unwrap_or_default();
            serde_json::json!({
                "key": key.to_string(),
                "mode": meta.mode.to_string(),
                "dependencies": meta.dependencies.iter().map(|d| d.to_string()).collect::<Vec<_>>(),
                "targets": targets,
            })
        })
        .collect();
    let index: serde_json::Map<String, serde_json::Value> = graph
        .dependency_index
        .iter()
        .map(|(dependency, keys)| {
            (
                dependency.to_string(),
                serde_json::Value::Array(
                    keys.iter()
                        .map(|key| serde_json::Value::String(key.to_string()))
                        .collect(),
                ),
            )
        })
        .collect();

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "expressions": expressions,
            "dependencyIndex": index,
        }))
        .expect("graph serializes")
    );
    ExitCode::SUCCESS
}

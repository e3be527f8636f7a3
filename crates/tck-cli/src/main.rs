use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tck_core::{cast, flatten, unflatten, FieldType, UCode, PATH_SEPARATOR};
use tck_runner::{build_invocation, launch, AgentKind};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tck", version = "0.2.0", about = "Protocol conformance harness utilities")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum AgentKindArg {
    #[value(name = "python")]
    Python,
    #[value(name = "java")]
    Java,
    #[value(name = "rust")]
    Rust,
    #[value(name = "cpp")]
    Cpp,
}

impl From<AgentKindArg> for AgentKind {
    fn from(value: AgentKindArg) -> Self {
        match value {
            AgentKindArg::Python => AgentKind::Python,
            AgentKindArg::Java => AgentKind::Java,
            AgentKindArg::Rust => AgentKind::Rust,
            AgentKindArg::Cpp => AgentKind::Cpp,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FieldTypeArg {
    #[value(name = "int")]
    Int,
    #[value(name = "str")]
    Str,
    #[value(name = "bool")]
    Bool,
    #[value(name = "float")]
    Float,
    #[value(name = "bytes")]
    Bytes,
    #[value(name = "enumCode")]
    EnumCode,
}

impl From<FieldTypeArg> for FieldType {
    fn from(value: FieldTypeArg) -> Self {
        match value {
            FieldTypeArg::Int => FieldType::Int,
            FieldTypeArg::Str => FieldType::Str,
            FieldTypeArg::Bool => FieldType::Bool,
            FieldTypeArg::Float => FieldType::Float,
            FieldTypeArg::Bytes => FieldType::Bytes,
            FieldTypeArg::EnumCode => FieldType::EnumCode,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print the invocation for an agent without starting it.
    Invocation {
        #[arg(value_enum)]
        kind: AgentKindArg,
        #[arg(long, default_value = "socket")]
        transport: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        artifact: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Start an agent process and print its pid.
    Launch {
        #[arg(value_enum)]
        kind: AgentKindArg,
        #[arg(long, default_value = "socket")]
        transport: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        artifact: Option<PathBuf>,
    },
    /// Cast a scenario literal to its declared protocol type.
    Cast {
        value: String,
        #[arg(value_enum)]
        field_type: FieldTypeArg,
        /// Encode bytes directly instead of the JSON-safe sentinel form.
        #[arg(long)]
        raw_bytes: bool,
    },
    /// Flatten a nested JSON document into dotted paths.
    Flatten { file: PathBuf },
    /// Rebuild a nested JSON document from dotted paths.
    Unflatten { file: PathBuf },
    /// Resolve a protocol status code name to its number.
    Code { name: String },
}

fn agent_invocation(
    kind: AgentKindArg,
    transport: &str,
    name: Option<String>,
    artifact: Option<PathBuf>,
) -> Result<tck_runner::InvocationSpec> {
    let kind: AgentKind = kind.into();
    let name = name.unwrap_or_else(|| kind.label().to_string());
    let artifact = artifact.unwrap_or_else(|| PathBuf::from(kind.default_artifact()));
    Ok(build_invocation(&artifact, transport, &name)?)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Invocation {
            kind,
            transport,
            name,
            artifact,
            json,
        } => {
            let spec = agent_invocation(kind, &transport, name, artifact)?;
            if json {
                println!("{}", serde_json::to_string(&json!({"command": spec.command}))?);
            } else {
                println!("{}", spec.command.join(" "));
            }
        }
        Commands::Launch {
            kind,
            transport,
            name,
            artifact,
        } => {
            let spec = agent_invocation(kind, &transport, name, artifact)?;
            let child = launch(&spec)?;
            println!("launched pid {}", child.id());
        }
        Commands::Cast {
            value,
            field_type,
            raw_bytes,
        } => {
            let casted = cast(&value, field_type.into(), !raw_bytes)?;
            println!("{}", casted.to_json());
        }
        Commands::Flatten { file } => {
            let doc: Value = serde_json::from_str(&fs::read_to_string(&file)?)?;
            let flat = flatten(&doc, PATH_SEPARATOR);
            let flat: Value = flat
                .into_iter()
                .collect::<serde_json::Map<String, Value>>()
                .into();
            println!("{}", serde_json::to_string_pretty(&flat)?);
        }
        Commands::Unflatten { file } => {
            let doc: Value = serde_json::from_str(&fs::read_to_string(&file)?)?;
            let entries: BTreeMap<String, Value> = match doc {
                Value::Object(map) => map.into_iter().collect(),
                other => anyhow::bail!("expected a JSON object of dotted paths, got {other}"),
            };
            let nested = unflatten(&entries, PATH_SEPARATOR)?;
            println!("{}", serde_json::to_string_pretty(&nested)?);
        }
        Commands::Code { name } => {
            let code = UCode::from_name(&name)?;
            println!("{} = {}", code.name(), code.code());
        }
    }
    Ok(())
}

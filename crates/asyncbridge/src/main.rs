//! asyncbridge.
//!
//! Validates AsyncAPI descriptions, resolves bindings and runs a single
//! binding against its broker.

use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use asyncbridge::{BridgeConfig, BridgeNode};
use asyncbridge_broker::{client_for_protocol, OutputMessage};
use asyncbridge_spec::{parse_document_file, resolve_selection, Document, ParseError, Selection};
use asyncbridge_telemetry::{LogFormat, Telemetry};

#[derive(Parser, Debug)]
#[command(name = "asyncbridge", about = "AsyncAPI-driven broker bindings", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate AsyncAPI description(s).
    ///
    /// Reports parse and structure errors (E1000-E1003) and binding
    /// warnings (E1020-E1022).
    Validate {
        /// Input description file(s) (YAML or JSON).
        #[arg(short, long, required = true, num_args = 1..)]
        spec: Vec<String>,

        /// Output format (text or json).
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Print the parsed document as JSON.
    Inspect {
        /// Input description file (YAML or JSON).
        #[arg(short, long)]
        spec: String,
    },

    /// Resolve a channel and operation into a binding and print it as JSON.
    Resolve {
        /// Input description file (YAML or JSON).
        #[arg(short, long)]
        spec: String,

        /// Channel address or key.
        #[arg(long)]
        channel: String,

        /// Operation id.
        #[arg(long)]
        operation: String,

        /// Server name (defaults to the first server).
        #[arg(long)]
        server: Option<String>,

        /// Server URL override.
        #[arg(long)]
        server_url: Option<String>,

        /// Topic override.
        #[arg(long)]
        topic: Option<String>,

        /// Message name (defaults to the operation's first message).
        #[arg(long)]
        message: Option<String>,

        /// Channel parameter value as `name=value`. Repeatable.
        #[arg(long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,
    },

    /// Run one binding: stdin lines in, received messages out.
    ///
    /// Each stdin line is a JSON payload handed to the binding. Received
    /// messages are written to stdout as JSON lines. Logs go to stderr.
    Run {
        /// Path to the bridge configuration (TOML).
        #[arg(short, long)]
        config: String,

        /// Channel override.
        #[arg(long)]
        channel: Option<String>,

        /// Operation override.
        #[arg(long)]
        operation: Option<String>,

        /// Server URL override.
        #[arg(long, env = "ASYNCBRIDGE_SERVER_URL")]
        server_url: Option<String>,

        /// Topic override.
        #[arg(long)]
        topic: Option<String>,

        /// Log level.
        #[arg(long, env = "ASYNCBRIDGE_LOG_LEVEL")]
        log_level: Option<String>,

        /// Log format (json or pretty).
        #[arg(long)]
        log_format: Option<String>,

        /// Exit after forwarding this many received messages.
        #[arg(long)]
        count: Option<u64>,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected name=value, got '{}'", s)),
    }
}

fn print_json(value: &impl Serialize) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: failed to serialize output: {}", e);
            ExitCode::from(1)
        }
    }
}

fn load(spec: &str) -> Result<Document, ExitCode> {
    parse_document_file(Path::new(spec)).map_err(|e| {
        eprintln!("error: {}: {}", spec, e);
        ExitCode::from(1)
    })
}

/// Validation result for a single description.
#[derive(Serialize)]
struct ValidationResult {
    file: String,
    valid: bool,
    errors: Vec<ValidationIssue>,
    warnings: Vec<ValidationIssue>,
}

#[derive(Serialize)]
struct ValidationIssue {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<String>,
}

/// Binding-level warnings for a document that parsed cleanly.
fn document_warnings(spec_path: &str, doc: &Document) -> Vec<ValidationIssue> {
    let mut warnings = Vec::new();

    for server in &doc.servers {
        if client_for_protocol(&server.protocol).is_err() {
            warnings.push(ValidationIssue {
                code: "E1020".to_string(),
                message: format!(
                    "server '{}' uses protocol '{}', which has no broker client",
                    server.name, server.protocol
                ),
                location: Some(format!("{}:servers/{}", spec_path, server.name)),
            });
        }
    }

    for channel in &doc.channels {
        if channel.address.contains('{') {
            warnings.push(ValidationIssue {
                code: "E1021".to_string(),
                message: format!(
                    "address '{}' has placeholders; they are sent verbatim unless parameters are selected",
                    channel.address
                ),
                location: Some(format!("{}:channels/{}", spec_path, channel.name)),
            });
        }

        for op in &channel.operations {
            if op.messages.is_empty() {
                warnings.push(ValidationIssue {
                    code: "E1022".to_string(),
                    message: format!("operation '{}' declares no messages", op.id),
                    location: Some(format!("{}:operations/{}", spec_path, op.id)),
                });
            }
        }
    }

    warnings
}

/// Run the validate command.
fn run_validate(specs: &[String], output_format: &str) -> ExitCode {
    let mut results = Vec::new();
    let mut has_errors = false;

    for spec_path in specs {
        match parse_document_file(Path::new(spec_path)) {
            Ok(doc) => {
                results.push(ValidationResult {
                    file: spec_path.clone(),
                    valid: true,
                    errors: Vec::new(),
                    warnings: document_warnings(spec_path, &doc),
                });
            }
            Err(e) => {
                let code = match &e {
                    ParseError::Io(_) => "E1000",
                    ParseError::MalformedInput(_) => "E1001",
                    ParseError::SchemaInvalid(_) => "E1002",
                    ParseError::UnresolvedRef(_) => "E1003",
                };
                has_errors = true;
                results.push(ValidationResult {
                    file: spec_path.clone(),
                    valid: false,
                    errors: vec![ValidationIssue {
                        code: code.to_string(),
                        message: e.to_string(),
                        location: Some(spec_path.clone()),
                    }],
                    warnings: Vec::new(),
                });
            }
        }
    }

    if output_format == "json" {
        let output = serde_json::json!({
            "results": results,
            "summary": {
                "total": results.len(),
                "valid": results.iter().filter(|r| r.valid).count(),
                "invalid": results.iter().filter(|r| !r.valid).count(),
            }
        });
        let code = print_json(&output);
        if !has_errors {
            return code;
        }
    } else {
        for result in &results {
            if result.valid && result.warnings.is_empty() {
                eprintln!("✓ {} is valid", result.file);
            } else if result.valid {
                eprintln!(
                    "✓ {} is valid (with {} warning(s))",
                    result.file,
                    result.warnings.len()
                );
            } else {
                eprintln!("✗ {} has {} error(s)", result.file, result.errors.len());
            }

            for err in &result.errors {
                match &err.location {
                    Some(loc) => eprintln!("  {} [{}]: {}", err.code, loc, err.message),
                    None => eprintln!("  {}: {}", err.code, err.message),
                }
            }
            for warn in &result.warnings {
                match &warn.location {
                    Some(loc) => eprintln!("  {} [{}]: {} (warning)", warn.code, loc, warn.message),
                    None => eprintln!("  {}: {} (warning)", warn.code, warn.message),
                }
            }
        }

        let valid_count = results.iter().filter(|r| r.valid).count();
        let total = results.len();
        eprintln!();
        eprintln!(
            "validated {} document(s): {} valid, {} invalid",
            total,
            valid_count,
            total - valid_count
        );
    }

    if has_errors {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}

fn run_inspect(spec: &str) -> ExitCode {
    match load(spec) {
        Ok(doc) => print_json(&doc),
        Err(code) => code,
    }
}

fn run_resolve(spec: &str, selection: &Selection) -> ExitCode {
    let doc = match load(spec) {
        Ok(doc) => doc,
        Err(code) => return code,
    };
    match resolve_selection(&doc, selection) {
        Ok(binding) => print_json(&binding),
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::from(1)
        }
    }
}

/// CLI overrides for `run`.
struct RunOverrides {
    channel: Option<String>,
    operation: Option<String>,
    server_url: Option<String>,
    topic: Option<String>,
    log_level: Option<String>,
    log_format: Option<String>,
}

impl RunOverrides {
    fn apply(self, config: &mut BridgeConfig) -> Result<(), String> {
        let selection = &mut config.selection;
        if let Some(channel) = self.channel {
            selection.channel = channel;
        }
        if let Some(operation) = self.operation {
            selection.operation = operation;
        }
        if self.server_url.is_some() {
            selection.server_url = self.server_url;
        }
        if self.topic.is_some() {
            selection.topic = self.topic;
        }
        if let Some(level) = self.log_level {
            config.telemetry.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.telemetry.log_format = LogFormat::parse(&format)
                .ok_or_else(|| format!("invalid log format '{}' (expected json or pretty)", format))?;
        }
        Ok(())
    }
}

/// Hand one stdin line to the node. Blank lines are skipped.
async fn dispatch_line(node: &BridgeNode, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let payload: serde_json::Value = match serde_json::from_str(line) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(error = %e, "stdin line is not JSON, skipping");
            return;
        }
    };
    if let Err(e) = node.handle_input(&payload).await {
        tracing::warn!(error = %e, "input not dispatched");
    }
}

fn write_output(message: &OutputMessage) {
    match serde_json::to_string(message) {
        Ok(line) => println!("{}", line),
        Err(e) => tracing::error!(topic = %message.topic, error = %e, "failed to serialize message"),
    }
}

/// Run the run command.
///
/// Stops on Ctrl-C, after `count` forwarded messages, or at stdin EOF when
/// the binding does not listen.
async fn run_bridge(config_path: &str, overrides: RunOverrides, count: Option<u64>) -> ExitCode {
    let mut config = match BridgeConfig::load(Path::new(config_path)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(1);
        }
    };
    if let Err(e) = overrides.apply(&mut config) {
        eprintln!("error: {}", e);
        return ExitCode::from(1);
    }

    let telemetry = match Telemetry::init(config.telemetry.telemetry_config()) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(1);
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<OutputMessage>();
    let node = match BridgeNode::from_config(&config, tx) {
        Ok(node) => node,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(1);
        }
    };

    if let Err(e) = node.start().await {
        eprintln!("error: {}", e);
        node.close().await;
        return ExitCode::from(1);
    }

    let connect_timeout = Duration::from_millis(config.connection.connect_timeout_ms);
    if !node.wait_connected(connect_timeout).await {
        tracing::warn!(
            server_url = %node.binding().server_url,
            "broker not connected yet; input fails until it is"
        );
    }

    let listens = node.listens();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut forwarded: u64 = 0;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("interrupted, shutting down");
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => dispatch_line(&node, &line).await,
                Ok(None) => {
                    stdin_open = false;
                    if !listens {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read stdin");
                    stdin_open = false;
                    if !listens {
                        break;
                    }
                }
            },
            Some(message) = rx.recv() => {
                write_output(&message);
                forwarded += 1;
                if count.is_some_and(|n| forwarded >= n) {
                    break;
                }
            }
        }
    }

    node.close().await;
    telemetry.shutdown();
    ExitCode::SUCCESS
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { spec, format } => run_validate(&spec, &format),
        Commands::Inspect { spec } => run_inspect(&spec),
        Commands::Resolve {
            spec,
            channel,
            operation,
            server,
            server_url,
            topic,
            message,
            params,
        } => {
            let selection = Selection {
                server,
                server_url,
                topic,
                message,
                parameters: params.into_iter().collect(),
                ..Selection::new(channel, operation)
            };
            run_resolve(&spec, &selection)
        }
        Commands::Run {
            config,
            channel,
            operation,
            server_url,
            topic,
            log_level,
            log_format,
            count,
        } => {
            let overrides = RunOverrides {
                channel,
                operation,
                server_url,
                topic,
                log_level,
                log_format,
            };
            run_bridge(&config, overrides, count).await
        }
    }
}

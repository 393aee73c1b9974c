//! Inspect how `fncall` reads model output.
//!
//! Every subcommand reads a model response from a file argument or stdin and
//! prints pretty JSON on stdout. Logs go to stderr.
//!
//! # Examples
//!
//! ```sh
//! # Which tool calls does a response contain?
//! fncall parse response.txt --format xml
//!
//! # Run the repair pipeline over malformed output
//! echo "{name: 'list_directory', arguments: {path: '.'}}" | fncall repair
//!
//! # Where would the next token of a partial JSON document land?
//! printf '{"users": [' | fncall context
//!
//! # Bias map for a preset, nudged for a partial document
//! fncall bias --preset aggressive --partial '{"a": '
//! ```

use clap::{Parser, Subcommand};
use fncall::ToolFormat;
use fncall::bias::{
    BiasPreset, ContextualBiasConfig, LogitBiasCalculator, LogitBiasConfig, detect_json_context,
};
use fncall::protocol::ToolProtocol;
use fncall::repair::JsonRepairParser;
use serde::Serialize;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process;
use tracing::{Level, debug};

#[derive(Parser)]
#[command(name = "fncall", about = "Parse, repair, and bias tool-calling model output")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse tool calls out of a model response
    Parse {
        /// File holding the response (stdin when omitted)
        input: Option<PathBuf>,

        /// Dialect to try first
        #[arg(long, value_enum, default_value = "xml")]
        format: ToolFormat,
    },

    /// Recover tool calls from malformed JSON
    Repair {
        /// File holding the response (stdin when omitted)
        input: Option<PathBuf>,
    },

    /// Detect the JSON context at the end of a partial document
    Context {
        /// File holding the partial document (stdin when omitted)
        input: Option<PathBuf>,
    },

    /// Print the bias map for a preset
    Bias {
        /// Bias strength
        #[arg(long, value_enum, default_value = "moderate")]
        preset: BiasPreset,

        /// Partial output to apply contextual nudges for
        #[arg(long)]
        partial: Option<String>,
    },
}

#[derive(Serialize)]
struct ParseOutput {
    format: ToolFormat,
    calls: Vec<fncall::ToolCall>,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    if let Err(e) = run(cli.command) {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

fn run(command: Command) -> Result<(), String> {
    let output = match command {
        Command::Parse { input, format } => {
            let text = read_input(input.as_ref())?;
            let (calls, format) = ToolProtocol::new().parse(&text, format);
            debug!("parsed {} call(s) as {format}", calls.len());
            to_json(&ParseOutput { format, calls })?
        }
        Command::Repair { input } => {
            let text = read_input(input.as_ref())?;
            to_json(&JsonRepairParser::new().repair_and_parse(&text))?
        }
        Command::Context { input } => {
            let text = read_input(input.as_ref())?;
            to_json(&serde_json::json!({ "context": detect_json_context(&text) }))?
        }
        Command::Bias { preset, partial } => {
            let calculator = LogitBiasCalculator::new();
            let config = LogitBiasConfig::preset(preset);
            let bias = match partial {
                Some(ref partial) => calculator.generate_contextual_bias(
                    partial,
                    &ContextualBiasConfig::default(),
                    &config,
                ),
                None => calculator.generate_json_bias(&config),
            };
            to_json(&calculator.describe(&bias))?
        }
    };
    println!("{output}");
    Ok(())
}

fn read_input(path: Option<&PathBuf>) -> Result<String, String> {
    match path {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read '{}': {e}", path.display())),
        None => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .map_err(|e| format!("failed to read stdin: {e}"))?;
            Ok(buf)
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("failed to serialize output: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_and_preset_are_value_enums() {
        let cli = Cli::try_parse_from(["fncall", "parse", "--format", "json"]).unwrap();
        assert!(matches!(cli.command, Command::Parse { format: ToolFormat::Json, .. }));

        let cli = Cli::try_parse_from(["fncall", "parse"]).unwrap();
        assert!(matches!(cli.command, Command::Parse { format: ToolFormat::Xml, .. }));

        let cli = Cli::try_parse_from(["fncall", "bias", "--preset", "light"]).unwrap();
        assert!(matches!(cli.command, Command::Bias { preset: BiasPreset::Light, .. }));

        assert!(Cli::try_parse_from(["fncall", "parse", "--format", "yaml"]).is_err());
        assert!(Cli::try_parse_from(["fncall", "bias", "--preset", "max"]).is_err());
    }
}

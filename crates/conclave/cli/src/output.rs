//! Output formatting utilities

use conclave_kernel::OperatorNotice;
use serde::Serialize;

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    #[default]
    Text,
    /// JSON, one document per command (one line per event for `replay`)
    Json,
}

/// Pretty JSON, or a serialization error rendered as JSON.
pub fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value)
        .unwrap_or_else(|e| serde_json::json!({ "serialization_error": e.to_string() }).to_string())
}

pub fn print_notice(notice: &OperatorNotice, format: OutputFormat) {
    match format {
        OutputFormat::Text => {
            if notice.paused_for_integrity {
                eprintln!("PAUSED FOR INTEGRITY");
            }
            eprintln!("error: {notice}");
        }
        OutputFormat::Json => eprintln!("{}", to_json(notice)),
    }
}

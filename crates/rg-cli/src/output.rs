//! Output formatting for CLI results
//!
//! - Table: human-readable tables (default)
//! - JSON: structured JSON for scripting
//! - Quiet: only the primary artifact (ciphertext, card, plaintext)

use std::str::FromStr;

use comfy_table::{presets::UTF8_FULL, Table};
use serde::Serialize;

use rg_core::decrypt::DecryptResult;
use rg_core::keyring::ImportResult;
use rg_core::store::KeyringEntry;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Quiet,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(Self::Table),
            "json" => Ok(Self::Json),
            "quiet" => Ok(Self::Quiet),
            _ => Err(format!("Unknown output format: {s}")),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Table => write!(f, "table"),
            Self::Json => write!(f, "json"),
            Self::Quiet => write!(f, "quiet"),
        }
    }
}

/// Standard JSON response wrapper
#[derive(Serialize)]
pub struct JsonResponse<'a, T: Serialize> {
    pub success: bool,
    pub command: &'a str,
    pub data: T,
    /// RFC 3339 timestamp
    pub timestamp: String,
}

impl<'a, T: Serialize> JsonResponse<'a, T> {
    pub fn new(success: bool, command: &'a str, data: T) -> Self {
        Self {
            success,
            command,
            data,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Decrypt outcome as shown to the user. Plaintext is included only when
/// it is valid UTF-8; binary output goes to files.
#[derive(Debug, Serialize)]
pub struct DecryptOutput {
    pub status: String,
    pub signature: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_kid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_request: Option<String>,
}

impl From<&DecryptResult> for DecryptOutput {
    fn from(r: &DecryptResult) -> Self {
        Self {
            status: r.status.to_string(),
            signature: r.signature.to_string(),
            sender_id: r.sender_id.clone(),
            missing_kid: r.missing_kid.clone(),
            text: r.text().map(str::to_string),
            key_request: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ImportOutput<'a> {
    pub entry: &'a KeyringEntry,
    pub signature_valid: bool,
    pub revoked: Vec<String>,
}

impl<'a> From<&'a ImportResult> for ImportOutput<'a> {
    fn from(r: &'a ImportResult) -> Self {
        Self {
            entry: &r.entry,
            signature_valid: r.signature_valid,
            revoked: r.revoked.iter().map(|k| k.to_string()).collect(),
        }
    }
}

pub struct OutputFormatter {
    format: OutputFormat,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Print the primary artifact of a command: JSON wraps it, the other
    /// formats print it bare.
    pub fn artifact(&self, command: &str, label: &str, value: &str) {
        match self.format {
            OutputFormat::Json => {
                let mut data = serde_json::Map::new();
                data.insert(label.to_string(), serde_json::Value::String(value.to_string()));
                println!("{}", to_json(&JsonResponse::new(true, command, data)));
            }
            OutputFormat::Table | OutputFormat::Quiet => println!("{value}"),
        }
    }

    /// Print a property table (or JSON object) of string pairs.
    pub fn properties(&self, command: &str, rows: &[(&str, String)]) {
        match self.format {
            OutputFormat::Table => println!("{}", properties_table(rows)),
            OutputFormat::Json => {
                let data: serde_json::Map<String, serde_json::Value> = rows
                    .iter()
                    .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.clone())))
                    .collect();
                println!("{}", to_json(&JsonResponse::new(true, command, data)));
            }
            OutputFormat::Quiet => {}
        }
    }

    pub fn entries(&self, command: &str, entries: &[KeyringEntry]) {
        match self.format {
            OutputFormat::Table => println!("{}", entries_table(entries)),
            OutputFormat::Json => println!("{}", to_json(&JsonResponse::new(true, command, entries))),
            OutputFormat::Quiet => {}
        }
    }

    pub fn peers(&self, command: &str, peers: &[String]) {
        match self.format {
            OutputFormat::Table if peers.is_empty() => println!("No peers in keyring."),
            OutputFormat::Table => {
                for p in peers {
                    println!("{p}");
                }
            }
            OutputFormat::Json => println!("{}", to_json(&JsonResponse::new(true, command, peers))),
            OutputFormat::Quiet => {}
        }
    }

    pub fn import(&self, command: &str, result: &ImportResult) {
        match self.format {
            OutputFormat::Table => {
                if !result.signature_valid {
                    eprintln!("Warning: key card signature is invalid; stored but never used");
                }
                println!("{}", entries_table(std::slice::from_ref(&result.entry)));
                for key in &result.revoked {
                    println!("Revoked superseded key {key}");
                }
            }
            OutputFormat::Json => {
                let data = ImportOutput::from(result);
                println!("{}", to_json(&JsonResponse::new(result.signature_valid, command, data)));
            }
            OutputFormat::Quiet => {}
        }
    }

    pub fn decrypt(&self, command: &str, out: &DecryptOutput) {
        match self.format {
            OutputFormat::Table => {
                eprintln!("status: {}  signature: {}", out.status, out.signature);
                if let Some(sender) = &out.sender_id {
                    eprintln!("sender: {sender}");
                }
                if let Some(req) = &out.key_request {
                    eprintln!("Not a recipient. Send this key request to the sender:");
                    eprintln!("{req}");
                }
                if let Some(text) = &out.text {
                    println!("{text}");
                }
            }
            OutputFormat::Json => {
                let ok = out.status == "OK";
                println!("{}", to_json(&JsonResponse::new(ok, command, out)));
            }
            OutputFormat::Quiet => {
                if let Some(text) = &out.text {
                    println!("{text}");
                }
            }
        }
    }

    /// Print an error in the selected format, to stderr for tables.
    pub fn error(&self, command: &str, message: &str) {
        match self.format {
            OutputFormat::Table => eprintln!("Error: {message}"),
            OutputFormat::Json => {
                let data = serde_json::json!({ "error": message });
                println!("{}", to_json(&JsonResponse::new(false, command, data)));
            }
            OutputFormat::Quiet => {}
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value)
        .unwrap_or_else(|e| format!("{{\"success\":false,\"error\":\"{e}\"}}"))
}

fn properties_table(rows: &[(&str, String)]) -> String {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Property", "Value"]);
    for (k, v) in rows {
        table.add_row(vec![*k, v.as_str()]);
    }
    table.to_string()
}

fn entries_table(entries: &[KeyringEntry]) -> String {
    if entries.is_empty() {
        return "No keys found.".to_string();
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec![
        "Device",
        "Signing Kid",
        "Encryption Kid",
        "Trust",
        "Card Signature",
        "Updated",
    ]);
    for e in entries {
        table.add_row(vec![
            e.key.device_id.clone(),
            e.signing_kid.clone(),
            e.encryption_kid.clone(),
            e.trust_state.to_string(),
            e.signature_state.to_string(),
            format_time(e.updated_at_ms),
        ]);
    }
    table.to_string()
}

fn format_time(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

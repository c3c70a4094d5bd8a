//! CLI command definitions and argument parsing

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use rg_core::codec::{self, KeyRequest, FILE_EXT, FILE_VERSION, STREAM_FILE_VERSION};
use rg_core::config::Config;
use rg_core::decrypt::{decrypt_envelope, decrypt_file, decrypt_stream, DecryptContext, DecryptResult, DecryptStatus};
use rg_core::messages::{encrypt_stream, encrypt_text, Outgoing};
use rg_core::replay_cache::envelope_fingerprint;
use rg_core::store::TrustState;
use rg_crypto::keycard::KeyCard;

use crate::context::AppContext;
use crate::output::{DecryptOutput, OutputFormat, OutputFormatter};
use crate::ExitCode;

/// RG CLI - encrypted messaging keys and envelopes
#[derive(Parser, Debug)]
#[command(name = "rg")]
#[command(version, about = "RG CLI - encrypted messaging keys and envelopes")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output format: table, json, quiet
    #[arg(long, default_value = "table", global = true)]
    pub output: OutputFormat,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Config file path
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Data directory (overrides config)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Local account (overrides config)
    #[arg(long, global = true)]
    pub account: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create this device's keys, or show them if they exist
    Keygen {
        /// Discard existing keys first
        #[arg(long)]
        reset: bool,
    },
    /// Print this device's signed key card
    ExportCard {
        /// Raw JSON instead of RGKEY: text
        #[arg(long)]
        json: bool,
    },
    /// Import a peer's key card (RGKEY: text, JSON, or @file)
    ImportCard {
        peer: String,
        card: String,
        #[arg(long, default_value = "TRUSTED")]
        trust: TrustState,
        /// Keep the trust state of an already known key pair
        #[arg(long)]
        keep_trust: bool,
    },
    /// Set the trust state of one peer key pair
    Trust {
        peer: String,
        signing_kid: String,
        encryption_kid: String,
        state: TrustState,
        #[arg(long)]
        device: Option<String>,
    },
    /// List keys for a peer, or all peers
    List { peer: Option<String> },
    /// Show safety numbers for this device and optionally a peer card
    SafetyNumber { card: Option<String> },
    /// Encrypt a text message to peers (text from --text or stdin)
    Encrypt {
        #[arg(required = true)]
        peers: Vec<String>,
        #[arg(long, default_value = "")]
        scope: String,
        #[arg(long)]
        text: Option<String>,
        /// Sender id written into the envelope (defaults to the account)
        #[arg(long)]
        sender_id: Option<String>,
        /// Attach the signing keyset so unknown receivers can discover it
        #[arg(long)]
        embed_keyset: bool,
    },
    /// Decrypt an RGCRYPT: message (from argument or stdin)
    Decrypt {
        text: Option<String>,
        #[arg(long)]
        scope: Option<String>,
        /// Expected sender id
        #[arg(long)]
        from: Option<String>,
        /// Message id for replay detection
        #[arg(long)]
        message_id: Option<i64>,
    },
    /// Encrypt a file into a streaming container
    EncryptFile {
        #[arg(required = true)]
        peers: Vec<String>,
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short = 'o', long = "out")]
        out: Option<PathBuf>,
        #[arg(long, default_value = "")]
        scope: String,
        #[arg(long)]
        sender_id: Option<String>,
    },
    /// Decrypt a file container
    DecryptFile {
        input: PathBuf,
        #[arg(short = 'o', long = "out")]
        out: Option<PathBuf>,
        #[arg(long)]
        scope: Option<String>,
    },
    /// Create a key request, or decode one with --decode
    KeyRequest {
        #[arg(long)]
        decode: Option<String>,
        #[arg(long)]
        requester_id: Option<String>,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Keygen { .. } => "keygen",
            Commands::ExportCard { .. } => "export-card",
            Commands::ImportCard { .. } => "import-card",
            Commands::Trust { .. } => "trust",
            Commands::List { .. } => "list",
            Commands::SafetyNumber { .. } => "safety-number",
            Commands::Encrypt { .. } => "encrypt",
            Commands::Decrypt { .. } => "decrypt",
            Commands::EncryptFile { .. } => "encrypt-file",
            Commands::DecryptFile { .. } => "decrypt-file",
            Commands::KeyRequest { .. } => "key-request",
        }
    }
}

impl Cli {
    /// Apply command-line overrides to the loaded configuration.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(account) = &self.account {
            config.account = account.clone();
        }
    }

    /// Execute the CLI command with a resolved configuration
    pub async fn execute_with_config(self, config: Config) -> anyhow::Result<ExitCode> {
        let out = OutputFormatter::new(self.output);
        let command = self.command.name();
        let ctx = AppContext::open(config)?;
        let code = match self.command {
            Commands::Keygen { reset } => keygen(&ctx, &out, reset).await?,
            Commands::ExportCard { json } => export_card(&ctx, &out, json).await?,
            Commands::ImportCard {
                peer,
                card,
                trust,
                keep_trust,
            } => import_card(&ctx, &out, &peer, &card, trust, keep_trust).await?,
            Commands::Trust {
                peer,
                signing_kid,
                encryption_kid,
                state,
                device,
            } => {
                let row = ctx
                    .keyring
                    .get_by_kids(&peer, device.as_deref(), &signing_kid, &encryption_kid)
                    .await?;
                let Some(row) = row else {
                    out.error(command, &format!("no key pair {signing_kid}/{encryption_kid} for peer {peer}"));
                    return Ok(ExitCode::InvalidInput);
                };
                ctx.keyring.set_trust_state(&row.key, state).await?;
                out.properties(command, &[("Key", row.key.to_string()), ("Trust", state.to_string())]);
                ExitCode::Success
            }
            Commands::List { peer: Some(peer) } => {
                let rows = ctx.keyring.get_by_peer(&peer).await?;
                out.entries(command, &rows);
                ExitCode::Success
            }
            Commands::List { peer: None } => {
                let peers = ctx.keyring.list_peers().await?;
                out.peers(command, &peers);
                ExitCode::Success
            }
            Commands::SafetyNumber { card } => {
                let own = ctx.own_card().await?;
                let mut rows = vec![("This device", own.safety_number())];
                if let Some(card) = card {
                    let peer = parse_card(&card)?;
                    if !peer.verify_self() {
                        warn!("peer key card signature is invalid");
                    }
                    rows.push(("Peer", peer.safety_number()));
                }
                out.properties(command, &rows);
                ExitCode::Success
            }
            Commands::Encrypt {
                peers,
                scope,
                text,
                sender_id,
                embed_keyset,
            } => {
                let text = match text {
                    Some(t) => t,
                    None => read_stdin()?,
                };
                let sender_id = sender_id.unwrap_or_else(|| ctx.config.account.clone());
                let signer = ctx.signing_keypair().await?;
                let Some(recipients) = recipients_for(&ctx, &out, command, &peers).await? else {
                    return Ok(ExitCode::NoRecipients);
                };
                let to = Outgoing {
                    dialog_scope: &scope,
                    sender_id: &sender_id,
                    signer: &signer,
                    recipients: &recipients,
                    embed_sender_keyset: embed_keyset,
                };
                let sealed = encrypt_text(&text, &to)?;
                out.artifact(command, "envelope", &sealed);
                ExitCode::Success
            }
            Commands::Decrypt {
                text,
                scope,
                from,
                message_id,
            } => {
                let text = match text {
                    Some(t) => t,
                    None => read_stdin()?,
                };
                decrypt_message(&ctx, &out, &text, scope.as_deref(), from.as_deref(), message_id).await?
            }
            Commands::EncryptFile {
                peers,
                input,
                out: path,
                scope,
                sender_id,
            } => {
                let sender_id = sender_id.unwrap_or_else(|| ctx.config.account.clone());
                let signer = ctx.signing_keypair().await?;
                let Some(recipients) = recipients_for(&ctx, &out, command, &peers).await? else {
                    return Ok(ExitCode::NoRecipients);
                };
                let to = Outgoing {
                    dialog_scope: &scope,
                    sender_id: &sender_id,
                    signer: &signer,
                    recipients: &recipients,
                    embed_sender_keyset: false,
                };
                let path = path.unwrap_or_else(|| sealed_path(&input));
                encrypt_file_to(&ctx, &to, &input, &path)?;
                out.artifact(command, "path", &path.display().to_string());
                ExitCode::Success
            }
            Commands::DecryptFile {
                input,
                out: path,
                scope,
            } => {
                let path = path.unwrap_or_else(|| opened_path(&input));
                decrypt_file_to(&ctx, &out, &input, &path, scope.as_deref()).await?
            }
            Commands::KeyRequest {
                decode: Some(text),
                ..
            } => {
                let req = KeyRequest::decode(&text)?;
                out.properties(command, &[("Requester", req.requester_id), ("Nonce", req.nonce)]);
                ExitCode::Success
            }
            Commands::KeyRequest {
                decode: None,
                requester_id,
            } => {
                let requester = requester_id.unwrap_or_else(|| ctx.config.account.clone());
                let req = KeyRequest::new(&requester)?;
                out.artifact(command, "key_request", &req.encode()?);
                ExitCode::Success
            }
        };
        Ok(code)
    }
}

// ============================================================================
// Commands
// ============================================================================

async fn keygen(ctx: &AppContext, out: &OutputFormatter, reset: bool) -> anyhow::Result<ExitCode> {
    if reset {
        ctx.reset_keys().await?;
    }
    let signing = ctx.signing_keypair().await?;
    let encryption = ctx.encryption_keypair().await?;
    let card = ctx.own_card().await?;
    out.properties(
        "keygen",
        &[
            ("Account", ctx.config.account.clone()),
            ("Device", ctx.config.device_id.clone()),
            ("Signing Kid", signing.kid()),
            ("Encryption Kid", encryption.kid()),
            ("Safety Number", card.safety_number()),
        ],
    );
    Ok(ExitCode::Success)
}

async fn export_card(ctx: &AppContext, out: &OutputFormatter, json: bool) -> anyhow::Result<ExitCode> {
    let card = ctx.own_card().await?;
    let text = if json {
        card.to_json()?
    } else {
        codec::encode_key_card(&card)?
    };
    out.artifact("export-card", "card", &text);
    Ok(ExitCode::Success)
}

async fn import_card(
    ctx: &AppContext,
    out: &OutputFormatter,
    peer: &str,
    card: &str,
    trust: TrustState,
    keep_trust: bool,
) -> anyhow::Result<ExitCode> {
    let card = parse_card(card)?;
    let result = ctx.keyring.import_card(peer, &card, trust, keep_trust).await?;
    out.import("import-card", &result);
    Ok(if result.signature_valid {
        ExitCode::Success
    } else {
        ExitCode::BadSignature
    })
}

/// Trusted keys of every peer plus this device, so the sender can read
/// its own message. `None` when a peer has no usable key.
async fn recipients_for(
    ctx: &AppContext,
    out: &OutputFormatter,
    command: &str,
    peers: &[String],
) -> anyhow::Result<Option<Vec<rg_crypto::keys::EncryptionPublicKey>>> {
    let mut recipients = Vec::new();
    for peer in peers {
        let keys = ctx.keyring.trusted_recipients(peer).await?;
        if keys.is_empty() {
            out.error(command, &format!("no trusted keys for peer {peer}"));
            return Ok(None);
        }
        recipients.extend(keys);
    }
    recipients.push(ctx.encryption_keypair().await?.public_key());
    Ok(Some(recipients))
}

async fn decrypt_message(
    ctx: &AppContext,
    out: &OutputFormatter,
    text: &str,
    scope: Option<&str>,
    from: Option<&str>,
    message_id: Option<i64>,
) -> anyhow::Result<ExitCode> {
    let command = "decrypt";
    let env = match codec::decode_envelope(text) {
        Ok(env) => env,
        Err(e) => {
            out.error(command, &e.to_string());
            return Ok(ExitCode::InvalidInput);
        }
    };

    if let Some(expected) = from {
        if env.sender_id.trim() != expected.trim() {
            out.error(command, &format!("envelope sender {} is not {}", env.sender_id, expected));
            return Ok(ExitCode::InvalidInput);
        }
    }

    let recipient = ctx.encryption_keypair().await?;
    let dctx = DecryptContext {
        expected_scope: scope,
        recipient: &recipient,
        resolver: Some(ctx.keyring.as_ref()),
    };
    let result = decrypt_envelope(&env, &dctx).await;

    if let (Some(id), true) = (message_id, result.is_ok()) {
        let replay = ctx.replay_cache();
        let fp = envelope_fingerprint(&env);
        let replay_scope = scope.unwrap_or(&env.dialog_scope);
        if replay
            .mark_seen(&ctx.config.account, replay_scope, &fp, id)
            .await
        {
            out.error(command, "envelope was already received under another message id");
            return Ok(ExitCode::Replay);
        }
    }

    report_decrypt(ctx, out, command, &result, true)
}

fn report_decrypt(
    ctx: &AppContext,
    out: &OutputFormatter,
    command: &str,
    result: &DecryptResult,
    show_text: bool,
) -> anyhow::Result<ExitCode> {
    let mut shown = DecryptOutput::from(result);
    if !show_text {
        shown.text = None;
    }
    if result.status == DecryptStatus::NeedKey {
        shown.key_request = Some(KeyRequest::new(&ctx.config.account)?.encode()?);
    }
    out.decrypt(command, &shown);
    Ok(ExitCode::from(result.status))
}

fn encrypt_file_to(ctx: &AppContext, to: &Outgoing<'_>, input: &Path, path: &Path) -> anyhow::Result<()> {
    let reader = BufReader::new(
        File::open(input).with_context(|| format!("cannot open {}", input.display()))?,
    );
    let writer = BufWriter::new(
        File::create(path).with_context(|| format!("cannot create {}", path.display()))?,
    );
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned());
    let result = encrypt_stream(
        reader,
        writer,
        name,
        None,
        ctx.config.stream_segment_size,
        to,
    )
    .map_err(anyhow::Error::from)
    .and_then(|(_, mut w)| Ok(w.flush()?));
    if let Err(e) = result {
        remove_partial(path);
        return Err(e);
    }
    info!(input = %input.display(), output = %path.display(), "file encrypted");
    Ok(())
}

async fn decrypt_file_to(
    ctx: &AppContext,
    out: &OutputFormatter,
    input: &Path,
    path: &Path,
    scope: Option<&str>,
) -> anyhow::Result<ExitCode> {
    let command = "decrypt-file";
    let mut file = File::open(input).with_context(|| format!("cannot open {}", input.display()))?;
    let mut preamble = [0u8; 5];
    if file.read_exact(&mut preamble).is_err() {
        out.error(command, "file too short");
        return Ok(ExitCode::InvalidInput);
    }
    let version = match codec::file_version(&preamble) {
        Ok(v) => v,
        Err(e) => {
            out.error(command, &e.to_string());
            return Ok(ExitCode::InvalidInput);
        }
    };

    let recipient = ctx.encryption_keypair().await?;
    let dctx = DecryptContext {
        expected_scope: scope,
        recipient: &recipient,
        resolver: Some(ctx.keyring.as_ref()),
    };

    let result = match version {
        FILE_VERSION => {
            let data = std::fs::read(input)?;
            let result = decrypt_file(&data, ctx.config.max_file_bytes, &dctx).await;
            if let Some(plain) = result.plaintext.as_deref().filter(|_| result.is_ok()) {
                std::fs::write(path, plain)
                    .with_context(|| format!("cannot write {}", path.display()))?;
            }
            result
        }
        STREAM_FILE_VERSION => {
            let reader = BufReader::new(std::io::Cursor::new(preamble).chain(file));
            let mut writer = BufWriter::new(
                File::create(path).with_context(|| format!("cannot create {}", path.display()))?,
            );
            let outcome = decrypt_stream(
                reader,
                &mut writer,
                ctx.config.max_stream_header_bytes,
                ctx.config.stream_segment_size,
                &dctx,
            )
            .await;
            drop(writer);
            if !outcome.result.is_ok() {
                remove_partial(path);
            } else if let Some(name) = &outcome.name {
                info!(name = %name, bytes = outcome.bytes_written, "stream decrypted");
            }
            outcome.result
        }
        other => {
            out.error(command, &format!("unsupported file version {other}"));
            return Ok(ExitCode::InvalidInput);
        }
    };

    let code = report_decrypt(ctx, out, command, &result, false)?;
    if result.is_ok() && out.format() == OutputFormat::Table {
        println!("{}", path.display());
    }
    Ok(code)
}

// ============================================================================
// Helpers
// ============================================================================

/// Accept `RGKEY:` text, raw JSON, or `@path` to a file holding either.
fn parse_card(arg: &str) -> anyhow::Result<KeyCard> {
    let text = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("cannot read {path}"))?,
        None => arg.to_string(),
    };
    let text = text.trim();
    if codec::is_key_card_text(text) {
        return Ok(codec::decode_key_card(text)?);
    }
    if text.starts_with('{') {
        return Ok(KeyCard::from_json(text)?);
    }
    bail!("not a key card: expected RGKEY: text or JSON")
}

fn read_stdin() -> anyhow::Result<String> {
    let mut text = String::new();
    std::io::stdin()
        .read_to_string(&mut text)
        .context("cannot read stdin")?;
    Ok(text.trim_end_matches(['\r', '\n']).to_string())
}

fn sealed_path(input: &Path) -> PathBuf {
    let mut name = input.as_os_str().to_owned();
    name.push(FILE_EXT);
    PathBuf::from(name)
}

fn opened_path(input: &Path) -> PathBuf {
    let text = input.to_string_lossy();
    match text.strip_suffix(FILE_EXT) {
        Some(stem) if !stem.is_empty() => PathBuf::from(stem),
        _ => {
            let mut name = input.as_os_str().to_owned();
            name.push(".dec");
            PathBuf::from(name)
        }
    }
}

fn remove_partial(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "could not remove partial output");
    }
}

//! # nimbus
//!
//! Command-line client: streams one answer to the terminal, or cancels a
//! running query by id. Ctrl+C during `ask` aborts the turn, saves the
//! partial answer, and tells the server to stop.

#![deny(unsafe_code)]

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use clap::{Args, Parser, Subcommand};
use nimbus_core::logging::init_subscriber;
use nimbus_core::{ConversationId, TurnId};
use nimbus_engine::{ChatEngine, DocumentEvent, TurnOutcome, TurnRequest};
use nimbus_settings::{ApiSettings, NimbusSettings, load_settings, load_settings_from_path};
use nimbus_transport::{
    Attachment, CredentialProvider, RefreshTokenCredentials, SseClient, StaticCredentials,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info};

/// Nimbus streaming client.
#[derive(Parser, Debug)]
#[command(name = "nimbus", about = "Ask the Nimbus assistant from the terminal")]
struct Cli {
    /// Log level (overrides settings; `RUST_LOG` overrides both).
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Settings file (defaults to `~/.nimbus/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ask a question and stream the answer.
    Ask(AskArgs),
    /// Cancel a running query.
    Cancel {
        /// Query id (`query_<ms>_<hex>`).
        query_id: String,
        /// Reason reported to the server.
        #[arg(long, default_value = "user_cancelled")]
        reason: String,
    },
}

#[derive(Args, Debug)]
struct AskArgs {
    /// Question text.
    query: String,

    /// Continue an existing conversation.
    #[arg(long)]
    session: Option<String>,

    /// AWS account id in scope (repeatable).
    #[arg(long = "account")]
    accounts: Vec<String>,

    /// GCP account id in scope (repeatable).
    #[arg(long = "gcp-account")]
    gcp_accounts: Vec<String>,

    /// Model selection.
    #[arg(long)]
    model: Option<String>,

    /// Image attachment (repeatable).
    #[arg(long = "image")]
    images: Vec<PathBuf>,

    /// Document attachment (repeatable).
    #[arg(long = "file")]
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => load_settings_from_path(path),
        None => load_settings(),
    }
    .context("Failed to load settings")?;
    init_subscriber(cli.log_level.as_deref().unwrap_or(&settings.logging.level));

    let http = reqwest::Client::builder()
        .connect_timeout(settings.api.connect_timeout())
        .build()
        .context("Failed to build HTTP client")?;
    let credentials = credentials(http.clone(), &settings.api);
    let client = SseClient::with_client(http, &settings.api.base_url, credentials);
    debug!(base_url = client.base_url(), "client ready");

    match cli.command {
        Command::Ask(args) => ask(client, &settings, args).await,
        Command::Cancel { query_id, reason } => cancel(&client, &query_id, &reason).await,
    }
}

fn credentials(http: reqwest::Client, api: &ApiSettings) -> Arc<dyn CredentialProvider> {
    match (&api.access_token, &api.refresh_token) {
        (access, Some(refresh)) => Arc::new(RefreshTokenCredentials::new(
            http,
            &api.base_url,
            access.clone(),
            Some(refresh.clone()),
        )),
        (Some(access), None) => Arc::new(StaticCredentials::new(access.clone())),
        (None, None) => Arc::new(StaticCredentials::anonymous()),
    }
}

async fn ask(client: SseClient, settings: &NimbusSettings, args: AskArgs) -> Result<()> {
    let engine = Arc::new(ChatEngine::from_settings(client, settings));
    if let Some(doc) = engine.restore_interrupted() {
        eprintln!("[interrupted answer in conversation {}]", doc.conversation_id);
        println!("{}\n", doc.flatten());
    }

    let request = build_request(args)?;
    let (mut ctx, query) = engine.begin_turn(request);
    let turn_id = ctx.turn.turn_id.clone();
    eprintln!("[conversation {} | query {turn_id}]", ctx.turn.conversation_id);

    let printer = tokio::spawn(render(engine.subscribe(), turn_id.clone()));

    let outcome = {
        let run = engine.execute(&mut ctx, &query);
        tokio::pin!(run);
        tokio::select! {
            outcome = &mut run => outcome,
            _ = tokio::signal::ctrl_c() => {
                info!(%turn_id, "interrupted");
                let remote = engine.teardown(&turn_id);
                let outcome = run.await;
                if let Some(remote) = remote {
                    let _ = remote.await;
                }
                outcome
            }
        }
    };
    let _ = printer.await;

    match outcome {
        TurnOutcome::Completed => {
            println!();
            Ok(())
        }
        TurnOutcome::Cancelled => {
            eprintln!("\n[cancelled]");
            Ok(())
        }
        TurnOutcome::Failed { message } => bail!("{message}"),
    }
}

async fn cancel(client: &SseClient, query_id: &str, reason: &str) -> Result<()> {
    let ack = client
        .cancel_query(query_id, reason)
        .await
        .context("Cancel request failed")?;
    if ack.success {
        println!("{}", ack.message.as_deref().unwrap_or("cancelled"));
        Ok(())
    } else {
        bail!(
            "server did not cancel {query_id}: {}",
            ack.error.as_deref().unwrap_or("unknown reason")
        )
    }
}

fn build_request(args: AskArgs) -> Result<TurnRequest> {
    Ok(TurnRequest {
        query: args.query,
        conversation_id: args.session.map(ConversationId::from),
        account_ids: args.accounts,
        gcp_account_ids: args.gcp_accounts,
        model_id: args.model,
        images: args
            .images
            .iter()
            .map(|path| load_attachment(path))
            .collect::<Result<_>>()?,
        files: args
            .files
            .iter()
            .map(|path| load_attachment(path))
            .collect::<Result<_>>()?,
    })
}

fn load_attachment(path: &Path) -> Result<Attachment> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let file_name = path
        .file_name()
        .map_or_else(|| "attachment".to_owned(), |name| name.to_string_lossy().into_owned());
    Ok(Attachment {
        file_name,
        mime_type: mime_for(path).to_owned(),
        base64_data: STANDARD.encode(bytes),
    })
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("pdf") => "application/pdf",
        Some("csv") => "text/csv",
        Some("txt") => "text/plain",
        Some("json") => "application/json",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Some("xls") => "application/vnd.ms-excel",
        _ => "application/octet-stream",
    }
}

/// Print document events of `turn_id` until it finishes.
async fn render(mut rx: broadcast::Receiver<DocumentEvent>, turn_id: TurnId) {
    let mut printed = String::new();
    let mut out = std::io::stdout();
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "renderer lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        if event.turn_id() != Some(&turn_id) {
            continue;
        }
        match event {
            DocumentEvent::TextAppended { delta, .. } => {
                let _ = write!(out, "{delta}");
                printed.push_str(&delta);
            }
            DocumentEvent::TextReplaced { content, .. } => {
                match replacement_suffix(&printed, &content) {
                    Some(rest) => {
                        let _ = write!(out, "{rest}");
                    }
                    None => {
                        let _ = write!(out, "\n{content}");
                    }
                }
                printed = content;
            }
            DocumentEvent::ToolStarted { name, .. } => eprintln!("\n[tool {name}]"),
            DocumentEvent::ToolFinished { tool_id, status, .. } => {
                eprintln!("[tool {tool_id}: {status:?}]");
            }
            DocumentEvent::StatusHint { hint, .. } => {
                if let Some(message) = hint.message {
                    eprintln!("[{message}]");
                }
            }
            DocumentEvent::TurnFinished { .. } => break,
            _ => {}
        }
        let _ = out.flush();
    }
    let _ = out.flush();
}

/// Part of `content` not yet on screen, when `content` extends `printed`.
fn replacement_suffix<'a>(printed: &str, content: &'a str) -> Option<&'a str> {
    content.strip_prefix(printed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ask_parses_repeatable_flags() {
        let cli = Cli::parse_from([
            "nimbus",
            "ask",
            "what changed?",
            "--account",
            "111",
            "--account",
            "222",
            "--gcp-account",
            "proj",
            "--session",
            "c1",
        ]);
        let Command::Ask(args) = cli.command else {
            panic!("expected ask");
        };
        assert_eq!(args.query, "what changed?");
        assert_eq!(args.accounts, vec!["111", "222"]);
        assert_eq!(args.gcp_accounts, vec!["proj"]);
        assert_eq!(args.session.as_deref(), Some("c1"));
    }

    #[test]
    fn cancel_defaults_reason() {
        let cli = Cli::parse_from(["nimbus", "cancel", "query_1_abcdef12"]);
        let Command::Cancel { query_id, reason } = cli.command else {
            panic!("expected cancel");
        };
        assert_eq!(query_id, "query_1_abcdef12");
        assert_eq!(reason, "user_cancelled");
    }

    #[test]
    fn global_log_level_after_subcommand() {
        let cli = Cli::parse_from(["nimbus", "ask", "q", "--log-level", "debug"]);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn mime_from_extension() {
        assert_eq!(mime_for(Path::new("a.PNG")), "image/png");
        assert_eq!(mime_for(Path::new("b.jpeg")), "image/jpeg");
        assert_eq!(mime_for(Path::new("costs.csv")), "text/csv");
        assert_eq!(mime_for(Path::new("noext")), "application/octet-stream");
    }

    #[test]
    fn attachment_is_base64_without_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chart.png");
        std::fs::write(&path, b"abc").unwrap();
        let attachment = load_attachment(&path).unwrap();
        assert_eq!(attachment.file_name, "chart.png");
        assert_eq!(attachment.mime_type, "image/png");
        assert_eq!(attachment.base64_data, "YWJj");
    }

    #[test]
    fn missing_attachment_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_attachment(&dir.path().join("gone.png")).is_err());
    }

    #[test]
    fn replacement_prints_only_new_text() {
        assert_eq!(replacement_suffix("Hello", "Hello world"), Some(" world"));
        assert_eq!(replacement_suffix("Hello", "Goodbye"), None);
    }

    #[tokio::test]
    async fn static_token_is_offered_as_is() {
        let api = ApiSettings {
            access_token: Some("at".into()),
            ..ApiSettings::default()
        };
        let creds = credentials(reqwest::Client::new(), &api);
        assert_eq!(creds.access_token().await.unwrap().as_deref(), Some("at"));

        let anonymous = credentials(reqwest::Client::new(), &ApiSettings::default());
        assert!(anonymous.access_token().await.unwrap().is_none());
    }

    #[test]
    fn request_maps_cli_arguments() {
        let build = build_request(AskArgs {
            query: "q".into(),
            session: None,
            accounts: vec![],
            gcp_accounts: vec![],
            model: Some("m".into()),
            images: vec![],
            files: vec![],
        })
        .unwrap();
        assert_eq!(build.model_id.as_deref(), Some("m"));
        assert!(build.conversation_id.is_none());
    }
}

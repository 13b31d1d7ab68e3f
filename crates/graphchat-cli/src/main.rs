use std::io::{self, ErrorKind, Write};
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use graphchat_contracts::chat::{parse_intent, Intent, CHAT_HELP_COMMANDS};
use graphchat_contracts::session::{
    ChatLogPersistence, DuplicatePolicy, Role, SnapshotOptions, UploadedImage, SESSION_DATA_DIR,
};
use graphchat_engine::gateway::IMAGE_UNAVAILABLE;
use graphchat_engine::provider::{api_key_from_env, model_from_env};
use graphchat_engine::{
    AnalysisRequest, AskOutcome, ChartChatEngine, EngineConfig, TransportSettings, UploadOutcome,
    DEFAULT_POINT_COUNT,
};
use serde_json::Value;

const APP_TITLE: &str = "Graph Chat";

#[derive(Debug, Parser)]
#[command(
    name = "graphchat",
    version,
    about = "Upload chart images and ask Gemini questions about them"
)]
struct Cli {
    #[command(flatten)]
    session: SessionArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct SessionArgs {
    #[arg(long, global = true, default_value = SESSION_DATA_DIR)]
    data_dir: PathBuf,
    #[arg(long, global = true)]
    model: Option<String>,
    #[arg(long, global = true)]
    api_key: Option<String>,
    #[arg(long, global = true)]
    persist_chat_log: bool,
    #[arg(long, global = true, default_value = "name-size", value_parser = parse_dedup)]
    dedup: DuplicatePolicy,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive session.
    Chat,
    Upload(UploadArgs),
    List,
    Remove(RemoveArgs),
    Ask(AskArgs),
    Key(KeyArgs),
}

#[derive(Debug, Parser)]
struct UploadArgs {
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

#[derive(Debug, Parser)]
struct RemoveArgs {
    image: String,
}

#[derive(Debug, Parser)]
struct AskArgs {
    #[arg(long)]
    image: String,
    #[arg(long, value_name = "POINTS")]
    line: Option<u64>,
    #[arg(long)]
    bar: bool,
    #[arg(long, value_name = "POINTS")]
    scatter: Option<u64>,
    question: Vec<String>,
}

#[derive(Debug, Parser)]
struct KeyArgs {
    /// Omit to clear the saved key.
    value: Option<String>,
}

fn parse_dedup(raw: &str) -> std::result::Result<DuplicatePolicy, String> {
    DuplicatePolicy::parse(raw).ok_or_else(|| format!("unknown dedup policy '{raw}'"))
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("graphchat error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let mut engine = ChartChatEngine::open(engine_config(&cli.session))?;
    print_warnings(&mut engine);
    match cli.command {
        Command::Chat => {
            run_chat(&mut engine)?;
            Ok(0)
        }
        Command::Upload(args) => run_upload(&mut engine, args),
        Command::List => {
            print_images(&engine, None);
            Ok(0)
        }
        Command::Remove(args) => run_remove(&mut engine, args),
        Command::Ask(args) => run_ask(&mut engine, args),
        Command::Key(args) => run_key(&mut engine, args),
    }
}

fn engine_config(args: &SessionArgs) -> EngineConfig {
    EngineConfig {
        data_dir: args.data_dir.clone(),
        model: args
            .model
            .clone()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(model_from_env),
        credential: args.api_key.clone().or_else(api_key_from_env),
        snapshot: SnapshotOptions {
            chat_log: if args.persist_chat_log {
                ChatLogPersistence::Persist
            } else {
                ChatLogPersistence::Omit
            },
        },
        dedup: args.dedup,
        transport: TransportSettings::from_env(),
    }
}

fn run_chat(engine: &mut ChartChatEngine) -> Result<()> {
    let stdin = io::stdin();
    let mut line = String::new();
    let mut active: Option<String> = engine.images().first().map(|image| image.id.clone());

    println!("{APP_TITLE} started (model {}). Type /help for commands.", engine.model());
    if !engine.credential_set() {
        println!("Gemini API key is not set. Use /key <value> to provide one.");
    }
    print_images(engine, active.as_deref());

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']);
        let intent = parse_intent(input);
        if intent.action == "noop" {
            continue;
        }

        match intent.action.as_str() {
            "help" => {
                println!("Commands: {}", CHAT_HELP_COMMANDS.join(" "));
                println!("Anything else is asked about the active image.");
                continue;
            }
            "set_key" => {
                let value = arg_string(&intent, "key").unwrap_or_default();
                if engine.set_credential(&value) {
                    println!("API key saved.");
                } else {
                    println!("Please enter an API key to save.");
                    continue;
                }
            }
            "clear_key" => {
                engine.clear_credential();
                println!("API key cleared.");
            }
            "upload" => {
                let paths = arg_string_list(&intent, "paths");
                if paths.is_empty() {
                    println!("/upload requires at least one path");
                    continue;
                }
                for path in paths {
                    match engine.upload_path(&PathBuf::from(&path)) {
                        Ok(outcome) => {
                            if let UploadOutcome::Added { id, .. } = &outcome {
                                active = Some(id.clone());
                            }
                            print_upload_outcome(&outcome);
                        }
                        Err(err) => println!("Upload failed: {err:#}"),
                    }
                }
            }
            "list_images" => {
                print_images(engine, active.as_deref());
                continue;
            }
            "set_active_image" => {
                let selector = arg_string(&intent, "image").unwrap_or_default();
                match engine.resolve(&selector) {
                    Some(id) => {
                        if let Some(image) = engine.store().image(&id) {
                            println!("Active image: {} [{}]", image.name, short_id(&id));
                        }
                        active = Some(id);
                    }
                    None => println!("No image matches '{selector}'. Use /images to list them."),
                }
                continue;
            }
            "remove_image" => {
                let selector = arg_string(&intent, "image")
                    .filter(|value| !value.is_empty())
                    .or_else(|| active.clone())
                    .unwrap_or_default();
                match engine.remove(&selector) {
                    Some(removed) => {
                        println!("Removed {} [{}]", removed.name, short_id(&removed.id));
                        if active.as_deref() == Some(removed.id.as_str()) {
                            active = engine.images().first().map(|image| image.id.clone());
                        }
                    }
                    None => println!("Nothing to remove for '{selector}'."),
                }
            }
            "show_history" => {
                match active.as_deref().and_then(|id| engine.store().image(id)) {
                    Some(image) => print_history(image),
                    None => println!("No active image. Upload one with /upload."),
                }
                continue;
            }
            "ask" | "line_chart" | "bar_chart" | "scatter_plot" => {
                let request = match request_for_intent(&intent) {
                    Ok(request) => request,
                    Err(message) => {
                        println!("{message}");
                        continue;
                    }
                };
                let Some(image_id) = active.clone() else {
                    println!(
                        "No images uploaded yet. Use /upload to add some charts to analyze."
                    );
                    continue;
                };
                println!("Gemini is analyzing the chart...");
                match engine.ask(&image_id, request) {
                    Ok(outcome) => print_ask_outcome(&outcome),
                    Err(err) => {
                        println!("{err}");
                        active = engine.images().first().map(|image| image.id.clone());
                        continue;
                    }
                }
            }
            "unknown" => {
                let command = arg_string(&intent, "command").unwrap_or_default();
                println!("Unknown command /{command}. Type /help for commands.");
                continue;
            }
            _ => continue,
        }

        finish_cycle(engine);
    }

    Ok(())
}

fn run_upload(engine: &mut ChartChatEngine, args: UploadArgs) -> Result<i32> {
    let mut failed = false;
    for path in &args.paths {
        match engine.upload_path(path) {
            Ok(outcome) => {
                failed |= matches!(
                    outcome,
                    UploadOutcome::Invalid { .. } | UploadOutcome::Unsupported { .. }
                );
                print_upload_outcome(&outcome);
            }
            Err(err) => {
                failed = true;
                println!("Upload failed: {err:#}");
            }
        }
    }
    engine.persist()?;
    print_warnings(engine);
    Ok(if failed { 1 } else { 0 })
}

fn run_remove(engine: &mut ChartChatEngine, args: RemoveArgs) -> Result<i32> {
    match engine.remove(&args.image) {
        Some(removed) => println!("Removed {} [{}]", removed.name, short_id(&removed.id)),
        None => println!("Nothing to remove for '{}'.", args.image),
    }
    engine.persist()?;
    print_warnings(engine);
    Ok(0)
}

fn run_ask(engine: &mut ChartChatEngine, args: AskArgs) -> Result<i32> {
    let request = request_from_ask_args(&args)?;
    let outcome = engine.ask(&args.image, request)?;
    print_ask_outcome(&outcome);
    engine.persist()?;
    print_warnings(engine);
    Ok(match outcome {
        AskOutcome::Answered { .. } => 0,
        AskOutcome::CredentialMissing | AskOutcome::ImageUnavailable { .. } => 1,
    })
}

fn run_key(engine: &mut ChartChatEngine, args: KeyArgs) -> Result<i32> {
    match args.value {
        Some(value) => {
            if !engine.set_credential(&value) {
                bail!("refusing to save an empty API key");
            }
            println!("API key saved.");
        }
        None => {
            engine.clear_credential();
            println!("API key cleared.");
        }
    }
    engine.persist()?;
    print_warnings(engine);
    Ok(0)
}

/// Persists at the end of a REPL cycle. Save failures are reported and the
/// session keeps running from memory.
fn finish_cycle(engine: &mut ChartChatEngine) {
    if let Err(err) = engine.persist() {
        println!("Could not save session: {err:#}");
    }
    print_warnings(engine);
}

fn request_for_intent(intent: &Intent) -> std::result::Result<AnalysisRequest, String> {
    if let Some(raw) = arg_string(intent, "invalid_points") {
        return Err(format!("'{raw}' is not a number of points"));
    }
    let points = intent
        .command_args
        .get("points")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_POINT_COUNT);
    match intent.action.as_str() {
        "line_chart" => AnalysisRequest::line_chart(points),
        "scatter_plot" => AnalysisRequest::scatter(points),
        "bar_chart" => Ok(AnalysisRequest::BarChartExtraction),
        _ => intent
            .prompt
            .clone()
            .filter(|prompt| !prompt.is_empty())
            .map(AnalysisRequest::FreeFormQuestion)
            .ok_or_else(|| "Ask a question about the active image.".to_string()),
    }
}

fn request_from_ask_args(args: &AskArgs) -> Result<AnalysisRequest> {
    let question = args.question.join(" ").trim().to_string();
    let modes = [
        args.line.is_some(),
        args.bar,
        args.scatter.is_some(),
        !question.is_empty(),
    ]
    .into_iter()
    .filter(|selected| *selected)
    .count();
    if modes != 1 {
        bail!("choose exactly one of --line, --bar, --scatter or a question");
    }

    let request = if let Some(points) = args.line {
        AnalysisRequest::line_chart(points)
    } else if let Some(points) = args.scatter {
        AnalysisRequest::scatter(points)
    } else if args.bar {
        Ok(AnalysisRequest::BarChartExtraction)
    } else {
        Ok(AnalysisRequest::FreeFormQuestion(question))
    };
    request.map_err(anyhow::Error::msg)
}

fn arg_string(intent: &Intent, key: &str) -> Option<String> {
    intent
        .command_args
        .get(key)
        .and_then(Value::as_str)
        .map(|value| value.trim().to_string())
}

fn arg_string_list(intent: &Intent, key: &str) -> Vec<String> {
    intent
        .command_args
        .get(key)
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn print_warnings(engine: &mut ChartChatEngine) {
    for warning in engine.take_warnings() {
        eprintln!("warning: {warning}");
    }
}

fn print_upload_outcome(outcome: &UploadOutcome) {
    match outcome {
        UploadOutcome::Added { id, name } => println!("Uploaded {name} [{}]", short_id(id)),
        UploadOutcome::Duplicate { name } => println!("Skipped {name}: already uploaded"),
        UploadOutcome::Unsupported { name } => {
            println!("Skipped {name}: only PNG, JPG, JPEG and WEBP files are accepted")
        }
        UploadOutcome::Invalid { name, reason } => println!(
            "Error processing file '{name}': {reason}. It might not be a valid image format."
        ),
    }
}

fn print_ask_outcome(outcome: &AskOutcome) {
    match outcome {
        AskOutcome::Answered { reply, .. } => println!("gemini> {}", reply.text),
        AskOutcome::CredentialMissing => {
            println!("Please set your Gemini API key first (/key <value>).")
        }
        AskOutcome::ImageUnavailable { .. } => println!("{IMAGE_UNAVAILABLE}"),
    }
}

fn print_images(engine: &ChartChatEngine, active: Option<&str>) {
    let images = engine.images();
    if images.is_empty() {
        println!("No images uploaded yet. Use /upload to add some charts to analyze.");
        return;
    }
    for (idx, image) in images.iter().enumerate() {
        println!("{}", image_line(idx + 1, image, active == Some(image.id.as_str())));
    }
}

fn image_line(position: usize, image: &UploadedImage, active: bool) -> String {
    let marker = if active { "*" } else { " " };
    let mut line = format!(
        "{marker}{position}. {} [{}] {} bytes, {} messages",
        image.name,
        short_id(&image.id),
        image.size,
        image.chat_log.len()
    );
    if !image.has_payload() {
        line.push_str(" (no image data)");
    } else if image.decoded.is_none() {
        line.push_str(" (could not reconstruct image; remove it with /remove)");
    }
    line
}

fn print_history(image: &UploadedImage) {
    println!("Chat about {}:", image.name);
    if image.chat_log.is_empty() {
        println!("  (no messages yet)");
    }
    for message in &image.chat_log {
        let speaker = match message.role {
            Role::User => "you",
            Role::Model => "gemini",
        };
        println!("{speaker}> {}", message.text());
    }
}

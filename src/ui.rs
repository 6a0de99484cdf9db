// src/ui.rs

use crate::api::ChatBackend;
use crate::app_state::AppState;
use crate::chat::{ChatControl, ChatEvent};
use crate::constants::{TITLE_MAX_LENGTH, UNTITLED_CONVERSATION};
use crate::models::{ConversationSummary, Export, ExportFormat, Message};
use crate::utils::{format_relative_time, format_timestamp, truncate_text};
use chrono::{DateTime, Utc};
use colored::Colorize;
use log::debug;
use rustyline::completion::{Completer, Pair};
use rustyline::error::ReadlineError;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::history::DefaultHistory;
use rustyline::validate::Validator;
use rustyline::{Context, Editor, Helper};
use std::borrow::Cow::{self, Borrowed, Owned};
use std::future::Future;
use std::io::Write;
use tokio::sync::mpsc::UnboundedReceiver;

const WRAP_WIDTH: usize = 80;

const COMMANDS: &[(&str, &str)] = &[
    ("/new", "start a new conversation"),
    ("/list", "list conversations"),
    ("/load <n|id>", "open a conversation"),
    ("/delete <n|id>", "delete a conversation"),
    ("/rename <n|id> <title>", "rename a conversation"),
    ("/search <query>", "search conversations"),
    ("/export <n|id> [json|txt|md]", "export a conversation"),
    ("/show", "print the current conversation"),
    ("/regen <n>", "regenerate message n"),
    ("/edit <n> <text>", "rewrite message n and everything after it"),
    ("/react <n> <reaction>", "react to message n"),
    ("/models", "list available models"),
    ("/model <key>", "switch model"),
    ("/stream [on|off]", "toggle streaming replies"),
    ("/temp <value>", "set temperature (0.0 - 2.0)"),
    ("/settings", "show settings"),
    ("/reset", "restore default settings"),
    ("/help", "show this help"),
    ("/quit", "exit"),
];

/// A parsed line of user input.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Chat(String),
    New,
    List,
    Load(String),
    Delete(String),
    Rename(String, String),
    Search(String),
    Export(String, ExportFormat),
    Show,
    Regenerate(usize),
    Edit(usize, String),
    React(usize, String),
    Models,
    Model(String),
    Stream(Option<bool>),
    Temperature(f32),
    Settings,
    Reset,
    Help,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Result<Command, String> {
        let line = line.trim();
        if !line.starts_with('/') {
            return Ok(Command::Chat(line.to_string()));
        }

        let (name, rest) = match line.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (line, ""),
        };

        let command = match name {
            "/new" => Command::New,
            "/list" => Command::List,
            "/load" => Command::Load(required(rest, "/load <n|id>")?),
            "/delete" => Command::Delete(required(rest, "/delete <n|id>")?),
            "/rename" => {
                let (target, title) = split_pair(rest, "/rename <n|id> <title>")?;
                Command::Rename(target, title)
            }
            "/search" => Command::Search(required(rest, "/search <query>")?),
            "/export" => {
                let mut parts = rest.split_whitespace();
                let target = parts
                    .next()
                    .ok_or_else(|| usage("/export <n|id> [json|txt|md]"))?;
                let format = match parts.next() {
                    Some(raw) => ExportFormat::parse(raw)
                        .ok_or_else(|| format!("Unknown export format '{}'", raw))?,
                    None => ExportFormat::Json,
                };
                Command::Export(target.to_string(), format)
            }
            "/show" => Command::Show,
            "/regen" => Command::Regenerate(index(rest, "/regen <n>")?),
            "/edit" => {
                let (n, text) = split_pair(rest, "/edit <n> <text>")?;
                Command::Edit(index(&n, "/edit <n> <text>")?, text)
            }
            "/react" => {
                let (n, reaction) = split_pair(rest, "/react <n> <reaction>")?;
                Command::React(index(&n, "/react <n> <reaction>")?, reaction)
            }
            "/models" => Command::Models,
            "/model" => Command::Model(required(rest, "/model <key>")?),
            "/stream" => match rest {
                "" => Command::Stream(None),
                "on" => Command::Stream(Some(true)),
                "off" => Command::Stream(Some(false)),
                _ => return Err(usage("/stream [on|off]")),
            },
            "/temp" => Command::Temperature(
                rest.parse()
                    .map_err(|_| usage("/temp <value>"))?,
            ),
            "/settings" => Command::Settings,
            "/reset" => Command::Reset,
            "/help" => Command::Help,
            "/quit" | "/exit" => Command::Quit,
            _ => return Err(format!("Unknown command '{}'. Type /help.", name)),
        };
        Ok(command)
    }
}

fn usage(text: &str) -> String {
    format!("Usage: {}", text)
}

fn required(rest: &str, text: &str) -> Result<String, String> {
    if rest.is_empty() {
        Err(usage(text))
    } else {
        Ok(rest.to_string())
    }
}

fn split_pair(rest: &str, text: &str) -> Result<(String, String), String> {
    match rest.split_once(char::is_whitespace) {
        Some((first, second)) if !second.trim().is_empty() => {
            Ok((first.to_string(), second.trim().to_string()))
        }
        _ => Err(usage(text)),
    }
}

/// Parses a 1-based position as shown in listings.
fn index(raw: &str, text: &str) -> Result<usize, String> {
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(usage(text)),
    }
}

/// Renders one transcript entry, numbered the way `/regen` and friends expect.
pub fn render_message(
    position: Option<usize>,
    message: &Message,
    show_timestamps: bool,
    now: DateTime<Utc>,
) -> String {
    let prefix = position.map(|n| format!("[{}] ", n)).unwrap_or_default();
    let mut header = if message.is_user() {
        format!("{}You", prefix).green().bold().to_string()
    } else {
        let name = match &message.model {
            Some(model) => format!("{}Assistant ({})", prefix, model),
            None => format!("{}Assistant", prefix),
        };
        name.bright_blue().bold().to_string()
    };

    if show_timestamps {
        header.push_str(&format!(
            " {}",
            format_timestamp(message.timestamp, now).bright_black()
        ));
    }

    let mut markers = Vec::new();
    if message.edited {
        markers.push("edited".to_string());
    }
    if message.regenerated {
        markers.push("regenerated".to_string());
    }
    if message.is_cancelled {
        markers.push("stopped".to_string());
    }
    if let Some(reaction) = &message.user_reaction {
        markers.push(format!("reaction: {}", reaction));
    }
    if !markers.is_empty() {
        header.push_str(&format!(" {}", format!("({})", markers.join(", ")).bright_black()));
    }

    let body = wrap_body(&message.content);
    let body = if message.is_error {
        body.red().to_string()
    } else {
        body
    };
    format!("{}\n{}", header, body)
}

fn wrap_body(content: &str) -> String {
    let options = textwrap::Options::new(WRAP_WIDTH)
        .initial_indent("  ")
        .subsequent_indent("  ");
    content
        .lines()
        .map(|line| textwrap::fill(line, &options))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_conversation_row(position: usize, row: &ConversationSummary, now: DateTime<Utc>) -> String {
    let title = truncate_text(
        row.title.as_deref().unwrap_or(UNTITLED_CONVERSATION),
        TITLE_MAX_LENGTH,
    );
    let when = row
        .updated_at
        .or(row.created_at)
        .map(|ts| format_relative_time(ts, now))
        .unwrap_or_default();
    format!("{:>3}. {} {}", position, title, when.bright_black())
}

/// Prints chat events as they arrive. Streaming content is written as it grows.
#[derive(Debug, Default)]
struct Printer {
    /// Text already written for the reply being streamed.
    streamed: Option<String>,
}

impl Printer {
    fn handle(&mut self, event: &ChatEvent) {
        match event {
            ChatEvent::Appended(message) if message.is_streaming => {
                let name = match &message.model {
                    Some(model) => format!("Assistant ({})", model),
                    None => "Assistant".to_string(),
                };
                println!("{}", name.bright_blue().bold());
                print!("  ");
                self.streamed = Some(String::new());
            }
            ChatEvent::Appended(message) if !message.is_user() => {
                println!("{}", render_message(None, message, false, Utc::now()));
            }
            ChatEvent::ContentUpdated { content, .. } => {
                self.write_tail(content);
            }
            ChatEvent::Replaced(message) if self.streamed.is_some() && !message.is_user() => {
                if message.is_error {
                    println!("{}", message.content.red());
                } else {
                    self.write_tail(&message.content);
                    println!();
                    if message.is_cancelled {
                        println!("{}", "  (stopped)".yellow());
                    }
                }
                self.streamed = None;
            }
            ChatEvent::Reset => {
                if self.streamed.take().is_some() {
                    println!();
                }
                println!("{}", "Conversation cleared.".bright_black());
            }
            _ => {}
        }
    }

    fn write_tail(&mut self, content: &str) {
        if let Some(chunk) = self.next_chunk(content) {
            print!("{}", chunk);
            let _ = std::io::stdout().flush();
        }
    }

    /// What to print so the terminal shows `content`: the new suffix when the
    /// printed text is a prefix of it, otherwise the whole text on a fresh line.
    fn next_chunk(&mut self, content: &str) -> Option<String> {
        let printed = self.streamed.as_mut()?;
        let chunk = match content.strip_prefix(printed.as_str()) {
            Some(tail) => tail.replace('\n', "\n  "),
            None => format!("\n  {}", content.replace('\n', "\n  ")),
        };
        *printed = content.to_string();
        Some(chunk)
    }
}

/// Slash-command completion and hints for the line editor.
#[derive(Clone)]
struct CommandHelper {
    commands: Vec<String>,
}

impl CommandHelper {
    fn new() -> Self {
        Self {
            commands: COMMANDS
                .iter()
                .filter_map(|(usage, _)| usage.split_whitespace().next())
                .map(str::to_string)
                .collect(),
        }
    }
}

impl Helper for CommandHelper {}

impl Completer for CommandHelper {
    type Candidate = Pair;

    fn complete(&self, line: &str, pos: usize, _ctx: &Context<'_>) -> rustyline::Result<(usize, Vec<Pair>)> {
        let line = &line[..pos];
        if !line.starts_with('/') || line.contains(' ') {
            return Ok((0, vec![]));
        }
        let candidates = self
            .commands
            .iter()
            .filter(|cmd| cmd.starts_with(line))
            .map(|cmd| Pair {
                display: cmd.clone(),
                replacement: cmd.clone(),
            })
            .collect();
        Ok((0, candidates))
    }
}

impl Highlighter for CommandHelper {
    fn highlight<'l>(&self, line: &'l str, _pos: usize) -> Cow<'l, str> {
        if line.starts_with('/') {
            Owned(line.bright_cyan().to_string())
        } else {
            Borrowed(line)
        }
    }

    fn highlight_char(&self, _line: &str, _pos: usize, _forced: bool) -> bool {
        true
    }
}

impl Hinter for CommandHelper {
    type Hint = String;

    fn hint(&self, line: &str, pos: usize, _ctx: &Context<'_>) -> Option<String> {
        let line = &line[..pos];
        if !line.starts_with('/') || line.contains(' ') {
            return None;
        }
        self.commands
            .iter()
            .find(|cmd| cmd.starts_with(line) && cmd.len() > line.len())
            .map(|cmd| cmd[line.len()..].to_string())
    }
}

impl Validator for CommandHelper {}

/// Awaits `fut` while printing chat events. Ctrl-C stops the active stream
/// instead of killing the process.
async fn drive<F>(
    fut: F,
    events: &mut UnboundedReceiver<ChatEvent>,
    printer: &mut Printer,
    control: &ChatControl,
) -> F::Output
where
    F: Future,
{
    tokio::pin!(fut);
    let mut interrupted = false;
    loop {
        tokio::select! {
            output = &mut fut => {
                while let Ok(event) = events.try_recv() {
                    printer.handle(&event);
                }
                return output;
            }
            Some(event) = events.recv() => printer.handle(&event),
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                if signal.is_ok() && control.cancel() {
                    debug!("Ctrl-C received, cancelling request");
                }
            }
        }
    }
}

/// The interactive terminal session.
pub struct Repl<B: ChatBackend + ?Sized> {
    app: AppState<B>,
    events: UnboundedReceiver<ChatEvent>,
    printer: Printer,
    editor: Editor<CommandHelper, DefaultHistory>,
}

impl<B: ChatBackend + ?Sized> Repl<B> {
    pub fn new(mut app: AppState<B>) -> anyhow::Result<Self> {
        let events = app.chat_mut().subscribe();
        let mut editor = Editor::new()?;
        editor.set_helper(Some(CommandHelper::new()));
        Ok(Self {
            app,
            events,
            printer: Printer::default(),
            editor,
        })
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        println!("{}", "=== palaver ===".bright_magenta().bold());
        println!(
            "{}",
            format!(
                "Model: {}. Type a message, or /help for commands.",
                self.app.selected_model()
            )
            .bright_black()
        );

        loop {
            match self.editor.readline(">> ") {
                Ok(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let _ = self.editor.add_history_entry(line.as_str());

                    match Command::parse(&line) {
                        Ok(Command::Quit) => break,
                        Ok(command) => self.execute(command).await,
                        Err(message) => println!("{}", message.yellow()),
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "CTRL-C detected. Type /quit to exit.".yellow());
                }
                Err(ReadlineError::Eof) => break,
                Err(err) => return Err(err.into()),
            }
        }

        println!("{}", "Goodbye!".bright_green());
        Ok(())
    }

    async fn execute(&mut self, command: Command) {
        let now = Utc::now();
        match command {
            Command::Chat(text) => {
                let control = self.app.chat().control();
                let Repl {
                    app,
                    events,
                    printer,
                    ..
                } = &mut *self;
                let result = drive(app.send(&text), events, printer, &control).await;
                self.report(result);
            }
            Command::New => self.app.new_chat(),
            Command::List => {
                self.app.refresh_conversations().await;
                self.print_conversations(self.app.conversations(), now);
            }
            Command::Load(target) => {
                let id = self.resolve_conversation(&target);
                let result = self.app.load_conversation(&id).await;
                self.report(result);
                self.print_transcript(now);
            }
            Command::Delete(target) => {
                let id = self.resolve_conversation(&target);
                if self.app.delete_conversation(&id).await {
                    println!("{}", "Conversation deleted.".bright_black());
                } else {
                    println!("{}", "Could not delete that conversation.".red());
                }
            }
            Command::Rename(target, title) => {
                let id = self.resolve_conversation(&target);
                if self.app.rename_conversation(&id, &title).await {
                    println!("{}", format!("Renamed to '{}'.", title).bright_black());
                } else {
                    println!("{}", "Could not rename that conversation.".red());
                }
            }
            Command::Search(query) => match self.app.search_conversations(&query).await {
                Ok(rows) if rows.is_empty() => println!("{}", "No matches.".bright_black()),
                Ok(rows) => self.print_conversations(&rows, now),
                Err(e) => println!("{}", format!("Search failed: {}", e).red()),
            },
            Command::Export(target, format) => {
                let id = self.resolve_conversation(&target);
                match self.app.export_conversation(&id, format).await {
                    Ok(Export::Document(document)) => match serde_json::to_string_pretty(&document) {
                        Ok(text) => println!("{}", text),
                        Err(e) => println!("{}", format!("Export failed: {}", e).red()),
                    },
                    Ok(Export::DownloadUrl(url)) => println!("Download: {}", url.underline()),
                    Err(e) => println!("{}", format!("Export failed: {}", e).red()),
                }
            }
            Command::Show => self.print_transcript(now),
            Command::Regenerate(n) => {
                let Some(id) = self.message_id(n) else { return };
                let control = self.app.chat().control();
                let Repl {
                    app,
                    events,
                    printer,
                    ..
                } = &mut *self;
                let result = drive(app.regenerate(&id), events, printer, &control).await;
                self.report(result);
                self.print_message(n, now);
            }
            Command::Edit(n, text) => {
                let Some(id) = self.message_id(n) else { return };
                let control = self.app.chat().control();
                let Repl {
                    app,
                    events,
                    printer,
                    ..
                } = &mut *self;
                let result = drive(app.edit(&id, &text), events, printer, &control).await;
                self.report(result);
            }
            Command::React(n, reaction) => {
                let Some(id) = self.message_id(n) else { return };
                match self.app.react(&id, &reaction).await {
                    Ok(true) => println!("{}", "Reaction saved.".bright_black()),
                    Ok(false) => println!("{}", "Reaction not saved.".yellow()),
                    Err(e) => println!("{}", e.to_string().red()),
                }
            }
            Command::Models => {
                self.app.load_models().await;
                for model in self.app.models() {
                    let marker = if model.key == self.app.selected_model() { "*" } else { " " };
                    println!(
                        "{} {} {} {}",
                        marker,
                        model.key.bold(),
                        model.name,
                        model.description.as_deref().unwrap_or("").bright_black()
                    );
                }
            }
            Command::Model(key) => match self.app.select_model(&key) {
                Ok(()) => println!("{}", format!("Using {}.", key).bright_black()),
                Err(e) => println!("{}", e.to_string().red()),
            },
            Command::Stream(enabled) => {
                let mut settings = self.app.settings().clone();
                settings.streaming_enabled = enabled.unwrap_or(!settings.streaming_enabled);
                let state = if settings.streaming_enabled { "on" } else { "off" };
                match self.app.update_settings(settings) {
                    Ok(()) => println!("{}", format!("Streaming {}.", state).bright_black()),
                    Err(e) => println!("{}", e.to_string().red()),
                }
            }
            Command::Temperature(value) => {
                let mut settings = self.app.settings().clone();
                settings.temperature = value;
                match self.app.update_settings(settings) {
                    Ok(()) => println!("{}", format!("Temperature {}.", value).bright_black()),
                    Err(e) => println!("{}", e.to_string().red()),
                }
            }
            Command::Settings => {
                let config = self.app.config();
                println!("api url      {}", config.effective_api_url());
                println!("model        {}", config.selected_model);
                println!("temperature  {}", config.settings.temperature);
                println!("max tokens   {}", config.settings.max_tokens);
                println!("streaming    {}", config.settings.streaming_enabled);
                println!("timestamps   {}", config.settings.show_timestamps);
            }
            Command::Reset => match self.app.reset_settings() {
                Ok(()) => println!("{}", "Settings restored.".bright_black()),
                Err(e) => println!("{}", e.to_string().red()),
            },
            Command::Help => {
                for (usage, description) in COMMANDS {
                    println!("  {} {}", format!("{:<32}", usage).bright_cyan(), description);
                }
                println!("  {}", "Ctrl-C while a reply streams stops it.".bright_black());
            }
            Command::Quit => {}
        }

        while let Ok(event) = self.events.try_recv() {
            self.printer.handle(&event);
        }
    }

    fn report<T>(&self, result: crate::errors::PalaverResult<T>) {
        if let Err(e) = result {
            println!("{}", e.to_string().red());
        } else if let Some(error) = self.app.chat().error() {
            println!("{}", error.bright_black());
        }
    }

    fn resolve_conversation(&self, target: &str) -> String {
        target
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| self.app.conversations().get(i))
            .map(|row| row.id.clone())
            .unwrap_or_else(|| target.to_string())
    }

    fn message_id(&self, position: usize) -> Option<String> {
        let id = self
            .app
            .chat()
            .messages()
            .get(position - 1)
            .map(|m| m.id.clone());
        if id.is_none() {
            println!("{}", format!("No message {}.", position).yellow());
        }
        id
    }

    fn print_message(&self, position: usize, now: DateTime<Utc>) {
        if let Some(message) = self.app.chat().messages().get(position - 1) {
            println!(
                "{}",
                render_message(Some(position), message, self.app.settings().show_timestamps, now)
            );
        }
    }

    fn print_transcript(&self, now: DateTime<Utc>) {
        let show_timestamps = self.app.settings().show_timestamps;
        for (i, message) in self.app.chat().messages().iter().enumerate() {
            println!("{}", render_message(Some(i + 1), message, show_timestamps, now));
        }
    }

    fn print_conversations(&self, rows: &[ConversationSummary], now: DateTime<Utc>) {
        if rows.is_empty() {
            println!("{}", "No conversations yet.".bright_black());
        }
        for (i, row) in rows.iter().enumerate() {
            println!("{}", render_conversation_row(i + 1, row, now));
        }
    }
}

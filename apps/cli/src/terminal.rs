//! Line-oriented terminal front-end.
//!
//! Bus callbacks are forwarded into a single loop through an mpsc channel, so
//! all terminal state lives on one task. Input typed while the assistant is
//! busy is held back until the turn ends; only `/cancel` acts immediately.

use std::collections::VecDeque;
use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::Result;
use colored::Colorize;
use kestrel_orchestrator::event::{StreamCancel, ToolStatus, UserInput, UserStatus};
use kestrel_orchestrator::{ComponentTag, Event, EventBus, RequestId, ToolManager};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

/// Everything the loop reacts to.
#[derive(Debug)]
enum UiMessage {
    Line(Option<String>),
    Chunk { request_id: RequestId, content: String },
    Complete { request_id: RequestId, is_complete: bool },
    Error { request_id: RequestId, error: String },
    Status(UserStatus),
    ViewChanged,
    Ragnarok,
}

/// What a line of input means in the current mode.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Quit,
    Cancel,
    Accept,
    Reject,
    Dismiss,
    Message(String),
    Empty,
    Unknown(String),
}

impl Command {
    fn parse(line: &str, status: UserStatus) -> Self {
        let line = line.trim();
        match line {
            "" => Self::Empty,
            "/quit" | "/exit" => Self::Quit,
            "/cancel" => Self::Cancel,
            _ if status == UserStatus::AwaitingToolDecision => match line.to_ascii_lowercase().as_str() {
                "y" | "yes" => Self::Accept,
                "n" | "no" => Self::Reject,
                "q" => Self::Dismiss,
                _ => Self::Unknown(line.to_string()),
            },
            _ if line.starts_with('/') => Self::Unknown(line.to_string()),
            _ => Self::Message(line.to_string()),
        }
    }
}

/// Interactive session state.
pub struct Terminal {
    bus: EventBus,
    tools: Arc<ToolManager>,
    rx: UnboundedReceiver<UiMessage>,
    tx: UnboundedSender<UiMessage>,
    status: UserStatus,
    current: Option<RequestId>,
    deferred: VecDeque<Option<String>>,
}

impl Terminal {
    /// Creates the front-end and subscribes it to the bus.
    pub fn new(bus: EventBus, tools: Arc<ToolManager>) -> kestrel_orchestrator::Result<Self> {
        bus.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();

        forward(&bus.stream_chunk, &tx, |e| UiMessage::Chunk { request_id: e.request_id, content: e.content });
        forward(&bus.stream_complete, &tx, |e| UiMessage::Complete {
            request_id: e.request_id,
            is_complete: e.is_complete,
        });
        forward(&bus.stream_error, &tx, |e| UiMessage::Error { request_id: e.request_id, error: e.error });
        forward(&bus.update_user_status, &tx, |e| UiMessage::Status(e.status));
        forward(&bus.update_view, &tx, |_| UiMessage::ViewChanged);
        forward(&bus.ragnarok, &tx, |_| UiMessage::Ragnarok);

        Ok(Self {
            bus,
            tools,
            rx,
            tx,
            status: UserStatus::FreeInput,
            current: None,
            deferred: VecDeque::new(),
        })
    }

    /// Runs until `/quit`, end of input, or Ctrl-C.
    pub async fn run(mut self) -> Result<()> {
        spawn_stdin_reader(self.tx.clone());
        println!("{}", "kestrel ready. Type a message, /cancel to abort a turn, /quit to exit.".dimmed());
        prompt();

        loop {
            let message = tokio::select! {
                message = self.rx.recv() => message,
                _ = tokio::signal::ctrl_c() => {
                    println!();
                    break;
                }
            };
            let Some(message) = message else { break };

            if !self.handle(message).await {
                break;
            }
            while self.status != UserStatus::AwaitingAssistant {
                let Some(line) = self.deferred.pop_front() else { break };
                if !self.handle_line(line).await {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Returns `false` when the session should end.
    async fn handle(&mut self, message: UiMessage) -> bool {
        match message {
            UiMessage::Line(line) => {
                let is_cancel = line.as_deref().map(str::trim) == Some("/cancel");
                if self.status == UserStatus::AwaitingAssistant && !is_cancel {
                    self.deferred.push_back(line);
                    return true;
                }
                return self.handle_line(line).await;
            }
            UiMessage::Chunk { request_id, content } => {
                if self.current == Some(request_id) {
                    print!("{content}");
                    flush();
                }
            }
            UiMessage::Complete { request_id, is_complete } => {
                if self.current == Some(request_id) && is_complete {
                    println!();
                    self.finish_turn();
                }
            }
            UiMessage::Error { request_id, error } => {
                if self.current == Some(request_id) {
                    println!();
                    eprintln!("{} {}", "error:".red().bold(), error);
                    self.finish_turn();
                }
            }
            UiMessage::Status(status) => {
                debug!(?status, "Input mode changed");
                self.status = status;
                if status == UserStatus::AwaitingToolDecision {
                    self.ask_decision().await;
                }
            }
            UiMessage::ViewChanged => self.render_tools().await,
            UiMessage::Ragnarok => {
                eprintln!(
                    "{}",
                    "A component failed unexpectedly; the session may be inconsistent. Consider restarting."
                        .red()
                        .bold()
                );
            }
        }
        true
    }

    async fn handle_line(&mut self, line: Option<String>) -> bool {
        let Some(line) = line else {
            return false;
        };

        match Command::parse(&line, self.status) {
            Command::Quit => return false,
            Command::Empty => {}
            Command::Cancel => match self.current {
                Some(request_id) => {
                    self.bus.stream_cancel.publish(Event::new(ComponentTag::Ui, StreamCancel { request_id }));
                    println!("{}", "[cancelled]".yellow());
                    self.finish_turn();
                }
                None => println!("{}", "Nothing to cancel.".dimmed()),
            },
            decision @ (Command::Accept | Command::Reject | Command::Dismiss) => {
                let decided = match decision {
                    Command::Accept => self.tools.select(0).await,
                    Command::Reject => self.tools.select(1).await,
                    _ => self.tools.quit().await,
                };
                if decided.is_some() && self.tools.pending_len().await > 0 {
                    self.ask_decision().await;
                }
            }
            Command::Message(message) => {
                let request_id = RequestId::new();
                self.current = Some(request_id);
                self.status = UserStatus::AwaitingAssistant;
                self.bus.user_input.publish(Event::new(ComponentTag::Ui, UserInput { request_id, message }));
            }
            Command::Unknown(input) => {
                if self.status == UserStatus::AwaitingToolDecision {
                    println!("{}", "Answer y (run), n (skip) or q (dismiss).".yellow());
                } else {
                    println!("{} {}", "Unknown command:".yellow(), input);
                }
            }
        }
        true
    }

    fn finish_turn(&mut self) {
        self.current = None;
        self.status = UserStatus::FreeInput;
        prompt();
    }

    async fn ask_decision(&self) {
        let Some(head) = self.tools.head().await else { return };
        let detail = self
            .tools
            .active_tools()
            .await
            .into_iter()
            .find(|tool| tool.tool_call_id == head.tool_call_id)
            .map_or_else(|| head.tool_call_id.to_string(), |tool| tool.info);
        println!();
        println!("{} {}", "Run tool?".cyan().bold(), detail);
        print!("{} ", "[y/n/q]".dimmed());
        flush();
    }

    async fn render_tools(&self) {
        for tool in self.tools.changed_active_tools().await {
            let label = match tool.status {
                ToolStatus::Call => "call".cyan(),
                ToolStatus::Success => "done".green(),
                ToolStatus::Error => "fail".red(),
            };
            println!("\n  [{label}] {}", tool.info);
        }
    }
}

fn forward<T, F>(channel: &kestrel_orchestrator::EventChannel<T>, tx: &UnboundedSender<UiMessage>, map: F)
where
    T: Clone + Send + Sync + 'static,
    F: Fn(T) -> UiMessage + Send + Sync + 'static,
{
    let tx = tx.clone();
    channel.subscribe(ComponentTag::Ui, move |event: Event<T>| {
        let tx = tx.clone();
        let message = map(event.data);
        async move {
            let _ = tx.send(message);
        }
    });
}

/// Stdin is read on a plain thread so a pending read never holds up runtime shutdown.
fn spawn_stdin_reader(tx: UnboundedSender<UiMessage>) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(UiMessage::Line(Some(line))).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    debug!(error = %err, "Stdin read failed");
                    break;
                }
            }
        }
        let _ = tx.send(UiMessage::Line(None));
    });
}

fn prompt() {
    print!("{} ", ">".cyan().bold());
    flush();
}

fn flush() {
    let _ = std::io::stdout().flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_input_commands() {
        assert_eq!(Command::parse("/quit", UserStatus::FreeInput), Command::Quit);
        assert_eq!(Command::parse("  /cancel ", UserStatus::FreeInput), Command::Cancel);
        assert_eq!(Command::parse("", UserStatus::FreeInput), Command::Empty);
        assert_eq!(Command::parse("/nope", UserStatus::FreeInput), Command::Unknown("/nope".to_string()));
        assert_eq!(
            Command::parse("list files", UserStatus::FreeInput),
            Command::Message("list files".to_string())
        );
        // Outside of a decision, "y" is an ordinary message.
        assert_eq!(Command::parse("y", UserStatus::FreeInput), Command::Message("y".to_string()));
    }

    #[test]
    fn test_decision_commands() {
        let status = UserStatus::AwaitingToolDecision;
        assert_eq!(Command::parse("y", status), Command::Accept);
        assert_eq!(Command::parse("YES", status), Command::Accept);
        assert_eq!(Command::parse("n", status), Command::Reject);
        assert_eq!(Command::parse("q", status), Command::Dismiss);
        assert_eq!(Command::parse("/quit", status), Command::Quit);
        assert_eq!(Command::parse("maybe", status), Command::Unknown("maybe".to_string()));
    }
}

//! Line-oriented terminal front end over [`ClientSession`].

use anyhow::Result;
use tokio::{
    io::{self, AsyncWriteExt},
    select,
    sync::mpsc,
};
use tracing::warn;

use crate::{
    cli::ClientArgs,
    config::SessionConfig,
    error::SessionError,
    protocol::ChatEvent,
    session::{ClientSession, SessionWriter},
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let mut session = ClientSession::new(SessionConfig::from(&args));
    session.connect().await?;
    if let Err(err) = session.join_request(&args.username).await {
        write_stderr(&format!("!!! {err}")).await?;
        return Err(err.into());
    }
    if let Some(username) = session.username() {
        write_stdout(&format!("*** connected as {username}")).await?;
    }

    let (mut reader, mut writer) = session.into_split()?;
    let mut input = spawn_stdin_lines();

    loop {
        select! {
            event = reader.receive_from_others() => {
                if !handle_server_event(event).await? {
                    break;
                }
            }
            line = input.recv() => {
                if !handle_stdin_input(line, &mut writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }

    writer.disconnect().await;
    Ok(())
}

async fn handle_server_event(event: Result<ChatEvent, SessionError>) -> Result<bool> {
    match event {
        Ok(event) => {
            write_stdout(&render_event(&event)).await?;
            Ok(true)
        }
        Err(SessionError::ServerDown) => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
        Err(SessionError::Closed) => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// Reads stdin on a dedicated thread so a line is never lost when the select
/// loop picks another branch. A blocking read cannot be cancelled, and a
/// detached thread does not hold up runtime shutdown. The channel closes at
/// end of input.
fn spawn_stdin_lines() -> mpsc::Receiver<io::Result<String>> {
    let (lines_tx, lines_rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let failed = line.is_err();
            if lines_tx.blocking_send(line).is_err() || failed {
                break;
            }
        }
    });
    lines_rx
}

async fn handle_stdin_input(line: Option<io::Result<String>>, writer: &mut SessionWriter) -> Result<bool> {
    let Some(line) = line else {
        return Ok(false);
    };
    let line = line?;

    let text = line.as_str();
    if text.trim().is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    match writer.send_text(text).await {
        Ok(()) => Ok(true),
        Err(SessionError::ServerDown) => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
        Err(err @ SessionError::TextTooLong { .. }) => {
            write_stderr(&format!("!!! {err}")).await?;
            Ok(true)
        }
        Err(err) => Err(err.into()),
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

pub fn render_event(event: &ChatEvent) -> String {
    match event {
        ChatEvent::Connect { username } => format!("*** {username} joined the chat"),
        ChatEvent::Disconnect { username } => format!("*** {username} left the chat"),
        ChatEvent::Text { username, text } => format!("<{username}> {text}"),
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}

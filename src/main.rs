use anyhow::{anyhow, Error};
use async_trait::async_trait;
use clap::Parser;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    signal::unix::{signal, SignalKind},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use vidq::config::Config;
use vidq::registry::Artifact;
use vidq::reporter::Renderer;
use vidq::server::{self, Request, Response};
use vidq::session::MediaSource;
use vidq::view::View;
use vidq::{telemetry, UserId};

const HELP: &str = "\
commands:
  media <user> <path> [duration]   upload a video
  <user> <token>                   press a button
  cancel <user>                    cancel the current job or session
  stats <user>                     show totals
  help";

/// Prints views to stdout and copies finished encodes into `deliver_dir`.
struct ConsoleRenderer {
    deliver_dir: PathBuf,
}

#[async_trait]
impl Renderer for ConsoleRenderer {
    async fn show(&self, user_id: UserId, view: &View) -> vidq::Result<()> {
        print_view(user_id, view);
        Ok(())
    }

    async fn deliver(&self, user_id: UserId, artifact: &Artifact, caption: &str) -> vidq::Result<()> {
        tokio::fs::create_dir_all(&self.deliver_dir).await?;
        let name = artifact
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "output.mp4".into());
        let target = self.deliver_dir.join(name);
        tokio::fs::copy(&artifact.path, &target).await?;
        println!("[{}] {}\n  saved to {}", user_id, caption, target.display());
        if let Some(thumbnail) = &artifact.thumbnail {
            let preview = target.with_extension("jpg");
            tokio::fs::copy(thumbnail, &preview).await?;
            println!("  preview at {}", preview.display());
        }
        Ok(())
    }
}

fn print_view(user_id: UserId, view: &View) {
    println!("[{}] {}", user_id, view.text);
    for row in &view.keyboard {
        let line = row
            .iter()
            .map(|b| format!("[{}] {}", b.label, b.action.token()))
            .collect::<Vec<_>>()
            .join("   ");
        println!("    {}", line);
    }
}

#[derive(Debug, PartialEq)]
enum Command {
    Media {
        user_id: UserId,
        path: PathBuf,
        duration: Option<f64>,
    },
    Press { user_id: UserId, token: String },
    Cancel(UserId),
    Stats(UserId),
    Help,
}

fn parse_command(line: &str) -> Result<Command, Error> {
    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        ["help"] => Ok(Command::Help),
        ["media", user_id, path] => Ok(Command::Media {
            user_id: parse_user(user_id)?,
            path: PathBuf::from(*path),
            duration: None,
        }),
        ["media", user_id, path, duration] => Ok(Command::Media {
            user_id: parse_user(user_id)?,
            path: PathBuf::from(*path),
            duration: Some(
                duration
                    .parse()
                    .map_err(|_| anyhow!("not a duration: {}", duration))?,
            ),
        }),
        ["cancel", user_id] => Ok(Command::Cancel(parse_user(user_id)?)),
        ["stats", user_id] => Ok(Command::Stats(parse_user(user_id)?)),
        [user_id, token] => Ok(Command::Press {
            user_id: parse_user(user_id)?,
            token: token.to_string(),
        }),
        _ => Err(anyhow!("unrecognised command, try `help`")),
    }
}

fn parse_user(word: &str) -> Result<UserId, Error> {
    word.parse().map_err(|_| anyhow!("not a user id: {}", word))
}

/// Copies an upload into the work directory under a unique name, the way a
/// chat transport would download it.
async fn stage_media(work_dir: &Path, path: &Path, duration: Option<f64>) -> Result<MediaSource, Error> {
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow!("no file name in {}", path.display()))?
        .to_string_lossy()
        .into_owned();
    tokio::fs::create_dir_all(work_dir).await?;
    let staged = work_dir.join(format!("{}_{}", uuid::Uuid::new_v4().simple(), file_name));
    let size = tokio::fs::copy(path, &staged).await?;
    Ok(MediaSource::new(staged, size, duration))
}

async fn to_request(config: &Config, command: Command) -> Result<Option<Request>, Error> {
    let request = match command {
        Command::Help => {
            println!("{}", HELP);
            return Ok(None);
        }
        Command::Media {
            user_id,
            path,
            duration,
        } => Request::Media {
            user_id,
            media: stage_media(&config.work_dir, &path, duration).await?,
        },
        Command::Press { user_id, token } => Request::Action { user_id, token },
        Command::Cancel(user_id) => Request::Cancel { user_id },
        Command::Stats(user_id) => Request::Stats { user_id },
    };
    Ok(Some(request))
}

#[instrument(skip_all)]
async fn setup(cancel_token: CancellationToken, config: Config) -> Result<(), Error> {
    // Channel for sending requests to be processed
    let (send_to_server, recv_from_client) = mpsc::unbounded_channel();

    // Channel for getting response from server
    let (send_to_client, mut recv_from_server) = mpsc::unbounded_channel();

    let renderer = Arc::new(ConsoleRenderer {
        deliver_dir: config.deliver_dir.clone(),
    });

    let server_spawn = {
        let cancel_token = cancel_token.clone();
        let config = config.clone();
        tokio::spawn(
            async move {
                if let Err(err) =
                    server::serve(cancel_token.clone(), config, renderer, recv_from_client, send_to_client).await
                {
                    error!("Error starting server: {}", err);
                    cancel_token.cancel();
                }
            }
            .instrument(info_span!("server")),
        )
    };

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Console Cancelled");
                break;
            },
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => {},
                    Ok(Some(line)) => {
                        let request = match parse_command(&line) {
                            Ok(command) => to_request(&config, command).await,
                            Err(err) => Err(err),
                        };
                        match request {
                            Ok(Some(request)) => send_to_server.send(request)?,
                            Ok(None) => {},
                            Err(err) => println!("error: {}", err),
                        }
                    },
                    Ok(None) => {
                        // Keep serving running jobs until a signal arrives.
                        debug!("stdin closed");
                        stdin_open = false;
                    },
                    Err(err) => {
                        warn!(message = "Failed to read stdin", error = ?err);
                        stdin_open = false;
                    }
                }
            },
            server_response = recv_from_server.recv() => {
                match server_response {
                    Some(Response::View { user_id, view }) => print_view(user_id, &view),
                    Some(Response::Rejected { user_id, error }) => println!("[{}] {}", user_id, error),
                    Some(msg) => info!(event = "Message", msg = ?msg),
                    None => {
                        debug!("Server connection closed unexpectedly, exiting");
                        break;
                    }
                }
            }
        }
    }

    println!("Waiting for server to shutdown...");
    server_spawn.await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "vidq=DEBUG");
    }

    let config = Config::parse();
    telemetry::init(config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let signal_token = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {eprintln!("Received SIGTERM"); signal_token.cancel()},
            _ = sigint.recv() => {eprintln!("Received SIGINT"); signal_token.cancel()},
        }
    });

    let app = tokio::spawn(setup(token, config));
    app.await??;
    eprintln!("Shutting down.");
    telemetry::shutdown();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_command("help").unwrap(), Command::Help);
        assert_eq!(
            parse_command("media 7 /tmp/a.mp4 12.5").unwrap(),
            Command::Media {
                user_id: 7,
                path: "/tmp/a.mp4".into(),
                duration: Some(12.5)
            }
        );
        assert_eq!(
            parse_command("  7   q:720p ").unwrap(),
            Command::Press {
                user_id: 7,
                token: "q:720p".into()
            }
        );
        assert_eq!(parse_command("cancel 3").unwrap(), Command::Cancel(3));
        assert_eq!(parse_command("stats 3").unwrap(), Command::Stats(3));
        assert!(parse_command("media x /tmp/a.mp4").is_err());
        assert!(parse_command("media 1 /tmp/a.mp4 long").is_err());
        assert!(parse_command("what is this").is_err());
    }

    #[tokio::test]
    async fn test_stage_media_copies_with_unique_name() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("clip.mkv");
        std::fs::write(&source, b"12345").unwrap();
        let work = dir.path().join("work");

        let first = stage_media(&work, &source, Some(3.0)).await.unwrap();
        let second = stage_media(&work, &source, None).await.unwrap();

        assert_ne!(first.path, second.path);
        assert_eq!(first.size, 5);
        assert!(first.file_name.ends_with("clip.mkv"));
        assert!(source.exists());
        assert!(first.path.starts_with(&work));
    }
}

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use common::uri;
use player::config::{config_path_from_env, load_or_create_config, resolve_path};
use player::control::{ErrorKind, Request, Response};
use player::{RepeatMode, ShuffleMode, StatusReport};

const EXIT_FAILED: u8 = 1;
const EXIT_BAD_REQUEST: u8 = 2;
const EXIT_UNREACHABLE: u8 = 3;

/// Controls a running tonearm engine.
#[derive(Parser, Debug)]
#[command(name = "tonearm-ctl")]
struct Args {
    /// Control socket; defaults to the one named in the engine config.
    #[arg(long, env = "TONEARM_SOCKET")]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start playback, optionally at a playlist position.
    Play { index: Option<usize> },
    Pause,
    TogglePause,
    Stop,
    Next,
    Prev,
    /// Seek within the current track, in seconds.
    Seek { secs: f64 },
    /// Search the library.
    Query { text: Vec<String> },
    /// Queue files or URIs to play next.
    Enqueue {
        #[arg(required = true)]
        locations: Vec<String>,
    },
    Status,
    Scan {
        #[arg(long)]
        force: bool,
    },
    /// Replace the active playlist with an M3U or PLS file.
    Load { path: PathBuf },
    Shuffle { mode: ShuffleMode },
    Repeat { mode: RepeatMode },
    Dynamic {
        #[arg(action = clap::ArgAction::Set, value_parser = clap::builder::BoolishValueParser::new())]
        enabled: bool,
    },
    StopAfterCurrent {
        #[arg(action = clap::ArgAction::Set, value_parser = clap::builder::BoolishValueParser::new())]
        enabled: bool,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();
    let request = match build_request(args.command) {
        Ok(request) => request,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::from(EXIT_BAD_REQUEST);
        }
    };
    let socket = args.socket.unwrap_or_else(default_socket);

    let stream = match UnixStream::connect(&socket) {
        Ok(stream) => stream,
        Err(err) => {
            eprintln!("cannot reach engine at {}: {err}", socket.display());
            return ExitCode::from(EXIT_UNREACHABLE);
        }
    };
    match exchange(stream, &request) {
        Ok(response) => report(response),
        Err(err) => {
            eprintln!("engine connection failed: {err}");
            ExitCode::from(EXIT_UNREACHABLE)
        }
    }
}

fn default_socket() -> PathBuf {
    let config_path = config_path_from_env();
    let name = if config_path.exists() {
        load_or_create_config(&config_path)
            .map(|(config, _)| config.control_socket)
            .unwrap_or_else(|_| "tonearm.sock".to_string())
    } else {
        "tonearm.sock".to_string()
    };
    resolve_path(&config_path, &name)
}

fn build_request(command: Command) -> Result<Request, String> {
    let request = match command {
        Command::Play { index } => Request::Play { index },
        Command::Pause => Request::Pause,
        Command::TogglePause => Request::TogglePause,
        Command::Stop => Request::Stop,
        Command::Next => Request::Next,
        Command::Prev => Request::Prev,
        Command::Seek { secs } => Request::Seek { secs },
        Command::Query { text } => Request::Query {
            text: text.join(" "),
        },
        Command::Enqueue { locations } => {
            let uris = locations
                .iter()
                .map(|location| {
                    uri::normalize(location).map_err(|err| format!("{location}: {err}"))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Request::Enqueue { uris }
        }
        Command::Status => Request::Status,
        Command::Scan { force } => Request::Scan { force },
        Command::Load { path } => {
            let path = if path.is_absolute() {
                path
            } else {
                std::env::current_dir()
                    .map_err(|err| format!("cannot resolve {}: {err}", path.display()))?
                    .join(path)
            };
            Request::Load { path }
        }
        Command::Shuffle { mode } => Request::Shuffle { mode },
        Command::Repeat { mode } => Request::Repeat { mode },
        Command::Dynamic { enabled } => Request::Dynamic { enabled },
        Command::StopAfterCurrent { enabled } => Request::StopAfterCurrent { enabled },
    };
    Ok(request)
}

fn exchange(stream: UnixStream, request: &Request) -> std::io::Result<Response> {
    let mut writer = stream.try_clone()?;
    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    writer.write_all(line.as_bytes())?;

    let mut reply = String::new();
    BufReader::new(stream).read_line(&mut reply)?;
    if reply.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "engine closed the connection",
        ));
    }
    Ok(serde_json::from_str(&reply)?)
}

fn report(response: Response) -> ExitCode {
    match response {
        Response::Ok { count: Some(count) } => println!("ok ({count})"),
        Response::Ok { count: None } => {}
        Response::Status(status) => print_status(&status),
        Response::Tracks { tracks } => {
            for track in tracks {
                let artist = track.artist.as_deref().unwrap_or("?");
                println!("{artist} - {}\t{}", track.title, track.uri);
            }
        }
        Response::Error { kind, message } => {
            eprintln!("error: {message}");
            return match kind {
                ErrorKind::BadRequest => ExitCode::from(EXIT_BAD_REQUEST),
                ErrorKind::Failed => ExitCode::from(EXIT_FAILED),
            };
        }
    }
    ExitCode::SUCCESS
}

fn print_status(status: &StatusReport) {
    match (&status.current, &status.title) {
        (Some(_), Some(title)) => println!("{:?}: {title}", status.state),
        (Some(uri), None) => println!("{:?}: {uri}", status.state),
        _ => println!("{:?}", status.state),
    }
    if status.current.is_some() {
        match status.length {
            Some(length) => println!("position: {:.0}/{:.0}s", status.position, length),
            None => println!("position: {:.0}s", status.position),
        }
    }
    let position = status
        .playlist_position
        .map(|index| (index + 1).to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "playlist: {} ({}/{}), {} queued",
        status.playlist, position, status.playlist_len, status.queued
    );
    println!(
        "shuffle: {}  repeat: {}  dynamic: {}  stop-after-current: {}",
        status.shuffle, status.repeat, status.dynamic, status.stop_after_current
    );
    match &status.scanning {
        Some(progress) => println!(
            "library: {} tracks, scanning ({} files seen)",
            status.tracks, progress.files_seen
        ),
        None => println!("library: {} tracks", status.tracks),
    }
}

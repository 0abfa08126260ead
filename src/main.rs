//! overdub - record and layer takes from the command line
//!
//! ```text
//! overdub record <dest.wav> <seconds>
//! overdub overdub <dest.wav> <seconds> <master.wav> [more.wav ...]
//! overdub play [--once] <master.wav> [more.wav ...]
//! ```
//!
//! The engine config is read from the platform config directory and written
//! back on first run.

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use overdub::{
    EngineConfig, EngineListener, ErrorKind, SessionEngine, SessionState, MAX_PLAYER_SLOTS,
};

/// How often the control loop drains notifications
const POLL_INTERVAL: Duration = Duration::from_millis(10);

enum Mode {
    Record { dest: PathBuf, seconds: f64 },
    Overdub { dest: PathBuf, seconds: f64, tracks: Vec<PathBuf> },
    Play { tracks: Vec<PathBuf>, loop_playback: bool },
}

fn usage() -> &'static str {
    "usage:\n  \
     overdub record <dest.wav> <seconds>\n  \
     overdub overdub <dest.wav> <seconds> <master.wav> [more.wav ...]\n  \
     overdub play [--once] <master.wav> [more.wav ...]"
}

fn parse_seconds(arg: &str) -> Result<f64, String> {
    match arg.parse::<f64>() {
        Ok(s) if s > 0.0 => Ok(s),
        _ => Err(format!("invalid duration: {}", arg)),
    }
}

fn parse_args(args: &[String]) -> Result<Mode, String> {
    let Some((command, rest)) = args.split_first() else {
        return Err(usage().to_string());
    };
    match (command.as_str(), rest) {
        ("record", [dest, seconds]) => Ok(Mode::Record {
            dest: dest.into(),
            seconds: parse_seconds(seconds)?,
        }),
        ("overdub", [dest, seconds, tracks @ ..]) if !tracks.is_empty() => Ok(Mode::Overdub {
            dest: dest.into(),
            seconds: parse_seconds(seconds)?,
            tracks: tracks.iter().map(PathBuf::from).collect(),
        }),
        ("play", [flag, tracks @ ..]) if flag == "--once" && !tracks.is_empty() => {
            Ok(Mode::Play {
                tracks: tracks.iter().map(PathBuf::from).collect(),
                loop_playback: false,
            })
        }
        ("play", tracks) if !tracks.is_empty() => Ok(Mode::Play {
            tracks: tracks.iter().map(PathBuf::from).collect(),
            loop_playback: true,
        }),
        _ => Err(usage().to_string()),
    }
}

/// Drives the engine from notifications
struct Cli {
    dest: Option<PathBuf>,
    started: Option<Instant>,
    finished: bool,
    failed: Option<ErrorKind>,
}

impl Cli {
    fn new(dest: Option<PathBuf>) -> Self {
        Self {
            dest,
            started: None,
            finished: false,
            failed: None,
        }
    }

    fn elapsed(&self) -> Duration {
        self.started.map_or(Duration::ZERO, |t| t.elapsed())
    }
}

impl EngineListener for Cli {
    fn on_players_prepared(&mut self, engine: &mut SessionEngine) {
        let result = match &self.dest {
            Some(dest) => {
                let temp = temp_path_for(dest);
                engine.start_recording(temp, dest)
            }
            None => engine.start_playing(),
        };
        match result {
            Ok(()) => self.started = Some(Instant::now()),
            Err(e) => {
                eprintln!("error: {}", e);
                self.failed = Some(e.kind());
            }
        }
    }

    fn on_error(&mut self, _engine: &mut SessionEngine, kind: ErrorKind) {
        log::error!("Engine error {:?} (code {})", kind, kind.code());
        if !kind.is_recoverable() || self.dest.is_some() {
            self.failed = Some(kind);
        }
    }

    fn on_player_ended(&mut self, engine: &mut SessionEngine, slot: usize) {
        log::debug!("Slot {} ended at {}", slot, format_duration(self.elapsed()));
        // Without looping the master's end returns the session to Ready
        if self.dest.is_none() && engine.state() == SessionState::Ready {
            self.finished = true;
        }
    }

    fn on_record_finished(&mut self, _engine: &mut SessionEngine) {
        if let Some(dest) = &self.dest {
            println!("Wrote {}", dest.display());
        }
        self.finished = true;
    }
}

/// Temp file next to the destination, so promotion is a rename
fn temp_path_for(dest: &std::path::Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    dest.with_file_name(name)
}

/// Format a duration as MM:SS
fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let mins = secs / 60;
    let secs = secs % 60;
    format!("{:02}:{:02}", mins, secs)
}

fn load_config() -> EngineConfig {
    let config = EngineConfig::load();
    if let Err(e) = config.save() {
        log::warn!("Failed to save engine config: {}", e);
    }
    config
}

fn run(mode: Mode) -> Result<(), String> {
    let config = load_config();
    let mut engine = SessionEngine::new(config).map_err(|e| e.to_string())?;
    engine.open_device().map_err(|e| e.to_string())?;

    let channels = config.channel_count;
    let (mut cli, limit) = match mode {
        Mode::Record { dest, seconds } => {
            engine.init(channels, 0, false, 0).map_err(|e| e.to_string())?;
            println!("Recording {} for {} s", dest.display(), seconds);
            (Cli::new(Some(dest)), Some(seconds))
        }
        Mode::Overdub {
            dest,
            seconds,
            tracks,
        } => {
            prepare(&mut engine, channels, &tracks, true)?;
            println!("Overdubbing {} over {} track(s)", dest.display(), tracks.len());
            (Cli::new(Some(dest)), Some(seconds))
        }
        Mode::Play {
            tracks,
            loop_playback,
        } => {
            prepare(&mut engine, channels, &tracks, loop_playback)?;
            (Cli::new(None), None)
        }
    };

    let mut stopping = false;
    while !cli.finished {
        engine.dispatch_notifications(&mut cli);
        if let Some(kind) = cli.failed {
            return Err(format!("engine failed: {:?}", kind));
        }
        if !stopping {
            if let (Some(limit), Some(_)) = (limit, cli.started) {
                if cli.elapsed().as_secs_f64() >= limit {
                    engine.stop_recording().map_err(|e| e.to_string())?;
                    stopping = true;
                }
            }
        }
        thread::sleep(POLL_INTERVAL);
    }

    engine.release();
    Ok(())
}

fn prepare(
    engine: &mut SessionEngine,
    channels: u16,
    tracks: &[PathBuf],
    loop_playback: bool,
) -> Result<(), String> {
    if tracks.len() > MAX_PLAYER_SLOTS {
        return Err(format!("at most {} tracks", MAX_PLAYER_SLOTS));
    }
    engine
        .init(channels, tracks.len(), loop_playback, 0)
        .map_err(|e| e.to_string())?;
    for track in tracks {
        engine.prepare_player(track, 0, 0).map_err(|e| e.to_string())?;
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    log::info!("Starting overdub");

    let args: Vec<String> = env::args().skip(1).collect();
    let mode = match parse_args(&args) {
        Ok(mode) => mode,
        Err(msg) => {
            eprintln!("{}", msg);
            return ExitCode::from(2);
        }
    };

    match run(mode) {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("error: {}", msg);
            ExitCode::FAILURE
        }
    }
}

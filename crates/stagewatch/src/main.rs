use anyhow::Context;
use clap::Parser;
use stagewatch_client::{
    ClientEvent, ConnectionConfig, ConnectionStatus, ReconnectPolicy, SessionMirror, Topic,
    DEFAULT_BASE_DELAY_MS, DEFAULT_BASE_URL, DEFAULT_HEARTBEAT_SECS, DEFAULT_MAX_ATTEMPTS,
};
use stagewatch_core::{ControlError, Mode, SessionSnapshot, SessionStatus, StageNumber};
use std::env;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "stagewatch", about = "Mirror a staged simulation session and steer it from the terminal")]
struct Args {
    #[arg(long, default_value = "")]
    url: String,
    #[arg(long, default_value = "")]
    session: String,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = DEFAULT_HEARTBEAT_SECS)]
    heartbeat_interval: u64,
    #[arg(long, default_value_t = DEFAULT_BASE_DELAY_MS)]
    base_delay_ms: u64,
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,
}

#[derive(Clone, Debug)]
struct RuntimeConfig {
    session_id: String,
    connection: ConnectionConfig,
    log_dir: String,
    log_stdout: bool,
}

struct LogGuard {
    file: Option<Arc<StdMutex<std::fs::File>>>,
}

struct MultiWriter {
    stdout_enabled: bool,
    file: Option<Arc<StdMutex<std::fs::File>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Step(Option<StageNumber>),
    Mode(Mode),
    Back,
    Forward,
    Start,
    End,
    Pause,
    Resume,
    Contain(Option<StageNumber>),
    Escalate(Option<StageNumber>),
    Reset,
    Reconnect,
    Show,
    Quit,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(args);
    let _log_guard = init_logging(&config);
    info!(
        "stagewatch_start: session={} url={}",
        config.session_id, config.connection.base_url
    );

    let mirror = SessionMirror::open(&config.session_id, config.connection.clone());
    mirror.subscribe(
        |snapshot: &SessionSnapshot| (snapshot.session().status, snapshot.session().current_stage),
        |(status, stage): &(SessionStatus, StageNumber), snapshot: &SessionSnapshot| {
            println!("session {status} at stage {stage} ({})", snapshot.stage(*stage).name);
        },
    );
    let _exhausted = mirror.on(Topic::ReconnectExhausted, |event| {
        if let ClientEvent::ReconnectExhausted { attempts } = event {
            println!("connection lost after {attempts} retries; type `reconnect` to try again");
        }
    });

    let mut status_rx = mirror.watch_status();
    let status_task = tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let status = *status_rx.borrow_and_update();
            println!("connection {status}");
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("read stdin")? else {
                    break;
                };
                match parse_command(&line) {
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(command)) => run_command(&mirror, command),
                    Ok(None) => {}
                    Err(err) => println!("{err}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("stagewatch_interrupt");
                break;
            }
        }
    }

    mirror.disconnect();
    let mut closed_rx = mirror.watch_status();
    let settled = tokio::time::timeout(
        SHUTDOWN_GRACE,
        closed_rx.wait_for(|status| *status != ConnectionStatus::Closing),
    )
    .await
    .is_ok();
    if !settled {
        warn!("stagewatch_shutdown_timeout");
    }
    status_task.abort();
    Ok(())
}

fn run_command(mirror: &SessionMirror, command: Command) {
    let result: Result<Option<String>, ControlError> = match command {
        Command::Step(target) => mirror
            .request_step(target, None)
            .map(|stage| Some(format!("step to stage {stage} requested"))),
        Command::Mode(Mode::Replay) => mirror
            .request_mode_change(Mode::Replay, None)
            .map(|_| describe_replay(mirror)),
        Command::Mode(mode) => mirror
            .request_mode_change(mode, None)
            .map(|mode| Some(format!("mode {mode} requested"))),
        Command::Back => mirror.replay_back().map(|_| describe_replay(mirror)),
        Command::Forward => mirror.replay_forward().map(|_| describe_replay(mirror)),
        Command::Start => mirror.replay_to_start().map(|_| describe_replay(mirror)),
        Command::End => mirror.replay_to_end().map(|_| describe_replay(mirror)),
        Command::Pause => {
            mirror.pause(None);
            Ok(Some("pause requested".to_string()))
        }
        Command::Resume => {
            mirror.resume(None);
            Ok(Some("resume requested".to_string()))
        }
        Command::Contain(target) => {
            let stage = mirror.trigger_containment(target, None);
            Ok(Some(format!("containment requested at stage {stage}")))
        }
        Command::Escalate(target) => {
            let stage = mirror.escalate(target, None);
            Ok(Some(format!("escalation requested at stage {stage}")))
        }
        Command::Reset => {
            mirror.request_reset(None);
            Ok(Some("reset requested".to_string()))
        }
        Command::Reconnect => {
            mirror.reconnect();
            Ok(None)
        }
        Command::Show => {
            let lines = summary_lines(
                &mirror.snapshot(),
                mirror.mode(),
                mirror.connection_status(),
            );
            Ok(Some(lines.join("\n")))
        }
        Command::Quit => Ok(None),
    };
    match result {
        Ok(Some(message)) => println!("{message}"),
        Ok(None) => {}
        Err(err) => println!("error: {err}"),
    }
}

fn describe_replay(mirror: &SessionMirror) -> Option<String> {
    let view = mirror.replay_view()?;
    Some(format!(
        "replay {}/{} [{}] stage {} {}: {}",
        view.position + 1,
        view.total,
        view.step.kind,
        view.step.stage,
        view.step.stage_name,
        view.step.message
    ))
}

fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let mut parts = line.split_whitespace();
    let Some(word) = parts.next() else {
        return Ok(None);
    };
    let target = match parts.next() {
        Some(raw) => Some(parse_stage(raw)?),
        None => None,
    };
    let command = match word.to_lowercase().as_str() {
        "step" | "s" => Command::Step(target),
        "auto" => Command::Mode(Mode::Auto),
        "stepping" | "manual" => Command::Mode(Mode::Stepping),
        "replay" => Command::Mode(Mode::Replay),
        "back" | "b" => Command::Back,
        "fwd" | "forward" | "f" => Command::Forward,
        "start" => Command::Start,
        "end" => Command::End,
        "pause" => Command::Pause,
        "resume" => Command::Resume,
        "contain" => Command::Contain(target),
        "escalate" => Command::Escalate(target),
        "reset" => Command::Reset,
        "reconnect" => Command::Reconnect,
        "show" | "status" => Command::Show,
        "quit" | "exit" | "q" => Command::Quit,
        other => return Err(format!("unknown command: {other}")),
    };
    Ok(Some(command))
}

fn parse_stage(raw: &str) -> Result<StageNumber, String> {
    raw.parse::<u8>()
        .ok()
        .and_then(StageNumber::new)
        .ok_or_else(|| format!("stage must be 1-10, got {raw}"))
}

fn summary_lines(snapshot: &SessionSnapshot, mode: Mode, connection: ConnectionStatus) -> Vec<String> {
    let session = snapshot.session();
    let overall = snapshot
        .overall_confidence()
        .map(|score| format!("{score:.3}"))
        .unwrap_or_else(|| "-".to_string());
    let mut lines = vec![format!(
        "session {} {} stage={} mode={mode} connection={connection} version={} confidence={overall}",
        session.id, session.status, session.current_stage, session.version
    )];
    if session.status == SessionStatus::Contained {
        lines.push("contained: reset required before the session can continue".to_string());
    }
    for stage in snapshot.stages() {
        let mut flags = Vec::new();
        if stage.escalated {
            flags.push("escalated");
        }
        if stage.forked {
            flags.push("forked");
        }
        if stage.contained {
            flags.push("contained");
        }
        lines.push(format!(
            "  {:>2} {:<16} {:<10} {:.2} workers={} {}",
            stage.stage.get(),
            stage.name,
            stage.status.as_str(),
            stage.confidence.score,
            stage.active_workers,
            flags.join(",")
        ));
    }
    lines.push(format!("traces={}", snapshot.traces().len()));
    lines
}

fn load_config(args: Args) -> RuntimeConfig {
    let session_id = resolve_session_id(&args.session);
    let base_url = resolve_url(&args.url);
    let log_dir = resolve_log_dir(&args.log_dir);
    let log_stdout = resolve_log_stdout();
    RuntimeConfig {
        session_id,
        connection: ConnectionConfig {
            base_url,
            heartbeat_interval: Duration::from_secs(args.heartbeat_interval.max(1)),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(args.base_delay_ms),
                max_attempts: args.max_attempts,
            },
        },
        log_dir,
        log_stdout,
    }
}

fn resolve_session_id(flag: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.trim().to_string();
    }
    if let Ok(value) = env::var("STAGEWATCH_SESSION_ID") {
        if !value.trim().is_empty() {
            return value.trim().to_string();
        }
    }
    format!("pid-{}", std::process::id())
}

fn resolve_url(flag: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.trim().to_string();
    }
    if let Ok(value) = env::var("STAGEWATCH_URL") {
        if !value.trim().is_empty() {
            return value.trim().to_string();
        }
    }
    DEFAULT_BASE_URL.to_string()
}

fn resolve_log_dir(flag: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = env::var("STAGEWATCH_LOG_DIR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    String::new()
}

fn resolve_log_stdout() -> bool {
    if let Ok(value) = env::var("STAGEWATCH_LOG_STDOUT") {
        if let Some(parsed) = parse_bool_env(&value) {
            return parsed;
        }
    }
    false
}

fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn init_logging(config: &RuntimeConfig) -> Option<LogGuard> {
    let level = env::var("STAGEWATCH_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let guard = match open_log_file(&config.log_dir, &config.session_id) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = guard.file.clone();
    let stdout_enabled = config.log_stdout;
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone(), stdout_enabled));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

impl MultiWriter {
    fn new(file: Option<Arc<StdMutex<std::fs::File>>>, stdout_enabled: bool) -> Self {
        Self {
            stdout_enabled,
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.stdout_enabled {
            let _ = io::stdout().write_all(buf);
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.stdout_enabled {
            let _ = io::stdout().flush();
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str, session_id: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("stagewatch-{}.log", sanitize_component(session_id)));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(StdMutex::new(file))),
    })
}

fn sanitize_component(input: &str) -> String {
    input
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stagewatch_core::{normalize, SessionStore};

    fn stage(value: u8) -> StageNumber {
        StageNumber::new(value).expect("valid stage")
    }

    #[test]
    fn commands_parse_with_optional_stage() {
        assert_eq!(parse_command("step"), Ok(Some(Command::Step(None))));
        assert_eq!(parse_command("  STEP 4 "), Ok(Some(Command::Step(Some(stage(4))))));
        assert_eq!(parse_command("contain"), Ok(Some(Command::Contain(None))));
        assert_eq!(
            parse_command("escalate 3"),
            Ok(Some(Command::Escalate(Some(stage(3)))))
        );
        assert_eq!(parse_command("replay"), Ok(Some(Command::Mode(Mode::Replay))));
        assert_eq!(parse_command("fwd"), Ok(Some(Command::Forward)));
        assert_eq!(parse_command(""), Ok(None));
        assert!(parse_command("step 11").is_err());
        assert!(parse_command("dance").is_err());
    }

    #[test]
    fn flags_win_over_defaults() {
        assert_eq!(resolve_session_id(" sim-42 "), "sim-42");
        assert_eq!(resolve_url("ws://example.test/ws"), "ws://example.test/ws");
        assert_eq!(resolve_log_dir("/tmp/stagewatch"), "/tmp/stagewatch");
    }

    #[test]
    fn bool_env_values_parse_loosely() {
        assert_eq!(parse_bool_env("YES"), Some(true));
        assert_eq!(parse_bool_env(" off "), Some(false));
        assert_eq!(parse_bool_env("maybe"), None);
    }

    #[test]
    fn summary_lists_every_stage() {
        let mut store = SessionStore::new("sim-1", Utc::now());
        let running = serde_json::json!({"type": "status_update", "data": {"status": "running"}});
        store.apply(&normalize(&running, Utc::now()).expect("normalize"));
        let frame = serde_json::json!({
            "type": "layer_complete",
            "data": {"stage": 1, "confidence": 0.95, "forked": true}
        });
        store.apply(&normalize(&frame, Utc::now()).expect("normalize"));

        let lines = summary_lines(&store.snapshot(), Mode::Auto, ConnectionStatus::Connected);
        assert!(lines[0].starts_with("session sim-1 running stage=1 mode=auto connection=connected"));
        assert!(lines[0].ends_with("confidence=0.950"));
        assert_eq!(lines.len(), 12);
        assert!(lines[1].contains("completed"));
        assert!(lines[1].ends_with("forked"));
        assert_eq!(lines[11], "traces=1");
    }

    #[test]
    fn log_components_are_sanitized() {
        assert_eq!(sanitize_component("sim/1 a"), "sim_1_a");
    }
}

//! One interactive kiosk session: live recognition plus operator commands
//! read line by line from the terminal.

use crate::config::Config;
use crate::controller::{SessionOutcome, SessionRunner};
use crate::engine::{spawn_engine, CaptureDevice, EngineContext, EngineHandle, V4lDevice};
use chrono::NaiveDateTime;
use rollcall_core::{
    mark_attendance, AttendanceKind, CsvLedger, DirGallery, DistanceMatcher, Enrollment,
    FaceEncoder, Marking,
};
use std::collections::VecDeque;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};

const HELP: &str = "commands: enroll <name> | in | out | status | quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Enroll(String),
    Mark(AttendanceKind),
    Status,
    Help,
    Quit,
}

/// Parse one input line. Blank lines yield `Ok(None)`; unknown verbs yield a
/// message for the operator.
pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };

    let command = match verb.to_ascii_lowercase().as_str() {
        "enroll" | "register" | "r" => Command::Enroll(rest.to_string()),
        "in" | "check-in" | "checkin" | "i" => Command::Mark(AttendanceKind::CheckIn),
        "out" | "check-out" | "checkout" | "o" => Command::Mark(AttendanceKind::CheckOut),
        "status" | "s" => Command::Status,
        "help" | "h" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        other => return Err(format!("unknown command '{other}'; {HELP}")),
    };
    Ok(Some(command))
}

fn local_now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

/// Kiosk session driven by operator input.
///
/// The encoder is handed to the engine thread for the length of a session
/// and handed back when the thread is joined.
pub struct KioskSession<R> {
    input: Lines<R>,
    /// Commands typed before the camera produced its first frame.
    pending: VecDeque<Command>,
    encoder: Option<Box<dyn FaceEncoder + Send>>,
    matcher: DistanceMatcher,
    gallery: DirGallery,
    ledger: CsvLedger,
    classify_scale: f32,
    device: Box<dyn FnMut() -> Box<dyn CaptureDevice>>,
    clock: fn() -> NaiveDateTime,
}

impl<R: AsyncBufRead + Unpin> KioskSession<R> {
    pub fn new(config: &Config, encoder: Box<dyn FaceEncoder + Send>, input: R) -> Self {
        let path = config.camera_device.clone();
        let warmup_frames = config.warmup_frames;

        Self {
            input: input.lines(),
            pending: VecDeque::new(),
            encoder: Some(encoder),
            matcher: DistanceMatcher::new(config.match_threshold),
            gallery: DirGallery::new(config.faces_dir()),
            ledger: CsvLedger::new(config.attendance_dir()),
            classify_scale: config.classify_scale,
            device: Box::new(move || {
                Box::new(V4lDevice {
                    path: path.clone(),
                    warmup_frames,
                })
            }),
            clock: local_now,
        }
    }

    #[cfg(test)]
    fn with_device(mut self, device: impl FnMut() -> Box<dyn CaptureDevice> + 'static) -> Self {
        self.device = Box::new(device);
        self
    }

    #[cfg(test)]
    fn with_clock(mut self, clock: fn() -> NaiveDateTime) -> Self {
        self.clock = clock;
        self
    }

    async fn interact(&mut self, engine: &EngineHandle) -> SessionOutcome {
        println!("starting camera...");
        if let Some(outcome) = self.wait_for_camera(engine).await {
            return outcome;
        }
        println!("camera ready; {HELP}");

        let mut frames = engine.subscribe();
        loop {
            if let Some(command) = self.pending.pop_front() {
                if let Some(outcome) = self.dispatch(command, engine).await {
                    return outcome;
                }
                continue;
            }

            tokio::select! {
                line = self.input.next_line() => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        Ok(None) => {
                            tracing::info!("input closed");
                            return SessionOutcome::Quit;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to read input");
                            return SessionOutcome::Quit;
                        }
                    };
                    match parse_command(&line) {
                        Ok(Some(command)) => {
                            if let Some(outcome) = self.dispatch(command, engine).await {
                                return outcome;
                            }
                        }
                        Ok(None) => {}
                        Err(message) => println!("{message}"),
                    }
                }
                changed = frames.changed() => {
                    if changed.is_err() {
                        println!("camera stopped");
                        return SessionOutcome::DeviceLost;
                    }
                }
            }
        }
    }

    /// Wait for the first frame while still reading input, so `quit` works
    /// against a stalled camera. Other commands are queued until the camera
    /// is up. `Some` ends the session.
    async fn wait_for_camera(&mut self, engine: &EngineHandle) -> Option<SessionOutcome> {
        let first = engine.first_frame();
        tokio::pin!(first);
        let mut reading = true;

        loop {
            tokio::select! {
                frame = &mut first => {
                    return match frame {
                        Ok(_) => None,
                        Err(e) => {
                            println!("camera unavailable: {e}");
                            self.pending.clear();
                            Some(SessionOutcome::DeviceLost)
                        }
                    };
                }
                line = self.input.next_line(), if reading => match line {
                    Ok(Some(line)) => match parse_command(&line) {
                        Ok(Some(Command::Quit)) => {
                            self.pending.clear();
                            return Some(SessionOutcome::Quit);
                        }
                        Ok(Some(command)) => {
                            println!("camera still starting; '{}' will run once it is ready", line.trim());
                            self.pending.push_back(command);
                        }
                        Ok(None) => {}
                        Err(message) => println!("{message}"),
                    },
                    // Queued commands still run; the main loop sees EOF again.
                    Ok(None) if !self.pending.is_empty() => reading = false,
                    Ok(None) => {
                        tracing::info!("input closed while camera was starting");
                        return Some(SessionOutcome::Quit);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to read input");
                        return Some(SessionOutcome::Quit);
                    }
                },
            }
        }
    }

    /// Run one command. `Some` ends the session.
    async fn dispatch(&mut self, command: Command, engine: &EngineHandle) -> Option<SessionOutcome> {
        match command {
            Command::Quit => Some(SessionOutcome::Quit),
            Command::Help => {
                println!("{HELP}");
                None
            }
            Command::Status => {
                match engine.latest() {
                    Some(snapshot) => println!(
                        "frame {} ({}x{}): {} face(s), {}{}",
                        snapshot.sequence,
                        snapshot.image.width(),
                        snapshot.image.height(),
                        snapshot.boxes.len(),
                        snapshot.identity,
                        snapshot
                            .distance
                            .map(|d| format!(" (distance {d:.3})"))
                            .unwrap_or_default()
                    ),
                    None => println!("no frame yet"),
                }
                None
            }
            Command::Enroll(label) => {
                if engine.latest().is_none() {
                    println!("no frame yet; try again");
                    return None;
                }
                match engine.enroll(label).await {
                    Ok(Enrollment::Registered(record)) => {
                        println!("registered {}", record.identity);
                        Some(SessionOutcome::Succeeded)
                    }
                    Ok(Enrollment::Rejected(rejection)) => {
                        println!("{rejection}");
                        None
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "enrollment failed");
                        println!("enrollment failed: {e}");
                        None
                    }
                }
            }
            Command::Mark(kind) => {
                let Some(snapshot) = engine.latest() else {
                    println!("no frame yet; try again");
                    return None;
                };
                let now = (self.clock)();
                match mark_attendance(&self.ledger, &snapshot.identity, kind, now) {
                    Ok(Marking::Recorded(event)) => {
                        println!("{kind} recorded for {} at {}", event.identity, event.time.format("%H:%M:%S"));
                        Some(SessionOutcome::Succeeded)
                    }
                    Ok(Marking::Rejected(rejection)) => {
                        println!("{rejection}");
                        None
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to write attendance");
                        println!("could not record {kind}: {e}");
                        None
                    }
                }
            }
        }
    }
}

impl<R: AsyncBufRead + Unpin> SessionRunner for KioskSession<R> {
    async fn run_session(&mut self) -> SessionOutcome {
        let Some(encoder) = self.encoder.take() else {
            tracing::error!("face encoder lost in an earlier session");
            return SessionOutcome::DeviceLost;
        };

        let context = EngineContext {
            encoder,
            matcher: self.matcher,
            gallery: self.gallery.clone(),
            classify_scale: self.classify_scale,
        };
        let engine = match spawn_engine(context, (self.device)()) {
            Ok(engine) => engine,
            Err(e) => {
                tracing::error!(error = %e, "failed to start engine");
                return SessionOutcome::DeviceLost;
            }
        };

        let outcome = self.interact(&engine).await;

        // The engine thread must be joined (camera released) before the
        // controller resets the trigger.
        match engine.shutdown().await {
            Some(exit) => {
                if let Some(e) = &exit.failure {
                    tracing::warn!(error = %e, "engine ended with an error");
                }
                self.encoder = Some(exit.encoder);
                outcome
            }
            None => SessionOutcome::DeviceLost,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        enroll_reference, flat, looping, looping_then_fail, MeanEncoder, MissingDevice, StalledDevice,
    };
    use chrono::NaiveDate;
    use rollcall_core::{FaceGallery, Ledger};
    use std::path::Path;

    fn morning() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap()
    }

    fn session<R: AsyncBufRead + Unpin>(data_dir: &Path, input: R, shade: u8) -> KioskSession<R> {
        KioskSession::new(&Config::for_data_dir(data_dir), Box::new(MeanEncoder), input)
            .with_device(move || looping(vec![flat(shade)]))
            .with_clock(morning)
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_command("enroll Alice Smith"), Ok(Some(Command::Enroll("Alice Smith".into()))));
        assert_eq!(parse_command("  r bob "), Ok(Some(Command::Enroll("bob".into()))));
        assert_eq!(parse_command("enroll"), Ok(Some(Command::Enroll(String::new()))));
        assert_eq!(parse_command("IN"), Ok(Some(Command::Mark(AttendanceKind::CheckIn))));
        assert_eq!(parse_command("check-out"), Ok(Some(Command::Mark(AttendanceKind::CheckOut))));
        assert_eq!(parse_command("o"), Ok(Some(Command::Mark(AttendanceKind::CheckOut))));
        assert_eq!(parse_command("status"), Ok(Some(Command::Status)));
        assert_eq!(parse_command("q"), Ok(Some(Command::Quit)));
        assert_eq!(parse_command("?"), Ok(Some(Command::Help)));
        assert_eq!(parse_command("   "), Ok(None));
        assert!(parse_command("dance").unwrap_err().contains("dance"));
    }

    #[tokio::test]
    async fn test_check_in_ends_session() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::for_data_dir(tmp.path());
        enroll_reference(&DirGallery::new(config.faces_dir()), "alice", 200);

        let mut kiosk = session(tmp.path(), b"status\nin\n".as_slice(), 200);
        assert_eq!(kiosk.run_session().await, SessionOutcome::Succeeded);

        let history = CsvLedger::new(config.attendance_dir()).history("alice").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, AttendanceKind::CheckIn);
        assert_eq!(history[0].date, morning().date());
        assert!(kiosk.encoder.is_some());
    }

    #[tokio::test]
    async fn test_consecutive_sessions_share_input_and_encoder() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::for_data_dir(tmp.path());
        enroll_reference(&DirGallery::new(config.faces_dir()), "alice", 200);

        let mut kiosk = session(tmp.path(), b"in\nin\nout\n".as_slice(), 200);
        assert_eq!(kiosk.run_session().await, SessionOutcome::Succeeded);
        // Second "in" is rejected as already marked, then "out" succeeds.
        assert_eq!(kiosk.run_session().await, SessionOutcome::Succeeded);
        assert_eq!(kiosk.run_session().await, SessionOutcome::Quit);

        let kinds: Vec<_> = CsvLedger::new(config.attendance_dir())
            .history("alice")
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec![AttendanceKind::CheckIn, AttendanceKind::CheckOut]);
    }

    #[tokio::test]
    async fn test_rejections_keep_session_open() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::for_data_dir(tmp.path());
        enroll_reference(&DirGallery::new(config.faces_dir()), "alice", 200);

        // Stranger: not recognized for either kind; input then runs out.
        let mut kiosk = session(tmp.path(), b"in\nout\nbogus\n\n".as_slice(), 60);
        assert_eq!(kiosk.run_session().await, SessionOutcome::Quit);
        assert!(!config.attendance_dir().exists());
    }

    #[tokio::test]
    async fn test_check_out_needs_check_in() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::for_data_dir(tmp.path());
        enroll_reference(&DirGallery::new(config.faces_dir()), "alice", 200);

        let mut kiosk = session(tmp.path(), b"out\nquit\n".as_slice(), 200);
        assert_eq!(kiosk.run_session().await, SessionOutcome::Quit);
        assert!(CsvLedger::new(config.attendance_dir()).history("alice").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enroll_ends_session() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::for_data_dir(tmp.path());

        let mut kiosk = session(tmp.path(), b"enroll\nenroll bob\n".as_slice(), 120);
        assert_eq!(kiosk.run_session().await, SessionOutcome::Succeeded);
        assert_eq!(
            DirGallery::new(config.faces_dir()).identities().unwrap(),
            vec!["bob".to_string()]
        );
    }

    #[tokio::test]
    async fn test_enroll_rejects_known_face() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::for_data_dir(tmp.path());
        let gallery = DirGallery::new(config.faces_dir());
        enroll_reference(&gallery, "alice", 200);

        let mut kiosk = session(tmp.path(), b"enroll alice2\n".as_slice(), 200);
        assert_eq!(kiosk.run_session().await, SessionOutcome::Quit);
        assert_eq!(gallery.identities().unwrap(), vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_camera_is_device_lost() {
        let tmp = tempfile::tempdir().unwrap();
        let mut kiosk = session(tmp.path(), b"in\n".as_slice(), 200)
            .with_device(|| Box::new(MissingDevice) as Box<dyn CaptureDevice>);

        assert_eq!(kiosk.run_session().await, SessionOutcome::DeviceLost);
        assert!(kiosk.encoder.is_some());
    }

    #[tokio::test]
    async fn test_quit_while_camera_stalls() {
        let tmp = tempfile::tempdir().unwrap();
        let mut kiosk = session(tmp.path(), b"quit\n".as_slice(), 200)
            .with_device(|| Box::new(StalledDevice::default()) as Box<dyn CaptureDevice>);

        assert_eq!(kiosk.run_session().await, SessionOutcome::Quit);
        assert!(kiosk.encoder.is_some());
    }

    #[tokio::test]
    async fn test_commands_typed_during_startup_run_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::for_data_dir(tmp.path());
        enroll_reference(&DirGallery::new(config.faces_dir()), "alice", 200);

        // Lines may be read before the first frame; order is kept either way.
        let mut kiosk = session(tmp.path(), b"in\nout\n".as_slice(), 200);
        assert_eq!(kiosk.run_session().await, SessionOutcome::Succeeded);
        assert_eq!(kiosk.run_session().await, SessionOutcome::Succeeded);

        let kinds: Vec<_> = CsvLedger::new(config.attendance_dir())
            .history("alice")
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec![AttendanceKind::CheckIn, AttendanceKind::CheckOut]);
    }

    #[tokio::test]
    async fn test_camera_failure_mid_session() {
        let tmp = tempfile::tempdir().unwrap();
        // Input that never produces a line while the writer is alive.
        let (_writer, reader) = tokio::io::duplex(64);
        let mut kiosk = session(tmp.path(), tokio::io::BufReader::new(reader), 90)
            .with_device(|| looping_then_fail(vec![flat(90)], 5));

        assert_eq!(kiosk.run_session().await, SessionOutcome::DeviceLost);
        assert!(kiosk.encoder.is_some());
    }
}

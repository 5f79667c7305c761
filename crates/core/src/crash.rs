//! Crash reports for panics raised while a case is being segmented.
//!
//! The driver marks the case it is working on and the engine marks each
//! patch before handing it to the model. If anything panics, the installed
//! hook writes one report naming that case and patch next to the log files,
//! then defers to the previous hook.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::cell::{Cell, RefCell};
use std::fs;
use std::io::Write;
use std::panic::{self, PanicHookInfo};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::volume::Shape3;

pub const CRASH_DIR_NAME: &str = "crash";

static CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static INSTALL_LOCK: Mutex<()> = Mutex::new(());

thread_local! {
    static IN_FLIGHT: RefCell<InFlight> = RefCell::new(InFlight::default());
    static REPORTING: Cell<bool> = const { Cell::new(false) };
}

/// What the current thread was doing, as far as evaluation knows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InFlight {
    pub case: Option<String>,
    pub patch: Option<PatchMarker>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchMarker {
    pub origin: Shape3,
    /// 1-based position in plan order.
    pub index: usize,
    pub total: usize,
}

/// Restores the previously marked case when dropped.
#[must_use = "the case is unmarked as soon as the scope is dropped"]
pub struct CaseScope {
    previous: Option<String>,
}

impl Drop for CaseScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        update(|state| {
            state.case = previous;
            state.patch = None;
        });
    }
}

fn update(f: impl FnOnce(&mut InFlight)) {
    let _ = IN_FLIGHT.try_with(|state| {
        if let Ok(mut state) = state.try_borrow_mut() {
            f(&mut state);
        }
    });
}

/// Marks `id` as the case being evaluated on this thread.
pub fn enter_case(id: &str) -> CaseScope {
    let mut previous = None;
    update(|state| {
        previous = state.case.replace(id.to_string());
        state.patch = None;
    });
    CaseScope { previous }
}

/// Marks the patch about to be inferred.
pub fn mark_patch(origin: Shape3, index: usize, total: usize) {
    update(|state| {
        state.patch = Some(PatchMarker {
            origin,
            index,
            total,
        })
    });
}

pub fn in_flight() -> InFlight {
    IN_FLIGHT
        .try_with(|state| state.try_borrow().map(|s| s.clone()).unwrap_or_default())
        .unwrap_or_default()
}

/// Installs the crash hook once per process and returns its directory.
///
/// Later calls keep the first directory.
pub fn install_crash_reporter(crash_dir: &Path) -> Result<PathBuf> {
    if let Some(dir) = CRASH_DIR.get() {
        return Ok(dir.clone());
    }
    let _guard = INSTALL_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(dir) = CRASH_DIR.get() {
        return Ok(dir.clone());
    }

    fs::create_dir_all(crash_dir)
        .with_context(|| format!("failed to create crash directory: {}", crash_dir.display()))?;

    let previous = panic::take_hook();
    let dir = crash_dir.to_path_buf();
    panic::set_hook(Box::new(move |info| {
        report_panic(&dir, info);
        previous(info);
    }));
    let _ = CRASH_DIR.set(crash_dir.to_path_buf());
    Ok(crash_dir.to_path_buf())
}

fn report_panic(dir: &Path, info: &PanicHookInfo<'_>) {
    // A panic while writing the report must not recurse into another report.
    if REPORTING.try_with(|flag| flag.replace(true)).unwrap_or(true) {
        return;
    }

    let written = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        let report = CrashReport::capture(info);
        report.write_to(dir)
    }));
    match written {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => eprintln!(
            "voxeval: could not write crash report to {}: {error}",
            dir.display()
        ),
        Err(_) => eprintln!(
            "voxeval: crash reporter panicked while writing to {}",
            dir.display()
        ),
    }

    let _ = REPORTING.try_with(|flag| flag.set(false));
}

#[derive(Debug)]
struct CrashReport {
    time: DateTime<Utc>,
    in_flight: InFlight,
    message: String,
    location: String,
    backtrace: Backtrace,
}

impl CrashReport {
    fn capture(info: &PanicHookInfo<'_>) -> Self {
        Self {
            time: Utc::now(),
            in_flight: in_flight(),
            message: panic_message(info.payload()),
            location: info
                .location()
                .map(|at| format!("{}:{}:{}", at.file(), at.line(), at.column()))
                .unwrap_or_else(|| "unknown".to_string()),
            backtrace: Backtrace::capture(),
        }
    }

    fn file_name(&self) -> String {
        let case = self
            .in_flight
            .case
            .as_deref()
            .map(|id| {
                id.chars()
                    .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
                    .collect::<String>()
            })
            .unwrap_or_else(|| "no-case".to_string());
        format!(
            "crash-{}-{}-{case}.log",
            self.time.format("%Y%m%dT%H%M%S%.6f"),
            std::process::id()
        )
    }

    fn write_to(&self, dir: &Path) -> std::io::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(self.file_name());
        let mut out = fs::File::create(&path)?;

        writeln!(out, "time={}", self.time.to_rfc3339())?;
        writeln!(out, "case={}", self.in_flight.case.as_deref().unwrap_or("-"))?;
        match self.in_flight.patch {
            Some(patch) => writeln!(
                out,
                "patch={}/{} origin={:?}",
                patch.index, patch.total, patch.origin
            )?,
            None => writeln!(out, "patch=-")?,
        }
        writeln!(out, "panic={}", self.message)?;
        writeln!(out, "at={}", self.location)?;
        match self.backtrace.status() {
            BacktraceStatus::Captured => writeln!(out, "backtrace:\n{}", self.backtrace)?,
            _ => writeln!(out, "backtrace=off (set RUST_BACKTRACE=1)")?,
        }
        out.flush()?;
        Ok(path)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string payload>".to_string())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn case_scope_restores_previous_case_and_clears_patch() {
        let outer = enter_case("outer");
        mark_patch([0, 4, 8], 2, 9);
        {
            let _inner = enter_case("inner");
            assert_eq!(in_flight().case.as_deref(), Some("inner"));
            assert_eq!(in_flight().patch, None);
            mark_patch([1, 2, 3], 1, 1);
        }
        assert_eq!(
            in_flight(),
            InFlight {
                case: Some("outer".to_string()),
                patch: None,
            }
        );
        drop(outer);
        assert_eq!(in_flight(), InFlight::default());
    }

    #[test]
    fn report_names_case_and_patch() {
        let dir = tempdir().expect("tempdir");
        let report = CrashReport {
            time: Utc::now(),
            in_flight: InFlight {
                case: Some("liver/case 12".to_string()),
                patch: Some(PatchMarker {
                    origin: [32, 0, 16],
                    index: 5,
                    total: 18,
                }),
            },
            message: "index out of bounds".to_string(),
            location: "src/engine.rs:10:5".to_string(),
            backtrace: Backtrace::disabled(),
        };

        let path = report.write_to(dir.path()).expect("write report");
        let name = path.file_name().and_then(|n| n.to_str()).expect("file name");
        assert!(name.ends_with("-liver_case_12.log"), "{name}");

        let text = fs::read_to_string(&path).expect("read report");
        assert!(text.contains("case=liver/case 12\n"));
        assert!(text.contains("patch=5/18 origin=[32, 0, 16]\n"));
        assert!(text.contains("panic=index out of bounds\n"));
        assert!(text.contains("at=src/engine.rs:10:5\n"));
        assert!(text.contains("backtrace=off"));
    }

    #[test]
    fn report_without_case_says_so() {
        let dir = tempdir().expect("tempdir");
        let report = CrashReport {
            time: Utc::now(),
            in_flight: InFlight::default(),
            message: "boom".to_string(),
            location: "unknown".to_string(),
            backtrace: Backtrace::disabled(),
        };
        let path = report.write_to(dir.path()).expect("write report");
        let text = fs::read_to_string(&path).expect("read report");
        assert!(text.contains("case=-\npatch=-\n"));
        assert!(path.to_string_lossy().ends_with("-no-case.log"));
    }

    #[test]
    fn panic_message_reads_str_and_string_payloads() {
        let literal: &(dyn Any + Send) = &"boom";
        let owned: &(dyn Any + Send) = &"kaboom".to_string();
        let other: &(dyn Any + Send) = &7_u8;
        assert_eq!(panic_message(literal), "boom");
        assert_eq!(panic_message(owned), "kaboom");
        assert_eq!(panic_message(other), "<non-string payload>");
    }
}

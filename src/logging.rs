//! Terminal log pipeline with repeat suppression.
//!
//! Two cooperating stages run inside the installed `log::Log`
//! implementation:
//!
//! - the filter stage collapses consecutive identical records (same target,
//!   level, and message) into a running occurrence count, appending
//!   `", message repeated N times"` from the second occurrence on. Records
//!   are never dropped - suppression only changes presentation.
//! - the render stage picks one of two strategies from the filter's
//!   is-a-repeat flag: a fresh line per record, or an ANSI cursor rewind
//!   that overwrites the previous line so a burst of identical messages
//!   renders as a single updating line.
//!
//! All mutable pipeline state (last key, counter, sink) sits behind one
//! mutex; every thread in the process logs through it.

use anyhow::{anyhow, Result};
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::io::{self, IsTerminal, Write};
use std::sync::Mutex;

/// Cursor to column 0, up one line, erase the line. A log line carrying this
/// prefix replaces the previously printed line on the terminal.
pub const OVERWRITE_PREFIX: &str = "\x1b[80D\x1b[1A\x1b[K";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Severity names accepted in configuration, highest first.
pub const SEVERITY_NAMES: [&str; 6] = ["CRITICAL", "ERROR", "WARNING", "INFO", "DEBUG", "NOTSET"];

/// Map a configured severity name onto the facade's level filter.
/// CRITICAL folds into ERROR; NOTSET means "everything".
pub fn parse_severity(name: &str) -> Result<LevelFilter> {
    match name.to_ascii_uppercase().as_str() {
        "CRITICAL" | "ERROR" => Ok(LevelFilter::Error),
        "WARNING" => Ok(LevelFilter::Warn),
        "INFO" => Ok(LevelFilter::Info),
        "DEBUG" => Ok(LevelFilter::Debug),
        "NOTSET" => Ok(LevelFilter::Trace),
        other => Err(anyhow!(
            "unknown log level '{}' (expected one of {})",
            other,
            SEVERITY_NAMES.join(", ")
        )),
    }
}

fn level_label(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARNING",
        Level::Info => "INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

// ----------------------------------------------------------------------------
// Filter stage
// ----------------------------------------------------------------------------

/// Identity triple deciding whether two records are "the same" for
/// suppression. Only exact repeats collapse; a distinct new message always
/// starts fresh.
#[derive(Clone, Debug, PartialEq, Eq)]
struct DedupKey {
    target: String,
    level: Level,
    message: String,
}

/// Whether a record is the first of its key or the N-th consecutive
/// occurrence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Occurrence {
    First,
    /// Total consecutive occurrences of the current key, this one included.
    Repeat(u64),
}

#[derive(Default)]
struct DedupState {
    last_key: Option<DedupKey>,
    repeats: u64,
}

impl DedupState {
    /// Classify a record against the last-seen key and advance the counter.
    /// The counter resets whenever a new distinct key is observed.
    fn observe(&mut self, key: DedupKey) -> Occurrence {
        if self.last_key.as_ref() == Some(&key) {
            self.repeats += 1;
            Occurrence::Repeat(self.repeats + 1)
        } else {
            self.last_key = Some(key);
            self.repeats = 0;
            Occurrence::First
        }
    }
}

// ----------------------------------------------------------------------------
// Render stage
// ----------------------------------------------------------------------------

/// Output strategy for the render stage. Strategies receive the fully
/// formatted line and the filter stage's is-a-repeat flag.
pub trait RenderStrategy: Send + Sync {
    fn render(&self, out: &mut dyn Write, line: &str, repeat: bool) -> io::Result<()>;
}

/// A fresh line per record. The repeat annotation stays in the text, which
/// makes this the right strategy for redirected or structured output.
pub struct PlainRender;

impl RenderStrategy for PlainRender {
    fn render(&self, out: &mut dyn Write, line: &str, _repeat: bool) -> io::Result<()> {
        writeln!(out, "{}", line)
    }
}

/// Overwrites the previous terminal line for repeats, so a burst of
/// identical messages shows as one line with a climbing count.
pub struct OverwriteRender;

impl RenderStrategy for OverwriteRender {
    fn render(&self, out: &mut dyn Write, line: &str, repeat: bool) -> io::Result<()> {
        if repeat {
            writeln!(out, "{}{}", OVERWRITE_PREFIX, line)
        } else {
            writeln!(out, "{}", line)
        }
    }
}

/// How the render strategy is chosen at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StyleMode {
    /// Overwrite when stderr is a terminal, plain otherwise.
    Auto,
    Plain,
    Overwrite,
}

impl StyleMode {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "auto" => Ok(StyleMode::Auto),
            "plain" => Ok(StyleMode::Plain),
            "overwrite" => Ok(StyleMode::Overwrite),
            other => Err(anyhow!(
                "unknown log style '{}' (expected auto, plain, or overwrite)",
                other
            )),
        }
    }

    fn strategy(self) -> Box<dyn RenderStrategy> {
        match self {
            StyleMode::Auto => {
                if io::stderr().is_terminal() {
                    Box::new(OverwriteRender)
                } else {
                    Box::new(PlainRender)
                }
            }
            StyleMode::Plain => Box::new(PlainRender),
            StyleMode::Overwrite => Box::new(OverwriteRender),
        }
    }
}

// ----------------------------------------------------------------------------
// Pipeline
// ----------------------------------------------------------------------------

struct PipelineInner {
    dedup: DedupState,
    sink: Box<dyn Write + Send>,
}

/// The installed logger: filter stage, render stage, and the output sink
/// behind a single lock.
pub struct LogPipeline {
    level: LevelFilter,
    strategy: Box<dyn RenderStrategy>,
    inner: Mutex<PipelineInner>,
}

impl LogPipeline {
    /// Pipeline writing to stderr with the strategy resolved from `mode`.
    pub fn new(level: LevelFilter, mode: StyleMode) -> Self {
        Self::with_sink(level, mode.strategy(), Box::new(io::stderr()))
    }

    /// Pipeline writing to an arbitrary sink. Tests pass a buffer; a
    /// structured-logging setup would pass its own writer with
    /// `PlainRender`.
    pub fn with_sink(
        level: LevelFilter,
        strategy: Box<dyn RenderStrategy>,
        sink: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            level,
            strategy,
            inner: Mutex::new(PipelineInner {
                dedup: DedupState::default(),
                sink,
            }),
        }
    }

    /// Install as the process-wide logger. Must happen once, before any
    /// component logs; the daemon startup order depends on it.
    pub fn install(self) -> Result<()> {
        let level = self.level;
        log::set_boxed_logger(Box::new(self))
            .map_err(|err| anyhow!("failed to install logger: {}", err))?;
        log::set_max_level(level);
        Ok(())
    }
}

impl Log for LogPipeline {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let message = record.args().to_string();
        let key = DedupKey {
            target: record.target().to_string(),
            level: record.level(),
            message: message.clone(),
        };
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Stamped under the lock so line order matches timestamp order.
        let timestamp = chrono::Local::now().format(TIMESTAMP_FORMAT);
        let occurrence = inner.dedup.observe(key);
        let (message, repeat) = match occurrence {
            Occurrence::First => (message, false),
            Occurrence::Repeat(count) => (
                format!("{}, message repeated {} times", message, count),
                true,
            ),
        };
        let line = format!(
            "[{}] [{:<12}] [{:<8}] - {}",
            timestamp,
            record.target(),
            level_label(record.level()),
            message
        );
        let _ = self.strategy.render(&mut inner.sink, &line, repeat);
        let _ = inner.sink.flush();
    }

    fn flush(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            let _ = inner.sink.flush();
        }
    }
}

/// Build the pipeline from resolved configuration and install it.
pub fn init(level: LevelFilter, mode: StyleMode) -> Result<()> {
    LogPipeline::new(level, mode).install()
}

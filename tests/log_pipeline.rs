use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{Level, LevelFilter, Log, Record};

use vigil_nvr::logging::{LogPipeline, OverwriteRender, PlainRender, OVERWRITE_PREFIX};

/// Sink that keeps its bytes reachable from the test after the pipeline
/// takes ownership of the writer.
#[derive(Clone)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn new() -> Self {
        SharedBuf(Arc::new(Mutex::new(Vec::new())))
    }

    fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).expect("utf8 log output")
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn overwrite_pipeline(buf: &SharedBuf) -> LogPipeline {
    LogPipeline::with_sink(
        LevelFilter::Debug,
        Box::new(OverwriteRender),
        Box::new(buf.clone()),
    )
}

fn plain_pipeline(buf: &SharedBuf) -> LogPipeline {
    LogPipeline::with_sink(
        LevelFilter::Debug,
        Box::new(PlainRender),
        Box::new(buf.clone()),
    )
}

fn emit(pipeline: &LogPipeline, target: &str, level: Level, message: &str) {
    pipeline.log(
        &Record::builder()
            .args(format_args!("{}", message))
            .level(level)
            .target(target)
            .build(),
    );
}

#[test]
fn burst_of_identical_warnings_collapses_onto_one_line() {
    let buf = SharedBuf::new();
    let pipeline = overwrite_pipeline(&buf);

    for _ in 0..10 {
        emit(&pipeline, "front_door", Level::Warn, "stream stalled");
    }

    let out = buf.contents();
    // Every record is rendered; suppression is presentation only.
    assert_eq!(out.lines().count(), 10);
    // The first occurrence prints fresh, the other nine rewind the cursor.
    assert_eq!(out.matches(OVERWRITE_PREFIX).count(), 9);
    assert!(!out.lines().next().expect("first line").contains(OVERWRITE_PREFIX));

    // Counts climb from 2 and include the current record.
    assert!(out.contains("stream stalled, message repeated 2 times"));
    assert!(out.contains("stream stalled, message repeated 10 times"));
    assert!(out
        .lines()
        .last()
        .expect("last line")
        .contains("message repeated 10 times"));
}

#[test]
fn a_different_message_starts_a_fresh_line() {
    let buf = SharedBuf::new();
    let pipeline = overwrite_pipeline(&buf);

    for _ in 0..10 {
        emit(&pipeline, "front_door", Level::Warn, "stream stalled");
    }
    emit(&pipeline, "front_door", Level::Info, "stream recovered");

    let out = buf.contents();
    let last = out.lines().last().expect("last line");
    assert!(!last.contains(OVERWRITE_PREFIX));
    assert!(last.contains("stream recovered"));
    assert!(!last.contains("repeated"));

    // The burst before it still ended at ten.
    assert!(out.contains("message repeated 10 times"));
}

#[test]
fn alternating_messages_never_collapse() {
    let buf = SharedBuf::new();
    let pipeline = overwrite_pipeline(&buf);

    for _ in 0..3 {
        emit(&pipeline, "front_door", Level::Info, "motion detected");
        emit(&pipeline, "front_door", Level::Info, "motion cleared");
    }

    let out = buf.contents();
    assert_eq!(out.lines().count(), 6);
    assert_eq!(out.matches(OVERWRITE_PREFIX).count(), 0);
    assert!(!out.contains("repeated"));
}

#[test]
fn same_message_from_another_component_is_distinct() {
    let buf = SharedBuf::new();
    let pipeline = overwrite_pipeline(&buf);

    emit(&pipeline, "front_door", Level::Warn, "stream stalled");
    emit(&pipeline, "driveway", Level::Warn, "stream stalled");

    let out = buf.contents();
    assert_eq!(out.matches(OVERWRITE_PREFIX).count(), 0);
    assert!(!out.contains("repeated"));
}

#[test]
fn plain_strategy_keeps_the_annotation_without_control_codes() {
    let buf = SharedBuf::new();
    let pipeline = plain_pipeline(&buf);

    for _ in 0..4 {
        emit(&pipeline, "detector", Level::Warn, "queue full");
    }

    let out = buf.contents();
    assert_eq!(out.lines().count(), 4);
    assert!(!out.contains('\x1b'));
    assert!(out.contains("queue full, message repeated 4 times"));
}

#[test]
fn lines_carry_component_and_severity_columns() {
    let buf = SharedBuf::new();
    let pipeline = plain_pipeline(&buf);

    emit(&pipeline, "front_door", Level::Error, "decode failed");

    let out = buf.contents();
    assert!(out.contains("[front_door  ]"));
    assert!(out.contains("[ERROR   ]"));
    assert!(out.contains("- decode failed"));
}

#[test]
fn concurrent_emitters_never_interleave_or_backdate_lines() {
    let buf = SharedBuf::new();
    let pipeline = Arc::new(plain_pipeline(&buf));

    let mut emitters = Vec::new();
    for id in 0..4 {
        let pipeline = Arc::clone(&pipeline);
        emitters.push(thread::spawn(move || {
            for seq in 0..50 {
                let message = format!("event {} {}", id, seq);
                emit(&pipeline, "stress", Level::Info, &message);
            }
        }));
    }
    for emitter in emitters {
        emitter.join().expect("emitter thread");
    }

    let out = buf.contents();
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines.len(), 200);

    // Stamping and rendering happen under one lock, so each line is whole
    // and the stamps never run backwards in output order.
    let mut previous = String::new();
    for line in &lines {
        assert!(line.starts_with('['), "torn line: {line}");
        let stamp = line[1..20].to_string();
        assert!(stamp >= previous, "timestamp out of order: {line}");
        previous = stamp;
    }
}

#[test]
fn records_below_the_configured_level_are_ignored() {
    let buf = SharedBuf::new();
    let pipeline = LogPipeline::with_sink(
        LevelFilter::Info,
        Box::new(PlainRender),
        Box::new(buf.clone()),
    );

    emit(&pipeline, "detector", Level::Debug, "sampled 4096 pixels");
    emit(&pipeline, "detector", Level::Info, "detector ready");

    let out = buf.contents();
    assert_eq!(out.lines().count(), 1);
    assert!(out.contains("detector ready"));
}

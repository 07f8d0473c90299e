use maxdiff_harness::calibration::{CalibrationPhase, CashChoice};
use maxdiff_harness::trace::{read_traces, OracleCallKind};
use maxdiff_harness::{JsonlTraceSink, OracleTrace, TraceSink};
use tempfile::tempdir;

#[derive(Debug, serde::Deserialize)]
struct TraceRow {
    kind: String,
    attempt: u32,
}

fn rank_event(task_id: usize, attempt: u32) -> OracleTrace {
    let mut event = OracleTrace::rank("r1", task_id, &["a".to_string(), "b".to_string()], attempt);
    event.best = Some("a".into());
    event.worst = Some("b".into());
    event
}

#[test]
fn jsonl_trace_sink_writes_events_and_flushes_on_join() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.jsonl");

    let (sink, worker) = JsonlTraceSink::new(&path).unwrap();
    sink.record(rank_event(1, 1)).unwrap();
    sink.record(rank_event(2, 2).with_error("timeout after 5ms")).unwrap();
    let mut calibration = OracleTrace::calibration("r1", "f1", 120.0, 3, CalibrationPhase::Search, 1);
    calibration.choice = Some(CashChoice::B);
    sink.record(calibration).unwrap();

    drop(sink);
    worker.join().unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let rows: Vec<TraceRow> = raw.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].kind, "rank");
    assert_eq!(rows[1].attempt, 2);
    assert_eq!(rows[2].kind, "calibration");

    let traces = read_traces(&path).unwrap();
    assert_eq!(traces[1].error.as_deref(), Some("timeout after 5ms"));
    assert_eq!(traces[2].kind, OracleCallKind::Calibration);
    assert_eq!(traces[2].choice, Some(CashChoice::B));
    assert_eq!(traces[2].amount, Some(120.0));
}

#[test]
fn cloned_sinks_share_one_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.jsonl");

    let (sink, worker) = JsonlTraceSink::new(&path).unwrap();
    let other = sink.clone();
    let handle = std::thread::spawn(move || {
        for i in 0..5 {
            other.record(rank_event(100 + i, 1)).unwrap();
        }
    });
    for i in 0..5 {
        sink.record(rank_event(i, 1)).unwrap();
    }
    handle.join().unwrap();
    drop(sink);
    worker.join().unwrap();

    let traces = read_traces(&path).unwrap();
    assert_eq!(traces.len(), 10);
    assert!(traces.iter().all(|t| t.task_id.is_some()));
}

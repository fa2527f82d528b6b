//! Shared stdout-to-event-log plumbing used by both adapters.
//!
//! Per the Workload Executor contract: each line of structured JSON on the
//! workload's standard output is parsed as an [`EventInput`] and appended
//! under `(runID, node.id)`. A line that doesn't parse is appended as a
//! `log` event at `level: "warn"`, carrying the raw text so nothing is
//! silently dropped.

use mentatlab_core::RunId;
use mentatlab_event::{EventInput, EventType};
use mentatlab_runstore::RunStore;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Reads newline-delimited JSON from `output` and appends each line to
/// `run_store` as an event on `node_id`, until the stream ends.
///
/// Append failures are logged and otherwise swallowed: a broken event log
/// connection must not take down the workload's own lifecycle tracking,
/// which the caller observes independently via `WaitNode`.
pub async fn follow_stdout<R: AsyncRead + Unpin>(
    run_store: &Arc<dyn RunStore>,
    run_id: RunId,
    node_id: &str,
    output: R,
) {
    let mut lines = BufReader::new(output).lines();
    loop {
        let next = match lines.next_line().await {
            Ok(next) => next,
            Err(err) => {
                tracing::warn!(node_id, error = %err, "error reading workload stdout");
                return;
            }
        };
        let Some(line) = next else { return };
        if line.trim().is_empty() {
            continue;
        }
        let input = parse_line(node_id, &line);
        if let Err(err) = run_store.append_event(&run_id, input).await {
            tracing::warn!(node_id, error = %err, "failed to append workload event");
        }
    }
}

fn parse_line(node_id: &str, line: &str) -> EventInput {
    match serde_json::from_str::<EventInput>(line) {
        Ok(input) => input,
        Err(_) => EventInput::for_node(
            node_id,
            EventType::Log,
            serde_json::json!({"level": "warn", "message": line}),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_line_parses_as_its_own_event_type() {
        let line = serde_json::json!({"type": "metric", "data": {"value": 1}}).to_string();
        let input = parse_line("n1", &line);
        assert_eq!(input.event_type, EventType::Metric);
    }

    #[test]
    fn malformed_line_becomes_a_warn_log_event() {
        let input = parse_line("n1", "not json at all");
        assert_eq!(input.event_type, EventType::Log);
        assert_eq!(input.data["level"], "warn");
        assert_eq!(input.data["message"], "not json at all");
    }
}

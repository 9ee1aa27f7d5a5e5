//! Host functions exposed to sandboxed code.
//!
//! Only three exist: append a log line, store the result envelope, and
//! sleep (backs the timer globals). Nothing else in the host is reachable.

use deno_core::{op2, OpState};
use std::time::Duration;

/// Logs are cut off past this size
pub const MAX_LOG_BYTES: usize = 1024 * 1024;

const TRUNCATED_MARKER: &str = "[TRUNCATED]\n";

#[derive(Debug, Default)]
pub struct LogBuffer {
    text: String,
    truncated: bool,
}

impl LogBuffer {
    pub fn push_line(&mut self, line: &str) {
        if self.truncated {
            return;
        }
        if self.text.len() + line.len() + 1 > MAX_LOG_BYTES {
            self.text.push_str(TRUNCATED_MARKER);
            self.truncated = true;
            return;
        }
        self.text.push_str(line);
        self.text.push('\n');
    }

    pub fn take(&mut self) -> String {
        std::mem::take(&mut self.text)
    }
}

/// JSON envelope set by the wrapper: `{"ok": value}` or `{"error": message}`
#[derive(Debug, Clone)]
pub struct ResultSlot(pub String);

#[op2]
pub fn op_runner_log(state: &mut OpState, #[string] line: String) {
    if let Some(buffer) = state.try_borrow_mut::<LogBuffer>() {
        buffer.push_line(&line);
    }
}

#[op2]
pub fn op_runner_set_result(state: &mut OpState, #[string] json: String) {
    // First result wins; a second call means user code got hold of the op
    if state.try_borrow::<ResultSlot>().is_none() {
        state.put(ResultSlot(json));
    }
}

#[op2(async)]
pub async fn op_runner_sleep(ms: f64) {
    let ms = if ms.is_finite() { ms.max(0.0) } else { 0.0 };
    tokio::time::sleep(Duration::from_secs_f64(ms / 1000.0)).await;
}

deno_core::extension!(
    runner_ext,
    ops = [op_runner_log, op_runner_set_result, op_runner_sleep]
);

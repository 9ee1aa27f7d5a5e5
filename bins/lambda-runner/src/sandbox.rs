//! Sandbox Runner core: evaluate one snippet in a fresh V8 isolate.
//!
//! Each call builds a brand new runtime, so nothing survives between runs.
//! The container around this process is the real isolation boundary; the
//! isolate only has the three host ops from `ops.rs`.

use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use lambda_common::types::{ExecutionResult, RunnerInput};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::time::{Duration, Instant};

use crate::ops::{runner_ext, LogBuffer, ResultSlot};

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_HEAP_MB: usize = 384;

/// Limits applied inside the runner, read from the container environment
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub timeout: Duration,
    pub heap_bytes: usize,
}

impl RunnerSettings {
    pub fn from_env() -> Self {
        let timeout_ms = std::env::var("LAMBDA_RUNNER_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_TIMEOUT_MS);
        let heap_mb = std::env::var("LAMBDA_RUNNER_HEAP_MB")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_HEAP_MB);

        Self {
            timeout: Duration::from_millis(timeout_ms),
            heap_bytes: heap_mb.saturating_mul(1024 * 1024),
        }
    }
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            heap_bytes: DEFAULT_HEAP_MB * 1024 * 1024,
        }
    }
}

/// Installs console capture and timers, then strips host and codegen globals.
const BOOTSTRAP: &str = r#"
((ops) => {
    const show = (value) => {
        if (typeof value === 'string') return value;
        if (value instanceof Error) return value.stack || String(value);
        if (value !== null && typeof value === 'object') {
            try { return JSON.stringify(value); } catch (_) { return String(value); }
        }
        return String(value);
    };
    const emit = (tag) => (...args) => ops.op_runner_log(tag + args.map(show).join(' '));
    globalThis.console = Object.freeze({
        log: emit(''),
        debug: emit(''),
        info: emit('[INFO] '),
        warn: emit('[WARN] '),
        error: emit('[ERROR] '),
    });

    const sleep = ops.op_runner_sleep;
    const timers = new Set();
    let nextTimer = 1;
    const schedule = (fn, ms, args, repeat) => {
        const id = nextTimer++;
        timers.add(id);
        const tick = () => {
            sleep(Number(ms) || 0).then(() => {
                if (!timers.has(id)) return;
                if (!repeat) timers.delete(id);
                fn(...args);
                if (repeat && timers.has(id)) tick();
            });
        };
        tick();
        return id;
    };
    globalThis.setTimeout = (fn, ms, ...args) => schedule(fn, ms, args, false);
    globalThis.setInterval = (fn, ms, ...args) => schedule(fn, ms, args, true);
    globalThis.clearTimeout = (id) => { timers.delete(id); };
    globalThis.clearInterval = globalThis.clearTimeout;

    const setResult = ops.op_runner_set_result;
    Object.defineProperty(globalThis, '__lambdaFinish', {
        value: (json) => setResult(json),
        enumerable: false, configurable: false, writable: false,
    });

    delete globalThis.Deno;
    delete globalThis.eval;
    const AsyncFunction = (async function(){}).constructor;
    const GeneratorFunction = (function*(){}).constructor;
    const AsyncGeneratorFunction = (async function*(){}).constructor;
    const prototypes = [
        Function.prototype,
        AsyncFunction.prototype,
        GeneratorFunction.prototype,
        AsyncGeneratorFunction.prototype,
    ];
    for (const proto of prototypes) {
        Object.defineProperty(proto, 'constructor', {
            value: undefined, configurable: false, writable: false,
        });
    }
    // `instanceof Function` keeps working through the shared prototype
    const blocked = function Function() {
        throw new EvalError('Code generation from strings is disabled');
    };
    blocked.prototype = prototypes[0];
    Object.defineProperty(globalThis, 'Function', {
        value: blocked, configurable: false, writable: false, enumerable: false,
    });
})(Deno.core.ops);
"#;

/// Wrap user code so its declarations live in one function scope and
/// `main`, if declared, is called with the spread arguments.
fn wrap(code: &str, args_json: &str) -> Result<String, serde_json::Error> {
    let args_literal = serde_json::to_string(args_json)?;
    Ok(format!(
        r#"
(async () => {{
    const __lambdaArgs = JSON.parse({args_literal});
    try {{
        const __lambdaValue = await (async function () {{
{code}
            if (typeof main === 'function') {{
                return await main(...__lambdaArgs);
            }}
            return undefined;
        }})();
        __lambdaFinish(JSON.stringify({{ ok: __lambdaValue }}));
    }} catch (e) {{
        const message = e !== null && typeof e === 'object' && 'message' in e
            ? String(e.message)
            : String(e);
        __lambdaFinish(JSON.stringify({{ error: message }}));
    }}
}})();
"#
    ))
}

/// State for the near-heap-limit callback
struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points at the boxed HeapLimitState owned by `execute`,
    // which drops the runtime before the box.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    // Headroom for the termination to unwind
    current_heap_limit + 1024 * 1024
}

fn create_runtime(heap_bytes: usize) -> JsRuntime {
    let create_params = v8::CreateParams::default().heap_limits(0, heap_bytes);
    let runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![runner_ext::init()],
        create_params: Some(create_params),
        ..Default::default()
    });
    runtime.op_state().borrow_mut().put(LogBuffer::default());
    runtime
}

/// Run one input to completion and build the result envelope
pub async fn execute(input: &RunnerInput, settings: &RunnerSettings) -> ExecutionResult {
    let args_json = match serde_json::to_string(&input.args) {
        Ok(json) => json,
        Err(e) => return ExecutionResult::failure(e.to_string(), String::new(), Duration::ZERO),
    };
    let wrapped = match wrap(&input.code, &args_json) {
        Ok(wrapped) => wrapped,
        Err(e) => return ExecutionResult::failure(e.to_string(), String::new(), Duration::ZERO),
    };

    let mut runtime = create_runtime(settings.heap_bytes);
    if let Err(e) = runtime.execute_script("[lambda:bootstrap]", BOOTSTRAP.to_string()) {
        return ExecutionResult::failure(e.to_string(), String::new(), Duration::ZERO);
    }

    let heap_state = Box::new(HeapLimitState {
        handle: runtime.v8_isolate().thread_safe_handle(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
    );

    // CPU-bound code never yields to the event loop, so a separate thread
    // has to terminate the isolate
    let watchdog_handle = runtime.v8_isolate().thread_safe_handle();
    let timed_out = Arc::new(AtomicBool::new(false));
    let watchdog_timed_out = timed_out.clone();
    let timeout = settings.timeout;
    let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();
    let watchdog = std::thread::spawn(move || {
        if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(timeout) {
            watchdog_timed_out.store(true, Ordering::SeqCst);
            watchdog_handle.terminate_execution();
        }
    });

    let started = Instant::now();
    let exec_error = match runtime.execute_script("[lambda:main]", wrapped) {
        Ok(_) => {
            let remaining = timeout.saturating_sub(started.elapsed());
            match tokio::time::timeout(remaining, settle(&mut runtime)).await {
                Ok(Ok(())) => None,
                Ok(Err(message)) => Some(message),
                Err(_) => {
                    timed_out.store(true, Ordering::SeqCst);
                    None
                }
            }
        }
        Err(e) => Some(e.to_string()),
    };
    let elapsed = started.elapsed();

    let _ = cancel_tx.send(());
    let _ = watchdog.join();

    let (logs, slot) = {
        let state = runtime.op_state();
        let mut state = state.borrow_mut();
        let logs = state
            .try_borrow_mut::<LogBuffer>()
            .map(LogBuffer::take)
            .unwrap_or_default();
        let slot = state.try_take::<ResultSlot>();
        (logs, slot)
    };

    // A settled main wins over anything that happened after it
    let result = if heap_state.triggered.load(Ordering::SeqCst) {
        ExecutionResult::failure("Memory limit exceeded", logs, elapsed)
    } else if let Some(ResultSlot(json)) = slot {
        from_envelope(&json, logs, elapsed)
    } else if timed_out.load(Ordering::SeqCst) {
        ExecutionResult::failure(
            format!("Execution timeout ({}ms)", timeout.as_millis()),
            logs,
            elapsed,
        )
    } else if let Some(message) = exec_error {
        ExecutionResult::failure(message, logs, elapsed)
    } else {
        ExecutionResult::failure("Execution finished without a result", logs, elapsed)
    };

    drop(runtime);
    drop(heap_state);
    result
}

/// Drive the event loop until the wrapper has stored a result or the loop
/// runs out of work. Timers left behind by user code do not hold the run open.
async fn settle(runtime: &mut JsRuntime) -> Result<(), String> {
    std::future::poll_fn(|cx| {
        if has_result(runtime) {
            return Poll::Ready(Ok(()));
        }
        let poll = runtime.poll_event_loop(cx, PollEventLoopOptions::default());
        if has_result(runtime) {
            return Poll::Ready(Ok(()));
        }
        poll.map_err(|e| e.to_string())
    })
    .await
}

fn has_result(runtime: &JsRuntime) -> bool {
    runtime.op_state().borrow().has::<ResultSlot>()
}

fn from_envelope(json: &str, logs: String, elapsed: Duration) -> ExecutionResult {
    match serde_json::from_str::<Value>(json) {
        Ok(envelope) => match envelope.get("error") {
            Some(error) => {
                let message = error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string());
                ExecutionResult::failure(message, logs, elapsed)
            }
            None => ExecutionResult::success(envelope.get("ok").cloned(), logs, elapsed),
        },
        Err(e) => ExecutionResult::failure(format!("Malformed result: {}", e), logs, elapsed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input(code: &str, args: Vec<Value>) -> RunnerInput {
        RunnerInput {
            code: code.to_string(),
            args,
        }
    }

    fn settings(timeout_ms: u64) -> RunnerSettings {
        RunnerSettings {
            timeout: Duration::from_millis(timeout_ms),
            ..RunnerSettings::default()
        }
    }

    #[tokio::test]
    async fn test_main_receives_spread_args() {
        let code = "function main(a, b) { console.log('adding', a, b); return a + b; }";
        let result = execute(&input(code, vec![json!(5), json!(3)]), &settings(5_000)).await;

        assert!(result.success, "{:?}", result);
        assert_eq!(result.result, Some(json!(8)));
        assert_eq!(result.logs, "adding 5 3\n");
        assert!(result.execution_time >= 0.0);
    }

    #[tokio::test]
    async fn test_thrown_error_is_reported_with_logs() {
        let code = "function main() { console.log('before'); throw new Error('boom'); }";
        let result = execute(&input(code, vec![]), &settings(5_000)).await;

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("boom"));
        assert_eq!(result.logs, "before\n");
        assert_eq!(result.result, None);
    }

    #[tokio::test]
    async fn test_infinite_loop_times_out() {
        let started = Instant::now();
        let result = execute(&input("function main() { while (true) {} }", vec![]), &settings(300)).await;

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Execution timeout (300ms)"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_log_levels_are_tagged_in_order() {
        let code = r#"
            function main() {
                console.log('one');
                console.info('two');
                console.warn('three');
                console.error('four', { n: 4 });
            }
        "#;
        let result = execute(&input(code, vec![]), &settings(5_000)).await;

        assert!(result.success);
        assert_eq!(
            result.logs,
            "one\n[INFO] two\n[WARN] three\n[ERROR] four {\"n\":4}\n"
        );
    }

    #[tokio::test]
    async fn test_async_main_with_timer() {
        let code = r#"
            async function main(x) {
                await new Promise((resolve) => setTimeout(resolve, 20));
                console.log('waited');
                return { doubled: x * 2 };
            }
        "#;
        let result = execute(&input(code, vec![json!(21)]), &settings(5_000)).await;

        assert!(result.success, "{:?}", result);
        assert_eq!(result.result, Some(json!({ "doubled": 42 })));
        assert_eq!(result.logs, "waited\n");
    }

    #[tokio::test]
    async fn test_without_main_there_is_no_result() {
        let result = execute(&input("console.log('top level');", vec![]), &settings(5_000)).await;

        assert!(result.success);
        assert_eq!(result.result, None);
        assert_eq!(result.logs, "top level\n");
    }

    #[tokio::test]
    async fn test_explicit_null_result() {
        let result = execute(&input("function main() { return null; }", vec![]), &settings(5_000)).await;
        assert!(result.success);
        assert_eq!(result.result, Some(Value::Null));
    }

    #[tokio::test]
    async fn test_host_globals_are_gone() {
        let code = "function main() { return [typeof Deno, typeof eval, typeof require, typeof process]; }";
        let result = execute(&input(code, vec![]), &settings(5_000)).await;

        assert!(result.success, "{:?}", result);
        assert_eq!(
            result.result,
            Some(json!(["undefined", "undefined", "undefined", "undefined"]))
        );
    }

    #[tokio::test]
    async fn test_function_constructor_is_blocked() {
        let code = "function main() { return (function(){}).constructor('return 1')(); }";
        let result = execute(&input(code, vec![]), &settings(5_000)).await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_global_function_cannot_compile_strings() {
        for code in [
            "function main() { return Function('return 1 + 1')(); }",
            "function main() { return new Function('return 1 + 1')(); }",
            "function main() { return (async function*(){}).constructor('yield 1'); }",
        ] {
            let result = execute(&input(code, vec![]), &settings(5_000)).await;
            assert!(!result.success, "{} -> {:?}", code, result);
        }
    }

    #[tokio::test]
    async fn test_instanceof_function_still_works() {
        let code = "function main() { return [(() => 1) instanceof Function, typeof Function]; }";
        let result = execute(&input(code, vec![]), &settings(5_000)).await;

        assert!(result.success, "{:?}", result);
        assert_eq!(result.result, Some(json!([true, "function"])));
    }

    #[tokio::test]
    async fn test_pending_timers_do_not_hold_the_result() {
        let code = r#"
            function main() {
                setTimeout(() => console.log('late'), 60000);
                setInterval(() => {}, 10);
                return 7;
            }
        "#;
        let started = Instant::now();
        let result = execute(&input(code, vec![]), &settings(3_000)).await;

        assert!(result.success, "{:?}", result);
        assert_eq!(result.result, Some(json!(7)));
        assert_eq!(result.logs, "");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_async_main_returns_before_its_timers() {
        let code = r#"
            async function main() {
                await new Promise((resolve) => setTimeout(resolve, 10));
                setTimeout(() => {}, 60000);
                return 'done';
            }
        "#;
        let result = execute(&input(code, vec![]), &settings(3_000)).await;

        assert!(result.success, "{:?}", result);
        assert_eq!(result.result, Some(json!("done")));
    }

    #[tokio::test]
    async fn test_syntax_error_fails() {
        let result = execute(&input("function main( {", vec![]), &settings(5_000)).await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("SyntaxError"));
    }

    #[tokio::test]
    async fn test_never_settling_main_fails() {
        let code = "function main() { return new Promise(() => {}); }";
        let result = execute(&input(code, vec![]), &settings(500)).await;
        assert!(!result.success);
    }

    #[test]
    fn test_wrap_escapes_args() {
        let wrapped = wrap("function main(s) { return s; }", r#"["a\"b</script>"]"#).unwrap();
        assert!(wrapped.contains(r#"JSON.parse("[\"a\\\"b</script>\"]")"#));
    }

    #[test]
    fn test_envelope_error_value() {
        let result = from_envelope(r#"{"error":"bad"}"#, String::new(), Duration::ZERO);
        assert_eq!(result.error.as_deref(), Some("bad"));

        let result = from_envelope(r#"{}"#, String::new(), Duration::ZERO);
        assert!(result.success);
        assert_eq!(result.result, None);
    }
}

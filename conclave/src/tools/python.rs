//! Python handler execution via a spawned interpreter.
//!
//! The stored code is wrapped in a harness that requires a `handler(params)`
//! function, feeds it the argument object from argv, and prints the result
//! (dicts and lists JSON-encoded, everything else stringified). Handler
//! exceptions and a missing handler both come back as `{"error": ...}` JSON
//! so the model sees a normal tool result.

use std::process::Stdio;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::warn;

/// Harness appended after the tool code. Reads params JSON from stdin so
/// argument content never hits the command line.
const HARNESS: &str = r#"

import json as _conclave_json
import sys as _conclave_sys

def _conclave_main():
    if 'handler' not in globals() or not callable(globals()['handler']):
        print(_conclave_json.dumps({"error": "No 'handler' function found in tool code"}))
        return
    try:
        _params = _conclave_json.load(_conclave_sys.stdin)
    except Exception:
        _params = {}
    try:
        _result = globals()['handler'](_params)
    except Exception as _e:
        print(_conclave_json.dumps({"error": str(_e)}))
        return
    if isinstance(_result, (dict, list)):
        print(_conclave_json.dumps(_result))
    elif _result is None:
        print("")
    else:
        print(_result)

_conclave_main()
"#;

/// Runs `code` + harness under `python_bin`, returning the printed result or
/// an error JSON string.
pub async fn run_python_handler(
    python_bin: &str,
    code: &str,
    arguments: &Value,
    timeout: Duration,
) -> String {
    let program = format!("{}{}", code, HARNESS);
    let params = arguments.to_string();

    let spawn = Command::new(python_bin)
        .arg("-c")
        .arg(&program)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let mut child = match spawn {
        Ok(child) => child,
        Err(e) => {
            warn!(python = python_bin, error = %e, "failed to spawn python handler");
            return json!({"error": format!("failed to start interpreter: {}", e)}).to_string();
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(params.as_bytes()).await {
            return json!({"error": format!("failed to write params: {}", e)}).to_string();
        }
        // Close stdin so json.load sees EOF.
        drop(stdin);
    }

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return json!({"error": format!("interpreter failed: {}", e)}).to_string();
        }
        Err(_) => {
            return json!({"error": "tool execution timed out"}).to_string();
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let line = stderr.lines().last().unwrap_or("interpreter error");
        return json!({"error": line}).to_string();
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout.trim_end_matches('\n').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: a handler returning a reversed string prints it plainly.
    #[tokio::test]
    #[ignore = "requires python3 on PATH"]
    async fn returns_plain_string() {
        let code = "def handler(params):\n    return params.get('text', '')[::-1]";
        let out = run_python_handler(
            "python3",
            code,
            &json!({"text": "hello"}),
            Duration::from_secs(10),
        )
        .await;
        assert_eq!(out, "olleh");
    }

    /// **Scenario**: dict results are JSON-encoded.
    #[tokio::test]
    #[ignore = "requires python3 on PATH"]
    async fn dict_result_json_encoded() {
        let code = "def handler(params):\n    return {\"n\": params.get('n', 0) * 2}";
        let out = run_python_handler("python3", code, &json!({"n": 21}), Duration::from_secs(10))
            .await;
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["n"], 42);
    }

    /// **Scenario**: code without a handler reports the standard error.
    #[tokio::test]
    #[ignore = "requires python3 on PATH"]
    async fn missing_handler_reports_error() {
        let out =
            run_python_handler("python3", "x = 1", &json!({}), Duration::from_secs(10)).await;
        let v: Value = serde_json::from_str(&out).unwrap();
        assert!(v["error"].as_str().unwrap().contains("handler"));
    }

    /// **Scenario**: handler exceptions convert to error JSON.
    #[tokio::test]
    #[ignore = "requires python3 on PATH"]
    async fn handler_exception_becomes_error_json() {
        let code = "def handler(params):\n    raise ValueError('bad input')";
        let out = run_python_handler("python3", code, &json!({}), Duration::from_secs(10)).await;
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["error"], "bad input");
    }

    /// **Scenario**: a missing interpreter yields an error string, not a panic.
    #[tokio::test]
    async fn missing_interpreter_is_an_error() {
        let out = run_python_handler(
            "definitely-not-a-python",
            "def handler(params):\n    return 1",
            &json!({}),
            Duration::from_secs(5),
        )
        .await;
        let v: Value = serde_json::from_str(&out).unwrap();
        assert!(v["error"].as_str().unwrap().contains("interpreter"));
    }
}

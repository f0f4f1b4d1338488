//! Result normalizer. Folds the three protocol output shapes into the
//! single `ExecutionResult` the caller and the audit trail see. A tool
//! that ran but reported failure is a *semantic* failure: it normalizes
//! to `success = false` with an error class, never to an engine error.

use crate::engines::connection::RawOutput;
use crate::engines::Engine;
use crate::types::ExecutionResult;

pub struct ResultNormalizer {
    max_output_bytes: usize,
}

impl ResultNormalizer {
    pub fn new(max_output_bytes: usize) -> Self {
        Self { max_output_bytes }
    }

    pub fn normalize(&self, raw: RawOutput, duration_ms: u64) -> ExecutionResult {
        let (success, status_code, output, error_class) = match raw {
            RawOutput::Command {
                exit_code,
                stdout,
                stderr,
            } => {
                let success = exit_code == 0;
                // Failed commands usually explain themselves on stderr;
                // keep both streams, stdout first.
                let output = if stderr.is_empty() {
                    stdout
                } else if stdout.is_empty() {
                    stderr
                } else {
                    format!("{stdout}\n{stderr}")
                };
                let error_class = (!success).then(|| "command-failed".to_string());
                (success, i64::from(exit_code), output, error_class)
            }
            RawOutput::Management {
                status_code,
                fault,
                payload,
            } => {
                let success = fault.is_none() && (status_code == 0 || (200..300).contains(&status_code));
                let output = match &fault {
                    Some(fault) if payload.is_empty() => fault.clone(),
                    Some(fault) => format!("{fault}\n{payload}"),
                    None => payload,
                };
                let error_class = (!success).then(|| "management-fault".to_string());
                (success, status_code, output, error_class)
            }
            RawOutput::Http { status, body } => {
                let success = (200..300).contains(&status);
                let error_class = (!success).then(|| format!("http-{status}"));
                (success, i64::from(status), body, error_class)
            }
        };

        let (output, truncated) = bound_utf8(output, self.max_output_bytes);
        ExecutionResult {
            success,
            status_code,
            output,
            truncated,
            invocations: Vec::new(),
            duration_ms,
            error_class,
        }
    }
}

/// Truncate to at most `limit` bytes without splitting a UTF-8
/// character.
pub fn bound_utf8(mut s: String, limit: usize) -> (String, bool) {
    if s.len() <= limit {
        return (s, false);
    }
    let mut cut = limit;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
    (s, true)
}

impl Engine for ResultNormalizer {
    fn get_state(&self) -> String {
        "ready".to_string()
    }

    fn get_dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn health_check(&self) -> bool {
        true
    }

    fn initialize(&self) -> bool {
        true
    }

    fn shutdown(&self) -> bool {
        true
    }
}

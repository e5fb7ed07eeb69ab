//! Progress markers printed by the sandbox script.
//!
//! The script echoes `@@step <id> <action>` before each step and `@@complete`
//! after the last one. The executor reads them back to name the failing step.

pub const STEP_MARKER: &str = "@@step";
pub const COMPLETE_MARKER: &str = "@@complete";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker<'a> {
    Step { id: &'a str, action: &'a str },
    Complete,
}

/// Parse one output line into a marker, if it is one.
pub fn parse_marker(line: &str) -> Option<Marker<'_>> {
    let line = line.trim_end();
    if line == COMPLETE_MARKER {
        return Some(Marker::Complete);
    }
    let rest = line.strip_prefix(STEP_MARKER)?.strip_prefix(' ')?;
    let (id, action) = rest.split_once(' ')?;
    if id.is_empty() || action.is_empty() {
        return None;
    }
    Some(Marker::Step { id, action })
}

/// Summary of the markers seen in a captured stdout stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkerTrace {
    /// Id of the last step that started.
    pub last_step: Option<String>,
    pub steps_started: usize,
    pub completed: bool,
}

impl MarkerTrace {
    /// Record one output line.
    pub fn observe(&mut self, line: &str) {
        match parse_marker(line) {
            Some(Marker::Step { id, .. }) => {
                self.last_step = Some(id.to_string());
                self.steps_started += 1;
            }
            Some(Marker::Complete) => self.completed = true,
            None => {}
        }
    }
}

pub fn trace(stdout: &str) -> MarkerTrace {
    let mut trace = MarkerTrace::default();
    for line in stdout.lines() {
        trace.observe(line);
    }
    trace
}

//! Console collaborator
//!
//! The interpreter never renders. It emits characters and strings through
//! this trait and makes exactly one blocking `read_line` call per input
//! opcode. Diagnostic logging has default implementations onto the `log`
//! crate so hosts only override them when they render diagnostics
//! themselves.

use log::{debug, error};
use std::collections::VecDeque;
use std::io::{self, BufRead, Write};

pub trait Console {
    fn write_char(&mut self, c: char);
    fn write_str(&mut self, s: &str);
    /// Block until the host delivers one line of input, without the
    /// trailing newline.
    fn read_line(&mut self) -> String;

    fn log_debug(&mut self, msg: &str) {
        debug!("{}", msg);
    }

    fn log_error(&mut self, msg: &str) {
        error!("{}", msg);
    }
}

/// Plain stdout/stdin console used by the terminal binary.
pub struct TerminalConsole;

impl Console for TerminalConsole {
    fn write_char(&mut self, c: char) {
        print!("{}", c);
        let _ = io::stdout().flush();
    }

    fn write_str(&mut self, s: &str) {
        print!("{}", s);
        let _ = io::stdout().flush();
    }

    fn read_line(&mut self) -> String {
        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line).is_err() {
            return String::new();
        }
        line.trim_end_matches(['\n', '\r']).to_string()
    }
}

/// Scripted console: queued input lines, captured output. Used by the test
/// suite and by headless hosts.
pub struct RecordingConsole {
    pub output: String,
    pub inputs: VecDeque<String>,
    pub errors: Vec<String>,
}

impl RecordingConsole {
    pub fn new() -> Self {
        RecordingConsole {
            output: String::new(),
            inputs: VecDeque::new(),
            errors: Vec::new(),
        }
    }

    pub fn with_input(lines: &[&str]) -> Self {
        let mut console = RecordingConsole::new();
        for line in lines {
            console.inputs.push_back(line.to_string());
        }
        console
    }
}

impl Default for RecordingConsole {
    fn default() -> Self {
        Self::new()
    }
}

impl Console for RecordingConsole {
    fn write_char(&mut self, c: char) {
        self.output.push(c);
    }

    fn write_str(&mut self, s: &str) {
        self.output.push_str(s);
    }

    fn read_line(&mut self) -> String {
        self.inputs.pop_front().unwrap_or_default()
    }

    fn log_error(&mut self, msg: &str) {
        error!("{}", msg);
        self.errors.push(msg.to_string());
    }
}

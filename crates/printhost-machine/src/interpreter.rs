//! Command interpretation for builds
//!
//! Turns a source line into device instructions and program-flow
//! directives. G-code semantics beyond dispatch are left to the firmware.

use printhost_communication::firmware::reprap::{command_code, strip_comments};
use std::fmt;

/// What a source line asks the build to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceInstruction {
    /// Send an instruction to the destination
    Send(String),
    /// `M0`: stop the build
    UnconditionalHalt,
    /// `M1`: stop unless the operator chooses to continue
    OptionalHalt,
    /// `M2`: end of program
    ProgramEnd,
    /// `M30`: restart the program from the beginning
    ProgramRewind,
}

impl fmt::Display for DeviceInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send(text) => write!(f, "{}", text),
            Self::UnconditionalHalt => write!(f, "unconditional halt"),
            Self::OptionalHalt => write!(f, "optional halt"),
            Self::ProgramEnd => write!(f, "program end"),
            Self::ProgramRewind => write!(f, "program rewind"),
        }
    }
}

/// Interpreter for G-code job lines
#[derive(Debug, Clone, Copy, Default)]
pub struct GcodeInterpreter;

impl GcodeInterpreter {
    /// Create an interpreter
    pub fn new() -> Self {
        Self
    }

    /// Interpret one source line
    ///
    /// Comments, line numbers and checksums already present in the job are
    /// removed; the driver frames lines itself.
    pub fn interpret(&self, line: &str) -> Vec<DeviceInstruction> {
        let cleaned = strip_comments(line);
        let words: Vec<&str> = cleaned
            .split_whitespace()
            .skip_while(|w| is_line_number(w))
            .take_while(|w| !w.starts_with('*'))
            .collect();
        if words.is_empty() {
            return Vec::new();
        }
        let instruction = words.join(" ");

        let directive = match command_code(&instruction) {
            Some(('M', 0)) => DeviceInstruction::UnconditionalHalt,
            Some(('M', 1)) => DeviceInstruction::OptionalHalt,
            Some(('M', 2)) => DeviceInstruction::ProgramEnd,
            Some(('M', 30)) => DeviceInstruction::ProgramRewind,
            _ => DeviceInstruction::Send(instruction),
        };
        vec![directive]
    }
}

fn is_line_number(word: &str) -> bool {
    match word.strip_prefix(['N', 'n']) {
        Some(digits) => !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interpret(line: &str) -> Vec<DeviceInstruction> {
        GcodeInterpreter::new().interpret(line)
    }

    #[test]
    fn test_plain_instruction() {
        assert_eq!(
            interpret("G1 X10 Y5 F1200 ; perimeter"),
            vec![DeviceInstruction::Send("G1 X10 Y5 F1200".to_string())]
        );
    }

    #[test]
    fn test_blank_and_comment_lines() {
        assert!(interpret("").is_empty());
        assert!(interpret("(setup)").is_empty());
        assert!(interpret("; layer 3").is_empty());
    }

    #[test]
    fn test_strips_existing_framing() {
        assert_eq!(
            interpret("N42 G28 X0 *87"),
            vec![DeviceInstruction::Send("G28 X0".to_string())]
        );
    }

    #[test]
    fn test_program_flow_directives() {
        assert_eq!(interpret("M0"), vec![DeviceInstruction::UnconditionalHalt]);
        assert_eq!(interpret("M00 ; wait"), vec![DeviceInstruction::UnconditionalHalt]);
        assert_eq!(interpret("M1"), vec![DeviceInstruction::OptionalHalt]);
        assert_eq!(interpret("M2"), vec![DeviceInstruction::ProgramEnd]);
        assert_eq!(interpret("M30"), vec![DeviceInstruction::ProgramRewind]);
        assert_eq!(
            interpret("M104 S0"),
            vec![DeviceInstruction::Send("M104 S0".to_string())]
        );
    }
}

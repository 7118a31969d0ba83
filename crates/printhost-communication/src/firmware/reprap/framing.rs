//! RepRap line framing
//!
//! Every outgoing instruction is cleaned, optionally rewritten for the
//! firmware dialect, numbered and checksummed:
//!
//! ```text
//! N<line> <instruction> *<xor of every preceding byte, including the space>
//! ```

use super::response_parser::{DeviceResponse, ResponseParser};

/// A numbered instruction body, before checksumming
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumberedLine {
    /// Line number to frame with
    pub number: u32,
    /// Instruction text without any line number
    pub body: String,
}

/// Framing and parsing capability of a line-based firmware
pub trait LineProtocol: Send + Sync {
    /// Clean an instruction and apply dialect rewrites; `None` when nothing is left to send
    fn prepare(&self, instruction: &str) -> Option<String>;

    /// Decide the line number for a prepared instruction given the current counter
    fn assign_line_number(&self, instruction: &str, counter: u32) -> NumberedLine;

    /// Frame a numbered body into the text sent on the wire, without the newline
    fn frame(&self, number: u32, body: &str) -> String;

    /// Line number embedded in a framed line
    fn line_number_of(&self, framed: &str) -> Option<u32>;

    /// Classify a response line
    fn parse_response(&self, line: &str) -> Option<DeviceResponse>;
}

/// XOR of all bytes
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Remove `( ... )` and `; ...` comments and surrounding whitespace
pub fn strip_comments(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut depth = 0usize;

    for c in line.chars() {
        match c {
            ';' if depth == 0 => break,
            '(' => depth += 1,
            ')' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }

    out.trim().to_string()
}

/// The leading command word, e.g. `('M', 110)` for `M110`
pub fn command_code(instruction: &str) -> Option<(char, u32)> {
    let word = instruction.split_whitespace().next()?;
    let mut chars = word.chars();
    let letter = chars.next()?.to_ascii_uppercase();
    let number = chars.as_str().split('.').next()?.parse().ok()?;
    Some((letter, number))
}

/// Value of the first word starting with `letter`, e.g. `F` in `G1 X10 F500`
pub fn word_value(instruction: &str, letter: char) -> Option<f64> {
    instruction
        .split_whitespace()
        .skip(1)
        .find_map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(c) if c.eq_ignore_ascii_case(&letter) => chars.as_str().parse().ok(),
                _ => None,
            }
        })
}

/// Render a number with at most six decimals and no trailing zeros
pub fn format_number(value: f64) -> String {
    let text = format!("{:.6}", value);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    match text {
        "-0" | "" => "0".to_string(),
        _ => text.to_string(),
    }
}

/// Explicit `N<k>` prefix of an instruction, split from the rest
fn explicit_line_number(instruction: &str) -> Option<(u32, &str)> {
    let rest = instruction.strip_prefix(['N', 'n'])?;
    let digits = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if digits == 0 {
        return None;
    }
    let number = rest[..digits].parse().ok()?;
    let body = &rest[digits..];
    if !body.is_empty() && !body.starts_with(char::is_whitespace) {
        return None;
    }
    Some((number, body.trim()))
}

/// RepRap/Marlin style line protocol
#[derive(Debug, Clone)]
pub struct RepRapProtocol {
    five_d: bool,
    parser: ResponseParser,
}

impl RepRapProtocol {
    /// Create a protocol; `five_d` enables rewrites for 5D firmware
    pub fn new(five_d: bool) -> Self {
        Self {
            five_d,
            parser: ResponseParser::new(),
        }
    }

    /// Apply 5D firmware rewrites; `None` drops the instruction
    ///
    /// - `M1`, `M101`, `M102`, `M103` are not understood by 5D firmware
    /// - a trailing `F<f> E<e>` pair is sent as `E<e> F<f>`
    pub fn rewrite_for_five_d(instruction: &str) -> Option<String> {
        if let Some(('M', 1 | 101 | 102 | 103)) = command_code(instruction) {
            tracing::debug!("Dropping legacy instruction: {}", instruction);
            return None;
        }

        let mut words: Vec<&str> = instruction.split_whitespace().collect();
        let n = words.len();
        if n >= 3
            && words[n - 1].starts_with(['E', 'e'])
            && words[n - 2].starts_with(['F', 'f'])
        {
            words.swap(n - 1, n - 2);
            return Some(words.join(" "));
        }

        Some(instruction.to_string())
    }

    /// Split a framed line back into its number and body, verifying the checksum
    pub fn decode(framed: &str) -> Option<(u32, String)> {
        let (prefix, sum) = framed.rsplit_once('*')?;
        if sum.trim().parse::<u8>().ok()? != checksum(prefix.as_bytes()) {
            return None;
        }
        let (number, body) = explicit_line_number(prefix.trim_end())?;
        Some((number, body.to_string()))
    }
}

impl Default for RepRapProtocol {
    fn default() -> Self {
        Self::new(true)
    }
}

impl LineProtocol for RepRapProtocol {
    fn prepare(&self, instruction: &str) -> Option<String> {
        let cleaned = strip_comments(instruction);
        if cleaned.is_empty() {
            return None;
        }

        if self.five_d {
            Self::rewrite_for_five_d(&cleaned)
        } else {
            Some(cleaned)
        }
    }

    fn assign_line_number(&self, instruction: &str, counter: u32) -> NumberedLine {
        if let Some((number, body)) = explicit_line_number(instruction) {
            return NumberedLine {
                number,
                body: body.to_string(),
            };
        }

        if let Some(('M', 110)) = command_code(instruction) {
            // "M110" resets to zero, "M110 N<k>" sets k
            let number = word_value(instruction, 'N').map(|n| n as u32).unwrap_or(0);
            return NumberedLine {
                number,
                body: "M110".to_string(),
            };
        }

        NumberedLine {
            number: counter.wrapping_add(1),
            body: instruction.to_string(),
        }
    }

    fn frame(&self, number: u32, body: &str) -> String {
        let prefix = if body.is_empty() {
            format!("N{} ", number)
        } else {
            format!("N{} {} ", number, body)
        };
        let sum = checksum(prefix.as_bytes());
        format!("{}*{}", prefix, sum)
    }

    fn line_number_of(&self, framed: &str) -> Option<u32> {
        explicit_line_number(framed).map(|(number, _)| number)
    }

    fn parse_response(&self, line: &str) -> Option<DeviceResponse> {
        self.parser.parse(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_first_line_after_reset() {
        let protocol = RepRapProtocol::default();
        let numbered = protocol.assign_line_number("G1 X10 Y10 F500", 0);
        assert_eq!(numbered.number, 1);

        let framed = protocol.frame(numbered.number, &numbered.body);
        let expected = checksum(b"N1 G1 X10 Y10 F500 ");
        assert_eq!(framed, format!("N1 G1 X10 Y10 F500 *{}", expected));
    }

    #[test]
    fn test_m110_resets_counter() {
        let protocol = RepRapProtocol::default();
        let numbered = protocol.assign_line_number("M110", 42);
        assert_eq!(numbered.number, 0);
        assert_eq!(protocol.frame(0, &numbered.body), format!("N0 M110 *{}", checksum(b"N0 M110 ")));

        let numbered = protocol.assign_line_number("M110 N7", 42);
        assert_eq!(numbered.number, 7);
        assert_eq!(numbered.body, "M110");
    }

    #[test]
    fn test_explicit_line_number_is_kept() {
        let protocol = RepRapProtocol::default();
        let numbered = protocol.assign_line_number("N12 M110", 3);
        assert_eq!(numbered, NumberedLine { number: 12, body: "M110".to_string() });

        // A word that merely starts with N is not a line number
        let numbered = protocol.assign_line_number("NX", 3);
        assert_eq!(numbered.number, 4);
    }

    #[test]
    fn test_strip_comments() {
        assert_eq!(strip_comments("G1 X10 ; move"), "G1 X10");
        assert_eq!(strip_comments("G1 (fast) X10"), "G1  X10");
        assert_eq!(strip_comments("(only a comment)"), "");
        assert_eq!(strip_comments("  ; layer 2"), "");
    }

    #[test]
    fn test_prepare_empty_and_legacy() {
        let protocol = RepRapProtocol::new(true);
        assert_eq!(protocol.prepare("   "), None);
        assert_eq!(protocol.prepare("; comment"), None);
        assert_eq!(protocol.prepare("M101"), None);
        assert_eq!(protocol.prepare("M103 ; extruder off"), None);
        assert_eq!(protocol.prepare("M01"), None);
        assert_eq!(protocol.prepare("M104 S200").as_deref(), Some("M104 S200"));

        let legacy = RepRapProtocol::new(false);
        assert_eq!(legacy.prepare("M101").as_deref(), Some("M101"));
    }

    #[test]
    fn test_trailing_feed_moves_after_extrusion() {
        assert_eq!(
            RepRapProtocol::rewrite_for_five_d("G1 X10 F1200 E3.5").as_deref(),
            Some("G1 X10 E3.5 F1200")
        );
        assert_eq!(
            RepRapProtocol::rewrite_for_five_d("G1 X10 E3.5 F1200").as_deref(),
            Some("G1 X10 E3.5 F1200")
        );
    }

    #[test]
    fn test_word_value_and_command_code() {
        assert_eq!(word_value("G1 X10 F500", 'F'), Some(500.0));
        assert_eq!(word_value("G1 X10 F-5", 'F'), Some(-5.0));
        assert_eq!(word_value("G92 E0", 'E'), Some(0.0));
        assert_eq!(word_value("G1 X10", 'E'), None);
        assert_eq!(command_code("M110"), Some(('M', 110)));
        assert_eq!(command_code("m01"), Some(('M', 1)));
        assert_eq!(command_code("G1 X1"), Some(('G', 1)));
        assert_eq!(command_code("T0"), Some(('T', 0)));
        assert_eq!(command_code(""), None);
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(5.0), "5");
        assert_eq!(format_number(12.5), "12.5");
        assert_eq!(format_number(0.1234567), "0.123457");
        assert_eq!(format_number(-0.0000001), "0");
        assert_eq!(format_number(-2.25), "-2.25");
    }

    #[test]
    fn test_line_number_of() {
        let protocol = RepRapProtocol::default();
        let framed = protocol.frame(17, "G28");
        assert_eq!(protocol.line_number_of(&framed), Some(17));
        assert_eq!(protocol.line_number_of("G28"), None);
    }

    #[test]
    fn test_decode_rejects_bad_checksum() {
        let protocol = RepRapProtocol::default();
        let framed = protocol.frame(3, "G1 X5");
        assert_eq!(RepRapProtocol::decode(&framed), Some((3, "G1 X5".to_string())));

        let corrupted = framed.replace("X5", "X6");
        assert_eq!(RepRapProtocol::decode(&corrupted), None);
    }

    proptest! {
        #[test]
        fn prop_frame_decode_recovers_line(
            number in 0u32..1_000_000,
            body in "[GMT][0-9]{1,3}( [XYZEF]-?[0-9]{1,4}(\\.[0-9]{1,3})?){0,4}",
        ) {
            let protocol = RepRapProtocol::default();
            let framed = protocol.frame(number, &body);
            prop_assert_eq!(RepRapProtocol::decode(&framed), Some((number, body)));
        }

        #[test]
        fn prop_single_byte_corruption_changes_checksum(
            body in "[GM][0-9]{1,3}( [XYZEF][0-9]{1,4}){0,4}",
            index in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let prefix = format!("N1 {} ", body);
            let mut bytes = prefix.clone().into_bytes();
            let i = index.index(bytes.len());
            bytes[i] ^= flip;
            prop_assert_ne!(checksum(&bytes), checksum(prefix.as_bytes()));
        }
    }
}

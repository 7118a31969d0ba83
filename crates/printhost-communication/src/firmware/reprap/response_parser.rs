//! RepRap Response Parser
//!
//! Classifies the lines a RepRap/Marlin style firmware sends back:
//! acknowledgments with optional temperatures, reset banners, resend
//! requests, hardware faults and SD card status messages.

use std::fmt;

/// Device-side storage notices
#[derive(Debug, Clone, PartialEq)]
pub enum StorageNotice {
    /// Capture into a file started
    WritingFile(String),
    /// Capture finished and the file was closed
    DoneSaving,
    /// A file was opened for playback
    FileOpened {
        /// File name as reported
        name: String,
        /// File size in bytes, if reported
        size: Option<u64>,
    },
    /// The opened file was selected for playback
    FileSelected,
    /// Playback position in bytes
    PlaybackProgress {
        /// Bytes played so far
        done: u64,
        /// Total bytes
        total: u64,
    },
    /// No playback is running
    NotPrinting,
    /// Playback reached the end of the file
    DonePrinting,
    /// A file could not be opened
    OpenFailed(String),
    /// No card, or it failed to initialize
    NoCard,
}

/// Device response types
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceResponse {
    /// Line acknowledged, optionally with temperatures
    Ok {
        /// Reported tool temperature
        tool_temperature: Option<f64>,
        /// Reported platform temperature
        platform_temperature: Option<f64>,
    },
    /// Unsolicited temperature report
    Temperature {
        /// Reported tool temperature
        tool_temperature: Option<f64>,
        /// Reported platform temperature
        platform_temperature: Option<f64>,
    },
    /// Device (re)booted
    Start,
    /// Retransmission request; `None` when the line number could not be read
    Resend(Option<u32>),
    /// Hardware fault; the device cannot continue
    Fault(String),
    /// Recoverable error report, usually followed by a resend request
    Error(String),
    /// Storage status
    Storage(StorageNotice),
    /// Informational echo output
    Echo(String),
    /// Anything else
    Unknown(String),
}

impl fmt::Display for DeviceResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok { .. } => write!(f, "ok"),
            Self::Temperature { .. } => write!(f, "temperature"),
            Self::Start => write!(f, "start"),
            Self::Resend(Some(n)) => write!(f, "resend:{}", n),
            Self::Resend(None) => write!(f, "resend:?"),
            Self::Fault(msg) => write!(f, "fault:{}", msg),
            Self::Error(msg) => write!(f, "error:{}", msg),
            Self::Storage(notice) => write!(f, "storage:{:?}", notice),
            Self::Echo(msg) => write!(f, "echo:{}", msg),
            Self::Unknown(line) => write!(f, "unknown:{}", line),
        }
    }
}

/// RepRap response parser
#[derive(Debug, Clone, Default)]
pub struct ResponseParser;

impl ResponseParser {
    /// Create a new RepRap response parser
    pub fn new() -> Self {
        Self
    }

    /// Parse a response line; `None` for blank lines
    pub fn parse(&self, line: &str) -> Option<DeviceResponse> {
        let line = line.trim();

        if line.is_empty() {
            return None;
        }

        if line == "ok" || line.starts_with("ok ") {
            let (tool_temperature, platform_temperature) = parse_temperatures(line);
            return Some(DeviceResponse::Ok {
                tool_temperature,
                platform_temperature,
            });
        }

        if line == "start" || line == "Start" {
            return Some(DeviceResponse::Start);
        }

        if let Some(target) = line
            .strip_prefix("Resend:")
            .or_else(|| line.strip_prefix("rs "))
        {
            return Some(DeviceResponse::Resend(parse_line_number(target)));
        }

        if line.starts_with("Extruder Fail") || line.contains("Printer halted") {
            return Some(DeviceResponse::Fault(line.to_string()));
        }

        if let Some(message) = line
            .strip_prefix("Error:")
            .or_else(|| line.strip_prefix("error:"))
        {
            return Some(DeviceResponse::Error(message.trim().to_string()));
        }

        if let Some(notice) = parse_storage(line) {
            return Some(DeviceResponse::Storage(notice));
        }

        if line.starts_with("T:") {
            let (tool_temperature, platform_temperature) = parse_temperatures(line);
            return Some(DeviceResponse::Temperature {
                tool_temperature,
                platform_temperature,
            });
        }

        if let Some(message) = line
            .strip_prefix("echo:")
            .or_else(|| line.strip_prefix("//"))
        {
            return Some(DeviceResponse::Echo(message.trim().to_string()));
        }

        Some(DeviceResponse::Unknown(line.to_string()))
    }
}

fn parse_line_number(text: &str) -> Option<u32> {
    let text = text.trim().trim_start_matches(['N', 'n']);
    let digits = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    text[..digits].parse().ok()
}

/// Value following `key`, up to whitespace or the `/target` separator
fn field_value(line: &str, key: &str) -> Option<f64> {
    let start = line.find(key)? + key.len();
    let rest = line[start..].trim_start();
    let end = rest
        .find(|c: char| c.is_whitespace() || c == '/')
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

fn parse_temperatures(line: &str) -> (Option<f64>, Option<f64>) {
    (field_value(line, "T:"), field_value(line, "B:"))
}

fn parse_storage(line: &str) -> Option<StorageNotice> {
    if let Some(name) = line.strip_prefix("Writing to file:") {
        return Some(StorageNotice::WritingFile(name.trim().to_string()));
    }
    if line.starts_with("Done saving file") {
        return Some(StorageNotice::DoneSaving);
    }
    if let Some(rest) = line.strip_prefix("File opened:") {
        let (name, size) = match rest.split_once("Size:") {
            Some((name, size)) => (name.trim(), size.trim().parse().ok()),
            None => (rest.trim(), None),
        };
        return Some(StorageNotice::FileOpened {
            name: name.to_string(),
            size,
        });
    }
    if line.starts_with("File selected") {
        return Some(StorageNotice::FileSelected);
    }
    if let Some(rest) = line.strip_prefix("SD printing byte") {
        let (done, total) = rest.trim().split_once('/')?;
        return Some(StorageNotice::PlaybackProgress {
            done: done.trim().parse().ok()?,
            total: total.trim().parse().ok()?,
        });
    }
    if line.starts_with("Not SD printing") {
        return Some(StorageNotice::NotPrinting);
    }
    if line.starts_with("Done printing file") {
        return Some(StorageNotice::DonePrinting);
    }
    if let Some(rest) = line.strip_prefix("open failed") {
        let name = rest
            .trim_start_matches(',')
            .trim()
            .trim_start_matches("File:")
            .trim()
            .trim_end_matches('.');
        return Some(StorageNotice::OpenFailed(name.to_string()));
    }
    if line.starts_with("No SD card")
        || line.starts_with("SD init fail")
        || line.starts_with("volume.init failed")
    {
        return Some(StorageNotice::NoCard);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> DeviceResponse {
        ResponseParser::new().parse(line).unwrap()
    }

    #[test]
    fn test_parse_ok() {
        assert_eq!(
            parse("ok"),
            DeviceResponse::Ok {
                tool_temperature: None,
                platform_temperature: None
            }
        );
        assert_eq!(
            parse("ok T:201.5 /210.0 B:59.8 /60.0 @:64"),
            DeviceResponse::Ok {
                tool_temperature: Some(201.5),
                platform_temperature: Some(59.8)
            }
        );
        assert_eq!(
            parse("ok T:23"),
            DeviceResponse::Ok {
                tool_temperature: Some(23.0),
                platform_temperature: None
            }
        );
    }

    #[test]
    fn test_parse_start_banner() {
        assert_eq!(parse("start"), DeviceResponse::Start);
        assert_eq!(parse("Start"), DeviceResponse::Start);
        assert!(matches!(parse("started"), DeviceResponse::Unknown(_)));
    }

    #[test]
    fn test_parse_resend() {
        assert_eq!(parse("Resend:1"), DeviceResponse::Resend(Some(1)));
        assert_eq!(parse("Resend: 42"), DeviceResponse::Resend(Some(42)));
        assert_eq!(parse("rs 7"), DeviceResponse::Resend(Some(7)));
        assert_eq!(parse("rs N8"), DeviceResponse::Resend(Some(8)));
        assert_eq!(parse("Resend: abc"), DeviceResponse::Resend(None));
    }

    #[test]
    fn test_parse_faults_and_errors() {
        assert!(matches!(
            parse("Extruder Fail: thermistor open"),
            DeviceResponse::Fault(_)
        ));
        assert!(matches!(
            parse("Error:Printer halted. kill() called!"),
            DeviceResponse::Fault(_)
        ));
        assert_eq!(
            parse("Error:checksum mismatch, Last Line: 3"),
            DeviceResponse::Error("checksum mismatch, Last Line: 3".to_string())
        );
    }

    #[test]
    fn test_parse_storage() {
        assert_eq!(
            parse("Writing to file: part.gco"),
            DeviceResponse::Storage(StorageNotice::WritingFile("part.gco".to_string()))
        );
        assert_eq!(
            parse("File opened: part.gco Size: 2048"),
            DeviceResponse::Storage(StorageNotice::FileOpened {
                name: "part.gco".to_string(),
                size: Some(2048)
            })
        );
        assert_eq!(
            parse("SD printing byte 100/2048"),
            DeviceResponse::Storage(StorageNotice::PlaybackProgress {
                done: 100,
                total: 2048
            })
        );
        assert_eq!(
            parse("open failed, File: part.gco."),
            DeviceResponse::Storage(StorageNotice::OpenFailed("part.gco".to_string()))
        );
        assert_eq!(
            parse("Done saving file."),
            DeviceResponse::Storage(StorageNotice::DoneSaving)
        );
        assert_eq!(
            parse("Not SD printing"),
            DeviceResponse::Storage(StorageNotice::NotPrinting)
        );
        assert_eq!(
            parse("No SD card"),
            DeviceResponse::Storage(StorageNotice::NoCard)
        );
    }

    #[test]
    fn test_parse_misc() {
        assert_eq!(ResponseParser::new().parse("   "), None);
        assert_eq!(
            parse("echo:busy: processing"),
            DeviceResponse::Echo("busy: processing".to_string())
        );
        assert!(matches!(
            parse("T:20.1 /0.0 B:19.5 /0.0"),
            DeviceResponse::Temperature {
                tool_temperature: Some(_),
                platform_temperature: Some(_)
            }
        ));
        assert_eq!(
            parse("wait"),
            DeviceResponse::Unknown("wait".to_string())
        );
    }
}

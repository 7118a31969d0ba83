//! Build simulation
//!
//! A simulator follows the instructions of a direct build in process,
//! tracking position and an estimate of motion time. It is fed on a
//! best-effort basis; its errors never affect the real build.

use printhost_communication::firmware::reprap::command_code;
use printhost_core::{Error, Result};
use std::time::Duration;

/// In-process stand-in for the device
pub trait Simulator: Send {
    /// Apply one instruction
    fn simulate(&mut self, instruction: &str) -> Result<()>;

    /// Return to the initial state
    fn reset(&mut self);
}

/// Tracks position, feedrate, extrusion and accumulated motion time
#[derive(Debug, Clone, PartialEq)]
pub struct MotionSimulator {
    position: [f64; 3],
    e_position: f64,
    feedrate: f64,
    absolute: bool,
    elapsed: Duration,
    instructions: u64,
}

impl Default for MotionSimulator {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            e_position: 0.0,
            feedrate: 0.0,
            absolute: true,
            elapsed: Duration::ZERO,
            instructions: 0,
        }
    }
}

/// Parameter words of an instruction, by letter
fn parameters(instruction: &str) -> Result<Vec<(char, f64)>> {
    instruction
        .split_whitespace()
        .skip(1)
        .map(|word| {
            let mut chars = word.chars();
            let letter = chars
                .next()
                .map(|c| c.to_ascii_uppercase())
                .unwrap_or(' ');
            // Bare axis flags such as `G28 X` carry no value
            let text = chars.as_str();
            let value = if text.is_empty() {
                0.0
            } else {
                text.parse::<f64>().map_err(|_| {
                    Error::other(format!("Unreadable word '{}' in {}", word, instruction))
                })?
            };
            Ok((letter, value))
        })
        .collect()
}

impl MotionSimulator {
    /// Create a simulator at the origin
    pub fn new() -> Self {
        Self::default()
    }

    /// Current X, Y, Z position
    pub fn position(&self) -> [f64; 3] {
        self.position
    }

    /// Current extruder position
    pub fn e_position(&self) -> f64 {
        self.e_position
    }

    /// Last feedrate in distance per minute
    pub fn feedrate(&self) -> f64 {
        self.feedrate
    }

    /// Estimated motion time so far
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Number of instructions applied
    pub fn instructions(&self) -> u64 {
        self.instructions
    }

    fn linear_move(&mut self, words: &[(char, f64)]) {
        let mut target = self.position;
        let mut e_target = self.e_position;

        for &(letter, value) in words {
            let axis = match letter {
                'X' => Some(0),
                'Y' => Some(1),
                'Z' => Some(2),
                _ => None,
            };
            match (axis, letter) {
                (Some(i), _) if self.absolute => target[i] = value,
                (Some(i), _) => target[i] += value,
                (None, 'E') if self.absolute => e_target = value,
                (None, 'E') => e_target += value,
                (None, 'F') => self.feedrate = value,
                _ => {}
            }
        }

        let distance = target
            .iter()
            .zip(self.position.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            .sqrt();
        let travel = if distance > 0.0 {
            distance
        } else {
            (e_target - self.e_position).abs()
        };
        if self.feedrate > 0.0 && travel > 0.0 {
            self.elapsed += Duration::from_secs_f64(travel / self.feedrate * 60.0);
        }

        self.position = target;
        self.e_position = e_target;
    }
}

impl Simulator for MotionSimulator {
    fn simulate(&mut self, instruction: &str) -> Result<()> {
        let words = parameters(instruction)?;
        self.instructions += 1;

        match command_code(instruction) {
            Some(('G', 0 | 1)) => self.linear_move(&words),
            Some(('G', 4)) => {
                for (letter, value) in words {
                    match letter {
                        'P' => self.elapsed += Duration::from_secs_f64(value.max(0.0) / 1000.0),
                        'S' => self.elapsed += Duration::from_secs_f64(value.max(0.0)),
                        _ => {}
                    }
                }
            }
            Some(('G', 28)) => {
                if words.is_empty() {
                    self.position = [0.0; 3];
                }
                for (letter, _) in words {
                    match letter {
                        'X' => self.position[0] = 0.0,
                        'Y' => self.position[1] = 0.0,
                        'Z' => self.position[2] = 0.0,
                        _ => {}
                    }
                }
            }
            Some(('G', 90)) => self.absolute = true,
            Some(('G', 91)) => self.absolute = false,
            Some(('G', 92)) => {
                for (letter, value) in words {
                    match letter {
                        'X' => self.position[0] = value,
                        'Y' => self.position[1] = value,
                        'Z' => self.position[2] = value,
                        'E' => self.e_position = value,
                        _ => {}
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_moves_accumulate_time() {
        let mut sim = MotionSimulator::new();
        sim.simulate("G1 X30 Y40 F600").unwrap();
        assert_eq!(sim.position(), [30.0, 40.0, 0.0]);
        assert_eq!(sim.feedrate(), 600.0);
        // 50 units at 600 per minute
        assert_eq!(sim.elapsed(), Duration::from_secs(5));
    }

    #[test]
    fn test_relative_moves_and_extrusion() {
        let mut sim = MotionSimulator::new();
        sim.simulate("G91").unwrap();
        sim.simulate("G1 X5 E1 F300").unwrap();
        sim.simulate("G1 X5 E1").unwrap();
        assert_eq!(sim.position()[0], 10.0);
        assert_eq!(sim.e_position(), 2.0);
        assert_eq!(sim.instructions(), 3);
    }

    #[test]
    fn test_home_dwell_and_set_position() {
        let mut sim = MotionSimulator::new();
        sim.simulate("G1 X10 Y10 Z1 F1000").unwrap();
        sim.simulate("G28 X").unwrap();
        assert_eq!(sim.position(), [0.0, 10.0, 1.0]);

        sim.simulate("G92 E5").unwrap();
        assert_eq!(sim.e_position(), 5.0);

        let before = sim.elapsed();
        sim.simulate("G4 P500").unwrap();
        assert_eq!(sim.elapsed() - before, Duration::from_millis(500));
    }

    #[test]
    fn test_unreadable_word_is_an_error() {
        let mut sim = MotionSimulator::new();
        assert!(sim.simulate("G1 X1.2.3").is_err());
        assert_eq!(sim.instructions(), 0);

        sim.simulate("G1 X1").unwrap();
        sim.reset();
        assert_eq!(sim, MotionSimulator::new());
    }
}

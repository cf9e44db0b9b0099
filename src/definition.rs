/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{error::Error, fmt, fs, path::Path, str::FromStr};

// ******** ******** ********
// **     INSTRUCTIONS     **
// ******** ******** ********

/// Comparator used by `expect-running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum Comparator {
    #[serde(rename = "<")]
    Lower,
    #[serde(rename = ">")]
    Greater,
}
impl Comparator {
    pub fn holds(&self, running: usize, amount: usize) -> bool {
        match self {
            Comparator::Lower => running < amount,
            Comparator::Greater => running > amount,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Comparator::Lower => "<",
            Comparator::Greater => ">",
        }
    }
}
impl FromStr for Comparator {
    type Err = DefinitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "<" => Ok(Comparator::Lower),
            ">" => Ok(Comparator::Greater),
            other => Err(DefinitionError::BadComparator(other.to_string())),
        }
    }
}
impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// One step of a benchmark. Exactly one variant per instruction, so a `Sleep(0)` is a real
/// (zero length) step and not an empty slot.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Instruction {
    /// Spawn `max` workers, one every `interval` milliseconds.
    Start { max: u32, interval: u64 },

    /// Vary the spawn rate over `duration` milliseconds. Not implemented yet, see
    /// `Engine::float`.
    Float { rate: f64, duration: u64 },

    /// Block the instruction stream for the given number of seconds.
    Sleep(u64),

    /// Block until the running count compares true against `amount`.
    ExpectRunning { symbol: Comparator, amount: usize },

    StopAll,
}
impl Instruction {
    /// Name used in the instruction log and in raw instruction strings.
    pub fn name(&self) -> &'static str {
        match self {
            Instruction::Start { .. } => "start",
            Instruction::Float { .. } => "float",
            Instruction::Sleep(_) => "sleep",
            Instruction::ExpectRunning { .. } => "expect-running",
            Instruction::StopAll => "stop-all",
        }
    }

    /// Arguments rendered as they would be written in a raw instruction string.
    pub fn args(&self) -> Vec<String> {
        match self {
            Instruction::Start { max, interval } => vec![max.to_string(), interval.to_string()],
            Instruction::Float { rate, duration } => vec![rate.to_string(), duration.to_string()],
            Instruction::Sleep(secs) => vec![secs.to_string()],
            Instruction::ExpectRunning { symbol, amount } => {
                vec![symbol.to_string(), amount.to_string()]
            }
            Instruction::StopAll => vec![],
        }
    }

    fn validate(&self, position: usize) -> Result<(), DefinitionError> {
        let invalid = |reason: &str| {
            Err(DefinitionError::InvalidArgument {
                position,
                instruction: self.name(),
                reason: reason.to_string(),
            })
        };

        match self {
            Instruction::Start { max: 0, .. } => invalid("max has to be greater than 0"),
            Instruction::Float { rate, .. } if !(*rate > 0.0) => {
                invalid("rate has to be greater than 0")
            }
            Instruction::Float { duration: 0, .. } => invalid("duration has to be greater than 0"),
            _ => Ok(()),
        }
    }
}

// ******** ******** ********
// **  BENCHMARK DEFINITION **
// ******** ******** ********

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BenchmarkDef {
    #[serde(alias = "instancegroup-size")]
    pub instance_group_size: u32,
    #[serde(default)]
    pub instructions: Vec<Instruction>,
}
impl BenchmarkDef {
    pub fn try_from_path(path: &Path) -> anyhow::Result<BenchmarkDef> {
        let def_str = fs::read_to_string(path).context(format!(
            "Unable to read benchmark definition {}",
            path.display()
        ))?;
        Ok(BenchmarkDef::try_from_str(&def_str)?)
    }

    pub fn try_from_str(def_str: &str) -> Result<BenchmarkDef, DefinitionError> {
        let def = toml::from_str::<BenchmarkDef>(def_str)
            .map_err(|e| DefinitionError::Toml(e.to_string()))?;
        def.validate()?;
        Ok(def)
    }

    /// Parses instructions written as parenthesised groups, e.g.
    /// `(sleep 1) (start 3 50) (expect-running > 2) (stop-all)`.
    pub fn try_from_raw(raw: &str, instance_group_size: u32) -> Result<BenchmarkDef, DefinitionError> {
        let instructions = parse_raw_instructions(raw)?;
        let def = BenchmarkDef {
            instance_group_size,
            instructions,
        };
        def.validate()?;
        Ok(def)
    }

    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.instance_group_size == 0 {
            return Err(DefinitionError::InstanceGroupSize);
        }
        for (position, instruction) in self.instructions.iter().enumerate() {
            instruction.validate(position)?;
        }
        Ok(())
    }
}

fn parse_raw_instructions(raw: &str) -> Result<Vec<Instruction>, DefinitionError> {
    let mut instructions = vec![];
    let mut rest = raw;

    while let Some(open) = rest.find('(') {
        let after_open = &rest[open + 1..];
        let close = after_open
            .find(')')
            .ok_or(DefinitionError::Unbalanced)?;
        let group = &after_open[..close];
        rest = &after_open[close + 1..];

        let words = group.split_whitespace().collect::<Vec<_>>();
        if let [cmd, args @ ..] = &words[..] {
            instructions.push(parse_instruction(cmd, args)?);
        }
    }

    if rest.contains(')') {
        return Err(DefinitionError::Unbalanced);
    }

    Ok(instructions)
}

fn parse_instruction(cmd: &str, args: &[&str]) -> Result<Instruction, DefinitionError> {
    let arity = |expected: usize| {
        if args.len() == expected {
            Ok(())
        } else {
            Err(DefinitionError::Arity {
                instruction: cmd.to_string(),
                expected,
                found: args.len(),
            })
        }
    };

    match cmd {
        "start" => {
            arity(2)?;
            Ok(Instruction::Start {
                max: parse_number(cmd, args[0])?,
                interval: parse_number(cmd, args[1])?,
            })
        }
        "float" => {
            arity(2)?;
            Ok(Instruction::Float {
                rate: parse_number(cmd, args[0])?,
                duration: parse_number(cmd, args[1])?,
            })
        }
        "sleep" => {
            arity(1)?;
            Ok(Instruction::Sleep(parse_number(cmd, args[0])?))
        }
        "expect-running" => {
            arity(2)?;
            Ok(Instruction::ExpectRunning {
                symbol: args[0].parse()?,
                amount: parse_number(cmd, args[1])?,
            })
        }
        "stop-all" => {
            arity(0)?;
            Ok(Instruction::StopAll)
        }
        other => Err(DefinitionError::UnknownInstruction(other.to_string())),
    }
}

fn parse_number<T: FromStr>(cmd: &str, value: &str) -> Result<T, DefinitionError> {
    value.parse::<T>().map_err(|_| DefinitionError::BadNumber {
        instruction: cmd.to_string(),
        value: value.to_string(),
    })
}

// ******** ******** ********
// **        ERRORS        **
// ******** ******** ********

#[derive(Debug, Clone, PartialEq)]
pub enum DefinitionError {
    Toml(String),
    Unbalanced,
    UnknownInstruction(String),
    Arity {
        instruction: String,
        expected: usize,
        found: usize,
    },
    BadNumber {
        instruction: String,
        value: String,
    },
    BadComparator(String),
    InstanceGroupSize,
    InvalidArgument {
        position: usize,
        instruction: &'static str,
        reason: String,
    },
}
impl fmt::Display for DefinitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefinitionError::Toml(e) => write!(f, "TOML parsing error: {}", e),
            DefinitionError::Unbalanced => write!(f, "unbalanced parentheses in raw instructions"),
            DefinitionError::UnknownInstruction(cmd) => write!(f, "unknown instruction '{}'", cmd),
            DefinitionError::Arity {
                instruction,
                expected,
                found,
            } => write!(
                f,
                "{} requires {} arguments, {} given",
                instruction, expected, found
            ),
            DefinitionError::BadNumber { instruction, value } => {
                write!(f, "{}: '{}' is not a valid number", instruction, value)
            }
            DefinitionError::BadComparator(symbol) => write!(
                f,
                "expect-running comparator has to be > or <, got '{}'",
                symbol
            ),
            DefinitionError::InstanceGroupSize => {
                write!(f, "instance group size has to be greater or equal to 1")
            }
            DefinitionError::InvalidArgument {
                position,
                instruction,
                reason,
            } => write!(
                f,
                "wrong values for the {} instruction at position {}: {}",
                instruction, position, reason
            ),
        }
    }
}
impl Error for DefinitionError {}

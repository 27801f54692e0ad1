//! Program parsing.
//!
//! A program is a whitespace-separated token stream of function blocks.
//! Parsing validates the static limits: function count, instructions per
//! function, well-formed operands, and block structure.

use ember_scripting::{ScriptingError, ScriptingResult};

use crate::instruction::Instruction;
use crate::limits::HelloLimits;

/// One parsed function block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloFunction {
    /// Name given after the `FUNCTION` keyword.
    pub name: String,
    /// Instructions in source order; the last one is always `RETURN`.
    pub instructions: Vec<Instruction>,
}

/// A parsed program: function blocks in source order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HelloProgram {
    /// The function blocks.
    pub functions: Vec<HelloFunction>,
}

impl HelloProgram {
    /// Approximate bytes held by the program.
    pub fn byte_size(&self) -> usize {
        self.functions
            .iter()
            .map(|function| {
                function.name.len()
                    + function.instructions.len() * std::mem::size_of::<Instruction>()
            })
            .sum()
    }
}

fn parse_u32(token: Option<&str>, what: &str) -> ScriptingResult<u32> {
    let token =
        token.ok_or_else(|| ScriptingError::compile(format!("missing operand for {what}")))?;
    token
        .parse::<u32>()
        .map_err(|_| ScriptingError::compile(format!("invalid {what} operand: {token}")))
}

/// Parses `source` into a program, enforcing `limits`.
pub fn parse(source: &str, limits: &HelloLimits) -> ScriptingResult<HelloProgram> {
    let mut tokens = source.split_whitespace();
    let mut program = HelloProgram::default();
    let mut current: Option<HelloFunction> = None;

    while let Some(token) = tokens.next() {
        match token {
            "FUNCTION" => {
                if current.is_some() {
                    return Err(ScriptingError::compile(
                        "FUNCTION before the previous block was closed with RETURN",
                    ));
                }
                if program.functions.len() >= limits.max_functions {
                    return Err(ScriptingError::compile(format!(
                        "too many functions: limit is {}",
                        limits.max_functions
                    )));
                }
                let name = tokens
                    .next()
                    .ok_or_else(|| ScriptingError::compile("missing function name"))?;
                if program.functions.iter().any(|f| f.name == name) {
                    return Err(ScriptingError::compile(format!(
                        "duplicate function name: {name}"
                    )));
                }
                current = Some(HelloFunction {
                    name: name.to_string(),
                    instructions: Vec::new(),
                });
            }
            "CONSTI" | "ARGS" | "SLEEP" | "RETURN" => {
                let Some(function) = current.as_mut() else {
                    return Err(ScriptingError::compile(format!(
                        "instruction {token} outside of a FUNCTION block"
                    )));
                };
                if function.instructions.len() >= limits.max_instructions {
                    return Err(ScriptingError::compile(format!(
                        "function {} exceeds the {}-instruction limit",
                        function.name, limits.max_instructions
                    )));
                }
                match token {
                    "CONSTI" => {
                        let value = parse_u32(tokens.next(), "CONSTI")?;
                        function.instructions.push(Instruction::ConstI(value));
                    }
                    "ARGS" => {
                        let index = parse_u32(tokens.next(), "ARGS")?;
                        function.instructions.push(Instruction::Args(index));
                    }
                    "SLEEP" => function.instructions.push(Instruction::Sleep),
                    _ => {
                        function.instructions.push(Instruction::Return);
                        program.functions.push(current.take().unwrap_or_else(|| {
                            unreachable!("current block checked above")
                        }));
                    }
                }
            }
            other => {
                return Err(ScriptingError::compile(format!(
                    "unknown instruction: {other}"
                )));
            }
        }
    }

    if let Some(open) = current {
        return Err(ScriptingError::compile(format!(
            "function {} not closed with RETURN",
            open.name
        )));
    }
    Ok(program)
}

#![warn(clippy::all, clippy::pedantic)]

use std::collections::HashMap;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::instruction::instruction::{
    Instruction, RawInstruction, ScalarOp, VectorOp, MAX_ALU_IMMEDIATE, MAX_BRANCH_OFFSET,
    MAX_MEM_IMMEDIATE, MAX_VEC_FIELD,
};
use crate::register::register_system::{ConditionCode, GEN_REG_COUNT};
use crate::register::vector_register::VEC_REG_COUNT;

// Borrowed from tree-sitter-c -- https://github.com/tree-sitter/tree-sitter-c/blob/1aafaff4d26dac5a36dd3495be33e1c20161d761/grammar.js#L1336
const LINE_COMMENT_REGEX: &str = r"//(\\+(.|\r?\n)|[^\\\n])*";
const LABEL_REGEX: &str = r"^(?P<label>[a-zA-Z_]\w*):$";

const SCALAR_REG_REGEX: &str = r"^[rR](?P<num>\d+)$";
const DEREF_REG_REGEX: &str = r"^\[\s*[rR](?P<num>\d+)\s*\]$";
const VECTOR_REG_REGEX: &str = r"^[vV](?P<num>\d+)$";
const IMMEDIATE_REGEX: &str = r"^(?P<neg>-)?((0[xX](?P<hex>[0-9a-fA-F]+))|(?P<dec>\d+))$";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operand {
    Scalar(usize),
    Deref(usize),
    Vector(usize),
    Immediate(i64),
    Label(usize),
}

fn parse_reg_num(caps: &regex::Captures<'_>, limit: usize, token: &str) -> Result<usize> {
    let num = caps["num"]
        .parse::<usize>()
        .map_err(|_| anyhow!("Failed to parse register argument: {token}"))?;
    if num >= limit {
        return Err(anyhow!(
            "Invalid register number {num}. Valid range is [0-{limit})"
        ));
    }
    Ok(num)
}

fn parse_operand(token: &str, labels: &HashMap<String, usize>) -> Result<Operand> {
    static SCALAR_REG: Lazy<Regex> = Lazy::new(|| Regex::new(SCALAR_REG_REGEX).unwrap());
    static DEREF_REG: Lazy<Regex> = Lazy::new(|| Regex::new(DEREF_REG_REGEX).unwrap());
    static VECTOR_REG: Lazy<Regex> = Lazy::new(|| Regex::new(VECTOR_REG_REGEX).unwrap());
    static IMMEDIATE: Lazy<Regex> = Lazy::new(|| Regex::new(IMMEDIATE_REGEX).unwrap());

    if let Some(caps) = SCALAR_REG.captures(token) {
        return Ok(Operand::Scalar(parse_reg_num(&caps, GEN_REG_COUNT, token)?));
    }
    if let Some(caps) = DEREF_REG.captures(token) {
        return Ok(Operand::Deref(parse_reg_num(&caps, GEN_REG_COUNT, token)?));
    }
    if let Some(caps) = VECTOR_REG.captures(token) {
        return Ok(Operand::Vector(parse_reg_num(&caps, VEC_REG_COUNT, token)?));
    }
    if let Some(caps) = IMMEDIATE.captures(token) {
        let magnitude = if let Some(hex) = caps.name("hex") {
            i64::from_str_radix(hex.as_str(), 16)
        } else {
            caps["dec"].parse::<i64>()
        }
        .map_err(|_| anyhow!("Failed to parse immediate value: {token}"))?;
        let value = if caps.name("neg").is_some() {
            -magnitude
        } else {
            magnitude
        };
        return Ok(Operand::Immediate(value));
    }
    if let Some(&address) = labels.get(token) {
        return Ok(Operand::Label(address));
    }

    Err(anyhow!("Unrecognized operand: {token}"))
}

/// Checks an unsigned immediate field
fn unsigned_field(value: i64, max: u32, what: &str) -> Result<u32> {
    u32::try_from(value)
        .ok()
        .filter(|&val| val <= max)
        .ok_or_else(|| anyhow!("{what} {value} out of range [0-{max}]"))
}

fn expect_operands(mnemonic: &str, operands: &[Operand], count: usize) -> Result<()> {
    if operands.len() == count {
        Ok(())
    } else {
        Err(anyhow!(
            "{mnemonic} takes {count} operands, {} given",
            operands.len()
        ))
    }
}

fn parse_scalar_alu(op: ScalarOp, operands: &[Operand]) -> Result<Instruction> {
    let expected =
        usize::from(op.writes_rd()) + usize::from(op.uses_a()) + usize::from(op.uses_b());
    expect_operands(&op.to_string(), operands, expected)?;

    let mut operands = operands.iter().copied();
    let rd = if op.writes_rd() {
        match operands.next() {
            Some(Operand::Scalar(rd)) => rd,
            other => return Err(anyhow!("{op} destination must be a register, got {other:?}")),
        }
    } else {
        0
    };
    let lhs = if op.uses_a() { operands.next() } else { None };
    let rhs = if op.uses_b() { operands.next() } else { None };

    let (r1, r2) = (
        match lhs {
            Some(Operand::Scalar(num) | Operand::Deref(num)) => num,
            _ => 0,
        },
        match rhs {
            Some(Operand::Scalar(num) | Operand::Deref(num)) => num,
            _ => 0,
        },
    );
    let alu_immediate = |value| unsigned_field(value, MAX_ALU_IMMEDIATE, "Immediate");

    let instr = match (lhs, rhs) {
        (None | Some(Operand::Scalar(_)), None | Some(Operand::Scalar(_))) => Instruction::Type0 {
            cond: 0,
            op,
            rd,
            r1,
            r2,
        },
        (None | Some(Operand::Deref(_)), None | Some(Operand::Deref(_))) => Instruction::Type1 {
            cond: 0,
            op,
            rd,
            r1,
            r2,
        },
        (Some(Operand::Deref(_)), Some(Operand::Scalar(_))) => Instruction::Type2 {
            cond: 0,
            op,
            rd,
            r1,
            r2,
        },
        (None | Some(Operand::Scalar(_)), Some(Operand::Immediate(value))) => Instruction::Type3 {
            op,
            rd,
            r1,
            immediate: alu_immediate(value)?,
        },
        (Some(Operand::Deref(_)), Some(Operand::Immediate(value))) => Instruction::Type4 {
            op,
            rd,
            r1,
            immediate: alu_immediate(value)?,
        },
        (lhs, rhs) => {
            return Err(anyhow!(
                "Unsupported operand combination for {op}: {lhs:?}, {rhs:?}"
            ))
        }
    };

    Ok(instr)
}

fn parse_scalar_memory(op: ScalarOp, operands: &[Operand]) -> Result<Instruction> {
    expect_operands(&op.to_string(), operands, 2)?;
    match (operands[0], operands[1]) {
        (Operand::Scalar(rd), Operand::Scalar(r1)) => Ok(Instruction::Type5 { op, rd, r1 }),
        (Operand::Scalar(rd), Operand::Immediate(value)) => Ok(Instruction::Type6 {
            op,
            rd,
            immediate: unsigned_field(value, MAX_MEM_IMMEDIATE, "Immediate")?,
        }),
        (lhs, rhs) => Err(anyhow!(
            "Unsupported operand combination for {op}: {lhs:?}, {rhs:?}"
        )),
    }
}

fn vector_length(value: i64) -> Result<usize> {
    let length = unsigned_field(value, MAX_VEC_FIELD, "Vector length")?;
    Ok(usize::try_from(length)?)
}

fn parse_vector_memory(op: VectorOp, operands: &[Operand]) -> Result<Instruction> {
    match (op, operands) {
        (VectorOp::Append, &[Operand::Vector(vd), Operand::Scalar(r1)]) => Ok(Instruction::Type8 {
            op,
            vd,
            r1,
            length: 0,
        }),
        (
            VectorOp::Load | VectorOp::Store,
            &[Operand::Vector(vd), Operand::Scalar(r1), Operand::Immediate(length)],
        ) => Ok(Instruction::Type8 {
            op,
            vd,
            r1,
            length: vector_length(length)?,
        }),
        _ => Err(anyhow!("Unsupported operands for vector {op}: {operands:?}")),
    }
}

fn parse_vector_alu(op: VectorOp, operands: &[Operand]) -> Result<Instruction> {
    if !op.is_alu() {
        return Err(anyhow!("{op} has no element-wise vector form"));
    }
    match *operands {
        [Operand::Vector(vd), Operand::Vector(v1), rhs, Operand::Immediate(length)] => {
            let length = vector_length(length)?;
            match rhs {
                Operand::Vector(v2) => Ok(Instruction::Type9 {
                    cond: 0,
                    op,
                    vd,
                    v1,
                    v2,
                    length,
                }),
                Operand::Immediate(immediate) => Ok(Instruction::Type10 {
                    cond: 0,
                    op,
                    vd,
                    v1,
                    immediate: unsigned_field(immediate, MAX_VEC_FIELD, "Immediate")?,
                    length,
                }),
                _ => Err(anyhow!("Unsupported operands for vector {op}: {operands:?}")),
            }
        }
        _ => Err(anyhow!("Unsupported operands for vector {op}: {operands:?}")),
    }
}

fn parse_branch(
    tokens: &[&str],
    link: bool,
    address: usize,
    labels: &HashMap<String, usize>,
) -> Result<Instruction> {
    let (target, cond) = match tokens {
        [target] => (*target, ConditionCode::Always),
        [target, keyword, cond] if keyword.eq_ignore_ascii_case("IF") => (
            *target,
            ConditionCode::from_str(cond).map_err(|_| anyhow!("Unknown branch condition: {cond}"))?,
        ),
        _ => return Err(anyhow!("Expected BRANCH <offset> [IF <condition>]")),
    };

    let offset = match parse_operand(target, labels)? {
        Operand::Immediate(offset) => offset,
        Operand::Label(label_addr) => i64::try_from(label_addr)? - i64::try_from(address)?,
        other => return Err(anyhow!("Branch target must be an offset or label, got {other:?}")),
    };
    if offset.unsigned_abs() > u64::from(MAX_BRANCH_OFFSET) {
        return Err(anyhow!(
            "Branch offset {offset} exceeds maximum magnitude {MAX_BRANCH_OFFSET}"
        ));
    }

    Ok(Instruction::Type7 {
        cond,
        link,
        offset: i32::try_from(offset)?,
    })
}

/// Parses one instruction placed at `address`, resolving branch labels
/// against `labels`
fn parse_at(line: &str, address: usize, labels: &HashMap<String, usize>) -> Result<Instruction> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some((&mnemonic, rest)) = tokens.split_first() else {
        return Err(anyhow!("Empty instruction"));
    };
    let mnemonic = mnemonic.to_ascii_uppercase();

    match mnemonic.as_str() {
        "HALT" | "END" if rest.is_empty() => return Ok(Instruction::Halt),
        "RETURN" if rest.is_empty() => {
            return Ok(Instruction::Type7 {
                cond: ConditionCode::Return,
                link: false,
                offset: 0,
            })
        }
        "BRANCH" => return parse_branch(rest, false, address, labels),
        "CALL" => return parse_branch(rest, true, address, labels),
        "SHIFT" => {
            return Err(anyhow!(
                "SHIFT shares opcode 7 with BRANCH and can't be encoded unambiguously"
            ))
        }
        _ => {}
    }

    let operands = rest
        .iter()
        .map(|token| parse_operand(token, labels))
        .collect::<Result<Vec<_>>>()?;
    let is_vector = matches!(operands.first(), Some(Operand::Vector(_)));

    if is_vector {
        let op = VectorOp::from_str(&mnemonic)
            .map_err(|_| anyhow!("Unknown vector instruction: {mnemonic}"))?;
        if op.is_memory() {
            parse_vector_memory(op, &operands)
        } else {
            parse_vector_alu(op, &operands)
        }
    } else {
        let op = ScalarOp::from_str(&mnemonic)
            .map_err(|_| anyhow!("Unknown instruction: {mnemonic}"))?;
        if op.is_memory() {
            parse_scalar_memory(op, &operands)
        } else {
            parse_scalar_alu(op, &operands)
        }
    }
}

/// Parses a single line of assembly into an `Instruction`
pub fn parse_instruction(line: &str) -> Result<Instruction> {
    parse_at(line, 0, &HashMap::new())
}

/// Assembles a single line of assembly into its raw word
pub fn assemble(line: &str) -> Result<RawInstruction> {
    Ok(parse_instruction(line)?.encode())
}

/// Strips comments and empty lines, keeping the 1-based line number of each
/// remaining line
pub fn strip(conts: &str) -> Vec<(usize, String)> {
    static LINE_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(LINE_COMMENT_REGEX).unwrap());

    conts
        .lines()
        .enumerate()
        .filter_map(|(line_num, line)| {
            let cleaned = LINE_COMMENT.replace_all(line, "");
            let cleaned = cleaned.trim();
            (!cleaned.is_empty()).then(|| (line_num + 1, cleaned.to_string()))
        })
        .collect()
}

/// Assembles a program, one instruction per line. `name:` lines label the
/// next instruction and may be used as branch targets.
pub fn assemble_program(conts: &str) -> Result<Vec<Instruction>> {
    static LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(LABEL_REGEX).unwrap());

    let lines = strip(conts);
    let mut labels = HashMap::new();
    let mut instr_lines = Vec::new();
    for (line_num, line) in lines {
        if let Some(caps) = LABEL.captures(&line) {
            let label = caps["label"].to_string();
            if labels.insert(label, instr_lines.len()).is_some() {
                return Err(anyhow!("Line {line_num}: Duplicate label {line}"));
            }
        } else {
            instr_lines.push((line_num, line));
        }
    }

    instr_lines
        .iter()
        .enumerate()
        .map(|(address, (line_num, line))| {
            parse_at(line, address, &labels).with_context(|| format!("Line {line_num}: {line}"))
        })
        .collect()
}

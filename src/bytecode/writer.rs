//! Serialization of modules into the binary `blzm` format

use std::fs::File;
use std::io::{BufWriter, Error as IoError, ErrorKind, Write};
use std::path::Path;
use byteorder::{LittleEndian, WriteBytesExt};
use crate::bytecode::{Constant, Function, Instruction, Module, OpCode, MAGIC};

pub struct Writer;

impl Writer {
    /// Write a module to any byte sink
    pub fn write<W: Write>(module: &Module, writer: &mut W) -> Result<(), IoError> {
        writer.write_u32::<LittleEndian>(MAGIC)?;
        writer.write_u8(module.version.0)?;
        writer.write_u8(module.version.1)?;

        write_short_string(writer, &module.name)?;
        writer.write_u8(module.debug as u8)?;

        writer.write_u32::<LittleEndian>(module.constants.len() as u32)?;
        for constant in &module.constants {
            match constant {
                Constant::Number(n) => {
                    writer.write_u8(0)?;
                    writer.write_f64::<LittleEndian>(*n)?;
                },
                Constant::String(s) => {
                    writer.write_u8(1)?;
                    write_short_string(writer, s)?;
                },
            }
        }

        writer.write_u32::<LittleEndian>(module.variables.len() as u32)?;
        for variable in &module.variables {
            writer.write_u8(variable.visibility as u8)?;
            writer.write_u32::<LittleEndian>(optional_index(variable.name))?;
        }

        writer.write_u32::<LittleEndian>(module.functions.len() as u32)?;
        for function in &module.functions {
            write_function(writer, function, module.debug)?;
        }

        writer.write_u32::<LittleEndian>(module.classes.len() as u32)?;
        for class in &module.classes {
            writer.write_u32::<LittleEndian>(optional_index(class.name))?;
            if class.members.len() > u16::MAX as usize {
                return Err(IoError::new(ErrorKind::InvalidData, "Too many class members"));
            }
            writer.write_u16::<LittleEndian>(class.members.len() as u16)?;
            for member in &class.members {
                writer.write_u32::<LittleEndian>(*member)?;
            }
            writer.write_u32::<LittleEndian>(class.constructor)?;
        }

        writer.flush()?;
        Ok(())
    }

    /// Serialize a module into a fresh byte vector
    pub fn to_bytes(module: &Module) -> Result<Vec<u8>, IoError> {
        let mut bytes = Vec::new();
        Self::write(module, &mut bytes)?;
        Ok(bytes)
    }
}

/// Writes a module to a file
pub fn write_module<P: AsRef<Path>>(module: &Module, path: P) -> Result<(), IoError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    Writer::write(module, &mut writer)
}

fn optional_index(index: Option<u32>) -> u32 {
    index.map_or(0, |i| i + 1)
}

fn write_short_string<W: Write>(writer: &mut W, value: &str) -> Result<(), IoError> {
    if value.len() > u16::MAX as usize {
        return Err(IoError::new(ErrorKind::InvalidData, "String longer than 65535 bytes"));
    }
    writer.write_u16::<LittleEndian>(value.len() as u16)?;
    writer.write_all(value.as_bytes())
}

fn write_function<W: Write>(writer: &mut W, function: &Function, debug: bool) -> Result<(), IoError> {
    writer.write_u32::<LittleEndian>(optional_index(function.name))?;
    writer.write_u16::<LittleEndian>(function.arg_count)?;
    writer.write_u8(function.is_vararg as u8)?;
    writer.write_u16::<LittleEndian>(function.local_count)?;
    writer.write_u32::<LittleEndian>(function.instructions.len() as u32)?;
    for instruction in &function.instructions {
        write_instruction(writer, instruction, debug)?;
    }
    Ok(())
}

fn write_instruction<W: Write>(writer: &mut W, instruction: &Instruction, debug: bool) -> Result<(), IoError> {
    if instruction.opcode == OpCode::ExtendedArg {
        return Err(IoError::new(ErrorKind::InvalidData, "EXTENDED_ARG is implied by the argument width"));
    }

    // High-order bytes first, each as its own EXTENDED_ARG unit
    let bytes = instruction.arg.to_be_bytes();
    let prefixes = instruction.extended_prefixes();
    for byte in &bytes[4 - 1 - prefixes..3] {
        write_unit(writer, OpCode::ExtendedArg, *byte, instruction.line, debug)?;
    }
    write_unit(writer, instruction.opcode, bytes[3], instruction.line, debug)
}

fn write_unit<W: Write>(writer: &mut W, opcode: OpCode, arg: u8, line: u32, debug: bool) -> Result<(), IoError> {
    if debug {
        writer.write_u16::<LittleEndian>(line.min(u16::MAX as u32) as u16)?;
    }
    writer.write_u8(opcode.into())?;
    writer.write_u8(arg)
}

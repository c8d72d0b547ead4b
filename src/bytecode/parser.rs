use std::fs::File;
use std::io::{BufReader, Error as IoError, Read};
use std::path::Path;
use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;
use crate::bytecode::{
    Class, Constant, Function, Instruction, Module, OpCode, Variable, Visibility, MAGIC, VERSION_MAJOR,
};

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("IO error: {0}")]
    IoError(#[from] IoError),

    #[error("Invalid bytecode format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported bytecode version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),
}

pub struct Parser;

impl Parser {
    /// Parse a module from a reader (file, memory buffer, etc.)
    ///
    /// Nothing is returned unless the whole stream decodes; a truncated stream
    /// surfaces as the underlying I/O error.
    pub fn parse<R: Read>(reader: &mut R) -> Result<Module, ParseError> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != MAGIC {
            return Err(ParseError::InvalidFormat("Invalid magic number".to_string()));
        }

        let major = reader.read_u8()?;
        if major != VERSION_MAJOR {
            return Err(ParseError::UnsupportedVersion(major));
        }
        let minor = reader.read_u8()?;

        let name = read_short_string(reader)?;
        let debug = reader.read_u8()? != 0;

        let mut module = Module::new(&name).with_debug(debug);
        module.version = (major, minor);

        let constants_len = reader.read_u32::<LittleEndian>()?;
        for _ in 0..constants_len {
            let tag = reader.read_u8()?;
            let constant = match tag {
                0 => Constant::Number(reader.read_f64::<LittleEndian>()?),
                1 => Constant::String(read_short_string(reader)?),
                _ => return Err(ParseError::InvalidFormat(format!("Unknown constant type: {}", tag))),
            };
            // Pushed directly: the pool on disk is already deduplicated and indices must not shift
            module.constants.push(constant);
        }

        let variables_len = reader.read_u32::<LittleEndian>()?;
        for _ in 0..variables_len {
            let byte = reader.read_u8()?;
            let visibility = Visibility::from_byte(byte)
                .ok_or_else(|| ParseError::InvalidFormat(format!("Unknown visibility: {}", byte)))?;
            let name = read_name_index(reader, &module)?;
            module.variables.push(Variable { name, visibility });
        }

        let functions_len = reader.read_u32::<LittleEndian>()?;
        for _ in 0..functions_len {
            let function = read_function(reader, &module)?;
            module.functions.push(function);
        }

        let classes_len = reader.read_u32::<LittleEndian>()?;
        for _ in 0..classes_len {
            let name = read_name_index(reader, &module)?;
            let member_count = reader.read_u16::<LittleEndian>()?;
            let mut members = Vec::with_capacity(member_count as usize);
            for _ in 0..member_count {
                let member = reader.read_u32::<LittleEndian>()?;
                if module.constant_str(member).is_none() {
                    return Err(ParseError::InvalidFormat(format!("Member name {} is not a string constant", member)));
                }
                members.push(member);
            }
            let constructor = reader.read_u32::<LittleEndian>()?;
            if constructor as usize >= module.functions.len() {
                return Err(ParseError::InvalidFormat(format!("Constructor index out of range: {}", constructor)));
            }
            module.classes.push(Class { name, members, constructor });
        }

        Ok(module)
    }

    /// Parse a module held in memory
    pub fn parse_bytes(bytes: &[u8]) -> Result<Module, ParseError> {
        let mut reader = bytes;
        Self::parse(&mut reader)
    }
}

/// Reads a module from a file
pub fn read_module<P: AsRef<Path>>(path: P) -> Result<Module, ParseError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    Parser::parse(&mut reader)
}

fn read_short_string<R: Read>(reader: &mut R) -> Result<String, ParseError> {
    let len = reader.read_u16::<LittleEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| ParseError::InvalidFormat(format!("Invalid UTF-8 string: {}", e)))
}

/// Read an `index + 1` name reference where 0 means anonymous
fn read_name_index<R: Read>(reader: &mut R, module: &Module) -> Result<Option<u32>, ParseError> {
    match reader.read_u32::<LittleEndian>()? {
        0 => Ok(None),
        raw => {
            let index = raw - 1;
            if module.constant_str(index).is_none() {
                return Err(ParseError::InvalidFormat(format!("Name {} is not a string constant", index)));
            }
            Ok(Some(index))
        }
    }
}

fn read_function<R: Read>(reader: &mut R, module: &Module) -> Result<Function, ParseError> {
    let name = read_name_index(reader, module)?;
    let arg_count = reader.read_u16::<LittleEndian>()?;
    let is_vararg = reader.read_u8()? != 0;
    let local_count = reader.read_u16::<LittleEndian>()?;

    let mut function = Function::new(name, arg_count, is_vararg, local_count);
    let instructions_len = reader.read_u32::<LittleEndian>()?;
    for _ in 0..instructions_len {
        function.instructions.push(read_instruction(reader, module.debug)?);
    }
    Ok(function)
}

fn read_instruction<R: Read>(reader: &mut R, debug: bool) -> Result<Instruction, ParseError> {
    let mut extended: u32 = 0;
    loop {
        let line = if debug { reader.read_u16::<LittleEndian>()? as u32 } else { 0 };
        let byte = reader.read_u8()?;
        let opcode = OpCode::from_byte(byte).ok_or(ParseError::UnknownOpcode(byte))?;
        let arg = reader.read_u8()? as u32;

        if opcode == OpCode::ExtendedArg {
            extended = (extended << 8) | arg;
            continue;
        }

        return Ok(Instruction {
            opcode,
            arg: (extended << 8) | arg,
            line,
        });
    }
}

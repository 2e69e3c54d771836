use crate::sunspec::error::ModbusError;
use crate::sunspec::registers::{RegType, Register, MODBUS_REGISTERS};
use nix::libc;
use rmodbus::server::context::ModbusContext;
use rmodbus::ErrorKind;

/// One immutable snapshot of the served holding-register bank.
///
/// A snapshot is never mutated after it has been published; updates clone the
/// current bank, write into the clone and atomically swap the shared pointer.
/// The serving side reads through the [`ModbusContext`] implementation, which
/// exposes holdings only.
#[derive(Clone)]
pub struct RegisterBank {
    regs: Box<[u16]>,
}

impl Default for RegisterBank {
    fn default() -> Self {
        Self::new()
    }
}

fn type_mismatch(reg: &Register, op: &str) -> ModbusError {
    ModbusError::custom(
        libc::EINVAL,
        format!("{op}: register type mismatch for {reg:?}"),
    )
}

impl RegisterBank {
    pub fn new() -> Self {
        RegisterBank {
            regs: vec![0u16; MODBUS_REGISTERS].into_boxed_slice(),
        }
    }

    pub fn get(&self, addr: u16) -> u16 {
        self.regs[addr as usize]
    }

    /// Contiguous view of the bank, handy for asserting served windows.
    pub fn window(&self, addr: u16, len: u16) -> &[u16] {
        let start = addr as usize;
        &self.regs[start..start + len as usize]
    }

    fn put_words(&mut self, addr: u16, words: &[u16]) {
        let start = addr as usize;
        self.regs[start..start + words.len()].copy_from_slice(words);
    }

    pub fn set_u16(&mut self, reg: Register, value: u16) -> Result<(), ModbusError> {
        if reg.rtype != RegType::U16 {
            return Err(type_mismatch(&reg, "set_u16"));
        }
        self.regs[reg.addr as usize] = value;
        Ok(())
    }

    pub fn set_i16(&mut self, reg: Register, value: i16) -> Result<(), ModbusError> {
        if reg.rtype != RegType::I16 {
            return Err(type_mismatch(&reg, "set_i16"));
        }
        self.regs[reg.addr as usize] = value as u16;
        Ok(())
    }

    /// 32-bit values occupy two consecutive registers, high word first
    /// (SunSpec ABCD order).
    pub fn set_u32(&mut self, reg: Register, value: u32) -> Result<(), ModbusError> {
        if reg.rtype != RegType::U32 {
            return Err(type_mismatch(&reg, "set_u32"));
        }
        self.put_words(reg.addr, &[(value >> 16) as u16, value as u16]);
        Ok(())
    }

    pub fn set_u64(&mut self, reg: Register, value: u64) -> Result<(), ModbusError> {
        if reg.rtype != RegType::U64 {
            return Err(type_mismatch(&reg, "set_u64"));
        }
        self.put_words(
            reg.addr,
            &[
                (value >> 48) as u16,
                (value >> 32) as u16,
                (value >> 16) as u16,
                value as u16,
            ],
        );
        Ok(())
    }

    pub fn set_f32(&mut self, reg: Register, value: f32) -> Result<(), ModbusError> {
        if reg.rtype != RegType::F32 {
            return Err(type_mismatch(&reg, "set_f32"));
        }
        let bits = value.to_bits();
        self.put_words(reg.addr, &[(bits >> 16) as u16, bits as u16]);
        Ok(())
    }

    /// Strings pack two ASCII bytes per register, high byte first; the
    /// trailing registers of the field are zeroed.
    pub fn set_string(&mut self, reg: Register, value: &str) -> Result<(), ModbusError> {
        if reg.rtype != RegType::Str {
            return Err(type_mismatch(&reg, "set_string"));
        }
        let capacity = reg.len as usize * 2;
        let bytes = value.as_bytes();
        if bytes.len() > capacity {
            return Err(ModbusError::custom(
                libc::EINVAL,
                format!(
                    "set_string: string length {} exceeds maximum of {capacity} for {reg:?}",
                    bytes.len()
                ),
            ));
        }

        for i in 0..reg.len as usize {
            let hi = bytes.get(2 * i).copied().unwrap_or(0) as u16;
            let lo = bytes.get(2 * i + 1).copied().unwrap_or(0) as u16;
            self.regs[reg.addr as usize + i] = (hi << 8) | lo;
        }
        Ok(())
    }

    /// Integer + scale factor encoding: the register receives
    /// `round(value · 10^decimals)` and the paired scale factor register
    /// `-decimals`.
    pub fn set_scaled(
        &mut self,
        reg: Register,
        sf: Register,
        value: f64,
        decimals: i32,
    ) -> Result<(), ModbusError> {
        let raw = (value * 10f64.powi(decimals)).round();
        match reg.rtype {
            RegType::I16 => {
                let raw = raw.clamp(i16::MIN as f64, i16::MAX as f64) as i16;
                self.regs[reg.addr as usize] = raw as u16;
            }
            RegType::U16 => {
                let raw = raw.clamp(0.0, u16::MAX as f64) as u16;
                self.regs[reg.addr as usize] = raw;
            }
            RegType::U32 => {
                let raw = raw.clamp(0.0, u32::MAX as f64) as u32;
                self.put_words(reg.addr, &[(raw >> 16) as u16, raw as u16]);
            }
            _ => return Err(type_mismatch(&reg, "set_scaled")),
        }
        self.set_i16(sf, -decimals as i16)
    }
}

/// Serving view: a read-only holding-register context. Every other table
/// reports out-of-context, which the framing layer answers with an
/// illegal-data-address exception.
impl ModbusContext for RegisterBank {
    fn get_holding(&self, reg: u16) -> Result<u16, ErrorKind> {
        Ok(self.regs[reg as usize])
    }

    fn set_holding(&mut self, _reg: u16, _value: u16) -> Result<(), ErrorKind> {
        Err(ErrorKind::OOBContext)
    }

    fn get_input(&self, _reg: u16) -> Result<u16, ErrorKind> {
        Err(ErrorKind::OOBContext)
    }

    fn set_input(&mut self, _reg: u16, _value: u16) -> Result<(), ErrorKind> {
        Err(ErrorKind::OOBContext)
    }

    fn get_coil(&self, _reg: u16) -> Result<bool, ErrorKind> {
        Err(ErrorKind::OOBContext)
    }

    fn set_coil(&mut self, _reg: u16, _value: bool) -> Result<(), ErrorKind> {
        Err(ErrorKind::OOBContext)
    }

    fn get_discrete(&self, _reg: u16) -> Result<bool, ErrorKind> {
        Err(ErrorKind::OOBContext)
    }

    fn set_discrete(&mut self, _reg: u16, _value: bool) -> Result<(), ErrorKind> {
        Err(ErrorKind::OOBContext)
    }
}

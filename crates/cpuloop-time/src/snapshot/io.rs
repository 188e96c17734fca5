use std::io::{Read, Write};

use super::error::{Result, SnapshotError};

pub trait WriteLeExt: Write {
    fn write_u8(&mut self, v: u8) -> Result<()> {
        self.write_all(&[v])?;
        Ok(())
    }

    fn write_u16_le(&mut self, v: u16) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_i64_le(&mut self, v: i64) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    /// Presence byte followed by the value when present.
    fn write_opt_i64_le(&mut self, v: Option<i64>) -> Result<()> {
        match v {
            Some(v) => {
                self.write_u8(1)?;
                self.write_i64_le(v)
            }
            None => self.write_u8(0),
        }
    }
}

impl<T: Write + ?Sized> WriteLeExt for T {}

pub trait ReadLeExt: Read {
    fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_u16_le(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_i64_le(&mut self) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    fn read_bool(&mut self, what: &'static str) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(SnapshotError::Corrupt(what)),
        }
    }

    fn read_opt_i64_le(&mut self, what: &'static str) -> Result<Option<i64>> {
        if self.read_bool(what)? {
            Ok(Some(self.read_i64_le()?))
        } else {
            Ok(None)
        }
    }
}

impl<T: Read + ?Sized> ReadLeExt for T {}

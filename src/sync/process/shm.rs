// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::{fs::OpenOptions, path::Path, ptr};

use memmap2::MmapMut;

use crate::{
    error::{Error, Result},
    sample::{DType, Value},
};

/// Size of the elapsed time word at the head of a block.
const ELAPSED_SIZE: usize = 8;

/// The latest tagged sample of one process-isolated stream: a file-backed shared mapping laid
/// out as `[elapsed: f64, value_0, value_1, ...]`, values in the stream's dtype, native endian.
///
/// The worker process is the only writer. Every field is naturally aligned and copied as one
/// word, so like the thread slots a reader may mix two samples but never tears a value.
pub struct SharedBlock {
    map: MmapMut,
    fields: usize,
    dtype: DType,
}

impl SharedBlock {
    /// The size in bytes of a block holding the given number of values.
    pub fn size(fields: usize, dtype: DType) -> usize {
        ELAPSED_SIZE + fields * dtype.size()
    }

    /// Sizes the file at the given path and maps it. Used by the writer.
    pub fn create(path: &Path, fields: usize, dtype: DType) -> Result<SharedBlock> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(SharedBlock::size(fields, dtype) as u64)?;
        // SAFETY: the file is private to one run; only the block API touches the mapping.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(SharedBlock { map, fields, dtype })
    }

    /// Maps a block created by [SharedBlock::create]. Used by the reader.
    pub fn open(path: &Path, fields: usize, dtype: DType) -> Result<SharedBlock> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let expected = SharedBlock::size(fields, dtype);
        let actual = file.metadata()?.len() as usize;
        if actual < expected {
            return Err(Error::Other(format!(
                "shared block {} is {} bytes, expected {}",
                path.display(),
                actual,
                expected
            )));
        }
        // SAFETY: see create.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(SharedBlock { map, fields, dtype })
    }

    /// Overwrites the block with a sample and its elapsed time.
    pub fn write(&mut self, elapsed: f64, values: &[Value]) -> Result<()> {
        if values.len() != self.fields {
            return Err(Error::Other(format!(
                "shared block holds {} values, got {}",
                self.fields,
                values.len()
            )));
        }
        if let Some(value) = values.iter().find(|value| value.dtype() != self.dtype) {
            return Err(Error::Other(format!(
                "shared block holds {} values, got {}",
                self.dtype,
                value.dtype()
            )));
        }

        self.write_word(0, ELAPSED_SIZE, elapsed.to_bits());
        let size = self.dtype.size();
        for (i, value) in values.iter().enumerate() {
            self.write_word(ELAPSED_SIZE + i * size, size, value.to_bits());
        }
        Ok(())
    }

    /// Copies the block into local memory and decodes it.
    pub fn snapshot(&self) -> (f64, Vec<Value>) {
        let mut values = Vec::with_capacity(self.fields + 1);
        self.snapshot_into(&mut values);
        let elapsed = values.remove(0).as_f64();
        (elapsed, values)
    }

    /// Appends the elapsed time, as an f64 value, then every value of the block.
    pub fn snapshot_into(&self, values: &mut Vec<Value>) {
        values.push(Value::from_bits(
            DType::F64,
            self.read_word(0, ELAPSED_SIZE),
        ));
        let size = self.dtype.size();
        values.extend((0..self.fields).map(|i| {
            Value::from_bits(self.dtype, self.read_word(ELAPSED_SIZE + i * size, size))
        }));
    }

    /// Copies the raw bytes of the block.
    pub fn snapshot_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(SharedBlock::size(self.fields, self.dtype));
        bytes.extend_from_slice(&self.read_word(0, ELAPSED_SIZE).to_ne_bytes());
        let size = self.dtype.size();
        for i in 0..self.fields {
            let word = self.read_word(ELAPSED_SIZE + i * size, size);
            match size {
                1 => bytes.extend_from_slice(&(word as u8).to_ne_bytes()),
                2 => bytes.extend_from_slice(&(word as u16).to_ne_bytes()),
                4 => bytes.extend_from_slice(&(word as u32).to_ne_bytes()),
                _ => bytes.extend_from_slice(&word.to_ne_bytes()),
            }
        }
        bytes
    }

    fn read_word(&self, offset: usize, size: usize) -> u64 {
        debug_assert!(offset + size <= self.map.len() && offset % size == 0);
        // SAFETY: in bounds and aligned, the mapping is page aligned and every offset is a
        // multiple of its size. Volatile since the other process writes behind our back.
        unsafe {
            let at = self.map.as_ptr().add(offset);
            match size {
                1 => ptr::read_volatile(at).into(),
                2 => ptr::read_volatile(at as *const u16).into(),
                4 => ptr::read_volatile(at as *const u32).into(),
                _ => ptr::read_volatile(at as *const u64),
            }
        }
    }

    fn write_word(&mut self, offset: usize, size: usize, bits: u64) {
        debug_assert!(offset + size <= self.map.len() && offset % size == 0);
        // SAFETY: see read_word.
        unsafe {
            let at = self.map.as_mut_ptr().add(offset);
            match size {
                1 => ptr::write_volatile(at, bits as u8),
                2 => ptr::write_volatile(at as *mut u16, bits as u16),
                4 => ptr::write_volatile(at as *mut u32, bits as u32),
                _ => ptr::write_volatile(at as *mut u64, bits),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use crate::sample::{DType, Value};

    use super::SharedBlock;

    fn sample(dtype: DType) -> Vec<Value> {
        [0.0, 1.0, -3.0, 127.0, 42.5]
            .iter()
            .map(|v| Value::from_f64(dtype, *v))
            .collect()
    }

    #[test]
    fn test_block_roundtrip_every_dtype() {
        let dir = tempfile::tempdir().unwrap();
        for dtype in DType::ALL {
            let path = dir.path().join(format!("{}.block", dtype));
            let values = sample(dtype);

            let mut writer = SharedBlock::create(&path, values.len(), dtype).unwrap();
            let reader = SharedBlock::open(&path, values.len(), dtype).unwrap();
            writer.write(1.25, &values).unwrap();

            let mut expected = 1.25f64.to_ne_bytes().to_vec();
            for value in values.iter() {
                let mut buf = vec![0u8; dtype.size()];
                value.write_ne(&mut buf);
                expected.extend(buf);
            }
            assert_eq!(expected, reader.snapshot_bytes(), "dtype {}", dtype);
            assert_eq!((1.25, values), reader.snapshot(), "dtype {}", dtype);
        }
    }

    #[test]
    fn test_block_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block");
        let mut writer = SharedBlock::create(&path, 2, DType::I64).unwrap();
        let reader = SharedBlock::open(&path, 2, DType::I64).unwrap();

        writer.write(0.1, &[Value::I64(1), Value::I64(2)]).unwrap();
        writer.write(0.2, &[Value::I64(i64::MIN), Value::I64(-1)]).unwrap();
        assert_eq!(
            (0.2, vec![Value::I64(i64::MIN), Value::I64(-1)]),
            reader.snapshot()
        );

        assert!(writer.write(0.3, &[Value::I64(1)]).is_err());
        assert!(writer.write(0.3, &[Value::I64(1), Value::I32(1)]).is_err());
    }

    #[test]
    fn test_open_too_small() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block");
        SharedBlock::create(&path, 1, DType::U8).unwrap();
        assert!(SharedBlock::open(&path, 4, DType::F64).is_err());
    }
}

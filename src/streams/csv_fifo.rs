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
use std::{fs::File, path::PathBuf};

use csv::{ReaderBuilder, StringRecord, StringRecordsIntoIter, Trim};

use crate::{
    error::{Error, Result},
    sample::{DType, Sample, Value},
};

use super::Generator;

/// Reads CSV rows from a named pipe (or any file) line by line.
///
/// Opening blocks until a writer opens the pipe, and every read blocks until a line is
/// available. The stream ends when the writing side closes the pipe.
pub struct CsvFifo {
    name: String,
    path: PathBuf,
    dtype: DType,
    header: Vec<String>,
    records: Option<StringRecordsIntoIter<File>>,
}

impl CsvFifo {
    pub fn new(name: &str, path: PathBuf, dtype: DType) -> CsvFifo {
        CsvFifo {
            name: name.to_string(),
            path,
            dtype,
            header: Vec::new(),
            records: None,
        }
    }

    fn parse(&self, record: StringRecord) -> Result<Sample> {
        let values = record
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let field = self.header.get(i).map(String::as_str).unwrap_or("?");
                Value::parse(self.dtype, field, text)
            })
            .collect::<Result<Vec<Value>>>()?;
        Sample::new(self.dtype, values)
    }
}

impl Generator for CsvFifo {
    fn header(&mut self) -> Result<Vec<String>> {
        let file = File::open(&self.path)?;
        let mut records = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(Trim::All)
            .from_reader(file)
            .into_records();
        let header = match records.next() {
            Some(header) => header?,
            None => return Err(Error::MissingHeader(self.name.clone())),
        };
        self.header = header.iter().map(str::to_string).collect();
        self.records = Some(records);
        Ok(self.header.clone())
    }

    fn next_sample(&mut self) -> Option<Result<Sample>> {
        let record = match self.records.as_mut()?.next()? {
            Ok(record) => record,
            Err(e) => return Some(Err(e.into())),
        };
        Some(self.parse(record))
    }
}

#[cfg(test)]
mod test {
    use std::{error::Error, fs};

    use crate::sample::{DType, Sample};

    use super::*;

    #[test]
    fn test_csv_fifo_from_file() -> std::result::Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data.csv");
        fs::write(&path, "x, y\n1, 2\n3,4\n")?;

        let mut fifo = CsvFifo::new("csv", path, DType::F64);
        assert_eq!(vec!["x", "y"], fifo.header()?);
        assert_eq!(Sample::from(vec![1.0, 2.0]), fifo.next_sample().unwrap()?);
        assert_eq!(Sample::from(vec![3.0, 4.0]), fifo.next_sample().unwrap()?);
        assert!(fifo.next_sample().is_none());
        Ok(())
    }

    #[test]
    fn test_csv_fifo_bad_value() -> std::result::Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data.csv");
        fs::write(&path, "x\nnope\n")?;

        let mut fifo = CsvFifo::new("csv", path, DType::F64);
        fifo.header()?;
        assert!(fifo.next_sample().unwrap().is_err());
        Ok(())
    }
}

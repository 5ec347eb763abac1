//! Append-only CSV spill for cold chains.
//!
//! One file per stack, `<stack>.csv` under the output directory, one row per
//! state: `sample_0,..,sample_{d-1},energy,sigma,beta,accepted,swap_type`.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use nalgebra::DVector;

use crate::state::{State, SwapType};
use crate::InferError;

pub struct CsvChainWriter {
    dir: PathBuf,
    writers: Vec<Option<csv::Writer<File>>>,
    recover: bool,
}

impl CsvChainWriter {
    pub fn new(dir: &Path, n_stacks: usize, recover: bool) -> Result<Self, InferError> {
        std::fs::create_dir_all(dir)?;
        Ok(CsvChainWriter {
            dir: dir.to_path_buf(),
            writers: (0..n_stacks).map(|_| None).collect(),
            recover,
        })
    }

    fn stack_path(dir: &Path, stack: usize) -> PathBuf {
        dir.join(format!("{stack}.csv"))
    }

    fn writer(&mut self, stack: usize) -> Result<&mut csv::Writer<File>, InferError> {
        if self.writers[stack].is_none() {
            let path = Self::stack_path(&self.dir, stack);
            let file = if self.recover {
                OpenOptions::new().create(true).append(true).open(&path)?
            } else {
                File::create(&path)?
            };
            self.writers[stack] = Some(
                csv::WriterBuilder::new()
                    .has_headers(false)
                    .from_writer(file),
            );
        }
        Ok(self.writers[stack].as_mut().expect("writer just created"))
    }

    pub fn append(&mut self, stack: usize, states: &[State]) -> Result<(), InferError> {
        let writer = self.writer(stack)?;
        for state in states {
            let mut row: Vec<String> = state.sample.iter().map(|v| v.to_string()).collect();
            row.push(state.energy.to_string());
            row.push(state.sigma.to_string());
            row.push(state.beta.to_string());
            row.push(u8::from(state.accepted).to_string());
            row.push(state.swap_type.to_u8().to_string());
            writer.write_record(&row)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Read back the last persisted state of a stack and the number of rows
    /// on disk. `None` if the file does not exist or is empty.
    pub fn read_last(dir: &Path, stack: usize) -> Result<Option<(State, u64)>, InferError> {
        let path = Self::stack_path(dir, stack);
        if !path.exists() {
            return Ok(None);
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(&path)?;
        let mut rows = 0u64;
        let mut last = None;
        for record in reader.records() {
            last = Some(record?);
            rows += 1;
        }
        let Some(record) = last else {
            return Ok(None);
        };

        let fields: Vec<&str> = record.iter().collect();
        if fields.len() < 6 {
            return Err(InferError::BadRow(format!(
                "{} fields in {}",
                fields.len(),
                path.display()
            )));
        }
        let dims = fields.len() - 5;
        let parse = |s: &str| -> Result<f64, InferError> {
            s.parse::<f64>()
                .map_err(|_| InferError::BadRow(format!("bad number {s:?} in {}", path.display())))
        };

        let sample = DVector::from_iterator(
            dims,
            fields[..dims]
                .iter()
                .map(|s| s.parse::<f64>().unwrap_or(f64::NAN)),
        );
        if sample.iter().any(|v| v.is_nan()) {
            return Err(InferError::BadRow(format!(
                "bad sample in {}",
                path.display()
            )));
        }

        let state = State {
            sample,
            energy: parse(fields[dims])?,
            sigma: parse(fields[dims + 1])?,
            beta: parse(fields[dims + 2])?,
            accepted: fields[dims + 3] == "1",
            swap_type: fields[dims + 4]
                .parse::<u8>()
                .ok()
                .and_then(SwapType::from_u8)
                .ok_or_else(|| {
                    InferError::BadRow(format!("bad swap type in {}", path.display()))
                })?,
        };
        Ok(Some((state, rows)))
    }
}

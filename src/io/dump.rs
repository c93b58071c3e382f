//! Full chi-square grid dump.
//!
//! One row per (galaxy, model) pair, streamed chunk by chunk so the dump
//! never needs more memory than the fit itself.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use crate::error::FitError;
use crate::fit::{ChiSquareGrid, GridSink, ModelCatalog, row_records};
use crate::io::export::{csv_err, fmt_f};

pub struct CsvGridSink {
    writer: csv::Writer<BufWriter<File>>,
    rows: usize,
}

impl CsvGridSink {
    pub fn create(path: &Path) -> Result<Self, FitError> {
        let file = File::create(path)?;
        let mut writer = csv::Writer::from_writer(BufWriter::new(file));
        writer
            .write_record(["id", "chunk", "index", "model_index", "chi2", "scale", "scale_err"])
            .map_err(csv_err)?;
        Ok(Self { writer, rows: 0 })
    }

    /// Flush and return the number of data rows written.
    pub fn finish(mut self) -> Result<usize, FitError> {
        self.writer.flush()?;
        Ok(self.rows)
    }
}

impl GridSink for CsvGridSink {
    fn write_block(&mut self, ids: &[String], grid: &ChiSquareGrid, catalog: &ModelCatalog) -> Result<(), FitError> {
        for (g, id) in ids.iter().enumerate() {
            for rec in row_records(grid.row(g), catalog.ids()) {
                self.writer
                    .write_record([
                        id.clone(),
                        rec.model.chunk.to_string(),
                        rec.model.index.to_string(),
                        rec.model_index.to_string(),
                        fmt_f(rec.chi2),
                        fmt_f(rec.scale),
                        fmt_f(rec.scale_err),
                    ])
                    .map_err(csv_err)?;
                self.rows += 1;
            }
        }
        Ok(())
    }
}

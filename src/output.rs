//! Tabular output of the command line tools: a terminal table, JSON lines or CSV.

use csv_core::WriteResult;
use std::io::Write as _;
use std::path::PathBuf;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Table,
    Jsonl,
    Csv,
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "output::Args")]
pub struct Args {
    /// Write to this file instead of the terminal.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    #[arg(long, short = 'f', value_enum, default_value_t = Format::Table)]
    format: Format,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open the specified output file at {1:?}")]
    OpenOutputFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the output file at {1:?}")]
    WriteFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the terminal")]
    WriteStdout(#[source] std::io::Error),
    #[error("could not serialize a record to JSON")]
    SerializeJson(#[source] serde_json::Error),
    #[error("CSV header must come before any row")]
    LateCsvHeader,
}

impl Args {
    pub fn open(self) -> Result<Output, Error> {
        let io = match &self.output {
            None => Box::new(std::io::stdout().lock()) as Box<dyn std::io::Write>,
            Some(path) => Box::new(
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| Error::OpenOutputFile(e, path.clone()))?,
            ) as Box<_>,
        };
        Ok(Output::new(self.format, io, self.output))
    }
}

enum Sink {
    Table(comfy_table::Table),
    Jsonl,
    Csv { rows: usize },
}

pub struct Output {
    io: Box<dyn std::io::Write>,
    path: Option<PathBuf>,
    sink: Sink,
}

impl Output {
    pub fn new(format: Format, io: Box<dyn std::io::Write>, path: Option<PathBuf>) -> Self {
        let sink = match format {
            Format::Table => {
                let mut table = comfy_table::Table::new();
                table.set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
                Sink::Table(table)
            }
            Format::Jsonl => Sink::Jsonl,
            Format::Csv => Sink::Csv { rows: 0 },
        };
        Self { io, path, sink }
    }

    /// Column names. JSON lines carry their own keys and ignore this.
    pub fn header(&mut self, columns: &[&str]) -> Result<(), Error> {
        match &mut self.sink {
            Sink::Table(table) => {
                table.set_header(columns.to_vec());
                Ok(())
            }
            Sink::Csv { rows } if *rows > 0 => Err(Error::LateCsvHeader),
            Sink::Csv { rows } => {
                *rows += 1;
                self.csv_row(columns)
            }
            Sink::Jsonl => Ok(()),
        }
    }

    /// Emit one record, either as table cells or as a serialized JSON object.
    pub fn row<R: serde::Serialize>(
        &mut self,
        cells: impl FnOnce() -> Vec<String>,
        record: impl FnOnce() -> R,
    ) -> Result<(), Error> {
        match &mut self.sink {
            Sink::Table(table) => {
                table.add_row(cells());
                Ok(())
            }
            Sink::Csv { rows } => {
                *rows += 1;
                self.csv_row(&cells())
            }
            Sink::Jsonl => {
                serde_json::to_writer(&mut self.io, &record()).map_err(Error::SerializeJson)?;
                writeln!(self.io).map_err(|e| self.write_error(e))
            }
        }
    }

    fn csv_row<S: AsRef<str>>(&mut self, fields: &[S]) -> Result<(), Error> {
        // A field at most doubles in size when every character is a quote.
        let longest = fields.iter().map(|f| f.as_ref().len()).max().unwrap_or(0);
        let mut buffer = vec![0; 2 * longest + 4];
        let mut writer = csv_core::Writer::new();
        let mut line = Vec::new();
        for (index, field) in fields.iter().enumerate() {
            if index > 0 {
                let (_, written) = writer.delimiter(&mut buffer);
                line.extend_from_slice(&buffer[..written]);
            }
            let (result, _, written) = writer.field(field.as_ref().as_bytes(), &mut buffer);
            debug_assert!(matches!(result, WriteResult::InputEmpty));
            line.extend_from_slice(&buffer[..written]);
        }
        let (_, written) = writer.terminator(&mut buffer);
        line.extend_from_slice(&buffer[..written]);
        self.io.write_all(&line).map_err(|e| self.write_error(e))
    }

    fn write_error(&self, e: std::io::Error) -> Error {
        match &self.path {
            None => Error::WriteStdout(e),
            Some(path) => Error::WriteFile(e, path.clone()),
        }
    }

    /// Flush everything out. Tables are only rendered at this point.
    pub fn finish(mut self) -> Result<(), Error> {
        if let Sink::Table(table) = &self.sink {
            writeln!(self.io, "{table}").map_err(|e| self.write_error(e))?;
        }
        self.io.flush().map_err(|e| self.write_error(e))
    }
}

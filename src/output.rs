use std::io::Write as _;
use std::path::PathBuf;

use csv_core::WriteResult;

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum Format {
    Table,
    Jsonl,
    Csv,
}

#[derive(clap::Parser)]
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
}

/// A row of command output.
///
/// Tables and CSV use `HEADERS` and [`Record::cells`]; JSONL uses the `Serialize` impl.
pub trait Record: serde::Serialize {
    const HEADERS: &'static [&'static str];
    fn cells(&self) -> Vec<String>;
}

impl Args {
    pub fn open<R: Record>(self) -> Result<Output<R>, Error> {
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
        let formatter = match self.format {
            Format::Table => {
                let mut comfy = comfy_table::Table::new();
                comfy
                    .set_header(R::HEADERS.to_vec())
                    .set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
                Formatter::Table { comfy }
            }
            Format::Jsonl => Formatter::Jsonl,
            Format::Csv => Formatter::Csv { header_written: false },
        };
        Ok(Output {
            path: self.output,
            io,
            formatter,
            _record: std::marker::PhantomData,
        })
    }
}

enum Formatter {
    Csv { header_written: bool },
    Table { comfy: comfy_table::Table },
    Jsonl,
}

pub struct Output<R> {
    path: Option<PathBuf>,
    io: Box<dyn std::io::Write>,
    formatter: Formatter,
    _record: std::marker::PhantomData<fn(&R)>,
}

impl<R: Record> Output<R> {
    pub fn record(&mut self, record: &R) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { header_written } => {
                if !*header_written {
                    *header_written = true;
                    self.write_csv_row(R::HEADERS)?;
                }
                self.write_csv_row(&record.cells())?;
            }
            Formatter::Table { comfy } => {
                comfy.add_row(record.cells());
            }
            Formatter::Jsonl => {
                serde_json::to_writer(&mut self.io, record).map_err(Error::SerializeJson)?;
                writeln!(self.io).map_err(|e| self.write_error(e))?;
            }
        }
        Ok(())
    }

    fn write_csv_row<V: AsRef<str>>(&mut self, values: &[V]) -> Result<(), Error> {
        let bytes = csv_row(values);
        self.io.write_all(&bytes).map_err(|e| self.write_error(e))
    }

    fn write_error(&self, e: std::io::Error) -> Error {
        match &self.path {
            None => Error::WriteStdout(e),
            Some(p) => Error::WriteFile(e, p.clone()),
        }
    }

    pub fn finish(mut self) -> Result<(), Error> {
        if let Formatter::Csv { header_written: false } = self.formatter {
            self.write_csv_row(R::HEADERS)?;
        }
        if let Formatter::Table { comfy } = &self.formatter {
            writeln!(self.io, "{comfy}").map_err(|e| self.write_error(e))?;
        }
        self.io.flush().map_err(|e| self.write_error(e))
    }
}

fn csv_row<V: AsRef<str>>(values: &[V]) -> Vec<u8> {
    let mut writer = csv_core::Writer::new();
    let mut row = Vec::new();
    let mut chunk = [0u8; 256];
    for (idx, value) in values.iter().enumerate() {
        if idx != 0 {
            let (_, n) = writer.delimiter(&mut chunk);
            row.extend_from_slice(&chunk[..n]);
        }
        let mut input = value.as_ref().as_bytes();
        loop {
            let (result, read, written) = writer.field(input, &mut chunk);
            row.extend_from_slice(&chunk[..written]);
            input = &input[read..];
            if let WriteResult::InputEmpty = result {
                break;
            }
        }
    }
    loop {
        let (result, written) = writer.terminator(&mut chunk);
        row.extend_from_slice(&chunk[..written]);
        if let WriteResult::InputEmpty = result {
            break;
        }
    }
    row
}

#[cfg(test)]
mod tests {
    use super::csv_row;

    #[test]
    fn csv_quoting() {
        let row = csv_row(&["Leaving water temp.", "a,b", "say \"hi\""]);
        assert_eq!(
            String::from_utf8(row).unwrap().trim_end(),
            "Leaving water temp.,\"a,b\",\"say \"\"hi\"\"\""
        );
        let long = "x".repeat(1000);
        assert!(csv_row(&[&long]).starts_with(long.as_bytes()));
    }
}

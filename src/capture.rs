use crate::sample::{Pin, SampleBuffer, SampleWord};
use polars::prelude::*;
use std::time::Duration;

const TIME_COLUMN_NAME: &str = "time";
const RAW_COLUMN_NAME: &str = "raw";

/// Samples captured during a transaction, kept for inspection after decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    sample_rate: u32,
    samples: SampleBuffer,
}

impl Capture {
    pub fn new(sample_rate: u32, samples: SampleBuffer) -> Self {
        Self {
            sample_rate,
            samples,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn samples(&self) -> &SampleBuffer {
        &self.samples
    }

    pub fn into_samples(self) -> SampleBuffer {
        self.samples
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate.max(1)))
    }

    /// Tabulate the capture: a `time` column in seconds, the `raw` sample word
    /// and one boolean `dio_N` column per requested pin.
    pub fn to_dataframe(&self, pins: &[Pin]) -> Result<DataFrame, PolarsError> {
        let raw: Vec<u32> = self.samples.iter().map(|word| u32::from(word.raw())).collect();
        let raw_column: Column = Series::new(RAW_COLUMN_NAME.into(), raw).into();

        let mut df = DataFrame::new(vec![raw_column])?
            .lazy()
            .with_row_index("row_index", Some(0))
            .with_columns([(col("row_index").cast(DataType::Float64)
                * lit(1.0 / f64::from(self.sample_rate.max(1))))
            .alias(TIME_COLUMN_NAME)])
            .select([col(TIME_COLUMN_NAME), col(RAW_COLUMN_NAME)])
            .collect()?;

        for &pin in pins {
            let levels: Vec<bool> = self.samples.levels(pin).collect();
            let column: Column = Series::new(format!("dio_{}", pin.index()).into(), levels).into();
            df.with_column(column)?;
        }

        Ok(df)
    }

    pub fn write_csv<W: std::io::Write>(&self, pins: &[Pin], writer: W) -> Result<(), PolarsError> {
        let mut df = self.to_dataframe(pins)?;
        CsvWriter::new(writer).include_header(true).finish(&mut df)
    }

    /// Load a capture previously written with [`Capture::write_csv`]. Only the
    /// `raw` column is needed.
    pub fn read_csv(data: &[u8], sample_rate: u32) -> Result<Self, PolarsError> {
        let df = CsvReadOptions::default()
            .with_has_header(true)
            .into_reader_with_file_handle(std::io::Cursor::new(data))
            .finish()?
            .lazy()
            .select([col(RAW_COLUMN_NAME).cast(DataType::UInt32)])
            .collect()?;

        let samples = df
            .column(RAW_COLUMN_NAME)?
            .u32()?
            .into_iter()
            .map(|raw| SampleWord::from_raw(raw.unwrap_or_default() as u16))
            .collect();

        Ok(Self::new(sample_rate, samples))
    }
}

//! Converts a reference RNA parquet matrix into a CSV whose first column is `gene_id`.
//!
//! The gene column is `Gene` when present, then a stored pandas index
//! (`__index_level_0__`), then whatever column comes first.

use polars::prelude::*;
use std::fs::File;
use std::io;
use std::path::Path;
use thiserror::Error;

pub const GENE_ID_COLUMN: &str = "gene_id";
const GENE_COLUMN: &str = "Gene";
const STORED_INDEX_COLUMN: &str = "__index_level_0__";

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("polars error: {0}")]
    Polars(#[from] PolarsError),
    #[error("Parquet file '{0}' has no columns.")]
    NoColumns(String),
}

/// Reads `input`, moves the gene column to the front as `gene_id`, and writes `output`.
pub fn parquet_to_counts_csv(input: &Path, output: &Path) -> Result<(), ConvertError> {
    let df = ParquetReader::new(File::open(input)?).finish()?;
    let mut out = with_gene_id_first(df, input)?;

    let mut file = File::create(output)?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .finish(&mut out)?;
    log::info!(
        "Wrote {} genes x {} columns to {}",
        out.height(),
        out.width(),
        output.display()
    );
    Ok(())
}

fn with_gene_id_first(mut df: DataFrame, source: &Path) -> Result<DataFrame, ConvertError> {
    let names: Vec<String> = df
        .get_column_names_str()
        .into_iter()
        .map(str::to_string)
        .collect();
    let gene_column = [GENE_COLUMN, STORED_INDEX_COLUMN]
        .into_iter()
        .find(|candidate| names.iter().any(|n| n == candidate))
        .map(str::to_string)
        .or_else(|| names.first().cloned())
        .ok_or_else(|| ConvertError::NoColumns(source.display().to_string()))?;

    if gene_column != GENE_ID_COLUMN {
        df.rename(&gene_column, GENE_ID_COLUMN.into())?;
    }

    let order: Vec<String> = std::iter::once(GENE_ID_COLUMN.to_string())
        .chain(
            names
                .into_iter()
                .filter(|n| *n != gene_column && n != GENE_ID_COLUMN),
        )
        .collect();
    Ok(df.select(order)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_parquet(df: &DataFrame, dir: &Path) -> std::path::PathBuf {
        let path = dir.join("reference.parquet");
        let mut file = File::create(&path).unwrap();
        let mut clone = df.clone();
        ParquetWriter::new(&mut file).finish(&mut clone).unwrap();
        path
    }

    fn convert(df: DataFrame) -> String {
        let dir = tempfile::tempdir().unwrap();
        let input = write_parquet(&df, dir.path());
        let output = dir.path().join("counts.csv");
        parquet_to_counts_csv(&input, &output).unwrap();
        std::fs::read_to_string(output).unwrap()
    }

    #[test]
    fn gene_column_is_renamed_and_moved_first() {
        let df = DataFrame::new(vec![
            Series::new("S1".into(), vec![1i64, 2]).into(),
            Series::new("Gene".into(), vec!["ENSG1", "ENSG2"]).into(),
            Series::new("S2".into(), vec![3i64, 4]).into(),
        ])
        .unwrap();
        let csv = convert(df);
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("gene_id,S1,S2"));
        assert_eq!(lines.next(), Some("ENSG1,1,3"));
    }

    #[test]
    fn stored_pandas_index_is_preferred_over_the_first_column() {
        let df = DataFrame::new(vec![
            Series::new("S1".into(), vec![5i64]).into(),
            Series::new("__index_level_0__".into(), vec!["ENSG9"]).into(),
        ])
        .unwrap();
        assert!(convert(df).starts_with("gene_id,S1\nENSG9,5"));
    }

    #[test]
    fn first_column_is_the_fallback() {
        let df = DataFrame::new(vec![
            Series::new("ensembl".into(), vec!["ENSG7"]).into(),
            Series::new("S1".into(), vec![8i64]).into(),
        ])
        .unwrap();
        assert!(convert(df).starts_with("gene_id,S1\nENSG7,8"));
    }

    #[test]
    fn missing_input_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("absent.parquet");
        let err = parquet_to_counts_csv(&input, &dir.path().join("o.csv")).unwrap_err();
        assert!(matches!(err, ConvertError::Io(_)));
    }
}

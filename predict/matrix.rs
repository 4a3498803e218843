//! # Feature Matrix Loader
//!
//! This module is the entry point for user-provided expression data. It reads a
//! delimited table in one of two orientations (samples as rows, or genes as rows),
//! canonicalizes gene identifiers according to a per-family policy, and collapses
//! identifiers that become equal by summing their values.
//!
//! - Forgiving cells: an absent, empty, or non-finite cell becomes `0.0`. A
//!   non-numeric cell is logged and also becomes `0.0`; the file is never rejected
//!   for missing data.
//! - Strict shape: a table with fewer than two columns cannot carry both a key and a
//!   value, and is rejected with `MatrixError::TooFewColumns`.
//! - The `csv` crate is used rather than a DataFrame reader because uploaded
//!   matrices routinely carry duplicate column headers, which must be merged rather
//!   than refused.

use ahash::AHashMap;
use ndarray::Array2;
use std::fs::File;
use std::io;
use std::path::Path;
use thiserror::Error;

/// The minimum number of columns any input table must have: one key, one value.
pub const MINIMUM_COLUMNS: usize = 2;

/// Which axis of the input table carries the samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    /// First column holds sample ids, the header holds gene ids.
    SamplesAsRows,
    /// First column holds gene ids, the header holds sample ids.
    GenesAsRows,
}

/// How gene identifiers are canonicalized before they are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierPolicy {
    /// Identifiers are used exactly as written (gene symbols).
    Verbatim,
    /// A trailing `.<digits>` version suffix is removed (versioned Ensembl accessions).
    StripVersion,
}

impl IdentifierPolicy {
    pub fn canonicalize<'a>(self, raw: &'a str) -> &'a str {
        match self {
            IdentifierPolicy::Verbatim => raw,
            IdentifierPolicy::StripVersion => strip_version_suffix(raw),
        }
    }
}

/// Options supplied by the caller, since the classifier families disagree on both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    pub orientation: Orientation,
    pub identifiers: IdentifierPolicy,
}

#[derive(Error, Debug)]
pub enum MatrixError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to read delimited text: {0}")]
    Csv(#[from] csv::Error),
    #[error(
        "Input table '{path}' has {found} column(s), but at least {required} are required (an identifier column and at least one value column)."
    )]
    TooFewColumns {
        path: String,
        found: usize,
        required: usize,
    },
    #[error("Input table '{0}' contains no samples.")]
    NoSamples(String),
}

/// A dense samples × genes matrix with unique, canonical gene keys.
///
/// Constructed once per invocation and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct FeatureMatrix {
    sample_ids: Vec<String>,
    gene_ids: Vec<String>,
    gene_index: AHashMap<String, usize>,
    /// Shape: [n_samples, n_genes].
    values: Array2<f64>,
}

impl FeatureMatrix {
    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn gene_ids(&self) -> &[String] {
        &self.gene_ids
    }

    pub fn n_genes(&self) -> usize {
        self.gene_ids.len()
    }

    pub fn contains_gene(&self, gene: &str) -> bool {
        self.gene_index.contains_key(gene)
    }

    /// The value for one sample and gene, or `None` if the gene is not a column.
    #[cfg(test)]
    fn value(&self, sample: usize, gene: &str) -> Option<f64> {
        let col = *self.gene_index.get(gene)?;
        self.values.get((sample, col)).copied()
    }

    /// Writes the matrix back out as CSV with samples as rows, which is the shape
    /// every classifier host accepts.
    pub fn write_csv(&self, path: &Path) -> Result<(), MatrixError> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(
            std::iter::once("sample_id").chain(self.gene_ids.iter().map(String::as_str)),
        )?;
        for (i, sample) in self.sample_ids.iter().enumerate() {
            let mut record = Vec::with_capacity(self.gene_ids.len() + 1);
            record.push(sample.clone());
            record.extend(self.values.row(i).iter().map(|v| v.to_string()));
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Per-gene totals from a two-column gene/count table.
#[derive(Debug, Clone, Default)]
pub struct GeneCounts {
    genes: Vec<String>,
    counts: Vec<f64>,
    index: AHashMap<String, usize>,
}

impl GeneCounts {
    fn add(&mut self, gene: &str, count: f64) {
        match self.index.get(gene) {
            Some(&i) => self.counts[i] += count,
            None => {
                self.index.insert(gene.to_string(), self.genes.len());
                self.genes.push(gene.to_string());
                self.counts.push(count);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.genes.len()
    }

    /// The summed count for a gene; absent genes count as zero.
    pub fn get(&self, gene: &str) -> f64 {
        self.index.get(gene).map_or(0.0, |&i| self.counts[i])
    }

    /// How many of `features` have a strictly positive count.
    pub fn count_nonzero<'a, I>(&self, features: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        features.into_iter().filter(|g| self.get(g) > 0.0).count()
    }
}

/// Removes a trailing `.<digits>` suffix, e.g. `ENSG00000141510.17` → `ENSG00000141510`.
pub fn strip_version_suffix(id: &str) -> &str {
    match id.rfind('.') {
        Some(dot) if dot > 0 => {
            let suffix = &id[dot + 1..];
            if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
                &id[..dot]
            } else {
                id
            }
        }
        _ => id,
    }
}

/// Loads a wide samples × genes (or genes × samples) table into a `FeatureMatrix`.
pub fn load_feature_matrix(
    path: &Path,
    options: LoadOptions,
) -> Result<FeatureMatrix, MatrixError> {
    let table = internal::read_table(path)?;
    let header = &table.header;
    if header.len() < MINIMUM_COLUMNS {
        return Err(MatrixError::TooFewColumns {
            path: path.display().to_string(),
            found: header.len(),
            required: MINIMUM_COLUMNS,
        });
    }

    let row_keys: Vec<&str> = table.rows.iter().map(|r| r.key.as_str()).collect();
    let column_keys: Vec<&str> = header[1..].iter().map(String::as_str).collect();

    let (sample_keys, raw_gene_keys) = match options.orientation {
        Orientation::SamplesAsRows => (&row_keys, &column_keys),
        Orientation::GenesAsRows => (&column_keys, &row_keys),
    };
    if sample_keys.is_empty() {
        return Err(MatrixError::NoSamples(path.display().to_string()));
    }

    // Assign each raw gene position to its canonical column, in first-seen order.
    let mut gene_ids: Vec<String> = Vec::new();
    let mut gene_index: AHashMap<String, usize> = AHashMap::new();
    let target: Vec<usize> = raw_gene_keys
        .iter()
        .map(|raw| {
            let canonical = options.identifiers.canonicalize(raw);
            *gene_index.entry(canonical.to_string()).or_insert_with(|| {
                gene_ids.push(canonical.to_string());
                gene_ids.len() - 1
            })
        })
        .collect();

    let merged = gene_ids.len() < raw_gene_keys.len();
    if merged {
        log::info!(
            "Merged {} gene columns into {} canonical identifiers by summation.",
            raw_gene_keys.len(),
            gene_ids.len()
        );
    }

    let mut values = Array2::<f64>::zeros((sample_keys.len(), gene_ids.len()));
    for (r, row) in table.rows.iter().enumerate() {
        for c in 0..column_keys.len() {
            let value = internal::coerce_cell(row.cells.get(c).map(String::as_str), || {
                format!("row '{}', column '{}'", row.key, column_keys[c])
            });
            let (sample, raw_gene) = match options.orientation {
                Orientation::SamplesAsRows => (r, c),
                Orientation::GenesAsRows => (c, r),
            };
            values[[sample, target[raw_gene]]] += value;
        }
    }

    Ok(FeatureMatrix {
        sample_ids: sample_keys.iter().map(|s| s.to_string()).collect(),
        gene_ids,
        gene_index,
        values,
    })
}

/// Loads a long two-column gene/count table and sums counts per canonical gene.
///
/// Only the first two columns are read; any further columns are ignored.
pub fn load_long_counts(
    path: &Path,
    identifiers: IdentifierPolicy,
) -> Result<GeneCounts, MatrixError> {
    let table = internal::read_table(path)?;
    if table.header.len() < MINIMUM_COLUMNS {
        return Err(MatrixError::TooFewColumns {
            path: path.display().to_string(),
            found: table.header.len(),
            required: MINIMUM_COLUMNS,
        });
    }

    let mut counts = GeneCounts::default();
    for row in &table.rows {
        let count = internal::coerce_cell(row.cells.first().map(String::as_str), || {
            format!("gene '{}'", row.key)
        });
        counts.add(identifiers.canonicalize(&row.key), count);
    }
    log::debug!(
        "Aggregated {} count rows into {} genes.",
        table.rows.len(),
        counts.len()
    );
    Ok(counts)
}

mod internal {
    use super::*;

    pub(super) struct RawRow {
        pub key: String,
        pub cells: Vec<String>,
    }

    pub(super) struct RawTable {
        pub header: Vec<String>,
        pub rows: Vec<RawRow>,
    }

    fn delimiter_for(path: &Path) -> u8 {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("tsv") || ext.eq_ignore_ascii_case("tab") => {
                b'\t'
            }
            _ => b',',
        }
    }

    pub(super) fn read_table(path: &Path) -> Result<RawTable, MatrixError> {
        let file = File::open(path)?;
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter_for(path))
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(file);

        let mut records = reader.records();
        let header: Vec<String> = match records.next() {
            Some(record) => record?.iter().map(str::to_string).collect(),
            None => Vec::new(),
        };

        let mut rows = Vec::new();
        for record in records {
            let record = record?;
            if record.len() <= 1 && record.get(0).is_none_or(str::is_empty) {
                continue;
            }
            let mut fields = record.iter();
            let Some(key) = fields.next() else {
                continue;
            };
            rows.push(RawRow {
                key: key.to_string(),
                cells: fields.map(str::to_string).collect(),
            });
        }
        Ok(RawTable { header, rows })
    }

    /// Turns one cell into a number. Missing, empty, and non-finite cells are zero.
    pub(super) fn coerce_cell<F>(cell: Option<&str>, location: F) -> f64
    where
        F: FnOnce() -> String,
    {
        let Some(text) = cell else {
            return 0.0;
        };
        if text.is_empty() {
            return 0.0;
        }
        match text.parse::<f64>() {
            Ok(v) if v.is_finite() => v,
            Ok(_) => 0.0,
            Err(_) => {
                log::warn!(
                    "Non-numeric value '{}' at {} was treated as 0.",
                    text,
                    location()
                );
                0.0
            }
        }
    }
}

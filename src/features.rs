//! Transaction loading and RFM feature derivation
//!
//! Raw invoice lines are validated once when they are read, then reduced to
//! one [`CustomerFeatureVector`] per customer. Aggregation is keyed and
//! ordered by customer id and invoice line, so the output does not depend on
//! the order in which transactions arrive.

use crate::artifacts::write_atomically;
use crate::error::{Result, SegmentError};
use chrono::{DateTime, Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use tracing::{debug, info};

/// Number of clustering dimensions (recency, frequency, monetary)
pub const N_FEATURES: usize = 3;

/// Feature names in column order
pub const FEATURE_NAMES: [&str; N_FEATURES] = ["recency", "frequency", "monetary"];

/// One value per feature, in [`FEATURE_NAMES`] order
pub type FeatureArray = [f64; N_FEATURES];

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M",
];

/// A single invoice line
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    /// `None` when the source row carries no customer id
    pub customer_id: Option<i64>,
    pub invoice_id: String,
    pub stock_code: String,
    pub description: String,
    pub invoice_timestamp: NaiveDateTime,
    pub quantity: i64,
    pub unit_price: f64,
    pub country: String,
}

/// Total order over every captured field. Two records with equal keys are
/// exact duplicates.
type RecordKey<'a> = (
    Option<i64>,
    &'a str,
    NaiveDateTime,
    &'a str,
    &'a str,
    i64,
    u64,
    &'a str,
);

impl TransactionRecord {
    /// Quantity times unit price; negative for returns and cancellations
    pub fn line_total(&self) -> f64 {
        self.quantity as f64 * self.unit_price
    }

    fn key(&self) -> RecordKey<'_> {
        (
            self.customer_id,
            &self.invoice_id,
            self.invoice_timestamp,
            &self.stock_code,
            &self.description,
            self.quantity,
            // Validated prices are non-negative, where bit order matches numeric order
            self.unit_price.to_bits(),
            &self.country,
        )
    }
}

/// Per-customer RFM aggregates
#[derive(Debug, Clone, PartialEq)]
pub struct CustomerFeatureVector {
    pub customer_id: i64,
    /// Whole days between the last purchase and the snapshot date
    pub recency: u64,
    /// Distinct invoices with a positive line total
    pub frequency: u64,
    /// Sum of positive line totals
    pub monetary: f64,
}

impl CustomerFeatureVector {
    pub fn recency_log(&self) -> f64 {
        log1p_clamped(self.recency as f64)
    }

    pub fn frequency_log(&self) -> f64 {
        log1p_clamped(self.frequency as f64)
    }

    pub fn monetary_log(&self) -> f64 {
        log1p_clamped(self.monetary)
    }

    /// Log-scaled features in [`FEATURE_NAMES`] order
    pub fn log_features(&self) -> FeatureArray {
        log_features(self.recency as f64, self.frequency as f64, self.monetary)
    }
}

/// `ln(1 + x)` for each raw aggregate, with negative inputs clamped to zero
pub fn log_features(recency: f64, frequency: f64, monetary: f64) -> FeatureArray {
    [
        log1p_clamped(recency),
        log1p_clamped(frequency),
        log1p_clamped(monetary),
    ]
}

fn log1p_clamped(value: f64) -> f64 {
    value.max(0.0).ln_1p()
}

/// Reference date for recency: one day after the latest timestamp
pub fn snapshot_date<'a, I>(records: I) -> Option<NaiveDateTime>
where
    I: IntoIterator<Item = &'a TransactionRecord>,
{
    records
        .into_iter()
        .map(|record| record.invoice_timestamp)
        .max()
        .map(|latest| latest + Duration::days(1))
}

#[derive(Debug)]
struct CustomerAggregate<'a> {
    last_purchase: NaiveDateTime,
    invoices: BTreeSet<&'a str>,
    monetary: f64,
}

/// Reduce transactions to one feature vector per customer
///
/// Records without a customer id and exact duplicates are dropped, then only
/// lines with a strictly positive total are aggregated. Customers whose lines
/// are all returns therefore do not appear in the output. An empty result is
/// valid.
pub fn derive_features(records: &[TransactionRecord]) -> Vec<CustomerFeatureVector> {
    let mut attributed: Vec<&TransactionRecord> = records
        .iter()
        .filter(|record| record.customer_id.is_some())
        .collect();
    let anonymous = records.len() - attributed.len();

    attributed.sort_by(|a, b| a.key().cmp(&b.key()));
    let before_dedup = attributed.len();
    attributed.dedup_by(|a, b| a.key() == b.key());
    let duplicates = before_dedup - attributed.len();

    let purchases: Vec<&TransactionRecord> = attributed
        .into_iter()
        .filter(|record| record.line_total() > 0.0)
        .collect();

    debug!(
        total = records.len(),
        anonymous,
        duplicates,
        purchases = purchases.len(),
        "filtered transactions"
    );

    let Some(snapshot) = snapshot_date(purchases.iter().copied()) else {
        info!("no purchases left after filtering; feature set is empty");
        return Vec::new();
    };

    let mut customers: BTreeMap<i64, CustomerAggregate<'_>> = BTreeMap::new();
    for record in purchases {
        let Some(customer_id) = record.customer_id else {
            continue;
        };
        let aggregate = customers
            .entry(customer_id)
            .or_insert_with(|| CustomerAggregate {
                last_purchase: record.invoice_timestamp,
                invoices: BTreeSet::new(),
                monetary: 0.0,
            });
        aggregate.last_purchase = aggregate.last_purchase.max(record.invoice_timestamp);
        aggregate.invoices.insert(record.invoice_id.as_str());
        aggregate.monetary += record.line_total();
    }

    let features: Vec<CustomerFeatureVector> = customers
        .into_iter()
        .map(|(customer_id, aggregate)| CustomerFeatureVector {
            customer_id,
            recency: (snapshot - aggregate.last_purchase).num_days().max(0) as u64,
            frequency: aggregate.invoices.len() as u64,
            monetary: aggregate.monetary,
        })
        .collect();

    info!(
        customers = features.len(),
        snapshot = %snapshot,
        "derived RFM features"
    );
    features
}

/// Transaction row as it appears in the source CSV
#[derive(Debug, Deserialize)]
struct RawTransaction {
    #[serde(rename = "InvoiceNo")]
    invoice_no: String,
    #[serde(rename = "StockCode", default)]
    stock_code: String,
    #[serde(rename = "Description", default)]
    description: String,
    #[serde(rename = "Quantity")]
    quantity: i64,
    #[serde(rename = "InvoiceDate")]
    invoice_date: String,
    #[serde(rename = "UnitPrice")]
    unit_price: f64,
    #[serde(rename = "CustomerID", default)]
    customer_id: String,
    #[serde(rename = "Country", default)]
    country: String,
}

impl RawTransaction {
    fn validate(self) -> std::result::Result<TransactionRecord, String> {
        let invoice_timestamp = parse_timestamp(&self.invoice_date)
            .ok_or_else(|| format!("unrecognized InvoiceDate '{}'", self.invoice_date))?;

        if !self.unit_price.is_finite() || self.unit_price < 0.0 {
            return Err(format!(
                "UnitPrice must be a non-negative number, got {}",
                self.unit_price
            ));
        }

        Ok(TransactionRecord {
            customer_id: parse_customer_id(&self.customer_id)?,
            invoice_id: self.invoice_no.trim().to_string(),
            stock_code: self.stock_code,
            description: self.description,
            invoice_timestamp,
            quantity: self.quantity,
            // Fold -0.0 into 0.0 so equal prices share one bit pattern
            unit_price: if self.unit_price == 0.0 { 0.0 } else { self.unit_price },
            country: self.country,
        })
    }
}

/// Accepts an empty field (no customer), an integer, or an integral float
fn parse_customer_id(raw: &str) -> std::result::Result<Option<i64>, String> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("nan") {
        return Ok(None);
    }
    if let Ok(id) = raw.parse::<i64>() {
        return Ok(Some(id));
    }
    match raw.parse::<f64>() {
        // i64::MAX as f64 rounds up to 2^63, so the upper bound is exclusive
        Ok(value)
            if value.fract() == 0.0 && value >= i64::MIN as f64 && value < i64::MAX as f64 =>
        {
            Ok(Some(value as i64))
        }
        Ok(value) if value.is_finite() => Err(format!("CustomerID '{raw}' is out of range")),
        _ => Err(format!("invalid CustomerID '{raw}'")),
    }
}

/// Parse the timestamp layouts seen in retail exports
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.naive_utc());
    }
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
}

/// Read transactions from CSV, failing on the first malformed row
pub fn read_transactions<R: Read>(reader: R) -> Result<Vec<TransactionRecord>> {
    let mut csv_reader = csv::ReaderBuilder::new().trim(csv::Trim::Headers).from_reader(reader);
    let mut records = Vec::new();

    for (index, row) in csv_reader.deserialize::<RawTransaction>().enumerate() {
        // Header is line 1
        let location = format!("line {}", index + 2);
        let raw = row.map_err(|err| SegmentError::input(&location, err.to_string()))?;
        let record = raw
            .validate()
            .map_err(|reason| SegmentError::input(&location, reason))?;
        records.push(record);
    }

    Ok(records)
}

/// Load transactions from a CSV file
pub fn load_transactions(path: &Path) -> Result<Vec<TransactionRecord>> {
    let file = File::open(path)
        .map_err(|err| SegmentError::input(path.display().to_string(), err.to_string()))?;
    let records = read_transactions(file).map_err(|err| match err {
        SegmentError::InputData { location, reason } => {
            SegmentError::input(format!("{}, {location}", path.display()), reason)
        }
        other => other,
    })?;
    info!(path = %path.display(), rows = records.len(), "loaded transactions");
    Ok(records)
}

const FEATURE_COLUMNS: [&str; 7] = [
    "CustomerID",
    "recency",
    "frequency",
    "monetary",
    "recency_log",
    "frequency_log",
    "monetary_log",
];

/// Feature row as written to and read from the features CSV
#[derive(Debug, Serialize, Deserialize)]
struct FeatureRow {
    #[serde(rename = "CustomerID")]
    customer_id: i64,
    recency: u64,
    frequency: u64,
    monetary: f64,
    #[serde(skip_deserializing, default)]
    recency_log: f64,
    #[serde(skip_deserializing, default)]
    frequency_log: f64,
    #[serde(skip_deserializing, default)]
    monetary_log: f64,
}

impl From<&CustomerFeatureVector> for FeatureRow {
    fn from(features: &CustomerFeatureVector) -> Self {
        Self {
            customer_id: features.customer_id,
            recency: features.recency,
            frequency: features.frequency,
            monetary: features.monetary,
            recency_log: features.recency_log(),
            frequency_log: features.frequency_log(),
            monetary_log: features.monetary_log(),
        }
    }
}

/// Write the feature dataset as CSV
pub fn write_features<W: Write>(writer: W, features: &[CustomerFeatureVector]) -> Result<()> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    if features.is_empty() {
        csv_writer.write_record(FEATURE_COLUMNS)?;
    }
    for customer in features {
        csv_writer.serialize(FeatureRow::from(customer))?;
    }
    csv_writer.flush()?;
    Ok(())
}

/// Write the feature dataset to `path`, replacing any previous file only on success
pub fn save_features(path: &Path, features: &[CustomerFeatureVector]) -> Result<()> {
    write_atomically(path, |writer| write_features(writer, features))?;
    info!(path = %path.display(), customers = features.len(), "saved RFM features");
    Ok(())
}

/// Read a feature dataset; log columns are recomputed from the raw aggregates
pub fn read_features<R: Read>(reader: R) -> Result<Vec<CustomerFeatureVector>> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let mut features = Vec::new();

    for (index, row) in csv_reader.deserialize::<FeatureRow>().enumerate() {
        let location = format!("line {}", index + 2);
        let row = row.map_err(|err| SegmentError::input(&location, err.to_string()))?;
        if row.frequency == 0 {
            return Err(SegmentError::input(&location, "frequency must be positive"));
        }
        if !row.monetary.is_finite() || row.monetary <= 0.0 {
            return Err(SegmentError::input(
                &location,
                format!("monetary must be positive, got {}", row.monetary),
            ));
        }
        features.push(CustomerFeatureVector {
            customer_id: row.customer_id,
            recency: row.recency,
            frequency: row.frequency,
            monetary: row.monetary,
        });
    }

    Ok(features)
}

/// Load a feature dataset from a CSV file
pub fn load_features(path: &Path) -> Result<Vec<CustomerFeatureVector>> {
    let file = File::open(path)
        .map_err(|err| SegmentError::input(path.display().to_string(), err.to_string()))?;
    let features = read_features(file)?;
    debug!(path = %path.display(), customers = features.len(), "loaded RFM features");
    Ok(features)
}

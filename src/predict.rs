//! Offline batch scoring of the customer feature dataset

use crate::artifacts::write_atomically;
use crate::error::Result;
use crate::features::CustomerFeatureVector;
use crate::serve::Segmenter;
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use tracing::info;

/// One row of the segment report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredCustomer {
    #[serde(rename = "CustomerID")]
    pub customer_id: i64,
    pub recency: u64,
    pub frequency: u64,
    pub monetary: f64,
    pub segment_name: String,
    #[serde(skip)]
    pub cluster_label: usize,
}

/// Run every customer through the serving pipeline
pub fn score_customers(
    features: &[CustomerFeatureVector],
    segmenter: &Segmenter,
) -> Vec<ScoredCustomer> {
    features
        .iter()
        .map(|customer| {
            let assignment = segmenter.assign_log(&customer.log_features());
            ScoredCustomer {
                customer_id: customer.customer_id,
                recency: customer.recency,
                frequency: customer.frequency,
                monetary: customer.monetary,
                segment_name: assignment.segment.to_string(),
                cluster_label: assignment.cluster,
            }
        })
        .collect()
}

/// Customers per segment, ordered by cluster id
pub fn segment_counts(scored: &[ScoredCustomer]) -> Vec<(String, usize)> {
    let mut counts: Vec<(usize, String, usize)> = Vec::new();
    for customer in scored {
        match counts
            .iter_mut()
            .find(|(cluster, _, _)| *cluster == customer.cluster_label)
        {
            Some((_, _, count)) => *count += 1,
            None => counts.push((customer.cluster_label, customer.segment_name.clone(), 1)),
        }
    }
    counts.sort_by_key(|(cluster, _, _)| *cluster);
    counts
        .into_iter()
        .map(|(_, name, count)| (name, count))
        .collect()
}

/// Write `CustomerID,recency,frequency,monetary,segment_name` rows
pub fn write_segments<W: Write>(writer: W, scored: &[ScoredCustomer]) -> Result<()> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    if scored.is_empty() {
        csv_writer.write_record([
            "CustomerID",
            "recency",
            "frequency",
            "monetary",
            "segment_name",
        ])?;
    }
    for customer in scored {
        csv_writer.serialize(customer)?;
    }
    csv_writer.flush()?;
    Ok(())
}

pub fn save_segments(path: &Path, scored: &[ScoredCustomer]) -> Result<()> {
    write_atomically(path, |writer| write_segments(writer, scored))?;
    info!(path = %path.display(), customers = scored.len(), "saved customer segments");
    Ok(())
}

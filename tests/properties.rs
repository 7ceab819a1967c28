//! Property tests for the feature and serving transforms

use chrono::NaiveDate;
use ndarray::array;
use proptest::prelude::*;
use rfmforge::features::log_features;
use rfmforge::{
    derive_features, NormalizationParams, PartitionModel, TrainingBounds, TransactionRecord,
};

fn record(
    customer: i64,
    invoice: u32,
    day: u32,
    quantity: i64,
    price_cents: u32,
) -> TransactionRecord {
    TransactionRecord {
        customer_id: Some(customer),
        invoice_id: format!("{}", 500000 + invoice),
        stock_code: "85123A".to_string(),
        description: "ITEM".to_string(),
        invoice_timestamp: NaiveDate::from_ymd_opt(2011, 1, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
            + chrono::Duration::days(day as i64),
        quantity,
        unit_price: price_cents as f64 / 100.0,
        country: "United Kingdom".to_string(),
    }
}

fn transactions() -> impl Strategy<Value = Vec<TransactionRecord>> {
    prop::collection::vec(
        (1i64..8, 0u32..20, 0u32..365, -3i64..10, 0u32..5000),
        0..60,
    )
    .prop_map(|rows| {
        rows.into_iter()
            .map(|(customer, invoice, day, quantity, cents)| {
                record(customer, invoice, day, quantity, cents)
            })
            .collect()
    })
}

fn feature_triple() -> impl Strategy<Value = [f64; 3]> {
    [-50.0f64..50.0, -50.0f64..50.0, -50.0f64..50.0]
}

proptest! {
    #[test]
    fn derived_features_ignore_input_order(
        (records, shuffled) in transactions().prop_flat_map(|records| {
            let shuffled = Just(records.clone()).prop_shuffle();
            (Just(records), shuffled)
        })
    ) {
        prop_assert_eq!(derive_features(&records), derive_features(&shuffled));
    }

    #[test]
    fn derived_features_are_positive_and_finite(records in transactions()) {
        let features = derive_features(&records);
        for pair in features.windows(2) {
            prop_assert!(pair[0].customer_id < pair[1].customer_id);
        }
        for customer in &features {
            prop_assert!(customer.frequency >= 1);
            prop_assert!(customer.monetary > 0.0);
            prop_assert!(customer.log_features().iter().all(|v| v.is_finite() && *v >= 0.0));
        }
    }

    #[test]
    fn clamp_is_idempotent_and_lands_in_bounds(
        a in feature_triple(),
        b in feature_triple(),
        value in feature_triple(),
    ) {
        let bounds = TrainingBounds {
            min: [a[0].min(b[0]), a[1].min(b[1]), a[2].min(b[2])],
            max: [a[0].max(b[0]), a[1].max(b[1]), a[2].max(b[2])],
        };
        let clamped = bounds.clamp(&value);
        prop_assert!(bounds.contains(&clamped));
        prop_assert_eq!(bounds.clamp(&clamped), clamped);
        if bounds.contains(&value) {
            prop_assert_eq!(clamped, value);
        }
    }

    #[test]
    fn normalization_round_trips(
        value in feature_triple(),
        mean in feature_triple(),
        std in [0.01f64..10.0, 0.01f64..10.0, 0.01f64..10.0],
    ) {
        let params = NormalizationParams { mean, std };
        let restored = params.inverse_transform(&params.transform(&value));
        for (original, back) in value.iter().zip(restored.iter()) {
            prop_assert!((original - back).abs() <= 1e-9 * (1.0 + original.abs()));
        }
    }

    #[test]
    fn equidistant_points_go_to_lowest_id(offset in -5.0f64..5.0, spread in 0.5f64..5.0) {
        let model = PartitionModel::new(array![
            [-spread, 0.0, 0.0],
            [spread, 0.0, 0.0],
        ])
        .unwrap();
        prop_assert_eq!(model.assign(&[0.0, offset, offset]), 0);
        prop_assert_eq!(model.assign(&[spread, offset, 0.0]), 1);
    }

    #[test]
    fn log_features_are_monotone(r in 0u32..10_000, f in 1u32..500, m in 0.01f64..1e6) {
        let base = log_features(r as f64, f as f64, m);
        let larger = log_features(r as f64 + 1.0, f as f64 + 1.0, m * 2.0);
        for (lo, hi) in base.iter().zip(larger.iter()) {
            prop_assert!(lo < hi);
        }
    }
}

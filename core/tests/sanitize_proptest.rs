use proptest::prelude::*;
use telemetrycore::math::StatsHelper;
use telemetrycore::processing::TransformationStage;
use telemetrycore::{DataType, SampleValue};

fn any_float() -> impl Strategy<Value = f64> {
    prop_oneof![
        Just(f64::NAN),
        Just(f64::INFINITY),
        Just(f64::NEG_INFINITY),
        -1.0e12..1.0e12f64,
    ]
}

proptest! {
    #[test]
    fn numeric_normalization_is_always_finite(value in any_float()) {
        let out = TransformationStage::normalize(SampleValue::Numeric(value), DataType::Numeric, 6);
        match out {
            SampleValue::Numeric(v) => prop_assert!(v.is_finite()),
            other => prop_assert!(false, "unexpected shape {:?}", other),
        }
    }

    #[test]
    fn vector_normalization_keeps_length(values in prop::collection::vec(any_float(), 0..16)) {
        let len = values.len();
        let out = TransformationStage::normalize(SampleValue::Vector(values), DataType::Vector, 6);
        match out {
            SampleValue::Vector(v) => {
                prop_assert_eq!(v.len(), len);
                prop_assert!(v.iter().all(|x| x.is_finite()));
            }
            other => prop_assert!(false, "unexpected shape {:?}", other),
        }
    }

    #[test]
    fn median_lies_between_min_and_max(values in prop::collection::vec(-1.0e6..1.0e6f64, 1..64)) {
        let median = StatsHelper::median(&values);
        prop_assert!(median >= StatsHelper::min(&values));
        prop_assert!(median <= StatsHelper::max(&values));
    }
}

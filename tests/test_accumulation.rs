use chrono::NaiveDate;
use forestwatch::core::accumulator::{AccumulatorState, TemporalAccumulator};
use forestwatch::core::report::to_hectares;
use forestwatch::types::{CoverClass, ForestError, ForestMask, GeoTransform, Raster};
use ndarray::{s, Array2};

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

fn mask(data: Array2<CoverClass>) -> ForestMask {
    Raster::new(data, GeoTransform::north_up(500_000.0, 1_250_300.0, 30.0, 30.0), 32618)
}

#[test]
fn test_area_is_pure_function_of_count_and_resolution() {
    assert_eq!(to_hectares(100, 30.0, 30.0), 9.0);
}

#[test]
fn test_three_scene_forest_history() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut acc = TemporalAccumulator::new("test park");

    // A: all forest
    let a = date(2021, 1, 1);
    let step = acc
        .push(a, mask(Array2::from_elem((10, 10), CoverClass::Forest)))
        .expect("scene A");
    assert_eq!(step.hectares, 9.0);
    assert_eq!(acc.state(), AccumulatorState::Seeded);

    // B: top half forest, bottom half cloud
    let b = date(2021, 1, 8);
    let mut cloudy = Array2::from_elem((10, 10), CoverClass::NoData);
    cloudy.slice_mut(s![0..5, ..]).fill(CoverClass::Forest);
    let step = acc.push(b, mask(cloudy)).expect("scene B");
    assert_eq!(step.hectares, 9.0);
    assert_eq!(step.backfilled, 50);
    assert_eq!(acc.merged().expect("merged").forest_count(), 100);

    // C: no forest, fully valid
    let c = date(2021, 1, 15);
    let step = acc
        .push(c, mask(Array2::from_elem((10, 10), CoverClass::NonForest)))
        .expect("scene C");
    assert_eq!(step.hectares, 0.0);
    assert_eq!(acc.state(), AccumulatorState::Accumulating);

    let history = acc.history();
    assert_eq!(history.dates(), vec![a, b, c]);
    assert_eq!(history.hectares(), vec![9.0, 9.0, 0.0]);
    assert!(acc
        .merged()
        .expect("merged")
        .data()
        .iter()
        .all(|c| *c == CoverClass::NonForest));
}

#[test]
fn test_scenes_in_date_order() {
    let mut acc = TemporalAccumulator::new("test park");
    let dates = [date(2021, 1, 1), date(2021, 1, 8), date(2021, 1, 15)];
    for d in dates {
        acc.push(d, mask(Array2::from_elem((3, 3), CoverClass::Forest)))
            .expect("ordered scene");
    }
    assert_eq!(acc.history().len(), 3);
    assert_eq!(acc.history().dates(), dates.to_vec());
}

#[test]
fn test_out_of_order_scene_rejected() {
    let mut acc = TemporalAccumulator::new("test park");
    acc.push(date(2021, 1, 15), mask(Array2::from_elem((3, 3), CoverClass::Forest)))
        .expect("first scene");

    let err = acc
        .push(date(2021, 1, 1), mask(Array2::from_elem((3, 3), CoverClass::Forest)))
        .unwrap_err();
    match err {
        ForestError::OutOfOrderScene { date: d, last } => {
            assert_eq!(d, date(2021, 1, 1));
            assert_eq!(last, date(2021, 1, 15));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(acc.history().len(), 1);
}

use crate::config::MATERIAL_CHANGE_EPSILON;
use crate::types::{ChangeSummary, DerivedView, MetricDelta};

/// Float slack so that e.g. 100.2 - 100.1 still reads as exactly 0.1.
const FLOAT_SLACK: f64 = 1e-9;

/// The three numbers a change is judged on.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Headline {
    pub points: Option<f64>,
    pub pace: Option<f64>,
    pub total: Option<f64>,
}

impl Headline {
    pub fn of(view: &DerivedView) -> Self {
        Self {
            points: view.total_points.map(f64::from),
            pace: view.pace,
            total: view.total_value,
        }
    }
}

pub fn exceeds_threshold(diff: f64) -> bool {
    diff.abs() > MATERIAL_CHANGE_EPSILON + FLOAT_SLACK
}

/// Compare the new headline with the last published one.
/// Missing values count as 0. With nothing published yet the change is always material.
pub fn summarize(previous: Option<&Headline>, current: &Headline) -> ChangeSummary {
    let delta = |new: Option<f64>, old: Option<f64>| {
        let value = new.unwrap_or(0.0);
        MetricDelta { value, diff: value - old.unwrap_or(0.0) }
    };

    let Some(prev) = previous else {
        let zero = Headline::default();
        return ChangeSummary {
            first_view: true,
            material: true,
            points: delta(current.points, zero.points),
            pace: delta(current.pace, zero.pace),
            total: delta(current.total, zero.total),
        };
    };

    let points = delta(current.points, prev.points);
    let pace = delta(current.pace, prev.pace);
    let total = delta(current.total, prev.total);
    ChangeSummary {
        first_view: false,
        material: exceeds_threshold(points.diff)
            || exceeds_threshold(pace.diff)
            || exceeds_threshold(total.diff),
        points,
        pace,
        total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headline(points: f64, pace: f64, total: f64) -> Headline {
        Headline { points: Some(points), pace: Some(pace), total: Some(total) }
    }

    #[test]
    fn total_move_of_exactly_threshold_is_not_material() {
        let prev = headline(80.0, 160.0, 150.0);
        let cur = headline(80.0, 160.0, 150.1);
        assert!(!summarize(Some(&prev), &cur).material);

        let prev = headline(80.0, 160.0, 100.1);
        let cur = headline(80.0, 160.0, 100.2);
        assert!(!summarize(Some(&prev), &cur).material);
    }

    #[test]
    fn total_move_above_threshold_is_material() {
        let prev = headline(80.0, 160.0, 150.0);
        let cur = headline(80.0, 160.0, 150.11);
        let summary = summarize(Some(&prev), &cur);
        assert!(summary.material);
        assert!((summary.total.diff - 0.11).abs() < 1e-9);
        assert_eq!(summary.total.value, 150.11);
    }

    #[test]
    fn a_basket_is_material() {
        let prev = headline(80.0, 160.0, 150.0);
        let cur = headline(82.0, 160.0, 150.0);
        let summary = summarize(Some(&prev), &cur);
        assert!(summary.material);
        assert_eq!(summary.points.diff, 2.0);
        assert_eq!(summary.pace.diff, 0.0);
    }

    #[test]
    fn missing_values_count_as_zero() {
        let prev = Headline { points: Some(10.0), pace: None, total: None };
        let cur = Headline { points: Some(10.0), pace: None, total: Some(140.5) };
        let summary = summarize(Some(&prev), &cur);
        assert!(summary.material);
        assert_eq!(summary.total.diff, 140.5);
        assert_eq!(summary.pace.value, 0.0);
    }

    #[test]
    fn first_view_is_material() {
        let summary = summarize(None, &Headline::default());
        assert!(summary.first_view);
        assert!(summary.material);
    }
}

use serde::Serialize;
use std::collections::HashMap;

/// 1-decimal display rounding applied to every percentage that leaves this
/// module. `(10x + 0.5).floor() / 10` matches the legacy report cards.
pub fn round_to_tenth(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Debug, Clone)]
pub struct CategoryDef {
    pub id: String,
    pub name: String,
    pub weight: f64,
    pub sort_order: i64,
}

#[derive(Debug, Clone)]
pub struct AssignmentDef {
    pub id: String,
    pub category_id: Option<String>,
    pub title: String,
    pub out_of: f64,
}

/// Sparse score table keyed by (assignment id, student id). A present entry
/// is a graded mark, including 0.0; an absent entry means "not graded".
pub type ScoreTable = HashMap<(String, String), f64>;

/// Raw form input for one score cell. Numbers and numeric strings are points;
/// blank, null, missing, and non-numeric text all mean "not graded" rather
/// than zero. Negative and non-finite values are rejected so a typo cannot
/// silently erase a mark.
pub fn parse_score_entry(raw: Option<&serde_json::Value>) -> Result<Option<f64>, CalcError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let parsed = match raw {
        serde_json::Value::Null => None,
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                t.parse::<f64>().ok()
            }
        }
        other => {
            return Err(
                CalcError::new("bad_params", "score must be a number or string")
                    .with_details(serde_json::json!({ "value": other })),
            );
        }
    };
    match parsed {
        None => Ok(None),
        Some(v) if !v.is_finite() => {
            Err(CalcError::new("bad_params", "score must be a finite number"))
        }
        Some(v) if v < 0.0 => Err(CalcError::new("bad_params", "negative marks are not allowed")
            .with_details(serde_json::json!({ "value": v }))),
        Some(v) => Ok(Some(v)),
    }
}

/// Final percentage for one student, or `None` when no category has any
/// graded work.
///
/// Per category: earned and max points are summed across graded assignments
/// only. A category with at least one graded assignment contributes
/// `fraction * weight` and its weight to the attempted-weight denominator;
/// ungraded categories are excluded entirely, so the remaining weights are
/// renormalized rather than averaged against a fixed 100.
pub fn final_percentage(
    categories: &[CategoryDef],
    assignments: &[AssignmentDef],
    scores: &ScoreTable,
    student_id: &str,
) -> Option<f64> {
    let mut sums: HashMap<&str, (f64, f64)> = HashMap::new();
    for a in assignments {
        let Some(cat_id) = a.category_id.as_deref() else {
            continue;
        };
        if a.out_of <= 0.0 {
            continue;
        }
        let Some(&points) = scores.get(&(a.id.clone(), student_id.to_string())) else {
            continue;
        };
        let entry = sums.entry(cat_id).or_insert((0.0, 0.0));
        entry.0 += points;
        entry.1 += a.out_of;
    }

    let mut total = 0.0_f64;
    let mut weight_used = 0.0_f64;
    for c in categories {
        let Some(&(earned, max)) = sums.get(c.id.as_str()) else {
            continue;
        };
        if max <= 0.0 {
            continue;
        }
        total += (earned / max) * c.weight;
        weight_used += c.weight;
    }

    if weight_used > 0.0 {
        Some(total / weight_used * 100.0)
    } else {
        None
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryPercent {
    pub category_id: String,
    pub name: String,
    pub weight: f64,
    pub percent: Option<f64>,
    pub graded_count: usize,
}

/// Per-category percentages for one student, in category sort order.
/// `percent` is `None` for a category with no graded work.
pub fn category_breakdown(
    categories: &[CategoryDef],
    assignments: &[AssignmentDef],
    scores: &ScoreTable,
    student_id: &str,
) -> Vec<CategoryPercent> {
    let mut sums: HashMap<&str, (f64, f64, usize)> = HashMap::new();
    for a in assignments {
        let Some(cat_id) = a.category_id.as_deref() else {
            continue;
        };
        if a.out_of <= 0.0 {
            continue;
        }
        let Some(&points) = scores.get(&(a.id.clone(), student_id.to_string())) else {
            continue;
        };
        let entry = sums.entry(cat_id).or_insert((0.0, 0.0, 0));
        entry.0 += points;
        entry.1 += a.out_of;
        entry.2 += 1;
    }

    categories
        .iter()
        .map(|c| {
            let (percent, graded_count) = match sums.get(c.id.as_str()) {
                Some(&(earned, max, n)) if max > 0.0 => {
                    (Some(round_to_tenth(100.0 * earned / max)), n)
                }
                Some(&(_, _, n)) => (None, n),
                None => (None, 0),
            };
            CategoryPercent {
                category_id: c.id.clone(),
                name: c.name.clone(),
                weight: c.weight,
                percent,
                graded_count,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssignmentAverage {
    pub avg_raw: f64,
    pub avg_percent: f64,
    pub graded_count: usize,
    pub ungraded_count: usize,
}

/// Class statistics for one assignment. Only graded cells enter the average;
/// an all-ungraded assignment reports zero averages with a zero denominator.
pub fn assignment_average<I>(cells: I, out_of: f64) -> AssignmentAverage
where
    I: IntoIterator<Item = Option<f64>>,
{
    let mut graded_count = 0_usize;
    let mut ungraded_count = 0_usize;
    let mut sum_raw = 0.0_f64;

    for cell in cells {
        match cell {
            None => ungraded_count += 1,
            Some(v) => {
                graded_count += 1;
                sum_raw += v;
            }
        }
    }

    let avg_raw = if graded_count > 0 {
        sum_raw / graded_count as f64
    } else {
        0.0
    };
    let avg_percent = if out_of > 0.0 {
        100.0 * avg_raw / out_of
    } else {
        0.0
    };

    AssignmentAverage {
        avg_raw,
        avg_percent,
        graded_count,
        ungraded_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cat(id: &str, weight: f64) -> CategoryDef {
        CategoryDef {
            id: id.to_string(),
            name: id.to_string(),
            weight,
            sort_order: 0,
        }
    }

    fn asg(id: &str, cat_id: &str, out_of: f64) -> AssignmentDef {
        AssignmentDef {
            id: id.to_string(),
            category_id: Some(cat_id.to_string()),
            title: id.to_string(),
            out_of,
        }
    }

    fn score(table: &mut ScoreTable, assignment: &str, student: &str, points: f64) {
        table.insert((assignment.to_string(), student.to_string()), points);
    }

    #[test]
    fn all_ungraded_yields_none() {
        let cats = vec![cat("hw", 40.0), cat("test", 60.0)];
        let asgs = vec![asg("a1", "hw", 10.0), asg("a2", "test", 100.0)];
        let scores = ScoreTable::new();
        assert_eq!(final_percentage(&cats, &asgs, &scores, "s1"), None);
    }

    #[test]
    fn perfect_scores_yield_one_hundred() {
        let cats = vec![cat("hw", 20.0), cat("quiz", 30.0), cat("test", 50.0)];
        let asgs = vec![
            asg("a1", "hw", 10.0),
            asg("a2", "quiz", 25.0),
            asg("a3", "test", 100.0),
        ];
        let mut scores = ScoreTable::new();
        score(&mut scores, "a1", "s1", 10.0);
        score(&mut scores, "a2", "s1", 25.0);
        score(&mut scores, "a3", "s1", 100.0);
        let got = final_percentage(&cats, &asgs, &scores, "s1").expect("graded");
        assert!((got - 100.0).abs() < 1e-9);
    }

    #[test]
    fn ungraded_category_weights_are_renormalized() {
        // hw 20 / quiz 30 / test 50, only "test" graded at 80/100.
        // The attempted weight is 50, so the final is 80, not 40.
        let cats = vec![cat("hw", 20.0), cat("quiz", 30.0), cat("test", 50.0)];
        let asgs = vec![
            asg("a1", "hw", 10.0),
            asg("a2", "quiz", 25.0),
            asg("a3", "test", 100.0),
        ];
        let mut scores = ScoreTable::new();
        score(&mut scores, "a3", "s1", 80.0);
        let got = final_percentage(&cats, &asgs, &scores, "s1").expect("graded");
        assert!((got - 80.0).abs() < 1e-9);
    }

    #[test]
    fn zero_weight_category_never_changes_the_result() {
        let cats = vec![cat("hw", 20.0), cat("test", 50.0)];
        let asgs = vec![asg("a1", "hw", 10.0), asg("a2", "test", 100.0)];
        let mut scores = ScoreTable::new();
        score(&mut scores, "a1", "s1", 7.0);
        score(&mut scores, "a2", "s1", 80.0);
        let before = final_percentage(&cats, &asgs, &scores, "s1");

        let mut cats2 = cats.clone();
        cats2.push(cat("extra", 0.0));
        let mut asgs2 = asgs.clone();
        asgs2.push(asg("a3", "extra", 10.0));
        score(&mut scores, "a3", "s1", 10.0);
        let after = final_percentage(&cats2, &asgs2, &scores, "s1");

        assert_eq!(before, after);
    }

    #[test]
    fn recomputing_is_idempotent() {
        let cats = vec![cat("hw", 30.0), cat("test", 70.0)];
        let asgs = vec![asg("a1", "hw", 20.0), asg("a2", "test", 50.0)];
        let mut scores = ScoreTable::new();
        score(&mut scores, "a1", "s1", 13.0);
        score(&mut scores, "a2", "s1", 41.5);
        let first = final_percentage(&cats, &asgs, &scores, "s1");
        let second = final_percentage(&cats, &asgs, &scores, "s1");
        assert_eq!(first, second);
    }

    #[test]
    fn category_sums_points_not_percent_averages() {
        // 9/10 and 40/100 in one category is 49/110, not (90% + 40%) / 2.
        let cats = vec![cat("hw", 100.0)];
        let asgs = vec![asg("a1", "hw", 10.0), asg("a2", "hw", 100.0)];
        let mut scores = ScoreTable::new();
        score(&mut scores, "a1", "s1", 9.0);
        score(&mut scores, "a2", "s1", 40.0);
        let got = final_percentage(&cats, &asgs, &scores, "s1").expect("graded");
        assert!((got - 100.0 * 49.0 / 110.0).abs() < 1e-9);
    }

    #[test]
    fn graded_zero_counts_unlike_ungraded() {
        let cats = vec![cat("test", 100.0)];
        let asgs = vec![asg("a1", "test", 50.0), asg("a2", "test", 50.0)];
        let mut scores = ScoreTable::new();
        score(&mut scores, "a1", "s1", 50.0);
        score(&mut scores, "a2", "s1", 0.0);
        let got = final_percentage(&cats, &asgs, &scores, "s1").expect("graded");
        assert!((got - 50.0).abs() < 1e-9);
    }

    #[test]
    fn uncategorized_and_zero_out_of_assignments_are_excluded() {
        let cats = vec![cat("test", 100.0)];
        let mut orphan = asg("a2", "test", 50.0);
        orphan.category_id = None;
        let asgs = vec![asg("a1", "test", 100.0), orphan, asg("a3", "test", 0.0)];
        let mut scores = ScoreTable::new();
        score(&mut scores, "a1", "s1", 75.0);
        score(&mut scores, "a2", "s1", 50.0);
        score(&mut scores, "a3", "s1", 10.0);
        let got = final_percentage(&cats, &asgs, &scores, "s1").expect("graded");
        assert!((got - 75.0).abs() < 1e-9);
    }

    #[test]
    fn breakdown_reports_none_for_untouched_categories() {
        let cats = vec![cat("hw", 20.0), cat("test", 80.0)];
        let asgs = vec![asg("a1", "hw", 10.0), asg("a2", "test", 100.0)];
        let mut scores = ScoreTable::new();
        score(&mut scores, "a2", "s1", 91.0);
        let rows = category_breakdown(&cats, &asgs, &scores, "s1");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].percent, None);
        assert_eq!(rows[0].graded_count, 0);
        assert_eq!(rows[1].percent, Some(91.0));
        assert_eq!(rows[1].graded_count, 1);
    }

    #[test]
    fn assignment_average_ignores_ungraded_cells() {
        let avg = assignment_average(vec![Some(8.0), None, Some(0.0), Some(10.0)], 10.0);
        assert_eq!(avg.graded_count, 3);
        assert_eq!(avg.ungraded_count, 1);
        assert!((avg.avg_raw - 6.0).abs() < 1e-9);
        assert!((avg.avg_percent - 60.0).abs() < 1e-9);
    }

    #[test]
    fn parse_score_entry_coerces_form_input() {
        use serde_json::json;
        assert_eq!(parse_score_entry(None).unwrap(), None);
        assert_eq!(parse_score_entry(Some(&json!(null))).unwrap(), None);
        assert_eq!(parse_score_entry(Some(&json!(""))).unwrap(), None);
        assert_eq!(parse_score_entry(Some(&json!("  "))).unwrap(), None);
        assert_eq!(parse_score_entry(Some(&json!("abc"))).unwrap(), None);
        assert_eq!(parse_score_entry(Some(&json!("7.5"))).unwrap(), Some(7.5));
        assert_eq!(parse_score_entry(Some(&json!(" 12 "))).unwrap(), Some(12.0));
        assert_eq!(parse_score_entry(Some(&json!(0))).unwrap(), Some(0.0));
        assert!(parse_score_entry(Some(&json!(-1.0))).is_err());
        assert!(parse_score_entry(Some(&json!([1, 2]))).is_err());
    }

    #[test]
    fn round_to_tenth_matches_report_cards() {
        assert_eq!(round_to_tenth(0.0), 0.0);
        assert_eq!(round_to_tenth(3.54), 3.5);
        assert_eq!(round_to_tenth(3.55), 3.6);
        assert_eq!(round_to_tenth(87.6818), 87.7);
    }
}

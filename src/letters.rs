use chrono::NaiveDate;

/// Everything the discharge letter pulls from the workspace, resolved by the
/// handler before rendering so the template stays pure.
#[derive(Debug, Clone)]
pub struct LetterInput {
    pub school_name: String,
    pub first_name: String,
    pub last_name: String,
    pub student_no: Option<String>,
    pub admitted_on: Option<String>,
    pub discharged_on: Option<String>,
    pub class_lines: Vec<ClassLine>,
    pub ktea_administered_on: Option<String>,
    pub ktea_lines: Vec<CompositeLine>,
}

#[derive(Debug, Clone)]
pub struct ClassLine {
    pub class_name: String,
    pub final_percent: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct CompositeLine {
    pub composite: String,
    pub mean_standard: f64,
}

fn long_date(iso: &str) -> String {
    match NaiveDate::parse_from_str(iso, "%Y-%m-%d") {
        Ok(d) => d.format("%B %d, %Y").to_string(),
        Err(_) => iso.to_string(),
    }
}

/// Renders the discharge-summary letter body. Deterministic for a given
/// input and date; the caller persists and/or writes the result.
pub fn render_discharge_letter(input: &LetterInput, today: NaiveDate) -> String {
    let full_name = format!("{} {}", input.first_name, input.last_name);
    let mut out = String::new();

    out.push_str(&input.school_name);
    out.push_str("\n\n");
    out.push_str(&today.format("%B %d, %Y").to_string());
    out.push_str("\n\n");
    out.push_str(&format!("RE: Discharge Summary for {}\n\n", full_name));
    out.push_str("To Whom It May Concern:\n\n");

    let ident = match &input.student_no {
        Some(no) => format!("{} (student no. {})", full_name, no),
        None => full_name.clone(),
    };
    match (&input.admitted_on, &input.discharged_on) {
        (Some(a), Some(d)) => out.push_str(&format!(
            "{} was enrolled at {} from {} until discharge on {}.\n\n",
            ident,
            input.school_name,
            long_date(a),
            long_date(d)
        )),
        (None, Some(d)) => out.push_str(&format!(
            "{} was enrolled at {} until discharge on {}.\n\n",
            ident,
            input.school_name,
            long_date(d)
        )),
        _ => out.push_str(&format!(
            "{} is currently enrolled at {}.\n\n",
            ident, input.school_name
        )),
    }

    if input.class_lines.is_empty() {
        out.push_str("No course enrollments were on file at the time of discharge.\n");
    } else {
        out.push_str("Academic standing at discharge:\n");
        for line in &input.class_lines {
            match line.final_percent {
                Some(p) => out.push_str(&format!("  - {}: {:.1}%\n", line.class_name, p)),
                None => out.push_str(&format!("  - {}: no graded work\n", line.class_name)),
            }
        }
    }
    out.push('\n');

    match &input.ktea_administered_on {
        Some(date) if !input.ktea_lines.is_empty() => {
            out.push_str(&format!(
                "Most recent educational testing (KTEA, administered {}):\n",
                long_date(date)
            ));
            for line in &input.ktea_lines {
                out.push_str(&format!(
                    "  - {}: mean standard score {:.1}\n",
                    line.composite, line.mean_standard
                ));
            }
        }
        _ => {
            out.push_str("No standardized assessment results are on file.\n");
        }
    }
    out.push('\n');

    out.push_str(
        "Please contact the registrar's office with any questions regarding this summary.\n\n",
    );
    out.push_str("Sincerely,\n\nRegistrar\n");
    out.push_str(&input.school_name);
    out.push('\n');

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_input() -> LetterInput {
        LetterInput {
            school_name: "Hillside Academy".to_string(),
            first_name: "Dana".to_string(),
            last_name: "Rivera".to_string(),
            student_no: Some("1042".to_string()),
            admitted_on: Some("2024-09-03".to_string()),
            discharged_on: Some("2026-06-12".to_string()),
            class_lines: vec![
                ClassLine {
                    class_name: "English 10".to_string(),
                    final_percent: Some(87.5),
                },
                ClassLine {
                    class_name: "Algebra II".to_string(),
                    final_percent: None,
                },
            ],
            ktea_administered_on: Some("2026-05-20".to_string()),
            ktea_lines: vec![CompositeLine {
                composite: "Reading".to_string(),
                mean_standard: 86.0,
            }],
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 6, 15).expect("date")
    }

    #[test]
    fn letter_includes_enrollment_span_and_grades() {
        let body = render_discharge_letter(&base_input(), today());
        assert!(body.contains("RE: Discharge Summary for Dana Rivera"));
        assert!(body.contains("Dana Rivera (student no. 1042)"));
        assert!(body.contains("from September 03, 2024 until discharge on June 12, 2026"));
        assert!(body.contains("  - English 10: 87.5%"));
        assert!(body.contains("  - Algebra II: no graded work"));
        assert!(body.contains("KTEA, administered May 20, 2026"));
        assert!(body.contains("  - Reading: mean standard score 86.0"));
    }

    #[test]
    fn letter_without_testing_says_so() {
        let mut input = base_input();
        input.ktea_administered_on = None;
        input.ktea_lines.clear();
        let body = render_discharge_letter(&input, today());
        assert!(body.contains("No standardized assessment results are on file."));
    }

    #[test]
    fn letter_is_deterministic() {
        let a = render_discharge_letter(&base_input(), today());
        let b = render_discharge_letter(&base_input(), today());
        assert_eq!(a, b);
    }
}

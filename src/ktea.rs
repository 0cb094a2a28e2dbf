use serde::Serialize;

use crate::calc::round_to_tenth;

/// KTEA brief-form subtest catalog. Composite membership and ordering are
/// fixed; data entry references subtests by code.
#[derive(Debug, Clone, Copy)]
pub struct SubtestDef {
    pub code: &'static str,
    pub label: &'static str,
    pub composite: &'static str,
}

pub const SUBTESTS: &[SubtestDef] = &[
    SubtestDef {
        code: "LWR",
        label: "Letter & Word Recognition",
        composite: "Reading",
    },
    SubtestDef {
        code: "RC",
        label: "Reading Comprehension",
        composite: "Reading",
    },
    SubtestDef {
        code: "MCA",
        label: "Math Concepts & Applications",
        composite: "Math",
    },
    SubtestDef {
        code: "MC",
        label: "Math Computation",
        composite: "Math",
    },
    SubtestDef {
        code: "WE",
        label: "Written Expression",
        composite: "Written Language",
    },
    SubtestDef {
        code: "SP",
        label: "Spelling",
        composite: "Written Language",
    },
    SubtestDef {
        code: "LC",
        label: "Listening Comprehension",
        composite: "Oral Language",
    },
    SubtestDef {
        code: "OE",
        label: "Oral Expression",
        composite: "Oral Language",
    },
];

pub const COMPOSITES: &[&str] = &["Reading", "Math", "Written Language", "Oral Language"];

pub fn subtest(code: &str) -> Option<&'static SubtestDef> {
    SUBTESTS
        .iter()
        .find(|s| s.code.eq_ignore_ascii_case(code.trim()))
}

/// One recorded administration with its subtest score rows, as loaded from
/// storage. `administered_on` is an ISO date string; rows may cover any
/// subset of the catalog.
#[derive(Debug, Clone)]
pub struct Administration {
    pub id: String,
    pub administered_on: String,
    pub form: Option<String>,
    pub examiner: Option<String>,
    pub scores: Vec<SubtestScore>,
}

#[derive(Debug, Clone)]
pub struct SubtestScore {
    pub code: String,
    pub raw_score: Option<f64>,
    pub standard_score: Option<f64>,
    pub grade_equivalent: Option<String>,
    pub percentile: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdministrationSummary {
    pub administration_id: String,
    pub administered_on: String,
    pub form: Option<String>,
    pub examiner: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtestEntry {
    pub administration_id: String,
    pub administered_on: String,
    pub raw_score: Option<f64>,
    pub standard_score: Option<f64>,
    pub grade_equivalent: Option<String>,
    pub percentile: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtestReport {
    pub code: String,
    pub label: String,
    pub entries: Vec<SubtestEntry>,
    /// Latest minus first standard score, present only when both ends exist
    /// across at least two administrations.
    pub standard_change: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeReport {
    pub composite: String,
    pub subtests: Vec<SubtestReport>,
    /// Mean standard score over the most recent administration's subtests in
    /// this composite.
    pub latest_mean_standard: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KteaReport {
    pub administrations: Vec<AdministrationSummary>,
    pub composites: Vec<CompositeReport>,
}

/// The KTEA reporter model: administrations in date order, subtest rows
/// grouped under composite units in catalog order. Administrations must be
/// passed sorted ascending by `administered_on`; storage guarantees that.
pub fn build_report(admins: &[Administration]) -> KteaReport {
    let administrations = admins
        .iter()
        .map(|a| AdministrationSummary {
            administration_id: a.id.clone(),
            administered_on: a.administered_on.clone(),
            form: a.form.clone(),
            examiner: a.examiner.clone(),
        })
        .collect();

    let latest_id = admins.last().map(|a| a.id.as_str());

    let mut composites = Vec::with_capacity(COMPOSITES.len());
    for &composite in COMPOSITES {
        let mut subtests = Vec::new();
        let mut latest_sum = 0.0_f64;
        let mut latest_n = 0_usize;

        for def in SUBTESTS.iter().filter(|d| d.composite == composite) {
            let mut entries = Vec::new();
            for a in admins {
                let Some(row) = a
                    .scores
                    .iter()
                    .find(|s| s.code.eq_ignore_ascii_case(def.code))
                else {
                    continue;
                };
                if Some(a.id.as_str()) == latest_id {
                    if let Some(std) = row.standard_score {
                        latest_sum += std;
                        latest_n += 1;
                    }
                }
                entries.push(SubtestEntry {
                    administration_id: a.id.clone(),
                    administered_on: a.administered_on.clone(),
                    raw_score: row.raw_score,
                    standard_score: row.standard_score,
                    grade_equivalent: row.grade_equivalent.clone(),
                    percentile: row.percentile,
                });
            }

            let standard_change = if entries.len() >= 2 {
                match (
                    entries.first().and_then(|e| e.standard_score),
                    entries.last().and_then(|e| e.standard_score),
                ) {
                    (Some(first), Some(last)) => Some(last - first),
                    _ => None,
                }
            } else {
                None
            };

            subtests.push(SubtestReport {
                code: def.code.to_string(),
                label: def.label.to_string(),
                entries,
                standard_change,
            });
        }

        let latest_mean_standard = if latest_n > 0 {
            Some(round_to_tenth(latest_sum / latest_n as f64))
        } else {
            None
        };

        composites.push(CompositeReport {
            composite: composite.to_string(),
            subtests,
            latest_mean_standard,
        });
    }

    KteaReport {
        administrations,
        composites,
    }
}

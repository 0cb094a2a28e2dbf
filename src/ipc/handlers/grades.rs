use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::path::PathBuf;

use crate::calc;
use crate::export;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_str};
use crate::ipc::types::{AppState, Request};

struct HandlerErr {
    code: &'static str,
    message: String,
}

impl HandlerErr {
    fn db(e: rusqlite::Error) -> Self {
        Self {
            code: "db_query_failed",
            message: e.to_string(),
        }
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, None)
    }
}

struct RosterRow {
    student_id: String,
    display_name: String,
    sort_order: i64,
    active: bool,
}

struct AssignmentRow {
    def: calc::AssignmentDef,
    idx: i64,
    date: Option<String>,
}

struct ClassData {
    class_id: String,
    name: String,
    subject: Option<String>,
    instructor: Option<String>,
    students: Vec<RosterRow>,
    categories: Vec<calc::CategoryDef>,
    assignments: Vec<AssignmentRow>,
    scores: calc::ScoreTable,
}

fn load_class_data(conn: &Connection, class_id: &str) -> Result<ClassData, HandlerErr> {
    let header: Option<(String, Option<String>, Option<String>)> = conn
        .query_row(
            "SELECT name, subject, instructor FROM classes WHERE id = ?",
            [class_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    let Some((name, subject, instructor)) = header else {
        return Err(HandlerErr {
            code: "not_found",
            message: "class not found".to_string(),
        });
    };

    let mut students_stmt = conn
        .prepare(
            "SELECT s.id, s.last_name, s.first_name, s.active, e.sort_order
             FROM enrollments e
             JOIN students s ON s.id = e.student_id
             WHERE e.class_id = ?
             ORDER BY e.sort_order",
        )
        .map_err(HandlerErr::db)?;
    let students: Vec<RosterRow> = students_stmt
        .query_map([class_id], |r| {
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            Ok(RosterRow {
                student_id: r.get(0)?,
                display_name: format!("{}, {}", last, first),
                active: r.get::<_, i64>(3)? != 0,
                sort_order: r.get(4)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let mut categories_stmt = conn
        .prepare(
            "SELECT id, name, COALESCE(weight, 0), sort_order
             FROM categories WHERE class_id = ? ORDER BY sort_order",
        )
        .map_err(HandlerErr::db)?;
    let categories: Vec<calc::CategoryDef> = categories_stmt
        .query_map([class_id], |r| {
            Ok(calc::CategoryDef {
                id: r.get(0)?,
                name: r.get(1)?,
                weight: r.get(2)?,
                sort_order: r.get(3)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let mut assignments_stmt = conn
        .prepare(
            "SELECT id, category_id, title, COALESCE(out_of, 0), idx, date
             FROM assignments WHERE class_id = ? ORDER BY idx",
        )
        .map_err(HandlerErr::db)?;
    let assignments: Vec<AssignmentRow> = assignments_stmt
        .query_map([class_id], |r| {
            Ok(AssignmentRow {
                def: calc::AssignmentDef {
                    id: r.get(0)?,
                    category_id: r.get(1)?,
                    title: r.get(2)?,
                    out_of: r.get(3)?,
                },
                idx: r.get(4)?,
                date: r.get(5)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    // NULL points rows exist when a cell was graded and later cleared; they
    // are "not graded" and never enter the table.
    let mut scores_stmt = conn
        .prepare(
            "SELECT sc.assignment_id, sc.student_id, sc.points
             FROM scores sc
             JOIN assignments a ON a.id = sc.assignment_id
             WHERE a.class_id = ? AND sc.points IS NOT NULL",
        )
        .map_err(HandlerErr::db)?;
    let mut scores = calc::ScoreTable::new();
    let rows = scores_stmt
        .query_map([class_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, f64>(2)?,
            ))
        })
        .map_err(HandlerErr::db)?;
    for row in rows {
        let (assignment_id, student_id, points) = row.map_err(HandlerErr::db)?;
        scores.insert((assignment_id, student_id), points);
    }

    Ok(ClassData {
        class_id: class_id.to_string(),
        name,
        subject,
        instructor,
        students,
        categories,
        assignments,
        scores,
    })
}

fn class_summary_json(data: &ClassData) -> serde_json::Value {
    let assignment_defs: Vec<calc::AssignmentDef> =
        data.assignments.iter().map(|a| a.def.clone()).collect();

    let per_assignment: Vec<serde_json::Value> = data
        .assignments
        .iter()
        .map(|a| {
            let cells = data.students.iter().filter(|s| s.active).map(|s| {
                data.scores
                    .get(&(a.def.id.clone(), s.student_id.clone()))
                    .copied()
            });
            let stats = calc::assignment_average(cells, a.def.out_of);
            json!({
                "assignmentId": a.def.id,
                "idx": a.idx,
                "title": a.def.title,
                "date": a.date,
                "categoryId": a.def.category_id,
                "outOf": a.def.out_of,
                "avgRaw": calc::round_to_tenth(stats.avg_raw),
                "avgPercent": calc::round_to_tenth(stats.avg_percent),
                "gradedCount": stats.graded_count,
                "ungradedCount": stats.ungraded_count,
            })
        })
        .collect();

    let mut per_student: Vec<serde_json::Value> = Vec::with_capacity(data.students.len());
    let mut category_totals: Vec<(f64, usize)> = vec![(0.0, 0); data.categories.len()];
    for s in &data.students {
        let final_percent = calc::final_percentage(
            &data.categories,
            &assignment_defs,
            &data.scores,
            &s.student_id,
        )
        .map(calc::round_to_tenth);

        if s.active {
            let breakdown = calc::category_breakdown(
                &data.categories,
                &assignment_defs,
                &data.scores,
                &s.student_id,
            );
            for (i, row) in breakdown.iter().enumerate() {
                if let Some(p) = row.percent {
                    category_totals[i].0 += p;
                    category_totals[i].1 += 1;
                }
            }
        }

        per_student.push(json!({
            "studentId": s.student_id,
            "displayName": s.display_name,
            "sortOrder": s.sort_order,
            "active": s.active,
            "finalPercent": final_percent,
        }));
    }

    let per_category: Vec<serde_json::Value> = data
        .categories
        .iter()
        .zip(category_totals.iter())
        .map(|(c, &(sum, count))| {
            let class_avg = if count > 0 {
                Some(calc::round_to_tenth(sum / count as f64))
            } else {
                None
            };
            json!({
                "categoryId": c.id,
                "name": c.name,
                "weight": c.weight,
                "classAvg": class_avg,
                "studentCount": count,
            })
        })
        .collect();

    json!({
        "class": {
            "classId": data.class_id,
            "name": data.name,
            "subject": data.subject,
            "instructor": data.instructor,
        },
        "categories": data.categories.iter().map(|c| json!({
            "categoryId": c.id,
            "name": c.name,
            "weight": c.weight,
            "sortOrder": c.sort_order,
        })).collect::<Vec<_>>(),
        "assignments": per_assignment,
        "perCategory": per_category,
        "perStudent": per_student,
    })
}

fn handle_grades_class_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match load_class_data(conn, &class_id) {
        Ok(data) => ok(&req.id, class_summary_json(&data)),
        Err(e) => e.response(&req.id),
    }
}

fn handle_grades_student_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let student: Option<(String, String, Option<String>)> = match conn
        .query_row(
            "SELECT last_name, first_name, discharged_on FROM students WHERE id = ?",
            [&student_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((last, first, discharged_on)) = student else {
        return err(&req.id, "not_found", "student not found", None);
    };

    let mut class_stmt = match conn.prepare(
        "SELECT c.id, c.name
         FROM enrollments e
         JOIN classes c ON c.id = e.class_id
         WHERE e.student_id = ?
         ORDER BY c.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let class_ids: Vec<(String, String)> = match class_stmt
        .query_map([&student_id], |r| Ok((r.get(0)?, r.get(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut classes = Vec::with_capacity(class_ids.len());
    for (class_id, class_name) in class_ids {
        let data = match load_class_data(conn, &class_id) {
            Ok(d) => d,
            Err(e) => return e.response(&req.id),
        };
        let assignment_defs: Vec<calc::AssignmentDef> =
            data.assignments.iter().map(|a| a.def.clone()).collect();
        let final_percent =
            calc::final_percentage(&data.categories, &assignment_defs, &data.scores, &student_id)
                .map(calc::round_to_tenth);
        let breakdown = calc::category_breakdown(
            &data.categories,
            &assignment_defs,
            &data.scores,
            &student_id,
        );
        classes.push(json!({
            "classId": class_id,
            "name": class_name,
            "finalPercent": final_percent,
            "categories": breakdown,
        }));
    }

    ok(
        &req.id,
        json!({
            "student": {
                "studentId": student_id,
                "displayName": format!("{}, {}", last, first),
                "dischargedOn": discharged_on,
            },
            "classes": classes,
        }),
    )
}

fn handle_export_grades_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let out_path = match required_str(req, "outPath") {
        Ok(v) => PathBuf::from(v),
        Err(resp) => return resp,
    };

    let data = match load_class_data(conn, &class_id) {
        Ok(d) => d,
        Err(e) => return e.response(&req.id),
    };
    let assignment_defs: Vec<calc::AssignmentDef> =
        data.assignments.iter().map(|a| a.def.clone()).collect();

    let category_names: Vec<String> = data.categories.iter().map(|c| c.name.clone()).collect();
    let rows: Vec<export::GradeCsvRow> = data
        .students
        .iter()
        .map(|s| {
            let breakdown = calc::category_breakdown(
                &data.categories,
                &assignment_defs,
                &data.scores,
                &s.student_id,
            );
            export::GradeCsvRow {
                display_name: s.display_name.clone(),
                category_percents: breakdown.iter().map(|b| b.percent).collect(),
                final_percent: calc::final_percentage(
                    &data.categories,
                    &assignment_defs,
                    &data.scores,
                    &s.student_id,
                ),
            }
        })
        .collect();

    match export::write_grades_csv(&out_path, &category_names, &rows) {
        Ok(n) => ok(
            &req.id,
            json!({
                "ok": true,
                "path": out_path.to_string_lossy(),
                "rows": n
            }),
        ),
        Err(e) => err(&req.id, "io_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.classSummary" => Some(handle_grades_class_summary(state, req)),
        "grades.studentSummary" => Some(handle_grades_student_summary(state, req)),
        "reports.exportGradesCsv" => Some(handle_export_grades_csv(state, req)),
        _ => None,
    }
}

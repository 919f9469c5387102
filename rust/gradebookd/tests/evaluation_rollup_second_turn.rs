mod test_support;

use serde_json::json;
use std::io::BufReader;
use std::process::{ChildStdin, ChildStdout};
use test_support::{
    create_student, error_code, request_err, request_ok, spawn_sidecar, str_field, temp_dir,
};

struct Fixture {
    subject_id: String,
    competency_a: String,
    activities: [String; 4],
    ana: String,
    bruno: String,
    carla: String,
}

fn create(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    method: &str,
    params: serde_json::Value,
    id_key: &str,
) -> String {
    let res = request_ok(stdin, reader, method, method, params);
    str_field(&res, id_key)
}

// Theory (60%): Accuracy -> { Exams: a1/100, a2/50 ; Quizzes: a3/20 }
// Practice (40%): Lab work -> { Reports: a4/100 }
fn build(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> Fixture {
    let semester_id = create(stdin, reader, "semesters.create", json!({ "name": "2026-1" }), "semesterId");
    let subject_id = create(
        stdin,
        reader,
        "subjects.create",
        json!({ "semesterId": semester_id, "name": "Physics" }),
        "subjectId",
    );
    let competency_a = create(
        stdin,
        reader,
        "competencies.create",
        json!({ "subjectId": subject_id, "name": "Theory", "percentage": 60 }),
        "competencyId",
    );
    let competency_b = create(
        stdin,
        reader,
        "competencies.create",
        json!({ "subjectId": subject_id, "name": "Practice", "percentage": 40 }),
        "competencyId",
    );
    let cr1 = create(
        stdin,
        reader,
        "criteria.create",
        json!({ "competencyId": competency_a, "name": "Accuracy" }),
        "criterionId",
    );
    let cr2 = create(
        stdin,
        reader,
        "criteria.create",
        json!({ "competencyId": competency_b, "name": "Lab work" }),
        "criterionId",
    );
    let e1 = create(stdin, reader, "evidences.create", json!({ "criterionId": cr1, "name": "Exams" }), "evidenceId");
    let e2 = create(stdin, reader, "evidences.create", json!({ "criterionId": cr1, "name": "Quizzes" }), "evidenceId");
    let e3 = create(stdin, reader, "evidences.create", json!({ "criterionId": cr2, "name": "Reports" }), "evidenceId");
    let a1 = create(stdin, reader, "activities.create", json!({ "evidenceId": e1, "title": "Midterm" }), "activityId");
    let a2 = create(
        stdin,
        reader,
        "activities.create",
        json!({ "evidenceId": e1, "title": "Final exam", "outOf": 50 }),
        "activityId",
    );
    let a3 = create(
        stdin,
        reader,
        "activities.create",
        json!({ "evidenceId": e2, "title": "Quiz 1", "outOf": 20 }),
        "activityId",
    );
    let a4 = create(stdin, reader, "activities.create", json!({ "evidenceId": e3, "title": "Report 1" }), "activityId");

    let ana = create_student(stdin, reader, "Alvarez", "Ana");
    let bruno = create_student(stdin, reader, "Bravo", "Bruno");
    let carla = create_student(stdin, reader, "Castro", "Carla");
    let _ = request_ok(
        stdin,
        reader,
        "enroll",
        "subjects.enroll",
        json!({ "subjectId": subject_id, "studentIds": [ana, bruno, carla] }),
    );

    Fixture {
        subject_id,
        competency_a,
        activities: [a1, a2, a3, a4],
        ana,
        bruno,
        carla,
    }
}

fn record(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    f: &Fixture,
    student: &str,
    values: [f64; 4],
) {
    for (activity, value) in f.activities.iter().zip(values) {
        let _ = request_ok(
            stdin,
            reader,
            "score",
            "scores.bulkSet",
            json!({ "activityId": activity, "edits": [{ "studentId": student, "value": value }] }),
        );
    }
}

fn student_row<'a>(summary: &'a serde_json::Value, student_id: &str) -> &'a serde_json::Value {
    summary["perStudent"]
        .as_array()
        .expect("perStudent")
        .iter()
        .find(|s| s["studentId"] == json!(student_id))
        .expect("student row")
}

#[test]
fn grades_roll_up_and_second_turn_lifts_retake_students() {
    let workspace = temp_dir("gradebook-evaluation");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let f = build(&mut stdin, &mut reader);

    // Ana: Exams (90 + 80) / 2 = 85, Quizzes 80 -> Theory 82.5; Practice 70.
    // 82.5 * 0.6 + 70 * 0.4 = 77.5 -> 78.
    record(&mut stdin, &mut reader, &f, &f.ana, [90.0, 40.0, 16.0, 70.0]);
    // Bruno: Theory 42.5, Practice 40 -> 25.5 + 16 = 41.5 -> 42 (retake band).
    record(&mut stdin, &mut reader, &f, &f.bruno, [50.0, 20.0, 8.0, 40.0]);

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "evaluation.subjectSummary",
        json!({ "subjectId": f.subject_id }),
    );
    assert_eq!(summary["percentageTotal"], json!(100.0));
    let ana = student_row(&summary, &f.ana);
    assert_eq!(ana["competencies"][0]["average"], json!(82.5));
    assert_eq!(ana["competencies"][0]["criteria"][0]["evidences"][0]["average"], json!(85.0));
    assert_eq!(ana["competencies"][0]["contribution"], json!(49.5));
    assert_eq!(ana["competencies"][1]["average"], json!(70.0));
    assert_eq!(ana["finalGrade"], json!(78.0));
    assert_eq!(ana["status"], json!("approved"));
    let bruno = student_row(&summary, &f.bruno);
    assert_eq!(bruno["partialFinal"], json!(42.0));
    assert_eq!(bruno["status"], json!("retake"));
    let carla = student_row(&summary, &f.carla);
    assert!(carla["finalGrade"].is_null());
    assert_eq!(carla["status"], json!("no_data"));

    assert_eq!(summary["totals"]["approved"], json!(1));
    assert_eq!(summary["totals"]["retake"], json!(1));
    assert_eq!(summary["totals"]["noData"], json!(1));
    assert_eq!(summary["totals"]["classAverage"], json!(60.0));
    let theory = &summary["perCompetency"][0];
    assert_eq!(theory["competencyId"], json!(f.competency_a));
    assert_eq!(theory["classAverage"], json!(62.5));
    let midterm = &summary["perActivity"][0];
    assert_eq!(midterm["avgPercent"], json!(70.0));
    assert_eq!(midterm["scoredCount"], json!(2));
    assert_eq!(midterm["noMarkCount"], json!(1));

    // Second turn is refused outside the retake band.
    let approved = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "evaluation.setSecondTurn",
        json!({ "subjectId": f.subject_id, "studentId": f.ana, "score": 10 }),
    );
    assert_eq!(error_code(&approved), "not_in_retake_band");
    let no_data = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "evaluation.setSecondTurn",
        json!({ "subjectId": f.subject_id, "studentId": f.carla, "score": 10 }),
    );
    assert_eq!(error_code(&no_data), "not_in_retake_band");
    let too_high = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "evaluation.setSecondTurn",
        json!({ "subjectId": f.subject_id, "studentId": f.bruno, "score": 101 }),
    );
    assert_eq!(error_code(&too_high), "bad_params");

    let lifted = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "evaluation.setSecondTurn",
        json!({ "subjectId": f.subject_id, "studentId": f.bruno, "score": 10 }),
    );
    assert_eq!(lifted["outcome"]["finalGrade"], json!(52.0));
    assert_eq!(lifted["outcome"]["status"], json!("approved"));
    assert_eq!(lifted["outcome"]["secondTurnApplied"], json!(true));

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "evaluation.studentSummary",
        json!({ "subjectId": f.subject_id, "studentId": f.bruno }),
    );
    assert_eq!(student["inRetakeBand"], json!(true));
    assert_eq!(student["student"]["partialFinal"], json!(42.0));
    assert_eq!(student["student"]["secondTurn"], json!(10.0));
    assert_eq!(student["student"]["finalGrade"], json!(52.0));

    // Snapshots: 3 evidences + 2 criteria + 2 competencies + 1 final per student.
    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "evaluation.savePartialAverages",
        json!({ "subjectId": f.subject_id }),
    );
    assert_eq!(saved["saved"], json!(24));
    let finals = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "evaluation.listPartialAverages",
        json!({ "subjectId": f.subject_id, "studentId": f.bruno, "level": "final" }),
    );
    let rows = finals["partialAverages"].as_array().expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["value"], json!(52.0));
    assert_eq!(rows[0]["entityId"], json!(f.subject_id));
    let resaved = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "evaluation.savePartialAverages",
        json!({ "subjectId": f.subject_id }),
    );
    assert_eq!(resaved["saved"], json!(24));
    let all = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "evaluation.listPartialAverages",
        json!({ "subjectId": f.subject_id }),
    );
    assert_eq!(all["partialAverages"].as_array().map(|r| r.len()), Some(24));

    let cleared = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "evaluation.clearSecondTurn",
        json!({ "subjectId": f.subject_id, "studentId": f.bruno }),
    );
    assert_eq!(cleared["removed"], json!(true));
    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "evaluation.subjectSummary",
        json!({ "subjectId": f.subject_id }),
    );
    assert_eq!(student_row(&summary, &f.bruno)["status"], json!("retake"));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn missing_score_policy_zero_counts_absent_marks() {
    let workspace = temp_dir("gradebook-evaluation-zero-policy");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let f = build(&mut stdin, &mut reader);
    record(&mut stdin, &mut reader, &f, &f.ana, [90.0, 40.0, 16.0, 70.0]);
    // Only the midterm for Bruno: excluded elsewhere by default.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "scores.set",
        json!({ "activityId": f.activities[0], "studentId": f.bruno, "value": 80 }),
    );

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "evaluation.subjectSummary",
        json!({ "subjectId": f.subject_id }),
    );
    // Theory 80 * 0.6 = 48; Practice has no value and contributes nothing.
    assert_eq!(student_row(&summary, &f.bruno)["partialFinal"], json!(48.0));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "setup.update",
        json!({ "section": "evaluation", "patch": { "missingScorePolicy": "zero" } }),
    );
    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "evaluation.subjectSummary",
        json!({ "subjectId": f.subject_id }),
    );
    // Exams (80 + 0) / 2 = 40, Quizzes 0 -> Theory 20 -> 12; Practice 0.
    let bruno = student_row(&summary, &f.bruno);
    assert_eq!(bruno["partialFinal"], json!(12.0));
    assert_eq!(bruno["counts"]["missing"], json!(3));
    assert_eq!(bruno["status"], json!("failed"));
    // Carla has no rows at all and now fails with zero.
    let carla = student_row(&summary, &f.carla);
    assert_eq!(carla["finalGrade"], json!(0.0));
    assert_eq!(carla["status"], json!("failed"));
    assert_eq!(student_row(&summary, &f.ana)["finalGrade"], json!(78.0));

    let _ = std::fs::remove_dir_all(workspace);
}

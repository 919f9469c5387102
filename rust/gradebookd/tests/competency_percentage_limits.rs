mod test_support;

use serde_json::json;
use test_support::{error_code, request_err, request_ok, spawn_sidecar, str_field, temp_dir};

#[test]
fn competency_percentages_cannot_exceed_100_on_create_or_update() {
    let workspace = temp_dir("gradebook-percentage-limits");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let sem = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "semesters.create",
        json!({ "name": "2026-1" }),
    );
    let sub = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "subjects.create",
        json!({ "semesterId": str_field(&sem, "semesterId"), "name": "Chemistry" }),
    );
    let subject_id = str_field(&sub, "subjectId");

    let a = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "competencies.create",
        json!({ "subjectId": subject_id, "name": "Theory", "percentage": 60 }),
    );
    assert_eq!(a["percentageTotal"], json!(60.0));
    let a_id = str_field(&a, "competencyId");

    let over = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "competencies.create",
        json!({ "subjectId": subject_id, "name": "Lab", "percentage": 45 }),
    );
    assert_eq!(error_code(&over), "percentage_exceeded");
    assert_eq!(over["details"]["currentTotal"], json!(60.0));
    assert_eq!(over["details"]["remaining"], json!(40.0));

    let b = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "competencies.create",
        json!({ "subjectId": subject_id, "name": "Lab", "percentage": 40 }),
    );
    let b_id = str_field(&b, "competencyId");

    let list = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "competencies.list",
        json!({ "subjectId": subject_id }),
    );
    assert_eq!(list["percentageTotal"], json!(100.0));
    assert_eq!(list["percentageRemaining"], json!(0.0));
    assert_eq!(list["competencies"].as_array().map(|c| c.len()), Some(2));

    // Updating one competency is checked against the others only.
    let grow = request_err(
        &mut stdin,
        &mut reader,
        "8",
        "competencies.update",
        json!({ "competencyId": b_id, "patch": { "percentage": 41 } }),
    );
    assert_eq!(error_code(&grow), "percentage_exceeded");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "competencies.update",
        json!({ "competencyId": a_id, "patch": { "percentage": 55, "name": "Theory & models" } }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "competencies.update",
        json!({ "competencyId": b_id, "patch": { "percentage": 45 } }),
    );

    for (i, pct) in [json!(0), json!(-5), json!(101), json!("ten")].iter().enumerate() {
        let e = request_err(
            &mut stdin,
            &mut reader,
            &format!("bad-{}", i),
            "competencies.create",
            json!({ "subjectId": subject_id, "name": "Extra", "percentage": pct }),
        );
        assert_eq!(error_code(&e), "bad_params", "percentage {}", pct);
    }

    let list = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "competencies.list",
        json!({ "subjectId": subject_id }),
    );
    assert_eq!(list["percentageTotal"], json!(100.0));
    assert_eq!(list["competencies"][0]["name"], json!("Theory & models"));
    assert_eq!(list["competencies"][0]["percentage"], json!(55.0));

    let _ = std::fs::remove_dir_all(workspace);
}

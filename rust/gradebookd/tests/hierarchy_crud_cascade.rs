mod test_support;

use serde_json::json;
use test_support::{
    create_student, error_code, request_err, request_ok, seed_subject, spawn_sidecar, str_field,
    temp_dir,
};

fn ids(rows: &serde_json::Value) -> Vec<String> {
    rows.as_array()
        .expect("array")
        .iter()
        .map(|r| str_field(r, "id"))
        .collect()
}

#[test]
fn crud_changes_are_reflected_in_list_calls() {
    let workspace = temp_dir("gradebook-crud-lists");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let older = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "semesters.create",
        json!({ "name": "2025-2", "startDate": "2025-08-01" }),
    );
    let newer = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "semesters.create",
        json!({ "name": "2026-1", "startDate": "2026-02-01", "endDate": "2026-06-30" }),
    );
    let older_id = str_field(&older, "semesterId");
    let newer_id = str_field(&newer, "semesterId");

    let list = request_ok(&mut stdin, &mut reader, "4", "semesters.list", json!({}));
    assert_eq!(ids(&list["semesters"]), vec![newer_id.clone(), older_id.clone()]);

    let bad_dates = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "semesters.update",
        json!({ "semesterId": newer_id, "patch": { "endDate": "2026-01-01" } }),
    );
    assert_eq!(error_code(&bad_dates), "bad_params");
    let bad_format = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "semesters.create",
        json!({ "name": "x", "startDate": "01/02/2026" }),
    );
    assert_eq!(error_code(&bad_format), "bad_params");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "semesters.update",
        json!({ "semesterId": older_id, "patch": { "name": "2025 second term" } }),
    );

    let sub = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "subjects.create",
        json!({ "semesterId": newer_id, "code": "PHY-1", "name": "Physics" }),
    );
    let subject_id = str_field(&sub, "subjectId");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "subjects.update",
        json!({ "subjectId": subject_id, "patch": { "name": "Physics I", "code": null } }),
    );
    let subjects = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "subjects.list",
        json!({ "semesterId": newer_id }),
    );
    let rows = subjects["subjects"].as_array().expect("subjects");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], json!("Physics I"));
    assert!(rows[0]["code"].is_null());
    let other = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "subjects.list",
        json!({ "semesterId": older_id }),
    );
    assert_eq!(other["subjects"], json!([]));

    // Moving a subject appends it to the target semester's order.
    let moved = request_ok(
        &mut stdin,
        &mut reader,
        "11a",
        "subjects.create",
        json!({ "semesterId": older_id, "name": "Biology" }),
    );
    let moved_id = str_field(&moved, "subjectId");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "11b",
        "subjects.update",
        json!({ "subjectId": moved_id, "patch": { "semesterId": newer_id } }),
    );
    let newer_subjects = request_ok(
        &mut stdin,
        &mut reader,
        "11c",
        "subjects.list",
        json!({ "semesterId": newer_id }),
    );
    assert_eq!(ids(&newer_subjects["subjects"]), vec![subject_id.clone(), moved_id.clone()]);
    assert_eq!(newer_subjects["subjects"][0]["sortOrder"], json!(0));
    assert_eq!(newer_subjects["subjects"][1]["sortOrder"], json!(1));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "11d",
        "subjects.delete",
        json!({ "subjectId": moved_id }),
    );

    let ana = create_student(&mut stdin, &mut reader, "Alvarez", "Ana");
    let bruno = create_student(&mut stdin, &mut reader, "Bravo", "Bruno");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "students.update",
        json!({ "studentId": bruno, "patch": { "active": false, "email": "bruno@example.edu" } }),
    );
    let active = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "students.list",
        json!({ "activeOnly": true }),
    );
    assert_eq!(ids(&active["students"]), vec![ana.clone()]);
    let all = request_ok(&mut stdin, &mut reader, "14", "students.list", json!({}));
    assert_eq!(all["students"].as_array().map(|a| a.len()), Some(2));
    assert_eq!(all["students"][1]["email"], json!("bruno@example.edu"));
    assert_eq!(all["students"][0]["displayName"], json!("Alvarez, Ana"));

    // Enrolment is idempotent.
    let first = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "subjects.enroll",
        json!({ "subjectId": subject_id, "studentIds": [ana, bruno] }),
    );
    assert_eq!(first["added"], json!(2));
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "subjects.enroll",
        json!({ "subjectId": subject_id, "studentIds": [ana] }),
    );
    assert_eq!(again["added"], json!(0));
    let roster = request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "subjects.students",
        json!({ "subjectId": subject_id }),
    );
    assert_eq!(ids(&roster["students"]), vec![ana.clone(), bruno.clone()]);

    let missing = request_err(
        &mut stdin,
        &mut reader,
        "18",
        "subjects.enroll",
        json!({ "subjectId": subject_id, "studentIds": ["no-such-student"] }),
    );
    assert_eq!(error_code(&missing), "not_found");

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn deletes_cascade_through_the_hierarchy() {
    let workspace = temp_dir("gradebook-crud-cascade");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let s = seed_subject(&mut stdin, &mut reader);
    let ana = create_student(&mut stdin, &mut reader, "Alvarez", "Ana");
    let bruno = create_student(&mut stdin, &mut reader, "Bravo", "Bruno");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "subjects.enroll",
        json!({ "subjectId": s.subject_id, "studentIds": [ana, bruno] }),
    );
    for (i, (student, value)) in [(&ana, 80), (&bruno, 45)].iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("score-{}", i),
            "scores.set",
            json!({ "activityId": s.activity_id, "studentId": student, "value": value }),
        );
    }

    // Unenrolling removes that student's scores for the subject.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "subjects.unenroll",
        json!({ "subjectId": s.subject_id, "studentIds": [bruno] }),
    );
    let scores = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "scores.list",
        json!({ "activityId": s.activity_id }),
    );
    let rows = scores["scores"].as_array().expect("scores");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["studentId"], json!(ana));
    assert_eq!(rows[0]["value"], json!(80.0));

    // Evidence delete removes its activities.
    let ev2 = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "evidences.create",
        json!({ "criterionId": s.criterion_id, "name": "Lab report" }),
    );
    let ev2_id = str_field(&ev2, "evidenceId");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "activities.create",
        json!({ "evidenceId": ev2_id, "title": "Lab 1", "outOf": 20 }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "evidences.delete",
        json!({ "evidenceId": ev2_id }),
    );
    let acts = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "activities.list",
        json!({ "subjectId": s.subject_id }),
    );
    assert_eq!(ids(&acts["activities"]), vec![s.activity_id.clone()]);

    // Competency delete takes criteria, evidences, activities and scores.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "competencies.delete",
        json!({ "competencyId": s.competency_id }),
    );
    let gone = request_err(
        &mut stdin,
        &mut reader,
        "10",
        "scores.list",
        json!({ "activityId": s.activity_id }),
    );
    assert_eq!(error_code(&gone), "not_found");
    let tree = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "structure.tree",
        json!({ "subjectId": s.subject_id }),
    );
    assert_eq!(tree["competencies"], json!([]));
    assert_eq!(tree["activityCount"], json!(0));

    // Student delete drops enrolments.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "students.delete",
        json!({ "studentId": ana }),
    );
    let roster = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "subjects.students",
        json!({ "subjectId": s.subject_id }),
    );
    assert_eq!(roster["students"], json!([]));

    // Semester delete cascades to its subjects.
    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "semesters.delete",
        json!({ "semesterId": s.semester_id }),
    );
    assert_eq!(deleted["deletedSubjects"], json!(1));
    let subjects = request_ok(&mut stdin, &mut reader, "15", "subjects.list", json!({}));
    assert_eq!(subjects["subjects"], json!([]));
    let missing = request_err(
        &mut stdin,
        &mut reader,
        "16",
        "subjects.delete",
        json!({ "subjectId": s.subject_id }),
    );
    assert_eq!(error_code(&missing), "not_found");

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn structure_tree_nests_levels_in_order() {
    let workspace = temp_dir("gradebook-structure-tree");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let s = seed_subject(&mut stdin, &mut reader);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "activities.create",
        json!({ "evidenceId": s.evidence_id, "title": "Test 2", "outOf": 40, "date": "2026-03-10" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "criteria.update",
        json!({ "criterionId": s.criterion_id, "patch": { "weight": 2.5 } }),
    );
    let bad_weight = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "criteria.update",
        json!({ "criterionId": s.criterion_id, "patch": { "weight": 0 } }),
    );
    assert_eq!(error_code(&bad_weight), "bad_params");

    let tree = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "structure.tree",
        json!({ "subjectId": s.subject_id }),
    );
    assert_eq!(tree["subject"]["name"], json!("Mathematics"));
    assert_eq!(tree["percentageTotal"], json!(100.0));
    assert_eq!(tree["activityCount"], json!(2));
    let criterion = &tree["competencies"][0]["criteria"][0];
    assert_eq!(criterion["weight"], json!(2.5));
    let evidence = &criterion["evidences"][0];
    assert_eq!(evidence["activityCount"], json!(2));
    assert_eq!(evidence["activities"][0]["title"], json!("Test 1"));
    assert_eq!(evidence["activities"][0]["outOf"], json!(100.0));
    assert_eq!(evidence["activities"][1]["outOf"], json!(40.0));

    let _ = std::fs::remove_dir_all(workspace);
}

mod test_support;

use serde_json::json;
use test_support::{error_code, request_err, request_ok, spawn_sidecar, temp_dir};

#[test]
fn setup_defaults_and_patch_validation() {
    let workspace = temp_dir("gradebook-setup");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let setup = request_ok(&mut stdin, &mut reader, "2", "setup.get", json!({}));
    assert_eq!(setup["grading"]["passMark"].as_f64(), Some(51.0));
    assert_eq!(setup["grading"]["retakeMin"].as_f64(), Some(40.0));
    assert_eq!(setup["grading"]["maxScore"].as_f64(), Some(100.0));
    assert_eq!(setup["evaluation"]["missingScorePolicy"], json!("exclude"));
    assert_eq!(setup["evaluation"]["roundingDecimals"], json!(0));

    let inverted = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "setup.update",
        json!({ "section": "grading", "patch": { "retakeMin": 60 } }),
    );
    assert_eq!(error_code(&inverted), "bad_params");
    let unknown_field = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "setup.update",
        json!({ "section": "grading", "patch": { "curve": 5 } }),
    );
    assert_eq!(error_code(&unknown_field), "bad_params");
    let unknown_section = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "setup.update",
        json!({ "section": "printing", "patch": {} }),
    );
    assert_eq!(error_code(&unknown_section), "bad_params");
    let bad_policy = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "setup.update",
        json!({ "section": "evaluation", "patch": { "missingScorePolicy": "average" } }),
    );
    assert_eq!(error_code(&bad_policy), "bad_params");

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "setup.update",
        json!({ "section": "grading", "patch": { "passMark": 60, "retakeMin": 45 } }),
    );
    assert_eq!(updated["values"]["passMark"].as_f64(), Some(60.0));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "setup.update",
        json!({ "section": "evaluation", "patch": { "missingScorePolicy": "Zero", "roundingDecimals": 1 } }),
    );

    let setup = request_ok(&mut stdin, &mut reader, "9", "setup.get", json!({}));
    assert_eq!(setup["grading"]["passMark"].as_f64(), Some(60.0));
    assert_eq!(setup["grading"]["retakeMin"].as_f64(), Some(45.0));
    assert_eq!(setup["grading"]["maxScore"].as_f64(), Some(100.0));
    assert_eq!(setup["evaluation"]["missingScorePolicy"], json!("zero"));
    assert_eq!(setup["evaluation"]["roundingDecimals"], json!(1));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn workspace_toml_seeds_setup_once() {
    let workspace = temp_dir("gradebook-setup-toml");
    std::fs::write(
        workspace.join("gradebook.toml"),
        "[grading]\npassMark = 61\nretakeMin = 50\n",
    )
    .expect("write gradebook.toml");

    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let setup = request_ok(&mut stdin, &mut reader, "2", "setup.get", json!({}));
    assert_eq!(setup["grading"]["passMark"].as_f64(), Some(61.0));
    assert_eq!(setup["grading"]["retakeMin"].as_f64(), Some(50.0));
    assert_eq!(setup["evaluation"]["missingScorePolicy"], json!("exclude"));

    // Stored values win over the file on later opens.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "setup.update",
        json!({ "section": "grading", "patch": { "passMark": 70 } }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let setup = request_ok(&mut stdin, &mut reader, "5", "setup.get", json!({}));
    assert_eq!(setup["grading"]["passMark"].as_f64(), Some(70.0));

    let _ = std::fs::remove_dir_all(workspace);
}

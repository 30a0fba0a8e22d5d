use chrono::{Duration, Utc};
use ratchet::core::citation::{self, CitationEvent};
use ratchet::core::config::RatchetConfig;
use ratchet::core::step::{Step, Tier};
use ratchet::core::validate::{ValidateOptions, Validator};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

fn write(path: &Path, content: &str) -> PathBuf {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
    path.to_path_buf()
}

fn validator(root: &Path) -> Validator {
    let config = RatchetConfig {
        town_dir: Some(root.join("town")),
        ..RatchetConfig::default()
    };
    Validator::from_config(root, &config).expect("validator")
}

fn long_research() -> String {
    let filler = "word ".repeat(120);
    format!(
        "---\nschema_version: 1\n---\n# Topic\n\n## Summary\n{}\n\n## Key Findings\n- one\n\n## Recommendations\n- two\n\nSource: https://example.com\n",
        filler
    )
}

#[test]
fn missing_artifact_is_failing_result() {
    let tmp = tempdir().expect("tempdir");
    let missing = tmp.path().join("nope.md");
    let result = validator(tmp.path()).validate(Step::Research, &missing);

    assert!(!result.valid);
    assert_eq!(
        result.issues,
        vec![format!("Artifact not found: {}", missing.display())]
    );
    assert_eq!(result.tier, None);
}

#[test]
fn complete_research_gets_pattern_tier() {
    let tmp = tempdir().expect("tempdir");
    let path = write(&tmp.path().join(".agents/research/topic.md"), &long_research());

    let result = validator(tmp.path()).validate(Step::Research, &path);
    assert!(result.valid, "issues: {:?}", result.issues);
    assert!(result.warnings.is_empty(), "warnings: {:?}", result.warnings);
    assert_eq!(result.tier, Some(Tier::Pattern));
}

#[test]
fn strict_mode_rejects_missing_schema_version() {
    let tmp = tempdir().expect("tempdir");
    let path = write(&tmp.path().join("r.md"), "## Summary\nshort\n");

    let result = validator(tmp.path()).validate(Step::Research, &path);
    assert!(!result.valid);
    assert_eq!(result.issues.len(), 1);
    assert!(result.issues[0].starts_with("Missing schema_version field"));
    assert_eq!(result.tier, None);
}

#[test]
fn lenient_mode_downgrades_schema_version_to_warning() {
    let tmp = tempdir().expect("tempdir");
    let path = write(&tmp.path().join("r.md"), "## Summary\nshort\n");

    let result =
        validator(tmp.path()).validate_with_options(Step::Research, &path, &ValidateOptions::lenient());
    assert!(result.valid);
    assert!(result.lenient);
    assert!(result.lenient_expiry_date.is_some());
    assert!(!result.lenient_expiring_soon);
    assert!(result
        .warnings
        .contains(&"Missing schema_version field - using lenient legacy bypass".to_string()));
    assert!(result
        .warnings
        .iter()
        .any(|w| w == "Research seems short (3 words), consider adding more detail"));
    assert_eq!(result.tier, Some(Tier::Observation));
}

#[test]
fn expired_lenient_window_forces_strict() {
    let tmp = tempdir().expect("tempdir");
    let path = write(&tmp.path().join("r.md"), &long_research());
    let yesterday = Utc::now() - Duration::days(1);

    let result = validator(tmp.path()).validate_with_options(
        Step::Research,
        &path,
        &ValidateOptions::lenient_until(yesterday),
    );
    assert!(!result.valid);
    assert!(!result.lenient);
    assert_eq!(result.issues.len(), 1);
    assert!(result.issues[0].contains("expired"));
}

#[test]
fn expiring_lenient_window_warns() {
    let tmp = tempdir().expect("tempdir");
    let path = write(&tmp.path().join("r.md"), &long_research());
    let soon = Utc::now() + Duration::days(10) + Duration::hours(1);

    let result = validator(tmp.path()).validate_with_options(
        Step::Research,
        &path,
        &ValidateOptions::lenient_until(soon),
    );
    assert!(result.valid);
    assert!(result.lenient_expiring_soon);
    assert!(result.warnings.iter().any(|w| w
        == "Lenient validation expires in 10 days - artifacts must be migrated before then"));
}

#[test]
fn pre_mortem_checks_table_mitigation_and_version() {
    let tmp = tempdir().expect("tempdir");
    let path = write(
        &tmp.path().join(".agents/specs/auth.md"),
        "---\nschema_version: 1\n---\n# Auth\n",
    );

    let result = validator(tmp.path()).validate(Step::PreMortem, &path);
    assert!(result.valid);
    assert_eq!(result.warnings.len(), 3);
    assert_eq!(result.tier, Some(Tier::Observation));

    let good = write(
        &tmp.path().join(".agents/specs/auth-v2.md"),
        "---\nschema_version: 1\n---\n| ID | Finding | Mitigation |\n",
    );
    let result = validator(tmp.path()).validate(Step::PreMortem, &good);
    assert!(result.warnings.is_empty(), "warnings: {:?}", result.warnings);
}

#[test]
fn plan_markdown_sections() {
    let tmp = tempdir().expect("tempdir");
    let path = write(
        &tmp.path().join("plan.md"),
        "---\nschema_version: 1\n---\n## Goal\n\n## Issues\n\n## Acceptance\n",
    );
    let result = validator(tmp.path()).validate(Step::Plan, &path);
    assert!(result.warnings.is_empty(), "warnings: {:?}", result.warnings);
    assert_eq!(result.tier, Some(Tier::Pattern));
}

#[test]
fn plan_formula_toml_only_sees_first_field() {
    let tmp = tempdir().expect("tempdir");
    let path = write(
        &tmp.path().join("plan.formula.toml"),
        "formula = \"auth\"\ndescription = \"d\"\nversion = 1\ntype = \"epic\"\n\"schema_version\" = 1\n\n[[steps]]\nid = \"a\"\n",
    );

    let result = validator(tmp.path()).validate(Step::Plan, &path);
    assert!(result.valid);
    assert_eq!(
        result.warnings,
        vec![
            "Missing required TOML field: description".to_string(),
            "Missing required TOML field: version".to_string(),
            "Missing required TOML field: type".to_string(),
        ]
    );
}

#[test]
fn plan_epic_reference() {
    let tmp = tempdir().expect("tempdir");
    let v = validator(tmp.path());

    let ok = v.validate(Step::Plan, Path::new("epic:ol-0001"));
    assert!(ok.valid);
    assert!(ok.warnings.is_empty());

    let unprefixed = v.validate(Step::Plan, Path::new("epic:0001"));
    assert!(unprefixed.valid);
    assert_eq!(
        unprefixed.warnings,
        vec!["Epic ID should have prefix (e.g., ol-0001)".to_string()]
    );

    let empty = v.validate(Step::Plan, Path::new("epic:"));
    assert!(!empty.valid);
    assert_eq!(empty.issues, vec!["Empty epic ID".to_string()]);
}

#[test]
fn post_mortem_sections() {
    let tmp = tempdir().expect("tempdir");
    let path = write(
        &tmp.path().join("retro.md"),
        "---\nschema_version: 1\n---\n## Learnings\n",
    );
    let result = validator(tmp.path()).validate(Step::PostMortem, &path);
    assert_eq!(result.warnings.len(), 2);
    assert_eq!(result.tier, Some(Tier::Learning));
}

#[test]
fn steps_without_rules_warn() {
    let tmp = tempdir().expect("tempdir");
    let path = write(&tmp.path().join("out.md"), "schema_version: 1\n");
    let result = validator(tmp.path()).validate(Step::Vibe, &path);
    assert_eq!(
        result.warnings,
        vec!["No validation rules for step: vibe".to_string()]
    );
}

#[test]
fn promotion_to_learning_counts_citations() {
    let tmp = tempdir().expect("tempdir");
    let artifact = write(&tmp.path().join(".agents/learnings/l1.md"), "# l1\n");
    let v = validator(tmp.path());

    let before = v.validate_for_promotion(&artifact, Tier::Learning);
    assert!(!before.valid);
    assert_eq!(
        before.issues,
        vec!["Promotion to learning tier requires 2+ citations (found: 0)".to_string()]
    );

    citation::record_citation(tmp.path(), CitationEvent::new(".agents/learnings/l1.md", "s1"))
        .unwrap();
    citation::record_citation(
        tmp.path(),
        CitationEvent::new(&artifact.display().to_string(), "s2"),
    )
    .unwrap();

    let after = v.validate_for_promotion(&artifact, Tier::Learning);
    assert!(after.valid, "issues: {:?}", after.issues);
    assert_eq!(after.step, None);
}

#[test]
fn promotion_to_learning_counts_backlinks() {
    let tmp = tempdir().expect("tempdir");
    let dir = tmp.path().join(".agents/learnings");
    let artifact = write(&dir.join("l1.md"), "# l1\n");
    write(&dir.join("a.md"), "see l1.md\n");
    write(&dir.join("b.md"), "builds on l1.md\n");
    write(&dir.join("c.txt"), "l1.md\n");

    assert_eq!(validator(tmp.path()).count_citations(&artifact), 2);
}

#[test]
fn relative_artifacts_resolve_from_start_dir() {
    let tmp = tempdir().expect("tempdir");
    let dir = tmp.path().join(".agents/learnings");
    write(&tmp.path().join(".agents/research/topic.md"), &long_research());
    write(&dir.join("l1.md"), "# l1\n");
    write(&dir.join("a.md"), "see l1.md\n");
    citation::record_citation(tmp.path(), CitationEvent::new(".agents/learnings/l1.md", "s1"))
        .unwrap();
    let v = validator(tmp.path());

    let result = v.validate(Step::Research, Path::new(".agents/research/topic.md"));
    assert!(result.valid, "issues: {:?}", result.issues);
    assert_eq!(result.tier, Some(Tier::Pattern));

    let relative = Path::new(".agents/learnings/l1.md");
    assert_eq!(v.count_citations(relative), 1);
    write(&dir.join("b.md"), "builds on l1.md\n");
    assert_eq!(v.count_citations(relative), 2);
    assert!(v.validate_for_promotion(relative, Tier::Learning).valid);

    let missing = v.validate(Step::Research, Path::new(".agents/research/nope.md"));
    assert_eq!(
        missing.issues,
        vec!["Artifact not found: .agents/research/nope.md".to_string()]
    );
}

#[cfg(unix)]
#[test]
fn unreadable_parent_is_not_reported_as_missing() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = tempdir().expect("tempdir");
    let locked = tmp.path().join("locked");
    let artifact = write(&locked.join("topic.md"), &long_research());
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
    let denied = fs::metadata(&artifact).is_err();

    let result = validator(tmp.path()).validate(Step::Research, &artifact);
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

    // privileged users can still see through the mode bits
    if denied {
        assert!(!result.valid);
        assert_eq!(result.issues.len(), 1);
        assert!(
            result.issues[0].starts_with("Cannot access artifact"),
            "issues: {:?}",
            result.issues
        );
    } else {
        assert!(result.valid, "issues: {:?}", result.issues);
    }
}

#[test]
fn promotion_to_pattern_counts_session_files() {
    let tmp = tempdir().expect("tempdir");
    let artifact = write(&tmp.path().join(".agents/patterns/p.md"), "# p\n");
    let sessions = tmp.path().join(".agents/ao/sessions");
    write(&sessions.join("s1.jsonl"), "{\"cited\":\"p.md\"}\n");
    write(&sessions.join("2026/s2.md"), "used p.md\n");

    let v = validator(tmp.path());
    assert!(!v.validate_for_promotion(&artifact, Tier::Pattern).valid);

    write(&tmp.path().join("town/.agents/ao/sessions/s3.jsonl"), "p.md\n");
    write(&sessions.join("ignored.txt"), "p.md\n");
    assert_eq!(v.count_session_refs(&artifact), 3);
    assert!(v.validate_for_promotion(&artifact, Tier::Pattern).valid);
}

#[test]
fn promotion_to_skill_and_core() {
    let tmp = tempdir().expect("tempdir");
    let v = validator(tmp.path());

    let partial = write(&tmp.path().join("SKILL.md"), "## Description\n## Triggers\n");
    let result = v.validate_for_promotion(&partial, Tier::Skill);
    assert!(!result.valid);

    let full = write(
        &tmp.path().join("full/SKILL.md"),
        "## Description\n## Triggers\n## Instructions\n",
    );
    assert!(v.validate_for_promotion(&full, Tier::Skill).valid);

    let core = v.validate_for_promotion(&full, Tier::Core);
    assert!(core.valid);
    assert_eq!(core.warnings.len(), 1);
    assert_eq!(core.tier, Some(Tier::Learning));
}

#[test]
fn metrics_snapshot_is_isolated() {
    let tmp = tempdir().expect("tempdir");
    let path = write(&tmp.path().join("r.md"), &long_research());
    let v = validator(tmp.path());

    v.validate(Step::Research, &path);
    let snapshot = v.metrics();
    v.validate_with_options(Step::Research, &path, &ValidateOptions::lenient());

    assert_eq!(snapshot.strict_count, 1);
    assert_eq!(snapshot.lenient_count, 0);
    let now = v.metrics();
    assert_eq!(now.lenient_count, 1);
    assert!(now.lenient_artifacts.contains_key(&path.display().to_string()));
}

#[test]
fn concurrent_validations_are_counted() {
    let tmp = tempdir().expect("tempdir");
    let path = write(&tmp.path().join("r.md"), &long_research());
    let v = Arc::new(validator(tmp.path()));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let v = Arc::clone(&v);
            let path = path.clone();
            thread::spawn(move || {
                let opts = if i % 2 == 0 {
                    ValidateOptions::strict()
                } else {
                    ValidateOptions::lenient()
                };
                v.validate_with_options(Step::Research, &path, &opts)
            })
        })
        .collect();
    for handle in handles {
        assert!(handle.join().expect("validation thread").valid);
    }

    let metrics = v.metrics();
    assert_eq!(metrics.strict_count, 4);
    assert_eq!(metrics.lenient_count, 4);
}

use std::collections::BTreeMap;
use std::error::Error;

use watchflow::workflow::{
    self, evaluate_condition, merge_environment, parse_plugin, parse_plugin_reference,
    prepare_inputs, substitute_inputs, StepKind, Variables,
};

type TestResult = Result<(), Box<dyn Error>>;

const FULL_WORKFLOW: &str = r#"
name: photos-to-webp
description: Convert incoming photos
on:
  paths: ["/data/incoming", "/data/uploads"]
convert: { from: jpg, to: webp }
env:
  QUALITY: "80"
steps:
  - name: convert
    run: "cwebp -q $QUALITY '${{ input_path }}' -o '${{ output_path }}'"
    env:
      EXTRA: "1"
  - name: notify
    uses: notify@v1.2.0
    with:
      url: http://example.test/hook
options:
  concurrency: 3
  include_subdirs: true
  file_glob: "*.jpg|*.jpeg"
  skip_on_nochange: false
  output_dir_pattern: "../webp"
  ignore: ["*.tmp", ".git"]
"#;

#[test]
fn parses_full_workflow_surface() -> TestResult {
    let def = workflow::parse(FULL_WORKFLOW)?;

    assert_eq!(def.name, "photos-to-webp");
    assert_eq!(def.description, "Convert incoming photos");
    assert_eq!(def.paths, vec!["/data/incoming", "/data/uploads"]);
    assert_eq!(def.convert.from, "jpg");
    assert_eq!(def.convert.to, "webp");
    assert_eq!(def.env.get("QUALITY").map(String::as_str), Some("80"));

    assert_eq!(def.steps.len(), 2);
    match &def.steps[0].kind {
        StepKind::Run { command } => assert!(command.starts_with("cwebp")),
        other => panic!("expected run step, got {other:?}"),
    }
    assert_eq!(def.steps[0].env.get("EXTRA").map(String::as_str), Some("1"));
    match &def.steps[1].kind {
        StepKind::Uses { reference, with } => {
            assert_eq!(reference, "notify@v1.2.0");
            assert_eq!(with.get("url").map(String::as_str), Some("http://example.test/hook"));
        }
        other => panic!("expected uses step, got {other:?}"),
    }

    assert_eq!(def.options.concurrency, 3);
    assert!(def.options.include_subdirs);
    assert_eq!(def.options.file_glob, "*.jpg|*.jpeg");
    assert!(!def.options.skip_on_nochange);
    assert_eq!(def.options.output_dir_pattern.as_deref(), Some("../webp"));
    assert_eq!(def.options.ignore, vec!["*.tmp", ".git"]);
    Ok(())
}

#[test]
fn applies_option_defaults() -> TestResult {
    let def = workflow::parse(
        "name: minimal\non:\n  paths: [/tmp/in]\nsteps:\n  - name: s\n    run: \"true\"\n",
    )?;

    assert_eq!(def.options.concurrency, 4);
    assert_eq!(def.options.file_glob, "*");
    assert!(def.options.skip_on_nochange);
    assert!(!def.options.include_subdirs);
    assert!(def.options.ignore.is_empty());
    Ok(())
}

#[test]
fn rejects_structural_problems() {
    let cases = [
        // missing name
        "on:\n  paths: [/tmp]\nsteps:\n  - name: s\n    run: \"true\"\n",
        // name with invalid characters
        "name: \"bad name!\"\non:\n  paths: [/tmp]\nsteps:\n  - name: s\n    run: \"true\"\n",
        // no trigger paths
        "name: w\nsteps:\n  - name: s\n    run: \"true\"\n",
        // no steps
        "name: w\non:\n  paths: [/tmp]\n",
        // step without a name
        "name: w\non:\n  paths: [/tmp]\nsteps:\n  - run: \"true\"\n",
        // step with neither run nor uses
        "name: w\non:\n  paths: [/tmp]\nsteps:\n  - name: s\n",
        // step with both run and uses
        "name: w\non:\n  paths: [/tmp]\nsteps:\n  - name: s\n    run: \"true\"\n    uses: p\n",
        // concurrency below 1
        "name: w\non:\n  paths: [/tmp]\nsteps:\n  - name: s\n    run: \"true\"\noptions:\n  concurrency: 0\n",
    ];

    for source in cases {
        assert!(workflow::parse(source).is_err(), "should reject: {source}");
    }
}

#[test]
fn parses_and_validates_plugins() -> TestResult {
    let plugin = parse_plugin(
        r#"
name: notify
version: 1.2.0
description: Post a webhook
dependencies: [curl]
inputs:
  url:
    type: string
    required: true
  method:
    type: string
    default: POST
steps:
  - name: post
    run: "curl -s -X '${{ inputs.method }}' '${{ inputs.url }}'"
    timeout: 30
tags: [http]
env:
  LANG: C
"#,
    )?;

    assert_eq!(plugin.name, "notify");
    assert_eq!(plugin.version, "1.2.0");
    assert_eq!(plugin.dependencies, vec!["curl"]);
    assert_eq!(plugin.steps.len(), 1);
    assert_eq!(plugin.steps[0].timeout, Some(30));
    assert!(plugin.inputs.get("url").map(|i| i.required).unwrap_or(false));

    // Version must be three dotted integers.
    assert!(parse_plugin("name: p\nversion: \"1.2\"\nsteps:\n  - name: s\n    run: x\n").is_err());
    assert!(parse_plugin("name: p\nversion: 1.2.beta\nsteps:\n  - name: s\n    run: x\n").is_err());
    // Name, version and steps are all required.
    assert!(parse_plugin("version: 1.0.0\nsteps:\n  - name: s\n    run: x\n").is_err());
    assert!(parse_plugin("name: p\nsteps:\n  - name: s\n    run: x\n").is_err());
    assert!(parse_plugin("name: p\nversion: 1.0.0\n").is_err());
    Ok(())
}

#[test]
fn parses_plugin_references() -> TestResult {
    assert_eq!(parse_plugin_reference("notify")?, ("notify".to_string(), None));
    assert_eq!(
        parse_plugin_reference("notify@v1.2.0")?,
        ("notify".to_string(), Some("1.2.0".to_string()))
    );
    assert_eq!(
        parse_plugin_reference("notify@1.2.0")?,
        ("notify".to_string(), Some("1.2.0".to_string()))
    );

    assert!(parse_plugin_reference("").is_err());
    assert!(parse_plugin_reference("@1.0.0").is_err());
    assert!(parse_plugin_reference("a@b@c").is_err());
    assert!(parse_plugin_reference("notify@").is_err());
    Ok(())
}

#[test]
fn prepares_inputs_with_defaults_and_overrides() -> TestResult {
    let plugin = parse_plugin(
        r#"
name: p
version: 1.0.0
inputs:
  greeting:
    type: string
    default: hi
  target:
    type: string
    required: true
  count:
    type: number
    default: 3
steps:
  - name: s
    run: "echo '${{ inputs.greeting }} ${{ inputs.target }}'"
"#,
    )?;

    let mut provided = BTreeMap::new();
    provided.insert("greeting".to_string(), "yo".to_string());
    provided.insert("target".to_string(), "world".to_string());

    let inputs = prepare_inputs(&plugin, &provided)?;
    assert_eq!(inputs.get("greeting").map(String::as_str), Some("yo"));
    assert_eq!(inputs.get("target").map(String::as_str), Some("world"));
    assert_eq!(inputs.get("count").map(String::as_str), Some("3"));

    // A required input with no value anywhere is an error.
    let missing = prepare_inputs(&plugin, &BTreeMap::new());
    assert!(missing.is_err());
    Ok(())
}

#[test]
fn substitutes_inputs_and_leaves_unknown_placeholders() {
    let mut inputs = BTreeMap::new();
    inputs.insert("name".to_string(), "world".to_string());

    assert_eq!(
        substitute_inputs("echo '${{ inputs.name }}'", &inputs),
        "echo 'world'"
    );
    // `input.` alias.
    assert_eq!(
        substitute_inputs("echo '${{ input.name }}'", &inputs),
        "echo 'world'"
    );
    // Unknown inputs stay untouched.
    assert_eq!(
        substitute_inputs("echo '${{ inputs.other }}'", &inputs),
        "echo '${{ inputs.other }}'"
    );
}

#[test]
fn evaluates_conditions() {
    let mut inputs = BTreeMap::new();
    inputs.insert("enabled".to_string(), "true".to_string());
    inputs.insert("mode".to_string(), "fast".to_string());
    let vars = Variables::default();

    assert!(evaluate_condition("${{ inputs.enabled }} == 'true'", &inputs, &vars));
    assert!(!evaluate_condition("${{ inputs.mode }} == 'slow'", &inputs, &vars));
    assert!(evaluate_condition("${{ inputs.mode }} != 'slow'", &inputs, &vars));
    assert!(evaluate_condition("\"fast\" == '${{ inputs.mode }}'", &inputs, &vars));

    // Truthy fallback: empty, "false" and "0" are falsy, everything else true.
    assert!(evaluate_condition("anything", &inputs, &vars));
    assert!(evaluate_condition("${{ inputs.enabled }}", &inputs, &vars));
    assert!(!evaluate_condition("false", &inputs, &vars));
    assert!(!evaluate_condition("FALSE", &inputs, &vars));
    assert!(!evaluate_condition("0", &inputs, &vars));
    // Missing condition always runs.
    assert!(evaluate_condition("", &inputs, &vars));
}

#[test]
fn merges_environment_with_step_winning() {
    let mut workflow_env = BTreeMap::new();
    workflow_env.insert("A".to_string(), "wf".to_string());
    workflow_env.insert("B".to_string(), "wf".to_string());
    workflow_env.insert("C".to_string(), "wf".to_string());

    let mut plugin_env = BTreeMap::new();
    plugin_env.insert("B".to_string(), "plugin".to_string());
    plugin_env.insert("C".to_string(), "plugin".to_string());

    let mut step_env = BTreeMap::new();
    step_env.insert("C".to_string(), "step".to_string());

    let merged = merge_environment(&workflow_env, &plugin_env, &step_env);
    assert_eq!(merged.get("A").map(String::as_str), Some("wf"));
    assert_eq!(merged.get("B").map(String::as_str), Some("plugin"));
    assert_eq!(merged.get("C").map(String::as_str), Some("step"));
}

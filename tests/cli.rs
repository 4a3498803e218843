#![cfg(unix)]

use serde_json::Value;
use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use tempfile::tempdir;

/// Writes a host script and a runner configuration pointing every family at it.
fn write_host(dir: &Path, script: &str) {
    let host = dir.join("host.sh");
    fs::write(&host, script).expect("write host script");
    let config = format!(
        "[allsorts]\nprogram = \"sh\"\nargs = [\"{host}\"]\n\n\
         [tallsorts]\nprogram = \"sh\"\nargs = [\"{host}\"]\n\n\
         [bridge]\nprogram = \"sh\"\nargs = [\"{host}\"]\n",
        host = host.display()
    );
    fs::write(dir.join("subtyper.toml"), config).expect("write runner config");
}

fn run(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_subtyper"))
        .current_dir(dir)
        .args(args)
        .output()
        .expect("run subtyper cli")
}

fn stdout_json(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "CLI failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout is one JSON document")
}

#[test]
fn allsorts_reports_the_classifier_call_and_patches() {
    let tmp = tempdir().expect("temporary directory");
    let dir = tmp.path();
    fs::write(dir.join("samples.csv"), "sample,PAX5,CD19\nS1,10,3\n").expect("write samples");
    fs::write(
        dir.join("allsorts.json"),
        r#"{"$type": "Pipeline", "named_steps": {"preprocess": {"$type": "Preprocess", "genes": ["PAX5", "IKZF1"]}, "kpca": {"$type": "sklearn.decomposition.KernelPCA", "alphas_": [[0.5]], "lambdas_": [1.5]}}}"#,
    )
    .expect("write model");
    write_host(
        dir,
        r#"echo '{"predictions": {"columns": ["Prediction"], "index": ["S1"], "data": [["Ph-like"]]},
"probabilities": {"columns": ["Ph", "Ph-like", "Pred", "True"], "index": ["S1"], "data": [[0.2, 0.75, "Ph-like", null]]}}'
"#,
    );

    let output = run(
        dir,
        &[
            "allsorts",
            "--input-csv",
            "samples.csv",
            "--sample-name",
            "patient-1",
            "--model",
            "allsorts.json",
            "--model-dir",
            ".",
            "--top-n",
            "0",
        ],
    );
    let json = stdout_json(&output);
    assert_eq!(json["sample_id"], "patient-1");
    assert_eq!(json["model"], "ALLSorts (B-ALL)");
    assert_eq!(json["prediction"], "Ph-like");
    assert_eq!(json["confidence"], 0.75);
    assert_eq!(json["top_predictions"].as_array().map(Vec::len), Some(1));
    assert_eq!(json["model_gene_count"], 2);
    assert_eq!(json["matched_gene_count"], 1);
    assert_eq!(json["levels"], Value::Null);
    assert_eq!(json["implementation"], "official_allsorts_python_package_repo");
    assert_eq!(
        json["compatibility_patches"][0],
        "kernelpca_old_pickle_attributes"
    );
}

#[test]
fn tallsorts_picks_the_deepest_affirmative_level() {
    let tmp = tempdir().expect("temporary directory");
    let dir = tmp.path();
    fs::write(
        dir.join("samples.csv"),
        "sample,ENSG00000162367.4,ENSG00000107807\nS1,5,7\n",
    )
    .expect("write samples");
    write_host(
        dir,
        r#"echo '{"levels": [
{"name": "level_0", "calls_df": {"columns": ["y_pred"], "index": ["S1"], "data": [["TLX3"]]},
 "probs_raw_df": {"columns": ["TLX3", "TAL1"], "index": ["S1"], "data": [[0.9, 0.05]]}},
{"name": "level_1", "calls_df": {"columns": ["y_pred"], "index": ["S1"], "data": [["NA"]]},
 "probs_raw_df": {"columns": ["TLX3 a"], "index": ["S1"], "data": [[0.4]]}}
]}'
"#,
    );

    let output = run(
        dir,
        &[
            "tallsorts",
            "--input-csv",
            "samples.csv",
            "--sample-name",
            "patient-2",
            "--model",
            "tallsorts.pkl",
        ],
    );
    let json = stdout_json(&output);
    assert_eq!(json["model"], "TALLSorts (T-ALL)");
    assert_eq!(json["primary_level"], "level_0");
    assert_eq!(json["prediction"], "TLX3");
    assert_eq!(json["confidence"], 0.9);
    assert_eq!(json["levels"].as_array().map(Vec::len), Some(2));
    assert_eq!(json["levels"][1]["prediction"], "NA");
    assert_eq!(json["input_gene_count"], 2);
}

#[test]
fn bridge_flags_low_overlap_in_band() {
    let tmp = tempdir().expect("temporary directory");
    let dir = tmp.path();
    fs::write(dir.join("counts.csv"), "gene_id,count\nENSG1.2,12\nENSG2,0\n")
        .expect("write counts");
    write_host(
        dir,
        r#"echo '{"rna_features": ["ENSG1", "ENSG2", "ENSG3"], "options": {"log1p_rna": true}}'
while read -r line; do
  echo '{"predictions": {"columns": ["sample_id", "predicted_label", "predicted_proba"], "data": [["b1", "MLL", 0.55]]}, "probabilities": {"columns": ["sample_id", "proba_MLL", "proba_AML"], "data": [["b1", 0.55, 0.45]]}, "latents": {"columns": ["sample_id", "z0"], "data": [["b1", 0.3]]}}'
done
"#,
    );

    let output = run(
        dir,
        &[
            "bridge",
            "--input-csv",
            "counts.csv",
            "--sample-name",
            "patient-3",
            "--bundle",
            "bridge.bundle",
            "--top-n",
            "-5",
        ],
    );
    let json = stdout_json(&output);
    assert_eq!(json["model"], "Bridge (official package)");
    assert_eq!(json["prediction"], "MLL");
    assert_eq!(json["top_predictions"].as_array().map(Vec::len), Some(1));
    assert_eq!(json["n_input_features"], 3);
    assert_eq!(json["matched_nonzero_features"], 1);
    assert_eq!(json["latent_dim"], 1);
    assert_eq!(json["normalization"], "unknown");
    assert_eq!(json["log1p_rna"], true);
    assert!(
        json["warning"]
            .as_str()
            .is_some_and(|w| w.starts_with("Very low Bridge RNA feature overlap"))
    );
}

#[test]
fn bridge_without_artifacts_fails_before_starting_a_host() {
    let tmp = tempdir().expect("temporary directory");
    let dir = tmp.path();
    let marker = dir.join("started");
    write_host(dir, &format!("touch '{}'\n", marker.display()));
    fs::write(dir.join("counts.csv"), "gene_id,count\nENSG1,1\n").expect("write counts");

    let output = run(
        dir,
        &[
            "bridge",
            "--input-csv",
            "counts.csv",
            "--sample-name",
            "s",
            "--meta",
            "meta.joblib",
        ],
    );
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("Missing Bridge artifact arguments: --ckpt, --lr"),
        "stderr: {stderr}"
    );
    assert!(!marker.exists());
}

#[test]
fn failing_host_exits_nonzero_with_its_message() {
    let tmp = tempdir().expect("temporary directory");
    let dir = tmp.path();
    fs::write(dir.join("samples.csv"), "sample,G1\nS1,1\n").expect("write samples");
    write_host(dir, "echo 'could not unpickle model' >&2\nexit 2\n");

    let output = run(
        dir,
        &[
            "tallsorts",
            "--input-csv",
            "samples.csv",
            "--sample-name",
            "s",
            "--model",
            "m.pkl",
        ],
    );
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.starts_with("Error: "), "stderr: {stderr}");
    assert!(stderr.contains("could not unpickle model"));
}

#[test]
fn single_column_input_is_rejected() {
    let tmp = tempdir().expect("temporary directory");
    let dir = tmp.path();
    fs::write(dir.join("samples.csv"), "sample\nS1\n").expect("write samples");
    write_host(dir, "exit 0\n");

    let output = run(
        dir,
        &[
            "tallsorts",
            "--input-csv",
            "samples.csv",
            "--sample-name",
            "s",
            "--model",
            "m.pkl",
        ],
    );
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("at least 2 are required"));
}

#[test]
fn missing_config_section_is_named() {
    let tmp = tempdir().expect("temporary directory");
    let dir = tmp.path();
    fs::write(dir.join("partial.toml"), "[bridge]\nprogram = \"sh\"\n").expect("write config");
    fs::write(dir.join("samples.csv"), "sample,G1\nS1,1\n").expect("write samples");

    let output = run(
        dir,
        &[
            "tallsorts",
            "--input-csv",
            "samples.csv",
            "--sample-name",
            "s",
            "--model",
            "m.pkl",
            "--config",
            "partial.toml",
        ],
    );
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("[tallsorts]"));
}

#[test]
fn convert_reports_errors_with_its_own_prefix() {
    let tmp = tempdir().expect("temporary directory");
    let output = run(
        tmp.path(),
        &[
            "convert",
            "--input-parquet",
            "absent.parquet",
            "--output-csv",
            "out.csv",
        ],
    );
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).starts_with("ERROR: "));
}

use std::path::PathBuf;
use std::process::{Command, Output};

fn bin_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_srcomb"))
}

fn repo_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..").canonicalize().unwrap()
}

fn fixture_path(name: &str) -> PathBuf {
    repo_root().join("tests/fixtures").join(name)
}

fn run(args: &[&str]) -> Output {
    Command::new(bin_path())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run {:?} {:?}: {}", bin_path(), args, e))
}

fn tmp_path(name: &str) -> PathBuf {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    let mut p = std::env::temp_dir();
    p.push(format!("srcomb_cli_{}_{}_{}", std::process::id(), nanos, name));
    p
}

fn stdout_json(out: &Output) -> serde_json::Value {
    assert!(out.status.success(), "stderr={}", String::from_utf8_lossy(&out.stderr));
    serde_json::from_slice(&out.stdout).expect("stdout should be valid JSON")
}

#[test]
fn limit_reports_reference_values_per_factor() {
    let out = run(&["limit", "50", "0.1", "100", "0", "--lumi", "1", "--lumi", "4"]);
    let v = stdout_json(&out);
    let arr = v.as_array().expect("array of results");
    assert_eq!(arr.len(), 2);

    let s95 = arr[0]["s95exp"].as_f64().unwrap();
    assert!((s95 / 20.900500796461515 - 1.0).abs() < 1e-4, "s95exp={s95}");
    let r4 = arr[1]["r_exp_cons"].as_f64().unwrap();
    assert!((r4 / 4.931379834715797 - 1.0).abs() < 1e-4, "r={r4}");
    assert_eq!(arr[1]["luminosity_factor"].as_f64(), Some(4.0));
    assert!(arr[0].get("s95_expected_band").is_none());
}

#[test]
fn limit_band_is_ordered() {
    let out = run(&["limit", "10", "1", "20", "4", "--band"]);
    let v = stdout_json(&out);
    let band: Vec<f64> = v[0]["s95_expected_band"]
        .as_array()
        .expect("band present")
        .iter()
        .map(|x| x.as_f64().unwrap())
        .collect();
    assert_eq!(band.len(), 5);
    for w in band.windows(2) {
        assert!(w[0] < w[1], "band not increasing: {band:?}");
    }
    let median = v[0]["s95exp"].as_f64().unwrap();
    assert!((band[2] / median - 1.0).abs() < 1e-3);
}

#[test]
fn limit_rejects_zero_background() {
    let out = run(&["limit", "5", "0.3", "0", "0"]);
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("Invalid model"), "stderr={stderr}");
}

#[test]
fn signal_shift_zero_gives_plain_ratio() {
    let out = run(&["limit", "50", "0.1", "100", "0", "--signal-shift", "0"]);
    let v = stdout_json(&out);
    let s95 = v[0]["s95exp"].as_f64().unwrap();
    let r = v[0]["r_exp_cons"].as_f64().unwrap();
    assert!((r - 50.0 / s95).abs() < 1e-12);
}

#[test]
fn combine_table_writes_output_file() {
    let input = fixture_path("point_regions.tsv");
    let output = tmp_path("combine.json");
    let out = run(&[
        "combine",
        "--input",
        input.to_string_lossy().as_ref(),
        "--output",
        output.to_string_lossy().as_ref(),
    ]);
    assert!(out.status.success(), "stderr={}", String::from_utf8_lossy(&out.stderr));

    let v: serde_json::Value = serde_json::from_slice(&std::fs::read(&output).unwrap()).unwrap();
    let first = &v[0];
    assert_eq!(first["s"].as_f64(), Some(24.0));
    assert_eq!(first["b"].as_f64(), Some(90.0));
    assert!(first["r_exp_cons"].as_f64().unwrap() > 0.0);
    let _ = std::fs::remove_file(output);
}

#[test]
fn best_reports_detectors_and_overall() {
    let input = fixture_path("point_regions.tsv");
    let out = run(&["best", "--input", input.to_string_lossy().as_ref()]);
    let v = stdout_json(&out);

    let detectors = v["detectors"].as_array().unwrap();
    let names: Vec<&str> = detectors.iter().map(|d| d["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["ATLAS", "CMS"]);

    let overall = v["overall_best"]["r_exp_cons"].as_f64().unwrap();
    for key in ["best_individual", "combined"] {
        assert!(overall >= v[key]["r_exp_cons"].as_f64().unwrap());
    }
    let combined_regions = v["combined"]["regions"].as_array().unwrap();
    assert!(combined_regions.len() >= 2);
}

#[test]
fn batch_writes_sorted_summary() {
    let root = tmp_path("batch_root");
    let table = std::fs::read_to_string(fixture_path("point_regions.tsv")).unwrap();
    for folder in ["fpvdm_Mtp2000DMV100", "fpvdm_Mtp1500DMV300"] {
        std::fs::create_dir_all(root.join(folder)).unwrap();
        std::fs::write(root.join(folder).join("filtered_regions.txt"), &table).unwrap();
    }

    let out = run(&[
        "batch",
        "--root",
        root.to_string_lossy().as_ref(),
        "--target-lumi",
        "3000",
        "--threads",
        "2",
    ]);
    assert!(out.status.success(), "stderr={}", String::from_utf8_lossy(&out.stderr));
    let text = String::from_utf8(out.stdout).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(
        lines[0],
        "Mtp\tDMV\tLumi\tBest_Individual\tBest_ATLAS\tBest_CMS\tBest_Combined\tOverall_Best"
    );
    assert!(lines[1].starts_with("1500\t300\t21.58\t"), "{}", lines[1]);
    assert!(lines[2].starts_with("2000\t100\t21.58\t"), "{}", lines[2]);

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn filter_then_batch_round_trip() {
    let results = tmp_path("checkmate_results");
    let filtered = tmp_path("filtered");
    let eval = results.join("fpvdm_Mtp1700DMV150").join("evaluation");
    std::fs::create_dir_all(&eval).unwrap();
    std::fs::copy(fixture_path("best_signal_regions.txt"), eval.join("total_results.txt")).unwrap();

    let out = run(&[
        "filter",
        "--results",
        results.to_string_lossy().as_ref(),
        "--out",
        filtered.to_string_lossy().as_ref(),
        "--threshold",
        "0.15",
    ]);
    assert!(out.status.success(), "stderr={}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("fpvdm_Mtp1700DMV150: 2"), "{stdout}");

    let out = run(&["batch", "--root", filtered.to_string_lossy().as_ref()]);
    assert!(out.status.success(), "stderr={}", String::from_utf8_lossy(&out.stderr));
    let text = String::from_utf8(out.stdout).unwrap();
    assert!(text.lines().nth(1).unwrap().starts_with("1700\t150\t1\t"), "{text}");

    let _ = std::fs::remove_dir_all(results);
    let _ = std::fs::remove_dir_all(filtered);
}

#[test]
fn regions_survey_ranks_across_points() {
    let results = tmp_path("survey_results");
    let second = "analysis sr b db s ds s95exp rexpcons\n\
        cms_sus_19_005 HT-1 10 2 9 0.4 9.5 0.9\n\
        atlas_2004_14060 SRA-TT 3.2 0.5 20 6.55 8.1 0.7\n";
    let first = std::fs::read_to_string(fixture_path("best_signal_regions.txt")).unwrap();
    let points = [("fpvdm_Mtp1700DMV150", first.as_str()), ("fpvdm_Mtp2000DMV100", second)];
    for (folder, text) in points {
        let eval = results.join(folder).join("evaluation");
        std::fs::create_dir_all(&eval).unwrap();
        std::fs::write(eval.join("best_signal_regions.txt"), text).unwrap();
    }

    let out = run(&["regions", "--results", results.to_string_lossy().as_ref(), "--top", "1"]);
    assert!(out.status.success(), "stderr={}", String::from_utf8_lossy(&out.stderr));
    let text = String::from_utf8(out.stdout).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "point\tanalysis\tsr\trexpcons");
    assert_eq!(lines.len(), 3, "{text}");
    assert!(lines[1].starts_with("fpvdm_Mtp1700DMV150\t"), "{text}");
    assert!(lines[1].contains("\tSRA-TT\t2.3123"), "{text}");
    assert_eq!(lines[2], "fpvdm_Mtp2000DMV100\tcms_sus_19_005\tHT-1\t0.9");

    let _ = std::fs::remove_dir_all(results);
}

#[test]
fn significance_of_best_row() {
    let input = fixture_path("best_signal_regions.txt");
    let out = run(&["significance", "--input", input.to_string_lossy().as_ref()]);
    let v = stdout_json(&out);
    assert_eq!(v["sr"].as_str(), Some("SRA-TT"));
    assert_eq!(v["s95exp"].as_f64(), Some(8.1));
    assert!((v["asimov"].as_f64().unwrap() - 19.508564031287875).abs() < 1e-9);
    assert!((v["cowan"].as_f64().unwrap() - 16.863528583996217).abs() < 1e-9);
}

#[test]
fn taxonomy_and_config_override() {
    let out = run(&["taxonomy"]);
    assert!(out.status.success());
    let yaml = String::from_utf8(out.stdout).unwrap();
    assert!(yaml.contains("atlas_2211_08028"), "{yaml}");
    assert!(yaml.contains("paired_split"), "{yaml}");

    let cfg = tmp_path("cfg.yaml");
    std::fs::write(&cfg, "taxonomy:\n  cross_detector: all_pairs\n  detectors: []\n").unwrap();
    let out = run(&["taxonomy", "--config", cfg.to_string_lossy().as_ref()]);
    assert!(out.status.success(), "stderr={}", String::from_utf8_lossy(&out.stderr));
    let yaml = String::from_utf8(out.stdout).unwrap();
    assert!(yaml.contains("all_pairs"), "{yaml}");
    assert!(!yaml.contains("ATLAS"), "{yaml}");
    let _ = std::fs::remove_file(cfg);
}

#[test]
fn version_prints_crate_version() {
    let out = run(&["version"]);
    assert!(out.status.success());
    let text = String::from_utf8(out.stdout).unwrap();
    assert!(text.starts_with("srcomb "), "{text}");
}

#![forbid(unsafe_code)]

use std::fs;
use std::path::PathBuf;

use fk_conformance::{
    HarnessConfig, collect_case_logs, report_summary, run_axis_conformance,
    run_gather_dispatch_conformance,
};
use fk_core::ExecutionMode;
use serde_json::json;

fn main() -> Result<(), String> {
    let mut mode = String::from("both");
    let mut fixture_root: Option<PathBuf> = None;
    let mut log_output: Option<PathBuf> = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--mode" => {
                mode = args
                    .next()
                    .ok_or_else(|| "--mode requires one of: strict|hardened|both".to_string())?;
            }
            "--fixtures" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--fixtures requires a directory path".to_string())?;
                fixture_root = Some(PathBuf::from(value));
            }
            "--case-log" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--case-log requires a file path".to_string())?;
                log_output = Some(PathBuf::from(value));
            }
            other => {
                return Err(format!(
                    "unknown arg '{other}'. usage: run_conformance_report [--mode strict|hardened|both] [--fixtures dir] [--case-log path.jsonl]"
                ));
            }
        }
    }

    let modes = parse_modes(mode.as_str())?;
    let mut config = HarnessConfig::default_paths();
    if let Some(root) = fixture_root {
        config.fixture_root = root;
    }

    let mut suites = Vec::new();
    let mut failed_cases = 0usize;
    for mode in &modes {
        let (axis, _) = run_axis_conformance(&config, *mode)?;
        let (gather, _) = run_gather_dispatch_conformance(&config, *mode)?;
        for report in [axis, gather] {
            failed_cases += report.cases_total - report.cases_passed;
            suites.push(report_summary(&report));
        }
    }

    if let Some(path) = &log_output {
        let logs = collect_case_logs(&config, &modes)?;
        let mut lines = String::new();
        for log in &logs {
            let line = serde_json::to_string(log)
                .map_err(|error| format!("failed to serialize case log: {error}"))?;
            lines.push_str(&line);
            lines.push('\n');
        }
        fs::write(path, lines)
            .map_err(|error| format!("failed writing case log {}: {error}", path.display()))?;
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "status": if failed_cases == 0 { "ok" } else { "needs_attention" },
            "fixture_root": config.fixture_root.display().to_string(),
            "modes": modes.iter().map(|mode| fk_conformance::mode_label(*mode)).collect::<Vec<_>>(),
            "failed_cases": failed_cases,
            "case_log": log_output.map(|path| path.display().to_string()),
            "suites": suites,
        }))
        .map_err(|error| format!("failed to serialize summary: {error}"))?
    );

    Ok(())
}

fn parse_modes(raw: &str) -> Result<Vec<ExecutionMode>, String> {
    match raw {
        "strict" => Ok(vec![ExecutionMode::Strict]),
        "hardened" => Ok(vec![ExecutionMode::Hardened]),
        "both" => Ok(vec![ExecutionMode::Strict, ExecutionMode::Hardened]),
        _ => Err(format!(
            "unsupported mode '{raw}'; expected strict|hardened|both"
        )),
    }
}

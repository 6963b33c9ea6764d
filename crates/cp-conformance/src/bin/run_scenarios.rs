#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;

use cp_conformance::{
    BackendKind, HarnessConfig, ScenarioRegistry, emit_suite_log, emit_suite_report,
    run_registry, suite_summary,
};
use serde_json::json;

const USAGE: &str = "usage: run_scenarios [--backend process|loopback] [--scenario NAME]... [--work-dir path] [--output path] [--report path] [--keep-artifacts] [--list] [--print-full-report]";

fn main() -> Result<ExitCode, String> {
    let mut backend = String::from("process");
    let mut scenarios: Vec<String> = Vec::new();
    let mut work_dir: Option<PathBuf> = None;
    let mut output: Option<PathBuf> = None;
    let mut report: Option<PathBuf> = None;
    let mut keep_artifacts = false;
    let mut list = false;
    let mut print_full_report = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--backend" => {
                backend = args
                    .next()
                    .ok_or_else(|| "--backend requires one of: process|loopback".to_string())?;
            }
            "--scenario" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--scenario requires a scenario name (see --list)".to_string())?;
                scenarios.push(value);
            }
            "--work-dir" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--work-dir requires a directory path".to_string())?;
                work_dir = Some(PathBuf::from(value));
            }
            "--output" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--output requires a file path".to_string())?;
                output = Some(PathBuf::from(value));
            }
            "--report" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--report requires a file path".to_string())?;
                report = Some(PathBuf::from(value));
            }
            "--keep-artifacts" => {
                keep_artifacts = true;
            }
            "--list" => {
                list = true;
            }
            "--print-full-report" => {
                print_full_report = true;
            }
            other => {
                return Err(format!("unknown arg '{other}'. {USAGE}"));
            }
        }
    }

    let registry = ScenarioRegistry::builtin();
    if list {
        let entries: Vec<_> = registry
            .scenarios()
            .iter()
            .map(|scenario| {
                json!({
                    "name": scenario.name(),
                    "family": scenario.family().as_str(),
                    "seed": scenario.seed(),
                    "axes": scenario.axes().iter().map(|axis| axis.as_str()).collect::<Vec<_>>(),
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&entries)
                .map_err(|error| format!("failed to serialize scenario list: {error}"))?
        );
        return Ok(ExitCode::SUCCESS);
    }

    let mut config = HarnessConfig::default_paths();
    if let Some(dir) = work_dir {
        config.work_dir = dir;
    }
    config.keep_artifacts = keep_artifacts;
    let backend = config.backend(BackendKind::parse(backend.as_str())?)?;

    let suite = run_registry(&registry, &scenarios, backend.as_ref(), &config)?;
    let output_path = output.unwrap_or_else(|| config.work_dir.join("scenarios.jsonl"));
    let summary = emit_suite_log(&suite, output_path.as_path())?;
    if let Some(path) = report.as_deref() {
        emit_suite_report(&suite, path)?;
    }

    if print_full_report {
        println!(
            "{}",
            serde_json::to_string_pretty(&suite_summary(&suite))
                .map_err(|error| format!("failed to serialize suite report: {error}"))?
        );
    } else {
        let failed: Vec<_> = suite
            .failures()
            .map(|scenario| {
                json!({
                    "name": scenario.name,
                    "reason_code": scenario.reason_code(),
                })
            })
            .collect();
        let status = if suite.all_passed() { "ok" } else { "failed" };
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "status": status,
                "backend": suite.backend,
                "output_path": summary.output_path.display().to_string(),
                "log_entries": summary.log_entries,
                "failed_entries": summary.failed_entries,
                "scenarios_total": suite.scenarios_total,
                "scenarios_passed": suite.scenarios_passed,
                "failed": failed,
            }))
            .map_err(|error| format!("failed to serialize summary: {error}"))?
        );
    }

    Ok(if suite.all_passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

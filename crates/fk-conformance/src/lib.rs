#![forbid(unsafe_code)]

mod logging;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use fk_api::{CompileSession, RecordingStream};
use fk_axis::{PhysicalAxis, resolve_gather_axis};
use fk_core::{
    ElementType, ExecutionMode, GatherAttrs, GraphNode, LayoutDesc, MemoryLayout, OperatorKind,
};
use fk_dispatch::PrimitiveImpl;
use fk_runtime::{ConfigMode, EvidenceKind, ProgramConfig};
use serde::Deserialize;
use serde_json::{Value, json};

pub use logging::{CASE_LOG_SCHEMA_VERSION, StructuredCaseLog, mode_label};

const MAX_FIXTURE_BYTES: u64 = 1_048_576;
const AXIS_FIXTURE: &str = "axis_cases.json";
const GATHER_FIXTURE: &str = "gather_dispatch_cases.json";

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
    pub strict_mode: bool,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        Self {
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
            strict_mode: true,
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessReport {
    pub suite: &'static str,
    pub fixture_count: usize,
    pub strict_mode: bool,
    pub cases_total: usize,
    pub cases_passed: usize,
}

impl HarnessReport {
    #[must_use]
    pub fn is_green(&self) -> bool {
        self.cases_total == self.cases_passed
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AxisCaseReport {
    pub name: String,
    pub mode: ExecutionMode,
    pub axis_ok: bool,
    pub error_ok: bool,
    pub forensic_log: StructuredCaseLog,
}

impl AxisCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.axis_ok && self.error_ok
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatherDispatchCaseReport {
    pub name: String,
    pub mode: ExecutionMode,
    pub axis_ok: bool,
    pub kernel_ok: bool,
    pub key_ok: bool,
    pub launch_ok: bool,
    pub policy_ok: bool,
    pub error_ok: bool,
    pub forensic_log: StructuredCaseLog,
}

impl GatherDispatchCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.axis_ok
            && self.kernel_ok
            && self.key_ok
            && self.launch_ok
            && self.policy_ok
            && self.error_ok
    }
}

#[derive(Debug, Clone, Deserialize)]
struct AxisFixtureFile {
    cases: Vec<AxisCase>,
}

#[derive(Debug, Clone, Deserialize)]
struct AxisCase {
    name: String,
    axis: i64,
    rank: usize,
    expected: Option<String>,
    #[serde(default)]
    expect_error: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct GatherFixtureFile {
    cases: Vec<GatherCase>,
}

#[derive(Debug, Clone, Deserialize)]
struct TensorFixture {
    dtype: String,
    layout: String,
    shape: Vec<usize>,
}

#[derive(Debug, Clone, Deserialize)]
struct GatherCase {
    name: String,
    axis: i64,
    #[serde(default)]
    batch_dim: i64,
    #[serde(default)]
    support_neg_ind: bool,
    data: TensorFixture,
    indices: Option<TensorFixture>,
    output: Option<TensorFixture>,
    engine: Option<String>,
    forced_kernel: Option<String>,
    strict: GatherExpectation,
    hardened: GatherExpectation,
}

#[derive(Debug, Clone, Deserialize)]
struct GatherExpectation {
    expected_axis: Option<String>,
    expected_kernel: Option<String>,
    expected_key: Option<String>,
    expected_policy_evidence: Option<bool>,
    #[serde(default)]
    expect_error: bool,
    expected_error_contains: Option<String>,
}

pub fn run_axis_conformance(
    config: &HarnessConfig,
    mode: ExecutionMode,
) -> Result<(HarnessReport, Vec<AxisCaseReport>), String> {
    let fixture: AxisFixtureFile = load_fixture(&config.fixture_root.join(AXIS_FIXTURE))?;

    let mut case_reports = Vec::with_capacity(fixture.cases.len());
    for case in &fixture.cases {
        case_reports.push(run_axis_case(case, mode)?);
    }

    let (cases_total, cases_passed) =
        summarize_passes(case_reports.iter().map(AxisCaseReport::passed));

    let report = HarnessReport {
        suite: "gather_axis",
        fixture_count: 1,
        strict_mode: mode == ExecutionMode::Strict,
        cases_total,
        cases_passed,
    };
    Ok((report, case_reports))
}

pub fn run_gather_dispatch_conformance(
    config: &HarnessConfig,
    mode: ExecutionMode,
) -> Result<(HarnessReport, Vec<GatherDispatchCaseReport>), String> {
    let fixture: GatherFixtureFile = load_fixture(&config.fixture_root.join(GATHER_FIXTURE))?;

    let mut case_reports = Vec::with_capacity(fixture.cases.len());
    for case in &fixture.cases {
        case_reports.push(run_gather_case(case, mode)?);
    }

    let (cases_total, cases_passed) =
        summarize_passes(case_reports.iter().map(GatherDispatchCaseReport::passed));

    let report = HarnessReport {
        suite: "gather_dispatch",
        fixture_count: 1,
        strict_mode: mode == ExecutionMode::Strict,
        cases_total,
        cases_passed,
    };
    Ok((report, case_reports))
}

#[must_use]
pub fn run_smoke(config: &HarnessConfig) -> HarnessReport {
    let fixture_count = fs::read_dir(&config.fixture_root)
        .ok()
        .into_iter()
        .flat_map(|it| it.filter_map(Result::ok))
        .count();

    let mode = if config.strict_mode {
        ExecutionMode::Strict
    } else {
        ExecutionMode::Hardened
    };

    let (axis_total, axis_passed) = run_axis_conformance(config, mode)
        .map_or((0, 0), |(report, _)| (report.cases_total, report.cases_passed));
    let (gather_total, gather_passed) = run_gather_dispatch_conformance(config, mode)
        .map_or((0, 0), |(report, _)| (report.cases_total, report.cases_passed));

    HarnessReport {
        suite: "smoke",
        fixture_count,
        strict_mode: config.strict_mode,
        cases_total: axis_total + gather_total,
        cases_passed: axis_passed + gather_passed,
    }
}

/// Runs every suite in every requested mode and returns the case logs in
/// suite, mode, fixture order.
pub fn collect_case_logs(
    config: &HarnessConfig,
    modes: &[ExecutionMode],
) -> Result<Vec<StructuredCaseLog>, String> {
    let mut logs = Vec::new();
    for mode in modes {
        let (_, axis_cases) = run_axis_conformance(config, *mode)?;
        logs.extend(axis_cases.into_iter().map(|case| case.forensic_log));
    }
    for mode in modes {
        let (_, gather_cases) = run_gather_dispatch_conformance(config, *mode)?;
        logs.extend(gather_cases.into_iter().map(|case| case.forensic_log));
    }
    Ok(logs)
}

fn run_axis_case(case: &AxisCase, mode: ExecutionMode) -> Result<AxisCaseReport, String> {
    let expected = case
        .expected
        .as_deref()
        .map(|label| {
            PhysicalAxis::from_label(label)
                .ok_or_else(|| format!("axis case '{}' has unknown label '{label}'", case.name))
        })
        .transpose()?;

    let result = resolve_gather_axis(case.axis, case.rank);
    let (axis_ok, error_ok) = if case.expect_error {
        (true, result.is_err())
    } else {
        (
            result
                .as_ref()
                .is_ok_and(|actual| expected.is_none_or(|expected| expected == *actual)),
            result.is_ok(),
        )
    };
    let passed = axis_ok && error_ok;
    let reason_code = match (passed, case.expect_error) {
        (true, true) => "expected_error_observed",
        (true, false) => "axis_parity_ok",
        (false, true) => "expected_error_missing",
        (false, false) => "axis_expectation_mismatch",
    };

    let observed = match &result {
        Ok(axis) => json!(axis.label()),
        Err(error) => json!(error.to_string()),
    };
    Ok(AxisCaseReport {
        name: case.name.clone(),
        mode,
        axis_ok,
        error_ok,
        forensic_log: StructuredCaseLog::new(
            "gather_axis",
            AXIS_FIXTURE,
            case.name.as_str(),
            mode,
            vec![format!("crates/fk-conformance/fixtures/{AXIS_FIXTURE}")],
            format!(
                "cargo test -p fk-conformance axis_fixture_executes_in_both_modes -- --nocapture # mode={}",
                mode_label(mode)
            ),
            if passed { "pass" } else { "fail" },
            reason_code,
        )
        .with_extra_fields(BTreeMap::from([
            ("logical_axis".to_string(), json!(case.axis)),
            ("rank".to_string(), json!(case.rank)),
            ("expected_axis".to_string(), json!(case.expected)),
            ("observed".to_string(), observed),
        ])),
    })
}

fn run_gather_case(
    case: &GatherCase,
    mode: ExecutionMode,
) -> Result<GatherDispatchCaseReport, String> {
    let expectation = match mode {
        ExecutionMode::Strict => &case.strict,
        ExecutionMode::Hardened => &case.hardened,
    };

    let node = build_node(case)?;
    let mut program = ProgramConfig {
        mode: match mode {
            ExecutionMode::Strict => ConfigMode::Strict,
            ExecutionMode::Hardened => ConfigMode::Hardened,
        },
        ..ProgramConfig::default()
    };
    if let Some(engine) = &case.engine {
        program.engine = engine.clone();
    }
    if let Some(kernel) = &case.forced_kernel {
        program
            .force_implementations
            .insert(case.name.clone(), kernel.clone());
    }
    let mut session = CompileSession::new(program)
        .map_err(|error| format!("gather case '{}' session failed: {error}", case.name))?;
    let result = session.compile(&node);

    let policy_recorded = session.evidence().iter().any(|entry| {
        entry.kind == EvidenceKind::Policy
            && entry.layer_id.as_deref() == Some(case.name.as_str())
            && entry.field("policy") == Some("ignored unknown forced kernel")
    });
    let policy_ok = expectation
        .expected_policy_evidence
        .is_none_or(|expected| expected == policy_recorded);

    let mut extra = BTreeMap::from([
        ("logical_axis".to_string(), json!(case.axis)),
        ("batch_dim".to_string(), json!(case.batch_dim)),
        ("forced_kernel".to_string(), json!(case.forced_kernel)),
        ("policy_recorded".to_string(), json!(policy_recorded)),
        ("evidence_len".to_string(), json!(session.evidence_len())),
    ]);

    if expectation.expect_error {
        let message = result.as_ref().err().map(ToString::to_string);
        let error_ok = message.as_deref().is_some_and(|message| {
            expectation
                .expected_error_contains
                .as_deref()
                .is_none_or(|needle| message.contains(needle))
        });
        let passed = error_ok && policy_ok;
        let reason_code = if passed {
            "expected_error_observed"
        } else {
            "expected_error_missing"
        };
        extra.insert("error".to_string(), json!(message));
        return Ok(GatherDispatchCaseReport {
            name: case.name.clone(),
            mode,
            axis_ok: true,
            kernel_ok: true,
            key_ok: true,
            launch_ok: true,
            policy_ok,
            error_ok,
            forensic_log: gather_case_log(case, mode, passed, reason_code).with_extra_fields(extra),
        });
    }

    let built = result.map_err(|error| format!("gather case '{}' failed: {error}", case.name))?;

    let axis_ok = expectation
        .expected_axis
        .as_deref()
        .is_none_or(|expected| expected == built.params().axis.label());
    let kernel_ok = expectation
        .expected_kernel
        .as_deref()
        .is_none_or(|expected| expected == built.kernel_name());
    let key_ok = expectation
        .expected_key
        .as_deref()
        .is_none_or(|expected| expected == built.dispatch_key().to_string());
    let launch_ok = launch_matches(built.as_ref());

    let passed = axis_ok && kernel_ok && key_ok && launch_ok && policy_ok;
    let reason_code = if passed {
        "gather_dispatch_parity_ok"
    } else {
        "gather_dispatch_expectation_mismatch"
    };
    extra.extend([
        ("observed_axis".to_string(), json!(built.params().axis.label())),
        ("observed_kernel".to_string(), json!(built.kernel_name())),
        (
            "observed_key".to_string(),
            json!(built.dispatch_key().to_string()),
        ),
        (
            "entry_point".to_string(),
            json!(built.candidate().entry_point),
        ),
    ]);

    Ok(GatherDispatchCaseReport {
        name: case.name.clone(),
        mode,
        axis_ok,
        kernel_ok,
        key_ok,
        launch_ok,
        policy_ok,
        error_ok: true,
        forensic_log: gather_case_log(case, mode, passed, reason_code).with_extra_fields(extra),
    })
}

fn gather_case_log(
    case: &GatherCase,
    mode: ExecutionMode,
    passed: bool,
    reason_code: &str,
) -> StructuredCaseLog {
    StructuredCaseLog::new(
        "gather_dispatch",
        GATHER_FIXTURE,
        case.name.as_str(),
        mode,
        vec![format!("crates/fk-conformance/fixtures/{GATHER_FIXTURE}")],
        format!(
            "cargo test -p fk-conformance gather_dispatch_fixture_executes_in_both_modes -- --nocapture # mode={}",
            mode_label(mode)
        ),
        if passed { "pass" } else { "fail" },
        reason_code,
    )
}

/// A built implementation and its clone must enqueue the same launch.
fn launch_matches(built: &dyn PrimitiveImpl) -> bool {
    let mut stream = RecordingStream::new();
    let copy = built.clone_boxed();
    if built.execute(&mut stream).is_err() || copy.execute(&mut stream).is_err() {
        return false;
    }
    match stream.launches() {
        [first, second] => {
            first.entry_point == built.candidate().entry_point
                && first.entry_point == second.entry_point
                && first.arguments == second.arguments
                && first.arguments.len() == built.params().inputs.len() + 1
        }
        _ => false,
    }
}

fn build_node(case: &GatherCase) -> Result<GraphNode, String> {
    let data = parse_tensor(&case.data, &case.name)?;
    let output = case
        .output
        .as_ref()
        .map_or_else(|| Ok(data.clone()), |output| parse_tensor(output, &case.name))?;
    let attrs = GatherAttrs::new(case.axis)
        .with_batch_dim(case.batch_dim)
        .with_negative_indices(case.support_neg_ind);
    match &case.indices {
        Some(indices) => Ok(GraphNode::gather(
            case.name.as_str(),
            attrs,
            data,
            parse_tensor(indices, &case.name)?,
            output,
        )),
        None => Ok(GraphNode::with_dependencies(
            case.name.as_str(),
            OperatorKind::Gather,
            attrs,
            vec![data],
            output,
        )),
    }
}

fn parse_tensor(raw: &TensorFixture, case_name: &str) -> Result<LayoutDesc, String> {
    let dtype: ElementType = raw
        .dtype
        .parse()
        .map_err(|error| format!("case '{case_name}': {error}"))?;
    let layout: MemoryLayout = raw
        .layout
        .parse()
        .map_err(|error| format!("case '{case_name}': {error}"))?;
    LayoutDesc::new(dtype, layout, raw.shape.clone())
        .map_err(|error| format!("case '{case_name}': {error}"))
}

/// Compact JSON view of a report, used by the report binary.
#[must_use]
pub fn report_summary(report: &HarnessReport) -> Value {
    json!({
        "suite": report.suite,
        "strict_mode": report.strict_mode,
        "fixture_count": report.fixture_count,
        "cases_total": report.cases_total,
        "cases_passed": report.cases_passed,
        "status": if report.is_green() { "ok" } else { "needs_attention" },
    })
}

fn load_fixture<T>(path: &Path) -> Result<T, String>
where
    T: for<'de> Deserialize<'de>,
{
    let metadata = fs::metadata(path).map_err(|error| {
        format!(
            "failed reading fixture metadata {}: {error}",
            path.display()
        )
    })?;
    let size = metadata.len();
    if size > MAX_FIXTURE_BYTES {
        return Err(format!(
            "fixture {} exceeds max bytes: actual={size} max={MAX_FIXTURE_BYTES}",
            path.display()
        ));
    }

    let raw = fs::read_to_string(path)
        .map_err(|error| format!("failed reading fixture {}: {error}", path.display()))?;
    serde_json::from_str::<T>(&raw)
        .map_err(|error| format!("failed parsing fixture {}: {error}", path.display()))
}

fn summarize_passes<I>(iter: I) -> (usize, usize)
where
    I: Iterator<Item = bool>,
{
    iter.fold((0, 0), |(total, passed), is_passed| {
        (total + 1, passed + usize::from(is_passed))
    })
}

#[cfg(test)]
mod tests {
    use fk_core::ExecutionMode;

    use super::{
        HarnessConfig, run_axis_conformance, run_gather_dispatch_conformance, summarize_passes,
    };

    #[test]
    fn summarize_counts_passes() {
        assert_eq!(summarize_passes([true, false, true].into_iter()), (3, 2));
        assert_eq!(summarize_passes(std::iter::empty()), (0, 0));
    }

    #[test]
    fn strict_axis_conformance_is_green() {
        let cfg = HarnessConfig::default_paths();
        let (report, cases) =
            run_axis_conformance(&cfg, ExecutionMode::Strict).expect("axis fixture should run");
        assert_eq!(report.cases_total, cases.len());
        let failing: Vec<&str> = cases
            .iter()
            .filter(|case| !case.passed())
            .map(|case| case.name.as_str())
            .collect();
        assert!(failing.is_empty(), "failing axis cases: {failing:?}");
    }

    #[test]
    fn gather_dispatch_conformance_is_green_in_both_modes() {
        let cfg = HarnessConfig::default_paths();
        for mode in [ExecutionMode::Strict, ExecutionMode::Hardened] {
            let (report, cases) = run_gather_dispatch_conformance(&cfg, mode)
                .expect("gather fixture should run");
            let failing: Vec<&str> = cases
                .iter()
                .filter(|case| !case.passed())
                .map(|case| case.name.as_str())
                .collect();
            assert!(failing.is_empty(), "failing gather cases ({mode:?}): {failing:?}");
            assert!(report.is_green());
        }
    }

    #[test]
    fn missing_fixture_root_is_reported() {
        let cfg = HarnessConfig {
            fixture_root: "does/not/exist".into(),
            strict_mode: true,
        };
        let err = run_axis_conformance(&cfg, ExecutionMode::Strict)
            .expect_err("missing fixture must fail");
        assert!(err.contains("axis_cases.json"));
    }
}

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

const EPSILON: f64 = 1e-9;

/// Competency percentages of a subject must sum to this.
pub const FULL_PERCENTAGE: f64 = 100.0;
/// Slack allowed when comparing a percentage total against 100.
pub const PERCENTAGE_TOLERANCE: f64 = 1e-6;

/// Whether a subject's competency percentages add up to 100.
pub fn percentages_complete(total: f64) -> bool {
    (total - FULL_PERCENTAGE).abs() <= PERCENTAGE_TOLERANCE
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreState {
    NoMark,
    Zero,
    Scored(f64),
}

impl ScoreState {
    pub fn from_row(status: &str, raw_value: Option<f64>) -> Self {
        match status {
            "no_mark" => ScoreState::NoMark,
            "zero" => ScoreState::Zero,
            "scored" => ScoreState::Scored(raw_value.unwrap_or(0.0)),
            _ => raw_value
                .map(ScoreState::Scored)
                .unwrap_or(ScoreState::NoMark),
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            ScoreState::NoMark => "no_mark",
            ScoreState::Zero => "zero",
            ScoreState::Scored(_) => "scored",
        }
    }

    pub fn raw_value(&self) -> Option<f64> {
        match self {
            ScoreState::Scored(v) => Some(*v),
            _ => None,
        }
    }
}

/// 1-decimal rounding used for every reported intermediate average:
/// `Int(10*x + 0.5) / 10`
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

/// Half-up rounding to `decimals` places (0 yields whole grades).
pub fn round_half_up(x: f64, decimals: u32) -> f64 {
    let scale = 10_f64.powi(decimals as i32);
    // Nudge by epsilon so 50.5 stored as 50.4999999 still rounds up.
    ((x * scale) + 0.5 + EPSILON).floor() / scale
}

pub fn percent_of(raw: f64, out_of: f64) -> f64 {
    if out_of > 0.0 {
        100.0 * raw / out_of
    } else {
        0.0
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

fn compute_median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[(n / 2) - 1] + sorted[n / 2]) / 2.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivityAverage {
    pub avg_raw: f64,
    pub avg_percent: f64,
    pub scored_count: usize,
    pub zero_count: usize,
    pub no_mark_count: usize,
}

pub fn activity_average<I>(scores: I, out_of: f64) -> ActivityAverage
where
    I: IntoIterator<Item = ScoreState>,
{
    let mut denom: usize = 0;
    let mut sum_raw: f64 = 0.0;
    let mut scored_count: usize = 0;
    let mut zero_count: usize = 0;
    let mut no_mark_count: usize = 0;

    for s in scores {
        match s {
            ScoreState::NoMark => {
                no_mark_count += 1;
            }
            ScoreState::Zero => {
                zero_count += 1;
                denom += 1;
            }
            ScoreState::Scored(v) => {
                scored_count += 1;
                denom += 1;
                sum_raw += v;
            }
        }
    }

    let avg_raw = if denom > 0 {
        sum_raw / (denom as f64)
    } else {
        0.0
    };

    ActivityAverage {
        avg_raw,
        avg_percent: percent_of(avg_raw, out_of),
        scored_count,
        zero_count,
        no_mark_count,
    }
}

#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    fn db(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingScorePolicy {
    Exclude,
    Zero,
}

impl MissingScorePolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exclude" => Some(Self::Exclude),
            "zero" => Some(Self::Zero),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingPolicy {
    pub pass_mark: f64,
    pub retake_min: f64,
    pub max_score: f64,
    pub missing_score_policy: MissingScorePolicy,
    pub rounding_decimals: u32,
}

impl Default for GradingPolicy {
    fn default() -> Self {
        Self {
            pass_mark: 51.0,
            retake_min: 40.0,
            max_score: 100.0,
            missing_score_policy: MissingScorePolicy::Exclude,
            rounding_decimals: 0,
        }
    }
}

impl GradingPolicy {
    pub fn in_retake_band(&self, grade: f64) -> bool {
        grade >= self.retake_min && grade < self.pass_mark
    }

    fn resolve_missing(&self, state: Option<ScoreState>) -> (ScoreState, bool) {
        match state {
            Some(s) => (s, false),
            None => match self.missing_score_policy {
                MissingScorePolicy::Exclude => (ScoreState::NoMark, true),
                MissingScorePolicy::Zero => (ScoreState::Zero, true),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GradeStatus {
    Approved,
    Retake,
    Failed,
    NoData,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalOutcome {
    pub partial_final: Option<f64>,
    pub second_turn: Option<f64>,
    pub second_turn_applied: bool,
    pub final_grade: Option<f64>,
    pub status: GradeStatus,
}

/// Applies the retake adjustment and pass/fail thresholds to a partial final.
pub fn resolve_final(
    partial_final: Option<f64>,
    second_turn: Option<f64>,
    policy: &GradingPolicy,
) -> FinalOutcome {
    let Some(partial) = partial_final else {
        return FinalOutcome {
            partial_final: None,
            second_turn,
            second_turn_applied: false,
            final_grade: None,
            status: GradeStatus::NoData,
        };
    };

    let (final_grade, applied) = match second_turn {
        Some(extra) if policy.in_retake_band(partial) => (
            round_half_up(
                (partial + extra).min(policy.max_score),
                policy.rounding_decimals,
            ),
            true,
        ),
        _ => (partial, false),
    };

    let status = if final_grade >= policy.pass_mark {
        GradeStatus::Approved
    } else if !applied && policy.in_retake_band(final_grade) {
        GradeStatus::Retake
    } else {
        GradeStatus::Failed
    };

    FinalOutcome {
        partial_final: Some(partial),
        second_turn,
        second_turn_applied: applied,
        final_grade: Some(final_grade),
        status,
    }
}

/// Rejects a competency percentage that would push the subject past 100%.
/// `others_total` is the sum of every other competency in the subject.
pub fn check_percentage_headroom(others_total: f64, requested: f64) -> Result<(), CalcError> {
    if !(requested > 0.0 && requested <= FULL_PERCENTAGE) {
        return Err(
            CalcError::new("bad_params", "percentage must be > 0 and <= 100")
                .with_details(serde_json::json!({ "percentage": requested })),
        );
    }
    if others_total + requested > FULL_PERCENTAGE + PERCENTAGE_TOLERANCE {
        let remaining = (FULL_PERCENTAGE - others_total).max(0.0);
        return Err(CalcError::new(
            "percentage_exceeded",
            format!(
                "competency percentages would total {}% (only {}% remaining)",
                others_total + requested,
                remaining
            ),
        )
        .with_details(serde_json::json!({
            "currentTotal": others_total,
            "requested": requested,
            "remaining": remaining,
        })));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ActivityNode {
    pub id: String,
    pub title: String,
    pub out_of: f64,
}

#[derive(Debug, Clone)]
pub struct EvidenceNode {
    pub id: String,
    pub name: String,
    pub activities: Vec<ActivityNode>,
}

#[derive(Debug, Clone)]
pub struct CriterionNode {
    pub id: String,
    pub name: String,
    pub weight: f64,
    pub evidences: Vec<EvidenceNode>,
}

#[derive(Debug, Clone)]
pub struct CompetencyNode {
    pub id: String,
    pub name: String,
    pub percentage: f64,
    pub criteria: Vec<CriterionNode>,
}

/// The evaluation hierarchy of one subject, in display order.
#[derive(Debug, Clone, Default)]
pub struct GradeTree {
    pub competencies: Vec<CompetencyNode>,
}

impl GradeTree {
    pub fn percentage_total(&self) -> f64 {
        self.competencies.iter().map(|c| c.percentage).sum()
    }

    pub fn activities(&self) -> impl Iterator<Item = (&EvidenceNode, &ActivityNode)> {
        self.competencies
            .iter()
            .flat_map(|c| c.criteria.iter())
            .flat_map(|cr| cr.evidences.iter())
            .flat_map(|ev| ev.activities.iter().map(move |a| (ev, a)))
    }
}

/// Recorded scores keyed by student, then activity.
#[derive(Debug, Clone, Default)]
pub struct ScoreBook {
    by_student: HashMap<String, HashMap<String, ScoreState>>,
}

impl ScoreBook {
    pub fn insert(&mut self, activity_id: &str, student_id: &str, state: ScoreState) {
        self.by_student
            .entry(student_id.to_string())
            .or_default()
            .insert(activity_id.to_string(), state);
    }

    pub fn get(&self, activity_id: &str, student_id: &str) -> Option<ScoreState> {
        self.by_student
            .get(student_id)
            .and_then(|m| m.get(activity_id))
            .copied()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceGrade {
    pub evidence_id: String,
    pub name: String,
    pub average: Option<f64>,
    pub counted: usize,
    pub excluded: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CriterionGrade {
    pub criterion_id: String,
    pub name: String,
    pub weight: f64,
    pub average: Option<f64>,
    pub evidences: Vec<EvidenceGrade>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompetencyGrade {
    pub competency_id: String,
    pub name: String,
    pub percentage: f64,
    pub average: Option<f64>,
    pub contribution: f64,
    pub criteria: Vec<CriterionGrade>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreCounts {
    pub scored: usize,
    pub zero: usize,
    pub no_mark: usize,
    pub missing: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRollup {
    pub competencies: Vec<CompetencyGrade>,
    pub partial_final: Option<f64>,
    pub counts: ScoreCounts,
}

/// Rolls one student's activity scores up through evidence, criterion and
/// competency into a partial final. Reported averages are rounded to one
/// decimal; the roll-up itself carries unrounded values.
pub fn rollup_student(
    tree: &GradeTree,
    scores: &ScoreBook,
    student_id: &str,
    policy: &GradingPolicy,
) -> StudentRollup {
    let mut counts = ScoreCounts::default();
    let mut competencies = Vec::with_capacity(tree.competencies.len());
    let mut final_sum = 0.0_f64;

    for comp in &tree.competencies {
        let mut criteria = Vec::with_capacity(comp.criteria.len());
        let mut comp_sum = 0.0_f64;
        let mut comp_denom = 0.0_f64;

        for crit in &comp.criteria {
            let mut evidences = Vec::with_capacity(crit.evidences.len());
            let mut evidence_avgs: Vec<f64> = Vec::new();

            for ev in &crit.evidences {
                let mut percents: Vec<f64> = Vec::new();
                let mut excluded = 0_usize;
                for a in &ev.activities {
                    let (state, missing) = policy.resolve_missing(scores.get(&a.id, student_id));
                    if missing {
                        counts.missing += 1;
                    }
                    match state {
                        ScoreState::NoMark => {
                            if !missing {
                                counts.no_mark += 1;
                            }
                            excluded += 1;
                        }
                        ScoreState::Zero => {
                            if !missing {
                                counts.zero += 1;
                            }
                            percents.push(0.0);
                        }
                        ScoreState::Scored(v) => {
                            counts.scored += 1;
                            percents.push(percent_of(v, a.out_of));
                        }
                    }
                }

                let avg = mean(&percents);
                if let Some(v) = avg {
                    evidence_avgs.push(v);
                }
                evidences.push(EvidenceGrade {
                    evidence_id: ev.id.clone(),
                    name: ev.name.clone(),
                    average: avg.map(round_off_1_decimal),
                    counted: percents.len(),
                    excluded,
                });
            }

            let crit_avg = mean(&evidence_avgs);
            if let Some(v) = crit_avg {
                let w = if crit.weight > 0.0 { crit.weight } else { 1.0 };
                comp_sum += v * w;
                comp_denom += w;
            }
            criteria.push(CriterionGrade {
                criterion_id: crit.id.clone(),
                name: crit.name.clone(),
                weight: crit.weight,
                average: crit_avg.map(round_off_1_decimal),
                evidences,
            });
        }

        let comp_avg = if comp_denom > 0.0 {
            Some(comp_sum / comp_denom)
        } else {
            None
        };
        let contribution = comp_avg.map(|v| v * comp.percentage / 100.0).unwrap_or(0.0);
        final_sum += contribution;
        competencies.push(CompetencyGrade {
            competency_id: comp.id.clone(),
            name: comp.name.clone(),
            percentage: comp.percentage,
            average: comp_avg.map(round_off_1_decimal),
            contribution: round_off_1_decimal(contribution),
            criteria,
        });
    }

    let any_counted = competencies
        .iter()
        .flat_map(|c| c.criteria.iter())
        .flat_map(|cr| cr.evidences.iter())
        .any(|ev| ev.counted > 0);
    let partial_final = if any_counted {
        Some(round_half_up(
            final_sum * policy.max_score / 100.0,
            policy.rounding_decimals,
        ))
    } else {
        None
    };

    StudentRollup {
        competencies,
        partial_final,
        counts,
    }
}

#[derive(Debug, Clone)]
pub struct RosterStudent {
    pub id: String,
    pub display_name: String,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectRef {
    pub id: String,
    pub semester_id: String,
    pub code: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityStats {
    pub activity_id: String,
    pub evidence_id: String,
    pub title: String,
    pub out_of: f64,
    pub avg_raw: f64,
    pub avg_percent: f64,
    pub median_percent: f64,
    pub scored_count: usize,
    pub zero_count: usize,
    pub no_mark_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompetencyStats {
    pub competency_id: String,
    pub name: String,
    pub percentage: f64,
    pub class_average: Option<f64>,
    pub student_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentGrade {
    pub student_id: String,
    pub display_name: String,
    pub active: bool,
    #[serde(flatten)]
    pub outcome: FinalOutcome,
    pub counts: ScoreCounts,
    pub competencies: Vec<CompetencyGrade>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusTotals {
    pub approved: usize,
    pub retake: usize,
    pub failed: usize,
    pub no_data: usize,
    pub class_average: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryModel {
    pub subject: SubjectRef,
    pub policy: GradingPolicy,
    pub percentage_total: f64,
    pub per_activity: Vec<ActivityStats>,
    pub per_competency: Vec<CompetencyStats>,
    pub per_student: Vec<StudentGrade>,
    pub totals: StatusTotals,
}

/// Everything the subject summary needs, already loaded.
pub struct SubjectData {
    pub subject: SubjectRef,
    pub tree: GradeTree,
    pub roster: Vec<RosterStudent>,
    pub scores: ScoreBook,
    pub second_turns: HashMap<String, f64>,
}

pub fn summarize_subject(data: &SubjectData, policy: &GradingPolicy) -> SummaryModel {
    let mut per_activity = Vec::new();
    for (ev, a) in data.tree.activities() {
        let mut states = Vec::new();
        let mut median_values = Vec::new();
        for s in data.roster.iter().filter(|s| s.active) {
            let (state, _) = policy.resolve_missing(data.scores.get(&a.id, &s.id));
            match state {
                ScoreState::NoMark => {}
                ScoreState::Zero => median_values.push(0.0),
                ScoreState::Scored(v) => median_values.push(percent_of(v, a.out_of)),
            }
            states.push(state);
        }
        let stats = activity_average(states, a.out_of);
        per_activity.push(ActivityStats {
            activity_id: a.id.clone(),
            evidence_id: ev.id.clone(),
            title: a.title.clone(),
            out_of: a.out_of,
            avg_raw: round_off_1_decimal(stats.avg_raw),
            avg_percent: round_off_1_decimal(stats.avg_percent),
            median_percent: round_off_1_decimal(compute_median(&median_values)),
            scored_count: stats.scored_count,
            zero_count: stats.zero_count,
            no_mark_count: stats.no_mark_count,
        });
    }

    let mut per_student = Vec::with_capacity(data.roster.len());
    let mut totals = StatusTotals::default();
    let mut final_sum = 0.0_f64;
    let mut final_count = 0_usize;
    // competency id -> (sum of averages, students with a value)
    let mut comp_totals: HashMap<String, (f64, usize)> = HashMap::new();

    for s in &data.roster {
        let rollup = rollup_student(&data.tree, &data.scores, &s.id, policy);
        let outcome = resolve_final(
            rollup.partial_final,
            data.second_turns.get(&s.id).copied(),
            policy,
        );

        if s.active {
            match outcome.status {
                GradeStatus::Approved => totals.approved += 1,
                GradeStatus::Retake => totals.retake += 1,
                GradeStatus::Failed => totals.failed += 1,
                GradeStatus::NoData => totals.no_data += 1,
            }
            if let Some(g) = outcome.final_grade {
                final_sum += g;
                final_count += 1;
            }
            for c in &rollup.competencies {
                if let Some(avg) = c.average {
                    let entry = comp_totals.entry(c.competency_id.clone()).or_insert((0.0, 0));
                    entry.0 += avg;
                    entry.1 += 1;
                }
            }
        }

        per_student.push(StudentGrade {
            student_id: s.id.clone(),
            display_name: s.display_name.clone(),
            active: s.active,
            outcome,
            counts: rollup.counts,
            competencies: rollup.competencies,
        });
    }

    if final_count > 0 {
        totals.class_average = Some(round_off_1_decimal(final_sum / final_count as f64));
    }

    let per_competency = data
        .tree
        .competencies
        .iter()
        .map(|c| {
            let (sum, n) = comp_totals.get(&c.id).copied().unwrap_or((0.0, 0));
            CompetencyStats {
                competency_id: c.id.clone(),
                name: c.name.clone(),
                percentage: c.percentage,
                class_average: if n > 0 {
                    Some(round_off_1_decimal(sum / n as f64))
                } else {
                    None
                },
                student_count: n,
            }
        })
        .collect();

    SummaryModel {
        subject: data.subject.clone(),
        policy: policy.clone(),
        percentage_total: data.tree.percentage_total(),
        per_activity,
        per_competency,
        per_student,
        totals,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialLevel {
    Evidence,
    Criterion,
    Competency,
    Final,
}

impl PartialLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Evidence => "evidence",
            Self::Criterion => "criterion",
            Self::Competency => "competency",
            Self::Final => "final",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "evidence" => Some(Self::Evidence),
            "criterion" => Some(Self::Criterion),
            "competency" => Some(Self::Competency),
            "final" => Some(Self::Final),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartialAverage {
    pub student_id: String,
    pub level: PartialLevel,
    pub entity_id: String,
    pub value: Option<f64>,
}

/// Flattens a student's roll-up into one row per level entity. The final
/// row is keyed by the subject id and carries the post-retake grade.
pub fn partial_averages(grade: &StudentGrade, subject_id: &str) -> Vec<PartialAverage> {
    let mut out = Vec::new();
    for c in &grade.competencies {
        for cr in &c.criteria {
            for ev in &cr.evidences {
                out.push(PartialAverage {
                    student_id: grade.student_id.clone(),
                    level: PartialLevel::Evidence,
                    entity_id: ev.evidence_id.clone(),
                    value: ev.average,
                });
            }
            out.push(PartialAverage {
                student_id: grade.student_id.clone(),
                level: PartialLevel::Criterion,
                entity_id: cr.criterion_id.clone(),
                value: cr.average,
            });
        }
        out.push(PartialAverage {
            student_id: grade.student_id.clone(),
            level: PartialLevel::Competency,
            entity_id: c.competency_id.clone(),
            value: c.average,
        });
    }
    out.push(PartialAverage {
        student_id: grade.student_id.clone(),
        level: PartialLevel::Final,
        entity_id: subject_id.to_string(),
        value: grade.outcome.final_grade,
    });
    out
}

pub struct CalcContext<'a> {
    pub conn: &'a Connection,
    pub subject_id: &'a str,
}

pub fn load_subject_ref(conn: &Connection, subject_id: &str) -> Result<SubjectRef, CalcError> {
    let row: Option<(String, Option<String>, String)> = conn
        .query_row(
            "SELECT semester_id, code, name FROM subjects WHERE id = ?",
            [subject_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(CalcError::db)?;
    let Some((semester_id, code, name)) = row else {
        return Err(CalcError::new("not_found", "subject not found"));
    };
    Ok(SubjectRef {
        id: subject_id.to_string(),
        semester_id,
        code,
        name,
    })
}

pub fn load_grade_tree(conn: &Connection, subject_id: &str) -> Result<GradeTree, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT a.id, a.evidence_id, a.title, a.out_of
             FROM activities a
             JOIN evidences ev ON ev.id = a.evidence_id
             JOIN criteria cr ON cr.id = ev.criterion_id
             JOIN competencies c ON c.id = cr.competency_id
             WHERE c.subject_id = ?
             ORDER BY a.sort_order",
        )
        .map_err(CalcError::db)?;
    let mut activities_by_evidence: HashMap<String, Vec<ActivityNode>> = HashMap::new();
    let rows = stmt
        .query_map([subject_id], |r| {
            Ok((
                r.get::<_, String>(1)?,
                ActivityNode {
                    id: r.get(0)?,
                    title: r.get(2)?,
                    out_of: r.get(3)?,
                },
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::db)?;
    for (evidence_id, node) in rows {
        activities_by_evidence.entry(evidence_id).or_default().push(node);
    }

    let mut stmt = conn
        .prepare(
            "SELECT ev.id, ev.criterion_id, ev.name
             FROM evidences ev
             JOIN criteria cr ON cr.id = ev.criterion_id
             JOIN competencies c ON c.id = cr.competency_id
             WHERE c.subject_id = ?
             ORDER BY ev.sort_order",
        )
        .map_err(CalcError::db)?;
    let rows = stmt
        .query_map([subject_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::db)?;
    let mut evidences_by_criterion: HashMap<String, Vec<EvidenceNode>> = HashMap::new();
    for (id, criterion_id, name) in rows {
        let activities = activities_by_evidence.remove(&id).unwrap_or_default();
        evidences_by_criterion
            .entry(criterion_id)
            .or_default()
            .push(EvidenceNode {
                id,
                name,
                activities,
            });
    }

    let mut stmt = conn
        .prepare(
            "SELECT cr.id, cr.competency_id, cr.name, cr.weight
             FROM criteria cr
             JOIN competencies c ON c.id = cr.competency_id
             WHERE c.subject_id = ?
             ORDER BY cr.sort_order",
        )
        .map_err(CalcError::db)?;
    let rows = stmt
        .query_map([subject_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, f64>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::db)?;
    let mut criteria_by_competency: HashMap<String, Vec<CriterionNode>> = HashMap::new();
    for (id, competency_id, name, weight) in rows {
        let evidences = evidences_by_criterion.remove(&id).unwrap_or_default();
        criteria_by_competency
            .entry(competency_id)
            .or_default()
            .push(CriterionNode {
                id,
                name,
                weight,
                evidences,
            });
    }

    let mut stmt = conn
        .prepare(
            "SELECT id, name, percentage
             FROM competencies
             WHERE subject_id = ?
             ORDER BY sort_order",
        )
        .map_err(CalcError::db)?;
    let rows = stmt
        .query_map([subject_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, f64>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::db)?;
    let competencies = rows
        .into_iter()
        .map(|(id, name, percentage)| {
            let criteria = criteria_by_competency.remove(&id).unwrap_or_default();
            CompetencyNode {
                id,
                name,
                percentage,
                criteria,
            }
        })
        .collect();

    Ok(GradeTree { competencies })
}

fn load_roster(conn: &Connection, subject_id: &str) -> Result<Vec<RosterStudent>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.last_name, s.first_name, s.active
             FROM enrollments e
             JOIN students s ON s.id = e.student_id
             WHERE e.subject_id = ?
             ORDER BY s.last_name, s.first_name, s.id",
        )
        .map_err(CalcError::db)?;
    let roster = stmt
        .query_map([subject_id], |r| {
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            Ok(RosterStudent {
                id: r.get(0)?,
                display_name: format!("{}, {}", last, first),
                active: r.get::<_, i64>(3)? != 0,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::db)?;
    Ok(roster)
}

fn load_scores(conn: &Connection, subject_id: &str) -> Result<ScoreBook, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT sc.activity_id, sc.student_id, sc.raw_value, sc.status
             FROM scores sc
             JOIN activities a ON a.id = sc.activity_id
             JOIN evidences ev ON ev.id = a.evidence_id
             JOIN criteria cr ON cr.id = ev.criterion_id
             JOIN competencies c ON c.id = cr.competency_id
             WHERE c.subject_id = ?",
        )
        .map_err(CalcError::db)?;
    let rows = stmt
        .query_map([subject_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<f64>>(2)?,
                r.get::<_, String>(3)?,
            ))
        })
        .map_err(CalcError::db)?;

    let mut book = ScoreBook::default();
    for row in rows {
        let (activity_id, student_id, raw_value, status) = row.map_err(CalcError::db)?;
        book.insert(
            &activity_id,
            &student_id,
            ScoreState::from_row(&status, raw_value),
        );
    }
    Ok(book)
}

fn load_second_turns(conn: &Connection, subject_id: &str) -> Result<HashMap<String, f64>, CalcError> {
    let mut stmt = conn
        .prepare("SELECT student_id, score FROM second_turns WHERE subject_id = ?")
        .map_err(CalcError::db)?;
    let rows = stmt
        .query_map([subject_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
        })
        .and_then(|it| it.collect::<Result<HashMap<_, _>, _>>())
        .map_err(CalcError::db)?;
    Ok(rows)
}

pub fn load_subject_data(ctx: &CalcContext<'_>) -> Result<SubjectData, CalcError> {
    let subject = load_subject_ref(ctx.conn, ctx.subject_id)?;
    Ok(SubjectData {
        subject,
        tree: load_grade_tree(ctx.conn, ctx.subject_id)?,
        roster: load_roster(ctx.conn, ctx.subject_id)?,
        scores: load_scores(ctx.conn, ctx.subject_id)?,
        second_turns: load_second_turns(ctx.conn, ctx.subject_id)?,
    })
}

pub fn compute_subject_summary(
    ctx: &CalcContext<'_>,
    policy: &GradingPolicy,
) -> Result<SummaryModel, CalcError> {
    let data = load_subject_data(ctx)?;
    Ok(summarize_subject(&data, policy))
}

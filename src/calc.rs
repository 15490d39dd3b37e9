use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Wire rounding for averages: 2 decimals, half away from zero.
pub fn round_off_2_decimals(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Raw sum of the four sub-scores. No rounding.
pub fn final_score(quiz: f64, assignment: f64, participation: f64, test: f64) -> f64 {
    quiz + assignment + participation + test
}

/// Arithmetic mean over final scores. Returns 0.0 for an empty slice; callers
/// must treat 0 as "no data recorded", which is indistinguishable from a
/// genuine zero score.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / (values.len() as f64)
}

/// Qualitative band for a score in [0, 100]. Total over the real line:
/// anything outside the table falls through to "Invalid Score".
pub fn classify(score: f64) -> &'static str {
    if score < 0.0 {
        "Invalid Score"
    } else if score < 60.0 {
        "Needs Serious Improvement"
    } else if (60.0..=69.0).contains(&score) {
        "Need Improvement"
    } else if (70.0..=79.0).contains(&score) {
        "You can do better than this"
    } else if (80.0..=84.0).contains(&score) {
        "Very Good"
    } else if (85.0..=89.0).contains(&score) {
        "Very Very Good"
    } else if (90.0..=100.0).contains(&score) {
        "Excitement - Principal List"
    } else {
        "Invalid Score"
    }
}

/// Dense tie-aware class rank with SQL RANK() semantics: equal metric values
/// share a rank and the next distinct value's rank is its 1-based position in
/// the descending order, so gaps appear after ties ([95, 95, 80] -> 1, 1, 3).
/// Deterministic for identical inputs (secondary order by id).
pub fn rank_dense(scores: &[(String, f64)]) -> HashMap<String, i64> {
    let mut sorted: Vec<&(String, f64)> = scores.iter().collect();
    sorted.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });

    let mut ranks = HashMap::with_capacity(sorted.len());
    let mut prev: Option<f64> = None;
    let mut rank = 1_i64;
    for (i, (id, value)) in sorted.iter().enumerate() {
        if prev != Some(*value) {
            rank = (i as i64) + 1;
            prev = Some(*value);
        }
        ranks.insert(id.clone(), rank);
    }
    ranks
}

pub const SEMESTER_ONE_PERIODS: [&str; 4] = ["Period 1", "Period 2", "Period 3", "Exam"];
pub const SEMESTER_TWO_PERIODS: [&str; 4] = ["Period 4", "Period 5", "Period 6", "Examm"];

/// Period names making up a semester window, or None for an unknown semester.
pub fn semester_periods(semester: i64) -> Option<&'static [&'static str; 4]> {
    match semester {
        1 => Some(&SEMESTER_ONE_PERIODS),
        2 => Some(&SEMESTER_TWO_PERIODS),
        _ => None,
    }
}

/// Unweighted mean of the two semester averages. This one is an
/// average-of-averages on purpose: two fixed halves of the year, independent
/// of how many periods each semester carries.
pub fn yearly_average(first_semester_avg: f64, second_semester_avg: f64) -> f64 {
    (first_semester_avg + second_semester_avg) / 2.0
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectLine {
    pub subject_name: String,
    pub final_score: f64,
}

/// Per-subject display lines for one student+period. Lazy over the fetched
/// rows; restartable by calling again on the same slice.
pub fn subject_lines<'a>(rows: &'a [(String, f64)]) -> impl Iterator<Item = SubjectLine> + 'a {
    rows.iter().map(|(subject_name, score)| SubjectLine {
        subject_name: subject_name.clone(),
        final_score: *score,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportStudent {
    pub student_id: String,
    pub student_name: String,
    pub average: f64,
    pub remark: &'static str,
    pub rank: i64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct HonorGroups {
    #[serde(rename = "Principal's List (90-100)")]
    pub principals_list: Vec<ReportStudent>,
    #[serde(rename = "High Honor Roll (85-89)")]
    pub high_honor_roll: Vec<ReportStudent>,
    #[serde(rename = "Honor Roll (80-84)")]
    pub honor_roll: Vec<ReportStudent>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcademicReport {
    pub grade_class: String,
    pub period: String,
    pub honor_students: Vec<ReportStudent>,
    pub delinquent_students: Vec<ReportStudent>,
    pub total_honor_students: usize,
    pub total_delinquent_students: usize,
    pub honor_groups: HonorGroups,
    pub top_honor_student: Option<ReportStudent>,
}

/// Honor/delinquent composition for one class+period over published averages.
/// `rows` is one (student_id, student_name, average) entry per student, already
/// collapsed to the latest-created row per student.
///
/// Honor students are re-ranked sequentially 1..N after the descending sort.
/// This is deliberately not the tie-aware policy used for class ranks: the
/// honor view ranks only its own subset for presentation.
pub fn compose_academic_report(
    grade_class: String,
    period: String,
    rows: Vec<(String, String, f64)>,
) -> AcademicReport {
    let mut honor_students: Vec<ReportStudent> = Vec::new();
    let mut delinquent_students: Vec<ReportStudent> = Vec::new();

    for (idx, (student_id, student_name, average)) in rows.into_iter().enumerate() {
        let average = round_off_2_decimals(average);
        let student = ReportStudent {
            student_id,
            student_name,
            average,
            remark: classify(average),
            rank: (idx as i64) + 1,
        };
        if average >= 80.0 {
            honor_students.push(student);
        } else if average < 70.0 {
            delinquent_students.push(student);
        }
    }

    honor_students.sort_by(|a, b| {
        b.average
            .partial_cmp(&a.average)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.student_id.cmp(&b.student_id))
    });
    for (idx, student) in honor_students.iter_mut().enumerate() {
        student.rank = (idx as i64) + 1;
    }

    let mut honor_groups = HonorGroups::default();
    for student in &honor_students {
        if student.average >= 90.0 {
            honor_groups.principals_list.push(student.clone());
        } else if (85.0..=89.0).contains(&student.average) {
            honor_groups.high_honor_roll.push(student.clone());
        } else if (80.0..=84.0).contains(&student.average) {
            honor_groups.honor_roll.push(student.clone());
        }
    }

    let top_honor_student = honor_students.first().cloned();
    AcademicReport {
        grade_class,
        period,
        total_honor_students: honor_students.len(),
        total_delinquent_students: delinquent_students.len(),
        honor_students,
        delinquent_students,
        honor_groups,
        top_honor_student,
    }
}

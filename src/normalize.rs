use std::collections::BTreeMap;
use std::sync::LazyLock;

use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{NormalizeError, SubjectParseError};
use crate::record::{WideRecord, SCHEMA};

// "137(A-)" → 137, "A-"
static SCORE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{2,3})\(([^)]*)\)").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectMark {
    pub name: String,
    pub score: u32,
    pub grade: String,
}

/// Exam the records belong to; part of the storage key.
#[derive(Debug, Clone)]
pub struct ExamContext {
    pub exam_type: String,
    pub year: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanonicalRecord {
    pub roll_number: String,
    pub student_name: String,
    pub institution_name: String,
    pub gpa: String,
    pub total_marks: u32,
    pub board: String,
    pub father_name: String,
    pub group_name: String,
    pub mother_name: String,
    pub session_year: String,
    pub registration_id: String,
    pub student_type: String,
    pub date_of_birth: String,
    pub exam_type: String,
    pub year: String,
    pub subject_marks: BTreeMap<String, SubjectMark>,
}

pub fn parse_score_token(code: &str, token: &str) -> Result<(u32, String), SubjectParseError> {
    let err = || SubjectParseError {
        code: code.to_string(),
        token: token.to_string(),
    };
    let caps = SCORE_RE.captures(token.trim()).ok_or_else(err)?;
    let score = caps[1].parse::<u32>().map_err(|_| err())?;
    Ok((score, caps[2].trim().to_string()))
}

/// Subject triples from the schema's subject offset onward, plus the total of parsed scores.
///
/// An unparseable score skips that subject only.
pub fn parse_subjects(columns: &[String]) -> (BTreeMap<String, SubjectMark>, u32) {
    let mut marks = BTreeMap::new();
    let mut total = 0u32;
    let mut i = SCHEMA.subject_offset;
    while i + SCHEMA.subject_width <= columns.len() {
        let code = columns[i].trim();
        let name = columns[i + 1].trim();
        let token = columns[i + 2].trim();
        i += SCHEMA.subject_width;

        // padding
        if code.is_empty() && name.is_empty() && token.is_empty() {
            continue;
        }
        match parse_score_token(code, token) {
            Ok((score, grade)) => {
                total += score;
                marks.insert(
                    code.to_string(),
                    SubjectMark {
                        name: name.to_string(),
                        score,
                        grade,
                    },
                );
            }
            Err(e) => debug!("Skipping subject: {}", e),
        }
    }
    (marks, total)
}

pub fn normalize_columns(
    columns: &[String],
    exam: &ExamContext,
) -> Result<CanonicalRecord, NormalizeError> {
    if columns.len() < SCHEMA.subject_offset {
        return Err(NormalizeError::TooFewColumns {
            found: columns.len(),
            needed: SCHEMA.subject_offset,
        });
    }
    let col = |name: &str| -> String {
        SCHEMA
            .column_index(name)
            .and_then(|i| columns.get(i))
            .map(|v| v.trim().to_string())
            .unwrap_or_default()
    };

    let roll_number = col("Roll No");
    if roll_number.is_empty() || !roll_number.chars().all(|c| c.is_ascii_digit()) {
        return Err(NormalizeError::BadRoll(roll_number));
    }
    let (subject_marks, total_marks) = parse_subjects(columns);

    Ok(CanonicalRecord {
        roll_number,
        student_name: col("Name"),
        institution_name: col("Institute").replace('"', ""),
        gpa: col("Result").replace("GPA=", "").trim().to_string(),
        total_marks,
        board: col("Board"),
        father_name: col("Father's Name"),
        group_name: col("Group"),
        mother_name: col("Mother's Name"),
        session_year: col("Session"),
        registration_id: col("Reg. NO"),
        student_type: col("Type"),
        date_of_birth: col("DATE OF BIRTH"),
        exam_type: exam.exam_type.clone(),
        year: exam.year.clone(),
        subject_marks,
    })
}

pub fn normalize(record: &WideRecord, exam: &ExamContext) -> Result<CanonicalRecord, NormalizeError> {
    normalize_columns(&record.columns(), exam)
}

/// Normalize a whole store in parallel, keeping input order and skipping malformed rows.
pub fn normalize_all(records: &[WideRecord], exam: &ExamContext) -> Vec<CanonicalRecord> {
    records
        .par_iter()
        .filter_map(|r| match normalize(r, exam) {
            Ok(c) => Some(c),
            Err(e) => {
                warn!(roll = r.roll, "Skipping malformed record: {}", e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::sample_record;

    fn exam() -> ExamContext {
        ExamContext {
            exam_type: "SSC".into(),
            year: "2025".into(),
        }
    }

    #[test]
    fn score_tokens() {
        assert_eq!(parse_score_token("101", "137(A-)").unwrap(), (137, "A-".to_string()));
        assert_eq!(parse_score_token("101", "45(F)").unwrap(), (45, "F".to_string()));
        assert_eq!(parse_score_token("101", " 100(A+) ").unwrap(), (100, "A+".to_string()));
        assert!(parse_score_token("101", "N/A").is_err());
        assert!(parse_score_token("101", "A+").is_err());
        assert!(parse_score_token("101", "7(F)").is_err());
    }

    #[test]
    fn unparseable_subject_skipped_not_counted() {
        let r = sample_record(
            300001,
            "2213456789",
            &[
                ("101", "BANGLA-I", "137(A-)"),
                ("107", "ENGLISH-I", "45(F)"),
                ("136", "PHYSICS", "N/A"),
            ],
        );
        let c = normalize(&r, &exam()).unwrap();
        assert_eq!(c.total_marks, 182);
        assert_eq!(c.subject_marks.len(), 2);
        assert!(!c.subject_marks.contains_key("136"));
        assert_eq!(
            c.subject_marks["101"],
            SubjectMark {
                name: "BANGLA-I".into(),
                score: 137,
                grade: "A-".into()
            }
        );
    }

    #[test]
    fn general_fields_mapped_and_cleaned() {
        let c = normalize(&sample_record(300001, "2213456789", &[]), &exam()).unwrap();
        assert_eq!(c.roll_number, "300001");
        assert_eq!(c.student_name, "RAHIM UDDIN");
        assert_eq!(c.institution_name, "CHITTAGONG COLLEGIATE SCHOOL");
        assert_eq!(c.gpa, "5.00");
        assert_eq!(c.registration_id, "2213456789");
        assert_eq!(c.group_name, "SCIENCE");
        assert_eq!(c.date_of_birth, "01-01-2009");
        assert_eq!(c.total_marks, 0);
        assert_eq!(c.year, "2025");
    }

    #[test]
    fn trailing_partial_triple_ignored() {
        let mut cols = sample_record(5, "R", &[("101", "BANGLA-I", "80(A+)")]).columns();
        cols.push("107".into());
        cols.push("ENGLISH-I".into());
        let c = normalize_columns(&cols, &exam()).unwrap();
        assert_eq!(c.subject_marks.len(), 1);
        assert_eq!(c.total_marks, 80);
    }

    #[test]
    fn malformed_rows_rejected() {
        let short: Vec<String> = vec!["1".into(); 5];
        assert!(matches!(
            normalize_columns(&short, &exam()),
            Err(NormalizeError::TooFewColumns { found: 5, .. })
        ));
        let mut cols = sample_record(5, "R", &[]).columns();
        cols[0] = "Roll No".into();
        assert!(matches!(normalize_columns(&cols, &exam()), Err(NormalizeError::BadRoll(_))));
    }

    #[test]
    fn batch_keeps_input_order() {
        let rows = vec![
            sample_record(3, "C", &[("101", "B", "50(C)")]),
            sample_record(1, "A", &[("101", "B", "60(B)")]),
        ];
        let out = normalize_all(&rows, &exam());
        let rolls: Vec<_> = out.iter().map(|c| c.roll_number.as_str()).collect();
        assert_eq!(rolls, vec!["3", "1"]);
        assert_eq!(normalize_all(&rows, &exam()), out);
    }
}

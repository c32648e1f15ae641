use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Roll number of one examinee.
pub type Roll = u64;

pub const GENERAL_COLUMNS: [&str; 12] = [
    "Roll No",
    "Name",
    "Board",
    "Father's Name",
    "Group",
    "Mother's Name",
    "Session",
    "Reg. NO",
    "Type",
    "Institute",
    "Result",
    "DATE OF BIRTH",
];

/// Positional layout of a wide row. Bump `version` whenever the column order changes.
pub const SCHEMA: SchemaDescriptor = SchemaDescriptor {
    version: 1,
    general: &GENERAL_COLUMNS,
    subject_offset: 12,
    subject_width: 3,
};

#[derive(Debug, Clone, Copy)]
pub struct SchemaDescriptor {
    pub version: u32,
    pub general: &'static [&'static str],
    pub subject_offset: usize,
    pub subject_width: usize,
}

impl SchemaDescriptor {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.general.iter().position(|c| *c == name)
    }

    /// Header for a table holding up to `max_subjects` subject triples.
    pub fn header(&self, max_subjects: usize) -> Vec<String> {
        let mut header: Vec<String> = self.general.iter().map(|c| c.to_string()).collect();
        for i in 1..=max_subjects {
            header.push(format!("Subject_{}_Code", i));
            header.push(format!("Subject_{}_Name", i));
            header.push(format!("Subject_{}_Grade", i));
        }
        header
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectGrade {
    pub code: String,
    pub name: String,
    pub grade: String,
}

/// One harvested examinee, as written to the sink.
///
/// Each stored line names its own fields and schema version, so rows with
/// different subject counts can share one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WideRecord {
    pub schema_version: u32,
    pub roll: Roll,
    pub fields: BTreeMap<String, String>,
    pub subjects: Vec<SubjectGrade>,
    pub harvested_at: DateTime<Utc>,
}

impl WideRecord {
    /// Keeps only the general keys the schema knows about.
    pub fn new(roll: Roll, info: &BTreeMap<String, String>, subjects: Vec<SubjectGrade>) -> Self {
        let fields = SCHEMA.general[1..]
            .iter()
            .map(|key| (key.to_string(), info.get(*key).cloned().unwrap_or_default()))
            .collect();
        WideRecord {
            schema_version: SCHEMA.version,
            roll,
            fields,
            subjects,
            harvested_at: Utc::now(),
        }
    }

    pub fn field(&self, name: &str) -> &str {
        self.fields.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn registration_id(&self) -> &str {
        self.field("Reg. NO")
    }

    /// Name or Result missing means the lookup returned an empty shell.
    pub fn is_blank(&self) -> bool {
        self.field("Name").is_empty() || self.field("Result").is_empty()
    }

    /// Flatten into the positional layout described by [`SCHEMA`].
    pub fn columns(&self) -> Vec<String> {
        let mut cols = Vec::with_capacity(SCHEMA.subject_offset + self.subjects.len() * SCHEMA.subject_width);
        cols.push(self.roll.to_string());
        for key in &SCHEMA.general[1..] {
            cols.push(self.field(key).to_string());
        }
        for s in &self.subjects {
            cols.push(s.code.clone());
            cols.push(s.name.clone());
            cols.push(s.grade.clone());
        }
        cols
    }
}

#[cfg(test)]
pub(crate) fn sample_record(roll: Roll, reg: &str, subjects: &[(&str, &str, &str)]) -> WideRecord {
    let mut info = BTreeMap::new();
    info.insert("Name".to_string(), "RAHIM UDDIN".to_string());
    info.insert("Board".to_string(), "CHATTOGRAM".to_string());
    info.insert("Father's Name".to_string(), "KARIM UDDIN".to_string());
    info.insert("Group".to_string(), "SCIENCE".to_string());
    info.insert("Mother's Name".to_string(), "SALMA BEGUM".to_string());
    info.insert("Session".to_string(), "2022-2023".to_string());
    info.insert("Reg. NO".to_string(), reg.to_string());
    info.insert("Type".to_string(), "REGULAR".to_string());
    info.insert("Institute".to_string(), "\"CHITTAGONG COLLEGIATE SCHOOL\"".to_string());
    info.insert("Result".to_string(), "GPA=5.00".to_string());
    info.insert("DATE OF BIRTH".to_string(), "01-01-2009".to_string());
    let subjects = subjects
        .iter()
        .map(|(code, name, grade)| SubjectGrade {
            code: code.to_string(),
            name: name.to_string(),
            grade: grade.to_string(),
        })
        .collect();
    WideRecord::new(roll, &info, subjects)
}

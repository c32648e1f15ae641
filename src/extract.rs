use std::collections::BTreeMap;
use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};

use crate::record::SubjectGrade;

static INFO_TABLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("table.tftable").unwrap());
static SUBJECT_TABLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("table.tftable2").unwrap());
static ROW: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").unwrap());
static CELL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td").unwrap());

/// General info and subject grades pulled from one result page.
#[derive(Debug, Default)]
pub struct Extraction {
    pub info: BTreeMap<String, String>,
    pub subjects: Vec<SubjectGrade>,
    info_table: bool,
    subject_table: bool,
}

impl Extraction {
    /// Neither result table was on the page.
    pub fn is_structurally_absent(&self) -> bool {
        !self.info_table && !self.subject_table
    }
}

/// Parse a result page. Missing tables give empty output, never an error.
pub fn extract(html: &str) -> Extraction {
    let doc = Html::parse_document(html);
    let mut out = Extraction::default();

    if let Some(table) = doc.select(&INFO_TABLE).next() {
        out.info_table = true;
        for row in table.select(&ROW) {
            let cells = row_cells(row);
            // Two key/value pairs per row: cells 0/1 and 2/3.
            if let [k1, v1, k2, v2] = cells.as_slice() {
                out.info.insert(k1.clone(), v1.clone());
                out.info.insert(k2.clone(), v2.clone());
            }
        }
    }

    if let Some(table) = doc.select(&SUBJECT_TABLE).next() {
        out.subject_table = true;
        for row in table.select(&ROW).skip(1) {
            if let [code, name, grade] = row_cells(row).as_slice() {
                out.subjects.push(SubjectGrade {
                    code: code.clone(),
                    name: name.clone(),
                    grade: grade.clone(),
                });
            }
        }
    }

    out
}

fn row_cells(row: ElementRef) -> Vec<String> {
    row.select(&CELL).map(cell_text).collect()
}

fn cell_text(cell: ElementRef) -> String {
    cell.text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<String>()
}

//! Relation → spreadsheet export.
//!
//! Relation names come from the operator's configuration and are interpolated
//! into `SELECT * FROM <name>` verbatim. They are trusted: no quoting or
//! escaping happens here, so a configured name may also be a schema-qualified
//! name or a parenthesised subquery with an alias.

use crate::db::{DbError, RelationSource};
use crate::model::{Attachment, ExportRequest, TabularDocument, NULL_SENTINEL, XLSX_MIME_TYPE};
use rust_xlsxwriter::{DocProperties, ExcelDateTime, Workbook, XlsxError};
use thiserror::Error;
use tracing::{error, info, instrument};

pub const SHEET_NAME: &str = "Sheet1";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to read relation {relation}: {source}")]
    Source {
        relation: String,
        #[source]
        source: DbError,
    },
    #[error("relation {relation}: row {row} has {found} cells, expected {expected}")]
    ColumnMismatch {
        relation: String,
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("too many columns for one worksheet: {0}")]
    TooManyColumns(usize),
    #[error("too many rows for one worksheet: {0}")]
    TooManyRows(usize),
    #[error("spreadsheet write failed: {0}")]
    Xlsx(#[from] XlsxError),
}

impl ExportRequest {
    pub fn new(relation: impl Into<String>) -> Self {
        Self {
            relation: relation.into(),
        }
    }

    /// Unfiltered select over the relation. The name is not escaped.
    pub fn select_all_sql(&self) -> String {
        format!("SELECT * FROM {}", self.relation)
    }
}

/// Read `request.relation` in full into a document. Any read error or a row
/// whose width differs from the header discards everything read so far.
#[instrument(skip_all, fields(relation = %request.relation))]
pub async fn export(
    source: &dyn RelationSource,
    request: &ExportRequest,
) -> Result<TabularDocument, ExportError> {
    info!("starting export");
    let result = source
        .query_rows(&request.select_all_sql())
        .await
        .map_err(|source| ExportError::Source {
            relation: request.relation.clone(),
            source,
        })
        .and_then(|rows| {
            let width = rows.columns.len();
            let mut doc = TabularDocument {
                rows: Vec::with_capacity(rows.rows.len() + 1),
            };
            doc.rows.push(rows.columns);
            for (idx, cells) in rows.rows.into_iter().enumerate() {
                if cells.len() != width {
                    return Err(ExportError::ColumnMismatch {
                        relation: request.relation.clone(),
                        // spreadsheet row number; the header is row 1
                        row: idx + 2,
                        expected: width,
                        found: cells.len(),
                    });
                }
                doc.rows.push(
                    cells
                        .into_iter()
                        .map(|c| c.unwrap_or_else(|| NULL_SENTINEL.to_string()))
                        .collect(),
                );
            }
            Ok(doc)
        });

    match &result {
        Ok(doc) => info!(rows = doc.data_rows().len(), "export finished"),
        Err(err) => error!(%err, "export failed"),
    }
    result
}

/// Export a relation and wrap the workbook bytes as an attachment.
pub async fn export_attachment(
    source: &dyn RelationSource,
    relation: &str,
    file_name: &str,
) -> Result<Attachment, ExportError> {
    let doc = export(source, &ExportRequest::new(relation)).await?;
    let payload = doc.to_xlsx()?;
    Ok(Attachment {
        file_name: file_name.to_string(),
        mime_type: XLSX_MIME_TYPE.to_string(),
        payload,
    })
}

impl TabularDocument {
    /// Serialize as a single-sheet xlsx workbook with every cell written as a
    /// string. The creation timestamp is pinned so identical documents
    /// produce identical bytes.
    pub fn to_xlsx(&self) -> Result<Vec<u8>, ExportError> {
        let mut workbook = Workbook::new();
        let created = ExcelDateTime::from_ymd(2000, 1, 1)?;
        workbook.set_properties(&DocProperties::new().set_creation_datetime(&created));

        let worksheet = workbook.add_worksheet();
        worksheet.set_name(SHEET_NAME)?;
        for (r, row) in self.rows.iter().enumerate() {
            let r = u32::try_from(r).map_err(|_| ExportError::TooManyRows(self.rows.len()))?;
            for (c, cell) in row.iter().enumerate() {
                let c = u16::try_from(c).map_err(|_| ExportError::TooManyColumns(row.len()))?;
                worksheet.write_string(r, c, cell)?;
            }
        }

        Ok(workbook.save_to_buffer()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::RelationRows;
    use async_trait::async_trait;

    struct FixedSource(Result<RelationRows, String>);

    #[async_trait]
    impl RelationSource for FixedSource {
        async fn query_rows(&self, _sql: &str) -> Result<RelationRows, DbError> {
            self.0.clone().map_err(DbError::Source)
        }
    }

    fn rows(columns: &[&str], data: Vec<Vec<Option<&str>>>) -> RelationRows {
        RelationRows {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: data
                .into_iter()
                .map(|r| r.into_iter().map(|c| c.map(str::to_string)).collect())
                .collect(),
        }
    }

    #[test]
    fn select_all_is_not_escaped() {
        assert_eq!(ExportRequest::new("SYSDBA.TEST_01").select_all_sql(), "SELECT * FROM SYSDBA.TEST_01");
    }

    #[tokio::test]
    async fn header_then_rows_with_null_sentinel() {
        let src = FixedSource(Ok(rows(
            &["ID", "NAME"],
            vec![vec![Some("1"), None], vec![Some("2"), Some("b")]],
        )));
        let doc = export(&src, &ExportRequest::new("T")).await.unwrap();
        assert_eq!(doc.header(), ["ID", "NAME"]);
        assert_eq!(doc.data_rows().len(), 2);
        assert_eq!(doc.rows()[1], vec!["1", "NULL"]);
        assert_eq!(doc.rows()[2], vec!["2", "b"]);
    }

    #[tokio::test]
    async fn zero_rows_is_header_only() {
        let src = FixedSource(Ok(rows(&["A", "B", "C"], vec![])));
        let doc = export(&src, &ExportRequest::new("T")).await.unwrap();
        assert_eq!(doc.rows().len(), 1);
        assert!(doc.data_rows().is_empty());
        assert!(!doc.to_xlsx().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ragged_row_is_fatal() {
        let src = FixedSource(Ok(rows(
            &["A", "B"],
            vec![vec![Some("1"), Some("2")], vec![Some("3")]],
        )));
        let err = export(&src, &ExportRequest::new("T")).await.unwrap_err();
        match err {
            ExportError::ColumnMismatch { row, expected, found, .. } => {
                assert_eq!((row, expected, found), (3, 2, 1));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn source_error_propagates() {
        let src = FixedSource(Err("scan failed".into()));
        let err = export(&src, &ExportRequest::new("T")).await.unwrap_err();
        assert!(matches!(err, ExportError::Source { ref relation, .. } if relation == "T"));
        assert!(err.to_string().contains("scan failed"));
    }

    #[tokio::test]
    async fn xlsx_output_is_deterministic() {
        let src = FixedSource(Ok(rows(&["K", "V"], vec![vec![Some("k1"), Some("v1")]])));
        let first = export_attachment(&src, "T", "t.xlsx").await.unwrap();
        let second = export_attachment(&src, "T", "t.xlsx").await.unwrap();
        assert_eq!(first.payload, second.payload);
        assert_eq!(&first.payload[..2], b"PK");
        assert_eq!(first.mime_type, XLSX_MIME_TYPE);
        assert_eq!(first.file_name, "t.xlsx");
    }
}

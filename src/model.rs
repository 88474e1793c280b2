/// MIME type of every spreadsheet attachment produced by the exporter.
pub const XLSX_MIME_TYPE: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Literal written in place of SQL NULL.
pub const NULL_SENTINEL: &str = "NULL";

/// A relation to read in full.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRequest {
    pub relation: String,
}

/// Rows of text cells; row 0 is the header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TabularDocument {
    pub(crate) rows: Vec<Vec<String>>,
}

impl TabularDocument {
    pub fn header(&self) -> &[String] {
        self.rows.first().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Data rows, header excluded.
    pub fn data_rows(&self) -> &[Vec<String>] {
        self.rows.get(1..).unwrap_or(&[])
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }
}

/// A named binary payload attached to one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub mime_type: String,
    pub payload: Vec<u8>,
}

/// One relation to export and the file name it is attached under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRequest {
    pub relation: String,
    pub file_name: String,
}

/// One configured post: a single message sent to each recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliverySpec {
    pub from: String,
    pub subject: String,
    pub body_text: String,
    pub attachments: Vec<AttachmentRequest>,
    pub recipients: Vec<String>,
}

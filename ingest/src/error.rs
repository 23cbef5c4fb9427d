use thiserror::Error;

///
/// Errors raised while discovering, reading or analysing a CSV file. `Structural` variants are
/// fatal for the file they describe (they map to JobErrorType::StructuralFailure upstream);
/// `Line` is a per-row defect that the caller reports and continues past.
///
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Root folder {path} does not exist or is not a directory")]
    RootFolderMissing { path: String },

    #[error("Unable to read directory {path}")]
    CannotReadDir { path: String, source: std::io::Error },

    #[error("Unable to open file {path}")]
    CannotOpenFile { path: String, source: std::io::Error },

    #[error("File {path} has no header row")]
    MissingHeader { path: String },

    #[error("File {path} header has zero columns")]
    EmptyHeaderColumns { path: String },

    #[error("Unable to detect a consistent delimiter for {path}")]
    UndetectableDelimiter { path: String },

    #[error("Unable to decode {path} as UTF-8 or Windows-1252")]
    UndecodableEncoding { path: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl IngestError {
    ///
    /// True for the conditions spec'd as StructuralFailure (§7.1): file missing/unreadable,
    /// undetectable delimiter, empty/missing header.
    ///
    pub fn is_structural(&self) -> bool {
        matches!(self,
            IngestError::CannotOpenFile { .. }
            | IngestError::MissingHeader { .. }
            | IngestError::EmptyHeaderColumns { .. }
            | IngestError::UndetectableDelimiter { .. }
            | IngestError::UndecodableEncoding { .. })
    }
}

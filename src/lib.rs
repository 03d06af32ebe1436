// Refugio Registry - Core Library
// CSV bulk-import pipeline for the disaster-shelter registry

pub mod db;
pub mod schema;      // Structure gate - header canon + column map
pub mod validator;   // Row validation - typed records out of raw rows
pub mod resolver;    // Identity resolution - find-or-create personas
pub mod ledger;      // Upload ledger - BulkUploads lifecycle
pub mod summary;     // Result shaping - stats + capped error details
pub mod ingestion;   // The pipeline - transaction around the row loop

// Re-export commonly used types
pub use db::{
    open_database, setup_database,
    AuditSink, SqliteAuditSink, AuditRecord, get_audit_for_object,
    Refugio, RefugioStat, insert_refugio, get_refugios, get_refugio_stats,
    count_personas, count_ingresos,
};
pub use schema::{
    StructureValidator, StructureError, ColumnMap,
    CANONICAL_COLUMNS, REQUIRED_COLUMNS,
};
pub use validator::{
    RowValidator, RowError, CsvRow, ValidatedPersonRecord,
    IdentityFields, GroupFields, HealthFields, OriginFields, EntryFields,
    AgeRange, Gender, Situation, EntryStatus,
};
pub use resolver::{
    PersonResolver, PersonRegistry, SqlitePersonRegistry,
    Resolution, RegistryError, identity_fingerprint,
};
pub use ledger::{
    UploadLedger, UploadState, UploadBatch,
    get_upload, get_upload_history,
};
pub use summary::{UploadStats, UploadSummary, DISPLAYED_ERROR_DETAILS};
pub use ingestion::{
    IngestionPipeline, BatchReport, UploadError,
    MAX_UPLOAD_BYTES, is_csv_upload,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
